//! 极简 XML 片段工具
//!
//! 只覆盖 BOSH 会话用到的那部分语法：开始标签属性、顶层子元素切分、
//! 元素文本与实体转义。不处理注释、CDATA、处理指令。

/// 转义文本与属性值
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// 元素的开始标签（含 `<` 与 `>`）
fn start_tag(element: &str) -> Option<&str> {
    let start = element.find('<')?;
    let end = element[start..].find('>')? + start;
    Some(&element[start..=end])
}

/// 元素名（保留前缀，例如 `stream:features`）
pub fn tag_name(element: &str) -> Option<&str> {
    let tag = start_tag(element)?;
    let inner = tag.trim_start_matches('<');
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(inner.len());
    Some(&inner[..end])
}

/// 读取开始标签上的属性
pub fn attr(element: &str, name: &str) -> Option<String> {
    let tag = start_tag(element)?;
    let mut rest = tag;
    while let Some(pos) = rest.find(name) {
        let before_ok = pos > 0
            && rest[..pos]
                .chars()
                .last()
                .map(|c| c.is_whitespace())
                .unwrap_or(false);
        let after = rest[pos + name.len()..].trim_start();
        if before_ok {
            if let Some(value) = after.strip_prefix('=') {
                let value = value.trim_start();
                let quote = value.chars().next()?;
                if quote == '\'' || quote == '"' {
                    let body = &value[1..];
                    let close = body.find(quote)?;
                    return Some(unescape(&body[..close]));
                }
            }
        }
        rest = &rest[pos + name.len()..];
    }
    None
}

/// 是否自闭合（`<x/>`）
fn is_self_closing(tag: &str) -> bool {
    tag.trim_end_matches('>').trim_end().ends_with('/')
}

/// 根元素的顶层子元素切片
pub fn children(element: &str) -> Vec<&str> {
    let Some(root_tag) = start_tag(element) else {
        return Vec::new();
    };
    if is_self_closing(root_tag) {
        return Vec::new();
    }
    let Some(root_start) = element.find('<') else {
        return Vec::new();
    };
    let content_start = root_start + root_tag.len();
    let content_end = element.rfind("</").unwrap_or(element.len());
    if content_end <= content_start {
        return Vec::new();
    }

    let content = &element[content_start..content_end];
    let mut result = Vec::new();
    let mut depth = 0usize;
    let mut child_start = None;
    let mut cursor = 0usize;

    while let Some(offset) = content[cursor..].find('<') {
        let open = cursor + offset;
        let Some(close_rel) = content[open..].find('>') else {
            break;
        };
        let close = open + close_rel;
        let tag = &content[open..=close];

        if tag.starts_with("</") {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                if let Some(start) = child_start.take() {
                    result.push(&content[start..=close]);
                }
            }
        } else if tag.starts_with("<?") || tag.starts_with("<!") {
            // 声明与注释不计入层级
        } else if is_self_closing(tag) {
            if depth == 0 {
                result.push(tag);
            }
        } else {
            if depth == 0 {
                child_start = Some(open);
            }
            depth += 1;
        }
        cursor = close + 1;
    }
    result
}

/// 深度优先查找第一个名为 `name` 的后代元素（含自身）
pub fn find<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    if tag_name(element) == Some(name) {
        return Some(element);
    }
    children(element)
        .into_iter()
        .find_map(|child| find(child, name))
}

/// 元素的文本内容（已反转义），自闭合元素返回空串
pub fn text(element: &str) -> Option<String> {
    let tag = start_tag(element)?;
    if is_self_closing(tag) {
        return Some(String::new());
    }
    let start = element.find(tag)? + tag.len();
    let end = element.rfind("</")?;
    if end < start {
        return None;
    }
    Some(unescape(element[start..end].trim()))
}

/// 错误元素中的第一个子元素名，例如 `<failure><not-authorized/></failure>` 中的 `not-authorized`
pub fn first_child_name(element: &str) -> Option<String> {
    children(element)
        .into_iter()
        .filter_map(tag_name)
        .find(|name| *name != "text")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "<body xmlns='http://jabber.org/protocol/httpbind' sid=\"s-1\" inactivity='30'>\
        <iq type='result' id='hash_2'><query xmlns='urn:xmpp:chat-sync:hash'><hash>ab&amp;cd</hash></query></iq>\
        <presence from='room@muc/alice'/>\
        </body>";

    #[test]
    fn reads_attributes_with_either_quote() {
        assert_eq!(attr(BODY, "sid").as_deref(), Some("s-1"));
        assert_eq!(attr(BODY, "inactivity").as_deref(), Some("30"));
        assert_eq!(attr(BODY, "missing"), None);
        // 不把 `xmlns` 当作 `ns`
        assert_eq!(attr(BODY, "ns"), None);
    }

    #[test]
    fn splits_top_level_children() {
        let kids = children(BODY);
        assert_eq!(kids.len(), 2);
        assert_eq!(tag_name(kids[0]), Some("iq"));
        assert_eq!(tag_name(kids[1]), Some("presence"));
        assert_eq!(attr(kids[1], "from").as_deref(), Some("room@muc/alice"));
    }

    #[test]
    fn finds_nested_text() {
        let hash = find(BODY, "hash").unwrap();
        assert_eq!(text(hash).as_deref(), Some("ab&cd"));
    }

    #[test]
    fn self_closing_root_has_no_children() {
        assert!(children("<body type='terminate' condition='conflict'/>").is_empty());
        assert_eq!(
            first_child_name("<failure xmlns='sasl'><not-authorized/></failure>").as_deref(),
            Some("not-authorized")
        );
    }

    #[test]
    fn escape_roundtrip() {
        let raw = r#"<a href="x">'&'</a>"#;
        assert_eq!(unescape(&escape(raw)), raw);
    }
}
