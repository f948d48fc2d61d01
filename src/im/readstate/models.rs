//! 已读位置数据模型与合并规则

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 单个会话上待同步的已读操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ReadOp {
    Add {
        #[serde(rename = "mid")]
        message_id: String,
        timestamp: i64,
    },
    Remove,
}

impl ReadOp {
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            ReadOp::Add { timestamp, .. } => Some(*timestamp),
            ReadOp::Remove => None,
        }
    }
}

/// 会话 id -> 操作
pub type ReadOps = BTreeMap<String, ReadOp>;

/// 服务器确认过的已读位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerReadPosition {
    pub mid: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u64>,
}

/// 会话 id -> 服务器已读位置
pub type ServerReadState = BTreeMap<String, ServerReadPosition>;

#[derive(Debug, Default, Deserialize)]
pub struct ReadStateResp {
    #[serde(default)]
    pub items: Option<ServerReadState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchValue {
    pub mid: String,
    pub timestamp: i64,
}

/// PATCH 请求体中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOp {
    pub op: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<PatchValue>,
}

/// JSON Pointer 转义：`~` -> `~0`，`/` -> `~1`
fn pointer_escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// 生成最小 PATCH 请求体
///
/// `add` 只在比服务器记录更新时发送，`remove` 总是发送。
/// 返回请求体和实际发出的操作（即新的 inflight）；过期的 `add` 被丢弃。
pub fn build_patch(client: &ReadOps, server: &ServerReadState) -> (Vec<PatchOp>, ReadOps) {
    let mut body = Vec::new();
    let mut sent = ReadOps::new();

    for (conversation, op) in client {
        let path = format!("/items/{}", pointer_escape(conversation));
        match op {
            ReadOp::Add {
                message_id,
                timestamp,
            } => {
                let newer = server
                    .get(conversation)
                    .map(|position| *timestamp > position.timestamp)
                    .unwrap_or(true);
                if !newer {
                    continue;
                }
                body.push(PatchOp {
                    op: "add",
                    path,
                    value: Some(PatchValue {
                        mid: message_id.clone(),
                        timestamp: *timestamp,
                    }),
                });
            }
            ReadOp::Remove => body.push(PatchOp {
                op: "remove",
                path,
                value: None,
            }),
        }
        sent.insert(conversation.clone(), op.clone());
    }

    (body, sent)
}

/// PATCH 失败：inflight 合并回 client
///
/// 只有 inflight 与 client 都是 `add` 且 inflight 更新时 inflight 胜出；
/// client 中没有的会话直接放回。
pub fn merge_inflight_into_client(client: &mut ReadOps, inflight: ReadOps) {
    for (conversation, op) in inflight {
        match client.get(&conversation) {
            None => {
                client.insert(conversation, op);
            }
            Some(existing) => {
                let inflight_newer = matches!(
                    (op.timestamp(), existing.timestamp()),
                    (Some(theirs), Some(ours)) if theirs > ours
                );
                if inflight_newer {
                    client.insert(conversation, op);
                }
            }
        }
    }
}

/// PATCH 成功：inflight 合并进 server，`remove` 删除对应键
pub fn merge_inflight_into_server(server: &mut ServerReadState, inflight: &ReadOps) {
    for (conversation, op) in inflight {
        match op {
            ReadOp::Add {
                message_id,
                timestamp,
            } => {
                server.insert(
                    conversation.clone(),
                    ServerReadPosition {
                        mid: message_id.clone(),
                        timestamp: *timestamp,
                        unread_count: None,
                    },
                );
            }
            ReadOp::Remove => {
                server.remove(conversation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(mid: &str, timestamp: i64) -> ReadOp {
        ReadOp::Add {
            message_id: mid.to_string(),
            timestamp,
        }
    }

    fn position(mid: &str, timestamp: i64) -> ServerReadPosition {
        ServerReadPosition {
            mid: mid.to_string(),
            timestamp,
            unread_count: Some(3),
        }
    }

    #[test]
    fn newer_inflight_add_wins_over_client() {
        let mut client = ReadOps::from([("A".to_string(), add("m1", 1))]);
        let inflight = ReadOps::from([("A".to_string(), add("m2", 2))]);

        merge_inflight_into_client(&mut client, inflight);

        assert_eq!(client["A"], add("m2", 2));
    }

    #[test]
    fn client_wins_when_newer_or_not_an_add() {
        let mut client = ReadOps::from([
            ("A".to_string(), add("m3", 3)),
            ("B".to_string(), ReadOp::Remove),
        ]);
        let inflight = ReadOps::from([
            ("A".to_string(), add("m2", 2)),
            ("B".to_string(), add("m9", 9)),
            ("C".to_string(), ReadOp::Remove),
        ]);

        merge_inflight_into_client(&mut client, inflight);

        assert_eq!(client["A"], add("m3", 3));
        assert_eq!(client["B"], ReadOp::Remove);
        assert_eq!(client["C"], ReadOp::Remove);
    }

    #[test]
    fn patch_skips_stale_adds_and_always_sends_removes() {
        let client = ReadOps::from([
            ("fresh".to_string(), add("m5", 5)),
            ("stale".to_string(), add("m1", 1)),
            ("gone".to_string(), ReadOp::Remove),
            ("a/b~c".to_string(), add("m7", 7)),
        ]);
        let server = ServerReadState::from([
            ("fresh".to_string(), position("m4", 4)),
            ("stale".to_string(), position("m2", 2)),
        ]);

        let (body, sent) = build_patch(&client, &server);

        assert_eq!(sent.len(), 3);
        assert!(!sent.contains_key("stale"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "op": "add", "path": "/items/a~1b~0c", "value": { "mid": "m7", "timestamp": 7 } },
                { "op": "add", "path": "/items/fresh", "value": { "mid": "m5", "timestamp": 5 } },
                { "op": "remove", "path": "/items/gone" }
            ])
        );
    }

    #[test]
    fn successful_patch_updates_server_copy() {
        let mut server = ServerReadState::from([
            ("A".to_string(), position("m1", 1)),
            ("B".to_string(), position("m1", 1)),
        ]);
        let inflight = ReadOps::from([
            ("A".to_string(), add("m2", 2)),
            ("B".to_string(), ReadOp::Remove),
        ]);

        merge_inflight_into_server(&mut server, &inflight);

        assert_eq!(server["A"].mid, "m2");
        assert!(!server.contains_key("B"));
    }

    #[test]
    fn read_op_wire_format() {
        let op: ReadOp = serde_json::from_str(r#"{"op":"add","mid":"m1","timestamp":10}"#).unwrap();
        assert_eq!(op, add("m1", 10));
        assert_eq!(
            serde_json::to_string(&ReadOp::Remove).unwrap(),
            r#"{"op":"remove"}"#
        );
    }
}
