use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// 限流重置时间响应头（Unix 秒）
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// 服务器建议的退避时间响应头（秒）
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// 需要与服务器保持一致的缓存集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncResource {
    Contacts,
    Rooms,
}

impl SyncResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResource::Contacts => "contacts",
            SyncResource::Rooms => "rooms",
        }
    }

    /// 本地缓存快照的存储键
    pub fn cache_key(&self) -> String {
        format!("cache:{}", self.as_str())
    }
}

impl fmt::Display for SyncResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非 2xx 响应保留下来的信息
#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub status: u16,
    /// `X-RateLimit-Reset`，Unix 秒
    pub rate_limit_reset: Option<i64>,
    /// `Retry-After`
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpFailure {
    fn from_parts(status: u16, headers: &HeaderMap, body: String) -> Self {
        let header_number = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };
        Self {
            status,
            rate_limit_reset: header_number(RATE_LIMIT_RESET_HEADER),
            retry_after: header_number(RETRY_AFTER_HEADER)
                .filter(|secs| *secs >= 0)
                .map(|secs| Duration::from_secs(secs as u64)),
            body,
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.body)
    }
}

/// HTTP 调用错误
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP 错误 {0}")]
    Status(HttpFailure),

    #[error("请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("反序列化响应失败: {0}")]
    Decode(#[from] serde_json::Error),
}

/// 读取响应 body，非 2xx 状态转换为 [`HttpError::Status`]
pub async fn read_response_body(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<Vec<u8>, HttpError> {
    let status = response.status();
    let headers = response.headers().clone();

    // body 只能读取一次
    let body_bytes = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(HttpError::Status(HttpFailure::from_parts(
            status.as_u16(),
            &headers,
            body_str.into_owned(),
        )));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    Ok(body_bytes.to_vec())
}

/// 通用 HTTP 响应处理：检查状态码后反序列化为 `T`
pub async fn handle_http_response<T: DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T, HttpError> {
    let body = read_response_body(response, operation_name).await?;
    serde_json::from_slice(&body).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name,
            e,
            String::from_utf8_lossy(&body)
        );
        HttpError::Decode(e)
    })
}

/// 数组字段兼容 null
pub(crate) fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}
