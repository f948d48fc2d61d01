//! 已读位置 HTTP API 客户端

use crate::im::auth::SharedToken;
use crate::im::error::ReadStateError;
use crate::im::readstate::models::{PatchOp, ReadStateResp, ServerReadState};
use crate::im::serialization::generate_operation_id;
use crate::im::types::{handle_http_response, read_response_body, HttpError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReadStateApi {
    client: reqwest::Client,
    api_base_url: String,
    api_token: SharedToken,
    expand_unread_count: bool,
    timeout: Duration,
}

impl ReadStateApi {
    pub fn new(
        client: reqwest::Client,
        api_base_url: String,
        api_token: SharedToken,
        expand_unread_count: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_token,
            expand_unread_count,
            timeout,
        }
    }

    fn token(&self) -> Result<String, ReadStateError> {
        self.api_token.get().ok_or_else(|| {
            debug!("[ReadState] 尚未获取 API token");
            ReadStateError::Unauthorized
        })
    }

    /// 获取服务器端完整已读状态
    pub async fn fetch(&self) -> Result<ServerReadState, ReadStateError> {
        let token = self.token()?;
        let mut url = format!("{}/readstate", self.api_base_url);
        if self.expand_unread_count {
            url.push_str("?expand=items.unreadCount");
        }
        let operation_id = generate_operation_id();
        debug!("[ReadState] 📡 GET {}, 操作ID: {}", url, operation_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("operationID", &operation_id)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_request_error)?;
        let resp: ReadStateResp = handle_http_response(response, "获取已读状态")
            .await
            .map_err(map_http_error)?;
        let items = resp.items.unwrap_or_default();
        info!("[ReadState] ✅ 获取已读状态成功: {} 个会话", items.len());
        Ok(items)
    }

    /// 提交 PATCH
    pub async fn patch(&self, ops: &[PatchOp]) -> Result<(), ReadStateError> {
        let token = self.token()?;
        let url = format!("{}/readstate", self.api_base_url);
        let operation_id = generate_operation_id();
        debug!(
            "[ReadState] 📡 PATCH {} ({} 项), 操作ID: {}",
            url,
            ops.len(),
            operation_id
        );

        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header("operationID", &operation_id)
            .json(ops)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_request_error)?;
        read_response_body(response, "提交已读状态")
            .await
            .map_err(map_http_error)?;
        info!("[ReadState] ✅ 已读状态提交成功");
        Ok(())
    }
}

/// 超时按空响应处理，走普通退避
fn map_request_error(e: reqwest::Error) -> ReadStateError {
    if e.is_timeout() {
        ReadStateError::Unavailable { retry_after: None }
    } else {
        debug!("[ReadState] 网络请求失败: {}", e);
        ReadStateError::Offline
    }
}

fn map_http_error(e: HttpError) -> ReadStateError {
    match e {
        HttpError::Status(failure) => match failure.status {
            401 | 403 => ReadStateError::Unauthorized,
            400 | 422 => ReadStateError::BadRequest {
                message: failure.body,
            },
            429 => ReadStateError::RateLimited {
                reset_at: failure.rate_limit_reset,
                retry_after: failure.retry_after,
            },
            _ => ReadStateError::Unavailable {
                retry_after: failure.retry_after,
            },
        },
        HttpError::Request(e) => map_request_error(e),
        // 请求已被接受，只是响应无法解析（代理页面、字段变更），按暂时不可用重试
        HttpError::Decode(e) => {
            warn!("[ReadState] 响应无法解析，稍后重试: {}", e);
            ReadStateError::Unavailable { retry_after: None }
        }
    }
}
