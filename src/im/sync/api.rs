//! 差异同步 HTTP API 客户端

use crate::im::auth::SharedToken;
use crate::im::error::SyncError;
use crate::im::serialization::{compress_gzip, decompress_gzip, generate_operation_id};
use crate::im::sync::models::{CacheSnapshot, SyncRecord};
use crate::im::sync::types::{DiffSyncReq, DiffSyncResp};
use crate::im::types::{read_response_body, HttpError};
use std::time::Duration;
use tracing::{debug, info};

pub struct DiffSyncApi {
    client: reqwest::Client,
    api_base_url: String,
    api_token: SharedToken,
    gzip_threshold: usize,
    timeout: Duration,
}

impl DiffSyncApi {
    pub fn new(
        client: reqwest::Client,
        api_base_url: String,
        api_token: SharedToken,
        gzip_threshold: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_token,
            gzip_threshold,
            timeout,
        }
    }

    /// 发送本地已知版本，返回服务器端的变更记录（含墓碑）
    pub async fn diff<R: SyncRecord>(&self, known: &CacheSnapshot<R>) -> Result<Vec<R>, SyncError> {
        let operation_id = generate_operation_id();
        let url = format!("{}/sync/{}", self.api_base_url, R::RESOURCE);
        let req = DiffSyncReq {
            require_full_list: true,
            known_versions: known
                .values()
                .map(|r| (r.id(), r.version().to_string()))
                .collect(),
        };
        let payload = serde_json::to_vec(&req)?;

        info!(
            "[CacheSync] 📡 请求 {} 差异同步, 已知 {} 条",
            R::RESOURCE,
            known.len()
        );
        debug!("[CacheSync]   请求URL: {}, 操作ID: {}", url, operation_id);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .timeout(self.timeout);
        if let Some(token) = self.api_token.get() {
            request = request.bearer_auth(token);
        }
        let request = if payload.len() > self.gzip_threshold {
            let compressed = compress_gzip(&payload)?;
            debug!(
                "[CacheSync]   请求体 gzip 压缩: {} -> {} 字节",
                payload.len(),
                compressed.len()
            );
            request.header("Content-Encoding", "gzip").body(compressed)
        } else {
            request.body(payload)
        };

        let response = request.send().await.map_err(map_request_error)?;
        let gzipped = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);

        let body = read_response_body(response, "差异同步")
            .await
            .map_err(map_http_error)?;
        let body = if gzipped { decompress_gzip(&body)? } else { body };
        let resp: DiffSyncResp<R> = serde_json::from_slice(&body)?;

        info!(
            "[CacheSync] ✅ {} 差异同步返回 {} 条变更",
            R::RESOURCE,
            resp.changed_records.len()
        );
        Ok(resp.changed_records)
    }
}

fn map_request_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Http(e)
    }
}

fn map_http_error(e: HttpError) -> SyncError {
    match e {
        HttpError::Status(failure) => match failure.status {
            429 => SyncError::RateLimited {
                retry_after: failure.retry_after,
            },
            status @ 400..=499 => SyncError::ClientError { status },
            status => SyncError::Server { status },
        },
        HttpError::Request(e) => map_request_error(e),
        HttpError::Decode(e) => SyncError::Decode(e),
    }
}
