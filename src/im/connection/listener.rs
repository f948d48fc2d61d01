//! 会话监听器回调接口

use crate::im::connection::state::ConnectionStatus;
use async_trait::async_trait;

#[async_trait]
pub trait SessionListener: Send + Sync {
    /// 连接状态变化（连续相同的状态只通知一次）
    async fn on_status_changed(&self, status: ConnectionStatus);

    /// 连接成功，`reconnected` 表示是否为重连
    async fn on_connected(&self, reconnected: bool);

    /// 连接失败；`fatal` 为 true 时自动重连已停止
    async fn on_connection_failed(&self, reason: String, fatal: bool);

    /// OAuth 授权已失效，需要用户重新登录
    async fn on_sign_out_required(&self);

    /// 短期 API token 已刷新
    async fn on_api_token_refreshed(&self, token: String);
}

/// 默认空实现（无操作）
pub struct EmptySessionListener;

#[async_trait]
impl SessionListener for EmptySessionListener {
    async fn on_status_changed(&self, _status: ConnectionStatus) {
        // 默认不做任何处理
    }

    async fn on_connected(&self, _reconnected: bool) {
        // 默认不做任何处理
    }

    async fn on_connection_failed(&self, _reason: String, _fatal: bool) {
        // 默认不做任何处理
    }

    async fn on_sign_out_required(&self) {
        // 默认不做任何处理
    }

    async fn on_api_token_refreshed(&self, _token: String) {
        // 默认不做任何处理
    }
}
