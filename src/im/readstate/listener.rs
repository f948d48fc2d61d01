//! 已读位置监听器回调接口

use async_trait::async_trait;

#[async_trait]
pub trait ReadStateListener: Send + Sync {
    /// 服务器确认的已读状态发生变化，参数为 JSON 对象字符串
    async fn on_read_state_updated(&self, positions_json: String);

    /// 服务器永久拒绝请求，本次会话内已读同步停用
    async fn on_read_state_disabled(&self, reason: String);
}

/// 默认空实现（无操作）
pub struct EmptyReadStateListener;

#[async_trait]
impl ReadStateListener for EmptyReadStateListener {
    async fn on_read_state_updated(&self, _positions_json: String) {
        // 默认不做任何处理
    }

    async fn on_read_state_disabled(&self, _reason: String) {
        // 默认不做任何处理
    }
}
