//! 传输层边界
//!
//! 连接状态机、缓存同步、入群逻辑只依赖 [`Transport`] trait；
//! [`bosh::BoshTransport`] 是基于 HTTP 长轮询的实现。

pub mod bosh;
pub mod hooks;
pub mod stanza;

pub use bosh::BoshTransport;
pub use hooks::{HookHandler, HookToken, TransportHooks};

use crate::im::auth::SessionCredentials;
use crate::im::error::{Condition, SessionError};
use crate::im::types::SyncResource;
use async_trait::async_trait;
use std::time::Duration;

/// 传输层所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Disconnecting,
}

/// 传输层事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// 阶段变化；进入 `Disconnected` 时可能携带断开条件
    Status {
        phase: ConnectionPhase,
        condition: Option<Condition>,
    },
    DataReceived {
        bytes: usize,
    },
    DataSent {
        bytes: usize,
    },
}

/// 握手成功后协商出的会话参数
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub sid: String,
    /// 绑定后的完整 JID
    pub jid: String,
    /// 服务器允许的最长静默时间
    pub inactivity: Duration,
    /// 传输层连接代数，每次建立 / 断开都会递增
    pub generation: u64,
}

/// 房间参与者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub jid: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立会话并完成认证，成功时已处于 `Connected`
    async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<NegotiatedSession, SessionError>;

    /// 关闭会话；未完成的请求不受影响，迟到的响应按代数丢弃
    async fn disconnect(&self);

    async fn ping(&self, timeout: Duration) -> Result<(), SessionError>;

    /// 查询服务器端集合的聚合哈希，服务器没有该集合时返回 `None`
    async fn query_hash(
        &self,
        resource: SyncResource,
        timeout: Duration,
    ) -> Result<Option<String>, SessionError>;

    /// 全量下载集合
    async fn fetch_collection(
        &self,
        resource: SyncResource,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, SessionError>;

    async fn join_room(&self, room_jid: &str, limit_presence: bool) -> Result<(), SessionError>;

    async fn fetch_participants(
        &self,
        room_jid: &str,
        timeout: Duration,
    ) -> Result<Vec<Participant>, SessionError>;

    fn hooks(&self) -> &TransportHooks;
}
