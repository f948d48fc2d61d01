//! 会话状态

use crate::im::error::Condition;
use crate::im::transport::ConnectionPhase;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// 上报给监听器的连接状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// 不可恢复的失败，自动重连已停止
    Failed(Condition),
}

/// 连接状态机持有的会话状态，只由状态机修改
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub connected: bool,
    /// 尚未成功连接过
    pub is_initial_connect: bool,
    /// `disconnect(false)` 后为 `false`，直到下一次显式 `connect()`
    pub should_reconnect: bool,
    /// 重连循环是否在进行
    pub reconnecting: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub oauth_refresh_in_flight: bool,
    pub disconnected_at: Option<DateTime<Utc>>,
    /// 最近一次连接 / 重连成功的时刻
    pub connected_at: Option<Instant>,
    pub generation: u64,
    pub last_notified: Option<ConnectionStatus>,
}

impl SessionState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            connected: false,
            is_initial_connect: true,
            should_reconnect: true,
            reconnecting: false,
            reconnect_attempts: 0,
            reconnect_delay: base_delay,
            oauth_refresh_in_flight: false,
            disconnected_at: None,
            connected_at: None,
            generation: 0,
            last_notified: None,
        }
    }
}
