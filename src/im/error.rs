//! 错误类型定义
//!
//! 会话、缓存同步、已读位置、本地存储四类错误。网络与持久化层的底层错误
//! 在边界处统一转换为这里的类型，可重试的错误由所属组件内部消化。

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 传输层断开或握手失败时携带的条件
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Conflict,
    NotAuthorized,
    NotAllowed,
    PolicyViolation,
    Timeout,
    Other(String),
}

impl Condition {
    /// 从协议中的条件字符串解析
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "conflict" => Condition::Conflict,
            "not-authorized" => Condition::NotAuthorized,
            "not-allowed" => Condition::NotAllowed,
            "policy-violation" => Condition::PolicyViolation,
            "timeout" | "connection-timeout" => Condition::Timeout,
            other => Condition::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Condition::Conflict => "conflict",
            Condition::NotAuthorized => "not-authorized",
            Condition::NotAllowed => "not-allowed",
            Condition::PolicyViolation => "policy-violation",
            Condition::Timeout => "timeout",
            Condition::Other(raw) => raw,
        }
    }

    /// 凭证本身已不可用的条件，自动重连没有意义
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Condition::Conflict | Condition::NotAuthorized | Condition::NotAllowed
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话 / 传输层错误
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("连接失败: {condition}")]
    ConnFail { condition: Condition },

    #[error("认证失败: {condition}")]
    AuthFail { condition: Condition },

    #[error("违反服务器策略: {condition}")]
    PolicyViolation { condition: Condition },

    #[error("请求超时")]
    Timeout,

    #[error("会话未连接")]
    NotConnected,

    #[error("重连失败，已连续尝试 {attempts} 次")]
    ReconnectExhausted { attempts: u32 },

    #[error("自动重连已被禁止")]
    ReconnectSuppressed,

    #[error("重连已被取消")]
    ReconnectCancelled,

    #[error("授权已被签发方撤销，需要重新登录")]
    SignOutRequired,

    #[error("会话引导失败: {0}")]
    Bootstrap(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
}

impl SessionError {
    /// 错误携带的条件（若有）
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            SessionError::ConnFail { condition }
            | SessionError::AuthFail { condition }
            | SessionError::PolicyViolation { condition } => Some(condition),
            _ => None,
        }
    }

    /// 是否终止自动重连
    ///
    /// 认证 / 策略类失败在 `conflict`、`not-authorized`、`not-allowed` 条件下是终态；
    /// 普通连接失败只有 `conflict`（同一账号在别处登录）是终态。
    pub fn is_terminal(&self) -> bool {
        match self {
            SessionError::AuthFail { condition } | SessionError::PolicyViolation { condition } => {
                condition.is_fatal()
            }
            SessionError::ConnFail { condition } => *condition == Condition::Conflict,
            SessionError::SignOutRequired => true,
            _ => false,
        }
    }

    /// 用于状态通知的条件，没有显式条件的错误归入 `Other`
    pub fn status_condition(&self) -> Condition {
        match self {
            SessionError::Timeout => Condition::Timeout,
            SessionError::SignOutRequired => Condition::NotAuthorized,
            SessionError::ReconnectExhausted { .. } => {
                Condition::Other("reconnect-exhausted".to_string())
            }
            other => other
                .condition()
                .cloned()
                .unwrap_or_else(|| Condition::Other("remote-connection-failed".to_string())),
        }
    }
}

/// 缓存同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("应用差异后本地哈希与服务器不一致")]
    OutOfSync,

    #[error("同步请求被限流")]
    RateLimited { retry_after: Option<Duration> },

    #[error("客户端错误，HTTP {status}")]
    ClientError { status: u16 },

    #[error("服务器错误，HTTP {status}")]
    Server { status: u16 },

    #[error("请求超时")]
    Timeout,

    #[error("传输层错误: {0}")]
    Transport(#[from] SessionError),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("数据解析失败: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("压缩请求体失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("本地缓存错误: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// 重试无法解决、需要立即改走全量下载的错误
    pub fn requires_full_download(&self) -> bool {
        matches!(self, SyncError::ClientError { status: 403 | 404 })
    }
}

/// 已读位置同步错误，每一种对应不同的恢复动作
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadStateError {
    #[error("网络不可用")]
    Offline,

    #[error("未授权")]
    Unauthorized,

    #[error("已读同步已禁用")]
    Disabled,

    #[error("请求被限流")]
    RateLimited {
        /// `X-RateLimit-Reset`，Unix 秒
        reset_at: Option<i64>,
        retry_after: Option<Duration>,
    },

    #[error("请求被服务器拒绝: {message}")]
    BadRequest { message: String },

    #[error("服务暂不可用")]
    Unavailable { retry_after: Option<Duration> },
}

/// 本地存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储空间不足，键 {key} 写入失败")]
    QuotaExceeded { key: String },

    #[error("存储不可访问: {0}")]
    Inaccessible(String),

    #[error("序列化失败: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
