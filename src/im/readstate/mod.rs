//! 已读位置同步
//!
//! 每个会话的已读位置有三份副本：client（待发送，已持久化）、inflight（已发送未确认）、
//! server（服务器已确认）。记录按 client -> inflight -> server 流转，请求失败时退回 client。

pub mod api;
pub mod dao;
pub mod listener;
pub mod models;
pub mod service;

pub use listener::{EmptyReadStateListener, ReadStateListener};
pub use models::{ReadOp, ReadOps, ServerReadPosition, ServerReadState};
pub use service::{DisabledReason, PatchResult, ReadStateEngine, ReadStateStatus, RetryPlan};
