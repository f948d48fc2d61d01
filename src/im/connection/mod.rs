//! 连接状态机
//!
//! 负责建立、维持和恢复与服务器的长连接：重连退避、空闲看门狗、保活 ping、
//! API token 与 OAuth token 的定时刷新。

pub mod listener;
pub mod manager;
pub mod state;

pub use listener::{EmptySessionListener, SessionListener};
pub use manager::ConnectionManager;
pub use state::{ConnectionStatus, SessionState};
