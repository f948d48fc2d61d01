pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod readstate;
pub mod rooms;
pub mod serialization;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出常用类型
pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{Condition, ReadStateError, SessionError, StoreError, SyncError};
