//! 缓存同步协议
//!
//! 联系人与房间两个集合的本地缓存通过「哈希快速路径 -> 差异同步 -> 全量下载」
//! 三级策略与服务器保持一致。

pub mod api;
pub mod dao;
pub mod hash;
pub mod listener;
pub mod models;
pub mod service;
pub mod types;

pub use hash::aggregate_hash;
pub use listener::{EmptySyncListener, SyncListener};
pub use models::{CacheSnapshot, Contact, Room, SyncOutcome, SyncPath, SyncRecord};
pub use service::CacheSyncer;
