pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    backoff::decorrelated_jitter,
    client::ChatClient,
    config::ClientConfig,
    connection::{ConnectionStatus, SessionListener},
    readstate::ReadStateListener,
    sync::{aggregate_hash, Contact, Room, SyncListener},
};
