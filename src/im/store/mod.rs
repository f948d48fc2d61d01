//! 本地键值存储
//!
//! 缓存快照与已读位置都以不透明字符串写入这里。写入失败（配额不足等）时
//! 对应的键被移除，读取方要么看到完整数据，要么什么都看不到。

pub mod memory;
pub mod scoped;
pub mod sqlite;

pub use memory::MemoryStore;
pub use scoped::ScopedStore;
pub use sqlite::{create_sqlite_pool_with_migration, SqliteStore};

use crate::im::error::StoreError;
use async_trait::async_trait;

/// 键值存储抽象
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 写入；失败时该键不再存在
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn unset(&self, key: &str) -> Result<(), StoreError>;

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// 清空全部数据
    async fn clear(&self) -> Result<(), StoreError>;
}
