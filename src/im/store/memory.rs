//! 内存键值存储，用于测试和临时会话

use crate::im::error::StoreError;
use crate::im::store::KvStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    /// 所有键值字节总数上限
    quota_bytes: Option<u64>,
    inaccessible: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// 模拟被浏览器 / 系统禁用的存储
    pub fn inaccessible() -> Self {
        Self {
            inaccessible: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        if self.inaccessible {
            return Err(StoreError::Inaccessible("存储已禁用".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Inaccessible("存储锁已损坏".to_string()))
    }
}

fn used_bytes(entries: &HashMap<String, String>) -> u64 {
    entries
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum()
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        entries.remove(key);
        if let Some(quota) = self.quota_bytes {
            let needed = used_bytes(&entries) + (key.len() + value.len()) as u64;
            if needed > quota {
                warn!(
                    "[Store] 写入 {} 超出配额: 需要 {} 字节, 上限 {} 字节",
                    key, needed, quota
                );
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.lock()?.clear();
        Ok(())
    }
}
