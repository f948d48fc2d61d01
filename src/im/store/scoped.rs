//! 按用户隔离的存储
//!
//! 存储中记录 `user:group` 身份；打开时身份不一致（换了账号或组织）就整体清空，
//! 避免把上一个用户的缓存当作自己的。

use crate::im::error::StoreError;
use crate::im::store::KvStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

const IDENTITY_KEY: &str = "__identity__";

pub struct ScopedStore {
    inner: Arc<dyn KvStore>,
    identity: String,
}

impl ScopedStore {
    pub async fn open(
        inner: Arc<dyn KvStore>,
        user_id: &str,
        group_id: &str,
    ) -> Result<Self, StoreError> {
        let identity = format!("{}:{}", user_id, group_id);
        match inner.get(IDENTITY_KEY).await? {
            Some(stored) if stored == identity => {
                info!("[Store] 复用本地数据, 身份: {}", identity);
            }
            Some(stored) => {
                warn!(
                    "[Store] 身份变更 {} -> {}，清空本地数据",
                    stored, identity
                );
                inner.clear().await?;
                inner.set(IDENTITY_KEY, &identity).await?;
            }
            None => {
                inner.clear().await?;
                inner.set(IDENTITY_KEY, &identity).await?;
            }
        }
        Ok(Self { inner, identity })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl KvStore for ScopedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn unset(&self, key: &str) -> Result<(), StoreError> {
        self.inner.unset(key).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await?;
        self.inner.set(IDENTITY_KEY, &self.identity).await
    }
}
