//! 已读位置本地持久化：只保存尚未发出的 client 副本

use crate::im::error::StoreError;
use crate::im::readstate::models::ReadOps;
use crate::im::serialization::CacheCodec;
use crate::im::store::KvStore;
use std::sync::Arc;
use tracing::warn;

const CLIENT_KEY: &str = "readstate:client";

pub struct ReadStateDao {
    store: Arc<dyn KvStore>,
}

impl ReadStateDao {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn load_client(&self) -> Result<ReadOps, StoreError> {
        let Some(blob) = self.store.get(CLIENT_KEY).await? else {
            return Ok(ReadOps::new());
        };
        match CacheCodec::Json.rehydrate(&blob) {
            Ok(ops) => Ok(ops),
            Err(e) => {
                warn!("[ReadState] 本地已读记录已损坏，丢弃: {}", e);
                self.store.unset(CLIENT_KEY).await?;
                Ok(ReadOps::new())
            }
        }
    }

    /// 保存 client 副本；为空时删除键
    pub async fn save_client(&self, ops: &ReadOps) -> Result<(), StoreError> {
        if ops.is_empty() {
            return self.store.unset(CLIENT_KEY).await;
        }
        let blob = CacheCodec::Json.dehydrate(ops)?;
        self.store.set(CLIENT_KEY, &blob).await
    }
}
