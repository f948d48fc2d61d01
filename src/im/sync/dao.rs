//! 缓存快照数据访问层
//!
//! 整个集合作为一个不透明字符串存放在键值存储中，只保存未删除的记录。

use crate::im::error::StoreError;
use crate::im::serialization::CacheCodec;
use crate::im::store::KvStore;
use crate::im::sync::models::{CacheSnapshot, SyncRecord};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CacheDao<R> {
    store: Arc<dyn KvStore>,
    codec: CacheCodec,
    _record: PhantomData<fn() -> R>,
}

impl<R: SyncRecord> CacheDao<R> {
    pub fn new(store: Arc<dyn KvStore>, codec: CacheCodec) -> Self {
        Self {
            store,
            codec,
            _record: PhantomData,
        }
    }

    /// 读取本地快照；不存在或已损坏时返回空快照
    pub async fn load(&self) -> Result<CacheSnapshot<R>, StoreError> {
        let key = R::RESOURCE.cache_key();
        let Some(blob) = self.store.get(&key).await? else {
            return Ok(CacheSnapshot::new());
        };
        match self.codec.rehydrate::<Vec<R>>(&blob) {
            Ok(records) => {
                let snapshot: CacheSnapshot<R> = records
                    .into_iter()
                    .filter(|r| !r.is_removed())
                    .map(|r| (r.id(), r))
                    .collect();
                debug!("[CacheSync] 读取本地 {} 缓存 {} 条", R::RESOURCE, snapshot.len());
                Ok(snapshot)
            }
            Err(e) => {
                warn!("[CacheSync] 本地 {} 缓存已损坏，丢弃: {}", R::RESOURCE, e);
                self.store.unset(&key).await?;
                Ok(CacheSnapshot::new())
            }
        }
    }

    /// 保存完整快照；已删除的记录被剔除
    pub async fn save(&self, snapshot: &CacheSnapshot<R>) -> Result<(), StoreError> {
        let records: Vec<&R> = snapshot.values().filter(|r| !r.is_removed()).collect();
        let blob = self.codec.dehydrate(&records)?;
        self.store.set(&R::RESOURCE.cache_key(), &blob).await?;
        debug!("[CacheSync] 保存 {} 缓存 {} 条", R::RESOURCE, records.len());
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.unset(&R::RESOURCE.cache_key()).await
    }
}
