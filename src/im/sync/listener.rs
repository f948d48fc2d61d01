//! 缓存同步监听器回调接口

use crate::im::sync::models::SyncPath;
use crate::im::types::SyncResource;
use async_trait::async_trait;

#[async_trait]
pub trait SyncListener: Send + Sync {
    /// 同步开始
    async fn on_sync_started(&self, resource: SyncResource);

    /// 同步完成，`record_count` 为本地缓存中的记录数
    async fn on_sync_finished(&self, resource: SyncResource, path: SyncPath, record_count: usize);

    /// 同步失败
    async fn on_sync_failed(&self, resource: SyncResource, error: String);

    /// 记录发生变更，参数为 JSON 数组字符串（含墓碑）
    async fn on_records_changed(&self, resource: SyncResource, records_json: String);
}

/// 默认空实现（无操作）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_sync_started(&self, _resource: SyncResource) {
        // 默认不做任何处理
    }

    async fn on_sync_finished(&self, _resource: SyncResource, _path: SyncPath, _record_count: usize) {
        // 默认不做任何处理
    }

    async fn on_sync_failed(&self, _resource: SyncResource, _error: String) {
        // 默认不做任何处理
    }

    async fn on_records_changed(&self, _resource: SyncResource, _records_json: String) {
        // 默认不做任何处理
    }
}
