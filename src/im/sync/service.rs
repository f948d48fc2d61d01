//! 缓存同步服务
//!
//! 一次 `sync()` 的流程：
//! 1. 本地缓存为空：直接全量下载，不查询哈希、不做差异同步
//! 2. 近期（重）连接过：比较本地与服务器聚合哈希，一致则直接返回缓存
//! 3. 差异同步：上报已知版本，应用变更并持久化，再次校验哈希；
//!    不一致、无法校验或请求失败时抖动退避重试，累计 5 次后（或遇到 403/404）全量下载
//!
//! 最后一次失败是 429 时本次同步以 [`SyncError::RateLimited`] 结束，不再全量下载。

use crate::im::backoff::Backoff;
use crate::im::config::SyncSettings;
use crate::im::connection::ConnectionManager;
use crate::im::error::{SessionError, SyncError};
use crate::im::serialization::CacheCodec;
use crate::im::store::KvStore;
use crate::im::sync::api::DiffSyncApi;
use crate::im::sync::dao::CacheDao;
use crate::im::sync::hash::aggregate_hash;
use crate::im::sync::listener::{EmptySyncListener, SyncListener};
use crate::im::sync::models::{CacheSnapshot, SyncOutcome, SyncPath, SyncRecord};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct CacheSyncer<R: SyncRecord> {
    settings: SyncSettings,
    connection: Arc<ConnectionManager>,
    api: Arc<DiffSyncApi>,
    dao: CacheDao<R>,
    listener: RwLock<Arc<dyn SyncListener>>,
    /// 同一集合的同步串行执行
    sync_lock: tokio::sync::Mutex<()>,
}

impl<R: SyncRecord> CacheSyncer<R> {
    pub fn new(
        settings: SyncSettings,
        connection: Arc<ConnectionManager>,
        api: Arc<DiffSyncApi>,
        store: Arc<dyn KvStore>,
        codec: CacheCodec,
    ) -> Self {
        Self {
            settings,
            connection,
            api,
            dao: CacheDao::new(store, codec),
            listener: RwLock::new(Arc::new(EmptySyncListener)),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn SyncListener>) {
        match self.listener.write() {
            Ok(mut slot) => *slot = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    fn listener(&self) -> Arc<dyn SyncListener> {
        match self.listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 当前本地缓存
    pub async fn cached(&self) -> CacheSnapshot<R> {
        self.load_cache().await
    }

    /// 清空本地缓存，下一次同步将全量下载
    pub async fn clear(&self) -> Result<(), SyncError> {
        let _guard = self.sync_lock.lock().await;
        self.dao.clear().await?;
        info!("[CacheSync] 🗑️ 已清空 {} 缓存", R::RESOURCE);
        Ok(())
    }

    /// 与服务器同步本地缓存
    pub async fn sync(&self) -> Result<SyncOutcome<R>, SyncError> {
        let _guard = self.sync_lock.lock().await;
        let resource = R::RESOURCE;
        let listener = self.listener();

        info!("[CacheSync] 🔄 开始同步 {}", resource);
        listener.on_sync_started(resource).await;

        match self.run().await {
            Ok(outcome) => {
                info!(
                    "[CacheSync] ✅ {} 同步完成: 路径={:?}, 记录数={}, 差异请求={}",
                    resource,
                    outcome.path,
                    outcome.snapshot.len(),
                    outcome.diff_attempts
                );
                listener
                    .on_sync_finished(resource, outcome.path, outcome.snapshot.len())
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                error!("[CacheSync] ❌ {} 同步失败: {}", resource, e);
                listener.on_sync_failed(resource, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<SyncOutcome<R>, SyncError> {
        let cached = self.load_cache().await;
        if cached.is_empty() {
            info!("[CacheSync] 本地 {} 缓存为空，直接全量下载", R::RESOURCE);
            return self.full_download(0).await;
        }

        if self
            .connection
            .connected_within(self.settings.fast_path_window())
        {
            let local_hash = aggregate_hash(&cached);
            match self.server_hash().await {
                Ok(Some(server_hash)) if server_hash == local_hash => {
                    info!("[CacheSync] ⚡ {} 哈希一致，使用本地缓存", R::RESOURCE);
                    return Ok(SyncOutcome {
                        path: SyncPath::Cached,
                        snapshot: cached,
                        diff_attempts: 0,
                    });
                }
                Ok(server_hash) => {
                    debug!(
                        "[CacheSync] {} 哈希不一致: 本地={}, 服务器={:?}",
                        R::RESOURCE,
                        local_hash,
                        server_hash
                    );
                }
                Err(e) => warn!("[CacheSync] 查询 {} 哈希失败，改走差异同步: {}", R::RESOURCE, e),
            }
        } else {
            debug!("[CacheSync] 距上次连接已超过快速路径窗口，跳过哈希比较");
        }

        self.diff_sync(cached).await
    }

    async fn diff_sync(&self, mut snapshot: CacheSnapshot<R>) -> Result<SyncOutcome<R>, SyncError> {
        let max_attempts = self.settings.max_diff_attempts.max(1);
        let max_delay = Duration::from_millis(self.settings.retry_max_ms);
        let mut backoff = Backoff::new(
            Duration::from_millis(self.settings.retry_base_ms),
            max_delay,
            self.settings.retry_factor,
        );
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;
            match self.diff_once(&mut snapshot).await {
                Ok(()) => {
                    return Ok(SyncOutcome {
                        path: SyncPath::Diff,
                        snapshot,
                        diff_attempts: attempts,
                    });
                }
                Err(e) if e.requires_full_download() => {
                    warn!(
                        "[CacheSync] {} 差异同步被拒绝({})，改为全量下载",
                        R::RESOURCE,
                        e
                    );
                    return self.full_download(attempts).await;
                }
                Err(e) => {
                    warn!(
                        "[CacheSync] {} 第 {}/{} 次差异同步失败: {}",
                        R::RESOURCE,
                        attempts,
                        max_attempts,
                        e
                    );
                    if attempts < max_attempts {
                        let delay = match &e {
                            SyncError::RateLimited {
                                retry_after: Some(after),
                            } => (*after).min(max_delay),
                            _ => backoff.next_delay(),
                        };
                        debug!("[CacheSync]   {:?} 后重试", delay);
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        if let Some(e @ SyncError::RateLimited { .. }) = last_error {
            warn!("[CacheSync] {} 最后一次差异同步被限流，放弃本次同步", R::RESOURCE);
            return Err(e);
        }
        info!(
            "[CacheSync] {} 差异同步 {} 次均未成功，改为全量下载",
            R::RESOURCE,
            attempts
        );
        self.full_download(attempts).await
    }

    /// 一次差异同步：请求、应用、持久化、校验
    async fn diff_once(&self, snapshot: &mut CacheSnapshot<R>) -> Result<(), SyncError> {
        let changes = self.api.diff(snapshot).await?;

        if !changes.is_empty() {
            let changes_json = serde_json::to_string(&changes)?;
            for record in changes {
                if record.is_removed() {
                    snapshot.remove(&record.id());
                } else {
                    snapshot.insert(record.id(), record);
                }
            }
            self.persist(snapshot).await;
            self.listener()
                .on_records_changed(R::RESOURCE, changes_json)
                .await;
        }

        // 只有与服务器哈希一致才算成功；查询失败或服务器未返回哈希都按未同步重试
        let local_hash = aggregate_hash(snapshot);
        match self.server_hash().await? {
            Some(server_hash) if server_hash == local_hash => Ok(()),
            Some(server_hash) => {
                debug!(
                    "[CacheSync] {} 校验失败: 本地={}, 服务器={}",
                    R::RESOURCE,
                    local_hash,
                    server_hash
                );
                Err(SyncError::OutOfSync)
            }
            None => {
                debug!("[CacheSync] 服务器未返回 {} 哈希，无法校验", R::RESOURCE);
                Err(SyncError::OutOfSync)
            }
        }
    }

    async fn full_download(&self, diff_attempts: u32) -> Result<SyncOutcome<R>, SyncError> {
        info!("[CacheSync] 📥 全量下载 {}", R::RESOURCE);
        let items = self
            .connection
            .transport()
            .fetch_collection(R::RESOURCE, self.settings.request_timeout())
            .await?;

        let total = items.len();
        let mut snapshot = CacheSnapshot::new();
        for item in items {
            match serde_json::from_value::<R>(item) {
                Ok(record) if !record.is_removed() => {
                    snapshot.insert(record.id(), record);
                }
                Ok(_) => {}
                Err(e) => warn!("[CacheSync] 跳过无法解析的 {} 记录: {}", R::RESOURCE, e),
            }
        }
        debug!(
            "[CacheSync] {} 全量下载 {} 条，保留 {} 条",
            R::RESOURCE,
            total,
            snapshot.len()
        );

        self.persist(&snapshot).await;
        let records: Vec<&R> = snapshot.values().collect();
        let records_json = serde_json::to_string(&records)?;
        self.listener()
            .on_records_changed(R::RESOURCE, records_json)
            .await;

        Ok(SyncOutcome {
            path: SyncPath::FullDownload,
            snapshot,
            diff_attempts,
        })
    }

    async fn server_hash(&self) -> Result<Option<String>, SessionError> {
        self.connection
            .transport()
            .query_hash(R::RESOURCE, self.settings.request_timeout())
            .await
    }

    async fn load_cache(&self) -> CacheSnapshot<R> {
        match self.dao.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("[CacheSync] 读取 {} 缓存失败，按空缓存处理: {}", R::RESOURCE, e);
                CacheSnapshot::new()
            }
        }
    }

    /// 持久化失败只记录日志，内存中的结果照常返回
    async fn persist(&self, snapshot: &CacheSnapshot<R>) {
        if let Err(e) = self.dao.save(snapshot).await {
            warn!("[CacheSync] 持久化 {} 缓存失败: {}", R::RESOURCE, e);
        }
    }
}
