//! 已读位置同步引擎
//!
//! 本地更新立即写入 client 副本并持久化；首次 `fetch()` 之后，更新经过防抖合并为
//! 一次 PATCH。同一时间只有一个 PATCH 在途（`waiting`），期间再调用 `patch()`
//! 只会排队，在途请求结束后重新执行。
//!
//! 失败按错误类型恢复：
//! - `RateLimited`：优先按 `X-RateLimit-Reset` 重试，其次 `Retry-After`，最后抖动退避
//! - `Unavailable`：抖动退避，服务器给出 `Retry-After` 时以其为准（不超过上限）
//! - `Unauthorized`：停用，直到观察到新的 API token 后重试一次
//! - `BadRequest`：停用并清空所有待同步数据
//! - `Offline`：保留队列，连接恢复时重试

use crate::im::auth::SharedToken;
use crate::im::backoff::Backoff;
use crate::im::config::ReadStateSettings;
use crate::im::error::ReadStateError;
use crate::im::readstate::api::ReadStateApi;
use crate::im::readstate::dao::ReadStateDao;
use crate::im::readstate::listener::{EmptyReadStateListener, ReadStateListener};
use crate::im::readstate::models::{
    build_patch, merge_inflight_into_client, merge_inflight_into_server, ReadOp, ReadOps,
    ServerReadState,
};
use crate::im::store::KvStore;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// `patch()` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchResult {
    Sent,
    /// 已有 PATCH 在途，本次排队
    Queued,
    /// 没有需要发送的操作
    Skipped,
}

/// 停用原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    /// 等待新的 API token
    Unauthorized,
    /// 服务器永久拒绝，本次会话不再恢复
    BadRequest,
}

/// 最近一次安排的重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// 按 `X-RateLimit-Reset` 等待
    UntilReset { delay: Duration },
    /// 按 `Retry-After` 等待
    ServerSuggested { delay: Duration },
    Backoff { delay: Duration },
}

impl RetryPlan {
    pub fn delay(&self) -> Duration {
        match self {
            RetryPlan::UntilReset { delay }
            | RetryPlan::ServerSuggested { delay }
            | RetryPlan::Backoff { delay } => *delay,
        }
    }
}

/// 引擎状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStateStatus {
    pub fetching: bool,
    pub patching: bool,
    pub disabled: Option<DisabledReason>,
    /// 本次会话是否已获取过服务器状态
    pub fetched: bool,
    /// 等待网络恢复
    pub offline: bool,
    pub pending: usize,
    pub inflight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryAction {
    Fetch,
    Patch,
}

#[derive(Default)]
struct EngineState {
    client: ReadOps,
    inflight: ReadOps,
    server: ServerReadState,
    fetched: bool,
    fetching: bool,
    /// PATCH 在途
    waiting: bool,
    patch_queued: bool,
    disabled: Option<DisabledReason>,
    offline_action: Option<RetryAction>,
    last_retry_plan: Option<RetryPlan>,
}

#[derive(Default)]
struct EngineTimers {
    debounce: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    token_watch: Option<JoinHandle<()>>,
}

impl EngineTimers {
    fn abort_all(&mut self) {
        for handle in [
            self.debounce.take(),
            self.retry.take(),
            self.token_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `X-RateLimit-Reset`（Unix 秒）距 `now_ms` 还要等多久
///
/// 非正数或换算成毫秒会溢出的值视为无效，返回 `None`；已过去的时间点返回零。
fn reset_wait(reset_at: i64, now_ms: i64) -> Option<Duration> {
    if reset_at <= 0 {
        return None;
    }
    let reset_ms = reset_at.checked_mul(1000)?;
    Some(Duration::from_millis(
        reset_ms.saturating_sub(now_ms).max(0) as u64,
    ))
}

/// `fetch()` 被取消时清除 `fetching`
struct FetchingGuard<'a>(&'a Mutex<EngineState>);

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).fetching = false;
    }
}

/// 在途 PATCH 的守卫
///
/// `patch()` 的 future 在请求返回前被丢弃（所在任务被 abort）时，把 inflight 放回
/// client、清除 `waiting`，并在后台重新持久化 client 副本。
struct InflightGuard<'a> {
    engine: &'a ReadStateEngine,
    armed: bool,
}

impl<'a> InflightGuard<'a> {
    fn new(engine: &'a ReadStateEngine) -> Self {
        Self {
            engine,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (snapshot, rerun) = self.engine.restore_inflight();
        warn!(
            "[ReadState] ⚠️ PATCH 被中断，在途记录已放回本地队列 (共 {} 条)",
            snapshot.len()
        );
        let Some(this) = self.engine.arc() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            this.persist_client(&snapshot).await;
            if rerun {
                this.run_action(RetryAction::Patch).await;
            }
        });
    }
}

pub struct ReadStateEngine {
    settings: ReadStateSettings,
    api: ReadStateApi,
    dao: ReadStateDao,
    api_token: SharedToken,
    listener: RwLock<Arc<dyn ReadStateListener>>,
    state: Mutex<EngineState>,
    backoff: Mutex<Backoff>,
    timers: Mutex<EngineTimers>,
    weak_self: Weak<ReadStateEngine>,
}

impl ReadStateEngine {
    /// 创建引擎并恢复上次会话留下的 client 副本
    pub async fn open(
        settings: ReadStateSettings,
        http: reqwest::Client,
        api_base_url: String,
        api_token: SharedToken,
        store: Arc<dyn KvStore>,
    ) -> Arc<Self> {
        let api = ReadStateApi::new(
            http,
            api_base_url,
            api_token.clone(),
            settings.expand_unread_count,
            settings.request_timeout(),
        );
        let backoff = Backoff::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_max_ms),
            settings.retry_factor,
        );
        let engine = Arc::new_cyclic(|weak| Self {
            settings,
            api,
            dao: ReadStateDao::new(store),
            api_token,
            listener: RwLock::new(Arc::new(EmptyReadStateListener)),
            state: Mutex::new(EngineState::default()),
            backoff: Mutex::new(backoff),
            timers: Mutex::new(EngineTimers::default()),
            weak_self: weak.clone(),
        });
        engine.restore().await;
        engine
    }

    async fn restore(&self) {
        match self.dao.load_client().await {
            Ok(restored) if !restored.is_empty() => {
                info!("[ReadState] 恢复上次未同步的已读记录 {} 条", restored.len());
                let mut state = lock(&self.state);
                for (conversation, op) in restored {
                    state.client.entry(conversation).or_insert(op);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("[ReadState] 读取本地已读记录失败: {}", e),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ReadStateListener>) {
        match self.listener.write() {
            Ok(mut slot) => *slot = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    fn listener(&self) -> Arc<dyn ReadStateListener> {
        match self.listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    pub fn status(&self) -> ReadStateStatus {
        let state = lock(&self.state);
        ReadStateStatus {
            fetching: state.fetching,
            patching: state.waiting,
            disabled: state.disabled,
            fetched: state.fetched,
            offline: state.offline_action.is_some(),
            pending: state.client.len(),
            inflight: state.inflight.len(),
        }
    }

    pub fn last_retry_plan(&self) -> Option<RetryPlan> {
        lock(&self.state).last_retry_plan
    }

    /// 服务器确认的已读状态
    pub fn server_state(&self) -> ServerReadState {
        lock(&self.state).server.clone()
    }

    /// 尚未发出的本地操作
    pub fn pending(&self) -> ReadOps {
        lock(&self.state).client.clone()
    }

    // ---------------------------------------------------------------------
    // 本地更新
    // ---------------------------------------------------------------------

    pub async fn update(
        &self,
        conversation: &str,
        message_id: &str,
        timestamp: i64,
    ) -> Result<(), ReadStateError> {
        self.record(
            conversation,
            ReadOp::Add {
                message_id: message_id.to_string(),
                timestamp,
            },
        )
        .await
    }

    pub async fn remove(&self, conversation: &str) -> Result<(), ReadStateError> {
        self.record(conversation, ReadOp::Remove).await
    }

    async fn record(&self, conversation: &str, op: ReadOp) -> Result<(), ReadStateError> {
        let (snapshot, schedule) = {
            let mut state = lock(&self.state);
            if state.disabled == Some(DisabledReason::BadRequest) {
                return Err(ReadStateError::Disabled);
            }
            state.client.insert(conversation.to_string(), op);
            (
                state.client.clone(),
                state.fetched && state.disabled.is_none(),
            )
        };
        debug!("[ReadState] 记录会话 {} 的已读位置", conversation);
        self.persist_client(&snapshot).await;
        if schedule {
            self.schedule_patch();
        }
        Ok(())
    }

    fn schedule_patch(&self) {
        let Some(this) = self.arc() else {
            return;
        };
        let delay = self.settings.debounce();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&this.timers).debounce.take();
            if let Err(e) = this.patch().await {
                debug!("[ReadState] 防抖 PATCH 失败: {}", e);
            }
        });
        if let Some(previous) = lock(&self.timers).debounce.replace(handle) {
            previous.abort();
        }
    }

    async fn persist_client(&self, snapshot: &ReadOps) {
        if let Err(e) = self.dao.save_client(snapshot).await {
            warn!("[ReadState] 持久化已读记录失败: {}", e);
        }
    }

    // ---------------------------------------------------------------------
    // 网络同步
    // ---------------------------------------------------------------------

    /// 获取服务器端完整状态；有排队的本地修改时立即 PATCH
    pub async fn fetch(&self) -> Result<(), ReadStateError> {
        {
            let mut state = lock(&self.state);
            if state.disabled.is_some() {
                return Err(ReadStateError::Disabled);
            }
            if state.fetching {
                debug!("[ReadState] 已有获取请求在途，忽略");
                return Ok(());
            }
            state.fetching = true;
        }
        let _fetching = FetchingGuard(&self.state);

        match self.api.fetch().await {
            Ok(server) => {
                let server_json = serde_json::to_string(&server).unwrap_or_default();
                let has_pending = {
                    let mut state = lock(&self.state);
                    state.server = server;
                    state.fetched = true;
                    state.fetching = false;
                    state.last_retry_plan = None;
                    !state.client.is_empty()
                };
                lock(&self.backoff).reset();
                self.listener().on_read_state_updated(server_json).await;
                if has_pending {
                    info!("[ReadState] 存在排队的本地修改，立即提交");
                    self.patch().await?;
                }
                Ok(())
            }
            Err(e) => {
                lock(&self.state).fetching = false;
                warn!("[ReadState] 获取已读状态失败: {}", e);
                self.handle_failure(RetryAction::Fetch, &e).await;
                Err(e)
            }
        }
    }

    /// 提交本地修改
    pub async fn patch(&self) -> Result<PatchResult, ReadStateError> {
        let (body, had_pending) = {
            let mut state = lock(&self.state);
            if state.disabled.is_some() {
                return Err(ReadStateError::Disabled);
            }
            if state.waiting {
                debug!("[ReadState] PATCH 在途，本次排队");
                state.patch_queued = true;
                return Ok(PatchResult::Queued);
            }
            let had_pending = !state.client.is_empty();
            let (body, sent) = build_patch(&state.client, &state.server);
            state.client.clear();
            if !body.is_empty() {
                state.inflight = sent;
                state.waiting = true;
            }
            (body, had_pending)
        };

        if body.is_empty() {
            if had_pending {
                self.persist_client(&ReadOps::new()).await;
            }
            debug!("[ReadState] 没有需要提交的修改");
            return Ok(PatchResult::Skipped);
        }

        let guard = InflightGuard::new(self);
        if had_pending {
            self.persist_client(&ReadOps::new()).await;
        }

        match self.api.patch(&body).await {
            Ok(()) => {
                guard.disarm();
                let (server_json, rerun) = {
                    let mut state = lock(&self.state);
                    let inflight = std::mem::take(&mut state.inflight);
                    merge_inflight_into_server(&mut state.server, &inflight);
                    state.waiting = false;
                    state.last_retry_plan = None;
                    let rerun = std::mem::take(&mut state.patch_queued);
                    (
                        serde_json::to_string(&state.server).unwrap_or_default(),
                        rerun,
                    )
                };
                lock(&self.backoff).reset();
                self.listener().on_read_state_updated(server_json).await;
                if rerun {
                    self.spawn_action(RetryAction::Patch, Duration::ZERO);
                }
                Ok(PatchResult::Sent)
            }
            Err(e) => {
                guard.disarm();
                let (snapshot, _) = self.restore_inflight();
                warn!("[ReadState] 提交已读状态失败: {}", e);
                self.persist_client(&snapshot).await;
                self.handle_failure(RetryAction::Patch, &e).await;
                Err(e)
            }
        }
    }

    /// 把 inflight 合并回 client 并结束本次 PATCH，返回新的 client 副本和是否有排队的 PATCH
    fn restore_inflight(&self) -> (ReadOps, bool) {
        let mut state = lock(&self.state);
        let inflight = std::mem::take(&mut state.inflight);
        merge_inflight_into_client(&mut state.client, inflight);
        state.waiting = false;
        let queued = std::mem::take(&mut state.patch_queued);
        (state.client.clone(), queued)
    }

    /// 连接恢复：重放因离线搁置的请求
    pub fn on_connection_restored(&self) {
        let action = lock(&self.state).offline_action.take();
        if let Some(action) = action {
            info!("[ReadState] 🌐 连接已恢复，重试 {:?}", action);
            self.spawn_action(action, Duration::ZERO);
        }
    }

    /// 停止所有定时器
    pub fn stop(&self) {
        lock(&self.timers).abort_all();
    }

    // ---------------------------------------------------------------------
    // 失败恢复
    // ---------------------------------------------------------------------

    async fn handle_failure(&self, action: RetryAction, error: &ReadStateError) {
        match error {
            ReadStateError::RateLimited {
                reset_at,
                retry_after,
            } => {
                let until_reset =
                    reset_at.and_then(|at| reset_wait(at, Utc::now().timestamp_millis()));
                if until_reset.is_none() && reset_at.is_some() {
                    warn!("[ReadState] 忽略无效的 X-RateLimit-Reset: {:?}", reset_at);
                }
                let plan = if let Some(delay) = until_reset {
                    RetryPlan::UntilReset { delay }
                } else if let Some(after) = retry_after {
                    RetryPlan::ServerSuggested { delay: *after }
                } else {
                    RetryPlan::Backoff {
                        delay: lock(&self.backoff).next_delay(),
                    }
                };
                self.schedule_retry(action, plan);
            }
            ReadStateError::Unavailable { retry_after } => {
                let max = Duration::from_millis(self.settings.retry_max_ms);
                let plan = match retry_after {
                    Some(after) => RetryPlan::ServerSuggested {
                        delay: (*after).min(max),
                    },
                    None => RetryPlan::Backoff {
                        delay: lock(&self.backoff).next_delay(),
                    },
                };
                self.schedule_retry(action, plan);
            }
            ReadStateError::Unauthorized => {
                lock(&self.state).disabled = Some(DisabledReason::Unauthorized);
                info!("[ReadState] 🔒 未授权，等待新的 API token");
                self.watch_for_token(action);
            }
            ReadStateError::BadRequest { message } => {
                error!("[ReadState] ⛔ 请求被服务器拒绝，停用已读同步: {}", message);
                {
                    let mut state = lock(&self.state);
                    state.disabled = Some(DisabledReason::BadRequest);
                    state.client.clear();
                    state.inflight.clear();
                    state.patch_queued = false;
                    state.offline_action = None;
                }
                self.stop();
                self.persist_client(&ReadOps::new()).await;
                self.listener()
                    .on_read_state_disabled(message.clone())
                    .await;
            }
            ReadStateError::Offline => {
                debug!("[ReadState] 离线，等待连接恢复后重试 {:?}", action);
                let mut state = lock(&self.state);
                state.offline_action = match (state.offline_action, action) {
                    (Some(RetryAction::Fetch), _) | (_, RetryAction::Fetch) => {
                        Some(RetryAction::Fetch)
                    }
                    _ => Some(RetryAction::Patch),
                };
            }
            ReadStateError::Disabled => {
                debug!("[ReadState] 已停用，不安排重试");
            }
        }
    }

    fn schedule_retry(&self, action: RetryAction, plan: RetryPlan) {
        info!("[ReadState] ⏳ {:?} 将在 {:?} 后重试 ({:?})", action, plan.delay(), plan);
        lock(&self.state).last_retry_plan = Some(plan);
        self.spawn_action(action, plan.delay());
    }

    fn spawn_action(&self, action: RetryAction, delay: Duration) {
        let Some(this) = self.arc() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&this.timers).retry.take();
            this.run_action(action).await;
        });
        if let Some(previous) = lock(&self.timers).retry.replace(handle) {
            previous.abort();
        }
    }

    async fn run_action(&self, action: RetryAction) {
        let result = match action {
            RetryAction::Fetch => self.fetch().await,
            RetryAction::Patch => {
                // 尚未获取过服务器状态时无法判断哪些操作已过期，先获取
                let fetched = lock(&self.state).fetched;
                if fetched {
                    self.patch().await.map(|_| ())
                } else {
                    self.fetch().await
                }
            }
        };
        if let Err(e) = result {
            debug!("[ReadState] 重试 {:?} 失败: {}", action, e);
        }
    }

    /// 观察到与当前不同的非空 token 后解除停用并重试一次
    fn watch_for_token(&self, action: RetryAction) {
        let Some(this) = self.arc() else {
            return;
        };
        let mut rx = self.api_token.subscribe();
        let stale = rx.borrow_and_update().clone();
        let handle = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                let fresh = rx.borrow_and_update().clone();
                if fresh.is_some() && fresh != stale {
                    break;
                }
            }
            lock(&this.timers).token_watch.take();
            {
                let mut state = lock(&this.state);
                if state.disabled != Some(DisabledReason::Unauthorized) {
                    return;
                }
                state.disabled = None;
            }
            info!("[ReadState] 🔑 获得新的 API token，重试 {:?}", action);
            this.run_action(action).await;
        });
        if let Some(previous) = lock(&self.timers).token_watch.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for ReadStateEngine {
    fn drop(&mut self) {
        lock(&self.timers).abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::store::MemoryStore;
    use crate::im::testing::{init_test_logger, wait_until};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings() -> ReadStateSettings {
        ReadStateSettings {
            debounce_ms: 50,
            retry_base_ms: 10,
            retry_max_ms: 100,
            ..ReadStateSettings::default()
        }
    }

    async fn engine_with(
        server: &MockServer,
        settings: ReadStateSettings,
        store: Arc<MemoryStore>,
        token: SharedToken,
    ) -> Arc<ReadStateEngine> {
        init_test_logger();
        ReadStateEngine::open(settings, reqwest::Client::new(), server.uri(), token, store).await
    }

    fn token() -> SharedToken {
        SharedToken::new(Some("api-1".to_string()))
    }

    async fn mount_empty_state(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/readstate"))
            .and(query_param("expand", "items.unreadCount"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": {} })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn updates_before_first_fetch_stay_local() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(&server, test_settings(), store.clone(), token()).await;

        engine.update("room-1", "m1", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.status().pending, 1);
        assert!(store.has("readstate:client").await.unwrap());
    }

    #[tokio::test]
    async fn restored_changes_are_patched_right_after_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/readstate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": { "room-1": { "mid": "m0", "timestamp": 5, "unreadCount": 2 } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/readstate"))
            .and(header("authorization", "Bearer api-1"))
            .and(body_json(json!([
                { "op": "add", "path": "/items/room-1", "value": { "mid": "m1", "timestamp": 10 } }
            ])))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        {
            let previous = engine_with(&server, test_settings(), store.clone(), token()).await;
            previous.update("room-1", "m1", 10).await.unwrap();
        }

        let engine = engine_with(&server, test_settings(), store.clone(), token()).await;
        assert_eq!(engine.status().pending, 1);
        engine.fetch().await.unwrap();

        assert_eq!(engine.server_state()["room-1"].mid, "m1");
        assert_eq!(engine.status().pending, 0);
        assert!(!store.has("readstate:client").await.unwrap());
    }

    #[tokio::test]
    async fn rapid_updates_are_debounced_into_one_patch() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .and(path("/readstate"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let engine = engine_with(&server, test_settings(), Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();

        engine.update("a", "m1", 1).await.unwrap();
        engine.update("b", "m2", 2).await.unwrap();
        engine.remove("c").await.unwrap();

        wait_until(|| engine.server_state().len() == 2 && engine.status().pending == 0).await;
    }

    #[tokio::test]
    async fn stale_changes_skip_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/readstate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": { "a": { "mid": "m9", "timestamp": 9 } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let engine = engine_with(&server, settings, Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();

        engine.update("a", "m1", 1).await.unwrap();
        assert_eq!(engine.patch().await.unwrap(), PatchResult::Skipped);
        assert_eq!(engine.status().pending, 0);
    }

    #[tokio::test]
    async fn failed_patch_is_remerged_and_retried() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            retry_base_ms: 200,
            retry_max_ms: 400,
            ..test_settings()
        };
        let engine = engine_with(&server, settings, Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        let err = engine.patch().await.unwrap_err();
        assert!(matches!(err, ReadStateError::Unavailable { .. }));
        assert!(matches!(
            engine.last_retry_plan(),
            Some(RetryPlan::Backoff { .. })
        ));

        wait_until(|| engine.server_state().contains_key("a")).await;
        assert_eq!(engine.status().pending, 0);
        assert_eq!(engine.last_retry_plan(), None);
    }

    #[tokio::test]
    async fn rate_limit_waits_for_the_reset_time() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        let reset_at = Utc::now().timestamp() + 30;
        Mock::given(method("PATCH"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("X-RateLimit-Reset", reset_at.to_string().as_str())
                    .insert_header("Retry-After", "1"),
            )
            .expect(1)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let engine = engine_with(&server, settings, Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        let err = engine.patch().await.unwrap_err();

        assert!(matches!(err, ReadStateError::RateLimited { .. }));
        match engine.last_retry_plan() {
            Some(RetryPlan::UntilReset { delay }) => {
                assert!(delay >= Duration::from_secs(29), "delay {:?}", delay)
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(engine.status().pending, 1);
    }

    #[tokio::test]
    async fn bad_request_disables_and_clears_everything() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad shape"))
            .expect(1)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(&server, settings, store.clone(), token()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        let err = engine.patch().await.unwrap_err();

        assert!(matches!(err, ReadStateError::BadRequest { .. }));
        let status = engine.status();
        assert_eq!(status.disabled, Some(DisabledReason::BadRequest));
        assert_eq!(status.pending, 0);
        assert_eq!(status.inflight, 0);
        assert!(!store.has("readstate:client").await.unwrap());
        assert_eq!(
            engine.update("b", "m2", 2).await.unwrap_err(),
            ReadStateError::Disabled
        );
    }

    #[tokio::test]
    async fn unauthorized_waits_for_a_fresh_token_then_retries_once() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .and(header("authorization", "Bearer api-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(header("authorization", "Bearer api-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let api_token = token();
        let engine =
            engine_with(&server, settings, Arc::new(MemoryStore::new()), api_token.clone()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        assert_eq!(
            engine.patch().await.unwrap_err(),
            ReadStateError::Unauthorized
        );
        assert_eq!(engine.status().disabled, Some(DisabledReason::Unauthorized));
        assert_eq!(engine.patch().await.unwrap_err(), ReadStateError::Disabled);

        api_token.set(Some("api-2".to_string()));

        wait_until(|| engine.server_state().contains_key("a")).await;
        assert_eq!(engine.status().disabled, None);
    }

    #[tokio::test]
    async fn second_patch_while_in_flight_is_queued() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .expect(2)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let engine = engine_with(&server, settings, Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.patch().await })
        };
        wait_until(|| engine.status().patching).await;
        engine.update("b", "m2", 2).await.unwrap();
        assert_eq!(engine.patch().await.unwrap(), PatchResult::Queued);

        assert_eq!(first.await.unwrap().unwrap(), PatchResult::Sent);
        wait_until(|| engine.server_state().len() == 2).await;
    }

    #[tokio::test]
    async fn undecodable_response_keeps_pending_changes_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/readstate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            retry_base_ms: 60_000,
            retry_max_ms: 120_000,
            ..test_settings()
        };
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(&server, settings, store.clone(), token()).await;
        engine.update("room-1", "m1", 10).await.unwrap();

        assert_eq!(
            engine.fetch().await.unwrap_err(),
            ReadStateError::Unavailable { retry_after: None }
        );

        let status = engine.status();
        assert_eq!(status.disabled, None);
        assert_eq!(status.pending, 1);
        assert!(!status.fetching);
        assert!(matches!(
            engine.last_retry_plan(),
            Some(RetryPlan::Backoff { .. })
        ));
        let persisted = ReadStateDao::new(store).load_client().await.unwrap();
        assert!(persisted.contains_key("room-1"));
    }

    #[tokio::test]
    async fn aborted_patch_returns_its_changes_to_the_queue() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .and(path("/readstate"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(&server, settings, store.clone(), token()).await;
        engine.fetch().await.unwrap();
        engine.update("room-1", "m1", 10).await.unwrap();

        let in_flight = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.patch().await })
        };
        wait_until(|| engine.status().patching).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        in_flight.abort();
        assert!(in_flight.await.unwrap_err().is_cancelled());

        let status = engine.status();
        assert!(!status.patching);
        assert_eq!(status.inflight, 0);
        assert_eq!(status.pending, 1);

        let dao = ReadStateDao::new(store);
        for _ in 0..50 {
            if !dao.load_client().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dao.load_client().await.unwrap().contains_key("room-1"));

        engine.update("room-2", "m2", 20).await.unwrap();
        assert_eq!(engine.patch().await.unwrap(), PatchResult::Sent);
        let server_state = engine.server_state();
        assert_eq!(server_state["room-1"].mid, "m1");
        assert_eq!(server_state["room-2"].mid, "m2");
        assert!(dao.load_client().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_does_not_block_the_next_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/readstate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "items": {} }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let engine = engine_with(&server, test_settings(), Arc::new(MemoryStore::new()), token()).await;

        let in_flight = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch().await })
        };
        wait_until(|| engine.status().fetching).await;
        in_flight.abort();
        let _ = in_flight.await;

        assert!(!engine.status().fetching);
        engine.fetch().await.unwrap();
        assert!(engine.status().fetched);
    }

    #[tokio::test]
    async fn out_of_range_rate_limit_reset_falls_back_to_retry_after() {
        let server = MockServer::start().await;
        mount_empty_state(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("X-RateLimit-Reset", i64::MIN.to_string().as_str())
                    .insert_header("Retry-After", "2"),
            )
            .expect(1)
            .mount(&server)
            .await;
        let settings = ReadStateSettings {
            debounce_ms: 60_000,
            ..test_settings()
        };
        let engine = engine_with(&server, settings, Arc::new(MemoryStore::new()), token()).await;
        engine.fetch().await.unwrap();
        engine.update("a", "m1", 1).await.unwrap();

        let err = engine.patch().await.unwrap_err();

        assert!(matches!(err, ReadStateError::RateLimited { .. }));
        assert_eq!(
            engine.last_retry_plan(),
            Some(RetryPlan::ServerSuggested {
                delay: Duration::from_secs(2)
            })
        );
        assert_eq!(engine.status().pending, 1);
    }

    #[test]
    fn reset_wait_rejects_values_it_cannot_convert() {
        let now_ms = 1_700_000_000_000;
        assert_eq!(reset_wait(i64::MIN, now_ms), None);
        assert_eq!(reset_wait(-5, now_ms), None);
        assert_eq!(reset_wait(0, now_ms), None);
        assert_eq!(reset_wait(i64::MAX, now_ms), None);
        assert_eq!(reset_wait(1_600_000_000, now_ms), Some(Duration::ZERO));
        assert_eq!(
            reset_wait(1_700_000_030, now_ms),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn offline_failures_wait_for_the_connection() {
        init_test_logger();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let engine = ReadStateEngine::open(
            test_settings(),
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            token(),
            store,
        )
        .await;

        assert_eq!(engine.fetch().await.unwrap_err(), ReadStateError::Offline);

        let status = engine.status();
        assert!(status.offline);
        assert!(!status.fetching);
        assert_eq!(engine.last_retry_plan(), None);
    }
}
