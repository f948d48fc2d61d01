//! 测试辅助：可编排的传输层、认证器与记录型监听器

use crate::im::auth::{ApiToken, SessionAuthenticator, SessionCredentials};
use crate::im::connection::{ConnectionStatus, SessionListener};
use crate::im::error::{Condition, SessionError};
use crate::im::transport::{
    ConnectionPhase, NegotiatedSession, Participant, Transport, TransportEvent, TransportHooks,
};
use crate::im::types::SyncResource;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        // 测试中默认打开当前 crate 的 debug，关闭底层 HTTP 客户端的 debug 噪音
        let filter_layer = EnvFilter::new(
            "info,chat_sync_core=debug,sqlx=info,hyper_util::client=info,reqwest=info",
        );

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// 轮询条件直到成立；暂停时钟下每轮推进 10ms
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingBehavior {
    Ok,
    Hang,
}

/// 可编排的传输层
pub(crate) struct MockTransport {
    hooks: TransportHooks,
    connect_results: Mutex<VecDeque<Result<(), SessionError>>>,
    connect_delay: Mutex<Duration>,
    inactivity: Mutex<Duration>,
    ping_behavior: Mutex<PingBehavior>,
    hashes: Mutex<HashMap<SyncResource, Option<String>>>,
    hash_errors: Mutex<VecDeque<SessionError>>,
    collections: Mutex<HashMap<SyncResource, Vec<serde_json::Value>>>,
    participant_results: Mutex<VecDeque<Result<Vec<Participant>, SessionError>>>,
    joins: Mutex<Vec<(String, bool)>>,
    connected: AtomicBool,
    generation: AtomicU64,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    ping_calls: AtomicUsize,
    hash_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            hooks: TransportHooks::new(),
            connect_results: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            inactivity: Mutex::new(Duration::from_secs(60)),
            ping_behavior: Mutex::new(PingBehavior::Ok),
            hashes: Mutex::new(HashMap::new()),
            hash_errors: Mutex::new(VecDeque::new()),
            collections: Mutex::new(HashMap::new()),
            participant_results: Mutex::new(VecDeque::new()),
            joins: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
            hash_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// 脚本用完后连接总是成功
    pub(crate) fn push_connect_result(&self, result: Result<(), SessionError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_inactivity(&self, inactivity: Duration) {
        *self.inactivity.lock().unwrap() = inactivity;
    }

    pub(crate) fn set_ping_behavior(&self, behavior: PingBehavior) {
        *self.ping_behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn set_hash(&self, resource: SyncResource, hash: Option<String>) {
        self.hashes.lock().unwrap().insert(resource, hash);
    }

    pub(crate) fn push_hash_error(&self, error: SessionError) {
        self.hash_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn set_collection(&self, resource: SyncResource, items: Vec<serde_json::Value>) {
        self.collections.lock().unwrap().insert(resource, items);
    }

    pub(crate) fn push_participants(&self, result: Result<Vec<Participant>, SessionError>) {
        self.participant_results.lock().unwrap().push_back(result);
    }

    /// 模拟远端关闭
    pub(crate) fn drop_connection(&self, condition: Condition) {
        self.connected.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.hooks.emit(&TransportEvent::Status {
            phase: ConnectionPhase::Disconnected,
            condition: Some(condition),
        });
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn joins(&self) -> Vec<(String, bool)> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<NegotiatedSession, SessionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.hooks.emit(&TransportEvent::Status {
            phase: ConnectionPhase::Connecting,
            condition: None,
        });
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.connect_results.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            self.hooks.emit(&TransportEvent::Status {
                phase: ConnectionPhase::Disconnected,
                condition: Some(e.status_condition()),
            });
            return Err(e);
        }

        self.hooks.emit(&TransportEvent::Status {
            phase: ConnectionPhase::Authenticating,
            condition: None,
        });
        self.connected.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.hooks.emit(&TransportEvent::Status {
            phase: ConnectionPhase::Connected,
            condition: None,
        });
        Ok(NegotiatedSession {
            sid: format!("sid-{}", generation),
            jid: format!("{}/mock", credentials.jid()),
            inactivity: *self.inactivity.lock().unwrap(),
            generation,
        })
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.hooks.emit(&TransportEvent::Status {
                phase: ConnectionPhase::Disconnecting,
                condition: None,
            });
            self.hooks.emit(&TransportEvent::Status {
                phase: ConnectionPhase::Disconnected,
                condition: None,
            });
        }
    }

    async fn ping(&self, _timeout: Duration) -> Result<(), SessionError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.ping_behavior.lock().unwrap();
        match behavior {
            PingBehavior::Ok => Ok(()),
            PingBehavior::Hang => std::future::pending().await,
        }
    }

    async fn query_hash(
        &self,
        resource: SyncResource,
        _timeout: Duration,
    ) -> Result<Option<String>, SessionError> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.hash_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(&resource)
            .cloned()
            .flatten())
    }

    async fn fetch_collection(
        &self,
        resource: SyncResource,
        _timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, SessionError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(&resource)
            .cloned()
            .unwrap_or_default())
    }

    async fn join_room(&self, room_jid: &str, limit_presence: bool) -> Result<(), SessionError> {
        self.joins
            .lock()
            .unwrap()
            .push((room_jid.to_string(), limit_presence));
        Ok(())
    }

    async fn fetch_participants(
        &self,
        _room_jid: &str,
        _timeout: Duration,
    ) -> Result<Vec<Participant>, SessionError> {
        self.participant_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }
}

/// 可编排的认证器
pub(crate) struct ScriptedAuthenticator {
    uses_oauth: bool,
    oauth_expired: AtomicBool,
    token_lifetime: Option<u64>,
    oauth_results: Mutex<VecDeque<Result<(), SessionError>>>,
    api_token_results: Mutex<VecDeque<Result<ApiToken, SessionError>>>,
    credentials_calls: AtomicUsize,
    api_token_calls: AtomicUsize,
    oauth_calls: AtomicUsize,
}

impl ScriptedAuthenticator {
    pub(crate) fn new() -> Self {
        Self {
            uses_oauth: false,
            oauth_expired: AtomicBool::new(false),
            token_lifetime: Some(900),
            oauth_results: Mutex::new(VecDeque::new()),
            api_token_results: Mutex::new(VecDeque::new()),
            credentials_calls: AtomicUsize::new(0),
            api_token_calls: AtomicUsize::new(0),
            oauth_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_oauth(mut self) -> Self {
        self.uses_oauth = true;
        self
    }

    pub(crate) fn with_token_lifetime(mut self, secs: u64) -> Self {
        self.token_lifetime = Some(secs);
        self
    }

    pub(crate) fn set_oauth_expired(&self, expired: bool) {
        self.oauth_expired.store(expired, Ordering::SeqCst);
    }

    pub(crate) fn push_oauth_result(&self, result: Result<(), SessionError>) {
        self.oauth_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn push_api_token_result(&self, result: Result<ApiToken, SessionError>) {
        self.api_token_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn credentials_calls(&self) -> usize {
        self.credentials_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn api_token_calls(&self) -> usize {
        self.api_token_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn oauth_calls(&self) -> usize {
        self.oauth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAuthenticator for ScriptedAuthenticator {
    async fn session_credentials(&self) -> Result<SessionCredentials, SessionError> {
        self.credentials_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionCredentials::Password {
            jid: "1_7@chat.localhost".to_string(),
            password: "secret".to_string(),
        })
    }

    async fn refresh_api_token(&self) -> Result<ApiToken, SessionError> {
        let n = self.api_token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(result) = self.api_token_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(ApiToken {
            access_token: format!("api-{}", n),
            expires_in: self.token_lifetime,
        })
    }

    fn uses_oauth(&self) -> bool {
        self.uses_oauth
    }

    fn oauth_token_expired(&self) -> bool {
        self.oauth_expired.load(Ordering::SeqCst)
    }

    async fn refresh_oauth_token(&self) -> Result<(), SessionError> {
        self.oauth_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .oauth_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.oauth_expired.store(false, Ordering::SeqCst);
        }
        result
    }
}

/// 记录所有回调的会话监听器
#[derive(Default)]
pub(crate) struct RecordingSessionListener {
    statuses: Mutex<Vec<ConnectionStatus>>,
    connected: Mutex<Vec<bool>>,
    failures: Mutex<Vec<(String, bool)>>,
    tokens: Mutex<Vec<String>>,
    sign_outs: AtomicUsize,
}

impl RecordingSessionListener {
    pub(crate) fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn connected_events(&self) -> Vec<bool> {
        self.connected.lock().unwrap().clone()
    }

    pub(crate) fn failures(&self) -> Vec<(String, bool)> {
        self.failures.lock().unwrap().clone()
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub(crate) fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionListener for RecordingSessionListener {
    async fn on_status_changed(&self, status: ConnectionStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    async fn on_connected(&self, reconnected: bool) {
        self.connected.lock().unwrap().push(reconnected);
    }

    async fn on_connection_failed(&self, reason: String, fatal: bool) {
        self.failures.lock().unwrap().push((reason, fatal));
    }

    async fn on_sign_out_required(&self) {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_api_token_refreshed(&self, token: String) {
        self.tokens.lock().unwrap().push(token);
    }
}
