//! 连接状态机实现
//!
//! `connect()` 幂等；`reconnect()` 在已连接或已有重连在进行时什么也不做。
//! 所有定时器都是 tokio 任务，断开时统一中止；定时器内部需要断开连接时
//! 另起任务执行，避免中止自己。

use crate::im::auth::{SessionAuthenticator, SharedToken};
use crate::im::backoff::Backoff;
use crate::im::config::ConnectionTimings;
use crate::im::connection::listener::{EmptySessionListener, SessionListener};
use crate::im::connection::state::{ConnectionStatus, SessionState};
use crate::im::error::{Condition, SessionError};
use crate::im::transport::{
    ConnectionPhase, HookToken, NegotiatedSession, Transport, TransportEvent,
};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Timers {
    watchdog: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    api_token: Option<JoinHandle<()>>,
    oauth: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.watchdog.take(),
            self.keepalive.take(),
            self.api_token.take(),
            self.oauth.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// 连接管理器
pub struct ConnectionManager {
    timings: ConnectionTimings,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn SessionAuthenticator>,
    api_token: SharedToken,
    listener: RwLock<Arc<dyn SessionListener>>,
    state: Mutex<SessionState>,
    /// 串行化传输层的建立
    connect_lock: tokio::sync::Mutex<()>,
    cancel_reconnect: Notify,
    last_activity: Mutex<Instant>,
    inactivity: Mutex<Duration>,
    timers: Mutex<Timers>,
    hook_token: HookToken,
    weak_self: Weak<ConnectionManager>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(
        timings: ConnectionTimings,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn SessionAuthenticator>,
        api_token: SharedToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ConnectionManager>| {
            let hook_owner = weak.clone();
            let hook_token = transport.hooks().add(move |event| {
                if let Some(this) = hook_owner.upgrade() {
                    this.on_transport_event(event);
                }
            });
            let base_delay = timings.reconnect_base_delay();
            Self {
                state: Mutex::new(SessionState::new(base_delay)),
                inactivity: Mutex::new(Duration::from_secs(60)),
                timings,
                transport,
                authenticator,
                api_token,
                listener: RwLock::new(Arc::new(EmptySessionListener)),
                connect_lock: tokio::sync::Mutex::new(()),
                cancel_reconnect: Notify::new(),
                last_activity: Mutex::new(Instant::now()),
                timers: Mutex::new(Timers::default()),
                hook_token,
                weak_self: weak.clone(),
            }
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        match self.listener.write() {
            Ok(mut slot) => *slot = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    fn listener(&self) -> Arc<dyn SessionListener> {
        match self.listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// 会话状态快照
    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// 是否在 `window` 内（重）连接成功过且仍保持连接
    pub fn connected_within(&self, window: Duration) -> bool {
        let state = lock(&self.state);
        state.connected
            && state
                .connected_at
                .map(|at| at.elapsed() <= window)
                .unwrap_or(false)
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn api_token(&self) -> SharedToken {
        self.api_token.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// 恢复初始状态（测试隔离用），不触发任何通知
    pub fn reset(&self) {
        self.stop_timers();
        self.cancel_reconnect.notify_waiters();
        *lock(&self.state) = SessionState::new(self.timings.reconnect_base_delay());
        *lock(&self.inactivity) = Duration::from_secs(60);
        self.touch();
    }

    // ---------------------------------------------------------------------
    // 连接 / 重连 / 断开
    // ---------------------------------------------------------------------

    /// 建立连接；显式调用会清除 `disconnect(false)` 留下的禁止重连标记
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _guard = self.connect_lock.lock().await;
        let reconnected = {
            let mut state = lock(&self.state);
            state.should_reconnect = true;
            if state.connected {
                debug!("[Conn] 已连接，忽略 connect()");
                return Ok(());
            }
            !state.is_initial_connect
        };

        info!("[Conn] 🔌 开始连接");
        self.notify_status(ConnectionStatus::Connecting).await;
        match self.open_session().await {
            Ok(session) => {
                self.on_connected(session, reconnected).await;
                Ok(())
            }
            Err(e) => {
                error!("[Conn] ❌ 连接失败: {}", e);
                self.on_connect_failed(&e).await;
                Err(e)
            }
        }
    }

    /// 重连；已连接或已有重连在进行时直接返回
    pub async fn reconnect(&self, reset_state: bool) -> Result<(), SessionError> {
        {
            let mut state = lock(&self.state);
            if state.connected || state.reconnecting {
                debug!(
                    "[Conn] 忽略 reconnect(): connected={}, reconnecting={}",
                    state.connected, state.reconnecting
                );
                return Ok(());
            }
            if !state.should_reconnect {
                info!("[Conn] 自动重连已被禁止，忽略 reconnect()");
                return Err(SessionError::ReconnectSuppressed);
            }
            state.reconnecting = true;
            if reset_state {
                state.reconnect_attempts = 0;
                state.reconnect_delay = self.timings.reconnect_base_delay();
            }
        }

        let result = self.reconnect_loop().await;
        lock(&self.state).reconnecting = false;
        result
    }

    async fn reconnect_loop(&self) -> Result<(), SessionError> {
        let mut backoff = Backoff::new(
            self.timings.reconnect_base_delay(),
            self.timings.reconnect_max_delay(),
            self.timings.reconnect_factor,
        );
        let max_attempts = self.timings.max_reconnect_attempts.max(1);

        loop {
            if !lock(&self.state).should_reconnect {
                return Err(SessionError::ReconnectCancelled);
            }
            self.notify_status(ConnectionStatus::Reconnecting).await;

            let attempt = {
                let _guard = self.connect_lock.lock().await;
                if self.is_connected() {
                    return Ok(());
                }
                self.open_session().await
            };

            match attempt {
                Ok(session) => {
                    if !lock(&self.state).should_reconnect {
                        info!("[Conn] 重连期间收到断开请求，关闭新会话");
                        self.transport.disconnect().await;
                        return Err(SessionError::ReconnectCancelled);
                    }
                    self.on_connected(session, true).await;
                    return Ok(());
                }
                Err(e) if e.is_terminal() => {
                    error!("[Conn] ❌ 重连遇到不可恢复的错误: {}", e);
                    self.fail_permanently(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    let attempts = backoff.attempts();
                    {
                        let mut state = lock(&self.state);
                        state.reconnect_attempts = attempts;
                        state.reconnect_delay = delay;
                    }
                    warn!(
                        "[Conn] 🔄 第 {}/{} 次重连失败: {}",
                        attempts, max_attempts, e
                    );

                    if attempts >= max_attempts {
                        backoff.reset();
                        {
                            let mut state = lock(&self.state);
                            state.reconnect_attempts = 0;
                            state.reconnect_delay = self.timings.reconnect_base_delay();
                        }
                        let exhausted = SessionError::ReconnectExhausted { attempts };
                        error!("[Conn] ❌ {}", exhausted);
                        self.notify_status(ConnectionStatus::Failed(exhausted.status_condition()))
                            .await;
                        self.listener()
                            .on_connection_failed(exhausted.to_string(), true)
                            .await;
                        return Err(exhausted);
                    }

                    debug!("[Conn] {:?} 后再次重连", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel_reconnect.notified() => {
                            info!("[Conn] 重连已取消");
                            return Err(SessionError::ReconnectCancelled);
                        }
                    }
                }
            }
        }
    }

    /// 断开连接；`should_reconnect = false` 会一直生效到下一次显式 `connect()`
    pub async fn disconnect(&self, should_reconnect: bool) {
        self.stop_timers();
        {
            let mut state = lock(&self.state);
            state.should_reconnect = should_reconnect;
            if state.connected {
                state.disconnected_at = Some(Utc::now());
            }
            state.connected = false;
            state.phase = ConnectionPhase::Disconnecting;
        }
        if !should_reconnect {
            self.cancel_reconnect.notify_waiters();
        }

        info!("[Conn] 断开连接, should_reconnect={}", should_reconnect);
        self.transport.disconnect().await;
        lock(&self.state).phase = ConnectionPhase::Disconnected;
        self.notify_status(ConnectionStatus::Disconnected).await;

        if should_reconnect {
            self.spawn_reconnect(true);
        }
    }

    async fn open_session(&self) -> Result<NegotiatedSession, SessionError> {
        if self.authenticator.uses_oauth() && self.authenticator.oauth_token_expired() {
            info!("[Conn] OAuth token 已过期，连接前先刷新");
            self.refresh_oauth_with_retry().await?;
        }
        let credentials = self.authenticator.session_credentials().await?;
        self.transport.connect(&credentials).await
    }

    async fn on_connected(&self, session: NegotiatedSession, reconnected: bool) {
        {
            let mut state = lock(&self.state);
            state.connected = true;
            state.phase = ConnectionPhase::Connected;
            state.is_initial_connect = false;
            state.reconnect_attempts = 0;
            state.reconnect_delay = self.timings.reconnect_base_delay();
            state.disconnected_at = None;
            state.connected_at = Some(Instant::now());
            state.generation = session.generation;
        }
        *lock(&self.inactivity) = session.inactivity;
        self.touch();
        self.start_timers();

        info!(
            "[Conn] ✅ 已连接: jid={}, reconnected={}, generation={}",
            session.jid, reconnected, session.generation
        );
        self.notify_status(ConnectionStatus::Connected).await;
        self.listener().on_connected(reconnected).await;
    }

    async fn on_connect_failed(&self, e: &SessionError) {
        if e.is_terminal() {
            self.fail_permanently(e).await;
        } else {
            self.notify_status(ConnectionStatus::Disconnected).await;
            self.listener()
                .on_connection_failed(e.to_string(), false)
                .await;
        }
    }

    /// 终止自动重连并上报
    async fn fail_permanently(&self, e: &SessionError) {
        lock(&self.state).should_reconnect = false;
        self.cancel_reconnect.notify_waiters();
        if matches!(e, SessionError::SignOutRequired) {
            self.listener().on_sign_out_required().await;
        }
        self.notify_status(ConnectionStatus::Failed(e.status_condition()))
            .await;
        self.listener().on_connection_failed(e.to_string(), true).await;
    }

    fn spawn_reconnect(&self, reset_state: bool) {
        let Some(this) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.reconnect(reset_state).await {
                warn!("[Conn] 自动重连结束: {}", e);
            }
        });
    }

    // ---------------------------------------------------------------------
    // 传输层事件
    // ---------------------------------------------------------------------

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::DataReceived { .. } | TransportEvent::DataSent { .. } => self.touch(),
            TransportEvent::Status { phase, condition } => {
                let unexpected = {
                    let mut state = lock(&self.state);
                    let unexpected = state.connected && *phase == ConnectionPhase::Disconnected;
                    state.phase = *phase;
                    if unexpected {
                        state.connected = false;
                        state.disconnected_at = Some(Utc::now());
                    }
                    unexpected
                };
                if unexpected {
                    let condition = condition.clone();
                    if let Some(this) = self.arc() {
                        tokio::spawn(async move {
                            this.handle_transport_closed(condition).await;
                        });
                    }
                }
            }
        }
    }

    /// 传输层在连接状态下被关闭
    async fn handle_transport_closed(&self, condition: Option<Condition>) {
        self.stop_timers();
        let failure = SessionError::ConnFail {
            condition: condition
                .unwrap_or_else(|| Condition::Other("remote-connection-failed".to_string())),
        };
        warn!("[Conn] ⚠️ 连接被意外关闭: {}", failure);

        if failure.is_terminal() {
            self.fail_permanently(&failure).await;
            return;
        }
        self.notify_status(ConnectionStatus::Disconnected).await;
        if lock(&self.state).should_reconnect {
            if let Err(e) = self.reconnect(false).await {
                warn!("[Conn] 自动重连结束: {}", e);
            }
        }
    }

    /// 看门狗 / ping 超时触发：断开并重连
    async fn force_disconnect(&self, condition: Condition) {
        let was_connected = {
            let mut state = lock(&self.state);
            let was = state.connected;
            if was {
                state.connected = false;
                state.disconnected_at = Some(Utc::now());
                state.phase = ConnectionPhase::Disconnecting;
            }
            was
        };
        if !was_connected {
            return;
        }

        self.stop_timers();
        warn!("[Conn] ⚠️ 强制断开连接: {}", condition);
        self.transport.disconnect().await;
        self.notify_status(ConnectionStatus::Disconnected).await;
        if lock(&self.state).should_reconnect {
            if let Err(e) = self.reconnect(false).await {
                warn!("[Conn] 自动重连结束: {}", e);
            }
        }
    }

    fn spawn_force_disconnect(&self, condition: Condition) {
        if let Some(this) = self.arc() {
            tokio::spawn(async move { this.force_disconnect(condition).await });
        }
    }

    async fn notify_status(&self, status: ConnectionStatus) {
        {
            let mut state = lock(&self.state);
            if state.last_notified.as_ref() == Some(&status) {
                return;
            }
            state.last_notified = Some(status.clone());
        }
        debug!("[Conn] 状态通知: {:?}", status);
        self.listener().on_status_changed(status).await;
    }

    // ---------------------------------------------------------------------
    // 定时器
    // ---------------------------------------------------------------------

    fn stop_timers(&self) {
        lock(&self.timers).abort_all();
    }

    fn start_timers(&self) {
        let Some(this) = self.arc() else {
            return;
        };
        let mut timers = lock(&self.timers);
        timers.abort_all();
        timers.watchdog = Some(tokio::spawn(this.clone().run_watchdog()));
        timers.keepalive = Some(tokio::spawn(this.clone().run_keepalive()));
        timers.api_token = Some(tokio::spawn(this.clone().run_api_token_timer()));
        if self.authenticator.uses_oauth() {
            timers.oauth = Some(tokio::spawn(this.run_oauth_timer()));
        }
    }

    /// 静默超过协商的 inactivity 加延迟宽限时强制重连
    async fn run_watchdog(self: Arc<Self>) {
        loop {
            let limit = *lock(&self.inactivity) + self.timings.latency_grace();
            tokio::time::sleep_until(self.last_activity() + limit).await;
            if self.last_activity().elapsed() >= limit {
                warn!("[Conn] ⏰ 会话静默超过 {:?}，强制重连", limit);
                self.spawn_force_disconnect(Condition::Timeout);
                return;
            }
        }
    }

    /// 静默一段时间后发送 ping，超时则强制重连
    async fn run_keepalive(self: Arc<Self>) {
        let grace = self.timings.ping_grace();
        let timeout = self.timings.ping_timeout();
        loop {
            tokio::time::sleep_until(self.last_activity() + grace).await;
            if self.last_activity().elapsed() < grace {
                continue;
            }

            debug!("[Conn] 📡 发送保活 ping");
            match tokio::time::timeout(timeout, self.transport.ping(timeout)).await {
                Ok(Ok(())) => self.touch(),
                Ok(Err(SessionError::NotConnected)) => return,
                Ok(Err(SessionError::Timeout)) | Err(_) => {
                    warn!("[Conn] ⏰ ping 超时，强制重连");
                    self.spawn_force_disconnect(Condition::Timeout);
                    return;
                }
                Ok(Err(e)) => {
                    // 服务器有应答，连接仍然可用
                    debug!("[Conn] ping 返回错误: {}", e);
                    self.touch();
                }
            }
        }
    }

    /// 连接成功后立即刷新一次 API token，之后在过期前 margin 刷新
    async fn run_api_token_timer(self: Arc<Self>) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.timings.api_token_retry_base_ms),
            Duration::from_millis(self.timings.api_token_retry_max_ms),
            self.timings.reconnect_factor,
        );
        let mut next = Duration::ZERO;
        loop {
            if !next.is_zero() {
                tokio::time::sleep(next).await;
            }
            match self.authenticator.refresh_api_token().await {
                Ok(token) => {
                    backoff.reset();
                    let lifetime = token
                        .expires_in
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.timings.api_token_default_lifetime());
                    next = lifetime
                        .saturating_sub(self.timings.api_token_refresh_margin())
                        .max(Duration::from_secs(1));
                    self.api_token.set(Some(token.access_token.clone()));
                    debug!("[Conn] API token 已更新，{:?} 后再次刷新", next);
                    self.listener()
                        .on_api_token_refreshed(token.access_token)
                        .await;
                }
                Err(e) => {
                    next = backoff.next_delay();
                    warn!("[Conn] API token 刷新失败: {}，{:?} 后重试", e, next);
                }
            }
        }
    }

    async fn run_oauth_timer(self: Arc<Self>) {
        let interval = self.timings.oauth_refresh_interval();
        loop {
            tokio::time::sleep(interval).await;
            match self.refresh_oauth_with_retry().await {
                Ok(()) => debug!("[Conn] OAuth token 定时刷新完成"),
                Err(SessionError::SignOutRequired) => {
                    if let Some(this) = self.arc() {
                        tokio::spawn(async move { this.sign_out().await });
                    }
                    return;
                }
                Err(e) => warn!("[Conn] OAuth token 刷新多次失败，下个周期再试: {}", e),
            }
        }
    }

    async fn refresh_oauth_with_retry(&self) -> Result<(), SessionError> {
        lock(&self.state).oauth_refresh_in_flight = true;
        let mut backoff = Backoff::new(
            Duration::from_millis(self.timings.oauth_retry_base_ms),
            Duration::from_millis(self.timings.oauth_retry_max_ms),
            self.timings.reconnect_factor,
        );
        let max_attempts = self.timings.oauth_max_attempts.max(1);

        let result = loop {
            match self.authenticator.refresh_oauth_token().await {
                Ok(()) => break Ok(()),
                Err(SessionError::SignOutRequired) => break Err(SessionError::SignOutRequired),
                Err(e) => {
                    if backoff.attempts() + 1 >= max_attempts {
                        break Err(e);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "[Conn] OAuth 刷新失败 ({}/{}): {}，{:?} 后重试",
                        backoff.attempts(),
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        lock(&self.state).oauth_refresh_in_flight = false;
        result
    }

    async fn sign_out(&self) {
        warn!("[Conn] ❌ OAuth 授权已失效，需要重新登录");
        self.disconnect(false).await;
        self.fail_permanently(&SessionError::SignOutRequired).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.transport.hooks().remove(self.hook_token);
        lock(&self.timers).abort_all();
    }
}
