//! 基于 BOSH（XMPP over HTTP 长轮询）的传输实现
//!
//! 握手流程：创建会话 -> SASL 认证 -> 重启流 -> 绑定资源，之后由后台任务持续轮询。
//! IQ 请求按 id 关联响应；每次建立 / 断开都会递增连接代数，旧代数的响应直接丢弃。

use crate::im::auth::SessionCredentials;
use crate::im::error::{Condition, SessionError};
use crate::im::transport::stanza;
use crate::im::transport::{
    ConnectionPhase, NegotiatedSession, Participant, Transport, TransportEvent, TransportHooks,
};
use crate::im::types::SyncResource;
use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const NS_HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
const NS_XBOSH: &str = "urn:xmpp:xbosh";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_PING: &str = "urn:xmpp:ping";
pub const NS_HASH: &str = "urn:xmpp:chat-sync:hash";
pub const NS_COLLECTION: &str = "urn:xmpp:chat-sync:collection";
const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub const NS_PRESENCE_LIMIT: &str = "urn:xmpp:chat-sync:presence-limit";
const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// 握手阶段等待 SASL 结果时允许的空轮询次数
const MAX_EMPTY_HANDSHAKE_POLLS: usize = 3;

/// BOSH 连接参数
#[derive(Debug, Clone)]
pub struct BoshSettings {
    pub url: String,
    pub domain: String,
    pub resource: String,
    /// 长轮询最长挂起时间（秒）
    pub wait_secs: u64,
    /// 握手请求超时
    pub request_timeout: Duration,
    /// 服务器未声明 inactivity 时使用
    pub default_inactivity: Duration,
}

impl Default for BoshSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:5280/http-bind".to_string(),
            domain: "chat.localhost".to_string(),
            resource: "chat-sync".to_string(),
            wait_secs: 60,
            request_timeout: Duration::from_secs(20),
            default_inactivity: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveSession {
    sid: String,
    url: String,
    jid: String,
    generation: u64,
}

struct Inner {
    http: reqwest::Client,
    settings: BoshSettings,
    hooks: TransportHooks,
    rid: AtomicU64,
    next_iq: AtomicU64,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// BOSH 传输
pub struct BoshTransport {
    inner: Arc<Inner>,
}

impl BoshTransport {
    pub fn new(http: reqwest::Client, settings: BoshSettings) -> Self {
        let initial_rid = rand::thread_rng().gen_range(1_000_000u64..4_000_000_000u64);
        Self {
            inner: Arc::new(Inner {
                http,
                settings,
                hooks: TransportHooks::new(),
                rid: AtomicU64::new(initial_rid),
                next_iq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// 当前连接代数
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn next_rid(&self) -> u64 {
        self.rid.fetch_add(1, Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.next_iq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn emit_status(&self, phase: ConnectionPhase, condition: Option<Condition>) {
        self.hooks
            .emit(&TransportEvent::Status { phase, condition });
    }

    fn active_session(&self) -> Option<ActiveSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn wrap(&self, sid: &str, payload: &str) -> String {
        format!(
            "<body rid='{}' sid='{}' xmlns='{}'>{}</body>",
            self.next_rid(),
            stanza::escape(sid),
            NS_HTTPBIND,
            payload
        )
    }

    async fn post(&self, url: &str, body: String, timeout: Duration) -> Result<String, SessionError> {
        self.hooks
            .emit(&TransportEvent::DataSent { bytes: body.len() });
        debug!("[Bosh] >>> {}", body);

        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SessionError::Timeout
                } else {
                    SessionError::Http(e)
                }
            })?;

        let status = response.status();
        let text = response.text().await?;
        self.hooks
            .emit(&TransportEvent::DataReceived { bytes: text.len() });
        debug!("[Bosh] <<< {} {}", status, text);

        if !status.is_success() {
            let condition = match status.as_u16() {
                404 => Condition::Other("item-not-found".to_string()),
                403 => Condition::PolicyViolation,
                _ => Condition::Other("remote-connection-failed".to_string()),
            };
            return Err(SessionError::ConnFail { condition });
        }
        Ok(text)
    }

    fn check_terminate(body: &str) -> Result<(), SessionError> {
        if stanza::attr(body, "type").as_deref() == Some("terminate") {
            let condition = stanza::attr(body, "condition")
                .map(|c| Condition::parse(&c))
                .unwrap_or_else(|| Condition::Other("remote-connection-failed".to_string()));
            return Err(SessionError::ConnFail { condition });
        }
        Ok(())
    }

    /// 把响应中的 IQ 结果交给等待者；其他 stanza 只记录
    fn dispatch(&self, body: &str, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("[Bosh] 丢弃旧连接代数 {} 的响应", generation);
            return;
        }
        for child in stanza::children(body) {
            let is_reply = stanza::tag_name(child) == Some("iq")
                && matches!(
                    stanza::attr(child, "type").as_deref(),
                    Some("result") | Some("error")
                );
            if !is_reply {
                debug!("[Bosh] 忽略 stanza: {:?}", stanza::tag_name(child));
                continue;
            }
            let Some(id) = stanza::attr(child, "id") else {
                continue;
            };
            let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(child.to_string());
                }
                None => debug!("[Bosh] 没有等待者的 IQ 响应: {}", id),
            }
        }
    }

    fn remove_pending(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    async fn send_iq(&self, id: String, iq: String, timeout: Duration) -> Result<String, SessionError> {
        let session = self.active_session().ok_or(SessionError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }

        let body = self.wrap(&session.sid, &iq);
        let exchange = async {
            let response = self.post(&session.url, body, timeout).await?;
            Self::check_terminate(&response)?;
            self.dispatch(&response, session.generation);
            rx.await.map_err(|_| SessionError::NotConnected)
        };

        let reply = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.remove_pending(&id);
                return Err(e);
            }
            Err(_) => {
                self.remove_pending(&id);
                warn!("[Bosh] IQ {} 超时", id);
                return Err(SessionError::Timeout);
            }
        };

        if stanza::attr(&reply, "type").as_deref() == Some("error") {
            let condition = stanza::find(&reply, "error")
                .and_then(stanza::first_child_name)
                .unwrap_or_else(|| "undefined-condition".to_string());
            return Err(SessionError::Protocol(condition));
        }
        Ok(reply)
    }

    /// 远端关闭或轮询失败：只处理当前代数，重复通知被忽略
    fn handle_remote_close(&self, generation: u64, condition: Option<Condition>) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Ok(mut session) = self.session.lock() {
            *session = None;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        warn!("[Bosh] 会话被远端关闭, 条件: {:?}", condition);
        self.emit_status(ConnectionPhase::Disconnected, condition);
    }

    async fn poll_loop(self: Arc<Self>, generation: u64) {
        let timeout = Duration::from_secs(self.settings.wait_secs) + self.settings.request_timeout;
        loop {
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let Some(session) = self.active_session() else {
                break;
            };
            let body = self.wrap(&session.sid, "");
            match self.post(&session.url, body, timeout).await {
                Ok(response) => {
                    if let Err(e) = Self::check_terminate(&response) {
                        self.handle_remote_close(generation, e.condition().cloned());
                        break;
                    }
                    self.dispatch(&response, generation);
                }
                Err(e) => {
                    if self.generation.load(Ordering::SeqCst) != generation {
                        break;
                    }
                    error!("[Bosh] 轮询失败: {}", e);
                    self.handle_remote_close(generation, Some(e.status_condition()));
                    break;
                }
            }
        }
        debug!("[Bosh] 轮询任务退出, 代数 {}", generation);
    }

    /// 发送 payload 并等待至少一个子元素返回
    async fn exchange_handshake(
        &self,
        url: &str,
        sid: &str,
        payload: &str,
    ) -> Result<String, SessionError> {
        let timeout = self.settings.request_timeout;
        let mut response = self.post(url, self.wrap(sid, payload), timeout).await?;
        Self::check_terminate(&response)?;
        let mut polls = 0;
        while stanza::children(&response).is_empty() && polls < MAX_EMPTY_HANDSHAKE_POLLS {
            response = self.post(url, self.wrap(sid, ""), timeout).await?;
            Self::check_terminate(&response)?;
            polls += 1;
        }
        Ok(response)
    }

    async fn handshake(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(ActiveSession, Duration), SessionError> {
        let settings = &self.settings;
        let url = credentials
            .bind_url()
            .map(str::to_string)
            .unwrap_or_else(|| settings.url.clone());
        let route = match credentials {
            SessionCredentials::Nonce {
                route: Some(route), ..
            } => format!(" route='{}'", stanza::escape(route)),
            _ => String::new(),
        };

        info!("[Bosh] 🔌 创建会话: {}", url);
        let create = format!(
            "<body content='text/xml; charset=utf-8' hold='1' rid='{}' to='{}'{} ver='1.6' wait='{}' xml:lang='en' xmpp:version='1.0' xmlns='{}' xmlns:xmpp='{}'/>",
            self.next_rid(),
            stanza::escape(&settings.domain),
            route,
            settings.wait_secs,
            NS_HTTPBIND,
            NS_XBOSH,
        );
        let response = self.post(&url, create, settings.request_timeout).await?;
        Self::check_terminate(&response)?;
        let sid = stanza::attr(&response, "sid")
            .ok_or_else(|| SessionError::Protocol("会话创建响应缺少 sid".to_string()))?;
        let inactivity = stanza::attr(&response, "inactivity")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(settings.default_inactivity);

        self.emit_status(ConnectionPhase::Authenticating, None);
        let (mechanism, secret) = match credentials {
            SessionCredentials::Password { password, .. } => ("PLAIN", password.as_str()),
            SessionCredentials::OAuth { access_token, .. } => ("X-OAUTH2", access_token.as_str()),
            SessionCredentials::Nonce { nonce, .. } => ("X-CHAT-NONCE", nonce.as_str()),
        };
        let local = credentials.jid().split('@').next().unwrap_or_default();
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("\0{}\0{}", local, secret));
        let auth = format!(
            "<auth xmlns='{}' mechanism='{}'>{}</auth>",
            NS_SASL, mechanism, encoded
        );
        let response = self.exchange_handshake(&url, &sid, &auth).await?;
        if let Some(failure) = stanza::find(&response, "failure") {
            let condition = stanza::first_child_name(failure)
                .map(|c| Condition::parse(&c))
                .unwrap_or(Condition::NotAuthorized);
            warn!("[Bosh] ❌ SASL 认证失败: {}", condition);
            return Err(SessionError::AuthFail { condition });
        }
        if stanza::find(&response, "success").is_none() {
            return Err(SessionError::Protocol("SASL 认证无响应".to_string()));
        }

        let restart = format!(
            "<body rid='{}' sid='{}' to='{}' xml:lang='en' xmpp:restart='true' xmlns='{}' xmlns:xmpp='{}'/>",
            self.next_rid(),
            stanza::escape(&sid),
            stanza::escape(&settings.domain),
            NS_HTTPBIND,
            NS_XBOSH,
        );
        let response = self.post(&url, restart, settings.request_timeout).await?;
        Self::check_terminate(&response)?;

        let bind_id = self.next_id("bind");
        let bind = format!(
            "<iq type='set' id='{}'><bind xmlns='{}'><resource>{}</resource></bind></iq>",
            bind_id,
            NS_BIND,
            stanza::escape(&settings.resource)
        );
        let response = self.exchange_handshake(&url, &sid, &bind).await?;
        let reply = stanza::children(&response)
            .into_iter()
            .find(|c| stanza::attr(c, "id").as_deref() == Some(bind_id.as_str()))
            .ok_or_else(|| SessionError::Protocol("资源绑定无响应".to_string()))?;
        if stanza::attr(reply, "type").as_deref() == Some("error") {
            let condition = stanza::find(reply, "error")
                .and_then(stanza::first_child_name)
                .map(|c| Condition::parse(&c))
                .unwrap_or(Condition::NotAllowed);
            return Err(SessionError::PolicyViolation { condition });
        }
        let jid = stanza::find(reply, "jid")
            .and_then(stanza::text)
            .unwrap_or_else(|| format!("{}/{}", credentials.jid(), settings.resource));

        Ok((
            ActiveSession {
                sid,
                url,
                jid,
                generation: 0,
            },
            inactivity,
        ))
    }

    fn stop_poll(&self) {
        if let Ok(mut task) = self.poll_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for BoshTransport {
    async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<NegotiatedSession, SessionError> {
        let inner = &self.inner;
        if inner.active_session().is_some() {
            self.disconnect().await;
        }

        inner.emit_status(ConnectionPhase::Connecting, None);
        let (mut session, inactivity) = match inner.handshake(credentials).await {
            Ok(result) => result,
            Err(e) => {
                error!("[Bosh] 握手失败: {}", e);
                inner.emit_status(ConnectionPhase::Disconnected, Some(e.status_condition()));
                return Err(e);
            }
        };

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.generation = generation;
        if let Ok(mut slot) = inner.session.lock() {
            *slot = Some(session.clone());
        }
        let handle = tokio::spawn(inner.clone().poll_loop(generation));
        if let Ok(mut task) = inner.poll_task.lock() {
            *task = Some(handle);
        }

        info!(
            "[Bosh] ✅ 会话已建立: sid={}, jid={}, inactivity={:?}",
            session.sid, session.jid, inactivity
        );
        inner.emit_status(ConnectionPhase::Connected, None);
        Ok(NegotiatedSession {
            sid: session.sid,
            jid: session.jid,
            inactivity,
            generation,
        })
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        let session = inner.session.lock().ok().and_then(|mut s| s.take());
        let Some(session) = session else {
            return;
        };

        inner.emit_status(ConnectionPhase::Disconnecting, None);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.stop_poll();
        if let Ok(mut pending) = inner.pending.lock() {
            pending.clear();
        }

        let terminate = format!(
            "<body rid='{}' sid='{}' type='terminate' xmlns='{}'><presence type='unavailable' xmlns='jabber:client'/></body>",
            inner.next_rid(),
            stanza::escape(&session.sid),
            NS_HTTPBIND
        );
        if let Err(e) = inner
            .post(&session.url, terminate, inner.settings.request_timeout)
            .await
        {
            debug!("[Bosh] 发送 terminate 失败（忽略）: {}", e);
        }

        info!("[Bosh] 会话已关闭: sid={}", session.sid);
        inner.emit_status(ConnectionPhase::Disconnected, None);
    }

    async fn ping(&self, timeout: Duration) -> Result<(), SessionError> {
        let id = self.inner.next_id("ping");
        let iq = format!(
            "<iq type='get' id='{}' to='{}'><ping xmlns='{}'/></iq>",
            id,
            stanza::escape(&self.inner.settings.domain),
            NS_PING
        );
        self.inner.send_iq(id, iq, timeout).await?;
        Ok(())
    }

    async fn query_hash(
        &self,
        resource: SyncResource,
        timeout: Duration,
    ) -> Result<Option<String>, SessionError> {
        let id = self.inner.next_id("hash");
        let iq = format!(
            "<iq type='get' id='{}'><query xmlns='{}' resource='{}'/></iq>",
            id,
            NS_HASH,
            resource.as_str()
        );
        let reply = match self.inner.send_iq(id, iq, timeout).await {
            Ok(reply) => reply,
            Err(SessionError::Protocol(condition)) if condition == "item-not-found" => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        Ok(stanza::find(&reply, "hash")
            .and_then(stanza::text)
            .filter(|h| !h.is_empty()))
    }

    async fn fetch_collection(
        &self,
        resource: SyncResource,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, SessionError> {
        let id = self.inner.next_id("collection");
        let iq = format!(
            "<iq type='get' id='{}'><query xmlns='{}' resource='{}'/></iq>",
            id,
            NS_COLLECTION,
            resource.as_str()
        );
        let reply = self.inner.send_iq(id, iq, timeout).await?;
        let payload = stanza::find(&reply, "items")
            .and_then(stanza::text)
            .unwrap_or_else(|| "[]".to_string());
        serde_json::from_str(&payload)
            .map_err(|e| SessionError::Protocol(format!("集合数据解析失败: {}", e)))
    }

    async fn join_room(&self, room_jid: &str, limit_presence: bool) -> Result<(), SessionError> {
        let session = self
            .inner
            .active_session()
            .ok_or(SessionError::NotConnected)?;
        let nick = session.jid.split('@').next().unwrap_or_default();
        let limit = if limit_presence {
            format!("<x xmlns='{}'/>", NS_PRESENCE_LIMIT)
        } else {
            String::new()
        };
        let presence = format!(
            "<presence to='{}/{}'><x xmlns='{}'><history maxstanzas='0'/></x>{}</presence>",
            stanza::escape(room_jid),
            stanza::escape(nick),
            NS_MUC,
            limit
        );
        let body = self.inner.wrap(&session.sid, &presence);
        let response = self
            .inner
            .post(&session.url, body, self.inner.settings.request_timeout)
            .await?;
        Inner::check_terminate(&response)?;
        self.inner.dispatch(&response, session.generation);
        debug!("[Bosh] 已发送入群 presence: {}", room_jid);
        Ok(())
    }

    async fn fetch_participants(
        &self,
        room_jid: &str,
        timeout: Duration,
    ) -> Result<Vec<Participant>, SessionError> {
        let id = self.inner.next_id("participants");
        let iq = format!(
            "<iq type='get' id='{}' to='{}'><query xmlns='{}'/></iq>",
            id,
            stanza::escape(room_jid),
            NS_DISCO_ITEMS
        );
        let reply = self.inner.send_iq(id, iq, timeout).await?;
        let Some(query) = stanza::find(&reply, "query") else {
            return Ok(Vec::new());
        };
        Ok(stanza::children(query)
            .into_iter()
            .filter(|c| stanza::tag_name(c) == Some("item"))
            .filter_map(|item| {
                Some(Participant {
                    jid: stanza::attr(item, "jid")?,
                    name: stanza::attr(item, "name"),
                })
            })
            .collect())
    }

    fn hooks(&self) -> &TransportHooks {
        &self.inner.hooks
    }
}

impl Drop for BoshTransport {
    fn drop(&mut self) {
        self.inner.stop_poll();
    }
}
