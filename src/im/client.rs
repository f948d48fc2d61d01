//! 客户端核心实现模块
//!
//! [`ChatClient`] 组装配置、本地存储、传输层、连接状态机、两个缓存同步器与已读位置引擎。
//! 每次（重）连接成功后在后台同步联系人与房间，并恢复已读位置同步。

use crate::im::auth::{HttpAuthenticator, SessionAuthenticator, SharedToken};
use crate::im::config::ClientConfig;
use crate::im::connection::{
    ConnectionManager, ConnectionStatus, EmptySessionListener, SessionListener, SessionState,
};
use crate::im::error::{ReadStateError, SessionError, SyncError};
use crate::im::readstate::{ReadStateEngine, ReadStateListener, ReadStateStatus};
use crate::im::rooms::{JoinedRoom, RoomJoiner};
use crate::im::serialization::CacheCodec;
use crate::im::store::{KvStore, ScopedStore, SqliteStore};
use crate::im::sync::api::DiffSyncApi;
use crate::im::sync::{CacheSnapshot, CacheSyncer, Contact, Room, SyncListener, SyncOutcome};
use crate::im::transport::bosh::BoshSettings;
use crate::im::transport::{BoshTransport, Transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 聊天客户端
pub struct ChatClient {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    contacts: CacheSyncer<Contact>,
    rooms: CacheSyncer<Room>,
    read_state: Arc<ReadStateEngine>,
    room_joiner: RoomJoiner,
    session_listener: RwLock<Arc<dyn SessionListener>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// 使用 SQLite 本地存储创建客户端
    pub async fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let store = SqliteStore::open(&config.db_url, config.store_quota_bytes)
            .await
            .with_context(|| format!("打开本地数据库失败: {}", config.db_url))?;
        Self::with_store(config, Arc::new(store)).await
    }

    /// 使用指定的键值存储创建客户端
    pub async fn with_store(config: ClientConfig, store: Arc<dyn KvStore>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .build()
            .context("创建 HTTP 客户端失败")?;
        let api_token = SharedToken::new(config.api_token.clone());
        let transport: Arc<dyn Transport> = Arc::new(BoshTransport::new(
            http.clone(),
            BoshSettings {
                url: config.bosh_url.clone(),
                domain: config.domain.clone(),
                request_timeout: config.connection.request_timeout(),
                ..BoshSettings::default()
            },
        ));
        let authenticator: Arc<dyn SessionAuthenticator> =
            Arc::new(HttpAuthenticator::new(http.clone(), &config, api_token.clone()));
        Self::with_parts(config, store, http, transport, authenticator, api_token).await
    }

    pub(crate) async fn with_parts(
        config: ClientConfig,
        store: Arc<dyn KvStore>,
        http: reqwest::Client,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn SessionAuthenticator>,
        api_token: SharedToken,
    ) -> Result<Arc<Self>> {
        info!(
            "[Client] 🚀 初始化客户端: user={}, group={}",
            config.user_id, config.group_id
        );
        let store: Arc<dyn KvStore> = Arc::new(
            ScopedStore::open(store, &config.user_id, &config.group_id)
                .await
                .context("打开用户存储失败")?,
        );

        let connection = ConnectionManager::new(
            config.connection.clone(),
            transport.clone(),
            authenticator,
            api_token.clone(),
        );
        let diff_api = Arc::new(DiffSyncApi::new(
            http.clone(),
            config.api_base_url.clone(),
            api_token.clone(),
            config.sync.gzip_threshold_bytes,
            config.sync.request_timeout(),
        ));
        let contacts = CacheSyncer::new(
            config.sync.clone(),
            connection.clone(),
            diff_api.clone(),
            store.clone(),
            CacheCodec::GzipJson,
        );
        let rooms = CacheSyncer::new(
            config.sync.clone(),
            connection.clone(),
            diff_api,
            store.clone(),
            CacheCodec::GzipJson,
        );
        let read_state = ReadStateEngine::open(
            config.read_state.clone(),
            http,
            config.api_base_url.clone(),
            api_token,
            store,
        )
        .await;
        let room_joiner = RoomJoiner::new(transport, config.connection.request_timeout());

        let client = Arc::new(Self {
            config,
            connection,
            contacts,
            rooms,
            read_state,
            room_joiner,
            session_listener: RwLock::new(Arc::new(EmptySessionListener)),
            background: Mutex::new(None),
        });
        client.connection.set_listener(Arc::new(SessionBridge {
            client: Arc::downgrade(&client),
        }));
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // 监听器
    // ---------------------------------------------------------------------

    pub fn set_session_listener(&self, listener: Arc<dyn SessionListener>) {
        match self.session_listener.write() {
            Ok(mut slot) => *slot = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    fn session_listener(&self) -> Arc<dyn SessionListener> {
        match self.session_listener.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 同一个监听器同时接收联系人与房间的同步事件
    pub fn set_sync_listener(&self, listener: Arc<dyn SyncListener>) {
        self.contacts.set_listener(listener.clone());
        self.rooms.set_listener(listener);
    }

    pub fn set_read_state_listener(&self, listener: Arc<dyn ReadStateListener>) {
        self.read_state.set_listener(listener);
    }

    // ---------------------------------------------------------------------
    // 会话
    // ---------------------------------------------------------------------

    /// 建立连接；连接成功后在后台同步缓存与已读位置
    pub async fn start(&self) -> Result<(), SessionError> {
        info!("[Client] 🔗 正在连接服务器...");
        self.connection.connect().await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.connection.reconnect(true).await
    }

    /// 断开连接并禁止自动重连
    pub async fn disconnect(&self) {
        self.connection.disconnect(false).await;
    }

    /// 停止所有后台任务并断开连接
    pub async fn shutdown(&self) {
        info!("[Client] 👋 关闭客户端");
        if let Some(handle) = self.take_background() {
            handle.abort();
        }
        self.read_state.stop();
        self.connection.disconnect(false).await;
    }

    pub fn session_state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    // ---------------------------------------------------------------------
    // 缓存同步
    // ---------------------------------------------------------------------

    pub async fn sync_contacts(&self) -> Result<SyncOutcome<Contact>, SyncError> {
        self.contacts.sync().await
    }

    pub async fn sync_rooms(&self) -> Result<SyncOutcome<Room>, SyncError> {
        self.rooms.sync().await
    }

    pub async fn contacts(&self) -> CacheSnapshot<Contact> {
        self.contacts.cached().await
    }

    pub async fn rooms(&self) -> CacheSnapshot<Room> {
        self.rooms.cached().await
    }

    pub async fn join_room(&self, room_jid: &str) -> Result<JoinedRoom, SessionError> {
        if !self.connection.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.room_joiner.join(room_jid).await
    }

    // ---------------------------------------------------------------------
    // 已读位置
    // ---------------------------------------------------------------------

    pub async fn update_read_position(
        &self,
        conversation: &str,
        message_id: &str,
        timestamp: i64,
    ) -> Result<(), ReadStateError> {
        self.read_state
            .update(conversation, message_id, timestamp)
            .await
    }

    pub async fn remove_read_position(&self, conversation: &str) -> Result<(), ReadStateError> {
        self.read_state.remove(conversation).await
    }

    pub fn read_state_status(&self) -> ReadStateStatus {
        self.read_state.status()
    }

    pub fn read_state(&self) -> &Arc<ReadStateEngine> {
        &self.read_state
    }

    // ---------------------------------------------------------------------
    // 后台同步
    // ---------------------------------------------------------------------

    fn take_background(&self) -> Option<JoinHandle<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// 上一轮同步可能仍有已读 PATCH 在途，新一轮等它结束后再开始，不中断它
    fn spawn_session_sync(self: &Arc<Self>, reconnected: bool) {
        let this = self.clone();
        let mut slot = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = slot.take();
        *slot = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    debug!("[Client] 上一轮会话同步未正常结束: {}", e);
                }
            }
            this.run_session_sync(reconnected).await;
        }));
    }

    async fn run_session_sync(&self, reconnected: bool) {
        debug!("[Client] 开始会话同步, reconnected={}", reconnected);
        let (contacts, rooms) =
            futures_util::future::join(self.contacts.sync(), self.rooms.sync()).await;
        match contacts {
            Ok(outcome) => info!(
                "[Client] 👥 联系人同步完成: {} 个 ({:?})",
                outcome.snapshot.len(),
                outcome.path
            ),
            Err(e) => warn!("[Client] 联系人同步失败: {}", e),
        }
        match rooms {
            Ok(outcome) => info!(
                "[Client] 🏠 房间同步完成: {} 个 ({:?})",
                outcome.snapshot.len(),
                outcome.path
            ),
            Err(e) => warn!("[Client] 房间同步失败: {}", e),
        }

        if reconnected {
            self.read_state.on_connection_restored();
        }
        let status = self.read_state.status();
        if !status.fetched && status.disabled.is_none() {
            if let Err(e) = self.read_state.fetch().await {
                warn!("[Client] 获取已读状态失败: {}", e);
            }
        }
    }
}

/// 连接事件桥：转发给调用方监听器，并在连接成功后触发同步
struct SessionBridge {
    client: Weak<ChatClient>,
}

#[async_trait]
impl SessionListener for SessionBridge {
    async fn on_status_changed(&self, status: ConnectionStatus) {
        if let Some(client) = self.client.upgrade() {
            client.session_listener().on_status_changed(status).await;
        }
    }

    async fn on_connected(&self, reconnected: bool) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        client.spawn_session_sync(reconnected);
        client.session_listener().on_connected(reconnected).await;
    }

    async fn on_connection_failed(&self, reason: String, fatal: bool) {
        if let Some(client) = self.client.upgrade() {
            client
                .session_listener()
                .on_connection_failed(reason, fatal)
                .await;
        }
    }

    async fn on_sign_out_required(&self) {
        if let Some(client) = self.client.upgrade() {
            client.read_state.stop();
            client.session_listener().on_sign_out_required().await;
        }
    }

    async fn on_api_token_refreshed(&self, token: String) {
        if let Some(client) = self.client.upgrade() {
            client.session_listener().on_api_token_refreshed(token).await;
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(handle) = self.take_background() {
            handle.abort();
        }
    }
}
