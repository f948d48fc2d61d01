//! 客户端配置
//!
//! 所有时长以整数秒 / 毫秒保存，便于 TOML 与环境变量覆盖；
//! 通过对应的访问方法换算为 [`Duration`]。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 环境变量前缀，例如 `CHAT_SYNC__USER_ID`
pub const ENV_PREFIX: &str = "CHAT_SYNC";

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 用户 ID
    pub user_id: String,
    /// 组织（group）ID，与用户 ID 一起决定本地存储的归属
    pub group_id: String,
    /// XMPP JID
    pub jid: String,
    /// XMPP 域
    pub domain: String,
    /// BOSH 绑定地址
    pub bosh_url: String,
    /// HTTP API 基础地址（差异同步、已读位置、token）
    pub api_base_url: String,
    /// 会话引导地址；配置后使用服务器下发的 nonce 认证
    pub bootstrap_url: Option<String>,
    /// 密码认证（无引导、无 OAuth 时使用）
    pub password: Option<String>,
    /// 初始 API token
    pub api_token: Option<String>,
    pub oauth: Option<OAuthSettings>,
    /// 本地 SQLite 数据库 URL，例如 `sqlite://chat-sync.db?mode=rwc`
    pub db_url: String,
    /// 本地存储配额（字节），`None` 表示不限制
    pub store_quota_bytes: Option<u64>,
    pub connection: ConnectionTimings,
    pub sync: SyncSettings,
    pub read_state: ReadStateSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            group_id: String::new(),
            jid: String::new(),
            domain: "chat.localhost".to_string(),
            bosh_url: "http://localhost:5280/http-bind".to_string(),
            api_base_url: "http://localhost:8080/api".to_string(),
            bootstrap_url: None,
            password: None,
            api_token: None,
            oauth: None,
            db_url: "sqlite://chat-sync.db?mode=rwc".to_string(),
            store_quota_bytes: Some(5 * 1024 * 1024),
            connection: ConnectionTimings::default(),
            sync: SyncSettings::default(),
            read_state: ReadStateSettings::default(),
        }
    }
}

impl ClientConfig {
    /// 加载配置：可选的 TOML 文件 + `CHAT_SYNC__*` 环境变量（后者优先）
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("构建配置失败")?;
        let parsed: ClientConfig = cfg.try_deserialize().context("解析配置失败")?;
        Ok(parsed)
    }
}

/// OAuth 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub refresh_token: String,
    /// 启动时已有的 access token；缺省时首次连接前会先刷新
    pub access_token: Option<String>,
    pub expires_in_secs: Option<u64>,
}

/// 连接状态机相关的时长与次数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionTimings {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_factor: f64,
    /// 连续失败达到该次数后重置退避并上报不可恢复
    pub max_reconnect_attempts: u32,
    /// 重连计时器在协商的空闲间隔之外额外容忍的延迟
    pub latency_grace_secs: u64,
    /// 传输层静默多久后发送 ping
    pub ping_grace_secs: u64,
    pub ping_timeout_secs: u64,
    /// 握手与单次请求超时
    pub request_timeout_secs: u64,
    /// API token 在过期前多久刷新
    pub api_token_refresh_margin_secs: u64,
    /// 未知过期时间时的刷新间隔
    pub api_token_default_lifetime_secs: u64,
    pub api_token_retry_base_ms: u64,
    pub api_token_retry_max_ms: u64,
    pub oauth_refresh_interval_secs: u64,
    pub oauth_max_attempts: u32,
    pub oauth_retry_base_ms: u64,
    pub oauth_retry_max_ms: u64,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_factor: 3.0,
            max_reconnect_attempts: 5,
            latency_grace_secs: 10,
            ping_grace_secs: 30,
            ping_timeout_secs: 10,
            request_timeout_secs: 20,
            api_token_refresh_margin_secs: 60,
            api_token_default_lifetime_secs: 15 * 60,
            api_token_retry_base_ms: 5_000,
            api_token_retry_max_ms: 5 * 60 * 1_000,
            oauth_refresh_interval_secs: 60 * 60,
            oauth_max_attempts: 5,
            oauth_retry_base_ms: 1_000,
            oauth_retry_max_ms: 60_000,
        }
    }
}

impl ConnectionTimings {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn latency_grace(&self) -> Duration {
        Duration::from_secs(self.latency_grace_secs)
    }

    pub fn ping_grace(&self) -> Duration {
        Duration::from_secs(self.ping_grace_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn api_token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.api_token_refresh_margin_secs)
    }

    pub fn api_token_default_lifetime(&self) -> Duration {
        Duration::from_secs(self.api_token_default_lifetime_secs)
    }

    pub fn oauth_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.oauth_refresh_interval_secs)
    }
}

/// 缓存同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 距上次（重）连接在该窗口内才走哈希快速路径
    pub fast_path_window_secs: u64,
    pub max_diff_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_factor: f64,
    /// 差异同步请求体超过该字节数时 gzip 压缩
    pub gzip_threshold_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fast_path_window_secs: 3 * 60,
            max_diff_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            retry_factor: 3.0,
            gzip_threshold_bytes: 10 * 1024,
            request_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn fast_path_window(&self) -> Duration {
        Duration::from_secs(self.fast_path_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 已读位置同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadStateSettings {
    pub debounce_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_factor: f64,
    pub request_timeout_secs: u64,
    /// GET 时附带 `expand=items.unreadCount`
    pub expand_unread_count: bool,
}

impl Default for ReadStateSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            retry_base_ms: 1_000,
            retry_max_ms: 5 * 60 * 1_000,
            retry_factor: 3.0,
            request_timeout_secs: 20,
            expand_unread_count: true,
        }
    }
}

impl ReadStateSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
