//! 会话认证
//!
//! 负责在建立传输前准备凭证（引导 nonce / OAuth / 密码），以及两类 token 的刷新：
//! 短期 API token（`/session/token`）与 OAuth access token（`grant_type=refresh_token`）。

use crate::im::config::{ClientConfig, OAuthSettings};
use crate::im::error::SessionError;
use crate::im::serialization::generate_operation_id;
use crate::im::types::{handle_http_response, HttpError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 在组件之间共享的 API token，变更可被订阅
#[derive(Clone)]
pub struct SharedToken {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl SharedToken {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, token: Option<String>) {
        self.tx.send_replace(token);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for SharedToken {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedToken")
            .field("present", &self.tx.borrow().is_some())
            .finish()
    }
}

/// 会话引导响应
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapData {
    pub nonce: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub bind_url: Option<String>,
}

/// 建立传输所需的凭证
#[derive(Debug, Clone)]
pub enum SessionCredentials {
    /// 服务器下发的一次性 nonce
    Nonce {
        jid: String,
        nonce: String,
        route: Option<String>,
        bind_url: Option<String>,
    },
    /// OAuth access token（SASL X-OAUTH2）
    OAuth { jid: String, access_token: String },
    /// 用户名密码（SASL PLAIN）
    Password { jid: String, password: String },
}

impl SessionCredentials {
    pub fn jid(&self) -> &str {
        match self {
            SessionCredentials::Nonce { jid, .. }
            | SessionCredentials::OAuth { jid, .. }
            | SessionCredentials::Password { jid, .. } => jid,
        }
    }

    /// 引导数据中可能覆盖的 BOSH 地址
    pub fn bind_url(&self) -> Option<&str> {
        match self {
            SessionCredentials::Nonce { bind_url, .. } => bind_url.as_deref(),
            _ => None,
        }
    }
}

/// 短期 API token
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiToken {
    pub access_token: String,
    /// 有效期（秒）
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth token 端点的成功响应
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// 会话认证抽象，连接状态机只依赖这个 trait
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// 准备一次连接尝试的凭证；nonce 认证每次都重新引导
    async fn session_credentials(&self) -> Result<SessionCredentials, SessionError>;

    /// 获取新的短期 API token
    async fn refresh_api_token(&self) -> Result<ApiToken, SessionError>;

    fn uses_oauth(&self) -> bool {
        false
    }

    /// OAuth access token 是否已超过刷新间隔
    fn oauth_token_expired(&self) -> bool {
        false
    }

    /// 刷新 OAuth access token；`invalid_grant` 返回 [`SessionError::SignOutRequired`]
    async fn refresh_oauth_token(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct OAuthState {
    settings: OAuthSettings,
    access_token: Option<String>,
    obtained_at: Option<Instant>,
}

/// 基于 HTTP 的认证实现
pub struct HttpAuthenticator {
    http: reqwest::Client,
    jid: String,
    bootstrap_url: Option<String>,
    api_base_url: String,
    password: Option<String>,
    oauth: Option<Mutex<OAuthState>>,
    oauth_refresh_interval: Duration,
    request_timeout: Duration,
    api_token: SharedToken,
}

impl HttpAuthenticator {
    pub fn new(http: reqwest::Client, config: &ClientConfig, api_token: SharedToken) -> Self {
        let oauth = config.oauth.clone().map(|settings| {
            let access_token = settings.access_token.clone();
            Mutex::new(OAuthState {
                obtained_at: access_token.as_ref().map(|_| Instant::now()),
                access_token,
                settings,
            })
        });
        Self {
            http,
            jid: config.jid.clone(),
            bootstrap_url: config.bootstrap_url.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            password: config.password.clone(),
            oauth,
            oauth_refresh_interval: config.connection.oauth_refresh_interval(),
            request_timeout: config.connection.request_timeout(),
            api_token,
        }
    }

    fn oauth_access_token(&self) -> Option<String> {
        let oauth = self.oauth.as_ref()?;
        let state = oauth.lock().ok()?;
        state.access_token.clone()
    }

    async fn bootstrap(&self, url: &str) -> Result<BootstrapData, SessionError> {
        let operation_id = generate_operation_id();
        info!("[Auth] 🔐 请求会话引导");
        debug!("[Auth]   URL: {}, 操作ID: {}", url, operation_id);

        let response = self
            .http
            .get(url)
            .header("operationID", &operation_id)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_request_error)?;

        let data: BootstrapData = handle_http_response(response, "会话引导")
            .await
            .map_err(|e| SessionError::Bootstrap(e.to_string()))?;
        if data.nonce.is_empty() {
            return Err(SessionError::Bootstrap("引导响应缺少 nonce".to_string()));
        }
        Ok(data)
    }
}

#[async_trait]
impl SessionAuthenticator for HttpAuthenticator {
    async fn session_credentials(&self) -> Result<SessionCredentials, SessionError> {
        if let Some(url) = &self.bootstrap_url {
            let data = self.bootstrap(url).await?;
            return Ok(SessionCredentials::Nonce {
                jid: self.jid.clone(),
                nonce: data.nonce,
                route: data.route,
                bind_url: data.bind_url,
            });
        }

        if self.oauth.is_some() {
            if self.oauth_access_token().is_none() {
                self.refresh_oauth_token().await?;
            }
            let access_token = self
                .oauth_access_token()
                .ok_or(SessionError::SignOutRequired)?;
            return Ok(SessionCredentials::OAuth {
                jid: self.jid.clone(),
                access_token,
            });
        }

        match &self.password {
            Some(password) => Ok(SessionCredentials::Password {
                jid: self.jid.clone(),
                password: password.clone(),
            }),
            None => Err(SessionError::Bootstrap(
                "未配置引导地址、OAuth 或密码".to_string(),
            )),
        }
    }

    async fn refresh_api_token(&self) -> Result<ApiToken, SessionError> {
        let url = format!("{}/session/token", self.api_base_url);
        let operation_id = generate_operation_id();
        debug!("[Auth] 🔄 刷新 API token, 操作ID: {}", operation_id);

        let mut request = self
            .http
            .get(&url)
            .header("operationID", &operation_id)
            .timeout(self.request_timeout);
        if let Some(bearer) = self.oauth_access_token().or_else(|| self.api_token.get()) {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await.map_err(map_request_error)?;
        let token: ApiToken = handle_http_response(response, "刷新 API token")
            .await
            .map_err(|e| match e {
                HttpError::Status(failure) if failure.status == 401 => SessionError::AuthFail {
                    condition: crate::im::error::Condition::NotAuthorized,
                },
                other => SessionError::Bootstrap(other.to_string()),
            })?;

        info!(
            "[Auth] ✅ API token 已刷新, 有效期: {:?} 秒",
            token.expires_in
        );
        Ok(token)
    }

    fn uses_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    fn oauth_token_expired(&self) -> bool {
        let Some(oauth) = &self.oauth else {
            return false;
        };
        let Ok(state) = oauth.lock() else {
            return true;
        };
        match (&state.access_token, state.obtained_at) {
            (Some(_), Some(at)) => at.elapsed() >= self.oauth_refresh_interval,
            _ => true,
        }
    }

    async fn refresh_oauth_token(&self) -> Result<(), SessionError> {
        let Some(oauth) = &self.oauth else {
            return Ok(());
        };
        let settings = oauth
            .lock()
            .map_err(|_| SessionError::Protocol("OAuth 状态锁已损坏".to_string()))?
            .settings
            .clone();

        info!("[Auth] 🔄 刷新 OAuth access token");
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", settings.refresh_token.clone()),
            ("client_id", settings.client_id.clone()),
        ];
        if let Some(secret) = &settings.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&settings.token_url)
            .header("operationID", generate_operation_id())
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await
            .map_err(map_request_error)?;

        let token: OAuthToken = match handle_http_response(response, "刷新 OAuth token").await {
            Ok(token) => token,
            Err(HttpError::Status(failure)) => {
                if let Ok(body) = serde_json::from_str::<OAuthErrorBody>(&failure.body) {
                    if body.error == "invalid_grant" {
                        warn!(
                            "[Auth] ❌ refresh token 已失效: {}",
                            body.error_description.unwrap_or_default()
                        );
                        return Err(SessionError::SignOutRequired);
                    }
                }
                return Err(SessionError::Bootstrap(format!(
                    "OAuth 刷新失败 {}",
                    failure
                )));
            }
            Err(other) => return Err(SessionError::Bootstrap(other.to_string())),
        };

        let mut state = oauth
            .lock()
            .map_err(|_| SessionError::Protocol("OAuth 状态锁已损坏".to_string()))?;
        state.access_token = Some(token.access_token);
        state.obtained_at = Some(Instant::now());
        if let Some(refresh_token) = token.refresh_token {
            state.settings.refresh_token = refresh_token;
        }
        info!("[Auth] ✅ OAuth access token 已刷新");
        Ok(())
    }
}

fn map_request_error(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::Timeout
    } else {
        SessionError::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ClientConfig {
        ClientConfig {
            jid: "1_7@chat.localhost".to_string(),
            api_base_url: format!("{}/api", server.uri()),
            ..ClientConfig::default()
        }
    }

    fn oauth_settings(server: &MockServer) -> OAuthSettings {
        OAuthSettings {
            token_url: format!("{}/oauth/token", server.uri()),
            client_id: "desktop".to_string(),
            refresh_token: "rt-1".to_string(),
            ..OAuthSettings::default()
        }
    }

    #[tokio::test]
    async fn nonce_bootstrap_runs_on_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bootstrap"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nonce": "n-123",
                "route": "xmpp:chat.localhost:5222",
                "bindUrl": "https://bosh.example/http-bind"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.bootstrap_url = Some(format!("{}/bootstrap", server.uri()));
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, SharedToken::default());

        for _ in 0..2 {
            match auth.session_credentials().await.unwrap() {
                SessionCredentials::Nonce {
                    nonce, bind_url, ..
                } => {
                    assert_eq!(nonce, "n-123");
                    assert_eq!(bind_url.as_deref(), Some("https://bosh.example/http-bind"));
                }
                other => panic!("unexpected credentials {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn bootstrap_failure_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bootstrap"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.bootstrap_url = Some(format!("{}/bootstrap", server.uri()));
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, SharedToken::default());

        let err = auth.session_credentials().await.unwrap_err();
        assert!(matches!(err, SessionError::Bootstrap(_)), "{err:?}");
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn password_credentials_without_bootstrap() {
        let server = MockServer::start().await;
        let mut config = config_for(&server);
        config.password = Some("secret".to_string());
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, SharedToken::default());

        let creds = auth.session_credentials().await.unwrap();
        assert!(matches!(creds, SessionCredentials::Password { .. }));
        assert_eq!(creds.jid(), "1_7@chat.localhost");
    }

    #[tokio::test]
    async fn api_token_refresh_uses_current_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/session/token"))
            .and(header("authorization", "Bearer old-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "new-token",
                "expiresIn": 900
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_for(&server);
        let shared = SharedToken::new(Some("old-token".to_string()));
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, shared);

        let token = auth.refresh_api_token().await.unwrap();
        assert_eq!(token.access_token, "new-token");
        assert_eq!(token.expires_in, Some(900));
    }

    #[tokio::test]
    async fn oauth_refresh_replaces_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-2",
                "refresh_token": "rt-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.oauth = Some(oauth_settings(&server));
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, SharedToken::default());
        assert!(auth.uses_oauth());
        assert!(auth.oauth_token_expired());

        let creds = auth.session_credentials().await.unwrap();
        match creds {
            SessionCredentials::OAuth { access_token, .. } => assert_eq!(access_token, "at-2"),
            other => panic!("unexpected credentials {other:?}"),
        }
        assert!(!auth.oauth_token_expired());
    }

    #[tokio::test]
    async fn invalid_grant_requires_sign_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.oauth = Some(oauth_settings(&server));
        let auth = HttpAuthenticator::new(reqwest::Client::new(), &config, SharedToken::default());

        let err = auth.refresh_oauth_token().await.unwrap_err();
        assert!(matches!(err, SessionError::SignOutRequired));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn shared_token_notifies_subscribers() {
        let token = SharedToken::new(None);
        let mut rx = token.subscribe();
        token.set(Some("t-1".to_string()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_deref(), Some("t-1"));
        assert_eq!(token.get().as_deref(), Some("t-1"));
    }
}
