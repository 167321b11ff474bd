use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};

use crate::{HttpError, Result};

/// Access/refresh token pair with its expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    /// Absent in cookie-session mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as epoch milliseconds.
    pub expires: i64,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires <= now_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Where the bearer interceptor reads tokens from and the refresh flow writes them to.
pub trait TokenStore: Send + Sync {
    fn get_token(&self) -> Option<TokenRecord>;
    fn set_token(&self, token: TokenRecord);
    fn clear_token(&self);

    /// Formats an access token as an `Authorization` header value.
    fn format_token(&self, access_token: &str) -> String {
        normalize_bearer_authorization(access_token)
    }
}

/// Session-level operations triggered by the auth interceptors.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Exchanges a refresh token for a new token record.
    ///
    /// Cookie sessions never call this; the default fails with
    /// [`HttpError::SessionExpired`].
    async fn refresh_token(&self, refresh_token: String) -> Result<TokenRecord> {
        let _ = refresh_token;
        Err(HttpError::SessionExpired)
    }

    /// Drops the local session after an unrecoverable auth failure.
    fn log_out(&self);
}

/// In-process [`TokenStore`].
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: TokenRecord) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_token(&self) -> Option<TokenRecord> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: TokenRecord) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn clear_token(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshEnvelope {
    #[serde(default)]
    success: Option<bool>,
    data: Option<TokenRecord>,
    #[serde(default)]
    message: Option<String>,
}

/// [`SessionStore`] backed by the REST refresh-token endpoint.
///
/// Posts `{"refreshToken": ...}` and expects
/// `{"success": true, "data": {"accessToken", "refreshToken", "expires"}}`.
/// The call uses its own `reqwest::Client` so it never passes through the
/// auth interceptors. It is bounded by [`EndpointSession::timeout`],
/// 10 seconds unless overridden.
#[derive(Clone)]
pub struct EndpointSession {
    http: reqwest::Client,
    refresh_url: String,
    timeout: Duration,
    tokens: Arc<dyn TokenStore>,
    on_logout: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for EndpointSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSession")
            .field("refresh_url", &self.refresh_url)
            .field("timeout", &self.timeout)
            .field("on_logout", &self.on_logout.is_some())
            .finish_non_exhaustive()
    }
}

impl EndpointSession {
    pub fn new(refresh_url: impl Into<String>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            refresh_url: refresh_url.into(),
            timeout: Duration::from_millis(DEFAULT_REFRESH_TIMEOUT_MS),
            tokens,
            on_logout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `hook` after the local tokens are cleared on logout.
    pub fn on_logout(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_logout = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl SessionStore for EndpointSession {
    async fn refresh_token(&self, refresh_token: String) -> Result<TokenRecord> {
        let response = self
            .http
            .post(&self.refresh_url)
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HttpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: RefreshEnvelope = serde_json::from_str(&body).map_err(|err| {
            HttpError::Decode(format!("invalid refresh response JSON: {err}; body: {body}"))
        })?;
        if envelope.success == Some(false) {
            return Err(HttpError::Http {
                status: status.as_u16(),
                body: envelope.message.unwrap_or(body),
            });
        }
        envelope
            .data
            .ok_or_else(|| HttpError::Decode("refresh response has no data".to_owned()))
    }

    fn log_out(&self) {
        self.tokens.clear_token();
        if let Some(hook) = &self.on_logout {
            hook();
        }
    }
}

pub(crate) fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
