//! Bearer-token auth with single-flight refresh.
//!
//! Requests observing an expired access token are parked on a
//! [`PendingQueue`]. One refresh task runs per expiry event; when it settles
//! the whole batch is re-stamped with the new token or rejected together.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};

use crate::{
    interceptor::RequestInterceptor,
    queue::{PendingQueue, QueueOptions},
    token::{SessionStore, TokenStore},
    ClientOptions, HttpError, RequestConfig, Result,
};

struct Shared {
    tokens: Arc<dyn TokenStore>,
    session: Arc<dyn SessionStore>,
    queue: PendingQueue<RequestConfig>,
    /// Refresh in flight. Checked, set and cleared together with queue
    /// mutations under this lock.
    refreshing: Mutex<bool>,
    /// Upper bound on one session refresh, so a stalled refresh endpoint
    /// cannot keep `refreshing` set.
    refresh_timeout_ms: u64,
}

pub struct BearerAuthInterceptor {
    shared: Arc<Shared>,
    options: ClientOptions,
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BearerAuthInterceptor {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        session: Arc<dyn SessionStore>,
        options: ClientOptions,
    ) -> Self {
        let queue = PendingQueue::new(QueueOptions {
            max_size: options.queue_max_size,
            timeout_ms: options.queue_timeout_ms,
        });
        Self {
            shared: Arc::new(Shared {
                tokens,
                session,
                queue,
                refreshing: Mutex::new(false),
                refresh_timeout_ms: options.timeout_ms,
            }),
            options,
        }
    }

    /// Requests currently parked behind a refresh.
    pub fn pending(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn is_refreshing(&self) -> bool {
        *lock(&self.shared.refreshing)
    }

    fn authorization(tokens: &dyn TokenStore, access_token: &str) -> Result<HeaderValue> {
        let formatted = tokens.format_token(access_token);
        HeaderValue::from_str(&formatted)
            .map_err(|err| HttpError::InvalidHeader(format!("authorization: {err}")))
    }

    async fn refresh(shared: Arc<Shared>, refresh_token: String) {
        #[cfg(feature = "tracing")]
        tracing::debug!("refreshing access token");

        let timeout_ms = shared.refresh_timeout_ms;
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            shared.session.refresh_token(refresh_token),
        )
        .await
        .unwrap_or(Err(HttpError::Timeout { timeout_ms }));
        let outcome = outcome.and_then(|token| {
            let value = Self::authorization(shared.tokens.as_ref(), &token.access_token)?;
            Ok((token, value))
        });

        let mut refreshing = lock(&shared.refreshing);
        match outcome {
            Ok((token, value)) => {
                shared.tokens.set_token(token);
                shared.queue.resolve_all(|mut config| {
                    config.headers.insert(header::AUTHORIZATION, value.clone());
                    config
                });
                #[cfg(feature = "tracing")]
                tracing::debug!("access token refreshed");
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "access token refresh failed");
                shared
                    .queue
                    .reject_all(HttpError::RefreshFailed(Box::new(err)));
                shared.session.log_out();
            }
        }
        *refreshing = false;
    }
}

#[async_trait]
impl RequestInterceptor for BearerAuthInterceptor {
    async fn on_request(&self, mut config: RequestConfig) -> Result<RequestConfig> {
        if config.skip_auth || self.options.is_whitelisted(&config.url) {
            return Ok(config);
        }

        let waiter = {
            let mut refreshing = lock(&self.shared.refreshing);
            let Some(token) = self.shared.tokens.get_token() else {
                return Ok(config);
            };

            if !token.is_expired() {
                let value = Self::authorization(self.shared.tokens.as_ref(), &token.access_token)?;
                config.headers.insert(header::AUTHORIZATION, value);
                return Ok(config);
            }

            let Some(refresh_token) = token.refresh_token.filter(|value| !value.is_empty()) else {
                drop(refreshing);
                self.shared.session.log_out();
                return Err(HttpError::SessionExpired);
            };

            let waiter = self.shared.queue.enqueue(config);
            if !*refreshing {
                *refreshing = true;
                tokio::spawn(Self::refresh(Arc::clone(&self.shared), refresh_token));
            }
            waiter
        };

        waiter.await
    }
}
