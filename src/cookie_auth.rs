//! Refresh-on-401 for HttpOnly-cookie sessions.
//!
//! The session cookies are invisible to the client, so an expired session
//! only shows up as a 401. The first 401 triggers one refresh call through
//! the same client; concurrent 401s park on the queue and are replayed once
//! the refresh settles. A replayed request that fails with 401 again is
//! surfaced as-is.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use reqwest::Method;

use crate::{
    interceptor::{Recovery, ResponseInterceptor},
    queue::{PendingQueue, QueueOptions},
    token::SessionStore,
    ClientOptions, HttpClient, HttpError, RequestConfig,
};

const UNAUTHORIZED: u16 = 401;

struct Shared {
    session: Arc<dyn SessionStore>,
    queue: PendingQueue<RequestConfig>,
    refreshing: Mutex<bool>,
    refresh_url: String,
}

pub struct CookieAuthInterceptor {
    shared: Arc<Shared>,
    options: ClientOptions,
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CookieAuthInterceptor {
    pub fn new(session: Arc<dyn SessionStore>, options: ClientOptions) -> Self {
        let queue = PendingQueue::new(QueueOptions {
            max_size: options.queue_max_size,
            timeout_ms: options.queue_timeout_ms,
        });
        Self {
            shared: Arc::new(Shared {
                session,
                queue,
                refreshing: Mutex::new(false),
                refresh_url: options.refresh_url.clone(),
            }),
            options,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        *lock(&self.shared.refreshing)
    }

    fn handles(&self, config: &RequestConfig, error: &HttpError) -> bool {
        error.status() == Some(UNAUTHORIZED)
            && !config.skip_auth
            && !config.cookie_auth_retry
            && !self.options.is_whitelisted(&config.url)
    }

    async fn refresh(shared: Arc<Shared>, client: HttpClient) {
        #[cfg(feature = "tracing")]
        tracing::debug!(url = %shared.refresh_url, "refreshing cookie session");

        let request = RequestConfig::new(Method::POST, shared.refresh_url.clone()).skip_auth(true);
        let outcome = client.execute(request).await;

        let mut refreshing = lock(&shared.refreshing);
        match outcome {
            // Cookies were rotated server-side; nothing to rewrite.
            Ok(_) => shared.queue.resolve_all(|config| config),
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "cookie session refresh failed");
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
impl ResponseInterceptor for CookieAuthInterceptor {
    async fn on_error(
        &self,
        client: &HttpClient,
        mut config: RequestConfig,
        error: HttpError,
    ) -> Recovery {
        if !self.handles(&config, &error) {
            return Recovery::Propagate(error);
        }
        config.cookie_auth_retry = true;

        let waiter = {
            let mut refreshing = lock(&self.shared.refreshing);
            let waiter = self.shared.queue.enqueue(config);
            if !*refreshing {
                *refreshing = true;
                tokio::spawn(Self::refresh(Arc::clone(&self.shared), client.clone()));
            }
            waiter
        };

        match waiter.await {
            Ok(config) => Recovery::Handled(client.execute(config).await),
            Err(err) => Recovery::Handled(Err(err)),
        }
    }
}
