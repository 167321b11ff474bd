use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::{
    error::FailureCode,
    interceptor::{is_idempotent, Recovery, ResponseInterceptor},
    ClientOptions, HttpClient, HttpError, RequestConfig,
};

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Delay before retry number `attempt` (zero-based) with the default policy:
/// `min(1000 * 2^attempt, 10000)` ms.
pub fn retry_delay(attempt: u32) -> Duration {
    backoff(DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, attempt)
}

fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

/// Which failures are retried and how long to wait between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failure classes never retried, whatever their shape.
    pub excluded: Vec<FailureCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            excluded: vec![
                FailureCode::Cancelled,
                FailureCode::Auth,
                FailureCode::Queue,
                FailureCode::Decode,
                FailureCode::Config,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn from_options(options: &ClientOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay_ms: options.retry_backoff_ms,
            max_delay_ms: options.max_retry_backoff_ms,
            ..Self::default()
        }
    }

    /// Only connectivity failures of idempotent requests qualify. A failure
    /// that carries an HTTP response (4xx, 5xx) is never retried here, whatever
    /// its body says.
    pub fn should_retry(&self, method: &Method, error: &HttpError) -> bool {
        if !is_idempotent(method) || error.has_response() {
            return false;
        }
        !self.excluded.contains(&error.code())
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        backoff(self.base_delay_ms, self.max_delay_ms, attempt)
    }
}

/// Resubmits idempotent requests after network-level failures.
#[derive(Clone, Debug, Default)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ResponseInterceptor for RetryInterceptor {
    async fn on_error(
        &self,
        client: &HttpClient,
        mut config: RequestConfig,
        error: HttpError,
    ) -> Recovery {
        if !self.policy.should_retry(&config.method, &error)
            || config.retry_count >= self.policy.max_retries
        {
            return Recovery::Propagate(error);
        }

        let delay = self.policy.delay(config.retry_count);
        config.retry_count += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %config.url,
            attempt = config.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying request"
        );

        tokio::time::sleep(delay).await;
        Recovery::Handled(client.execute(config).await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;

    use super::{retry_delay, RetryPolicy};
    use crate::HttpError;

    async fn connection_refused() -> HttpError {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("local addr");
        drop(listener);
        reqwest::Client::new()
            .get(format!("http://{address}/"))
            .send()
            .await
            .expect_err("nothing listens on the port")
            .into()
    }

    fn status(status: u16) -> HttpError {
        HttpError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_millis(1_000));
        assert_eq!(retry_delay(1), Duration::from_millis(2_000));
        assert_eq!(retry_delay(3), Duration::from_millis(8_000));
        assert_eq!(retry_delay(4), Duration::from_millis(10_000));
        assert_eq!(retry_delay(10), Duration::from_millis(10_000));
        assert_eq!(retry_delay(200), Duration::from_millis(10_000));
    }

    #[test]
    fn policy_delay_matches_default_formula() {
        let policy = RetryPolicy::default();
        for attempt in 0..12u32 {
            let expected = (1_000u64 * 2u64.pow(attempt)).min(10_000);
            assert_eq!(
                policy.delay(attempt as usize),
                Duration::from_millis(expected)
            );
        }
    }

    #[tokio::test]
    async fn never_retries_state_changing_methods() {
        let policy = RetryPolicy::default();
        let network = connection_refused().await;
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert!(!policy.should_retry(&method, &network));
            assert!(!policy.should_retry(&method, &status(500)));
        }
    }

    #[tokio::test]
    async fn retries_idempotent_methods_without_response() {
        let policy = RetryPolicy::default();
        let network = connection_refused().await;
        assert!(!network.has_response());
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(policy.should_retry(&method, &network));
        }
    }

    #[test]
    fn never_retries_when_server_answered() {
        let policy = RetryPolicy::default();
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(!policy.should_retry(&method, &status(404)));
            assert!(!policy.should_retry(&method, &status(500)));
        }
    }

    #[test]
    fn response_body_mentioning_timeout_is_not_retried() {
        let policy = RetryPolicy::default();
        for status in [500, 504] {
            let error = HttpError::Http {
                status,
                body: r#"{"message":"database query timeout"}"#.to_owned(),
            };
            assert!(!policy.should_retry(&Method::GET, &error));
        }
    }

    #[test]
    fn local_timeout_is_retried() {
        let policy = RetryPolicy::default();
        let error = HttpError::Timeout { timeout_ms: 50 };
        assert!(!error.has_response());
        assert!(policy.should_retry(&Method::GET, &error));
    }

    #[test]
    fn excluded_codes_are_not_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&Method::GET, &HttpError::Cancelled));
        assert!(!policy.should_retry(
            &Method::GET,
            &HttpError::QueueTimeout { timeout_ms: 10 }
        ));
        assert!(!policy.should_retry(&Method::GET, &HttpError::SessionExpired));
    }
}
