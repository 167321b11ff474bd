//! Interceptor seams of the request pipeline.
//!
//! Request interceptors run in registration order before dispatch. When
//! dispatch fails, response interceptors run in registration order until one
//! of them handles the error. Any resubmission goes through
//! [`HttpClient::execute`], so it passes the full chain again.

use async_trait::async_trait;
use reqwest::Method;

use crate::{HttpClient, HttpError, HttpResponse, RequestConfig, Result};

/// Rewrites a request before it is dispatched.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, config: RequestConfig) -> Result<RequestConfig>;
}

/// Outcome of a [`ResponseInterceptor`].
#[derive(Debug)]
pub enum Recovery {
    /// Not handled here; the next interceptor sees the error.
    Propagate(HttpError),
    /// Final outcome, typically from resubmitting the request.
    Handled(Result<HttpResponse>),
}

/// Reacts to a failed dispatch.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_error(
        &self,
        client: &HttpClient,
        config: RequestConfig,
        error: HttpError,
    ) -> Recovery;
}

/// GET, HEAD and OPTIONS, compared case-insensitively.
pub fn is_idempotent(method: &Method) -> bool {
    ["GET", "HEAD", "OPTIONS"]
        .iter()
        .any(|name| method.as_str().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use reqwest::Method;

    use super::is_idempotent;

    #[test]
    fn idempotent_methods_ignore_case() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(is_idempotent(
            &Method::from_bytes(b"get").expect("extension method")
        ));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::PATCH));
    }
}
