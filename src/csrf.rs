use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{
    cookie::{CookieStore, Jar},
    header::{HeaderName, HeaderValue},
    Url,
};

use crate::{
    interceptor::{is_idempotent, RequestInterceptor},
    HttpError, RequestConfig, Result,
};

/// Supplies the anti-forgery token for state-changing requests.
pub trait CsrfSource: Send + Sync {
    fn csrf_token(&self) -> Option<String>;
}

impl<F> CsrfSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn csrf_token(&self) -> Option<String> {
        self()
    }
}

/// Reads the CSRF token from a cookie the server set in the client's jar.
#[derive(Clone, Debug)]
pub struct CookieCsrfSource {
    jar: Arc<Jar>,
    url: Url,
    cookie_name: String,
}

impl CookieCsrfSource {
    pub fn new(jar: Arc<Jar>, url: Url, cookie_name: impl Into<String>) -> Self {
        Self {
            jar,
            url,
            cookie_name: cookie_name.into(),
        }
    }
}

impl CsrfSource for CookieCsrfSource {
    fn csrf_token(&self) -> Option<String> {
        let cookies = self.jar.cookies(&self.url)?;
        let cookies = cookies.to_str().ok()?;
        cookies
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.to_owned())
            .filter(|value| !value.is_empty())
    }
}

/// Stamps the CSRF header onto every non-idempotent request.
pub struct CsrfInterceptor {
    source: Arc<dyn CsrfSource>,
    header: HeaderName,
}

impl CsrfInterceptor {
    pub fn new(source: Arc<dyn CsrfSource>, header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|err| HttpError::InvalidHeader(format!("{header}: {err}")))?;
        Ok(Self { source, header })
    }
}

#[async_trait]
impl RequestInterceptor for CsrfInterceptor {
    async fn on_request(&self, mut config: RequestConfig) -> Result<RequestConfig> {
        if is_idempotent(&config.method) {
            return Ok(config);
        }
        let value = self
            .source
            .csrf_token()
            .and_then(|token| HeaderValue::from_str(&token).ok());
        if let Some(value) = value {
            config.headers.insert(self.header.clone(), value);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::{cookie::Jar, Method, Url};

    use super::{CookieCsrfSource, CsrfInterceptor, CsrfSource};
    use crate::{interceptor::RequestInterceptor, RequestConfig};

    fn interceptor(token: Option<&'static str>) -> CsrfInterceptor {
        let source = move || token.map(str::to_owned);
        CsrfInterceptor::new(Arc::new(source), "X-CSRF-Token").expect("valid header name")
    }

    #[tokio::test]
    async fn stamps_state_changing_requests() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let config = interceptor(Some("csrf-1"))
                .on_request(RequestConfig::new(method, "/orders"))
                .await
                .expect("never fails");
            assert_eq!(config.header("x-csrf-token"), Some("csrf-1"));
        }
    }

    #[tokio::test]
    async fn leaves_idempotent_requests_alone() {
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let config = interceptor(Some("csrf-1"))
                .on_request(RequestConfig::new(method, "/orders"))
                .await
                .expect("never fails");
            assert!(config.header("x-csrf-token").is_none());
        }
    }

    #[tokio::test]
    async fn missing_token_omits_header() {
        let config = interceptor(None)
            .on_request(RequestConfig::new(Method::POST, "/orders"))
            .await
            .expect("never fails");
        assert!(config.headers.is_empty());
    }

    #[test]
    fn cookie_source_picks_named_cookie() {
        let url = Url::parse("https://erp.example.com/").expect("valid url");
        let jar = Arc::new(Jar::default());
        jar.add_cookie_str("session=abc; Path=/", &url);
        jar.add_cookie_str("XSRF-TOKEN=tok-9; Path=/", &url);

        let source = CookieCsrfSource::new(jar, url, "XSRF-TOKEN");
        assert_eq!(source.csrf_token(), Some("tok-9".to_owned()));
    }

    #[test]
    fn rejects_invalid_header_name() {
        let source = || None::<String>;
        assert!(CsrfInterceptor::new(Arc::new(source), "bad header").is_err());
    }
}
