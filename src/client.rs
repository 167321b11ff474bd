use std::{fmt, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use reqwest::{cookie::Jar, Method};
use serde::de::DeserializeOwned;

use crate::{
    auth::BearerAuthInterceptor,
    cookie_auth::CookieAuthInterceptor,
    csrf::{CsrfInterceptor, CsrfSource},
    interceptor::{Recovery, RequestInterceptor, ResponseInterceptor},
    retry::{RetryInterceptor, RetryPolicy},
    token::{SessionStore, TokenStore},
    ClientOptions, HttpError, HttpResponse, RequestConfig, RequestOptions, Result,
};

/// Global hook for failures that reach the caller, cancellations excluded.
pub type ErrorHandler = Arc<dyn Fn(&HttpError) + Send + Sync>;

/// Joins a relative request path onto the base URL. Absolute URLs pass through.
pub fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }
    let base = base_url.trim_end_matches('/');
    let path = url.trim_start_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{path}")
    }
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    options: ClientOptions,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    error_handler: Option<ErrorHandler>,
}

/// HTTP client running every request through the interceptor pipeline.
///
/// Cloning is cheap and clones share interceptor state (refresh flag,
/// pending queue).
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.inner.base_url)
            .field("options", &self.inner.options)
            .field("request_interceptors", &self.inner.request_interceptors.len())
            .field("response_interceptors", &self.inner.response_interceptors.len())
            .finish()
    }
}

enum AuthMode {
    Anonymous,
    Bearer {
        tokens: Arc<dyn TokenStore>,
        session: Arc<dyn SessionStore>,
    },
    Cookie {
        session: Arc<dyn SessionStore>,
    },
}

/// Assembles an [`HttpClient`] and its interceptor chains.
///
/// Request chain: CSRF, bearer auth, then custom interceptors.
/// Error chain: retry, cookie auth, then custom interceptors.
pub struct HttpClientBuilder {
    base_url: String,
    options: ClientOptions,
    http: Option<reqwest::Client>,
    jar: Option<Arc<Jar>>,
    auth: AuthMode,
    csrf: Option<Arc<dyn CsrfSource>>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    error_handler: Option<ErrorHandler>,
}

impl HttpClientBuilder {
    /// Applies timeout, retry, queue and auth options.
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses a preconfigured `reqwest::Client`. Ignored when a cookie jar is set.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Keeps cookies across requests; required for cookie-session auth.
    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.jar = Some(jar);
        self
    }

    /// Bearer-token mode: stamp `Authorization` and refresh expired tokens.
    pub fn bearer_auth(
        mut self,
        tokens: Arc<dyn TokenStore>,
        session: Arc<dyn SessionStore>,
    ) -> Self {
        self.auth = AuthMode::Bearer { tokens, session };
        self
    }

    /// HttpOnly-cookie mode: refresh the session when a request gets a 401.
    pub fn cookie_auth(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.auth = AuthMode::Cookie { session };
        self
    }

    pub fn csrf(mut self, source: Arc<dyn CsrfSource>) -> Self {
        self.csrf = Some(source);
        self
    }

    pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_interceptors.push(interceptor);
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&HttpError) + Send + Sync + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let http = match (self.jar, self.http) {
            (Some(jar), _) => reqwest::Client::builder().cookie_provider(jar).build()?,
            (None, Some(http)) => http,
            (None, None) => reqwest::Client::new(),
        };

        let mut request_interceptors: Vec<Arc<dyn RequestInterceptor>> = Vec::new();
        let mut response_interceptors: Vec<Arc<dyn ResponseInterceptor>> = Vec::new();

        if let Some(source) = self.csrf {
            request_interceptors.push(Arc::new(CsrfInterceptor::new(
                source,
                &self.options.csrf_header,
            )?));
        }
        if self.options.max_retries > 0 {
            response_interceptors.push(Arc::new(RetryInterceptor::new(
                RetryPolicy::from_options(&self.options),
            )));
        }
        match self.auth {
            AuthMode::Anonymous => {}
            AuthMode::Bearer { tokens, session } => request_interceptors.push(Arc::new(
                BearerAuthInterceptor::new(tokens, session, self.options.clone()),
            )),
            AuthMode::Cookie { session } => response_interceptors.push(Arc::new(
                CookieAuthInterceptor::new(session, self.options.clone()),
            )),
        }
        request_interceptors.extend(self.request_interceptors);
        response_interceptors.extend(self.response_interceptors);

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                http,
                base_url: self.base_url,
                options: self.options,
                request_interceptors,
                response_interceptors,
                error_handler: self.error_handler,
            }),
        })
    }
}

impl HttpClient {
    /// Creates an anonymous client with default options (retry only).
    pub fn new(base_url: impl Into<String>) -> Self {
        let options = ClientOptions::default();
        let retry: Arc<dyn ResponseInterceptor> =
            Arc::new(RetryInterceptor::new(RetryPolicy::from_options(&options)));
        Self {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                base_url: base_url.into(),
                options,
                request_interceptors: Vec::new(),
                response_interceptors: vec![retry],
                error_handler: None,
            }),
        }
    }

    pub fn builder(base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder {
            base_url: base_url.into(),
            options: ClientOptions::default(),
            http: None,
            jar: None,
            auth: AuthMode::Anonymous,
            csrf: None,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            error_handler: None,
        }
    }

    /// Creates a builder from environment variables.
    ///
    /// Reads:
    /// - `ERP_SERVER_URL`: API base URL (required)
    /// - `ERP_HTTP_TIMEOUT_MS`: per-request timeout in milliseconds (optional)
    pub fn builder_from_env() -> std::result::Result<HttpClientBuilder, String> {
        let url = std::env::var("ERP_SERVER_URL")
            .map_err(|_| "missing ERP_SERVER_URL environment variable".to_owned())?;
        if url.trim().is_empty() {
            return Err("ERP_SERVER_URL is set but empty".to_owned());
        }
        let mut options = ClientOptions::default();
        if let Ok(timeout) = std::env::var("ERP_HTTP_TIMEOUT_MS") {
            options.timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|_| format!("ERP_HTTP_TIMEOUT_MS is not a number: {timeout}"))?;
        }
        Ok(Self::builder(url.trim()).options(options))
    }

    /// Creates an anonymous client from environment variables.
    ///
    /// See [`HttpClient::builder_from_env`] for the variables read.
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::builder_from_env()?
            .build()
            .map_err(|err| err.to_string())
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Runs `config` through the full pipeline: request interceptors,
    /// dispatch, then the error chain on failure.
    ///
    /// Interceptors that resubmit a request call back into this method.
    pub fn execute(&self, config: RequestConfig) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(self.pipeline(config))
    }

    async fn pipeline(&self, mut config: RequestConfig) -> Result<HttpResponse> {
        for interceptor in &self.inner.request_interceptors {
            config = interceptor.on_request(config).await?;
        }

        let mut error = match self.dispatch(&config).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        for interceptor in &self.inner.response_interceptors {
            match interceptor.on_error(self, config.clone(), error).await {
                Recovery::Handled(outcome) => return outcome,
                Recovery::Propagate(unhandled) => error = unhandled,
            }
        }
        Err(error)
    }

    async fn dispatch(&self, config: &RequestConfig) -> Result<HttpResponse> {
        let url = resolve_url(&self.inner.base_url, &config.url);
        let timeout = config
            .timeout
            .unwrap_or(Duration::from_millis(self.inner.options.timeout_ms));

        let mut builder = self
            .inner
            .http
            .request(config.method.clone(), url)
            .headers(config.headers.clone())
            .timeout(timeout);
        if !config.query.is_empty() {
            builder = builder.query(&config.query);
        }
        if let Some(body) = &config.body {
            builder = builder.json(body);
        }

        match &config.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(HttpError::Cancelled),
                outcome = Self::exchange(builder, config) => outcome,
            },
            None => Self::exchange(builder, config).await,
        }
    }

    async fn exchange(
        builder: reqwest::RequestBuilder,
        config: &RequestConfig,
    ) -> Result<HttpResponse> {
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(HttpError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
            request: config.clone(),
        })
    }

    /// Sends a request and returns the raw response.
    ///
    /// Failures other than cancellations are reported to the global error
    /// handler before being returned.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse> {
        let before_request = options.before_request.clone();
        let before_response = options.before_response.clone();

        let mut config = RequestConfig::new(method, url).apply(options);
        if let Some(callback) = before_request {
            callback(&mut config);
        }

        match self.execute(config).await {
            Ok(response) => {
                if let Some(callback) = before_response {
                    callback(&response);
                }
                Ok(response)
            }
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    fn report(&self, err: &HttpError) {
        if err.is_cancelled() {
            return;
        }
        match &self.inner.error_handler {
            Some(handler) => handler(err),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, message = %err.user_message(), "request failed");
            }
        }
    }

    /// Sends a request and decodes the JSON response body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.send(method, url, options).await?.json()
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post<T: DeserializeOwned>(&self, url: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put<T: DeserializeOwned>(&self, url: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.request(Method::PATCH, url, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.request(Method::DELETE, url, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_url, HttpClient};

    #[test]
    fn resolve_url_joins_relative_paths() {
        assert_eq!(
            resolve_url("https://erp.example.com/api/", "/orders"),
            "https://erp.example.com/api/orders"
        );
        assert_eq!(
            resolve_url("https://erp.example.com/api", "orders?page=1"),
            "https://erp.example.com/api/orders?page=1"
        );
        assert_eq!(
            resolve_url("https://erp.example.com/api", "https://cdn.example.com/x.png"),
            "https://cdn.example.com/x.png"
        );
    }

    #[test]
    fn default_client_registers_retry_only() {
        let client = HttpClient::new("https://erp.example.com/api");
        let debug = format!("{client:?}");
        assert!(debug.contains("request_interceptors: 0"));
        assert!(debug.contains("response_interceptors: 1"));
    }

    #[test]
    fn builder_registers_auth_and_csrf() {
        use std::sync::Arc;

        use crate::token::{EndpointSession, MemoryTokenStore};

        let tokens = Arc::new(MemoryTokenStore::new());
        let session = Arc::new(EndpointSession::new(
            "https://erp.example.com/api/refresh-token",
            tokens.clone(),
        ));
        let client = HttpClient::builder("https://erp.example.com/api")
            .bearer_auth(tokens, session)
            .csrf(Arc::new(|| Some("t".to_owned())))
            .build()
            .expect("must build");
        let debug = format!("{client:?}");
        assert!(debug.contains("request_interceptors: 2"));
    }
}
