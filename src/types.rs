use std::{fmt, sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{HttpError, Result};

/// Request descriptor flowing through the interceptor pipeline.
///
/// Interceptors take it by value, adjust it and hand it on. A resubmitted
/// request is a clone carrying its updated retry markers.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub method: Method,
    /// Relative path (joined with the client base URL) or absolute URL.
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Overrides the client timeout for this request.
    pub timeout: Option<Duration>,
    /// Bypasses the auth interceptors.
    pub skip_auth: bool,
    /// Number of retries already performed for this request.
    pub retry_count: usize,
    /// Set once the cookie-auth interceptor replayed this request after a 401.
    pub cookie_auth_retry: bool,
    pub cancel: Option<CancellationToken>,
    /// Opaque per-request data, never read by the pipeline.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            skip_auth: false,
            retry_count: 0,
            cookie_auth_retry: false,
            cancel: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn skip_auth(mut self, skip: bool) -> Self {
        self.skip_auth = skip;
        self
    }

    /// Header value as text, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub(crate) fn apply(mut self, options: RequestOptions) -> Self {
        self.skip_auth = options.skip_auth;
        self.query = options.params;
        self.body = options.data;
        self.headers.extend(options.headers);
        self.timeout = options.timeout;
        self.cancel = options.cancel;
        self.metadata = options.metadata;
        self
    }
}

pub type BeforeRequest = Arc<dyn Fn(&mut RequestConfig) + Send + Sync>;
pub type BeforeResponse = Arc<dyn Fn(&HttpResponse) + Send + Sync>;

/// Per-call options accepted by [`crate::HttpClient::request`] and friends.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub skip_auth: bool,
    /// Query-string parameters.
    pub params: Vec<(String, String)>,
    /// JSON request body.
    pub data: Option<serde_json::Value>,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Runs on the request descriptor before it enters the pipeline.
    pub before_request: Option<BeforeRequest>,
    /// Runs on a successful response before it is decoded.
    pub before_response: Option<BeforeResponse>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("skip_auth", &self.skip_auth)
            .field("params", &self.params)
            .field("data", &self.data)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("before_request", &self.before_request.is_some())
            .field("before_response", &self.before_response.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn params<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Adds a header, replacing any previous value under the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn before_request(
        mut self,
        callback: impl Fn(&mut RequestConfig) + Send + Sync + 'static,
    ) -> Self {
        self.before_request = Some(Arc::new(callback));
        self
    }

    pub fn before_response(
        mut self,
        callback: impl Fn(&HttpResponse) + Send + Sync + 'static,
    ) -> Self {
        self.before_response = Some(Arc::new(callback));
        self
    }
}

/// A settled response together with the request descriptor that produced it.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Final descriptor after every interceptor ran.
    pub request: RequestConfig,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            HttpError::Decode(format!(
                "invalid response JSON: {err}; body: {}",
                String::from_utf8_lossy(&self.body)
            ))
        })
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|err| HttpError::Decode(format!("response body is not UTF-8: {err}")))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use reqwest::{header, Method};

    use super::{HttpResponse, RequestConfig, RequestOptions};

    #[test]
    fn apply_merges_headers_and_flags() {
        let options = RequestOptions::new()
            .skip_auth()
            .params([("page", "2")])
            .header(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let config = RequestConfig::new(Method::GET, "/tires").apply(options);

        assert!(config.skip_auth);
        assert_eq!(config.query, vec![("page".to_owned(), "2".to_owned())]);
        assert_eq!(config.header("accept"), Some("application/json"));
    }

    #[test]
    fn json_decode_error_includes_body() {
        let response = HttpResponse {
            status: 200,
            headers: header::HeaderMap::new(),
            body: b"not json".to_vec(),
            request: RequestConfig::new(Method::GET, "/"),
        };
        let err = response
            .json::<serde_json::Value>()
            .expect_err("must fail");
        assert!(err.to_string().contains("not json"));
    }
}
