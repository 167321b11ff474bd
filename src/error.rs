use std::sync::Arc;

/// Error type returned by this crate.
///
/// The type is `Clone` so a single refresh failure can be fanned out to every
/// request parked in the pending queue.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HttpError {
    /// Network or request execution error from `reqwest`. No HTTP response
    /// was received.
    #[error("transport error: {0}")]
    Transport(#[source] Arc<reqwest::Error>),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// A step with no transport-level timeout of its own (such as a session
    /// refresh) ran past the client timeout. No HTTP response was received.
    #[error("timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// Access token expired and no refresh token is available.
    #[error("session expired: access token is stale and no refresh token is available")]
    SessionExpired,
    /// The token refresh call failed; every queued request fails with it.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] Box<HttpError>),
    /// The pending queue was at capacity when the request arrived.
    #[error("pending request queue overflow (max size {max_size})")]
    QueueOverflow { max_size: usize },
    /// The request waited in the pending queue longer than allowed.
    #[error("pending request timeout after {timeout_ms} ms")]
    QueueTimeout { timeout_ms: u64 },
    /// The pending queue was dropped before the request was settled.
    #[error("pending request queue closed")]
    QueueClosed,
    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,
    /// A header value could not be built.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// Response decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Coarse classification of an [`HttpError`], used by the retry predicate.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureCode {
    /// The request was aborted by a timeout.
    ConnectionAborted,
    /// Connection could not be established or broke mid-flight.
    Network,
    /// Explicit client-side cancellation.
    Cancelled,
    /// The server answered with a non-success status.
    BadResponse,
    /// Session expired or refresh failed.
    Auth,
    /// Pending queue overflow, timeout or shutdown.
    Queue,
    /// Response body could not be decoded.
    Decode,
    /// Request could not be built.
    Config,
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl HttpError {
    /// HTTP status of the response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Whether the server produced an HTTP response for this failure.
    pub fn has_response(&self) -> bool {
        self.status().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn code(&self) -> FailureCode {
        match self {
            Self::Transport(err) if err.is_timeout() => FailureCode::ConnectionAborted,
            Self::Transport(err) if err.is_builder() => FailureCode::Config,
            Self::Transport(err) if err.is_decode() => FailureCode::Decode,
            Self::Transport(_) => FailureCode::Network,
            Self::Timeout { .. } => FailureCode::ConnectionAborted,
            Self::Http { .. } => FailureCode::BadResponse,
            Self::SessionExpired | Self::RefreshFailed(_) => FailureCode::Auth,
            Self::QueueOverflow { .. } | Self::QueueTimeout { .. } | Self::QueueClosed => {
                FailureCode::Queue
            }
            Self::Cancelled => FailureCode::Cancelled,
            Self::InvalidHeader(_) => FailureCode::Config,
            Self::Decode(_) => FailureCode::Decode,
        }
    }

    /// Message suitable for an end-user notification.
    ///
    /// Server errors prefer the `message` (or `msg`) field of a JSON body and
    /// fall back to a generic text per status class.
    pub fn user_message(&self) -> String {
        match self {
            Self::Http { status, body } => body_message(body).unwrap_or_else(|| match status {
                401 => "Not signed in or session has expired".to_owned(),
                403 => "Access denied".to_owned(),
                404 => "Requested resource was not found".to_owned(),
                500..=599 => "Server error, please try again later".to_owned(),
                _ => format!("Request failed with status {status}"),
            }),
            Self::Transport(err) if err.is_timeout() => "Request timed out".to_owned(),
            Self::Timeout { .. } => "Request timed out".to_owned(),
            Self::Transport(_) => "Network error, please check your connection".to_owned(),
            Self::SessionExpired => "Session expired, please sign in again".to_owned(),
            Self::RefreshFailed(_) => {
                "Session could not be renewed, please sign in again".to_owned()
            }
            Self::QueueOverflow { .. } | Self::QueueTimeout { .. } | Self::QueueClosed => {
                "Too many pending requests, please retry".to_owned()
            }
            Self::Cancelled => "Request cancelled".to_owned(),
            Self::InvalidHeader(_) | Self::Decode(_) => {
                "Unexpected response from server".to_owned()
            }
        }
    }
}

fn body_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "msg"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()))
        .filter(|message| !message.trim().is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::{FailureCode, HttpError};

    #[test]
    fn user_message_prefers_body_message() {
        let err = HttpError::Http {
            status: 422,
            body: r#"{"code":1,"message":"SKU already exists"}"#.to_owned(),
        };
        assert_eq!(err.user_message(), "SKU already exists");
    }

    #[test]
    fn user_message_falls_back_per_status() {
        let err = HttpError::Http {
            status: 502,
            body: "<html>bad gateway</html>".to_owned(),
        };
        assert_eq!(err.user_message(), "Server error, please try again later");
    }

    #[test]
    fn classification_of_local_failures() {
        assert_eq!(HttpError::SessionExpired.code(), FailureCode::Auth);
        assert_eq!(
            HttpError::QueueTimeout { timeout_ms: 5 }.code(),
            FailureCode::Queue
        );
        assert!(!HttpError::Cancelled.has_response());
        assert!(HttpError::Http {
            status: 404,
            body: String::new()
        }
        .has_response());
    }
}
