/// Configures timeouts, retry, pending queue and auth behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt (idempotent requests only).
    pub max_retries: usize,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Upper bound for a single retry delay in milliseconds.
    pub max_retry_backoff_ms: u64,
    /// Maximum number of requests parked while a token refresh is in flight.
    pub queue_max_size: usize,
    /// How long a parked request may wait, in milliseconds. `0` disables the timer.
    pub queue_timeout_ms: u64,
    /// Header carrying the CSRF token on state-changing requests.
    pub csrf_header: String,
    /// URL paths exempt from auth handling (login, refresh).
    pub auth_whitelist: Vec<String>,
    /// Refresh endpoint used in cookie-auth mode.
    pub refresh_url: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 10_000,
            queue_max_size: 100,
            queue_timeout_ms: 30_000,
            csrf_header: "X-CSRF-Token".to_owned(),
            auth_whitelist: vec!["/login".to_owned(), "/refresh-token".to_owned()],
            refresh_url: "/refresh-token".to_owned(),
        }
    }
}

impl ClientOptions {
    /// Whether `url` hits a whitelisted auth endpoint.
    ///
    /// Query strings are ignored. A whitelist entry matches the trailing
    /// path segments, so `login` matches `/api/login` but not `/xlogin`.
    pub fn is_whitelisted(&self, url: &str) -> bool {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let path = path.trim_matches('/');
        self.auth_whitelist
            .iter()
            .map(|entry| entry.trim_matches('/'))
            .filter(|entry| !entry.is_empty())
            .any(|entry| {
                path == entry
                    || path
                        .strip_suffix(entry)
                        .is_some_and(|rest| rest.ends_with('/'))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::ClientOptions;

    #[test]
    fn whitelist_matches_path_suffix_and_ignores_query() {
        let options = ClientOptions::default();
        assert!(options.is_whitelisted("/login"));
        assert!(options.is_whitelisted("https://erp.example.com/api/refresh-token?x=1"));
        assert!(options.is_whitelisted("/api/login/"));
        assert!(!options.is_whitelisted("/orders"));
        assert!(!options.is_whitelisted("/login/history"));
    }

    #[test]
    fn whitelist_matches_whole_segments_only() {
        let options = ClientOptions {
            auth_whitelist: vec!["login".to_owned(), "auth/refresh".to_owned()],
            ..ClientOptions::default()
        };
        assert!(options.is_whitelisted("login"));
        assert!(options.is_whitelisted("/api/login"));
        assert!(options.is_whitelisted("https://erp.example.com/auth/refresh"));
        assert!(!options.is_whitelisted("/xlogin"));
        assert!(!options.is_whitelisted("/api/myauth/refresh"));
        assert!(!options.is_whitelisted("/api/login2"));
    }
}
