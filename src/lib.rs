//! `erp-http` is the async HTTP client core of the tire-distribution ERP.
//!
//! Every call goes through one interceptor pipeline:
//! - CSRF stamping of state-changing requests ([`CsrfInterceptor`])
//! - bearer-token auth with single-flight refresh ([`BearerAuthInterceptor`])
//! - retry of idempotent requests on network failures ([`RetryInterceptor`])
//! - refresh-on-401 for cookie sessions ([`CookieAuthInterceptor`])
//!
//! Requests that wait on a refresh are parked on a bounded, TTL'd
//! [`PendingQueue`].

mod auth;
mod client;
mod cookie_auth;
mod csrf;
mod error;
pub mod interceptor;
mod options;
mod queue;
mod retry;
mod token;
mod types;

pub use auth::BearerAuthInterceptor;
pub use client::{resolve_url, ErrorHandler, HttpClient, HttpClientBuilder};
pub use cookie_auth::CookieAuthInterceptor;
pub use csrf::{CookieCsrfSource, CsrfInterceptor, CsrfSource};
pub use error::{FailureCode, HttpError};
pub use options::ClientOptions;
pub use queue::{PendingQueue, QueueOptions};
pub use retry::{retry_delay, RetryInterceptor, RetryPolicy};
pub use token::{EndpointSession, MemoryTokenStore, SessionStore, TokenRecord, TokenStore};
pub use types::{BeforeRequest, BeforeResponse, HttpResponse, RequestConfig, RequestOptions};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, HttpError>;
