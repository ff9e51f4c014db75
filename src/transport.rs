//! The "send request" extension point.
//!
//! Every request a [`Session`](crate::session::Session) issues goes through
//! one [`Transport`]. The real one forwards to `reqwest`; the
//! [`Interceptor`](crate::interceptor::Interceptor) wraps a real one and
//! decides per call whether to answer from a mock.

use crate::error::Result;
use crate::interceptor::Interceptor;
use async_trait::async_trait;
use http::HeaderMap;
use reqwest::cookie::Jar;
use reqwest::{Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a session, used by scope allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What a transport knows about the session that issued a request.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Headers the client adds to every request
    pub default_headers: HeaderMap,
    /// Cookie jar shared with the client, if cookies are enabled
    pub cookie_jar: Option<Arc<Jar>>,
}

impl SessionInfo {
    pub fn new() -> Self {
        Self {
            id: SessionId::next(),
            default_headers: HeaderMap::new(),
            cookie_jar: None,
        }
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends one request and yields its response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, session: &SessionInfo, request: Request) -> Result<Response>;

    /// Downcast hook so installing an interceptor twice can be detected.
    fn as_interceptor(&self) -> Option<&Interceptor> {
        None
    }
}

/// Forwards requests to the network through a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, _session: &SessionInfo, request: Request) -> Result<Response> {
        Ok(self.client.execute(request).await?)
    }
}
