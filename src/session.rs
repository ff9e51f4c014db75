//! Application-facing HTTP session.
//!
//! A [`Session`] owns a `reqwest::Client` for building requests and routes
//! every request through its installed [`Transport`].

use crate::error::Result;
use crate::mocker::Mocker;
use crate::transport::{ReqwestTransport, SessionId, SessionInfo, Transport};
use http::HeaderMap;
use reqwest::cookie::Jar;
use reqwest::{IntoUrl, Method, Request, RequestBuilder, Response};
use std::sync::Arc;
use tracing::debug;

/// HTTP session whose requests can be intercepted.
#[derive(Clone)]
pub struct Session {
    info: SessionInfo,
    client: reqwest::Client,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// Session with a default client and no interceptor.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn id(&self) -> SessionId {
        self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.info.cookie_jar.as_ref()
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Build and send a request.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Send an already built request through the installed transport.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.transport.send(&self.info, request).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id)
            .field("intercepted", &self.transport.as_interceptor().is_some())
            .finish()
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    default_headers: HeaderMap,
    cookie_store: bool,
    transport: Option<Arc<dyn Transport>>,
    mocker: Option<Mocker>,
}

impl SessionBuilder {
    /// Headers sent with every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Keep cookies in a jar shared by real and mocked responses.
    pub fn cookie_store(mut self, enabled: bool) -> Self {
        self.cookie_store = enabled;
        self
    }

    /// Replace the passthrough transport (defaults to the session's client).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Route requests through `mocker`'s interceptor.
    pub fn mocker(mut self, mocker: &Mocker) -> Self {
        self.mocker = Some(mocker.clone());
        self
    }

    pub fn build(self) -> Result<Session> {
        let jar = self.cookie_store.then(|| Arc::new(Jar::default()));

        let mut client_builder = reqwest::Client::builder().default_headers(self.default_headers.clone());
        if let Some(jar) = &jar {
            client_builder = client_builder.cookie_provider(jar.clone());
        }
        let client = client_builder.build()?;

        let mut transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(client.clone())),
        };
        if let Some(mocker) = &self.mocker {
            transport = mocker.install(transport);
        }

        let info = SessionInfo {
            id: SessionId::next(),
            default_headers: self.default_headers,
            cookie_jar: jar,
        };
        debug!(session = %info.id, "Session created");

        Ok(Session {
            info,
            client,
            transport,
        })
    }
}
