//! Interception and response synthesis.
//!
//! The [`Interceptor`] wraps the real transport. For every call it either
//! forwards the request untouched (mocking disabled, session not eligible,
//! or no rule matched) or builds a `reqwest::Response` from the matched
//! [`MockResponse`](crate::response::MockResponse) that looks exactly like
//! one received over the network.

use crate::error::{MockError, Result};
use crate::matcher::{find_match, MatchResult, RequestParts, Rule};
use crate::mocker::MockState;
use crate::response::JsonSerializer;
use crate::transport::{SessionInfo, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{HeaderMap, Method, StatusCode};
use reqwest::cookie::CookieStore;
use reqwest::{Request, Response, ResponseBuilderExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use url::Url;

/// Metadata about the request a synthesized response answers.
///
/// Available through `response.extensions().get::<RequestInfo>()`.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    /// Normalized request URL
    pub url: Url,
    /// Request headers merged over the session's default headers
    pub headers: HeaderMap,
}

/// Status reason phrase of a synthesized response, when one was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReason(pub String);

/// Everything needed to build a response, captured by [`Interceptor::decide`].
struct Synthesis {
    rule_id: String,
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    /// Request headers merged over the session defaults
    request_headers: HeaderMap,
}

enum Decision {
    Passthrough(Option<Handle>),
    Mock(Synthesis),
}

/// The parts of the active scope a single decision reads.
struct ScopeSnapshot {
    rules: Vec<Arc<Rule>>,
    default_headers: HeaderMap,
    json_serializer: JsonSerializer,
}

/// The hook installed into a session's request path.
pub struct Interceptor {
    state: Arc<MockState>,
    inner: Arc<dyn Transport>,
}

impl Interceptor {
    pub(crate) fn new(state: Arc<MockState>, inner: Arc<dyn Transport>) -> Self {
        Self { state, inner }
    }

    pub(crate) fn is_installed_by(&self, state: &Arc<MockState>) -> bool {
        Arc::ptr_eq(&self.state, state)
    }

    /// Copy the active scope out of the lock, or return the passthrough
    /// decision if this request is not eligible for mocking.
    fn snapshot(
        &self,
        session: &SessionInfo,
        request: &Request,
    ) -> std::result::Result<(Option<Handle>, ScopeSnapshot), Option<Handle>> {
        let overrides = self.state.overrides.read();
        let runtime = overrides.runtime.value().clone();

        if !self.state.enabled.load(Ordering::SeqCst) {
            debug!(url = %request.url(), "Mocking disabled, passing through");
            return Err(runtime);
        }

        let sessions = overrides.sessions.value();
        if !sessions.is_empty() && !sessions.contains(&session.id) {
            debug!(session = %session.id, url = %request.url(), "Session not mocked, passing through");
            return Err(runtime);
        }

        Ok((
            runtime,
            ScopeSnapshot {
                rules: overrides.rules.value().clone(),
                default_headers: overrides.default_headers.value().clone(),
                json_serializer: overrides.json_serializer.value().clone(),
            },
        ))
    }

    /// Resolve a request against the active scope. Never suspends.
    ///
    /// Responders run after the state lock is released, so they may use the
    /// mocker themselves.
    fn decide(&self, session: &SessionInfo, request: &Request) -> Result<Decision> {
        let (runtime, scope) = match self.snapshot(session, request) {
            Ok(snapshot) => snapshot,
            Err(runtime) => return Ok(Decision::Passthrough(runtime)),
        };

        let body = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(Bytes::copy_from_slice);
        // The client adds its default headers only when it executes a request
        let request_headers = merge_headers(&session.default_headers, request.headers());
        let parts = RequestParts::new(
            request.method().clone(),
            request.url(),
            request_headers,
            body,
        );

        let Some(matched) = find_match(&scope.rules, &parts) else {
            self.state.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            if self.state.settings.log_unmatched {
                warn!(
                    method = %parts.method,
                    url = %parts.url,
                    "No matching rule, passing through to the network"
                );
            }
            return Ok(Decision::Passthrough(runtime));
        };

        let synthesis = match self.build(&matched, &scope, parts.headers) {
            Ok(synthesis) => synthesis,
            Err(e) => {
                // A failed response does not use up the rule
                matched.rule.release();
                return Err(e);
            }
        };

        self.state.requests_matched.fetch_add(1, Ordering::Relaxed);
        if self.state.settings.log_matches {
            info!(
                rule_id = %synthesis.rule_id,
                method = %parts.method,
                url = %parts.url,
                "Request matched rule"
            );
        }
        Ok(Decision::Mock(synthesis))
    }

    fn build(
        &self,
        matched: &MatchResult,
        scope: &ScopeSnapshot,
        request_headers: HeaderMap,
    ) -> Result<Synthesis> {
        let response = matched.rule.respond(&matched.context)?;
        let headers = response.merged_headers(
            &scope.default_headers,
            &self.state.settings.default_content_type,
        );
        let body = response.build_body(&scope.json_serializer)?;

        Ok(Synthesis {
            rule_id: matched.rule.id().to_string(),
            status: response.status(),
            reason: response.reason().map(str::to_string),
            headers,
            body,
            request_headers,
        })
    }

    async fn passthrough(
        &self,
        runtime: Option<Handle>,
        session: &SessionInfo,
        request: Request,
    ) -> Result<Response> {
        match runtime {
            Some(handle) => {
                let inner = self.inner.clone();
                let session = session.clone();
                let task = handle.spawn(async move { inner.send(&session, request).await });
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => Err(MockError::Runtime(e.to_string())),
                }
            }
            None => self.inner.send(session, request).await,
        }
    }
}

#[async_trait]
impl Transport for Interceptor {
    async fn send(&self, session: &SessionInfo, request: Request) -> Result<Response> {
        self.state.requests_total.fetch_add(1, Ordering::Relaxed);

        match self.decide(session, &request)? {
            Decision::Passthrough(runtime) => self.passthrough(runtime, session, request).await,
            Decision::Mock(synthesis) => {
                debug!(rule_id = %synthesis.rule_id, "Synthesizing response");
                synthesize(
                    synthesis,
                    session,
                    &request,
                    self.state.settings.chunk_size,
                )
            }
        }
    }

    fn as_interceptor(&self) -> Option<&Interceptor> {
        Some(self)
    }
}

/// Request headers over the session defaults; a request header replaces
/// every default value of the same name.
fn merge_headers(defaults: &HeaderMap, request: &HeaderMap) -> HeaderMap {
    let mut merged = defaults.clone();
    for name in request.keys() {
        merged.remove(name);
        for value in request.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

/// Build a `reqwest::Response` with the same observable surface as a live one.
fn synthesize(
    synthesis: Synthesis,
    session: &SessionInfo,
    request: &Request,
    chunk_size: usize,
) -> Result<Response> {
    let url = crate::normalize::normalize_url(request.url());

    // Store cookies the way the client would for a real response
    if let Some(jar) = &session.cookie_jar {
        let mut cookies = synthesis.headers.get_all(SET_COOKIE).iter();
        jar.set_cookies(&mut cookies, &url);
    }

    let mut builder = http::Response::builder()
        .status(synthesis.status)
        .url(url.clone());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(synthesis.headers);
    }
    let mut response = builder
        .body(streamed_body(synthesis.body, chunk_size))
        .map_err(|e| MockError::InvalidHeader(e.to_string()))?;

    response.extensions_mut().insert(RequestInfo {
        method: request.method().clone(),
        url,
        headers: synthesis.request_headers,
    });
    if let Some(reason) = synthesis.reason {
        response.extensions_mut().insert(StatusReason(reason));
    }

    Ok(Response::from(response))
}

/// Feed a fully materialized body into a stream, chunk by chunk, then end it.
fn streamed_body(body: Bytes, chunk_size: usize) -> reqwest::Body {
    let (tx, rx) = mpsc::unbounded_channel::<std::result::Result<Bytes, std::io::Error>>();
    let chunk_size = chunk_size.max(1);

    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        // The receiver is alive until the end of this function
        let _ = tx.send(Ok(body.slice(offset..end)));
        offset = end;
    }
    // Dropping the sender is the end-of-stream signal
    drop(tx);

    reqwest::Body::wrap_stream(UnboundedReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeaderMatcher, MockSettings};
    use crate::mocker::{Mocker, MockerConfig, ScopeOptions};
    use crate::response::{JsonSerializer, MockResponse};
    use crate::session::Session;
    use crate::template::TemplateResponse;
    use http::HeaderValue;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::io::Write;

    /// Stands in for the network: records every URL it is asked for.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, _session: &SessionInfo, request: Request) -> Result<Response> {
            self.calls.lock().push(request.url().to_string());
            let response = http::Response::builder()
                .status(418)
                .body(reqwest::Body::from("network"))
                .unwrap();
            Ok(Response::from(response))
        }
    }

    fn setup(config: MockerConfig) -> (Mocker, Arc<RecordingTransport>, Session) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mocker = Mocker::new(config);
        let network = Arc::new(RecordingTransport::default());
        let session = mocker
            .session()
            .transport(network.clone())
            .cookie_store(true)
            .build()
            .unwrap();
        (mocker, network, session)
    }

    #[tokio::test]
    async fn test_streamed_body_chunks_in_order() {
        let body = streamed_body(Bytes::from_static(b"abcdefghij"), 4);
        let mut response = Response::from(http::Response::new(body));

        let mut chunks = Vec::new();
        while let Some(chunk) = response.chunk().await.unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"abcd"),
                Bytes::from_static(b"efgh"),
                Bytes::from_static(b"ij")
            ]
        );
        // End of stream is sticky
        assert!(response.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_streamed_empty_body() {
        let body = streamed_body(Bytes::new(), 16);
        let response = Response::from(http::Response::new(body));
        assert_eq!(response.bytes().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_items_scenario() {
        let (mocker, network, session) = setup(MockerConfig::default());

        {
            let scope = mocker.scope().unwrap();
            scope
                .get("https://api.test/items?category=books")
                .respond(MockResponse::json(200, &json!([{"id": 1}])).unwrap())
                .unwrap();

            let response = session
                .send(session.get("https://api.test/items?category=books"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get("content-type").unwrap(),
                "application/json"
            );
            assert_eq!(response.url().as_str(), "https://api.test/items?category=books");
            let body: Value = response.json().await.unwrap();
            assert_eq!(body, json!([{"id": 1}]));
        }

        // Outside the scope the real transport answers
        let response = session
            .send(session.get("https://api.test/items?category=books"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(network.calls(), vec!["https://api.test/items?category=books"]);
    }

    #[tokio::test]
    async fn test_path_and_query_patterns() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        scope
            .get("/search?q=x")
            .respond(MockResponse::json(200, &json!({"hit": "query"})).unwrap())
            .unwrap();
        scope
            .get("/search")
            .respond(MockResponse::json(200, &json!({"hit": "path"})).unwrap())
            .unwrap();

        let hit = |url: &'static str| {
            let session = session.clone();
            async move {
                let response = session.send(session.get(url)).await.unwrap();
                response.json::<Value>().await.unwrap()["hit"].clone()
            }
        };

        assert_eq!(hit("https://api.test/search?q=x").await, "query");
        assert_eq!(hit("https://api.test/search?page=2&q=x").await, "path");
        assert_eq!(hit("https://api.test/search").await, "path");
        assert!(network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_request_passes_through() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        scope
            .get("/known")
            .respond(MockResponse::builder().build().unwrap())
            .unwrap();

        let response = session
            .send(session.post("https://api.test/known"))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "network");
        assert_eq!(network.calls().len(), 1);

        assert_eq!(mocker.total_requests(), 1);
        assert_eq!(mocker.total_matched(), 0);
        assert_eq!(mocker.total_unmatched(), 1);
    }

    #[tokio::test]
    async fn test_nested_scope_rules_are_discarded_on_exit() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let outer = mocker.scope().unwrap();
        outer
            .get("/a")
            .respond(MockResponse::json(200, &json!("outer")).unwrap())
            .unwrap();

        {
            let inner = mocker.scope().unwrap();
            inner
                .get("/b")
                .respond(MockResponse::json(200, &json!("inner")).unwrap())
                .unwrap();

            let response = session.send(session.get("https://api.test/b")).await.unwrap();
            assert_eq!(response.json::<Value>().await.unwrap(), json!("inner"));
            let response = session.send(session.get("https://api.test/a")).await.unwrap();
            assert_eq!(response.json::<Value>().await.unwrap(), json!("outer"));
        }

        let response = session.send(session.get("https://api.test/b")).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(network.calls(), vec!["https://api.test/b"]);
        drop(outer);
    }

    #[tokio::test]
    async fn test_session_allow_list() {
        let mocker = Mocker::new(MockerConfig::default());
        let network = Arc::new(RecordingTransport::default());
        let build = || {
            mocker
                .session()
                .transport(network.clone())
                .build()
                .unwrap()
        };
        let mocked = build();
        let other = build();

        let scope = mocker
            .enter(ScopeOptions::new().session(mocked.id()))
            .unwrap();
        scope
            .get("/x")
            .respond(MockResponse::json(200, &json!({})).unwrap())
            .unwrap();

        let response = mocked.send(mocked.get("https://api.test/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = other.send(other.get("https://api.test/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(network.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cookies_reach_response_and_jar() {
        let (mocker, _network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        scope
            .post("/login")
            .respond(
                MockResponse::builder()
                    .append_header("set-cookie", "token=abc; Path=/")
                    .append_header("set-cookie", "theme=dark; Path=/")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let response = session
            .send(session.post("https://api.test/login"))
            .await
            .unwrap();
        let mut names: Vec<String> = response.cookies().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["theme", "token"]);

        let jar = session.cookie_jar().unwrap();
        let stored = jar
            .cookies(&Url::parse("https://api.test/").unwrap())
            .unwrap();
        let stored = stored.to_str().unwrap();
        assert!(stored.contains("token=abc"));
        assert!(stored.contains("theme=dark"));
    }

    #[tokio::test]
    async fn test_reason_and_request_info_extensions() {
        let mocker = Mocker::new(MockerConfig::default());
        let mut defaults = HeaderMap::new();
        defaults.insert("x-client", HeaderValue::from_static("tests"));
        defaults.insert("accept", HeaderValue::from_static("*/*"));
        let session = mocker
            .session()
            .transport(Arc::new(RecordingTransport::default()))
            .default_headers(defaults)
            .build()
            .unwrap();

        let scope = mocker.scope().unwrap();
        scope
            .delete("/items/1")
            .respond(
                MockResponse::builder()
                    .status(409)
                    .reason("Already Gone")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let response = session
            .send(
                session
                    .delete("https://api.test/items/1?b=2&a=1")
                    .header("accept", "application/json"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.extensions().get::<StatusReason>(),
            Some(&StatusReason("Already Gone".to_string()))
        );

        let info = response.extensions().get::<RequestInfo>().unwrap();
        assert_eq!(info.method, Method::DELETE);
        assert_eq!(info.url.as_str(), "https://api.test/items/1?a=1&b=2");
        assert_eq!(info.headers.get("accept").unwrap(), "application/json");
        assert_eq!(info.headers.get("x-client").unwrap(), "tests");
    }

    #[tokio::test]
    async fn test_chunked_reads() {
        let (mocker, _network, session) = setup(MockerConfig {
            settings: MockSettings {
                chunk_size: 4,
                ..Default::default()
            },
            ..Default::default()
        });
        let scope = mocker.scope().unwrap();
        scope
            .get("/file")
            .respond(MockResponse::raw(200, "0123456789").unwrap())
            .unwrap();

        let mut response = session.send(session.get("https://api.test/file")).await.unwrap();
        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        while let Some(chunk) = response.chunk().await.unwrap() {
            sizes.push(chunk.len());
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(collected, b"0123456789");
    }

    #[tokio::test]
    async fn test_default_headers_and_serializer() {
        let (mocker, _network, session) = setup(MockerConfig::default());
        let mut defaults = HeaderMap::new();
        defaults.insert("x-env", HeaderValue::from_static("test"));
        defaults.insert("content-type", HeaderValue::from_static("application/vnd.test+json"));

        let scope = mocker
            .enter(
                ScopeOptions::new()
                    .default_headers(defaults)
                    .json_serializer(JsonSerializer::new(|value| {
                        serde_json::to_vec_pretty(value).map_err(|e| e.to_string())
                    })),
            )
            .unwrap();
        scope
            .get("/pretty")
            .respond(MockResponse::json(200, &json!({"a": 1})).unwrap())
            .unwrap();
        scope
            .get("/plain")
            .respond(MockResponse::builder().text("hi").content_type("text/plain").build().unwrap())
            .unwrap();

        let response = session.send(session.get("https://api.test/pretty")).await.unwrap();
        assert_eq!(response.headers().get("x-env").unwrap(), "test");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/vnd.test+json"
        );
        assert_eq!(response.text().await.unwrap(), "{\n  \"a\": 1\n}");

        // Per-response headers win over defaults
        let response = session.send(session.get("https://api.test/plain")).await.unwrap();
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(response.headers().get("x-env").unwrap(), "test");
    }

    #[tokio::test]
    async fn test_match_limit_then_network() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        let handle = scope
            .get("/once")
            .times(1)
            .respond(MockResponse::json(200, &json!("mocked")).unwrap())
            .unwrap();

        let first = session.send(session.get("https://api.test/once")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = session.send(session.get("https://api.test/once")).await.unwrap();
        assert_eq!(second.status(), StatusCode::IM_A_TEAPOT);

        assert_eq!(handle.hits(), 1);
        assert!(handle.is_exhausted());
        assert_eq!(network.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_template_response() {
        let (mocker, _network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        scope
            .get(crate::matcher::UrlPattern::template("/users/{id}"))
            .respond_with_template(
                TemplateResponse::json(200, json!({"id": "{{path.id}}", "page": "{{query.page}}"}))
                    .header("x-user", "{{path.id}}"),
            )
            .unwrap();

        let response = session
            .send(session.get("https://api.test/users/42?page=3"))
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-user").unwrap(), "42");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"id": "42", "page": "3"}));
    }

    #[tokio::test]
    async fn test_fixture_scope() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
rules:
  - id: health
    request:
      method: [GET]
      url:
        type: exact
        value: /health
    response:
      status: 200
      headers:
        x-source: fixture
      body:
        type: text
        content: ok
"#
        )
        .unwrap();

        let (mocker, _network, session) = setup(MockerConfig::default());
        let _scope = mocker
            .enter(ScopeOptions::new().fixture(file.path()))
            .unwrap();

        let response = session.send(session.get("https://api.test/health")).await.unwrap();
        assert_eq!(response.headers().get("x-source").unwrap(), "fixture");
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_passthrough_on_runtime_handle() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let _scope = mocker
            .enter(ScopeOptions::new().runtime(Handle::current()))
            .unwrap();

        let response = session.send(session.get("https://api.test/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(network.calls(), vec!["https://api.test/live"]);
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let mocker = Mocker::new(MockerConfig::default());
        let network: Arc<dyn Transport> = Arc::new(RecordingTransport::default());

        let once = mocker.install(network);
        let twice = mocker.install(once.clone());
        assert!(Arc::ptr_eq(&once, &twice));

        let other = Mocker::new(MockerConfig::default());
        let wrapped = other.install(once.clone());
        assert!(!Arc::ptr_eq(&once, &wrapped));
    }

    #[tokio::test]
    async fn test_responder_error_is_reported() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let scope = mocker
            .enter(
                ScopeOptions::new()
                    .json_serializer(JsonSerializer::new(|_| Err("refused".to_string()))),
            )
            .unwrap();
        scope
            .get("/x")
            .respond(MockResponse::json(200, &json!({})).unwrap())
            .unwrap();

        let err = session
            .send(session.get("https://api.test/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::Serialize(ref msg) if msg == "refused"));
        assert!(network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_response_is_not_counted() {
        let (mocker, _network, session) = setup(MockerConfig::default());
        let scope = mocker
            .enter(
                ScopeOptions::new()
                    .json_serializer(JsonSerializer::new(|_| Err("refused".to_string()))),
            )
            .unwrap();
        let handle = scope
            .get("/x")
            .times(1)
            .respond(MockResponse::json(200, &json!({})).unwrap())
            .unwrap();

        assert!(session.send(session.get("https://api.test/x")).await.is_err());
        assert_eq!(handle.hits(), 0);
        assert!(!handle.is_exhausted());
        assert_eq!(mocker.total_requests(), 1);
        assert_eq!(mocker.total_matched(), 0);
    }

    #[tokio::test]
    async fn test_path_with_space_and_unicode() {
        let (mocker, network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        scope
            .get("/files/my report")
            .respond(MockResponse::json(200, &json!("file")).unwrap())
            .unwrap();
        scope
            .get("/menü")
            .respond(MockResponse::json(200, &json!("menu")).unwrap())
            .unwrap();

        let response = session
            .send(session.get("https://api.test/files/my report"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = session.send(session.get("https://api.test/menü")).await.unwrap();
        assert_eq!(response.json::<Value>().await.unwrap(), json!("menu"));
        assert!(network.calls().is_empty());
    }

    #[tokio::test]
    async fn test_session_default_headers_reach_constraints() {
        let mocker = Mocker::new(MockerConfig::default());
        let network = Arc::new(RecordingTransport::default());
        let mut defaults = HeaderMap::new();
        defaults.insert("authorization", HeaderValue::from_static("Bearer t"));
        let session = mocker
            .session()
            .transport(network.clone())
            .default_headers(defaults)
            .build()
            .unwrap();

        let scope = mocker.scope().unwrap();
        scope
            .get("/me")
            .header("authorization", HeaderMatcher::Exact { value: "Bearer t".to_string() })
            .respond(MockResponse::json(200, &json!({"me": true})).unwrap())
            .unwrap();

        let response = session.send(session.get("https://api.test/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info = response.extensions().get::<RequestInfo>().unwrap();
        assert_eq!(info.headers.get("authorization").unwrap(), "Bearer t");

        // A request header replaces the default before matching
        let response = session
            .send(session.get("https://api.test/me").header("authorization", "Bearer other"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(network.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_responder_may_use_the_mocker() {
        let (mocker, _network, session) = setup(MockerConfig::default());
        let scope = mocker.scope().unwrap();
        let inside = mocker.clone();
        scope
            .get("/reentrant")
            .respond_with(move |_| {
                // Takes the state lock for writing
                let nested = inside.scope().unwrap();
                nested
                    .get("/nested")
                    .respond(MockResponse::builder().build().unwrap())
                    .unwrap();
                let depth = nested.depth();
                drop(nested);
                MockResponse::json(200, &json!({"depth": depth})).unwrap()
            })
            .unwrap();

        let response = session
            .send(session.get("https://api.test/reentrant"))
            .await
            .unwrap();
        assert_eq!(response.json::<Value>().await.unwrap(), json!({"depth": 2}));
        assert_eq!(mocker.depth(), 1);
        assert_eq!(mocker.rules().len(), 1);
    }
}
