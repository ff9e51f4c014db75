//! The mocking facade.
//!
//! A [`Mocker`] owns all test-time configuration. Entering a scope pushes a
//! copy of every override cell, registration extends the copy, and dropping
//! the [`MockScope`] pops them again, so an outer scope never observes what
//! an inner one registered.
//!
//! Scopes are shared by every session installed with the same mocker.
//! Overlapping scopes from concurrently running tests are not isolated from
//! each other; tests that mock through one mocker must not run concurrently.

use crate::config::{MockFixture, MockSettings, QueryMatcher, HeaderMatcher, BodyMatcher};
use crate::error::{MockError, Result};
use crate::interceptor::Interceptor;
use crate::matcher::{Constraints, FnResponder, MatchContext, Responder, Rule, UrlPattern};
use crate::response::{JsonSerializer, MockResponse};
use crate::scoped::ScopedOverride;
use crate::session::SessionBuilder;
use crate::template::{TemplateEngine, TemplateResponse};
use crate::transport::{SessionId, Transport};
use http::HeaderMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Configuration for a [`Mocker`]; these become the base values of every
/// override cell.
#[derive(Debug, Clone, Default)]
pub struct MockerConfig {
    /// Runtime passthrough requests run on (None = the calling task's)
    pub runtime: Option<Handle>,
    /// Headers added to every synthesized response
    pub default_headers: HeaderMap,
    /// Encoder for JSON bodies
    pub json_serializer: JsonSerializer,
    /// Sessions eligible for mocking (empty = all sessions)
    pub extra_sessions: Vec<SessionId>,
    /// Rules active in every scope
    pub initial_rules: Vec<Arc<Rule>>,
    pub settings: MockSettings,
}

impl MockerConfig {
    /// Load settings and initial rules from a YAML fixture.
    pub fn from_fixture(path: &Path) -> anyhow::Result<Self> {
        let fixture = MockFixture::from_file(path)?;
        let engine = Arc::new(TemplateEngine::new());
        Ok(Self {
            initial_rules: compile_fixture(&fixture, &engine)?,
            settings: fixture.settings,
            ..Default::default()
        })
    }
}

/// Per-scope overrides, applied on entry.
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    runtime: Option<Handle>,
    default_headers: Option<HeaderMap>,
    json_serializer: Option<JsonSerializer>,
    sessions: Vec<SessionId>,
    rules: Vec<Arc<Rule>>,
    fixtures: Vec<PathBuf>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn json_serializer(mut self, serializer: JsonSerializer) -> Self {
        self.json_serializer = Some(serializer);
        self
    }

    /// Restrict mocking to these sessions (added to the outer allow-list).
    pub fn session(mut self, id: SessionId) -> Self {
        self.sessions.push(id);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn fixture(mut self, path: impl Into<PathBuf>) -> Self {
        self.fixtures.push(path.into());
        self
    }
}

pub(crate) struct Overrides {
    pub(crate) runtime: ScopedOverride<Option<Handle>>,
    pub(crate) default_headers: ScopedOverride<HeaderMap>,
    pub(crate) json_serializer: ScopedOverride<JsonSerializer>,
    pub(crate) rules: ScopedOverride<Vec<Arc<Rule>>>,
    pub(crate) sessions: ScopedOverride<Vec<SessionId>>,
    /// Token of the scope owning each level, innermost last
    scopes: Vec<u64>,
}

impl Overrides {
    fn new(config: MockerConfig) -> Self {
        fn cell<T>(base: T, nested: bool) -> ScopedOverride<T> {
            if nested {
                ScopedOverride::new(base)
            } else {
                ScopedOverride::single(base)
            }
        }
        let nested = config.settings.allow_nested_scopes;
        Self {
            runtime: cell(config.runtime, nested),
            default_headers: cell(config.default_headers, nested),
            json_serializer: cell(config.json_serializer, nested),
            rules: cell(config.initial_rules, nested),
            sessions: cell(config.extra_sessions, nested),
            scopes: Vec::new(),
        }
    }

    fn depth(&self) -> usize {
        self.rules.depth()
    }

    /// Whether the level at `depth` still belongs to the scope holding `token`.
    fn owns(&self, depth: usize, token: u64) -> bool {
        depth > 0 && self.scopes.get(depth - 1) == Some(&token)
    }

    fn restore_all(&mut self) {
        self.scopes.pop();
        self.runtime.restore();
        self.default_headers.restore();
        self.json_serializer.restore();
        self.rules.restore();
        self.sessions.restore();
    }
}

/// State shared between the facade and every installed interceptor.
pub(crate) struct MockState {
    pub(crate) enabled: AtomicBool,
    pub(crate) overrides: RwLock<Overrides>,
    pub(crate) settings: MockSettings,
    pub(crate) requests_total: AtomicU64,
    pub(crate) requests_matched: AtomicU64,
    pub(crate) requests_unmatched: AtomicU64,
    next_rule: AtomicU64,
    next_scope: AtomicU64,
}

/// Entry point for tests: enters scopes and installs interceptors.
#[derive(Clone)]
pub struct Mocker {
    state: Arc<MockState>,
    engine: Arc<TemplateEngine>,
}

impl Mocker {
    pub fn new(config: MockerConfig) -> Self {
        let settings = config.settings.clone();
        info!(
            initial_rules = config.initial_rules.len(),
            nested = settings.allow_nested_scopes,
            "Mocker initialized"
        );

        Self {
            state: Arc::new(MockState {
                enabled: AtomicBool::new(false),
                overrides: RwLock::new(Overrides::new(config)),
                settings,
                requests_total: AtomicU64::new(0),
                requests_matched: AtomicU64::new(0),
                requests_unmatched: AtomicU64::new(0),
                next_rule: AtomicU64::new(1),
                next_scope: AtomicU64::new(1),
            }),
            engine: Arc::new(TemplateEngine::new()),
        }
    }

    /// Wrap `transport` with this mocker's interceptor.
    ///
    /// Installing onto a transport that already carries this mocker's
    /// interceptor returns it unchanged.
    pub fn install(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        if let Some(interceptor) = transport.as_interceptor() {
            if interceptor.is_installed_by(&self.state) {
                debug!("Interceptor already installed");
                return transport;
            }
        }
        Arc::new(Interceptor::new(self.state.clone(), transport))
    }

    /// Session builder with this mocker installed.
    pub fn session(&self) -> SessionBuilder {
        SessionBuilder::default().mocker(self)
    }

    /// Enter a scope with default options.
    pub fn scope(&self) -> Result<MockScope<'_>> {
        self.enter(ScopeOptions::default())
    }

    /// Enter a scope. Mocking stays enabled until the returned guard drops.
    ///
    /// Fails with [`MockError::AlreadyActive`] if nesting is disabled and a
    /// scope is already active; the active scope is left untouched.
    pub fn enter(&self, options: ScopeOptions) -> Result<MockScope<'_>> {
        // Compile everything before touching shared state
        let mut rules = options.rules;
        for path in &options.fixtures {
            let fixture = MockFixture::from_file(path)
                .map_err(|e| MockError::Fixture(format!("{:#}", e)))?;
            rules.extend(
                compile_fixture(&fixture, &self.engine)
                    .map_err(|e| MockError::Fixture(format!("{:#}", e)))?,
            );
        }

        let mut overrides = self.state.overrides.write();

        // All cells share one depth limit, so the first activation decides
        let depth = overrides.rules.activate_copy()?;
        overrides.rules.value_mut().extend(rules);

        let _ = overrides.sessions.activate_copy()?;
        overrides.sessions.value_mut().extend(options.sessions);

        let runtime = options.runtime.or_else(|| overrides.runtime.value().clone());
        let _ = overrides.runtime.activate(runtime)?;

        let headers = options
            .default_headers
            .unwrap_or_else(|| overrides.default_headers.value().clone());
        let _ = overrides.default_headers.activate(headers)?;

        let serializer = options
            .json_serializer
            .unwrap_or_else(|| overrides.json_serializer.value().clone());
        let _ = overrides.json_serializer.activate(serializer)?;

        let token = self.state.next_scope.fetch_add(1, Ordering::Relaxed);
        overrides.scopes.push(token);
        self.state.enabled.store(true, Ordering::SeqCst);
        info!(
            depth,
            rules = overrides.rules.value().len(),
            "Mock scope entered"
        );

        Ok(MockScope {
            mocker: self,
            depth,
            token,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Number of scopes currently entered.
    pub fn depth(&self) -> usize {
        self.state.overrides.read().depth()
    }

    /// Default response headers of the current scope.
    pub fn default_headers(&self) -> HeaderMap {
        self.state.overrides.read().default_headers.value().clone()
    }

    pub fn json_serializer(&self) -> JsonSerializer {
        self.state.overrides.read().json_serializer.value().clone()
    }

    pub fn runtime(&self) -> Option<Handle> {
        self.state.overrides.read().runtime.value().clone()
    }

    /// Rules visible to the current scope, in precedence order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.state.overrides.read().rules.value().clone()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.state.overrides.read().sessions.value().clone()
    }

    /// Total requests seen by interceptors.
    pub fn total_requests(&self) -> u64 {
        self.state.requests_total.load(Ordering::Relaxed)
    }

    /// Total requests answered by a rule.
    pub fn total_matched(&self) -> u64 {
        self.state.requests_matched.load(Ordering::Relaxed)
    }

    /// Total requests that reached the matcher but matched no rule.
    pub fn total_unmatched(&self) -> u64 {
        self.state.requests_unmatched.load(Ordering::Relaxed)
    }

    fn next_rule_id(&self) -> String {
        format!("rule-{}", self.state.next_rule.fetch_add(1, Ordering::Relaxed))
    }

    fn exit_to(&self, depth: usize, token: u64) {
        let mut overrides = self.state.overrides.write();
        // Already unwound by an outer scope, possibly reused by a newer one
        if !overrides.owns(depth, token) {
            return;
        }
        if overrides.depth() > depth {
            warn!(
                depth,
                active = overrides.depth(),
                "Scope exited before its inner scopes; unwinding them too"
            );
        }
        while overrides.depth() >= depth {
            overrides.restore_all();
        }

        let remaining = overrides.depth();
        self.state.enabled.store(remaining > 0, Ordering::SeqCst);
        info!(depth, remaining, "Mock scope exited");
    }
}

fn compile_fixture(
    fixture: &MockFixture,
    engine: &Arc<TemplateEngine>,
) -> anyhow::Result<Vec<Arc<Rule>>> {
    let mut rules = Vec::new();
    for (i, definition) in fixture.rules.iter().enumerate() {
        rules.extend(
            Rule::from_definition(i, definition, engine)?
                .into_iter()
                .map(Arc::new),
        );
    }
    Ok(rules)
}

/// An entered scope. Dropping it restores every override.
#[must_use = "the scope exits as soon as the guard is dropped"]
pub struct MockScope<'a> {
    mocker: &'a Mocker,
    depth: usize,
    token: u64,
}

impl<'a> MockScope<'a> {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn mocker(&self) -> &'a Mocker {
        self.mocker
    }

    /// Start a rule for `method` (any case) and `pattern`.
    pub fn register(&self, method: &str, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        RuleBuilder::new(self, Some(method.to_string()), pattern.into())
    }

    /// Start a rule that accepts every method.
    pub fn any(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        RuleBuilder::new(self, None, pattern.into())
    }

    pub fn get(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("GET", pattern)
    }

    pub fn post(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("POST", pattern)
    }

    pub fn put(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("PUT", pattern)
    }

    pub fn patch(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("PATCH", pattern)
    }

    pub fn delete(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("DELETE", pattern)
    }

    pub fn head(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("HEAD", pattern)
    }

    pub fn options(&self, pattern: impl Into<UrlPattern>) -> RuleBuilder<'_, 'a> {
        self.register("OPTIONS", pattern)
    }

    /// Append a prebuilt rule to this scope.
    pub fn add_rule(&self, rule: Rule) -> RuleHandle {
        let rule = Arc::new(rule);
        let mut overrides = self.mocker.state.overrides.write();
        if overrides.owns(self.depth, self.token) {
            if let Some(rules) = overrides.rules.level_mut(self.depth) {
                rules.push(rule.clone());
            }
        } else {
            warn!(rule_id = %rule.id(), "Scope already exited, rule ignored");
        }
        debug!(rule_id = %rule.id(), depth = self.depth, "Rule registered");
        RuleHandle(rule)
    }

    /// Append every rule of a YAML fixture to this scope.
    pub fn load_fixture(&self, path: &Path) -> anyhow::Result<usize> {
        let fixture = MockFixture::from_file(path)?;
        let rules = compile_fixture(&fixture, &self.mocker.engine)?;
        let count = rules.len();

        let mut overrides = self.mocker.state.overrides.write();
        if !overrides.owns(self.depth, self.token) {
            anyhow::bail!("Scope already exited");
        }
        if let Some(level) = overrides.rules.level_mut(self.depth) {
            level.extend(rules);
        }
        Ok(count)
    }

    /// Exit explicitly; equivalent to dropping the guard.
    pub fn exit(self) {}
}

impl Drop for MockScope<'_> {
    fn drop(&mut self) {
        self.mocker.exit_to(self.depth, self.token);
    }
}

/// Handle to a registered rule.
#[derive(Debug, Clone)]
pub struct RuleHandle(Arc<Rule>);

impl RuleHandle {
    pub fn id(&self) -> &str {
        self.0.id()
    }

    /// Number of requests this rule answered.
    pub fn hits(&self) -> u32 {
        self.0.hits()
    }

    pub fn is_exhausted(&self) -> bool {
        self.0.is_exhausted()
    }
}

/// Builds a rule and registers it on its scope.
pub struct RuleBuilder<'s, 'a> {
    scope: &'s MockScope<'a>,
    id: Option<String>,
    method: Option<String>,
    pattern: UrlPattern,
    constraints: Constraints,
    max_matches: u32,
}

impl<'s, 'a> RuleBuilder<'s, 'a> {
    fn new(scope: &'s MockScope<'a>, method: Option<String>, pattern: UrlPattern) -> Self {
        Self {
            scope,
            id: None,
            method,
            pattern,
            constraints: Constraints::default(),
            max_matches: 0,
        }
    }

    /// Identifier used in logs.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, matcher: QueryMatcher) -> Self {
        self.constraints.query.push((name.into(), matcher));
        self
    }

    pub fn header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.constraints.headers.push((name.into(), matcher));
        self
    }

    pub fn body(mut self, matcher: BodyMatcher) -> Self {
        self.constraints.body = Some(matcher);
        self
    }

    /// Answer at most `n` requests, then let later rules (or the network)
    /// handle them.
    pub fn times(mut self, n: u32) -> Self {
        self.max_matches = n;
        self
    }

    /// Answer with a fixed response.
    pub fn respond(self, response: MockResponse) -> Result<RuleHandle> {
        self.respond_with_responder(Arc::new(response))
    }

    /// Answer with a response generated per request.
    pub fn respond_with<F>(self, f: F) -> Result<RuleHandle>
    where
        F: Fn(&MatchContext) -> MockResponse + Send + Sync + 'static,
    {
        self.respond_with_responder(Arc::new(FnResponder(f)))
    }

    /// Answer with a response rendered from a template.
    pub fn respond_with_template(self, template: TemplateResponse) -> Result<RuleHandle> {
        let template = template.with_engine(self.scope.mocker.engine.clone());
        self.respond_with_responder(Arc::new(template))
    }

    pub fn respond_with_responder(self, responder: Arc<dyn Responder>) -> Result<RuleHandle> {
        let id = self
            .id
            .unwrap_or_else(|| self.scope.mocker.next_rule_id());
        let rule = Rule::new(id, self.method.as_deref(), self.pattern, responder)?
            .with_constraints(self.constraints)
            .with_max_matches(self.max_matches);
        Ok(self.scope.add_rule(rule))
    }
}
