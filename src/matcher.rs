//! Request matching logic.
//!
//! Rules are scanned in registration order and the first one whose method,
//! URL pattern and constraints all accept the request wins. No match is not
//! an error: the caller forwards the request to the real network.

use crate::config::{BodyMatcher, HeaderMatcher, QueryMatcher, RuleDefinition, UrlMatcher};
use crate::error::{MockError, Result};
use crate::normalize::{normalize_url, query_pairs, sorted_pairs};
use crate::response::MockResponse;
use crate::template::{TemplateBody, TemplateEngine, TemplateResponse};
use bytes::Bytes;
use http::{HeaderMap, Method};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use url::Url;

/// Context captured during matching, handed to response generators.
#[derive(Debug, Clone)]
pub struct MatchContext {
    /// Request method
    pub method: Method,
    /// Normalized request URL
    pub url: Url,
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request headers, lowercase names, first value
    pub headers: HashMap<String, String>,
    /// Request body, when it was buffered
    pub body: Option<Bytes>,
}

impl MatchContext {
    pub fn new(method: Method, url: Url) -> Self {
        let query_params = query_pairs(&url).into_iter().collect();
        Self {
            method,
            url,
            path_params: HashMap::new(),
            query_params,
            captures: HashMap::new(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// Produces the response for a matched request.
pub trait Responder: Send + Sync {
    fn respond(&self, ctx: &MatchContext) -> Result<MockResponse>;
}

impl Responder for MockResponse {
    fn respond(&self, _ctx: &MatchContext) -> Result<MockResponse> {
        Ok(self.clone())
    }
}

/// Adapts a closure into a [`Responder`].
pub struct FnResponder<F>(pub F);

impl<F> Responder for FnResponder<F>
where
    F: Fn(&MatchContext) -> MockResponse + Send + Sync,
{
    fn respond(&self, ctx: &MatchContext) -> Result<MockResponse> {
        Ok((self.0)(ctx))
    }
}

/// An outgoing request, as seen by the matcher.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    /// Normalized URL
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestParts {
    /// Normalizes `url` on the way in.
    pub fn new(method: Method, url: &Url, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            method,
            url: normalize_url(url),
            headers,
            body,
        }
    }

    fn header_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (name, value) in &self.headers {
            if let Ok(value) = value.to_str() {
                map.entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        map
    }
}

/// How a rule selects URLs.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    /// Literal URL or path; query compared after normalization
    Exact(ExactPattern),
    /// URL or path prefix
    Prefix(String),
    /// Regex searched in the full normalized URL
    Regex(Regex),
    /// Glob on the path
    Glob(globset::GlobMatcher),
    /// Path template such as `/users/{id}`
    Template(PathTemplate),
}

impl UrlPattern {
    /// Literal pattern. Absolute URLs also pin scheme, host and port.
    pub fn exact(pattern: &str) -> Self {
        UrlPattern::Exact(ExactPattern::parse(pattern))
    }

    /// Path prefixes (leading `/`) are encoded like request paths.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if prefix.starts_with('/') && !prefix.contains(['?', '#']) {
            UrlPattern::Prefix(encode_path(&prefix))
        } else {
            UrlPattern::Prefix(prefix)
        }
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(UrlPattern::Regex)
            .map_err(|e| MockError::InvalidPattern(format!("{}: {}", pattern, e)))
    }

    pub fn glob(pattern: &str) -> Result<Self> {
        globset::Glob::new(pattern)
            .map(|g| UrlPattern::Glob(g.compile_matcher()))
            .map_err(|e| MockError::InvalidPattern(format!("{}: {}", pattern, e)))
    }

    pub fn template(template: &str) -> Self {
        UrlPattern::Template(PathTemplate::parse(template))
    }

    fn from_matcher(matcher: &UrlMatcher) -> Result<Self> {
        Ok(match matcher {
            UrlMatcher::Exact { value } => Self::exact(value),
            UrlMatcher::Prefix { value } => Self::prefix(value.clone()),
            UrlMatcher::Regex { pattern } => Self::regex(pattern)?,
            UrlMatcher::Glob { pattern } => Self::glob(pattern)?,
            UrlMatcher::Template { template } => Self::template(template),
        })
    }

    fn matches(&self, url: &Url, context: &mut MatchContext) -> bool {
        match self {
            UrlPattern::Exact(exact) => exact.matches(url),
            UrlPattern::Prefix(prefix) => {
                if prefix.starts_with('/') {
                    url.path().starts_with(prefix.as_str())
                } else {
                    url.as_str().starts_with(prefix.as_str())
                }
            }
            UrlPattern::Regex(regex) => {
                if let Some(captures) = regex.captures(url.as_str()) {
                    for (i, cap) in captures.iter().enumerate().skip(1) {
                        if let Some(m) = cap {
                            context.captures.insert(i.to_string(), m.as_str().to_string());
                        }
                    }
                    for name in regex.capture_names().flatten() {
                        if let Some(m) = captures.name(name) {
                            context.captures.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    true
                } else {
                    false
                }
            }
            UrlPattern::Glob(glob) => glob.is_match(url.path()),
            UrlPattern::Template(template) => match template.matches(url.path()) {
                Some(params) => {
                    context.path_params = params;
                    true
                }
                None => false,
            },
        }
    }
}

impl From<&str> for UrlPattern {
    fn from(pattern: &str) -> Self {
        Self::exact(pattern)
    }
}

impl From<String> for UrlPattern {
    fn from(pattern: String) -> Self {
        Self::exact(&pattern)
    }
}

impl From<&Url> for UrlPattern {
    fn from(url: &Url) -> Self {
        Self::exact(url.as_str())
    }
}

impl From<Url> for UrlPattern {
    fn from(url: Url) -> Self {
        Self::from(&url)
    }
}

impl From<Regex> for UrlPattern {
    fn from(regex: Regex) -> Self {
        UrlPattern::Regex(regex)
    }
}

/// A literal URL pattern.
#[derive(Debug, Clone)]
pub struct ExactPattern {
    /// Scheme, host and port, for absolute patterns
    origin: Option<(String, Option<String>, Option<u16>)>,
    path: String,
    /// Sorted pairs; None means "any query"
    query: Option<Vec<(String, String)>>,
}

impl ExactPattern {
    fn parse(pattern: &str) -> Self {
        if let Ok(url) = Url::parse(pattern) {
            return Self {
                origin: Some((
                    url.scheme().to_string(),
                    url.host_str().map(str::to_string),
                    url.port_or_known_default(),
                )),
                path: url.path().to_string(),
                query: url.query().map(sorted_pairs).filter(|p| !p.is_empty()),
            };
        }

        let without_fragment = pattern.split('#').next().unwrap_or(pattern);
        let (path, query) = match without_fragment.split_once('?') {
            Some((path, query)) => (path, Some(sorted_pairs(query)).filter(|p| !p.is_empty())),
            None => (without_fragment, None),
        };
        Self {
            origin: None,
            path: encode_path(path),
            query,
        }
    }

    fn matches(&self, url: &Url) -> bool {
        if let Some((scheme, host, port)) = &self.origin {
            if url.scheme() != scheme
                || url.host_str() != host.as_deref()
                || url.port_or_known_default() != *port
            {
                return false;
            }
        }
        if url.path() != self.path {
            return false;
        }
        match &self.query {
            // Path-only patterns ignore the query entirely
            None => true,
            // Extra request parameters are a mismatch
            Some(expected) => query_pairs(url) == *expected,
        }
    }
}

/// Percent-encode a pattern path the way `Url` encodes request paths.
fn encode_path(path: &str) -> String {
    Url::parse("http://pattern.invalid/")
        .and_then(|base| base.join(path))
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| path.to_string())
}

/// Path template with `{name}` parameters.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_param = false;
        let mut param_name = String::new();

        for ch in template.chars() {
            if ch == '{' && !in_param {
                if !current.is_empty() {
                    segments.push(TemplateSegment::Literal(current.clone()));
                    current.clear();
                }
                in_param = true;
                param_name.clear();
            } else if ch == '}' && in_param {
                segments.push(TemplateSegment::Param(param_name.clone()));
                in_param = false;
                param_name.clear();
            } else if in_param {
                param_name.push(ch);
            } else {
                current.push(ch);
            }
        }

        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut remaining = path;

        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    // A parameter runs up to the next literal, or to the next slash
                    let end_pos = match self.segments.get(idx + 1) {
                        Some(TemplateSegment::Literal(next_lit)) => {
                            remaining.find(next_lit.as_str()).unwrap_or(remaining.len())
                        }
                        _ => remaining.find('/').unwrap_or(remaining.len()),
                    };

                    if end_pos == 0 {
                        return None;
                    }

                    params.insert(name.clone(), remaining[..end_pos].to_string());
                    remaining = &remaining[end_pos..];
                }
            }
        }

        // Must consume entire path
        if remaining.is_empty() {
            Some(params)
        } else {
            None
        }
    }
}

/// Extra request constraints beyond method and URL.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub query: Vec<(String, QueryMatcher)>,
    pub headers: Vec<(String, HeaderMatcher)>,
    pub body: Option<BodyMatcher>,
}

impl Constraints {
    fn matches(&self, request: &RequestParts, context: &MatchContext) -> bool {
        self.query
            .iter()
            .all(|(name, qm)| matches_query(&context.query_params, name, qm))
            && self
                .headers
                .iter()
                .all(|(name, hm)| matches_header(&context.headers, name, hm))
            && self
                .body
                .as_ref()
                .map_or(true, |bm| matches_body(request.body.as_deref(), bm))
    }
}

/// A registered rule.
pub struct Rule {
    id: String,
    /// None matches any method
    method: Option<Method>,
    pattern: UrlPattern,
    constraints: Constraints,
    responder: Arc<dyn Responder>,
    /// 0 = unlimited
    max_matches: u32,
    hits: AtomicU32,
}

impl Rule {
    /// Create a rule. The method is compared case-insensitively.
    pub fn new(
        id: impl Into<String>,
        method: Option<&str>,
        pattern: impl Into<UrlPattern>,
        responder: Arc<dyn Responder>,
    ) -> Result<Self> {
        let method = method
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| MockError::InvalidPattern(format!("invalid method {}", m)))
            })
            .transpose()?;

        Ok(Self {
            id: id.into(),
            method,
            pattern: pattern.into(),
            constraints: Constraints::default(),
            responder,
            max_matches: 0,
            hits: AtomicU32::new(0),
        })
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_max_matches(mut self, max_matches: u32) -> Self {
        self.max_matches = max_matches;
        self
    }

    /// Compile a fixture rule. One rule per listed method, none when the
    /// list is empty (any method).
    pub fn from_definition(
        index: usize,
        definition: &RuleDefinition,
        engine: &Arc<TemplateEngine>,
    ) -> anyhow::Result<Vec<Rule>> {
        definition.validate()?;
        let id = definition
            .id
            .clone()
            .unwrap_or_else(|| format!("fixture-{}", index));

        let responder: Arc<dyn Responder> = if definition.response.template {
            Arc::new(template_from_definition(definition, engine)?)
        } else {
            Arc::new(definition.response.to_mock_response()?)
        };

        let constraints = Constraints {
            query: definition.request.query.clone().into_iter().collect(),
            headers: definition.request.headers.clone().into_iter().collect(),
            body: definition.request.body.clone(),
        };
        let pattern = UrlPattern::from_matcher(&definition.request.url)?;

        let methods: Vec<Option<&str>> = if definition.request.method.is_empty() {
            vec![None]
        } else {
            definition.request.method.iter().map(|m| Some(m.as_str())).collect()
        };

        let mut rules = Vec::with_capacity(methods.len());
        for method in methods {
            let rule = Rule::new(id.clone(), method, pattern.clone(), responder.clone())?
                .with_constraints(constraints.clone())
                .with_max_matches(definition.max_matches);
            rules.push(rule);
        }
        Ok(rules)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Number of requests this rule has answered.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_matches != 0 && self.hits() >= self.max_matches
    }

    pub fn respond(&self, ctx: &MatchContext) -> Result<MockResponse> {
        self.responder.respond(ctx)
    }

    /// Give back a hit taken by a match whose response could not be built.
    pub(crate) fn release(&self) {
        let _ = self
            .hits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Count a match, unless the rule is exhausted.
    fn try_acquire(&self) -> bool {
        let max = self.max_matches;
        self.hits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if max == 0 || n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn matches_request(&self, request: &RequestParts) -> Option<MatchContext> {
        if let Some(method) = &self.method {
            if !method.as_str().eq_ignore_ascii_case(request.method.as_str()) {
                return None;
            }
        }

        let mut context = MatchContext::new(request.method.clone(), request.url.clone());
        context.headers = request.header_map();
        context.body = request.body.clone();

        if !self.pattern.matches(&request.url, &mut context) {
            return None;
        }
        if !self.constraints.matches(request, &context) {
            return None;
        }
        Some(context)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("max_matches", &self.max_matches)
            .field("hits", &self.hits())
            .finish()
    }
}

fn template_from_definition(
    definition: &RuleDefinition,
    engine: &Arc<TemplateEngine>,
) -> anyhow::Result<TemplateResponse> {
    use crate::config::ResponseBodyDefinition;

    let response = &definition.response;
    let body = match &response.body {
        Some(ResponseBodyDefinition::Json { content }) => TemplateBody::Json(content.clone()),
        Some(ResponseBodyDefinition::Text { content }) => TemplateBody::Text(content.clone()),
        Some(other) => TemplateBody::Text(String::from_utf8(other.to_bytes()?)?),
        None => TemplateBody::Json(serde_json::Value::Null),
    };

    let mut template = TemplateResponse::new(response.status, body).with_engine(engine.clone());
    if let Some(reason) = &response.reason {
        template = template.reason(reason);
    }
    for (name, value) in &response.headers {
        template = template.header(name, value);
    }
    Ok(template)
}

/// Result of matching a request against the registered rules.
#[derive(Debug)]
pub struct MatchResult {
    /// The matched rule
    pub rule: Arc<Rule>,
    /// Context captured during matching
    pub context: MatchContext,
}

/// Find the first rule, in registration order, that accepts the request.
///
/// Exhausted rules are skipped. A successful match counts as a hit.
pub fn find_match(rules: &[Arc<Rule>], request: &RequestParts) -> Option<MatchResult> {
    for rule in rules {
        if let Some(context) = rule.matches_request(request) {
            if !rule.try_acquire() {
                tracing::debug!(rule_id = %rule.id, "Rule exhausted (max_matches reached)");
                continue;
            }
            return Some(MatchResult {
                rule: rule.clone(),
                context,
            });
        }
    }
    None
}

fn matches_query(query_params: &HashMap<String, String>, name: &str, matcher: &QueryMatcher) -> bool {
    match matcher {
        QueryMatcher::Exact { value } => query_params.get(name) == Some(value),
        QueryMatcher::Regex { pattern } => {
            if let Some(val) = query_params.get(name) {
                if let Ok(regex) = Regex::new(pattern) {
                    return regex.is_match(val);
                }
            }
            false
        }
        QueryMatcher::Present => query_params.contains_key(name),
        QueryMatcher::Absent => !query_params.contains_key(name),
    }
}

fn matches_header(headers: &HashMap<String, String>, name: &str, matcher: &HeaderMatcher) -> bool {
    // Names are stored lowercase
    let header_value = headers.get(&name.to_ascii_lowercase());

    match matcher {
        HeaderMatcher::Exact { value } => header_value == Some(value),
        HeaderMatcher::Regex { pattern } => {
            if let Some(val) = header_value {
                if let Ok(regex) = Regex::new(pattern) {
                    return regex.is_match(val);
                }
            }
            false
        }
        HeaderMatcher::Present => header_value.is_some(),
        HeaderMatcher::Absent => header_value.is_none(),
        HeaderMatcher::Contains { value } => {
            header_value.map(|v| v.contains(value.as_str())).unwrap_or(false)
        }
    }
}

fn matches_body(body: Option<&[u8]>, matcher: &BodyMatcher) -> bool {
    let body_str = body.and_then(|b| std::str::from_utf8(b).ok());

    match matcher {
        BodyMatcher::Exact { value } => body_str == Some(value.as_str()),
        BodyMatcher::Regex { pattern } => {
            if let Some(bs) = body_str {
                if let Ok(regex) = Regex::new(pattern) {
                    return regex.is_match(bs);
                }
            }
            false
        }
        BodyMatcher::JsonPath { expressions } => {
            if let Some(bs) = body_str {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(bs) {
                    return matches_json_paths(&json, expressions);
                }
            }
            false
        }
        BodyMatcher::Contains { value } => body_str.map(|bs| bs.contains(value.as_str())).unwrap_or(false),
        BodyMatcher::Json => body_str
            .map(|bs| serde_json::from_str::<serde_json::Value>(bs).is_ok())
            .unwrap_or(false),
        BodyMatcher::Empty => body.map(|b| b.is_empty()).unwrap_or(true),
    }
}

fn matches_json_paths(
    json: &serde_json::Value,
    expressions: &HashMap<String, serde_json::Value>,
) -> bool {
    use jsonpath_rust::JsonPath;

    for (path_expr, expected) in expressions {
        let path = match JsonPath::try_from(path_expr.as_str()) {
            Ok(p) => p,
            Err(_) => return false,
        };

        // Found values come back wrapped in an array; Null means no value
        let found = match path.find(json) {
            serde_json::Value::Array(values) => values,
            _ => Vec::new(),
        };

        // A null expectation only checks that the path resolves
        let matches = if expected.is_null() {
            !found.is_empty()
        } else {
            found.iter().any(|v| v == expected) || expected.as_array() == Some(&found)
        };
        if !matches {
            return false;
        }
    }
    true
}
