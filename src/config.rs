//! Configuration for the mocker.
//!
//! Defines mocker settings and the YAML fixture format used to preload rules.

use crate::response::{MockResponse, DEFAULT_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A fixture file: rules plus optional settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockFixture {
    /// Rule definitions, in precedence order
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    /// Settings
    #[serde(default)]
    pub settings: MockSettings,
}

impl MockFixture {
    /// Load a fixture from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read fixture {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse a fixture from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let fixture: Self = serde_yaml::from_str(yaml)?;
        fixture.validate()?;
        Ok(fixture)
    }

    /// Validate the fixture.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("Rule {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// A single rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Identifier, used in logs
    #[serde(default)]
    pub id: Option<String>,

    /// Request matcher
    pub request: RequestMatcher,

    /// Response to return
    pub response: ResponseDefinition,

    /// Maximum number of times this rule can be matched (0 = unlimited)
    #[serde(default)]
    pub max_matches: u32,
}

impl RuleDefinition {
    /// Validate the rule definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if matches!(&self.id, Some(id) if id.is_empty()) {
            anyhow::bail!("Rule id cannot be empty");
        }
        self.request.validate()?;
        self.response.validate()?;
        Ok(())
    }
}

/// Request matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub method: Vec<String>,

    /// URL matching
    pub url: UrlMatcher,

    /// Query parameter constraints
    #[serde(default)]
    pub query: HashMap<String, QueryMatcher>,

    /// Header constraints
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatcher>,

    /// Body constraint
    #[serde(default)]
    pub body: Option<BodyMatcher>,
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        for method in &self.method {
            http::Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| anyhow::anyhow!("Invalid method: {}", method))?;
        }
        self.url.validate()?;
        for (name, qm) in &self.query {
            if let QueryMatcher::Regex { pattern } = qm {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("Invalid regex for query {}: {}", name, e))?;
            }
        }
        for (name, hm) in &self.headers {
            if let HeaderMatcher::Regex { pattern } = hm {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("Invalid regex for header {}: {}", name, e))?;
            }
        }
        if let Some(BodyMatcher::Regex { pattern }) = &self.body {
            regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid body regex: {}", e))?;
        }
        Ok(())
    }
}

/// URL matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UrlMatcher {
    /// Exact URL or path, query compared after normalization
    Exact { value: String },
    /// URL or path prefix
    Prefix { value: String },
    /// Regex searched in the normalized URL
    Regex { pattern: String },
    /// Glob pattern on the path
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl UrlMatcher {
    /// Validate the URL matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            UrlMatcher::Regex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
            }
            UrlMatcher::Glob { pattern } => {
                globset::Glob::new(pattern).map_err(|e| anyhow::anyhow!("Invalid glob: {}", e))?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path matching
    JsonPath {
        /// JSON path expressions and expected values
        expressions: HashMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Status reason phrase
    #[serde(default)]
    pub reason: Option<String>,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBodyDefinition>,

    /// Whether this is a template response
    #[serde(default)]
    pub template: bool,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }

    /// Build a static response from this definition.
    ///
    /// Non-JSON bodies get their natural content type unless the headers
    /// already name one.
    pub fn to_mock_response(&self) -> anyhow::Result<MockResponse> {
        let mut builder = MockResponse::builder().status(self.status);
        if let Some(reason) = &self.reason {
            builder = builder.reason(reason);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let has_content_type = self
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));

        match &self.body {
            Some(ResponseBodyDefinition::Json { content }) => {
                builder = builder.json(content);
            }
            Some(body) => {
                if !has_content_type {
                    builder = builder.content_type(body.content_type());
                }
                builder = builder.body(body.to_bytes()?);
            }
            None => {}
        }

        Ok(builder.build()?)
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBodyDefinition {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBodyDefinition {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBodyDefinition::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBodyDefinition::Json { content } => {
                Ok(serde_json::to_string(content)?.into_bytes())
            }
            ResponseBodyDefinition::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBodyDefinition::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBodyDefinition::Text { .. } => "text/plain",
            ResponseBodyDefinition::Json { .. } => "application/json",
            ResponseBodyDefinition::Base64 { .. } => "application/octet-stream",
            ResponseBodyDefinition::File { .. } => "application/octet-stream",
        }
    }
}

/// Mocker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockSettings {
    /// Log matched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests that fell through to the network
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Allow entering a scope while another one is active
    #[serde(default = "default_true")]
    pub allow_nested_scopes: bool,

    /// Size of the chunks a synthesized body is delivered in
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Content type applied when neither response nor defaults set one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            allow_nested_scopes: true,
            chunk_size: default_chunk_size(),
            default_content_type: default_content_type(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}
