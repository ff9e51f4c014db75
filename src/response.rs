//! Synthetic response descriptions.
//!
//! A [`MockResponse`] is immutable once built. It is consumed read-only every
//! time a rule matches, so the same description can back any number of
//! requests.

use crate::error::{MockError, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Default content type when neither the response nor the scope sets one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

type SerializeFn = dyn Fn(&Value) -> std::result::Result<Vec<u8>, String> + Send + Sync;

/// Encoder used to turn structured bodies into bytes.
///
/// Injected per scope so tests can swap in custom encodings (pretty
/// printing, non-standard date formats, ...).
#[derive(Clone)]
pub struct JsonSerializer(Arc<SerializeFn>);

impl JsonSerializer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        (self.0)(value).map_err(MockError::Serialize)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new(|value| serde_json::to_vec(value).map_err(|e| e.to_string()))
    }
}

impl fmt::Debug for JsonSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer(..)")
    }
}

/// Body source of a mock response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Structured value, encoded with the scope's serializer
    Json(Value),
    /// Raw bytes, returned unchanged
    Raw(Bytes),
}

/// Declarative description of a synthetic response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: ResponseBody,
}

impl MockResponse {
    pub fn builder() -> MockResponseBuilder {
        MockResponseBuilder::default()
    }

    /// Shorthand for a response with a JSON body.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self> {
        Self::builder().status(status).json(body).build()
    }

    /// Shorthand for a response with a raw body.
    pub fn raw(status: u16, body: impl Into<Bytes>) -> Result<Self> {
        Self::builder().status(status).body(body).build()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Materialize the body.
    pub fn build_body(&self, serializer: &JsonSerializer) -> Result<Bytes> {
        match &self.body {
            ResponseBody::Raw(bytes) => Ok(bytes.clone()),
            ResponseBody::Json(value) => serializer.serialize(value).map(Bytes::from),
        }
    }

    /// Merge scope defaults with this response's headers.
    ///
    /// Per-response headers replace every default value of the same name.
    /// `default_content_type` is only applied if neither side set one.
    pub fn merged_headers(&self, defaults: &HeaderMap, default_content_type: &str) -> HeaderMap {
        let mut merged = defaults.clone();
        for name in self.headers.keys() {
            merged.remove(name);
            for value in self.headers.get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }
        if !merged.contains_key(CONTENT_TYPE) {
            if let Ok(value) = HeaderValue::from_str(default_content_type) {
                merged.insert(CONTENT_TYPE, value);
            }
        }
        merged
    }
}

/// Builder for [`MockResponse`]. Errors are collected and reported by
/// [`MockResponseBuilder::build`].
#[derive(Debug)]
pub struct MockResponseBuilder {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String, bool)>,
    json: Option<std::result::Result<Value, String>>,
    raw: Option<Bytes>,
}

impl Default for MockResponseBuilder {
    fn default() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: Vec::new(),
            json: None,
            raw: None,
        }
    }
}

impl MockResponseBuilder {
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Status reason phrase, reported verbatim.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set a header, replacing earlier values of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into(), false));
        self
    }

    /// Add a header value without replacing earlier ones (e.g. `Set-Cookie`).
    pub fn append_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into(), true));
        self
    }

    pub fn content_type(self, value: impl Into<String>) -> Self {
        self.header(CONTENT_TYPE.as_str(), value)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.json = Some(serde_json::to_value(body).map_err(|e| e.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw = Some(body.into());
        self
    }

    pub fn text(self, body: impl Into<String>) -> Self {
        self.body(Bytes::from(body.into()))
    }

    pub fn build(self) -> Result<MockResponse> {
        if self.json.is_some() && self.raw.is_some() {
            return Err(MockError::ConflictingBodySpecification);
        }

        if !(100..=599).contains(&self.status) {
            return Err(MockError::InvalidStatus(self.status));
        }
        let status =
            StatusCode::from_u16(self.status).map_err(|_| MockError::InvalidStatus(self.status))?;

        let mut headers = HeaderMap::new();
        for (name, value, append) in self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| MockError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| MockError::InvalidHeader(format!("{}: {}", name, value)))?;
            if append {
                headers.append(header_name, header_value);
            } else {
                headers.insert(header_name, header_value);
            }
        }

        let body = match (self.json, self.raw) {
            (Some(json), None) => ResponseBody::Json(json.map_err(MockError::Serialize)?),
            (None, Some(raw)) => ResponseBody::Raw(raw),
            // No body given: encode JSON null, like any other structured body
            _ => ResponseBody::Json(Value::Null),
        };

        Ok(MockResponse {
            status,
            reason: self.reason,
            headers,
            body,
        })
    }
}
