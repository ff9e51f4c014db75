//! Template engine for dynamic responses.
//!
//! Uses Handlebars for template rendering with the matched request context.

use crate::error::Result;
use crate::matcher::{MatchContext, Responder};
use crate::response::MockResponse;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Path parameters from URL template matching
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers (lowercase names)
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Normalized request URL
    pub url: String,
    /// Request path
    pub request_path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl TemplateContext {
    fn from_match(ctx: &MatchContext) -> Self {
        let body = ctx
            .body
            .as_ref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(String::from);
        let json = body.as_ref().and_then(|s| serde_json::from_str(s).ok());

        Self {
            path: ctx.path_params.clone(),
            query: ctx.query_params.clone(),
            headers: ctx.headers.clone(),
            captures: ctx.captures.clone(),
            method: ctx.method.to_string(),
            url: ctx.url.to_string(),
            request_path: ctx.url.path().to_string(),
            body,
            json,
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Bodies are JSON or plain text, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string against a matched request.
    pub fn render(&self, template: &str, ctx: &MatchContext) -> Result<String> {
        let ctx = TemplateContext::from_match(ctx);
        Ok(self.handlebars.render_template(template, &ctx)?)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        ctx: &MatchContext,
    ) -> Result<serde_json::Value> {
        let ctx = TemplateContext::from_match(ctx);
        Ok(self.render_json_value(json, &ctx)?)
    }

    fn render_json_value(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext,
    ) -> std::result::Result<serde_json::Value, handlebars::RenderError> {
        match value {
            serde_json::Value::String(s) => {
                if s.contains("{{") {
                    let rendered = self.handlebars.render_template(s, ctx)?;
                    Ok(serde_json::Value::String(rendered))
                } else {
                    Ok(value.clone())
                }
            }
            serde_json::Value::Array(arr) => {
                let rendered: std::result::Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.render_json_value(v, ctx))
                    .collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json_value(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of a [`TemplateResponse`].
#[derive(Debug, Clone)]
pub enum TemplateBody {
    /// Text template, rendered as a whole
    Text(String),
    /// JSON value whose string fields are templates
    Json(serde_json::Value),
}

/// A response rendered per request from the matched context.
#[derive(Clone)]
pub struct TemplateResponse {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: TemplateBody,
    engine: Arc<TemplateEngine>,
}

impl TemplateResponse {
    pub fn text(status: u16, template: impl Into<String>) -> Self {
        Self::new(status, TemplateBody::Text(template.into()))
    }

    pub fn json(status: u16, template: serde_json::Value) -> Self {
        Self::new(status, TemplateBody::Json(template))
    }

    pub fn new(status: u16, body: TemplateBody) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body,
            engine: Arc::new(TemplateEngine::new()),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Share one engine between several responses.
    pub fn with_engine(mut self, engine: Arc<TemplateEngine>) -> Self {
        self.engine = engine;
        self
    }
}

impl Responder for TemplateResponse {
    fn respond(&self, ctx: &MatchContext) -> Result<MockResponse> {
        let mut builder = MockResponse::builder().status(self.status);
        if let Some(reason) = &self.reason {
            builder = builder.reason(reason);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, self.engine.render(value, ctx)?);
        }
        builder = match &self.body {
            TemplateBody::Text(template) => builder.text(self.engine.render(template, ctx)?),
            TemplateBody::Json(template) => builder.json(&self.engine.render_json(template, ctx)?),
        };
        builder.build()
    }
}

// Custom Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(param) {
        out.write(&serde_json::to_string_pretty(&json).unwrap_or_default())?;
    } else {
        out.write(param)?;
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(v) if !v.is_null() => {
            if let Some(s) = v.as_str() {
                if !s.is_empty() {
                    out.write(s)?;
                    return Ok(());
                }
            } else {
                out.write(&v.to_string())?;
                return Ok(());
            }
        }
        _ => {}
    }

    out.write(default)?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
