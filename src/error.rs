//! Error types.

/// Errors raised by the mocking layer.
///
/// Usage errors fail fast at the call that misused the API. Real network
/// failures of passthrough calls are carried unchanged in [`MockError::Http`].
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("Scope already active (depth {depth}); nested activation is disabled")]
    AlreadyActive { depth: usize },

    #[error("Mock response can only accept one of a JSON body or a raw body")]
    ConflictingBodySpecification,

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Failed to serialize JSON body: {0}")]
    Serialize(String),

    #[error("Template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Fixture error: {0}")]
    Fixture(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = MockError> = std::result::Result<T, E>;
