//! Reqwest Mock Responses
//!
//! Test-time interception for HTTP sessions built on `reqwest`. Inside a
//! mock scope, requests that match a registered rule are answered with a
//! synthesized `reqwest::Response`; everything else goes to the network.
//!
//! # Features
//!
//! - **Scoped Activation**: Entering a scope pushes overrides, leaving it pops them
//! - **Request Matching**: Match by method, URL (exact, prefix, regex, glob, template), query, headers, body
//! - **Realistic Responses**: Status, headers, cookies, URL and a chunked body stream
//! - **Dynamic Templates**: Use Handlebars templates for dynamic responses
//! - **Session Allow-lists**: Mock only the sessions you name
//! - **Match Limits**: Limit how many times a rule can be matched
//! - **YAML Fixtures**: Load rules from files
//!
//! # Example
//!
//! ```no_run
//! use reqwest_mock_responses::{MockResponse, Mocker, MockerConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mocker = Mocker::new(MockerConfig::default());
//! let session = mocker.session().build()?;
//!
//! let scope = mocker.scope()?;
//! scope
//!     .get("https://api.test/items?category=books")
//!     .respond(MockResponse::json(200, &json!([{"id": 1}]))?)?;
//!
//! let response = session
//!     .send(session.get("https://api.test/items?category=books"))
//!     .await?;
//! assert_eq!(response.status(), 200);
//! drop(scope);
//! # Ok(())
//! # }
//! ```
//!
//! # Example Fixture
//!
//! ```yaml
//! rules:
//!   - id: list-items
//!     request:
//!       method: [GET]
//!       url:
//!         type: exact
//!         value: /items?category=books
//!     response:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           - id: 1
//! ```

pub mod config;
pub mod error;
pub mod interceptor;
pub mod matcher;
pub mod mocker;
pub mod normalize;
pub mod response;
pub mod scoped;
pub mod session;
pub mod template;
pub mod transport;

pub use config::{MockFixture, MockSettings};
pub use error::{MockError, Result};
pub use interceptor::{Interceptor, RequestInfo, StatusReason};
pub use matcher::{MatchContext, Responder, Rule, UrlPattern};
pub use mocker::{MockScope, Mocker, MockerConfig, RuleBuilder, RuleHandle, ScopeOptions};
pub use response::{JsonSerializer, MockResponse, MockResponseBuilder};
pub use session::{Session, SessionBuilder};
pub use template::TemplateResponse;
pub use transport::{ReqwestTransport, SessionId, SessionInfo, Transport};
