#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Transport-agnostic HTTP request engine for connectors
//!
//! This crate turns a [`QueryConfiguration`] into an HTTP exchange:
//! - Two-pass templating (URL path parameters, then `{placeholder:-default}` substitution)
//! - Authentication: Basic, RFC 2617 Digest, NTLM (transport level), static token,
//!   bearer, API key and `OAuth2` client credentials with a single-flight token cache
//! - Redirect policy with loop and cross-host detection
//! - Offset/limit pagination driven by the JSON response payload
//! - A pluggable [`Transport`] capability; [`HyperTransport`] is the default
//!   hyper + rustls implementation
//!
//! # Example
//!
//! ```ignore
//! use http_engine::{
//!     EngineConfig, HttpClientService, HttpExecutionEngine, PlaceholderConfiguration,
//!     QueryConfigurationBuilder, Substitutor,
//! };
//! use serde_json::json;
//!
//! let engine = HttpExecutionEngine::with_hyper_transport(EngineConfig::default());
//! let service = HttpClientService::new(engine).die_on_error(true);
//!
//! let record = json!({"input": {"token": "abc", "id": 42}});
//! let substitutor = Substitutor::from_json_record(PlaceholderConfiguration::default(), record);
//!
//! let query = QueryConfigurationBuilder::new("https://api.example.com/items/{id}")
//!     .add_path_param("id", "{/input/id}")
//!     .add_header("Authorization", "Bearer {/input/token}")
//!     .build(Some(&substitutor))?;
//!
//! let response = service.invoke(&query).await?;
//! let items: serde_json::Value = response.json().await?;
//! ```

pub mod auth;
mod config;
mod encoding;
mod engine;
mod error;
pub mod pagination;
pub mod query;
mod response;
mod secret;
mod service;
mod substitutor;
pub mod transport;

pub use auth::{
    ClientAuthMethod, DigestAlgorithm, DigestChallenge, DigestContext, DigestScheme,
    OAuth20FlowExecution, Token, TokenCache,
};
pub use config::{DEFAULT_USER_AGENT, EngineConfig, PlaceholderConfiguration, TransportSecurity};
pub use engine::{AllowAll, HostAllowList, HttpExecutionEngine, UrlAllowList};
pub use error::{AuthenticationError, ConfigurationError, HttpEngineError, TransportError};
pub use pagination::{NoPagination, OffsetLimitPaginationStrategy, PaginationStrategy};
pub use query::{
    ApiKeyDestination, Attachment, Authentication, Body, BodyFormat, KeyValuePair,
    OAuth20Configuration, PaginationConfig, PaginationState, ParamLocation,
    ProxyConfiguration, ProxyType, QueryConfiguration, QueryConfigurationBuilder,
    RedirectPolicy, ResponseFormat,
};
pub use response::{HttpResponse, StatusClass};
pub use secret::SecretString;
pub use service::{HttpClientService, QueryDescriptor};
pub use substitutor::Substitutor;
pub use transport::{
    HyperTransport, HyperTransportFactory, OutgoingRequest, RawResponse, Timeouts, Transport,
    TransportCredentials, TransportFactory, TrustPolicy,
};
