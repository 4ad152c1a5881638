use std::time::Duration;
use thiserror::Error;

use crate::query::BodyFormat;

/// Invalid request descriptor, detected while building or preparing a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// The URL is empty or only whitespace
    #[error("URL must not be blank")]
    BlankUrl,

    /// The URL could not be parsed after templating
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A body was already configured with a different format
    #[error("Body format already set to {current}, can't switch to {requested}")]
    BodyFormatConflict {
        current: BodyFormat,
        requested: BodyFormat,
    },

    /// A different authentication was already configured
    #[error("Authentication already set to {current}, can't switch to {requested}")]
    AuthenticationConflict {
        current: &'static str,
        requested: &'static str,
    },

    /// The HTTP method is not a valid token
    #[error("Invalid HTTP method '{0}'")]
    InvalidMethod(String),

    /// A header name or value can't be sent
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The request body can't be encoded
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// The proxy settings can't be turned into a proxy URI
    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    /// `OAuth2` configuration is incomplete
    #[error("OAuth2 configuration error: {0}")]
    OAuth(String),
}

/// Failure reported by a [`Transport`](crate::Transport).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Connect or receive timeout elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection could not be established
    #[error("Connection failed: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The same URI was reached more often than the redirect policy allows
    #[error("Redirect loop detected: '{uri}' visited {visits} times")]
    RedirectLoop { uri: String, visits: usize },

    /// Redirect to another host while the policy only allows the same host
    #[error("Redirect from host '{from}' to host '{to}' is not allowed")]
    CrossHostRedirect { from: String, to: String },

    /// Relative `Location` header while the policy requires absolute URIs
    #[error("Relative redirect to '{location}' is not allowed")]
    RelativeRedirectNotAllowed { location: String },

    /// `Location` header is missing or can't be resolved
    #[error("Invalid redirect location '{location}': {reason}")]
    InvalidRedirect { location: String, reason: String },

    /// Credentials the transport can't apply
    #[error("Authentication scheme {0} is not supported by this transport")]
    UnsupportedAuthentication(&'static str),

    /// Transport error (network, protocol, etc)
    #[error("Transport error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Other(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(Box::new(err))
        } else {
            TransportError::Other(Box::new(err))
        }
    }
}

/// Authentication could not be performed; no further request is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthenticationError {
    /// The server answered 401 without a usable Digest challenge
    #[error("Missing Digest challenge in WWW-Authenticate header")]
    MissingChallenge,

    /// A mandatory challenge parameter is absent
    #[error("Digest challenge is missing '{0}'")]
    MissingChallengeParameter(&'static str),

    /// None of the offered qop values can be used
    #[error("None of the qop values '{0}' is supported")]
    UnsupportedQop(String),

    /// Unknown digest algorithm
    #[error("Unsupported digest algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// The token endpoint call failed
    #[error("OAuth2 token request failed: {0}")]
    TokenRequest(String),

    /// The token endpoint returned an unusable body
    #[error("Invalid OAuth2 token response: {0}")]
    InvalidTokenResponse(String),
}

/// Errors returned by the engine and the client service.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpEngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The target URL is rejected by transport security or the allow-list
    #[error("URL '{scheme}://{host}' is not allowed: {reason}")]
    UrlNotAllowed {
        scheme: String,
        host: String,
        reason: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Response body could not be read or decoded
    ///
    /// `partial` holds what was received before the failure.
    #[error("Failed to read response payload: {message}")]
    Payload {
        message: String,
        partial: Option<String>,
    },

    /// Response body exceeded the configured size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Pagination could not derive the next page
    #[error("Pagination failed: {0}")]
    Pagination(String),

    /// HTTP non-2xx status, raised by the die-on-error policy only
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        status: http::StatusCode,
        body: String,
    },

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl HttpEngineError {
    /// `true` for redirect loop and redirect policy violations.
    #[must_use]
    pub fn is_redirect_violation(&self) -> bool {
        matches!(
            self,
            HttpEngineError::Transport(
                TransportError::RedirectLoop { .. }
                    | TransportError::CrossHostRedirect { .. }
                    | TransportError::RelativeRedirectNotAllowed { .. }
            )
        )
    }

    /// `true` when the underlying cause is a connect or receive timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpEngineError::Transport(TransportError::Timeout(_)))
    }
}
