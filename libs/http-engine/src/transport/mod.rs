//! Transport capability
//!
//! The engine never opens sockets itself: it configures a [`Transport`]
//! created per call by a [`TransportFactory`] and hands it the encoded request.
//! [`HyperTransport`] is the default implementation.

mod hyper_transport;
mod redirect;
mod tls;

pub use self::hyper_transport::{HyperTransport, HyperTransportFactory};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::fmt;
use std::time::Duration;

use crate::config::RedirectPolicy;
use crate::error::TransportError;
use crate::query::ProxyConfiguration;
use crate::secret::SecretString;

/// Type-erased response body.
///
/// Holds either the raw body or a decompressed one (gzip/br/deflate).
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Time allowed for the response head to arrive
    pub receive: Duration,
}

/// Server certificate trust
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Platform trust store with hostname verification
    #[default]
    Default,
    /// Accept any certificate, no hostname verification
    TrustAll,
}

/// Credentials negotiated by the transport itself
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportCredentials {
    Ntlm {
        username: String,
        password: SecretString,
        domain: Option<String>,
    },
}

impl TransportCredentials {
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportCredentials::Ntlm { .. } => "NTLM",
        }
    }
}

impl fmt::Debug for TransportCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCredentials::Ntlm {
                username, domain, ..
            } => f
                .debug_struct("Ntlm")
                .field("username", username)
                .field("domain", domain)
                .finish_non_exhaustive(),
        }
    }
}

/// Fully encoded request handed to a transport
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    /// Absolute URL, query string included
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response as returned by a transport, body not yet read
pub struct RawResponse {
    pub status: StatusCode,
    /// Reason phrase from the status line, when the server sent a non-canonical one
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl RawResponse {
    /// Response with an in-memory body
    #[must_use]
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: None,
            headers,
            body: Full::new(body.into())
                .map_err(|never| match never {})
                .boxed(),
        }
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// HTTP exchange capability configured and driven by the engine.
///
/// One instance serves one call (including its redirects and authentication
/// round trips); setters are applied before the first `invoke`.
#[async_trait]
pub trait Transport: Send {
    fn set_timeouts(&mut self, timeouts: Timeouts);

    fn set_proxy(&mut self, proxy: Option<ProxyConfiguration>);

    /// `Authorization` value sent with every request of the call, except on
    /// redirects to another host
    fn set_authorization_header(&mut self, value: Option<SecretString>);

    /// Connection-level credentials.
    ///
    /// # Errors
    /// `UnsupportedAuthentication` when the transport can't negotiate them.
    fn set_credentials(&mut self, credentials: TransportCredentials) -> Result<(), TransportError>;

    fn set_redirect_policy(&mut self, policy: RedirectPolicy);

    fn set_trust_policy(&mut self, trust: TrustPolicy);

    /// Advertise `Accept-Encoding` and decode compressed bodies
    fn set_decompression(&mut self, enabled: bool);

    /// Send `request`, following redirects per the redirect policy.
    ///
    /// Non-2xx statuses are responses, not errors.
    ///
    /// # Errors
    /// Network, TLS, timeout and redirect policy failures.
    async fn invoke(&mut self, request: OutgoingRequest) -> Result<RawResponse, TransportError>;
}

/// Creates one [`Transport`] per call
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}
