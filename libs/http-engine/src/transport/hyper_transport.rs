//! hyper + rustls [`Transport`]
//!
//! Service stack (outer to inner):
//!
//! ```text
//! Timeout(receive) -> [Decompression] -> hyper Client -> HTTPS -> [Tunnel | SOCKS5] -> TCP(connect timeout)
//! ```
//!
//! Redirects are followed by the transport itself so the redirect policy can
//! fail the call (loops, cross-host hops) instead of only stopping.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Response, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::{SocksV5, Tunnel};
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use super::redirect::{Hop, RedirectTracker, redirected_request};
use super::{
    OutgoingRequest, RawResponse, ResponseBody, Timeouts, Transport, TransportCredentials,
    TransportFactory, TrustPolicy, tls,
};
use crate::auth::basic_authorization;
use crate::config::{RedirectPolicy, TransportSecurity};
use crate::error::TransportError;
use crate::query::{ProxyConfiguration, ProxyType};
use crate::secret::SecretString;

type HyperService =
    BoxCloneService<http::Request<Full<Bytes>>, Response<ResponseBody>, TransportError>;

/// Creates [`HyperTransport`]s sharing one transport security mode
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperTransportFactory {
    security: TransportSecurity,
}

impl HyperTransportFactory {
    #[must_use]
    pub fn new(security: TransportSecurity) -> Self {
        Self { security }
    }
}

impl TransportFactory for HyperTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(HyperTransport::new(self.security))
    }
}

/// Default transport over hyper's pooled client.
///
/// The client stack is built on first `invoke` from the settings applied so
/// far; changing a setting afterwards rebuilds it.
pub struct HyperTransport {
    security: TransportSecurity,
    timeouts: Timeouts,
    proxy: Option<ProxyConfiguration>,
    authorization: Option<SecretString>,
    redirect: RedirectPolicy,
    trust: TrustPolicy,
    decompress: bool,
    service: Option<HyperService>,
}

impl HyperTransport {
    #[must_use]
    pub fn new(security: TransportSecurity) -> Self {
        Self {
            security,
            timeouts: Timeouts {
                connect: Duration::from_secs(30),
                receive: Duration::from_secs(120),
            },
            proxy: None,
            authorization: None,
            redirect: RedirectPolicy::default(),
            trust: TrustPolicy::Default,
            decompress: false,
            service: None,
        }
    }

    fn service(&mut self) -> Result<HyperService, TransportError> {
        if let Some(service) = &self.service {
            return Ok(service.clone());
        }
        let service = self.build_service()?;
        self.service = Some(service.clone());
        Ok(service)
    }

    fn build_service(&self) -> Result<HyperService, TransportError> {
        let tls_config = tls::client_config(self.trust)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(self.timeouts.connect));

        let Some(proxy) = &self.proxy else {
            return Ok(self.client_stack(wrap_tls(http, tls_config)));
        };

        let proxy_uri = proxy
            .uri()
            .map_err(|e| TransportError::Other(Box::new(e)))?;
        tracing::debug!(proxy = %proxy_uri, "routing through proxy");

        let username = proxy.username.as_deref().unwrap_or_default();
        match proxy.proxy_type {
            ProxyType::Http => {
                let mut tunnel = Tunnel::new(proxy_uri, http);
                if let Some(password) = &proxy.password {
                    let credentials = basic_authorization(username, password);
                    let mut value = HeaderValue::from_str(credentials.expose())
                        .map_err(|e| TransportError::Other(Box::new(e)))?;
                    value.set_sensitive(true);
                    tunnel = tunnel.with_auth(value);
                }
                Ok(self.client_stack(wrap_tls(tunnel, tls_config)))
            }
            ProxyType::Socks5 => {
                let mut socks = SocksV5::new(proxy_uri, http);
                if let Some(password) = &proxy.password {
                    socks = socks.with_auth(username.to_owned(), password.expose().to_owned());
                }
                Ok(self.client_stack(wrap_tls(socks, tls_config)))
            }
        }
    }

    fn client_stack<C>(&self, connector: C) -> HyperService
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);
        let Timeouts { connect, receive } = self.timeouts;

        if self.decompress {
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(receive))
                .layer(DecompressionLayer::new())
                .service(client)
                .map_response(box_response)
                .map_err(move |e: tower::BoxError| map_tower_error(e, connect, receive))
                .boxed_clone()
        } else {
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(receive))
                .service(client)
                .map_response(box_response)
                .map_err(move |e: tower::BoxError| map_tower_error(e, connect, receive))
                .boxed_clone()
        }
    }

    fn to_http_request(
        &self,
        request: &OutgoingRequest,
        crosses_host: bool,
    ) -> Result<http::Request<Full<Bytes>>, TransportError> {
        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
            if !crosses_host && let Some(authorization) = &self.authorization {
                let mut value = HeaderValue::from_str(authorization.expose())
                    .map_err(|e| TransportError::Other(Box::new(e)))?;
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| TransportError::Other(Box::new(e)))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
        self.service = None;
    }

    fn set_proxy(&mut self, proxy: Option<ProxyConfiguration>) {
        self.proxy = proxy;
        self.service = None;
    }

    fn set_authorization_header(&mut self, value: Option<SecretString>) {
        self.authorization = value;
    }

    fn set_credentials(&mut self, credentials: TransportCredentials) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedAuthentication(
            credentials.scheme(),
        ))
    }

    fn set_redirect_policy(&mut self, policy: RedirectPolicy) {
        self.redirect = policy;
    }

    fn set_trust_policy(&mut self, trust: TrustPolicy) {
        self.trust = trust;
        self.service = None;
    }

    fn set_decompression(&mut self, enabled: bool) {
        self.decompress = enabled;
        self.service = None;
    }

    async fn invoke(&mut self, request: OutgoingRequest) -> Result<RawResponse, TransportError> {
        let service = self.service()?;
        let allow_http = self.security == TransportSecurity::AllowInsecureHttp;
        let redirect = self.redirect.clone();
        let mut tracker = RedirectTracker::new(&redirect, allow_http, &request.url);
        let mut current = request;

        loop {
            let crosses_host = tracker.crosses_host(&current.url);
            let http_request = self.to_http_request(&current, crosses_host)?;
            tracing::trace!(
                method = %current.method,
                host = current.url.host_str().unwrap_or_default(),
                path = current.url.path(),
                "sending request"
            );

            let response = service.clone().oneshot(http_request).await?;
            let status = response.status();

            if !redirect.accept_redirections || !RedirectTracker::is_followable(status) {
                return Ok(into_raw(response));
            }
            let Some(location) = response.headers().get(header::LOCATION) else {
                return Ok(into_raw(response));
            };
            let location = location.to_str().map_err(|e| TransportError::InvalidRedirect {
                location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
                reason: e.to_string(),
            })?;

            match tracker.next_hop(&current.url, location)? {
                Hop::Stop => return Ok(into_raw(response)),
                Hop::Follow(target) => {
                    let crosses = tracker.crosses_host(&target);
                    current = redirected_request(
                        current,
                        status,
                        target,
                        redirect.force_get_on_302,
                        crosses,
                    );
                }
            }
        }
    }
}

fn wrap_tls<T>(connector: T, tls_config: rustls::ClientConfig) -> HttpsConnector<T> {
    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(connector)
}

fn into_raw(response: Response<ResponseBody>) -> RawResponse {
    let reason = response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned());
    let (parts, body) = response.into_parts();
    RawResponse {
        status: parts.status,
        reason,
        headers: parts.headers,
        body,
    }
}

fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// Map stack errors, keeping the timeout that actually elapsed
fn map_tower_error(err: tower::BoxError, connect: Duration, receive: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::Timeout(receive);
    }

    match err.downcast::<hyper_util::client::legacy::Error>() {
        Ok(client_err) => {
            if chain_contains::<rustls::Error>(&*client_err) {
                TransportError::Tls(client_err)
            } else if client_err.is_connect() && chain_timed_out(&*client_err) {
                TransportError::Timeout(connect)
            } else {
                TransportError::from(*client_err)
            }
        }
        Err(other) => TransportError::Other(other),
    }
}

fn error_chain<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> impl Iterator<Item = &'a (dyn std::error::Error + 'static)> {
    std::iter::successors(Some(err), |e| e.source())
}

/// `io::Error` hides its payload from `source()`, so look inside it too
fn chain_contains<T: std::error::Error + 'static>(err: &(dyn std::error::Error + 'static)) -> bool {
    error_chain(err).any(|e| {
        e.is::<T>()
            || e.downcast_ref::<std::io::Error>()
                .and_then(std::io::Error::get_ref)
                .is_some_and(|inner| inner.is::<T>())
    })
}

fn chain_timed_out(err: &(dyn std::error::Error + 'static)) -> bool {
    error_chain(err).any(|e| {
        e.downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
    })
}
