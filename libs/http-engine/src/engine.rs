use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::StatusCode;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use url::Url;
use zeroize::Zeroizing;

use crate::auth::digest::DigestSessions;
use crate::auth::{
    DigestChallenge, DigestContext, OAuth20FlowExecution, Token, TokenCache, basic_authorization,
};
use crate::config::{EngineConfig, TransportSecurity};
use crate::encoding;
use crate::error::{ConfigurationError, HttpEngineError};
use crate::pagination::{self, NoPagination};
use crate::query::{
    ApiKeyDestination, Authentication, KeyValuePair, OAuth20Configuration, QueryConfiguration,
};
use crate::response::HttpResponse;
use crate::secret::SecretString;
use crate::transport::{
    HyperTransportFactory, OutgoingRequest, RawResponse, Timeouts, Transport,
    TransportCredentials, TransportFactory, TrustPolicy,
};

/// Challenge answers per call: the first challenge, plus one `stale=true` re-challenge
const MAX_DIGEST_ROUNDS: usize = 2;

/// Decides which targets the engine may call
pub trait UrlAllowList: Send + Sync + fmt::Debug {
    /// # Errors
    /// The reason `url` is rejected.
    fn check(&self, url: &Url) -> Result<(), String>;
}

/// Accepts every target
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl UrlAllowList for AllowAll {
    fn check(&self, _url: &Url) -> Result<(), String> {
        Ok(())
    }
}

/// Accepts listed hosts; `*.example.com` matches every subdomain of `example.com`
#[derive(Debug, Clone, Default)]
pub struct HostAllowList {
    hosts: HashSet<String>,
}

impl HostAllowList {
    #[must_use]
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| host.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    fn allows(&self, host: &str) -> bool {
        self.hosts.contains(host)
            || self.hosts.iter().any(|pattern| {
                pattern
                    .strip_prefix("*.")
                    .is_some_and(|domain| host.ends_with(&format!(".{domain}")))
            })
    }
}

impl UrlAllowList for HostAllowList {
    fn check(&self, url: &Url) -> Result<(), String> {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.allows(&host) {
            Ok(())
        } else {
            Err("host is not in the allow-list".to_owned())
        }
    }
}

/// Executes [`QueryConfiguration`]s.
///
/// Per call: pagination initiation, target validation, authentication,
/// transport setup, body encoding, invocation and response wrapping. The
/// engine is cheap to clone; clones share the transport factory, the
/// allow-list and the digest sessions.
#[derive(Clone)]
pub struct HttpExecutionEngine {
    config: Arc<EngineConfig>,
    transports: Arc<dyn TransportFactory>,
    allow_list: Arc<dyn UrlAllowList>,
    digest_sessions: DigestSessions,
    oauth: OAuth20FlowExecution,
}

impl fmt::Debug for HttpExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExecutionEngine")
            .field("config", &self.config)
            .field("allow_list", &self.allow_list)
            .field("digest_sessions", &self.digest_sessions)
            .finish_non_exhaustive()
    }
}

impl HttpExecutionEngine {
    #[must_use]
    pub fn new(config: EngineConfig, transports: Arc<dyn TransportFactory>) -> Self {
        if config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }
        let oauth = OAuth20FlowExecution::new(config.oauth_default_ttl());
        Self {
            config: Arc::new(config),
            transports,
            allow_list: Arc::new(AllowAll),
            digest_sessions: DigestSessions::default(),
            oauth,
        }
    }

    /// Engine over [`HyperTransport`](crate::HyperTransport)
    #[must_use]
    pub fn with_hyper_transport(config: EngineConfig) -> Self {
        let factory = HyperTransportFactory::new(config.transport);
        Self::new(config, Arc::new(factory))
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: impl UrlAllowList + 'static) -> Self {
        self.allow_list = Arc::new(allow_list);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one call.
    ///
    /// Non-2xx statuses are returned as responses.
    ///
    /// # Errors
    /// Configuration, target validation, authentication and transport failures.
    pub async fn execute(
        &self,
        query: &QueryConfiguration,
        tokens: &TokenCache,
    ) -> Result<HttpResponse, HttpEngineError> {
        let strategy = pagination::strategy_for(query.pagination());
        let mut call = query.clone();
        strategy.initiate_pagination(&mut call);

        let url = self.target_url(&call)?;

        let token = match call.authentication() {
            Authentication::OAuth20ClientCredentials(oauth) => {
                Some(self.acquire_token(oauth, &call, tokens).await?)
            }
            _ => None,
        };

        let raw = self.exchange(&call, url, token.as_ref()).await?;
        Ok(HttpResponse::new(
            raw,
            call,
            strategy,
            token,
            self.config.max_body_size,
        ))
    }

    /// Execute an `OAuth2` token call and read its body.
    ///
    /// Only static client authentication applies; no token is acquired.
    ///
    /// # Errors
    /// Configuration, target validation, transport and payload failures.
    pub async fn execute_token_call(
        &self,
        token_call: &QueryConfiguration,
    ) -> Result<(StatusCode, Bytes), HttpEngineError> {
        let url = self.target_url(token_call)?;
        let raw = self.exchange(token_call, url, None).await?;
        let status = raw.status;
        let response = HttpResponse::new(
            raw,
            token_call.clone(),
            Arc::new(NoPagination),
            None,
            self.config.max_body_size,
        );
        Ok((status, response.bytes().await?))
    }

    async fn acquire_token(
        &self,
        oauth: &OAuth20Configuration,
        call: &QueryConfiguration,
        tokens: &TokenCache,
    ) -> Result<Token, HttpEngineError> {
        let token_call = call.oauth_call().ok_or_else(|| {
            ConfigurationError::OAuth("descriptor has no token call".to_owned())
        })?;
        tokens
            .get_or_fetch(&oauth.cache_key(), || self.oauth.execute(self, token_call))
            .await
    }

    /// Absolute URL with query parameters, checked against transport security
    /// and the allow-list
    fn target_url(&self, call: &QueryConfiguration) -> Result<Url, HttpEngineError> {
        let mut params = call.query_params().to_vec();
        if let Authentication::ApiKey {
            name,
            value,
            prefix,
            destination: ApiKeyDestination::QueryParameters,
        } = call.authentication()
        {
            params.push(KeyValuePair::new(
                name.as_str(),
                api_key_value(prefix.as_deref(), value).as_str(),
            ));
        }

        let url = encoding::compose_url(call.url(), &params)?;
        let not_allowed = |reason: String| HttpEngineError::UrlNotAllowed {
            scheme: url.scheme().to_owned(),
            host: url.host_str().unwrap_or_default().to_owned(),
            reason,
        };

        match url.scheme() {
            "https" => {}
            "http" if self.config.transport == TransportSecurity::AllowInsecureHttp => {}
            "http" => {
                return Err(not_allowed(
                    "plain HTTP is not allowed with TransportSecurity::TlsOnly".to_owned(),
                ));
            }
            other => return Err(not_allowed(format!("unsupported scheme '{other}'"))),
        }
        self.allow_list.check(&url).map_err(not_allowed)?;
        Ok(url)
    }

    async fn exchange(
        &self,
        call: &QueryConfiguration,
        url: Url,
        token: Option<&Token>,
    ) -> Result<RawResponse, HttpEngineError> {
        let mut transport = self.transports.create();
        self.configure(transport.as_mut(), call)?;

        let body = encoding::encode_body(call.body())?;
        let headers = self.request_headers(call, body.content_type.as_deref())?;
        transport.set_authorization_header(authorization(call.authentication(), token)?);

        let request = OutgoingRequest {
            method: call.method().clone(),
            url,
            headers,
            body: body.bytes,
        };
        tracing::debug!(
            method = %request.method,
            host = request.url.host_str().unwrap_or_default(),
            path = request.url.path(),
            auth = call.authentication().kind(),
            "executing HTTP call"
        );

        let raw = match call.authentication() {
            Authentication::Digest { username, password } => {
                self.digest_exchange(transport.as_mut(), request, username, password)
                    .await?
            }
            _ => transport.invoke(request).await?,
        };

        tracing::debug!(status = raw.status.as_u16(), "HTTP call completed");
        Ok(raw)
    }

    fn configure(
        &self,
        transport: &mut dyn Transport,
        call: &QueryConfiguration,
    ) -> Result<(), HttpEngineError> {
        transport.set_trust_policy(if call.bypass_certificate_validation() {
            TrustPolicy::TrustAll
        } else {
            TrustPolicy::Default
        });
        transport.set_timeouts(Timeouts {
            connect: call
                .connect_timeout()
                .unwrap_or_else(|| self.config.connect_timeout()),
            receive: call
                .receive_timeout()
                .unwrap_or_else(|| self.config.receive_timeout()),
        });
        transport.set_proxy(call.proxy().cloned());
        transport.set_redirect_policy(call.redirect_policy().clone());
        transport.set_decompression(call.decompress());

        if let Authentication::Ntlm {
            username,
            password,
            domain,
        } = call.authentication()
        {
            transport.set_credentials(TransportCredentials::Ntlm {
                username: username.clone(),
                password: password.clone(),
                domain: domain.clone(),
            })?;
        }
        Ok(())
    }

    /// Descriptor headers plus content type, accept, user agent and header API keys.
    ///
    /// Values already set by the descriptor win.
    fn request_headers(
        &self,
        call: &QueryConfiguration,
        content_type: Option<&str>,
    ) -> Result<HeaderMap, ConfigurationError> {
        let mut headers = encoding::header_map(call.headers())?;

        if let Some(content_type) = content_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, header_value("Content-Type", content_type)?);
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static(call.accept().accept_header()));
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(
                USER_AGENT,
                header_value("User-Agent", &self.config.user_agent)?,
            );
        }

        if let Authentication::ApiKey {
            name,
            value,
            prefix,
            destination: ApiKeyDestination::Header,
        } = call.authentication()
        {
            let header_name =
                HeaderName::try_from(name.as_str()).map_err(|e| ConfigurationError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let mut header = header_value(name, &api_key_value(prefix.as_deref(), value))?;
            header.set_sensitive(true);
            headers.insert(header_name, header);
        }
        Ok(headers)
    }

    /// Send `request`, answering Digest challenges.
    ///
    /// A known session answers preemptively. A 401 challenge is answered once,
    /// a second one only when it is marked `stale`.
    async fn digest_exchange(
        &self,
        transport: &mut dyn Transport,
        request: OutgoingRequest,
        username: &str,
        password: &SecretString,
    ) -> Result<RawResponse, HttpEngineError> {
        let host = request.url.host_str().unwrap_or_default().to_owned();
        let uri = request.url[url::Position::BeforePath..url::Position::AfterQuery].to_owned();
        let method = request.method.as_str().to_owned();
        let body = request.body.clone();
        let context = DigestContext {
            method: &method,
            uri: &uri,
            body: (!body.is_empty()).then_some(&body[..]),
        };

        if let Some(header) = self
            .digest_sessions
            .preemptive(username, &host, password, &context)
        {
            tracing::trace!(host = %host, "answering digest preemptively");
            transport.set_authorization_header(Some(SecretString::new(header?)));
        }

        let mut response = transport.invoke(request.clone()).await?;
        let mut rounds = 0;
        while response.status == StatusCode::UNAUTHORIZED && rounds < MAX_DIGEST_ROUNDS {
            let parsed = DigestChallenge::from_headers(&response.headers);
            // a repeated challenge is only answered when the nonce went stale
            if rounds > 0 && !parsed.as_ref().is_ok_and(|challenge| challenge.stale) {
                break;
            }
            let challenge = parsed?;
            tracing::debug!(
                host = %host,
                realm = %challenge.realm,
                stale = challenge.stale,
                "answering digest challenge"
            );
            let header = self
                .digest_sessions
                .respond(username, &host, password, challenge, &context)?;
            transport.set_authorization_header(Some(SecretString::new(header)));
            response = transport.invoke(request.clone()).await?;
            rounds += 1;
        }

        if response.status == StatusCode::UNAUTHORIZED {
            self.digest_sessions.forget(username, &host);
        }
        Ok(response)
    }
}

/// `Authorization` value for header-based schemes
fn authorization(
    authentication: &Authentication,
    token: Option<&Token>,
) -> Result<Option<SecretString>, ConfigurationError> {
    let value = match authentication {
        Authentication::Basic { username, password } => {
            Some(basic_authorization(username, password))
        }
        Authentication::AuthorizationToken { value } => Some(value.clone()),
        Authentication::Bearer { token } => {
            let value = Zeroizing::new(format!("Bearer {}", token.expose()));
            Some(SecretString::new(value.as_str()))
        }
        Authentication::OAuth20ClientCredentials(_) => {
            let token = token.ok_or_else(|| {
                ConfigurationError::OAuth("no token acquired for the call".to_owned())
            })?;
            Some(token.authorization_value())
        }
        _ => None,
    };
    Ok(value)
}

fn api_key_value(prefix: Option<&str>, value: &SecretString) -> Zeroizing<String> {
    Zeroizing::new(format!("{}{}", prefix.unwrap_or_default(), value.expose()))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ConfigurationError> {
    HeaderValue::from_str(value).map_err(|e| ConfigurationError::InvalidHeader {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[path = "engine_tests.rs"]
mod engine_tests;
