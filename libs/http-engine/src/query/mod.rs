//! Request descriptor
//!
//! A [`QueryConfiguration`] describes one HTTP call. It is produced by
//! [`QueryConfigurationBuilder`], optionally rewritten between pages by a
//! [`PaginationStrategy`](crate::PaginationStrategy) and consumed by the
//! [`HttpExecutionEngine`](crate::HttpExecutionEngine).

mod builder;

pub use builder::QueryConfigurationBuilder;
pub use crate::auth::ClientAuthMethod;
pub use crate::config::RedirectPolicy;

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::secret::SecretString;

/// Body encoding tag. Set at most once per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyFormat {
    Text,
    Json,
    Xml,
    FormData,
    Urlencoded,
}

impl fmt::Display for BodyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodyFormat::Text => "TEXT",
            BodyFormat::Json => "JSON",
            BodyFormat::Xml => "XML",
            BodyFormat::FormData => "FORM_DATA",
            BodyFormat::Urlencoded => "URLENCODED",
        })
    }
}

/// Ordered, mutable key/value entry (header, query parameter, form field)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// File part of a `FORM_DATA` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub content: Bytes,
}

impl Attachment {
    #[must_use]
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Request body. `content` is used by TEXT/JSON/XML, `params` and
/// `attachments` by the form formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub(crate) format: BodyFormat,
    pub(crate) content: Option<String>,
    pub(crate) params: Vec<KeyValuePair>,
    /// Form fields encoded after `params`, kept out of `Debug` output
    pub(crate) secret_params: Vec<(String, SecretString)>,
    pub(crate) attachments: Vec<Attachment>,
}

impl Body {
    pub(crate) fn empty(format: BodyFormat) -> Self {
        Self {
            format,
            content: None,
            params: Vec::new(),
            secret_params: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn format(&self) -> BodyFormat {
        self.format
    }

    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    #[must_use]
    pub fn params(&self) -> &[KeyValuePair] {
        &self.params
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }
}

/// Where pagination parameters are sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Headers,
    #[default]
    QueryParameters,
}

/// Offset/limit pagination settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub location: ParamLocation,
    pub offset_param: String,
    /// Initial offset
    pub offset_value: String,
    pub limit_param: String,
    pub limit_value: String,
    /// Dot-separated path to the JSON array of page elements; empty for a root array
    pub elements_path: String,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            location: ParamLocation::QueryParameters,
            offset_param: "offset".to_owned(),
            offset_value: "0".to_owned(),
            limit_param: "limit".to_owned(),
            limit_value: "100".to_owned(),
            elements_path: String::new(),
        }
    }
}

/// Lifecycle of pagination on a descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PaginationState {
    #[default]
    NotInitiated,
    Initiated,
    Exhausted,
}

/// Accepted response format, sent as the `Accept` header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Any,
    Json,
    Xml,
    Text,
}

impl ResponseFormat {
    #[must_use]
    pub fn accept_header(self) -> &'static str {
        match self {
            ResponseFormat::Any => "*/*",
            ResponseFormat::Json => "application/json",
            ResponseFormat::Xml => "application/xml",
            ResponseFormat::Text => "text/plain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    /// HTTP proxy, tunneled with CONNECT
    Http,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfiguration {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl ProxyConfiguration {
    #[must_use]
    pub fn new(proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<SecretString>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Proxy address as a URI (`http://host:port` or `socks5://host:port`).
    ///
    /// # Errors
    /// Returns `ConfigurationError::InvalidProxy` for a blank host or an unparsable address.
    pub fn uri(&self) -> Result<http::Uri, ConfigurationError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigurationError::InvalidProxy(
                "proxy host must not be blank".to_owned(),
            ));
        }
        let scheme = match self.proxy_type {
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
        };
        format!("{scheme}://{host}:{}", self.port)
            .parse()
            .map_err(|e: http::uri::InvalidUri| ConfigurationError::InvalidProxy(e.to_string()))
    }
}

/// Where an API key is placed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyDestination {
    #[default]
    Header,
    QueryParameters,
}

/// `OAuth2` client-credentials settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuth20Configuration {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scopes: Vec<String>,
    pub auth_method: ClientAuthMethod,
    /// Additional form fields sent to the token endpoint
    pub extra_params: Vec<KeyValuePair>,
    /// Token cache key; defaults to `<token_endpoint>#<client_id>`
    pub cache_key: Option<String>,
}

impl OAuth20Configuration {
    #[must_use]
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes: Vec::new(),
            auth_method: ClientAuthMethod::default(),
            extra_params: Vec::new(),
            cache_key: None,
        }
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_auth_method(mut self, auth_method: ClientAuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    #[must_use]
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    #[must_use]
    pub fn cache_key(&self) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.token_endpoint, self.client_id))
    }
}

/// Authentication applied to one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Authentication {
    #[default]
    None,
    /// Preemptive `Authorization: Basic`
    Basic {
        username: String,
        password: SecretString,
    },
    /// RFC 2617 challenge/response
    Digest {
        username: String,
        password: SecretString,
    },
    /// Transport-level NTLM
    Ntlm {
        username: String,
        password: SecretString,
        domain: Option<String>,
    },
    /// `Authorization` header sent verbatim
    AuthorizationToken { value: SecretString },
    /// `Authorization: Bearer <token>`
    Bearer { token: SecretString },
    ApiKey {
        name: String,
        value: SecretString,
        /// Prepended to the value, e.g. `"Token "`
        prefix: Option<String>,
        destination: ApiKeyDestination,
    },
    OAuth20ClientCredentials(OAuth20Configuration),
}

impl Authentication {
    /// Scheme name used in logs and conflict errors
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Authentication::None => "NONE",
            Authentication::Basic { .. } => "BASIC",
            Authentication::Digest { .. } => "DIGEST",
            Authentication::Ntlm { .. } => "NTLM",
            Authentication::AuthorizationToken { .. } => "AUTHORIZATION_TOKEN",
            Authentication::Bearer { .. } => "BEARER",
            Authentication::ApiKey { .. } => "API_KEY",
            Authentication::OAuth20ClientCredentials(_) => "OAUTH20_CLIENT_CREDENTIALS",
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Authentication::None)
    }
}

/// Descriptor of one HTTP call
#[derive(Debug, Clone)]
pub struct QueryConfiguration {
    pub(crate) url: String,
    pub(crate) method: http::Method,
    pub(crate) headers: Vec<KeyValuePair>,
    pub(crate) query_params: Vec<KeyValuePair>,
    pub(crate) body: Option<Body>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) receive_timeout: Option<Duration>,
    pub(crate) authentication: Authentication,
    pub(crate) proxy: Option<ProxyConfiguration>,
    pub(crate) redirect: RedirectPolicy,
    pub(crate) pagination: Option<PaginationConfig>,
    pub(crate) decompress: bool,
    pub(crate) bypass_certificate_validation: bool,
    pub(crate) accept: ResponseFormat,
    pub(crate) pagination_state: PaginationState,
    pub(crate) oauth_call: Option<Box<QueryConfiguration>>,
}

impl QueryConfiguration {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn method(&self) -> &http::Method {
        &self.method
    }

    #[must_use]
    pub fn headers(&self) -> &[KeyValuePair] {
        &self.headers
    }

    #[must_use]
    pub fn query_params(&self) -> &[KeyValuePair] {
        &self.query_params
    }

    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyConfiguration> {
        self.proxy.as_ref()
    }

    #[must_use]
    pub fn redirect_policy(&self) -> &RedirectPolicy {
        &self.redirect
    }

    #[must_use]
    pub fn pagination(&self) -> Option<&PaginationConfig> {
        self.pagination.as_ref()
    }

    #[must_use]
    pub fn decompress(&self) -> bool {
        self.decompress
    }

    #[must_use]
    pub fn bypass_certificate_validation(&self) -> bool {
        self.bypass_certificate_validation
    }

    #[must_use]
    pub fn accept(&self) -> ResponseFormat {
        self.accept
    }

    #[must_use]
    pub fn pagination_state(&self) -> PaginationState {
        self.pagination_state
    }

    pub fn set_pagination_state(&mut self, state: PaginationState) {
        self.pagination_state = state;
    }

    /// Token retrieval call derived from `OAuth2` client-credentials settings
    #[must_use]
    pub fn oauth_call(&self) -> Option<&QueryConfiguration> {
        self.oauth_call.as_deref()
    }

    #[must_use]
    pub fn params(&self, location: ParamLocation) -> &[KeyValuePair] {
        match location {
            ParamLocation::Headers => &self.headers,
            ParamLocation::QueryParameters => &self.query_params,
        }
    }

    pub fn params_mut(&mut self, location: ParamLocation) -> &mut Vec<KeyValuePair> {
        match location {
            ParamLocation::Headers => &mut self.headers,
            ParamLocation::QueryParameters => &mut self.query_params,
        }
    }

    /// First value of `key` at `location`. Header names compare case-insensitively.
    #[must_use]
    pub fn param(&self, location: ParamLocation, key: &str) -> Option<&str> {
        self.params(location)
            .iter()
            .find(|kv| param_key_matches(location, &kv.key, key))
            .map(|kv| kv.value.as_str())
    }

    /// Overwrite the first `key` entry at `location`, or append one.
    pub fn upsert_param(&mut self, location: ParamLocation, key: &str, value: impl Into<String>) {
        let value = value.into();
        let params = self.params_mut(location);
        if let Some(kv) = params
            .iter_mut()
            .find(|kv| param_key_matches(location, &kv.key, key))
        {
            kv.value = value;
        } else {
            params.push(KeyValuePair::new(key, value));
        }
    }
}

fn param_key_matches(location: ParamLocation, candidate: &str, key: &str) -> bool {
    match location {
        ParamLocation::Headers => candidate.eq_ignore_ascii_case(key),
        ParamLocation::QueryParameters => candidate == key,
    }
}
