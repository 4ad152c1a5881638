use std::time::Duration;

use super::{
    ApiKeyDestination, Attachment, Authentication, Body, BodyFormat, ClientAuthMethod,
    KeyValuePair, OAuth20Configuration, PaginationConfig, PaginationState, ProxyConfiguration,
    QueryConfiguration, RedirectPolicy, ResponseFormat,
};
use crate::error::ConfigurationError;
use crate::secret::SecretString;
use crate::substitutor::Substitutor;

/// Fluent builder for [`QueryConfiguration`]
///
/// Setters never fail. The first configuration error (body format switch,
/// second authentication scheme) is kept and returned by
/// [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// let query = QueryConfigurationBuilder::new("https://api.example.com/users/{id}")
///     .add_path_param("id", "{/input/user_id}")
///     .add_header("X-Tenant", "{/input/tenant:-default}")
///     .set_json_body(r#"{"name":"{/input/name}"}"#)
///     .build(Some(&substitutor))?;
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct QueryConfigurationBuilder {
    url: String,
    method: String,
    headers: Vec<KeyValuePair>,
    query_params: Vec<KeyValuePair>,
    path_params: Vec<KeyValuePair>,
    body: Option<Body>,
    connect_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    authentication: Authentication,
    proxy: Option<ProxyConfiguration>,
    redirect: RedirectPolicy,
    pagination: Option<PaginationConfig>,
    decompress: bool,
    bypass_certificate_validation: bool,
    accept: ResponseFormat,
    /// Error captured during building (returned by `build()`)
    error: Option<ConfigurationError>,
}

impl QueryConfigurationBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: http::Method::GET.to_string(),
            headers: Vec::new(),
            query_params: Vec::new(),
            path_params: Vec::new(),
            body: None,
            connect_timeout: None,
            receive_timeout: None,
            authentication: Authentication::None,
            proxy: None,
            redirect: RedirectPolicy::default(),
            pagination: None,
            decompress: false,
            bypass_certificate_validation: false,
            accept: ResponseFormat::default(),
            error: None,
        }
    }

    /// HTTP method; may contain placeholders, validated by `build()`
    pub fn set_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(KeyValuePair::new(name, value));
        self
    }

    pub fn add_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push(KeyValuePair::new(key, value));
        self
    }

    /// Replace the literal `{name}` in the URL with `value` before placeholder substitution
    pub fn add_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.push(KeyValuePair::new(name, value));
        self
    }

    pub fn set_text_body(mut self, content: impl Into<String>) -> Self {
        if let Some(body) = self.body_of(BodyFormat::Text) {
            body.content = Some(content.into());
        }
        self
    }

    pub fn set_json_body(mut self, content: impl Into<String>) -> Self {
        if let Some(body) = self.body_of(BodyFormat::Json) {
            body.content = Some(content.into());
        }
        self
    }

    pub fn set_xml_body(mut self, content: impl Into<String>) -> Self {
        if let Some(body) = self.body_of(BodyFormat::Xml) {
            body.content = Some(content.into());
        }
        self
    }

    /// Add a text part to a `multipart/form-data` body
    pub fn add_form_data_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(body) = self.body_of(BodyFormat::FormData) {
            body.params.push(KeyValuePair::new(key, value));
        }
        self
    }

    /// Add a file part to a `multipart/form-data` body
    pub fn add_attachment(mut self, attachment: Attachment) -> Self {
        if let Some(body) = self.body_of(BodyFormat::FormData) {
            body.attachments.push(attachment);
        }
        self
    }

    /// Add a field to an `application/x-www-form-urlencoded` body
    pub fn add_urlencoded_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        if let Some(body) = self.body_of(BodyFormat::Urlencoded) {
            body.params.push(KeyValuePair::new(key, value));
        }
        self
    }

    /// URL-encoded field whose value only leaves its [`SecretString`] on the wire
    fn add_secret_urlencoded_param(
        mut self,
        key: impl Into<String>,
        value: SecretString,
    ) -> Self {
        if let Some(body) = self.body_of(BodyFormat::Urlencoded) {
            body.secret_params.push((key.into(), value));
        }
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn basic_auth(self, username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        self.authentication(Authentication::Basic {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn digest_auth(
        self,
        username: impl Into<String>,
        password: impl Into<SecretString>,
    ) -> Self {
        self.authentication(Authentication::Digest {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn ntlm_auth(
        self,
        username: impl Into<String>,
        password: impl Into<SecretString>,
        domain: Option<String>,
    ) -> Self {
        self.authentication(Authentication::Ntlm {
            username: username.into(),
            password: password.into(),
            domain,
        })
    }

    /// Send `value` as the `Authorization` header verbatim
    pub fn authorization_token(self, value: impl Into<SecretString>) -> Self {
        self.authentication(Authentication::AuthorizationToken {
            value: value.into(),
        })
    }

    pub fn bearer_token(self, token: impl Into<SecretString>) -> Self {
        self.authentication(Authentication::Bearer {
            token: token.into(),
        })
    }

    pub fn api_key(
        self,
        name: impl Into<String>,
        value: impl Into<SecretString>,
        prefix: Option<String>,
        destination: ApiKeyDestination,
    ) -> Self {
        self.authentication(Authentication::ApiKey {
            name: name.into(),
            value: value.into(),
            prefix,
            destination,
        })
    }

    pub fn oauth2_client_credentials(self, config: OAuth20Configuration) -> Self {
        self.authentication(Authentication::OAuth20ClientCredentials(config))
    }

    /// Set the authentication. A second, different scheme is a configuration error.
    pub fn authentication(mut self, authentication: Authentication) -> Self {
        let current = self.authentication.kind();
        let requested = authentication.kind();
        if !self.authentication.is_none() && current != requested {
            self.fail(ConfigurationError::AuthenticationConflict { current, requested });
            return self;
        }
        self.authentication = authentication;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfiguration) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn redirect_policy(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Ask for and transparently decode gzip/deflate/br responses
    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    /// Trust every server certificate and skip hostname verification
    pub fn bypass_certificate_validation(mut self, bypass: bool) -> Self {
        self.bypass_certificate_validation = bypass;
        self
    }

    pub fn accept(mut self, accept: ResponseFormat) -> Self {
        self.accept = accept;
        self
    }

    /// Build the descriptor.
    ///
    /// Path parameters are replaced first, then, when a substitutor is given,
    /// placeholders in the URL, header values, query parameter values, body
    /// content, body parameter values and the method.
    ///
    /// # Errors
    /// Returns the first error recorded by a setter, `BlankUrl` for an empty
    /// URL (before or after templating), `InvalidMethod` or `InvalidHeader`.
    pub fn build(
        self,
        substitutor: Option<&Substitutor>,
    ) -> Result<QueryConfiguration, ConfigurationError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.url.trim().is_empty() {
            return Err(ConfigurationError::BlankUrl);
        }

        let mut url = self.path_params.iter().fold(self.url, |url, param| {
            url.replace(&format!("{{{}}}", param.key), &param.value)
        });
        let mut method = self.method;
        let mut headers = self.headers;
        let mut query_params = self.query_params;
        let mut body = self.body;

        if let Some(substitutor) = substitutor {
            url = substitutor.replace(&url);
            method = substitutor.replace(&method);
            substitute_values(substitutor, &mut headers);
            substitute_values(substitutor, &mut query_params);
            if let Some(body) = body.as_mut() {
                body.content = body.content.as_deref().map(|c| substitutor.replace(c));
                substitute_values(substitutor, &mut body.params);
            }
        }

        let url = url.trim().to_owned();
        if url.is_empty() {
            return Err(ConfigurationError::BlankUrl);
        }

        let method = parse_method(&method)?;
        for header in &headers {
            validate_header(header)?;
        }

        let oauth_call = match &self.authentication {
            Authentication::OAuth20ClientCredentials(oauth) => Some(Box::new(token_call(
                oauth,
                self.connect_timeout,
                self.receive_timeout,
                self.proxy.clone(),
                self.bypass_certificate_validation,
            )?)),
            _ => None,
        };

        Ok(QueryConfiguration {
            url,
            method,
            headers,
            query_params,
            body,
            connect_timeout: self.connect_timeout,
            receive_timeout: self.receive_timeout,
            authentication: self.authentication,
            proxy: self.proxy,
            redirect: self.redirect,
            pagination: self.pagination,
            decompress: self.decompress,
            bypass_certificate_validation: self.bypass_certificate_validation,
            accept: self.accept,
            pagination_state: PaginationState::NotInitiated,
            oauth_call,
        })
    }

    /// Body of `format`, created on first use. `None` (and a recorded error)
    /// when a body of another format already exists.
    fn body_of(&mut self, format: BodyFormat) -> Option<&mut Body> {
        if let Some(current) = self.body.as_ref().map(Body::format)
            && current != format
        {
            self.fail(ConfigurationError::BodyFormatConflict {
                current,
                requested: format,
            });
            return None;
        }
        Some(self.body.get_or_insert_with(|| Body::empty(format)))
    }

    fn fail(&mut self, err: ConfigurationError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn substitute_values(substitutor: &Substitutor, pairs: &mut [KeyValuePair]) {
    for pair in pairs {
        pair.value = substitutor.replace(&pair.value);
    }
}

fn parse_method(method: &str) -> Result<http::Method, ConfigurationError> {
    let normalized = method.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(ConfigurationError::InvalidMethod(method.to_owned()));
    }
    http::Method::from_bytes(normalized.as_bytes())
        .map_err(|_| ConfigurationError::InvalidMethod(method.to_owned()))
}

fn validate_header(header: &KeyValuePair) -> Result<(), ConfigurationError> {
    http::header::HeaderName::try_from(header.key.as_str()).map_err(|e| {
        ConfigurationError::InvalidHeader {
            name: header.key.clone(),
            reason: e.to_string(),
        }
    })?;
    http::header::HeaderValue::try_from(header.value.as_str()).map_err(|e| {
        ConfigurationError::InvalidHeader {
            name: header.key.clone(),
            reason: e.to_string(),
        }
    })?;
    Ok(())
}

/// Token endpoint call for client credentials: `POST`, URL-encoded
/// `grant_type=client_credentials` (+ `scope`), client authentication per
/// `auth_method`. Timeouts, proxy and trust settings follow the main call.
fn token_call(
    oauth: &OAuth20Configuration,
    connect_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    proxy: Option<ProxyConfiguration>,
    bypass_certificate_validation: bool,
) -> Result<QueryConfiguration, ConfigurationError> {
    if oauth.token_endpoint.trim().is_empty() {
        return Err(ConfigurationError::OAuth(
            "token endpoint must not be blank".to_owned(),
        ));
    }
    if oauth.client_id.trim().is_empty() {
        return Err(ConfigurationError::OAuth(
            "client id must not be blank".to_owned(),
        ));
    }

    let mut builder = QueryConfigurationBuilder::new(oauth.token_endpoint.clone())
        .set_method(http::Method::POST.as_str())
        .accept(ResponseFormat::Json)
        .bypass_certificate_validation(bypass_certificate_validation)
        .add_urlencoded_param("grant_type", "client_credentials");

    if !oauth.scopes.is_empty() {
        builder = builder.add_urlencoded_param("scope", oauth.scopes.join(" "));
    }
    for param in &oauth.extra_params {
        builder = builder.add_urlencoded_param(param.key.clone(), param.value.clone());
    }

    builder = match oauth.auth_method {
        ClientAuthMethod::Form => builder
            .add_urlencoded_param("client_id", oauth.client_id.clone())
            .add_secret_urlencoded_param("client_secret", oauth.client_secret.clone()),
        ClientAuthMethod::Basic => {
            builder.basic_auth(oauth.client_id.clone(), oauth.client_secret.clone())
        }
        ClientAuthMethod::Digest => {
            builder.digest_auth(oauth.client_id.clone(), oauth.client_secret.clone())
        }
    };

    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = receive_timeout {
        builder = builder.receive_timeout(timeout);
    }
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder.build(None)
}
