//! `OAuth2` client-credentials flow (RFC 6749 §4.4)

use http::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use crate::engine::HttpExecutionEngine;
use crate::error::{AuthenticationError, HttpEngineError};
use crate::query::QueryConfiguration;
use crate::secret::SecretString;

/// Longest token endpoint body quoted in an error message
const ERROR_BODY_PREVIEW_LIMIT: usize = 256;

/// Cap for absurd `expires_in` values
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Client authentication at the token endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic base64(client_id:client_secret)`
    #[default]
    Basic,
    /// `client_id` and `client_secret` as form fields
    Form,
    /// Digest challenge-response with the client credentials
    Digest,
}

/// Access token with its expiry
#[derive(Clone)]
pub struct Token {
    access_token: SecretString,
    token_type: String,
    expires_at: Instant,
}

impl Token {
    #[must_use]
    pub fn new(access_token: SecretString, token_type: impl Into<String>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            access_token,
            token_type: token_type.into(),
            expires_at: now
                .checked_add(ttl)
                .unwrap_or_else(|| now + MAX_TOKEN_LIFETIME),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// `<token_type> <access_token>`
    #[must_use]
    pub fn authorization_value(&self) -> SecretString {
        let value = Zeroizing::new(format!(
            "{} {}",
            self.token_type,
            self.access_token.expose()
        ));
        SecretString::new(value.as_str())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &self.access_token)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Deserialized token endpoint response.
///
/// Deserialize-only so the access token can't be serialized back into logs.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    /// Some servers send the lifetime as a string
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

/// Client-credentials token acquisition
#[derive(Debug, Clone, Copy)]
pub struct OAuth20FlowExecution {
    default_ttl: Duration,
}

impl OAuth20FlowExecution {
    /// `default_ttl` applies when the token endpoint omits `expires_in`
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    /// Run the token call and parse its response.
    ///
    /// # Errors
    /// Transport and configuration errors of the token call, or an
    /// `AuthenticationError` for a non-2xx status or an unusable body.
    pub async fn execute(
        &self,
        engine: &HttpExecutionEngine,
        token_call: &QueryConfiguration,
    ) -> Result<Token, HttpEngineError> {
        tracing::debug!(endpoint = %token_call.url(), "requesting OAuth2 token");
        let (status, body) = engine.execute_token_call(token_call).await?;
        let token = self.token_from_response(status, &body)?;
        tracing::debug!(
            endpoint = %token_call.url(),
            token_type = %token.token_type(),
            "OAuth2 token acquired"
        );
        Ok(token)
    }

    /// Parse `{access_token, token_type, expires_in}`.
    ///
    /// A missing `token_type` means `Bearer`, a missing `expires_in` the
    /// default lifetime.
    ///
    /// # Errors
    /// `TokenRequest` for a non-2xx status, `InvalidTokenResponse` when the body
    /// is not a token response.
    pub fn token_from_response(
        &self,
        status: StatusCode,
        body: &[u8],
    ) -> Result<Token, AuthenticationError> {
        if !status.is_success() {
            let preview = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_PREVIEW_LIMIT)]);
            return Err(AuthenticationError::TokenRequest(format!(
                "token endpoint returned {status}: {preview}"
            )));
        }

        let response: TokenResponse = serde_json::from_slice(body)
            .map_err(|e| AuthenticationError::InvalidTokenResponse(e.to_string()))?;

        if response.access_token.trim().is_empty() {
            return Err(AuthenticationError::InvalidTokenResponse(
                "empty access_token".to_owned(),
            ));
        }

        let ttl = match response.expires_in {
            None | Some(serde_json::Value::Null) => self.default_ttl,
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| invalid_expires_in(&n.to_string()))?,
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| invalid_expires_in(&s))?,
            Some(other) => return Err(invalid_expires_in(&other.to_string())),
        };

        let token_type = response
            .token_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_owned());

        Ok(Token::new(
            SecretString::new(response.access_token),
            token_type,
            ttl,
        ))
    }
}

fn invalid_expires_in(value: &str) -> AuthenticationError {
    AuthenticationError::InvalidTokenResponse(format!("invalid expires_in '{value}'"))
}
