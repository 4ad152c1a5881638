use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("http-engine/", env!("CARGO_PKG_VERSION"));

/// Delimiters recognized by the [`Substitutor`](crate::Substitutor).
///
/// A placeholder reads `<opener><key_prefix><key>[:-<default>]<closer>`.
/// The optional `key_prefix` scopes placeholders to one dictionary, so
/// `{.input.id}` and `{.response.id}` can be resolved by different substitutors
/// over the same template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfiguration {
    pub opener: String,
    pub closer: String,
    pub key_prefix: Option<String>,
}

impl Default for PlaceholderConfiguration {
    fn default() -> Self {
        Self {
            opener: "{".to_owned(),
            closer: "}".to_owned(),
            key_prefix: None,
        }
    }
}

impl PlaceholderConfiguration {
    #[must_use]
    pub fn new(opener: impl Into<String>, closer: impl Into<String>) -> Self {
        Self {
            opener: opener.into(),
            closer: closer.into(),
            key_prefix: None,
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    /// Opener followed by the key prefix, e.g. `{.input.`
    #[must_use]
    pub fn opener_with_key_prefix(&self) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}{prefix}", self.opener),
            None => self.opener.clone(),
        }
    }
}

/// Transport security configuration
///
/// Controls whether the engine accepts plain HTTP targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Only `https://` targets are accepted
    #[default]
    TlsOnly,
    /// `http://` targets are accepted too
    ///
    /// **WARNING**: traffic and credentials travel unencrypted.
    AllowInsecureHttp,
}

/// Redirect handling for one call
///
/// ## Rules, in evaluation order
///
/// - `accept_redirections = false`: 3xx responses are returned as-is
/// - relative `Location` values fail unless `relative_allowed`
/// - a target visited more than `max_redirect_on_same_uri` times is a loop (error)
/// - with `only_same_host`, a different host fails unless the target starts
///   with one of `allowed_uris`
/// - after `max_redirects` hops the last 3xx response is returned
///
/// `Authorization` is never forwarded to another host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)] // independent switches, each maps to one rule
pub struct RedirectPolicy {
    pub accept_redirections: bool,
    pub only_same_host: bool,
    pub relative_allowed: bool,
    pub max_redirect_on_same_uri: usize,
    /// URI prefixes that may be targeted even across hosts
    pub allowed_uris: HashSet<String>,
    /// Total hop cap
    pub max_redirects: usize,
    /// Follow a 302 answer to a non-GET request with a GET
    pub force_get_on_302: bool,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            accept_redirections: true,
            only_same_host: true,
            relative_allowed: true,
            max_redirect_on_same_uri: 3,
            allowed_uris: HashSet::new(),
            max_redirects: 10,
            force_get_on_302: true,
        }
    }
}

impl RedirectPolicy {
    /// Follow redirects to any host (credentials are still dropped on host change)
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            only_same_host: false,
            ..Default::default()
        }
    }

    /// Return 3xx responses to the caller
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            accept_redirections: false,
            ..Default::default()
        }
    }
}

/// Engine-wide settings
///
/// Deserializable so a host application can embed it in its own config file:
///
/// ```yaml
/// http_engine:
///   transport: allow_insecure_http
///   connect_timeout_ms: 5000
///   placeholders:
///     opener: "${"
///     closer: "}"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Placeholder delimiters used when the engine builds substitutors
    pub placeholders: PlaceholderConfiguration,

    /// Maximum response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// User-Agent header value, unless the call sets one
    pub user_agent: String,

    /// Transport security mode (default: `TlsOnly`)
    pub transport: TransportSecurity,

    /// Connect timeout when the descriptor has none (default: 30 s)
    pub connect_timeout_ms: u64,

    /// Receive timeout when the descriptor has none (default: 120 s)
    pub receive_timeout_ms: u64,

    /// Token lifetime when the token endpoint omits `expires_in` (default: 5 min)
    pub oauth_default_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            placeholders: PlaceholderConfiguration::default(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            transport: TransportSecurity::TlsOnly,
            connect_timeout_ms: 30_000,
            receive_timeout_ms: 120_000,
            oauth_default_ttl_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Configuration for testing with mock servers (allows insecure HTTP)
    ///
    /// **WARNING**: Use only for local testing, never in production.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_body_size: 1024 * 1024, // 1 MB
            transport: TransportSecurity::AllowInsecureHttp,
            connect_timeout_ms: 5_000,
            receive_timeout_ms: 10_000,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    #[must_use]
    pub fn oauth_default_ttl(&self) -> Duration {
        Duration::from_secs(self.oauth_default_ttl_secs)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_defaults() {
        let config = PlaceholderConfiguration::default();
        assert_eq!(config.opener, "{");
        assert_eq!(config.closer, "}");
        assert_eq!(config.opener_with_key_prefix(), "{");
    }

    #[test]
    fn test_opener_with_key_prefix() {
        let config = PlaceholderConfiguration::new("${", "}").with_key_prefix(".input.");
        assert_eq!(config.opener_with_key_prefix(), "${.input.");
    }

    #[test]
    fn test_redirect_policy_presets() {
        let config = RedirectPolicy::default();
        assert!(config.accept_redirections);
        assert!(config.only_same_host);
        assert_eq!(config.max_redirect_on_same_uri, 3);
        assert_eq!(config.max_redirects, 10);

        assert!(!RedirectPolicy::permissive().only_same_host);
        assert!(!RedirectPolicy::disabled().accept_redirections);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.transport, TransportSecurity::TlsOnly);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.oauth_default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_engine_config_for_testing() {
        let config = EngineConfig::for_testing();
        assert_eq!(config.transport, TransportSecurity::AllowInsecureHttp);
        assert_eq!(config.max_body_size, 1024 * 1024);
    }

    #[test]
    fn test_engine_config_deserializes_partial_document() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "transport": "allow_insecure_http",
                "connect_timeout_ms": 1500,
                "placeholders": {"opener": "${", "key_prefix": ".input."}
            }"#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportSecurity::AllowInsecureHttp);
        assert_eq!(config.connect_timeout(), Duration::from_millis(1500));
        assert_eq!(config.placeholders.opener, "${");
        // unspecified fields keep their defaults
        assert_eq!(config.placeholders.closer, "}");
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
    }
}
