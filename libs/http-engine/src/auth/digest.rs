//! HTTP Digest access authentication (RFC 2617, with the RFC 7616 SHA-2 algorithms)

use dashmap::DashMap;
use http::HeaderMap;
use http::header::WWW_AUTHENTICATE;
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::AuthenticationError;
use crate::secret::SecretString;

const QOP_AUTH: &str = "auth";
const QOP_AUTH_INT: &str = "auth-int";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512,
    Sha512Sess,
}

impl DigestAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Sha512Sess => "SHA-512-sess",
        }
    }

    /// `-sess` variants mix the nonce and cnonce into HA1
    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(
            self,
            DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess | DigestAlgorithm::Sha512Sess
        )
    }

    /// Lowercase hex digest of `data`
    #[must_use]
    pub fn hash(self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex::encode(Md5::digest(data)),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data))
            }
            DigestAlgorithm::Sha512 | DigestAlgorithm::Sha512Sess => {
                hex::encode(Sha512::digest(data))
            }
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = AuthenticationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            DigestAlgorithm::Md5,
            DigestAlgorithm::Md5Sess,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha256Sess,
            DigestAlgorithm::Sha512,
            DigestAlgorithm::Sha512Sess,
        ]
        .into_iter()
        .find(|alg| alg.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| AuthenticationError::UnsupportedAlgorithm(s.to_owned()))
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `WWW-Authenticate: Digest ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    /// Offered qop values, lowercase
    pub qop: Vec<String>,
    pub charset: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse the parameters of a Digest challenge. A leading `Digest` scheme
    /// token is accepted and skipped.
    ///
    /// # Errors
    /// `MissingChallengeParameter` without realm or nonce, `UnsupportedAlgorithm`
    /// for an unknown algorithm.
    pub fn parse(header: &str) -> Result<Self, AuthenticationError> {
        let params = match find_scheme(header, "digest") {
            Some(start) => parse_params(&header[start..]),
            None => parse_params(header),
        };
        let get = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        let realm = get("realm").ok_or(AuthenticationError::MissingChallengeParameter("realm"))?;
        let nonce = get("nonce").ok_or(AuthenticationError::MissingChallengeParameter("nonce"))?;
        let algorithm = match get("algorithm") {
            Some(alg) => alg.parse()?,
            None => DigestAlgorithm::Md5,
        };
        let qop = get("qop")
            .map(|qop| {
                qop.split(',')
                    .map(|q| q.trim().to_ascii_lowercase())
                    .filter(|q| !q.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            realm,
            nonce,
            opaque: get("opaque"),
            algorithm,
            qop,
            charset: get("charset"),
            stale: get("stale").is_some_and(|s| s.eq_ignore_ascii_case("true")),
        })
    }

    /// First Digest challenge among the `WWW-Authenticate` headers.
    ///
    /// # Errors
    /// `MissingChallenge` when no header offers Digest, otherwise as [`parse`](Self::parse).
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthenticationError> {
        let header = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find(|value| find_scheme(value, "digest").is_some())
            .ok_or(AuthenticationError::MissingChallenge)?;
        Self::parse(header)
    }

    fn offers(&self, qop: &str) -> bool {
        self.qop.iter().any(|q| q == qop)
    }
}

/// Offset just past the `scheme` token in a (possibly multi-challenge) header
/// value. Quoted parameter values are skipped.
fn find_scheme(header: &str, scheme: &str) -> Option<usize> {
    let lower = header.to_ascii_lowercase();
    let mut quoted = false;
    let mut escaped = false;
    let mut previous: Option<char> = None;

    for (start, c) in lower.char_indices() {
        if quoted {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                quoted = false;
            }
        } else if c == '"' {
            quoted = true;
        } else if previous.is_none_or(|p| p == ',' || p.is_whitespace())
            && lower[start..].starts_with(scheme)
        {
            let end = start + scheme.len();
            if lower[end..].chars().next().is_none_or(char::is_whitespace) {
                return Some(end);
            }
        }
        previous = Some(c);
    }
    None
}

/// `key=value` / `key="quoted value"` pairs, keys lowercased. Stops at the
/// next auth-scheme token.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            break;
        }
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut escaped = false;
            let mut end = quoted.len();
            for (i, c) in quoted.char_indices() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = i + 1;
                    break;
                } else {
                    value.push(c);
                }
            }
            rest = &quoted[end.min(quoted.len())..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_owned();
            rest = &rest[end..];
            value
        };

        params.push((key.to_ascii_lowercase(), value));
    }

    params
}

/// Request being authenticated
#[derive(Debug, Clone, Copy)]
pub struct DigestContext<'a> {
    pub method: &'a str,
    /// Request-URI as sent on the request line (path and query)
    pub uri: &'a str,
    /// Entity body, used by `auth-int`
    pub body: Option<&'a [u8]>,
}

/// Digest response generator
///
/// Keeps the nonce bookkeeping across successive responses: the same nonce
/// increments the nonce count, a new nonce resets it to 1 and regenerates the
/// client nonce.
#[derive(Debug, Clone)]
pub struct DigestScheme {
    last_nonce: Option<String>,
    nonce_count: u32,
    cnonce: String,
}

impl Default for DigestScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestScheme {
    #[must_use]
    pub fn new() -> Self {
        Self::with_cnonce(generate_cnonce())
    }

    /// Start with a fixed client nonce (used until the server nonce changes)
    #[must_use]
    pub fn with_cnonce(cnonce: impl Into<String>) -> Self {
        Self {
            last_nonce: None,
            nonce_count: 0,
            cnonce: cnonce.into(),
        }
    }

    #[must_use]
    pub fn nonce_count(&self) -> u32 {
        self.nonce_count
    }

    #[must_use]
    pub fn cnonce(&self) -> &str {
        &self.cnonce
    }

    /// Compute the `Authorization` header value answering `challenge`.
    ///
    /// # Errors
    /// `UnsupportedQop` when qop values are offered but none can be used.
    pub fn create_digest_response(
        &mut self,
        username: &str,
        password: &SecretString,
        challenge: &DigestChallenge,
        context: &DigestContext<'_>,
    ) -> Result<String, AuthenticationError> {
        let qop = select_qop(challenge, context)?;

        if self.last_nonce.as_deref() == Some(challenge.nonce.as_str()) {
            self.nonce_count += 1;
        } else {
            if self.last_nonce.is_some() {
                self.cnonce = generate_cnonce();
            }
            self.last_nonce = Some(challenge.nonce.clone());
            self.nonce_count = 1;
        }
        let nc = format!("{:08x}", self.nonce_count);

        let algorithm = challenge.algorithm;
        let credentials = Zeroizing::new(encode_credentials(
            &format!("{username}:{}:{}", challenge.realm, password.expose()),
            challenge.charset.as_deref(),
        ));
        let mut ha1 = algorithm.hash(&credentials);
        if algorithm.is_session() {
            ha1 = algorithm.hash(format!("{ha1}:{}:{}", challenge.nonce, self.cnonce).as_bytes());
        }

        let ha2 = match qop {
            Some(QOP_AUTH_INT) => {
                let body_hash = algorithm.hash(context.body.unwrap_or_default());
                algorithm.hash(format!("{}:{}:{body_hash}", context.method, context.uri).as_bytes())
            }
            _ => algorithm.hash(format!("{}:{}", context.method, context.uri).as_bytes()),
        };

        let response = match qop {
            Some(qop) => algorithm.hash(
                format!("{ha1}:{}:{nc}:{}:{qop}:{ha2}", challenge.nonce, self.cnonce).as_bytes(),
            ),
            None => algorithm.hash(format!("{ha1}:{}:{ha2}", challenge.nonce).as_bytes()),
        };

        let mut parts = vec![
            format!("username=\"{}\"", quote(username)),
            format!("realm=\"{}\"", quote(&challenge.realm)),
            format!("nonce=\"{}\"", quote(&challenge.nonce)),
            format!("uri=\"{}\"", quote(context.uri)),
            format!("response=\"{response}\""),
        ];
        if let Some(qop) = qop {
            parts.push(format!("qop={qop}"));
            parts.push(format!("nc={nc}"));
            parts.push(format!("cnonce=\"{}\"", quote(&self.cnonce)));
        }
        if let Some(opaque) = &challenge.opaque {
            parts.push(format!("opaque=\"{}\"", quote(opaque)));
        }
        parts.push(format!("algorithm={algorithm}"));

        Ok(format!("Digest {}", parts.join(", ")))
    }
}

/// `auth-int` when offered and a body is present, else `auth` when offered,
/// else legacy mode when nothing is offered.
fn select_qop(
    challenge: &DigestChallenge,
    context: &DigestContext<'_>,
) -> Result<Option<&'static str>, AuthenticationError> {
    if challenge.qop.is_empty() {
        return Ok(None);
    }
    if context.body.is_some() && challenge.offers(QOP_AUTH_INT) {
        return Ok(Some(QOP_AUTH_INT));
    }
    if challenge.offers(QOP_AUTH) {
        return Ok(Some(QOP_AUTH));
    }
    Err(AuthenticationError::UnsupportedQop(challenge.qop.join(",")))
}

/// UTF-8 when the challenge says so, ISO-8859-1 otherwise
fn encode_credentials(credentials: &str, charset: Option<&str>) -> Vec<u8> {
    if charset.is_some_and(|c| c.eq_ignore_ascii_case("utf-8")) {
        credentials.as_bytes().to_vec()
    } else {
        let (bytes, _, _) = encoding_rs::WINDOWS_1252.encode(credentials);
        bytes.into_owned()
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Digest state per `(username, host)` shared by the calls of one engine.
///
/// After a first challenge, later calls to the same host answer preemptively
/// with the last challenge; the nonce count keeps advancing.
#[derive(Clone, Default)]
pub(crate) struct DigestSessions {
    sessions: Arc<DashMap<(String, String), (DigestChallenge, DigestScheme)>>,
}

impl DigestSessions {
    /// Header value from the last challenge seen for this user and host, if any
    pub(crate) fn preemptive(
        &self,
        username: &str,
        host: &str,
        password: &SecretString,
        context: &DigestContext<'_>,
    ) -> Option<Result<String, AuthenticationError>> {
        let mut entry = self
            .sessions
            .get_mut(&(username.to_owned(), host.to_owned()))?;
        let (challenge, scheme) = &mut *entry;
        let challenge = challenge.clone();
        Some(scheme.create_digest_response(username, password, &challenge, context))
    }

    /// Answer a fresh challenge and remember it
    pub(crate) fn respond(
        &self,
        username: &str,
        host: &str,
        password: &SecretString,
        challenge: DigestChallenge,
        context: &DigestContext<'_>,
    ) -> Result<String, AuthenticationError> {
        let mut entry = self
            .sessions
            .entry((username.to_owned(), host.to_owned()))
            .or_insert_with(|| (challenge.clone(), DigestScheme::new()));
        let (stored, scheme) = &mut *entry;
        *stored = challenge;
        scheme.create_digest_response(username, password, stored, context)
    }

    pub(crate) fn forget(&self, username: &str, host: &str) {
        self.sessions.remove(&(username.to_owned(), host.to_owned()));
    }
}

impl fmt::Debug for DigestSessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestSessions")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
