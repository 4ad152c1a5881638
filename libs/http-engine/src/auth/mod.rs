//! Authentication schemes
//!
//! - [`digest`]: RFC 2617 / RFC 7616 challenge-response
//! - [`oauth2`]: client-credentials token acquisition
//! - [`token_cache`]: single-flight cache of acquired tokens
//!
//! Basic, static token, bearer and API key authentication are plain header or
//! query parameter injection and are applied by the engine.

pub mod digest;
pub mod oauth2;
pub mod token_cache;

pub use digest::{DigestAlgorithm, DigestChallenge, DigestContext, DigestScheme};
pub use oauth2::{ClientAuthMethod, OAuth20FlowExecution, Token};
pub use token_cache::TokenCache;

use base64::{Engine as _, engine::general_purpose};
use zeroize::Zeroizing;

use crate::secret::SecretString;

/// `Basic base64(username:password)`, scrubbed on drop.
pub(crate) fn basic_authorization(username: &str, password: &SecretString) -> SecretString {
    let credentials = Zeroizing::new(format!("{username}:{}", password.expose()));
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(credentials.as_bytes()));
    SecretString::new(format!("Basic {}", &*encoded))
}
