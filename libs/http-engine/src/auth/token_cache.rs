use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::oauth2::Token;

type Slot = Arc<Mutex<Option<Token>>>;

/// Tokens by cache key, shared by clones.
///
/// Each key has its own async lock: the expiry check and the fetch run under
/// it, so concurrent callers for one key wait for a single in-flight fetch
/// while other keys proceed independently.
#[derive(Clone, Default)]
pub struct TokenCache {
    slots: Arc<DashMap<String, Slot>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired token for `key`, fetching and storing a new one otherwise.
    ///
    /// # Errors
    /// Returns the fetch error; nothing is cached in that case.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Token, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, E>>,
    {
        let slot = self.slot(key);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref()
            && !token.is_expired()
        {
            tracing::trace!(key, "using cached token");
            return Ok(token.clone());
        }

        tracing::debug!(key, "fetching token");
        let token = fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Unexpired token for `key`, if any
    pub async fn get(&self, key: &str) -> Option<Token> {
        let slot = self.slots.get(key).map(|slot| Arc::clone(&slot))?;
        let cached = slot.lock().await;
        cached.as_ref().filter(|token| !token.is_expired()).cloned()
    }

    pub async fn store(&self, key: &str, token: Token) {
        let slot = self.slot(key);
        *slot.lock().await = Some(token);
    }

    /// Drop the token for `key` (e.g. after the API rejected it)
    pub fn invalidate(&self, key: &str) {
        self.slots.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: &str) -> Slot {
        Arc::clone(&self.slots.entry(key.to_owned()).or_default())
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("keys", &self.slots.len())
            .finish()
    }
}
