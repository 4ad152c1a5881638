//! Placeholder substitution
//!
//! Replaces `<opener><key_prefix><key>[:-<default>]<closer>` tokens with values
//! from a dictionary. A backslash right before an opener keeps the opener
//! literal and is itself dropped. Plain openers inside a placeholder (payload
//! text such as `{x{y}z}`) push the closer search past their own closer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::config::PlaceholderConfiguration;

/// Separates a key from its default value inside a placeholder
const DEFAULT_SEPARATOR: &str = ":-";

const ESCAPE: u8 = b'\\';

type Dictionary = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Placeholder replacer over a memoized dictionary.
///
/// Lookups are cached for the lifetime of the instance, keyed by the key
/// without its default. Build one substitutor per source record; the cache
/// assumes the dictionary does not change.
pub struct Substitutor {
    config: PlaceholderConfiguration,
    opener_with_prefix: String,
    dictionary: Dictionary,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl fmt::Debug for Substitutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Substitutor")
            .field("config", &self.config)
            .field("cached_keys", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl Substitutor {
    #[must_use]
    pub fn new(
        config: PlaceholderConfiguration,
        dictionary: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let opener_with_prefix = config.opener_with_key_prefix();
        Self {
            config,
            opener_with_prefix,
            dictionary: Box::new(dictionary),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Dictionary backed by a plain map.
    #[must_use]
    pub fn from_map<I, K, V>(config: PlaceholderConfiguration, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(config, move |key| values.get(key).cloned())
    }

    /// Dictionary over an upstream JSON record.
    ///
    /// Keys starting with `/` are JSON pointers (`/input/token`), other keys
    /// name a top-level field. Strings resolve to their content, `null` and
    /// missing values are unresolved, anything else resolves to its JSON text.
    #[must_use]
    pub fn from_json_record(config: PlaceholderConfiguration, record: serde_json::Value) -> Self {
        Self::new(config, move |key| {
            let value = if key.starts_with('/') {
                record.pointer(key)
            } else {
                record.get(key)
            };
            match value? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        })
    }

    #[must_use]
    pub fn config(&self) -> &PlaceholderConfiguration {
        &self.config
    }

    /// Replace every placeholder in `source`.
    ///
    /// Unresolved keys without a default become the empty string. An opener
    /// without a matching closer leaves the rest of the source untouched.
    #[must_use]
    pub fn replace(&self, source: &str) -> String {
        let opener = self.config.opener.as_str();
        let closer = self.config.closer.as_str();
        let prefixed = self.opener_with_prefix.as_str();

        if prefixed.is_empty()
            || closer.is_empty()
            || source.trim().is_empty()
            || source.len() < prefixed.len() + closer.len()
        {
            return source.to_owned();
        }

        let mut out = String::with_capacity(source.len());
        let mut cursor = 0;

        while let Some(offset) = source[cursor..].find(prefixed) {
            let start = cursor + offset;

            if start > cursor && source.as_bytes()[start - 1] == ESCAPE {
                out.push_str(&source[cursor..start - 1]);
                out.push_str(opener);
                cursor = start + opener.len();
                continue;
            }

            let key_start = start + prefixed.len();
            let Some(end) = find_closer(source, key_start, opener, closer) else {
                break;
            };

            out.push_str(&source[cursor..start]);
            out.push_str(&self.resolve(&source[key_start..end]));
            cursor = end + closer.len();
        }

        out.push_str(&source[cursor..]);
        out
    }

    fn resolve(&self, placeholder: &str) -> String {
        let (key, default) = match placeholder.split_once(DEFAULT_SEPARATOR) {
            Some((key, default)) => (key, Some(default)),
            None => (placeholder, None),
        };

        match self.lookup(key) {
            Some(value) => value,
            None => default.unwrap_or_default().to_owned(),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().get(key) {
            return hit.clone();
        }

        let value = (self.dictionary)(key);
        if value.is_none() {
            tracing::trace!(key, "placeholder key not found in dictionary");
        }
        self.cache.lock().insert(key.to_owned(), value.clone());
        value
    }
}

/// Position of the closer ending the placeholder whose key starts at `from`.
///
/// Every plain opener met before the current candidate moves the candidate to
/// the next closer.
fn find_closer(source: &str, from: usize, opener: &str, closer: &str) -> Option<usize> {
    let mut end = from + source[from..].find(closer)?;
    let mut nested_from = from;

    while let Some(offset) = source[nested_from..end].find(opener) {
        nested_from += offset + opener.len();
        let after = end + closer.len();
        end = after + source[after..].find(closer)?;
    }

    Some(end)
}
