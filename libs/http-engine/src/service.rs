use crate::auth::TokenCache;
use crate::engine::HttpExecutionEngine;
use crate::error::{ConfigurationError, HttpEngineError};
use crate::query::{QueryConfiguration, QueryConfigurationBuilder};
use crate::response::HttpResponse;
use crate::substitutor::Substitutor;

/// Error bodies kept in `HttpStatus` errors are cut at this many bytes
const ERROR_BODY_LIMIT: usize = 8 * 1024;

/// Source of a [`QueryConfiguration`], implemented by the configuration layer.
pub trait QueryDescriptor {
    /// Build the call, substituting placeholders when `substitutor` is given.
    ///
    /// # Errors
    /// The descriptor is invalid or conflicting.
    fn to_query_configuration(
        &self,
        substitutor: Option<&Substitutor>,
    ) -> Result<QueryConfiguration, ConfigurationError>;
}

impl QueryDescriptor for QueryConfigurationBuilder {
    fn to_query_configuration(
        &self,
        substitutor: Option<&Substitutor>,
    ) -> Result<QueryConfiguration, ConfigurationError> {
        self.clone().build(substitutor)
    }
}

/// Entry point for connectors.
///
/// Owns the `OAuth2` token cache shared by every call made through it (and its
/// clones), and the die-on-error policy.
///
/// # Example
///
/// ```ignore
/// let service = HttpClientService::new(HttpExecutionEngine::with_hyper_transport(config))
///     .die_on_error(true);
/// let pages = service.fetch_all_pages(&query, 50).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HttpClientService {
    engine: HttpExecutionEngine,
    tokens: TokenCache,
    die_on_error: bool,
}

impl HttpClientService {
    #[must_use]
    pub fn new(engine: HttpExecutionEngine) -> Self {
        Self {
            engine,
            tokens: TokenCache::new(),
            die_on_error: false,
        }
    }

    /// Turn non-2xx responses into [`HttpEngineError::HttpStatus`]
    #[must_use]
    pub fn die_on_error(mut self, die_on_error: bool) -> Self {
        self.die_on_error = die_on_error;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &HttpExecutionEngine {
        &self.engine
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Execute one call.
    ///
    /// # Errors
    /// Engine errors, and `HttpStatus` for a non-2xx status when die-on-error
    /// is enabled.
    pub async fn invoke(&self, query: &QueryConfiguration) -> Result<HttpResponse, HttpEngineError> {
        let response = self.engine.execute(query, &self.tokens).await?;
        if self.die_on_error && !response.is_success() {
            return Err(status_error(&response).await);
        }
        Ok(response)
    }

    /// Build the call from `descriptor`, then execute it.
    ///
    /// # Errors
    /// Configuration errors of the descriptor, then as [`invoke`](Self::invoke).
    pub async fn invoke_descriptor<D>(
        &self,
        descriptor: &D,
        substitutor: Option<&Substitutor>,
    ) -> Result<HttpResponse, HttpEngineError>
    where
        D: QueryDescriptor + ?Sized,
    {
        let query = descriptor.to_query_configuration(substitutor)?;
        self.invoke(&query).await
    }

    /// Execute `query` and its following pages, at most `max_pages` calls.
    ///
    /// Stops at the first exhausted page or the first non-2xx response, which
    /// is included in the result.
    ///
    /// # Errors
    /// The first failing call, or a payload that can't be paged.
    pub async fn fetch_all_pages(
        &self,
        query: &QueryConfiguration,
        max_pages: usize,
    ) -> Result<Vec<HttpResponse>, HttpEngineError> {
        let mut pages = Vec::new();
        let mut current = query.clone();

        while pages.len() < max_pages {
            let response = self.invoke(&current).await?;
            let next = if response.is_success() {
                response.next_page_query_configuration().await?
            } else {
                None
            };
            pages.push(response);

            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        if pages.len() == max_pages {
            tracing::debug!(max_pages, url = %query.url(), "page limit reached");
        }
        Ok(pages)
    }
}

/// `HttpStatus` error carrying the (truncated) response body.
///
/// A body that can't be read leaves what was received, possibly nothing.
async fn status_error(response: &HttpResponse) -> HttpEngineError {
    let body = match response.text().await {
        Ok(body) => body,
        Err(HttpEngineError::Payload { partial, .. }) => partial.unwrap_or_default(),
        Err(err) => {
            tracing::debug!(error = %err, "error body not kept");
            String::new()
        }
    };
    tracing::debug!(
        status = response.status().as_u16(),
        url = url_without_query(response.query().url()),
        "non-success status with die-on-error"
    );
    HttpEngineError::HttpStatus {
        status: response.status(),
        body: truncate(&body, ERROR_BODY_LIMIT).to_owned(),
    }
}

/// The query string may carry credentials
fn url_without_query(url: &str) -> &str {
    url.split('?').next().unwrap_or_default()
}

fn truncate(text: &str, limit: usize) -> &str {
    &text[..text.floor_char_boundary(limit)]
}
