//! Pagination strategies
//!
//! A strategy prepares the first request ([`initiate_pagination`]) and derives
//! the next request from the current response payload
//! ([`next_page_configuration`]). The engine creates one strategy instance per
//! executed call.
//!
//! [`initiate_pagination`]: PaginationStrategy::initiate_pagination
//! [`next_page_configuration`]: PaginationStrategy::next_page_configuration

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::HttpEngineError;
use crate::query::{PaginationConfig, PaginationState, QueryConfiguration};

pub trait PaginationStrategy: Send + Sync + fmt::Debug {
    /// Inject the first-page parameters. Runs at most once per descriptor.
    fn initiate_pagination(&self, query: &mut QueryConfiguration);

    /// Descriptor of the next page, or `None` when `payload` ends the sequence.
    ///
    /// # Errors
    /// `Pagination` when the payload or the descriptor can't be interpreted.
    fn next_page_configuration(
        &self,
        query: &QueryConfiguration,
        payload: &[u8],
    ) -> Result<Option<QueryConfiguration>, HttpEngineError>;

    /// Number of elements in `payload`, computed on first access and then
    /// cached for the lifetime of the instance.
    ///
    /// # Errors
    /// `Pagination` when the payload can't be interpreted.
    fn last_count(&self, payload: &[u8]) -> Result<usize, HttpEngineError>;
}

/// Strategy for a descriptor's pagination settings
#[must_use]
pub fn strategy_for(config: Option<&PaginationConfig>) -> Arc<dyn PaginationStrategy> {
    match config {
        Some(config) => Arc::new(OffsetLimitPaginationStrategy::new(config.clone())),
        None => Arc::new(NoPagination),
    }
}

/// Single-page responses
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPagination;

impl PaginationStrategy for NoPagination {
    fn initiate_pagination(&self, _query: &mut QueryConfiguration) {}

    fn next_page_configuration(
        &self,
        _query: &QueryConfiguration,
        _payload: &[u8],
    ) -> Result<Option<QueryConfiguration>, HttpEngineError> {
        Ok(None)
    }

    fn last_count(&self, _payload: &[u8]) -> Result<usize, HttpEngineError> {
        Ok(1)
    }
}

/// Offset/limit paging over a JSON array
///
/// The offset advances by the number of elements received. An empty page ends
/// the sequence.
#[derive(Debug)]
pub struct OffsetLimitPaginationStrategy {
    config: PaginationConfig,
    last_count: OnceLock<usize>,
}

impl OffsetLimitPaginationStrategy {
    #[must_use]
    pub fn new(config: PaginationConfig) -> Self {
        Self {
            config,
            last_count: OnceLock::new(),
        }
    }

    /// Length of the array at the configured elements path
    fn count_elements(&self, payload: &[u8]) -> Result<usize, HttpEngineError> {
        let root: Value = serde_json::from_slice(payload).map_err(|e| {
            HttpEngineError::Pagination(format!("response payload is not JSON: {e}"))
        })?;

        let path = self.config.elements_path.trim().trim_matches('.');
        let mut node = &root;
        if !path.is_empty() {
            for segment in path.split('.') {
                let Value::Object(object) = node else {
                    return Err(HttpEngineError::Pagination(format!(
                        "expected a JSON object before '{segment}' in elements path '{path}'"
                    )));
                };
                node = object.get(segment).ok_or_else(|| {
                    HttpEngineError::Pagination(format!(
                        "'{segment}' not found in elements path '{path}'"
                    ))
                })?;
            }
        }

        match node {
            Value::Array(elements) => Ok(elements.len()),
            _ => Err(HttpEngineError::Pagination(format!(
                "elements path '{path}' does not point to a JSON array"
            ))),
        }
    }
}

impl PaginationStrategy for OffsetLimitPaginationStrategy {
    fn initiate_pagination(&self, query: &mut QueryConfiguration) {
        if query.pagination_state() != PaginationState::NotInitiated {
            return;
        }
        let location = self.config.location;
        query.upsert_param(location, &self.config.offset_param, &self.config.offset_value);
        query.upsert_param(location, &self.config.limit_param, &self.config.limit_value);
        query.set_pagination_state(PaginationState::Initiated);
    }

    fn next_page_configuration(
        &self,
        query: &QueryConfiguration,
        payload: &[u8],
    ) -> Result<Option<QueryConfiguration>, HttpEngineError> {
        let received = self.count_elements(payload)?;
        if received == 0 {
            tracing::debug!(url = %query.url(), "empty page, pagination exhausted");
            return Ok(None);
        }

        let location = self.config.location;
        let current = query
            .param(location, &self.config.offset_param)
            .unwrap_or(self.config.offset_value.as_str());
        let offset: u64 = current.trim().parse().map_err(|_| {
            HttpEngineError::Pagination(format!(
                "offset parameter '{}' is not an integer: '{current}'",
                self.config.offset_param
            ))
        })?;
        let next_offset = u64::try_from(received)
            .ok()
            .and_then(|received| offset.checked_add(received))
            .ok_or_else(|| HttpEngineError::Pagination("offset overflow".to_owned()))?;

        let mut next = query.clone();
        next.upsert_param(location, &self.config.offset_param, next_offset.to_string());
        next.upsert_param(location, &self.config.limit_param, &self.config.limit_value);
        next.set_pagination_state(PaginationState::Initiated);

        tracing::debug!(offset = next_offset, received, "next page");
        Ok(Some(next))
    }

    fn last_count(&self, payload: &[u8]) -> Result<usize, HttpEngineError> {
        if let Some(count) = self.last_count.get() {
            return Ok(*count);
        }
        let count = self.count_elements(payload)?;
        Ok(*self.last_count.get_or_init(|| count))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::query::{ParamLocation, QueryConfigurationBuilder};

    fn config(elements_path: &str) -> PaginationConfig {
        PaginationConfig {
            offset_value: "0".to_owned(),
            limit_value: "2".to_owned(),
            elements_path: elements_path.to_owned(),
            ..Default::default()
        }
    }

    fn initiated(strategy: &OffsetLimitPaginationStrategy) -> QueryConfiguration {
        let mut query = QueryConfigurationBuilder::new("https://api/items")
            .build(None)
            .unwrap();
        strategy.initiate_pagination(&mut query);
        query
    }

    #[test]
    fn test_initiate_injects_parameters_once() {
        let strategy = OffsetLimitPaginationStrategy::new(config(""));
        let mut query = initiated(&strategy);
        assert_eq!(query.pagination_state(), PaginationState::Initiated);
        assert_eq!(query.param(ParamLocation::QueryParameters, "offset"), Some("0"));
        assert_eq!(query.param(ParamLocation::QueryParameters, "limit"), Some("2"));

        query.upsert_param(ParamLocation::QueryParameters, "offset", "8");
        strategy.initiate_pagination(&mut query);
        assert_eq!(query.param(ParamLocation::QueryParameters, "offset"), Some("8"));
        assert_eq!(query.query_params().len(), 2);
    }

    #[test]
    fn test_header_location() {
        let strategy = OffsetLimitPaginationStrategy::new(PaginationConfig {
            location: ParamLocation::Headers,
            offset_param: "X-Offset".to_owned(),
            limit_param: "X-Limit".to_owned(),
            ..config("")
        });
        let query = initiated(&strategy);
        assert_eq!(query.param(ParamLocation::Headers, "x-offset"), Some("0"));
        assert!(query.query_params().is_empty());

        let next = strategy
            .next_page_configuration(&query, b"[1,2]")
            .unwrap()
            .unwrap();
        assert_eq!(next.param(ParamLocation::Headers, "X-Offset"), Some("2"));
    }

    #[test]
    fn test_offset_advances_by_received_count() {
        let strategy = OffsetLimitPaginationStrategy::new(config("data.items"));
        let query = initiated(&strategy);

        let next = strategy
            .next_page_configuration(&query, br#"{"data":{"items":[1,2]}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(next.param(ParamLocation::QueryParameters, "offset"), Some("2"));
        assert_eq!(next.param(ParamLocation::QueryParameters, "limit"), Some("2"));

        let after = strategy
            .next_page_configuration(&next, br#"{"data":{"items":[3]}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(after.param(ParamLocation::QueryParameters, "offset"), Some("3"));

        // source descriptor untouched
        assert_eq!(query.param(ParamLocation::QueryParameters, "offset"), Some("0"));
    }

    #[test]
    fn test_empty_page_terminates() {
        let strategy = OffsetLimitPaginationStrategy::new(config("data.items"));
        let query = initiated(&strategy);
        assert!(
            strategy
                .next_page_configuration(&query, br#"{"data":{"items":[]}}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_leading_and_trailing_dots_are_ignored() {
        let strategy = OffsetLimitPaginationStrategy::new(config(".data.items."));
        let query = initiated(&strategy);
        assert!(
            strategy
                .next_page_configuration(&query, br#"{"data":{"items":[1]}}"#)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_non_object_intermediate_fails() {
        let strategy = OffsetLimitPaginationStrategy::new(config("data.items"));
        let query = initiated(&strategy);
        let err = strategy
            .next_page_configuration(&query, br#"{"data":[{"items":[1]}]}"#)
            .unwrap_err();
        assert!(matches!(err, HttpEngineError::Pagination(_)));
    }

    #[test]
    fn test_unparsable_payloads_are_errors_not_empty_pages() {
        let strategy = OffsetLimitPaginationStrategy::new(config("items"));
        let query = initiated(&strategy);
        let payloads: [&[u8]; 3] = [b"<xml/>", br#"{"other":[]}"#, br#"{"items":{}}"#];
        for payload in payloads {
            assert!(matches!(
                strategy.next_page_configuration(&query, payload),
                Err(HttpEngineError::Pagination(_))
            ));
        }
    }

    #[test]
    fn test_non_integer_offset_fails() {
        let strategy = OffsetLimitPaginationStrategy::new(config(""));
        let mut query = initiated(&strategy);
        query.upsert_param(ParamLocation::QueryParameters, "offset", "abc");
        assert!(matches!(
            strategy.next_page_configuration(&query, b"[1]"),
            Err(HttpEngineError::Pagination(_))
        ));
    }

    #[test]
    fn test_last_count_is_memoized_per_instance() {
        let strategy = OffsetLimitPaginationStrategy::new(config(""));
        assert_eq!(strategy.last_count(b"[1,2,3]").unwrap(), 3);
        // later payloads don't change the cached value
        assert_eq!(strategy.last_count(b"[1]").unwrap(), 3);

        let fresh = OffsetLimitPaginationStrategy::new(config(""));
        assert_eq!(fresh.last_count(b"[1]").unwrap(), 1);
    }

    #[test]
    fn test_no_pagination() {
        let strategy = strategy_for(None);
        let mut query = QueryConfigurationBuilder::new("https://api/items")
            .build(None)
            .unwrap();
        strategy.initiate_pagination(&mut query);
        assert!(query.query_params().is_empty());
        assert_eq!(query.pagination_state(), PaginationState::NotInitiated);
        assert!(strategy.next_page_configuration(&query, b"[1]").unwrap().is_none());
        assert_eq!(strategy.last_count(b"anything").unwrap(), 1);
    }
}
