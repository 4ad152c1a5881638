use bytes::Bytes;
use encoding_rs::{Encoding, WINDOWS_1252};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::auth::Token;
use crate::error::HttpEngineError;
use crate::pagination::PaginationStrategy;
use crate::query::QueryConfiguration;
use crate::transport::{RawResponse, ResponseBody};

/// Separator for the values of a repeated header in [`HttpResponse::headers`]
const HEADER_VALUE_SEPARATOR: &str = ";";

/// First digit of the status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    /// 600 and above
    Unknown,
}

impl From<StatusCode> for StatusClass {
    fn from(status: StatusCode) -> Self {
        match status.as_u16() {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirection,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unknown,
        }
    }
}

/// Result of one executed call
///
/// Non-2xx statuses are regular responses. The payload is read from the
/// transport on first access, bounded by the engine's `max_body_size`, and
/// then kept for later accessors; the pagination continuation is computed from
/// it with the strategy instance of this call.
pub struct HttpResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: BTreeMap<String, String>,
    encoding: &'static Encoding,
    body: Mutex<Option<ResponseBody>>,
    payload: OnceCell<Bytes>,
    max_body_size: usize,
    query: QueryConfiguration,
    strategy: Arc<dyn PaginationStrategy>,
    token: Option<Token>,
}

impl HttpResponse {
    /// Wrap a transport response.
    ///
    /// `query` is the descriptor as sent (pagination parameters included) and
    /// `token` the `OAuth2` token used for the call, if any.
    #[must_use]
    pub fn new(
        raw: RawResponse,
        query: QueryConfiguration,
        strategy: Arc<dyn PaginationStrategy>,
        token: Option<Token>,
        max_body_size: usize,
    ) -> Self {
        let encoding = detect_encoding(&raw.headers);
        Self {
            status: raw.status,
            reason: raw.reason,
            headers: flatten_headers(&raw.headers),
            encoding,
            body: Mutex::new(Some(raw.body)),
            payload: OnceCell::new(),
            max_body_size,
            query,
            strategy,
            token,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase from the status line, or the canonical one
    #[must_use]
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn status_class(&self) -> StatusClass {
        StatusClass::from(self.status)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Headers by lowercase name, repeated values joined with `;`
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Charset of the payload: the `Content-Type` charset when it names a known
    /// encoding, ISO-8859-1 otherwise
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Descriptor this response answers
    #[must_use]
    pub fn query(&self) -> &QueryConfiguration {
        &self.query
    }

    /// `OAuth2` token used to authenticate the call
    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Raw payload.
    ///
    /// # Errors
    /// `BodyTooLarge` beyond the size limit, `Payload` when reading fails (the
    /// bytes received so far are kept in the error).
    pub async fn bytes(&self) -> Result<Bytes, HttpEngineError> {
        self.payload
            .get_or_try_init(|| async {
                let body = self.body.lock().take().ok_or_else(|| HttpEngineError::Payload {
                    message: "payload unavailable after a failed read".to_owned(),
                    partial: None,
                })?;
                read_body_limited(body, self.max_body_size, self.encoding).await
            })
            .await
            .cloned()
    }

    /// Payload decoded with [`encoding`](Self::encoding); malformed sequences
    /// become U+FFFD.
    ///
    /// # Errors
    /// See [`bytes`](Self::bytes).
    pub async fn text(&self) -> Result<String, HttpEngineError> {
        let bytes = self.bytes().await?;
        let (text, _, _) = self.encoding.decode(&bytes);
        Ok(text.into_owned())
    }

    /// Payload parsed as JSON.
    ///
    /// # Errors
    /// See [`bytes`](Self::bytes); `Json` when parsing fails.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, HttpEngineError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Descriptor of the next page, `None` once pagination is exhausted.
    ///
    /// # Errors
    /// Payload errors, or `Pagination` when the payload can't be interpreted.
    pub async fn next_page_query_configuration(
        &self,
    ) -> Result<Option<QueryConfiguration>, HttpEngineError> {
        let bytes = self.bytes().await?;
        self.strategy.next_page_configuration(&self.query, &bytes)
    }

    /// Number of elements on this page (1 without pagination).
    ///
    /// # Errors
    /// Payload errors, or `Pagination` when the payload can't be interpreted.
    pub async fn last_page_count(&self) -> Result<usize, HttpEngineError> {
        let bytes = self.bytes().await?;
        self.strategy.last_count(&bytes)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .field("encoding", &self.encoding.name())
            .field("payload_loaded", &self.payload.initialized())
            .field("max_body_size", &self.max_body_size)
            .field("query", &self.query.url())
            .field("strategy", &self.strategy)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        flat.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    flat.into_iter()
        .map(|(name, values)| (name, values.join(HEADER_VALUE_SEPARATOR)))
        .collect()
}

fn detect_encoding(headers: &HeaderMap) -> &'static Encoding {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .and_then(|mime| {
            mime.get_param(mime::CHARSET)
                .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
        })
        .unwrap_or(WINDOWS_1252)
}

/// Read the (possibly decompressed) body, enforcing `limit` on the decoded bytes
async fn read_body_limited(
    body: ResponseBody,
    limit: usize,
    encoding: &'static Encoding,
) -> Result<Bytes, HttpEngineError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            tracing::debug!(error = %e, received = collected.len(), "payload read failed");
            let (partial, _, _) = encoding.decode(&collected);
            HttpEngineError::Payload {
                message: e.to_string(),
                partial: (!collected.is_empty()).then(|| partial.into_owned()),
            }
        })?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpEngineError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::pagination::{NoPagination, strategy_for};
    use crate::query::{PaginationConfig, QueryConfigurationBuilder};
    use http::HeaderValue;
    use http_body::Frame;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// One data frame, then a read error
    struct FailingBody {
        sent: bool,
    }

    impl http_body::Body for FailingBody {
        type Data = Bytes;
        type Error = Box<dyn std::error::Error + Send + Sync>;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            if self.sent {
                return Poll::Ready(Some(Err("connection reset".into())));
            }
            self.sent = true;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"[1,2")))))
        }
    }

    fn query() -> QueryConfiguration {
        QueryConfigurationBuilder::new("https://api.example.com/items")
            .build(None)
            .unwrap()
    }

    fn response_with(headers: HeaderMap, body: &'static [u8]) -> HttpResponse {
        HttpResponse::new(
            RawResponse::from_bytes(StatusCode::OK, headers, body),
            query(),
            Arc::new(NoPagination),
            None,
            1024,
        )
    }

    fn content_type(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_status_class() {
        assert_eq!(StatusClass::from(StatusCode::CONTINUE), StatusClass::Informational);
        assert_eq!(StatusClass::from(StatusCode::NO_CONTENT), StatusClass::Success);
        assert_eq!(StatusClass::from(StatusCode::FOUND), StatusClass::Redirection);
        assert_eq!(StatusClass::from(StatusCode::NOT_FOUND), StatusClass::ClientError);
        assert_eq!(StatusClass::from(StatusCode::BAD_GATEWAY), StatusClass::ServerError);
        assert_eq!(
            StatusClass::from(StatusCode::from_u16(799).unwrap()),
            StatusClass::Unknown
        );
    }

    #[test]
    fn test_reason_phrase_falls_back_to_canonical() {
        let mut raw = RawResponse::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), "");
        let plain = HttpResponse::new(raw, query(), Arc::new(NoPagination), None, 16);
        assert_eq!(plain.reason_phrase(), "Not Found");

        raw = RawResponse::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), "");
        raw.reason = Some("Nothing Here".to_owned());
        let custom = HttpResponse::new(raw, query(), Arc::new(NoPagination), None, 16);
        assert_eq!(custom.reason_phrase(), "Nothing Here");
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("X-Single", HeaderValue::from_static("v"));

        let response = response_with(headers, b"");
        assert_eq!(response.header("Set-Cookie"), Some("a=1;b=2"));
        assert_eq!(response.headers().get("x-single").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_charset_detection() {
        let utf8 = response_with(content_type("application/json; charset=UTF-8"), b"");
        assert_eq!(utf8.encoding(), encoding_rs::UTF_8);

        let utf16 = response_with(content_type("text/plain; charset=utf-16le"), b"");
        assert_eq!(utf16.encoding(), encoding_rs::UTF_16LE);

        let absent = response_with(content_type("application/json"), b"");
        assert_eq!(absent.encoding(), WINDOWS_1252);

        let unknown = response_with(content_type("text/plain; charset=klingon"), b"");
        assert_eq!(unknown.encoding(), WINDOWS_1252);

        let invalid = response_with(content_type("not a mime"), b"");
        assert_eq!(invalid.encoding(), WINDOWS_1252);
    }

    #[tokio::test]
    async fn test_text_decodes_per_charset() {
        // "caf\u{e9}" in ISO-8859-1 and in UTF-8
        let latin1 = response_with(content_type("text/plain"), b"caf\xe9");
        assert_eq!(latin1.text().await.unwrap(), "caf\u{e9}");

        let utf8 = response_with(content_type("text/plain; charset=utf-8"), b"caf\xc3\xa9");
        assert_eq!(utf8.text().await.unwrap(), "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_payload_is_read_once_and_kept() {
        let response = response_with(content_type("application/json"), br#"{"a":[1,2]}"#);
        let first = response.bytes().await.unwrap();
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(&first[..], br#"{"a":[1,2]}"#);
        assert_eq!(value["a"][1], 2);
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let response = HttpResponse::new(
            RawResponse::from_bytes(StatusCode::OK, HeaderMap::new(), vec![b'x'; 32]),
            query(),
            Arc::new(NoPagination),
            None,
            8,
        );
        assert!(matches!(
            response.bytes().await,
            Err(HttpEngineError::BodyTooLarge { limit: 8, actual: 32 })
        ));
    }

    #[tokio::test]
    async fn test_read_failure_keeps_partial_payload() {
        let raw = RawResponse {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: FailingBody { sent: false }.boxed(),
        };
        let response = HttpResponse::new(raw, query(), Arc::new(NoPagination), None, 1024);

        match response.bytes().await {
            Err(HttpEngineError::Payload { message, partial }) => {
                assert!(message.contains("connection reset"));
                assert_eq!(partial.as_deref(), Some("[1,2"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // the body is gone, later reads fail without a partial payload
        assert!(matches!(
            response.bytes().await,
            Err(HttpEngineError::Payload { partial: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_pagination_continuation() {
        let strategy = strategy_for(Some(&PaginationConfig {
            limit_value: "2".to_owned(),
            ..Default::default()
        }));
        let mut query = query();
        strategy.initiate_pagination(&mut query);

        let response = HttpResponse::new(
            RawResponse::from_bytes(StatusCode::OK, HeaderMap::new(), "[1,2]"),
            query,
            strategy,
            None,
            1024,
        );
        assert_eq!(response.last_page_count().await.unwrap(), 2);
        let next = response.next_page_query_configuration().await.unwrap().unwrap();
        assert_eq!(
            next.param(crate::query::ParamLocation::QueryParameters, "offset"),
            Some("2")
        );
    }
}
