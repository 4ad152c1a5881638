//! Wire encoding of a [`QueryConfiguration`](crate::QueryConfiguration)
//!
//! URL composition, header map and body bytes with their content type.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use url::Url;

use crate::error::ConfigurationError;
use crate::query::{Attachment, Body, BodyFormat, KeyValuePair};

const OCTET_STREAM: &str = "application/octet-stream";

/// Body bytes and the content type matching its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl EncodedBody {
    fn empty() -> Self {
        Self {
            content_type: None,
            bytes: Bytes::new(),
        }
    }
}

/// `url` with `query_params` appended in order, after any query already present.
///
/// # Errors
/// `InvalidUrl` when `url` is not an absolute URL.
pub fn compose_url(url: &str, query_params: &[KeyValuePair]) -> Result<Url, ConfigurationError> {
    let mut parsed = Url::parse(url).map_err(|e| ConfigurationError::InvalidUrl {
        url: url.to_owned(),
        reason: e.to_string(),
    })?;

    if parsed.cannot_be_a_base() || parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigurationError::InvalidUrl {
            url: url.to_owned(),
            reason: "URL has no host".to_owned(),
        });
    }

    if !query_params.is_empty() {
        let mut pairs = parsed.query_pairs_mut();
        for param in query_params {
            pairs.append_pair(&param.key, &param.value);
        }
    }
    Ok(parsed)
}

/// Headers in descriptor order; repeated names are kept as repeated fields.
///
/// # Errors
/// `InvalidHeader` for a name or value that can't be sent.
pub fn header_map(headers: &[KeyValuePair]) -> Result<HeaderMap, ConfigurationError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let invalid = |reason: String| ConfigurationError::InvalidHeader {
            name: header.key.clone(),
            reason,
        };
        let name = HeaderName::try_from(header.key.as_str()).map_err(|e| invalid(e.to_string()))?;
        let value =
            HeaderValue::try_from(header.value.as_str()).map_err(|e| invalid(e.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Encode `body` per its format.
///
/// # Errors
/// `InvalidBody` when URL-encoding fails.
pub fn encode_body(body: Option<&Body>) -> Result<EncodedBody, ConfigurationError> {
    let Some(body) = body else {
        return Ok(EncodedBody::empty());
    };

    let (content_type, bytes) = match body.format() {
        BodyFormat::Text => ("text/plain; charset=utf-8".to_owned(), raw(body)),
        BodyFormat::Json => ("application/json".to_owned(), raw(body)),
        BodyFormat::Xml => ("application/xml".to_owned(), raw(body)),
        BodyFormat::Urlencoded => {
            let pairs: Vec<(&str, &str)> = body
                .params()
                .iter()
                .map(|kv| (kv.key.as_str(), kv.value.as_str()))
                .chain(
                    body.secret_params
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.expose())),
                )
                .collect();
            let encoded = serde_urlencoded::to_string(pairs)
                .map_err(|e| ConfigurationError::InvalidBody(e.to_string()))?;
            (
                "application/x-www-form-urlencoded".to_owned(),
                Bytes::from(encoded),
            )
        }
        BodyFormat::FormData => {
            let boundary = generate_boundary();
            let bytes = multipart(&boundary, body.params(), body.attachments());
            (format!("multipart/form-data; boundary={boundary}"), bytes)
        }
    };

    Ok(EncodedBody {
        content_type: Some(content_type),
        bytes,
    })
}

fn raw(body: &Body) -> Bytes {
    Bytes::from(body.content().unwrap_or_default().to_owned())
}

fn generate_boundary() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    format!("----http-engine-{}", hex::encode(bytes))
}

/// RFC 7578 body: text fields first, then files
fn multipart(boundary: &str, params: &[KeyValuePair], attachments: &[Attachment]) -> Bytes {
    let mut out = BytesMut::new();

    for param in params {
        put_part_head(&mut out, boundary, &param.key, None, None);
        out.put_slice(param.value.as_bytes());
        out.put_slice(b"\r\n");
    }

    for attachment in attachments {
        let content_type = attachment.content_type.as_deref().unwrap_or(OCTET_STREAM);
        let file_name = attachment
            .file_name
            .as_deref()
            .unwrap_or(attachment.name.as_str());
        put_part_head(
            &mut out,
            boundary,
            &attachment.name,
            Some(file_name),
            Some(content_type),
        );
        out.put_slice(&attachment.content);
        out.put_slice(b"\r\n");
    }

    out.put_slice(format!("--{boundary}--\r\n").as_bytes());
    out.freeze()
}

fn put_part_head(
    out: &mut BytesMut,
    boundary: &str,
    name: &str,
    file_name: Option<&str>,
    content_type: Option<&str>,
) {
    out.put_slice(format!("--{boundary}\r\n").as_bytes());
    let disposition = match file_name {
        Some(file_name) => format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            escape_quoted(name),
            escape_quoted(file_name)
        ),
        None => format!(
            "Content-Disposition: form-data; name=\"{}\"\r\n",
            escape_quoted(name)
        ),
    };
    out.put_slice(disposition.as_bytes());
    if let Some(content_type) = content_type {
        out.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    }
    out.put_slice(b"\r\n");
}

/// Percent-encode the characters that would end a quoted parameter or the header line
fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
