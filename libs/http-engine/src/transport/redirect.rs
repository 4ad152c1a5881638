//! Redirect bookkeeping for one call
//!
//! [`RedirectTracker`] decides whether a `Location` is followed, returned to
//! the caller, or rejected. [`redirected_request`] rewrites the request for the
//! next hop.

use http::{HeaderMap, Method, StatusCode, header};
use std::collections::HashMap;
use url::Url;

use super::OutgoingRequest;
use crate::config::RedirectPolicy;
use crate::error::TransportError;

/// Headers never forwarded to another host, in addition to any value marked
/// sensitive
pub const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Headers describing a request body, dropped when a redirect switches to GET
const CONTENT_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, PartialEq, Eq)]
pub enum Hop {
    Follow(Url),
    /// Hop cap reached, the 3xx response goes back to the caller
    Stop,
}

#[derive(Debug)]
pub struct RedirectTracker<'a> {
    policy: &'a RedirectPolicy,
    allow_http: bool,
    origin_host: Option<String>,
    visits: HashMap<String, usize>,
    hops: usize,
}

impl<'a> RedirectTracker<'a> {
    /// The original URL counts as visited once.
    pub fn new(policy: &'a RedirectPolicy, allow_http: bool, original: &Url) -> Self {
        Self {
            policy,
            allow_http,
            origin_host: original.host_str().map(str::to_ascii_lowercase),
            visits: HashMap::from([(original.as_str().to_owned(), 1)]),
            hops: 0,
        }
    }

    /// `true` for the 3xx statuses that carry a redirect target
    pub fn is_followable(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        )
    }

    /// `true` when `url` is on another host than the original request
    pub fn crosses_host(&self, url: &Url) -> bool {
        url.host_str().map(str::to_ascii_lowercase) != self.origin_host
    }

    /// Apply the redirect policy to `location`, received in answer to `current`.
    ///
    /// # Errors
    /// Relative, unresolvable, looping or cross-host targets the policy rejects.
    pub fn next_hop(&mut self, current: &Url, location: &str) -> Result<Hop, TransportError> {
        let target = match Url::parse(location) {
            Ok(target) => target,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                if !self.policy.relative_allowed {
                    return Err(TransportError::RelativeRedirectNotAllowed {
                        location: location.to_owned(),
                    });
                }
                current
                    .join(location)
                    .map_err(|e| invalid_redirect(location, &e.to_string()))?
            }
            Err(e) => return Err(invalid_redirect(location, &e.to_string())),
        };

        match target.scheme() {
            "https" => {}
            "http" if self.allow_http => {}
            "http" => {
                return Err(invalid_redirect(
                    location,
                    "plain HTTP targets are not allowed",
                ));
            }
            other => {
                return Err(invalid_redirect(
                    location,
                    &format!("unsupported scheme '{other}'"),
                ));
            }
        }

        let visits = self.visits.entry(target.as_str().to_owned()).or_insert(0);
        *visits += 1;
        if *visits > self.policy.max_redirect_on_same_uri {
            return Err(TransportError::RedirectLoop {
                uri: target.to_string(),
                visits: *visits,
            });
        }

        if self.policy.only_same_host
            && self.crosses_host(&target)
            && !self
                .policy
                .allowed_uris
                .iter()
                .any(|prefix| target.as_str().starts_with(prefix.as_str()))
        {
            return Err(TransportError::CrossHostRedirect {
                from: self.origin_host.clone().unwrap_or_default(),
                to: target.host_str().unwrap_or_default().to_owned(),
            });
        }

        self.hops += 1;
        if self.hops > self.policy.max_redirects {
            tracing::debug!(
                hops = self.hops,
                max = self.policy.max_redirects,
                "redirect limit reached"
            );
            return Ok(Hop::Stop);
        }

        // query strings may carry credentials
        tracing::debug!(
            from = current.path(),
            to_host = target.host_str().unwrap_or_default(),
            to = target.path(),
            hop = self.hops,
            "following redirect"
        );
        Ok(Hop::Follow(target))
    }
}

fn invalid_redirect(location: &str, reason: &str) -> TransportError {
    TransportError::InvalidRedirect {
        location: location.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Request for the next hop.
///
/// 303, and 302 with `force_get_on_302`, switch to GET and drop the body;
/// 307/308 replay the method and body. Sensitive headers are removed when
/// `crosses_host`.
pub fn redirected_request(
    mut request: OutgoingRequest,
    status: StatusCode,
    target: Url,
    force_get_on_302: bool,
    crosses_host: bool,
) -> OutgoingRequest {
    let switch_to_get = request.method != Method::GET
        && request.method != Method::HEAD
        && (status == StatusCode::SEE_OTHER || (status == StatusCode::FOUND && force_get_on_302));

    if switch_to_get {
        request.method = Method::GET;
        request.body = bytes::Bytes::new();
        strip(&mut request.headers, CONTENT_HEADERS);
    }
    if crosses_host {
        strip(&mut request.headers, SENSITIVE_HEADERS);
        let marked: Vec<header::HeaderName> = request
            .headers
            .iter()
            .filter(|(_, value)| value.is_sensitive())
            .map(|(name, _)| name.clone())
            .collect();
        strip(&mut request.headers, &marked);
    }
    request.url = target;
    request
}

fn strip(headers: &mut HeaderMap, names: &[header::HeaderName]) {
    for name in names {
        if headers.remove(name).is_some() {
            tracing::debug!(header = %name, "header removed on redirect");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn request(method: Method) -> OutgoingRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic x".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert("x-trace", "1".parse().unwrap());
        OutgoingRequest {
            method,
            url: url("https://a.example/start"),
            headers,
            body: bytes::Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn test_same_host_redirect_is_followed() {
        let policy = RedirectPolicy::default();
        let start = url("https://a.example/start");
        let mut tracker = RedirectTracker::new(&policy, false, &start);

        assert_eq!(
            tracker.next_hop(&start, "/next?x=1").unwrap(),
            Hop::Follow(url("https://a.example/next?x=1"))
        );
    }

    #[test]
    fn test_relative_redirect_rejected_when_disallowed() {
        let policy = RedirectPolicy {
            relative_allowed: false,
            ..Default::default()
        };
        let start = url("https://a.example/start");
        let mut tracker = RedirectTracker::new(&policy, false, &start);

        assert!(matches!(
            tracker.next_hop(&start, "/next"),
            Err(TransportError::RelativeRedirectNotAllowed { .. })
        ));
        assert!(tracker.next_hop(&start, "https://a.example/next").is_ok());
    }

    #[test]
    fn test_cross_host_rejected_unless_prefix_allowed() {
        let start = url("https://a.example/start");

        let policy = RedirectPolicy::default();
        let mut tracker = RedirectTracker::new(&policy, false, &start);
        match tracker.next_hop(&start, "https://b.example/x") {
            Err(TransportError::CrossHostRedirect { from, to }) => {
                assert_eq!(from, "a.example");
                assert_eq!(to, "b.example");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let policy = RedirectPolicy {
            allowed_uris: HashSet::from(["https://b.example/public/".to_owned()]),
            ..Default::default()
        };
        let mut tracker = RedirectTracker::new(&policy, false, &start);
        assert!(tracker.next_hop(&start, "https://b.example/public/x").is_ok());
        assert!(tracker.next_hop(&start, "https://b.example/private").is_err());

        let policy = RedirectPolicy::permissive();
        let mut tracker = RedirectTracker::new(&policy, false, &start);
        assert!(tracker.next_hop(&start, "https://b.example/x").is_ok());
    }

    #[test]
    fn test_loop_detected_after_max_visits() {
        let policy = RedirectPolicy::default();
        let a = url("https://a.example/a");
        let b = url("https://a.example/b");
        let mut tracker = RedirectTracker::new(&policy, false, &a);

        // a(1) -> b(1) -> a(2) -> b(2) -> a(3) -> b(3) -> a(4)
        assert!(tracker.next_hop(&a, b.as_str()).is_ok());
        assert!(tracker.next_hop(&b, a.as_str()).is_ok());
        assert!(tracker.next_hop(&a, b.as_str()).is_ok());
        assert!(tracker.next_hop(&b, a.as_str()).is_ok());
        assert!(tracker.next_hop(&a, b.as_str()).is_ok());
        match tracker.next_hop(&b, a.as_str()) {
            Err(TransportError::RedirectLoop { uri, visits }) => {
                assert_eq!(uri, "https://a.example/a");
                assert_eq!(visits, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_hop_cap_stops_without_error() {
        let policy = RedirectPolicy {
            max_redirects: 2,
            ..Default::default()
        };
        let start = url("https://a.example/0");
        let mut tracker = RedirectTracker::new(&policy, false, &start);

        assert!(matches!(tracker.next_hop(&start, "/1"), Ok(Hop::Follow(_))));
        assert!(matches!(tracker.next_hop(&start, "/2"), Ok(Hop::Follow(_))));
        assert_eq!(tracker.next_hop(&start, "/3").unwrap(), Hop::Stop);
    }

    #[test]
    fn test_scheme_checks() {
        let policy = RedirectPolicy::permissive();
        let start = url("https://a.example/start");

        let mut tls_only = RedirectTracker::new(&policy, false, &start);
        assert!(matches!(
            tls_only.next_hop(&start, "http://a.example/x"),
            Err(TransportError::InvalidRedirect { .. })
        ));
        assert!(matches!(
            tls_only.next_hop(&start, "ftp://a.example/x"),
            Err(TransportError::InvalidRedirect { .. })
        ));

        let mut insecure = RedirectTracker::new(&policy, true, &start);
        assert!(insecure.next_hop(&start, "http://a.example/x").is_ok());
    }

    #[test]
    fn test_see_other_switches_to_get() {
        let next = redirected_request(
            request(Method::POST),
            StatusCode::SEE_OTHER,
            url("https://a.example/done"),
            false,
            false,
        );
        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_empty());
        assert!(next.headers.get(header::CONTENT_TYPE).is_none());
        assert!(next.headers.get(header::AUTHORIZATION).is_some());
        assert_eq!(next.url.as_str(), "https://a.example/done");
    }

    #[test]
    fn test_found_switches_only_when_forced() {
        let forced = redirected_request(
            request(Method::POST),
            StatusCode::FOUND,
            url("https://a.example/x"),
            true,
            false,
        );
        assert_eq!(forced.method, Method::GET);

        let kept = redirected_request(
            request(Method::POST),
            StatusCode::FOUND,
            url("https://a.example/x"),
            false,
            false,
        );
        assert_eq!(kept.method, Method::POST);
        assert_eq!(&kept.body[..], b"{}");
    }

    #[test]
    fn test_temporary_redirect_replays_and_cross_host_strips() {
        let next = redirected_request(
            request(Method::PUT),
            StatusCode::TEMPORARY_REDIRECT,
            url("https://b.example/x"),
            true,
            true,
        );
        assert_eq!(next.method, Method::PUT);
        assert_eq!(&next.body[..], b"{}");
        assert!(next.headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(next.headers.get("x-trace").unwrap(), "1");
    }

    #[test]
    fn test_sensitive_values_stripped_only_across_hosts() {
        let mut original = request(Method::GET);
        let mut key = header::HeaderValue::from_static("secret");
        key.set_sensitive(true);
        original.headers.insert("x-api-key", key);

        let same = redirected_request(
            original.clone(),
            StatusCode::FOUND,
            url("https://a.example/next"),
            true,
            false,
        );
        assert_eq!(same.headers.get("x-api-key").unwrap(), "secret");

        let other = redirected_request(
            original,
            StatusCode::FOUND,
            url("https://b.example/next"),
            true,
            true,
        );
        assert!(other.headers.get("x-api-key").is_none());
        assert_eq!(other.headers.get("x-trace").unwrap(), "1");
    }
}
