use super::*;
use crate::config::TransportSecurity;
use crate::error::{AuthenticationError, TransportError};
use crate::query::{PaginationConfig, QueryConfigurationBuilder};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

type Handler = Arc<dyn Fn(&OutgoingRequest, Option<&str>) -> RawResponse + Send + Sync>;

#[derive(Debug, Default)]
struct Recorded {
    requests: Vec<(OutgoingRequest, Option<String>)>,
    timeouts: Vec<Timeouts>,
    trust: Vec<TrustPolicy>,
    decompress: Vec<bool>,
    credentials: Vec<TransportCredentials>,
}

impl Recorded {
    fn authorizations(&self) -> Vec<Option<String>> {
        self.requests.iter().map(|(_, auth)| auth.clone()).collect()
    }
}

struct MockFactory {
    handler: Handler,
    recorded: Arc<Mutex<Recorded>>,
    supports_credentials: bool,
}

struct MockTransport {
    handler: Handler,
    recorded: Arc<Mutex<Recorded>>,
    supports_credentials: bool,
    authorization: Option<SecretString>,
}

impl TransportFactory for MockFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            handler: Arc::clone(&self.handler),
            recorded: Arc::clone(&self.recorded),
            supports_credentials: self.supports_credentials,
            authorization: None,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.recorded.lock().timeouts.push(timeouts);
    }

    fn set_proxy(&mut self, _proxy: Option<crate::query::ProxyConfiguration>) {}

    fn set_authorization_header(&mut self, value: Option<SecretString>) {
        self.authorization = value;
    }

    fn set_credentials(&mut self, credentials: TransportCredentials) -> Result<(), TransportError> {
        if !self.supports_credentials {
            return Err(TransportError::UnsupportedAuthentication(credentials.scheme()));
        }
        self.recorded.lock().credentials.push(credentials);
        Ok(())
    }

    fn set_redirect_policy(&mut self, _policy: crate::config::RedirectPolicy) {}

    fn set_trust_policy(&mut self, trust: TrustPolicy) {
        self.recorded.lock().trust.push(trust);
    }

    fn set_decompression(&mut self, enabled: bool) {
        self.recorded.lock().decompress.push(enabled);
    }

    async fn invoke(&mut self, request: OutgoingRequest) -> Result<RawResponse, TransportError> {
        let authorization = self.authorization.as_ref().map(|a| a.expose().to_owned());
        let response = (self.handler)(&request, authorization.as_deref());
        self.recorded.lock().requests.push((request, authorization));
        Ok(response)
    }
}

fn engine_with<F>(config: EngineConfig, handler: F) -> (HttpExecutionEngine, Arc<Mutex<Recorded>>)
where
    F: Fn(&OutgoingRequest, Option<&str>) -> RawResponse + Send + Sync + 'static,
{
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let factory = MockFactory {
        handler: Arc::new(handler),
        recorded: Arc::clone(&recorded),
        supports_credentials: true,
    };
    (HttpExecutionEngine::new(config, Arc::new(factory)), recorded)
}

fn ok_engine() -> (HttpExecutionEngine, Arc<Mutex<Recorded>>) {
    engine_with(EngineConfig::default(), |_, _| ok("ok"))
}

fn ok(body: &'static str) -> RawResponse {
    RawResponse::from_bytes(StatusCode::OK, HeaderMap::new(), body)
}

fn status(status: StatusCode, headers: &[(&'static str, &str)]) -> RawResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(*name, HeaderValue::from_str(value).unwrap());
    }
    RawResponse::from_bytes(status, map, "")
}

fn header<'a>(request: &'a OutgoingRequest, name: &str) -> Option<&'a str> {
    request.headers.get(name).map(|v| v.to_str().unwrap())
}

#[tokio::test]
async fn test_default_headers_and_basic_auth() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://api.example.com/items")
        .set_method("POST")
        .set_json_body(r#"{"a":1}"#)
        .basic_auth("Aladdin", "open sesame")
        .build(None)
        .unwrap();

    let response = engine.execute(&query, &TokenCache::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");

    let recorded = recorded.lock();
    let (request, auth) = &recorded.requests[0];
    assert_eq!(request.method, http::Method::POST);
    assert_eq!(&request.body[..], br#"{"a":1}"#);
    assert_eq!(header(request, "content-type"), Some("application/json"));
    assert_eq!(header(request, "accept"), Some("*/*"));
    assert_eq!(
        header(request, "user-agent"),
        Some(crate::config::DEFAULT_USER_AGENT)
    );
    assert_eq!(auth.as_deref(), Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="));
}

#[tokio::test]
async fn test_descriptor_headers_win() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://api.example.com/items")
        .add_header("User-Agent", "connector/1.0")
        .add_header("Accept", "text/csv")
        .add_header("Content-Type", "application/vnd.custom+json")
        .set_json_body("{}")
        .build(None)
        .unwrap();

    engine.execute(&query, &TokenCache::new()).await.unwrap();

    let recorded = recorded.lock();
    let (request, auth) = &recorded.requests[0];
    assert_eq!(header(request, "user-agent"), Some("connector/1.0"));
    assert_eq!(header(request, "accept"), Some("text/csv"));
    assert_eq!(
        header(request, "content-type"),
        Some("application/vnd.custom+json")
    );
    assert!(auth.is_none());
}

#[tokio::test]
async fn test_api_key_in_query_and_header() {
    let (engine, recorded) = ok_engine();
    let in_query = QueryConfigurationBuilder::new("https://api.example.com/items?page=1")
        .api_key(
            "key",
            "s3cr3t",
            Some("Token ".to_owned()),
            ApiKeyDestination::QueryParameters,
        )
        .build(None)
        .unwrap();
    let in_header = QueryConfigurationBuilder::new("https://api.example.com/items")
        .api_key("X-Api-Key", "s3cr3t", None, ApiKeyDestination::Header)
        .build(None)
        .unwrap();

    let tokens = TokenCache::new();
    engine.execute(&in_query, &tokens).await.unwrap();
    engine.execute(&in_header, &tokens).await.unwrap();

    let recorded = recorded.lock();
    assert_eq!(
        recorded.requests[0].0.url.as_str(),
        "https://api.example.com/items?page=1&key=Token+s3cr3t"
    );
    let header_request = &recorded.requests[1].0;
    assert_eq!(header(header_request, "x-api-key"), Some("s3cr3t"));
    assert!(header_request.headers["x-api-key"].is_sensitive());
    assert!(header_request.url.query().is_none());
}

#[tokio::test]
async fn test_invalid_api_key_header_name() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://api.example.com/items")
        .api_key("bad name", "s3cr3t", None, ApiKeyDestination::Header)
        .build(None)
        .unwrap();

    let err = engine.execute(&query, &TokenCache::new()).await.unwrap_err();
    assert!(matches!(
        err,
        HttpEngineError::Configuration(ConfigurationError::InvalidHeader { .. })
    ));
    assert!(recorded.lock().requests.is_empty());
}

#[tokio::test]
async fn test_bearer_and_static_token() {
    let (engine, recorded) = ok_engine();
    let tokens = TokenCache::new();
    let bearer = QueryConfigurationBuilder::new("https://api.example.com/a")
        .bearer_token("abc")
        .build(None)
        .unwrap();
    let verbatim = QueryConfigurationBuilder::new("https://api.example.com/b")
        .authorization_token("SSWS 00x")
        .build(None)
        .unwrap();

    engine.execute(&bearer, &tokens).await.unwrap();
    engine.execute(&verbatim, &tokens).await.unwrap();

    assert_eq!(
        recorded.lock().authorizations(),
        [Some("Bearer abc".to_owned()), Some("SSWS 00x".to_owned())]
    );
}

#[tokio::test]
async fn test_tls_only_rejects_plain_http() {
    let (engine, recorded) = ok_engine();
    let tokens = TokenCache::new();

    for url in ["http://api.example.com/items", "ftp://api.example.com/items"] {
        let query = QueryConfigurationBuilder::new(url).build(None).unwrap();
        match engine.execute(&query, &tokens).await {
            Err(HttpEngineError::UrlNotAllowed { host, .. }) => {
                assert_eq!(host, "api.example.com");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert!(recorded.lock().requests.is_empty());

    let (insecure, recorded) = engine_with(EngineConfig::for_testing(), |_, _| ok("ok"));
    assert_eq!(insecure.config().transport, TransportSecurity::AllowInsecureHttp);
    let query = QueryConfigurationBuilder::new("http://localhost:8080/items")
        .build(None)
        .unwrap();
    insecure.execute(&query, &tokens).await.unwrap();
    assert_eq!(recorded.lock().requests.len(), 1);
}

#[test]
fn test_host_allow_list() {
    let allow_list = HostAllowList::new(["api.example.com", "*.trusted.io"]);
    let check = |url: &str| allow_list.check(&Url::parse(url).unwrap());

    assert!(check("https://api.example.com/x").is_ok());
    assert!(check("https://API.Example.com/x").is_ok());
    assert!(check("https://eu.trusted.io/x").is_ok());
    assert!(check("https://a.b.trusted.io/x").is_ok());
    assert!(check("https://trusted.io/x").is_err());
    assert!(check("https://nottrusted.io/x").is_err());
    assert!(check("https://evil.example/x").is_err());
    assert!(AllowAll.check(&Url::parse("https://evil.example").unwrap()).is_ok());
}

#[tokio::test]
async fn test_allow_list_rejects_before_sending() {
    let (engine, recorded) = ok_engine();
    let engine = engine.with_allow_list(HostAllowList::new(["api.example.com"]));
    let query = QueryConfigurationBuilder::new("https://evil.example/steal")
        .build(None)
        .unwrap();

    let err = engine.execute(&query, &TokenCache::new()).await.unwrap_err();
    assert!(matches!(err, HttpEngineError::UrlNotAllowed { .. }));
    assert!(recorded.lock().requests.is_empty());
}

#[tokio::test]
async fn test_transport_settings() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://self-signed.example/x")
        .connect_timeout(Duration::from_secs(2))
        .bypass_certificate_validation(true)
        .decompress(true)
        .build(None)
        .unwrap();

    engine.execute(&query, &TokenCache::new()).await.unwrap();

    let recorded = recorded.lock();
    assert_eq!(
        recorded.timeouts,
        [Timeouts {
            connect: Duration::from_secs(2),
            receive: engine.config().receive_timeout(),
        }]
    );
    assert_eq!(recorded.trust, [TrustPolicy::TrustAll]);
    assert_eq!(recorded.decompress, [true]);
}

#[tokio::test]
async fn test_pagination_parameters_injected() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://api.example.com/items")
        .pagination(PaginationConfig::default())
        .build(None)
        .unwrap();

    let response = engine.execute(&query, &TokenCache::new()).await.unwrap();

    assert_eq!(
        recorded.lock().requests[0].0.url.as_str(),
        "https://api.example.com/items?offset=0&limit=100"
    );
    // the caller's descriptor is left untouched
    assert!(query.query_params().is_empty());
    assert_eq!(
        response.query().pagination_state(),
        crate::query::PaginationState::Initiated
    );
}

#[tokio::test]
async fn test_ntlm_credentials_reach_the_transport() {
    let (engine, recorded) = ok_engine();
    let query = QueryConfigurationBuilder::new("https://intranet.example/x")
        .ntlm_auth("alice", "pw", Some("CORP".to_owned()))
        .build(None)
        .unwrap();

    engine.execute(&query, &TokenCache::new()).await.unwrap();

    let recorded = recorded.lock();
    match &recorded.credentials[..] {
        [TransportCredentials::Ntlm {
            username, domain, ..
        }] => {
            assert_eq!(username, "alice");
            assert_eq!(domain.as_deref(), Some("CORP"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(recorded.requests[0].1.is_none());
}

#[tokio::test]
async fn test_ntlm_unsupported_by_transport() {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let factory = MockFactory {
        handler: Arc::new(|_: &OutgoingRequest, _: Option<&str>| ok("ok")),
        recorded: Arc::clone(&recorded),
        supports_credentials: false,
    };
    let engine = HttpExecutionEngine::new(EngineConfig::default(), Arc::new(factory));
    let query = QueryConfigurationBuilder::new("https://intranet.example/x")
        .ntlm_auth("alice", "pw", None)
        .build(None)
        .unwrap();

    let err = engine.execute(&query, &TokenCache::new()).await.unwrap_err();
    assert!(matches!(
        err,
        HttpEngineError::Transport(TransportError::UnsupportedAuthentication("NTLM"))
    ));
    assert!(recorded.lock().requests.is_empty());
}

const DIGEST_CHALLENGE: &str = r#"Digest realm="api", qop="auth", nonce="n1", opaque="o""#;

fn digest_server(_request: &OutgoingRequest, auth: Option<&str>) -> RawResponse {
    match auth {
        Some(auth) if auth.starts_with("Digest ") => ok("secret data"),
        _ => status(
            StatusCode::UNAUTHORIZED,
            &[("www-authenticate", DIGEST_CHALLENGE)],
        ),
    }
}

#[tokio::test]
async fn test_digest_challenge_then_preemptive() {
    let (engine, recorded) = engine_with(EngineConfig::default(), digest_server);
    let tokens = TokenCache::new();
    let query = QueryConfigurationBuilder::new("https://api.example.com/dir/index.html?x=1")
        .digest_auth("Mufasa", "Circle Of Life")
        .build(None)
        .unwrap();

    let first = engine.execute(&query, &tokens).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = engine.execute(&query, &tokens).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let auths = recorded.lock().authorizations();
    assert_eq!(auths.len(), 3, "challenge, answer, then one preemptive request");
    assert!(auths[0].is_none());

    let answer = auths[1].as_deref().unwrap();
    assert!(answer.contains(r#"username="Mufasa""#));
    assert!(answer.contains(r#"uri="/dir/index.html?x=1""#));
    assert!(answer.contains("nc=00000001"));
    assert!(answer.contains(r#"opaque="o""#));

    let preemptive = auths[2].as_deref().unwrap();
    assert!(preemptive.contains("nc=00000002"));
    assert!(preemptive.contains(r#"nonce="n1""#));
}

#[tokio::test]
async fn test_digest_stale_nonce_is_answered_once_more() {
    let (engine, recorded) = engine_with(EngineConfig::default(), |_, auth| match auth {
        None => status(
            StatusCode::UNAUTHORIZED,
            &[("www-authenticate", r#"Digest realm="api", nonce="n1""#)],
        ),
        Some(auth) if auth.contains(r#"nonce="n1""#) => status(
            StatusCode::UNAUTHORIZED,
            &[(
                "www-authenticate",
                r#"Digest realm="api", nonce="n2", stale=true"#,
            )],
        ),
        Some(_) => ok("fresh"),
    });
    let query = QueryConfigurationBuilder::new("https://api.example.com/x")
        .digest_auth("u", "p")
        .build(None)
        .unwrap();

    let response = engine.execute(&query, &TokenCache::new()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "fresh");
    assert_eq!(recorded.lock().requests.len(), 3);
}

#[tokio::test]
async fn test_digest_rejected_credentials_return_401_and_reset_session() {
    let (engine, recorded) = engine_with(EngineConfig::default(), |_, _| {
        status(
            StatusCode::UNAUTHORIZED,
            &[("www-authenticate", DIGEST_CHALLENGE)],
        )
    });
    let tokens = TokenCache::new();
    let query = QueryConfigurationBuilder::new("https://api.example.com/x")
        .digest_auth("u", "wrong")
        .build(None)
        .unwrap();

    let response = engine.execute(&query, &tokens).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(recorded.lock().requests.len(), 2);

    // no session left, so no preemptive answer
    engine.execute(&query, &tokens).await.unwrap();
    let auths = recorded.lock().authorizations();
    assert_eq!(auths.len(), 4);
    assert!(auths[2].is_none());
}

#[tokio::test]
async fn test_digest_401_without_challenge() {
    let (engine, _) = engine_with(EngineConfig::default(), |_, _| {
        status(StatusCode::UNAUTHORIZED, &[("www-authenticate", "Basic realm=\"x\"")])
    });
    let query = QueryConfigurationBuilder::new("https://api.example.com/x")
        .digest_auth("u", "p")
        .build(None)
        .unwrap();

    let err = engine.execute(&query, &TokenCache::new()).await.unwrap_err();
    assert!(matches!(
        err,
        HttpEngineError::Authentication(AuthenticationError::MissingChallenge)
    ));
}

fn oauth_server(request: &OutgoingRequest, auth: Option<&str>) -> RawResponse {
    if request.url.path() == "/oauth/token" {
        return RawResponse::from_bytes(
            StatusCode::OK,
            HeaderMap::new(),
            r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600}"#,
        );
    }
    if auth == Some("Bearer tok-1") {
        ok("protected")
    } else {
        status(StatusCode::UNAUTHORIZED, &[])
    }
}

fn oauth_query(token_endpoint: &str) -> QueryConfiguration {
    QueryConfigurationBuilder::new("https://api.example.com/data")
        .oauth2_client_credentials(
            OAuth20Configuration::new(token_endpoint, "client", "secret").with_scopes(["read"]),
        )
        .build(None)
        .unwrap()
}

#[tokio::test]
async fn test_oauth_token_fetched_once_and_attached() {
    let (engine, recorded) = engine_with(EngineConfig::default(), oauth_server);
    let tokens = TokenCache::new();
    let query = oauth_query("https://auth.example.com/oauth/token");

    for _ in 0..2 {
        let response = engine.execute(&query, &tokens).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.token().unwrap().authorization_value().expose(),
            "Bearer tok-1"
        );
    }

    let recorded = recorded.lock();
    let token_calls: Vec<_> = recorded
        .requests
        .iter()
        .filter(|(request, _)| request.url.path() == "/oauth/token")
        .collect();
    assert_eq!(token_calls.len(), 1);

    let (token_request, client_auth) = token_calls[0];
    assert_eq!(token_request.method, http::Method::POST);
    assert_eq!(
        &token_request.body[..],
        b"grant_type=client_credentials&scope=read"
    );
    assert!(client_auth.as_deref().unwrap().starts_with("Basic "));
    assert_eq!(recorded.requests.len(), 3);
}

#[tokio::test]
async fn test_oauth_failure_is_an_authentication_error() {
    let (engine, recorded) = engine_with(EngineConfig::default(), |_, _| {
        RawResponse::from_bytes(
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            r#"{"error":"invalid_client"}"#,
        )
    });
    let tokens = TokenCache::new();
    let query = oauth_query("https://auth.example.com/oauth/token");

    let err = engine.execute(&query, &tokens).await.unwrap_err();
    assert!(matches!(
        err,
        HttpEngineError::Authentication(AuthenticationError::TokenRequest(_))
    ));
    // only the token call went out, and nothing was cached
    assert_eq!(recorded.lock().requests.len(), 1);
    let key = OAuth20Configuration::new("https://auth.example.com/oauth/token", "client", "s")
        .cache_key();
    assert!(tokens.get(&key).await.is_none());
}

#[tokio::test]
async fn test_oauth_token_endpoint_checked_against_allow_list() {
    let (engine, recorded) = engine_with(EngineConfig::default(), oauth_server);
    let engine = engine.with_allow_list(HostAllowList::new(["api.example.com"]));
    let query = oauth_query("https://auth.example.com/oauth/token");

    let err = engine.execute(&query, &TokenCache::new()).await.unwrap_err();
    assert!(matches!(err, HttpEngineError::UrlNotAllowed { ref host, .. } if host == "auth.example.com"));
    assert!(recorded.lock().requests.is_empty());
}

#[tokio::test]
async fn test_execute_token_call_returns_status_and_body() {
    let (engine, _) = engine_with(EngineConfig::default(), |_, _| {
        RawResponse::from_bytes(StatusCode::CREATED, HeaderMap::new(), "body")
    });
    let query = QueryConfigurationBuilder::new("https://auth.example.com/token")
        .build(None)
        .unwrap();

    let (status, body) = engine.execute_token_call(&query).await.unwrap();
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(&body[..], b"body");
}

/// Every event rendered as `message field=value ...`
#[derive(Clone, Default)]
struct EventCapture {
    events: Arc<Mutex<Vec<(tracing::Level, String)>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .push((*event.metadata().level(), visitor.0.join(" ")));
    }
}

struct FieldVisitor(Vec<String>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push(format!("{}={value:?}", field.name()));
    }
}

#[tokio::test]
async fn test_insecure_http_warns_and_secrets_stay_out_of_logs() {
    use tracing_subscriber::layer::SubscriberExt;

    let capture = EventCapture::default();
    let events = Arc::clone(&capture.events);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture));

    let (engine, _) = engine_with(EngineConfig::for_testing(), |_, _| ok("ok"));
    let tokens = TokenCache::new();
    let in_query = QueryConfigurationBuilder::new("http://localhost/items")
        .api_key("key", "s3cr3t-key", None, ApiKeyDestination::QueryParameters)
        .build(None)
        .unwrap();
    let basic = QueryConfigurationBuilder::new("http://localhost/items")
        .basic_auth("user", "s3cr3t-password")
        .build(None)
        .unwrap();
    engine.execute(&in_query, &tokens).await.unwrap();
    engine.execute(&basic, &tokens).await.unwrap();

    let events = events.lock();
    assert!(
        events
            .iter()
            .any(|(level, text)| *level == tracing::Level::WARN && text.contains("insecure HTTP")),
        "expected an insecure HTTP warning: {:?}",
        *events
    );
    assert!(events.iter().any(|(_, text)| text.contains("executing HTTP call")));
    for (_, text) in events.iter() {
        assert!(!text.contains("s3cr3t"), "secret leaked into: {text}");
    }
}
