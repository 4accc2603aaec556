use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use citadel_edge_networking::{
    CacheConfig, CacheStorage, Credentials, Destination, Fetcher, InterceptorConfig,
    LifecycleState, Method, NetworkError, NetworkInterceptor, NetworkResult, PrecacheManifest,
    Request, RequestMode, Response,
};
use citadel_edge_security::{
    Environment, InMemorySecretsBackend, KeyManagerConfig, ManualClock, PolicyAssembler,
    PolicyConfig, SecretKeyManager, SecurityError, CSP_HEADER,
};
use pretty_assertions::assert_eq;
use regex::Regex;
use tokio_test::{assert_err, assert_ok};
use url::Url;

const APP: &str = "https://app.example.com/";
const STYLE: &str = "https://app.example.com/assets/app.css";
const OFFLINE: &str = "https://app.example.com/offline.html";

#[derive(Clone)]
enum Scripted {
    Respond {
        status: u16,
        body: &'static str,
        headers: Vec<(&'static str, &'static str)>,
    },
    Fail,
}

fn ok(body: &'static str) -> Scripted {
    Scripted::Respond {
        status: 200,
        body,
        headers: vec![],
    }
}

/// Answers from a per-URL script; the last scripted answer repeats.
#[derive(Default)]
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    offline: AtomicBool,
    seen: Mutex<Vec<Request>>,
}

impl ScriptedFetcher {
    fn script(&self, url: &str, answers: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(Url::parse(url).unwrap().to_string(), answers.into());
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn last_request(&self) -> Request {
        self.seen.lock().unwrap().last().cloned().expect("no request seen")
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> NetworkResult<Response> {
        self.seen.lock().unwrap().push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionError("offline".to_string()));
        }

        let answer = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(request.url().as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match answer {
            Some(Scripted::Respond { status, body, headers }) => {
                let mut response = Response::new(
                    status,
                    HashMap::new(),
                    Bytes::from_static(body.as_bytes()),
                    request.url().clone(),
                    request.method().clone(),
                );
                for (name, value) in headers {
                    response.append_header(name, value);
                }
                Ok(response)
            }
            Some(Scripted::Fail) => Err(NetworkError::ConnectionError("scripted failure".to_string())),
            None => Ok(Response::new(
                404,
                HashMap::new(),
                Bytes::new(),
                request.url().clone(),
                request.method().clone(),
            )),
        }
    }
}

struct Harness {
    fetcher: Arc<ScriptedFetcher>,
    backend: Arc<InMemorySecretsBackend>,
    clock: Arc<ManualClock>,
    keys: Arc<SecretKeyManager>,
    policy: Arc<PolicyAssembler>,
    caches: Arc<CacheStorage>,
    interceptor: NetworkInterceptor,
}

async fn harness_with(version: &str, caches: Arc<CacheStorage>, manifest: PrecacheManifest) -> Harness {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.script(OFFLINE, vec![ok("<html>offline</html>")]);

    let backend = Arc::new(InMemorySecretsBackend::new());
    let clock = Arc::new(ManualClock::default());
    let keys = Arc::new(SecretKeyManager::with_clock(
        backend.clone(),
        KeyManagerConfig::default(),
        clock.clone(),
    ));
    keys.initialize().await.expect("key manager initializes");

    let policy = Arc::new(PolicyAssembler::new(
        Arc::clone(&keys),
        PolicyConfig::new(
            Environment::Production,
            Url::parse("https://app.example.com/csp-report").unwrap(),
        ),
    ));

    let interceptor = NetworkInterceptor::new(
        InterceptorConfig {
            version: version.to_string(),
            ..InterceptorConfig::default()
        },
        fetcher.clone(),
        Arc::clone(&policy),
        Arc::clone(&caches),
    );
    interceptor.install(&manifest).await.expect("install");
    interceptor.activate().expect("activate");

    Harness {
        fetcher,
        backend,
        clock,
        keys,
        policy,
        caches,
        interceptor,
    }
}

async fn harness() -> Harness {
    let manifest = PrecacheManifest {
        urls: vec![],
        offline_document: Some(Url::parse(OFFLINE).unwrap()),
    };
    harness_with("v2", Arc::new(CacheStorage::new(CacheConfig::default())), manifest).await
}

fn style_request() -> Request {
    Request::new(Method::GET, STYLE)
        .unwrap()
        .with_destination(Destination::Style)
}

#[tokio::test]
async fn test_stale_while_revalidate_serves_a_then_b() {
    let h = harness().await;
    h.fetcher.script(STYLE, vec![ok("A"), ok("B")]);

    // First fetch goes to the network and fills the cache
    let first = assert_ok!(h.interceptor.handle(style_request()).await);
    assert_eq!(first.body_text().unwrap(), "A");

    // Second fetch is answered from cache while B is fetched in the background
    let second = assert_ok!(h.interceptor.handle(style_request()).await);
    assert_eq!(second.body_text().unwrap(), "A");
    assert!(second.from_cache());
    h.interceptor.settle().await;

    let third = assert_ok!(h.interceptor.handle(style_request()).await);
    assert_eq!(third.body_text().unwrap(), "B");
}

#[tokio::test]
async fn test_uncacheable_refresh_keeps_cached_entry() {
    let h = harness().await;
    h.fetcher.script(
        STYLE,
        vec![
            ok("A"),
            Scripted::Respond {
                status: 500,
                body: "upstream broke",
                headers: vec![],
            },
        ],
    );

    assert_ok!(h.interceptor.handle(style_request()).await);
    assert_ok!(h.interceptor.handle(style_request()).await);
    h.interceptor.settle().await;

    let cached = assert_ok!(h.interceptor.handle(style_request()).await);
    assert_eq!(cached.body_text().unwrap(), "A");
}

#[tokio::test]
async fn test_static_asset_offline_without_cache_is_empty_success() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let response = assert_ok!(h.interceptor.handle(style_request()).await);
    assert_eq!(response.status(), 200);
    assert!(response.body().is_empty());
    assert_eq!(response.content_type().unwrap(), "text/css");
}

#[tokio::test]
async fn test_navigation_carries_assembled_policy() {
    let h = harness().await;
    h.fetcher.script(
        APP,
        vec![Scripted::Respond {
            status: 404,
            body: "<html>missing</html>",
            headers: vec![
                ("content-type", "text/html; charset=utf-8"),
                ("content-security-policy", "default-src *"),
            ],
        }],
    );

    let response = assert_ok!(h.interceptor.handle(Request::navigate(APP).unwrap()).await);

    // Status, status text and body are untouched
    assert_eq!(response.status(), 404);
    assert_eq!(response.status_text(), "Not Found");
    assert_eq!(response.body_text().unwrap(), "<html>missing</html>");

    // Exactly one policy header, replacing the upstream one
    let csp_headers: Vec<_> = response
        .headers()
        .keys()
        .filter(|k| k.eq_ignore_ascii_case(CSP_HEADER))
        .collect();
    assert_eq!(csp_headers.len(), 1);
    let header = response.header(CSP_HEADER).unwrap();

    let reference = h.policy.get_directives().await.unwrap();
    let names = |value: &str| -> Vec<String> {
        value
            .split("; ")
            .map(|d| d.split(' ').next().unwrap_or("").to_string())
            .collect()
    };
    assert_eq!(names(header.as_str()), names(reference.header_value().as_str()));
    assert_eq!(header.matches("report-uri ").count(), 1);

    let nonce = Regex::new(r"'nonce-[A-Za-z0-9+/]{22}=='").unwrap();
    assert!(nonce.is_match(header));

    let key = header
        .split("; ")
        .find(|d| d.starts_with("report-uri "))
        .and_then(|d| Url::parse(d.trim_start_matches("report-uri ")).ok())
        .and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "key")
                .map(|(_, v)| v.into_owned())
        })
        .expect("report key in policy");
    assert!(h.keys.verify_reference(&key));

    assert!(response.security_header_warnings().is_empty());
}

#[tokio::test]
async fn test_navigation_keeps_every_upstream_cookie() {
    let h = harness().await;
    h.fetcher.script(
        APP,
        vec![Scripted::Respond {
            status: 200,
            body: "<html>app</html>",
            headers: vec![
                ("content-type", "text/html; charset=utf-8"),
                ("set-cookie", "session=abc; HttpOnly"),
                ("set-cookie", "theme=dark"),
            ],
        }],
    );

    let response = assert_ok!(h.interceptor.handle(Request::navigate(APP).unwrap()).await);
    assert!(response.header(CSP_HEADER).is_some());
    assert_eq!(
        response.header_values("set-cookie"),
        vec!["session=abc; HttpOnly", "theme=dark"]
    );
}

#[tokio::test]
async fn test_offline_navigation_serves_precached_document() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let response = assert_ok!(h.interceptor.handle(Request::navigate(APP).unwrap()).await);
    assert_eq!(response.body_text().unwrap(), "<html>offline</html>");
    assert!(response.header(CSP_HEADER).is_some());
}

#[tokio::test]
async fn test_navigation_is_blocked_when_policy_cannot_be_assembled() {
    let h = harness().await;
    h.fetcher.script(APP, vec![ok("<html>app</html>")]);
    h.backend.set_available(false);
    h.clock.advance(chrono::Duration::hours(25));

    let err = assert_err!(h.interceptor.handle(Request::navigate(APP).unwrap()).await);
    assert!(matches!(
        err,
        NetworkError::PolicyAssembly(SecurityError::KeyUnavailable(_))
    ));
}

#[tokio::test]
async fn test_trusted_relay_is_forced_to_cors_without_credentials() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let request = Request::new(Method::GET, "https://relay.walletconnect.org/rpc")
        .unwrap()
        .with_header("Accept", "application/json")
        .with_credentials(Credentials::Include);
    let response = assert_ok!(h.interceptor.handle(request).await);

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("access-control-allow-origin").unwrap(), "*");
    assert_eq!(response.content_type().unwrap(), "application/json");

    let sent = h.fetcher.last_request();
    assert_eq!(sent.mode(), RequestMode::Cors);
    assert_eq!(sent.credentials(), Credentials::Omit);
}

#[tokio::test]
async fn test_other_get_failure_preserves_content_type() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let request = Request::new(Method::GET, "https://api.coingecko.com/api/v3/ping")
        .unwrap()
        .with_header("Accept", "application/json");
    let response = assert_ok!(h.interceptor.handle(request).await);
    assert_eq!(response.status(), 200);
    assert!(response.body().is_empty());
    assert_eq!(response.content_type().unwrap(), "application/json");
}

#[tokio::test]
async fn test_non_get_failure_propagates() {
    let h = harness().await;
    h.fetcher.set_offline(true);

    let request = Request::new(Method::POST, "https://app.example.com/api/orders")
        .unwrap()
        .with_body("{}");
    let err = assert_err!(h.interceptor.handle(request).await);
    assert!(err.is_fetch_failure());
}

#[tokio::test]
async fn test_extension_requests_pass_through_untouched() {
    let h = harness().await;
    let url = "chrome-extension://nkbihfbeogaeaoehlefnkodbefgpgknn/inpage.js";
    h.fetcher.script(url, vec![Scripted::Fail]);

    let request = Request::new(Method::GET, url)
        .unwrap()
        .with_destination(Destination::Script);
    assert_err!(h.interceptor.handle(request).await);

    let sent = h.fetcher.last_request();
    assert_eq!(sent.url().as_str(), url);
    assert_eq!(sent.mode(), RequestMode::NoCors);
}

#[tokio::test]
async fn test_precached_urls_are_cache_first() {
    let h = harness().await;
    let calls_before = h.fetcher.calls();

    let response = assert_ok!(
        h.interceptor
            .handle(Request::new(Method::GET, OFFLINE).unwrap())
            .await
    );
    assert_eq!(response.body_text().unwrap(), "<html>offline</html>");
    assert_eq!(h.fetcher.calls(), calls_before);
}

#[tokio::test]
async fn test_activation_removes_old_version_caches() {
    let caches = Arc::new(CacheStorage::new(CacheConfig::default()));
    let old = harness_with("v1", Arc::clone(&caches), PrecacheManifest::default()).await;
    old.fetcher.script(STYLE, vec![ok("A")]);
    assert_ok!(old.interceptor.handle(style_request()).await);
    assert!(caches.has("citadel-edge-runtime-v1"));

    let new = harness_with("v2", Arc::clone(&caches), PrecacheManifest::default()).await;
    old.interceptor.supersede("v2");

    assert!(new.interceptor.clients_claimed());
    assert!(!caches.has("citadel-edge-runtime-v1"));
    assert!(caches.has("citadel-edge-precache-v2"));
    assert_eq!(
        old.interceptor.state(),
        LifecycleState::Superseded {
            by: "v2".to_string()
        }
    );
    assert_eq!(new.caches.names().len(), 1);
}

#[tokio::test]
async fn test_requests_bypass_inactive_interceptor() {
    let h = harness().await;
    h.fetcher.script(APP, vec![ok("<html>app</html>")]);
    h.interceptor.supersede("v3");

    let response = assert_ok!(h.interceptor.handle(Request::navigate(APP).unwrap()).await);
    assert!(response.header(CSP_HEADER).is_none());
}

#[tokio::test]
async fn test_failed_precache_blocks_activation() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.script(OFFLINE, vec![Scripted::Respond {
        status: 503,
        body: "",
        headers: vec![],
    }]);

    let keys = Arc::new(SecretKeyManager::new(
        Arc::new(InMemorySecretsBackend::new()),
        KeyManagerConfig::default(),
    ));
    let policy = Arc::new(PolicyAssembler::new(
        keys,
        PolicyConfig::new(
            Environment::Production,
            Url::parse("https://app.example.com/csp-report").unwrap(),
        ),
    ));
    let interceptor = NetworkInterceptor::new(
        InterceptorConfig::default(),
        fetcher,
        policy,
        Arc::new(CacheStorage::new(CacheConfig::default())),
    );

    let manifest = PrecacheManifest {
        urls: vec![Url::parse(OFFLINE).unwrap()],
        offline_document: None,
    };
    assert_err!(interceptor.install(&manifest).await);
    assert_eq!(interceptor.state(), LifecycleState::Installing);
    assert_err!(interceptor.activate());
}

#[tokio::test]
async fn test_precache_stores_entries_marked_no_store() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.script(OFFLINE, vec![Scripted::Respond {
        status: 200,
        body: "<html>offline</html>",
        headers: vec![("cache-control", "no-store, max-age=0")],
    }]);

    let keys = Arc::new(SecretKeyManager::new(
        Arc::new(InMemorySecretsBackend::new()),
        KeyManagerConfig::default(),
    ));
    keys.initialize().await.expect("key manager initializes");
    let policy = Arc::new(PolicyAssembler::new(
        keys,
        PolicyConfig::new(
            Environment::Production,
            Url::parse("https://app.example.com/csp-report").unwrap(),
        ),
    ));
    let interceptor = NetworkInterceptor::new(
        InterceptorConfig::default(),
        fetcher.clone(),
        policy,
        Arc::new(CacheStorage::new(CacheConfig::default())),
    );

    let manifest = PrecacheManifest {
        urls: vec![Url::parse(OFFLINE).unwrap()],
        offline_document: None,
    };
    assert_eq!(assert_ok!(interceptor.install(&manifest).await), 1);
    assert_ok!(interceptor.activate());

    let calls = fetcher.calls();
    let response = assert_ok!(interceptor.handle(Request::new(Method::GET, OFFLINE).unwrap()).await);
    assert_eq!(response.body_text().unwrap(), "<html>offline</html>");
    assert!(response.from_cache());
    assert_eq!(fetcher.calls(), calls);
}
