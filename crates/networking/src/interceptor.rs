//! The request interceptor.
//!
//! Mediates every outbound request of a page: serves the precache, keeps
//! static assets fresh in the background, shields trusted relay handshakes
//! and ordinary GETs from network failures, and stamps every navigation
//! with a freshly assembled Content-Security-Policy.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use citadel_edge_security::{companion_headers, AssembledPolicy, PolicyAssembler, CSP_HEADER};
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use url::Url;

use crate::boundary::{handle_error, ErrorReport};
use crate::cache::{CacheStorage, ResourceCache, CACHE_PREFIX};
use crate::error::{NetworkError, NetworkResult};
use crate::fetcher::Fetcher;
use crate::request::{Credentials, Method, Request, RequestMode};
use crate::response::Response;
use crate::routing::{AssetKind, RouteClass, RouteTable, TRUSTED_REALTIME_DOMAINS};

/// Interceptor lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Installing,
    /// Clients claimed and old caches removed
    Activated,
    /// Handling requests
    Active,
    Superseded { by: String },
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Installing => write!(f, "installing"),
            LifecycleState::Activated => write!(f, "activated"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Superseded { by } => write!(f, "superseded by {}", by),
        }
    }
}

/// Resources fetched into the precache at install time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheManifest {
    #[serde(default)]
    pub urls: Vec<Url>,
    /// Served for navigations while the network is down
    #[serde(default)]
    pub offline_document: Option<Url>,
}

impl PrecacheManifest {
    /// Every URL to precache, offline document included, without duplicates
    pub fn all_urls(&self) -> Vec<Url> {
        let mut seen = HashSet::new();
        self.urls
            .iter()
            .chain(self.offline_document.iter())
            .filter(|url| seen.insert(url.as_str().to_string()))
            .cloned()
            .collect()
    }
}

/// Interceptor settings
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Deployment version; names this interceptor's caches
    pub version: String,
    pub trusted_realtime_domains: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            trusted_realtime_domains: TRUSTED_REALTIME_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl InterceptorConfig {
    pub fn precache_name(&self) -> String {
        format!("{}-precache-{}", CACHE_PREFIX, self.version)
    }

    pub fn runtime_cache_name(&self) -> String {
        format!("{}-runtime-{}", CACHE_PREFIX, self.version)
    }
}

pub struct NetworkInterceptor {
    config: InterceptorConfig,
    fetcher: Arc<dyn Fetcher>,
    policy: Arc<PolicyAssembler>,
    caches: Arc<CacheStorage>,
    state: RwLock<LifecycleState>,
    routes: RwLock<Arc<RouteTable>>,
    offline_document: RwLock<Option<Url>>,
    installed: AtomicBool,
    clients_claimed: AtomicBool,
    revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkInterceptor {
    pub fn new(
        config: InterceptorConfig,
        fetcher: Arc<dyn Fetcher>,
        policy: Arc<PolicyAssembler>,
        caches: Arc<CacheStorage>,
    ) -> Self {
        let routes = RouteTable::standard(HashSet::new(), config.trusted_realtime_domains.clone());
        Self {
            config,
            fetcher,
            policy,
            caches,
            state: RwLock::new(LifecycleState::Installing),
            routes: RwLock::new(Arc::new(routes)),
            offline_document: RwLock::new(None),
            installed: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
            revalidations: Mutex::new(Vec::new()),
        }
    }

    /// Fetch every manifest entry into the precache and build the route table.
    ///
    /// Any failed or uncacheable entry fails the install.
    pub async fn install(&self, manifest: &PrecacheManifest) -> NetworkResult<usize> {
        self.expect_state(&LifecycleState::Installing, "install")?;

        let precache = self.caches.open(&self.config.precache_name());
        let urls = manifest.all_urls();
        let fetches = urls.iter().map(|url| {
            let fetcher = Arc::clone(&self.fetcher);
            let request = Request::from_url(Method::GET, url.clone());
            async move {
                let response = fetcher.fetch(&request).await?;
                if !response.is_cacheable() {
                    return Err(NetworkError::ResourceError(format!(
                        "Precache fetch of {} answered {}",
                        request.url(),
                        response.status()
                    )));
                }
                Ok::<_, NetworkError>((request.url().clone(), response))
            }
        });

        for (url, response) in try_join_all(fetches).await? {
            if !precache.put(&url, response)? {
                return Err(NetworkError::ResourceError(format!("Precache refused to store {}", url)));
            }
        }

        let precached: HashSet<String> = urls.iter().map(|u| u.as_str().to_string()).collect();
        *self.routes.write() = Arc::new(RouteTable::standard(
            precached,
            self.config.trusted_realtime_domains.clone(),
        ));
        *self.offline_document.write() = manifest.offline_document.clone();
        self.installed.store(true, Ordering::SeqCst);

        log::info!(
            "Interceptor installed version={} precached={}",
            self.config.version,
            urls.len()
        );
        Ok(urls.len())
    }

    /// Claim existing clients, delete caches of older versions and start
    /// handling requests. Returns the deleted cache names.
    pub fn activate(&self) -> NetworkResult<Vec<String>> {
        self.expect_state(&LifecycleState::Installing, "activate")?;
        if !self.installed.load(Ordering::SeqCst) {
            return Err(NetworkError::ResourceError(
                "activate called before install completed".to_string(),
            ));
        }

        *self.state.write() = LifecycleState::Activated;
        let deleted = self.caches.delete_stale(&[
            self.config.precache_name(),
            self.config.runtime_cache_name(),
        ]);
        self.clients_claimed.store(true, Ordering::SeqCst);
        *self.state.write() = LifecycleState::Active;

        log::info!(
            "Interceptor active version={} deleted_caches={:?}",
            self.config.version,
            deleted
        );
        Ok(deleted)
    }

    /// Hand over to a newer deployment; requests then go straight to the network.
    pub fn supersede(&self, by_version: &str) {
        let mut state = self.state.write();
        log::info!(
            "Interceptor superseded version={} by={} previous_state={}",
            self.config.version,
            by_version,
            *state
        );
        *state = LifecycleState::Superseded {
            by: by_version.to_string(),
        };
    }

    pub fn state(&self) -> LifecycleState {
        self.state.read().clone()
    }

    pub fn is_active(&self) -> bool {
        *self.state.read() == LifecycleState::Active
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&*self.routes.read())
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Handle one intercepted request.
    pub async fn handle(&self, request: Request) -> NetworkResult<Response> {
        if !self.is_active() {
            return self.fetcher.fetch(&request).await;
        }

        let url = request.url().clone();
        let route = self.routes().classify(&request);
        log::trace!("Routing url={} route={} class={}", url, route.name, route.class);

        let result = match route.class {
            RouteClass::ExtensionResource => self.fetcher.fetch(&request).await,
            RouteClass::StaticAsset(kind) => self.stale_while_revalidate(request, kind).await,
            RouteClass::TrustedRealtime => self.trusted_realtime(request).await,
            RouteClass::Navigation => self.navigation(request).await,
            RouteClass::Precached => self.cache_first(request).await,
            RouteClass::Other => self.network_with_fallback(request).await,
        };

        if let Err(err) = &result {
            handle_error(&ErrorReport::from_network(&url, err));
        }
        result
    }

    /// Wait for outstanding background revalidations.
    pub async fn settle(&self) {
        let pending = std::mem::take(&mut *self.revalidations.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                log::warn!("Revalidation task failed: {}", e);
            }
        }
    }

    async fn stale_while_revalidate(&self, request: Request, kind: AssetKind) -> NetworkResult<Response> {
        let cache = self.caches.open(&self.config.runtime_cache_name());

        if let Some(cached) = cache.get(request.url()) {
            self.spawn_revalidation(request, cache);
            return Ok(cached);
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if let Err(e) = cache.put(request.url(), response.clone()) {
                    log::debug!("Not caching url={} reason={}", request.url(), e);
                }
                Ok(response)
            }
            Err(err) => {
                log::warn!(
                    "Static asset fetch failed, serving empty response url={} error={}",
                    request.url(),
                    err
                );
                Ok(Response::synthetic_ok(
                    request.url().clone(),
                    request.method().clone(),
                    Some(kind.content_type()),
                ))
            }
        }
    }

    fn spawn_revalidation(&self, request: Request, cache: Arc<ResourceCache>) {
        let fetcher = Arc::clone(&self.fetcher);
        let handle = tokio::spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(fresh) => match cache.put(request.url(), fresh) {
                    Ok(true) => log::debug!("Revalidated url={}", request.url()),
                    Ok(false) => log::debug!("Kept cached entry, refresh not cacheable url={}", request.url()),
                    Err(e) => log::warn!("Failed to store revalidated url={} error={}", request.url(), e),
                },
                Err(e) => log::debug!("Revalidation failed url={} error={}", request.url(), e),
            }
        });

        let mut pending = self.revalidations.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn trusted_realtime(&self, request: Request) -> NetworkResult<Response> {
        let request = request
            .with_mode(RequestMode::Cors)
            .with_credentials(Credentials::Omit);

        match self.fetcher.fetch(&request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                log::warn!(
                    "Relay fetch failed, synthesizing permissive response url={} error={}",
                    request.url(),
                    err
                );
                let mut response = Response::synthetic_ok(
                    request.url().clone(),
                    request.method().clone(),
                    request.expected_content_type().as_deref(),
                );
                response.set_header("Access-Control-Allow-Origin", "*");
                Ok(response)
            }
        }
    }

    async fn navigation(&self, request: Request) -> NetworkResult<Response> {
        let upstream = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!(
                    "Navigation fetch failed, serving offline document url={} error={}",
                    request.url(),
                    err
                );
                self.offline_response(&request)
            }
        };

        let policy = self
            .policy
            .get_directives()
            .await
            .map_err(NetworkError::PolicyAssembly)?;

        Ok(self.apply_policy(&upstream, &policy))
    }

    /// Copy of `response` carrying the policy and companion headers.
    pub fn apply_policy(&self, response: &Response, policy: &AssembledPolicy) -> Response {
        let mut secured = response.with_headers(response.headers().clone());
        secured.set_header(CSP_HEADER, &policy.header_value());
        for (name, value) in companion_headers(self.policy.environment()) {
            secured.set_header(name, value);
        }
        secured
    }

    fn offline_response(&self, request: &Request) -> Response {
        let offline = self.offline_document.read().clone();
        if let Some(url) = offline {
            if let Some(document) = self.caches.open(&self.config.precache_name()).get(&url) {
                return document;
            }
        }
        Response::synthetic_ok(request.url().clone(), request.method().clone(), Some("text/html"))
    }

    async fn cache_first(&self, request: Request) -> NetworkResult<Response> {
        let precache = self.caches.open(&self.config.precache_name());
        match precache.get(request.url()) {
            Some(cached) => Ok(cached),
            None => self.network_with_fallback(request).await,
        }
    }

    async fn network_with_fallback(&self, request: Request) -> NetworkResult<Response> {
        if request.method() != &Method::GET {
            return self.fetcher.fetch(&request).await;
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                log::warn!(
                    "GET failed, serving empty response url={} error={}",
                    request.url(),
                    err
                );
                Ok(Response::synthetic_ok(
                    request.url().clone(),
                    Method::GET,
                    request.expected_content_type().as_deref(),
                ))
            }
        }
    }

    fn expect_state(&self, expected: &LifecycleState, operation: &str) -> NetworkResult<()> {
        let state = self.state.read();
        if *state != *expected {
            return Err(NetworkError::ResourceError(format!(
                "{} called in state {}",
                operation, *state
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for NetworkInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInterceptor")
            .field("version", &self.config.version)
            .field("state", &*self.state.read())
            .finish()
    }
}
