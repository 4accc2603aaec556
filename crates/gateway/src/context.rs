//! Wiring of the security and networking components into one edge.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use citadel_edge_networking::{
    CacheConfig, CacheStorage, Fetcher, FetcherConfig, HttpFetcher, NetworkInterceptor,
};
use citadel_edge_security::{
    ClientIdentity, Clock, FileLocalStore, FileViolationStore, HttpSecretsBackend,
    HttpViolationStore, InMemorySecretsBackend, InMemoryViolationStore, LocalStore,
    PolicyAssembler, SecretKeyManager, SecretsBackend, SystemClock, ViolationCollector,
    ViolationStore,
};

use crate::config::{EdgeConfig, SecretsBackendKind, ViolationStoreSettings};

/// External collaborators of the edge.
///
/// Production code builds these from the configuration; tests substitute
/// in-memory versions.
pub struct EdgeParts {
    pub secrets: Arc<dyn SecretsBackend>,
    pub violation_store: Arc<dyn ViolationStore>,
    pub local_store: Arc<dyn LocalStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clock: Arc<dyn Clock>,
}

impl EdgeParts {
    /// Build every collaborator described by `config`
    pub async fn from_config(config: &EdgeConfig) -> Result<Self> {
        let secrets: Arc<dyn SecretsBackend> = match config.secrets.backend {
            SecretsBackendKind::Vault => {
                let Some(addr) = config.secrets.vault_addr.clone() else {
                    bail!("vault backend selected without a vault address");
                };
                let token = config.secrets.vault_token.clone().unwrap_or_default();
                log::info!("Using vault secrets backend addr={}", addr);
                Arc::new(HttpSecretsBackend::new(addr, token))
            }
            SecretsBackendKind::Memory => {
                log::warn!("Using in-memory secrets backend; report keys will not survive a restart");
                Arc::new(InMemorySecretsBackend::new())
            }
        };

        let violation_store: Arc<dyn ViolationStore> = match &config.violations.store {
            ViolationStoreSettings::Memory => Arc::new(InMemoryViolationStore::new()),
            ViolationStoreSettings::File { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                Arc::new(FileViolationStore::new(path.clone()))
            }
            ViolationStoreSettings::Http { endpoint } => {
                Arc::new(HttpViolationStore::new(endpoint.clone()))
            }
        };

        let local_store = FileLocalStore::open(&config.violations.state_dir)
            .await
            .with_context(|| format!("opening state directory {}", config.violations.state_dir.display()))?;

        let fetcher = HttpFetcher::new(FetcherConfig::default()).context("building upstream client")?;

        Ok(Self {
            secrets,
            violation_store,
            local_store: Arc::new(local_store),
            fetcher: Arc::new(fetcher),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Everything a request handler needs
pub struct EdgeContext {
    config: EdgeConfig,
    keys: Arc<SecretKeyManager>,
    policy: Arc<PolicyAssembler>,
    collector: Arc<ViolationCollector>,
    interceptor: Arc<NetworkInterceptor>,
    client_id: String,
}

impl EdgeContext {
    /// Build the edge from its configuration
    pub async fn initialize(config: EdgeConfig) -> Result<Self> {
        let parts = EdgeParts::from_config(&config).await?;
        Self::with_parts(config, parts).await
    }

    /// Build the edge from explicit collaborators.
    ///
    /// Issues the first report key, installs the precache and activates the
    /// interceptor. Any failure here aborts startup.
    pub async fn with_parts(config: EdgeConfig, parts: EdgeParts) -> Result<Self> {
        let keys = Arc::new(SecretKeyManager::with_clock(
            parts.secrets,
            config.key_manager_config(),
            Arc::clone(&parts.clock),
        ));
        keys.initialize().await.context("initializing report key")?;

        let policy = Arc::new(PolicyAssembler::new(Arc::clone(&keys), config.policy_config()));

        let client_id = ClientIdentity::load_or_create(parts.local_store.as_ref())
            .await
            .context("loading client identity")?;

        let collector = Arc::new(ViolationCollector::with_clock(
            parts.violation_store,
            parts.local_store,
            config.collector_config(),
            parts.clock,
        ));

        let interceptor = Arc::new(NetworkInterceptor::new(
            config.interceptor_config(),
            parts.fetcher,
            Arc::clone(&policy),
            Arc::new(CacheStorage::new(CacheConfig::default())),
        ));

        let manifest = config.precache_manifest()?;
        let installed = interceptor
            .install(&manifest)
            .await
            .context("installing precache")?;
        let removed = interceptor.activate().context("activating interceptor")?;
        if !interceptor.is_active() {
            bail!("interceptor did not reach the active state");
        }

        log::info!(
            "Edge initialized environment={:?} version={} precached={} stale_caches_removed={} client_id={}",
            config.environment,
            config.interceptor.version,
            installed,
            removed.len(),
            client_id
        );

        Ok(Self {
            config,
            keys,
            policy,
            collector,
            interceptor,
            client_id,
        })
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<SecretKeyManager> {
        &self.keys
    }

    pub fn policy(&self) -> &Arc<PolicyAssembler> {
        &self.policy
    }

    pub fn collector(&self) -> &Arc<ViolationCollector> {
        &self.collector
    }

    pub fn interceptor(&self) -> &Arc<NetworkInterceptor> {
        &self.interceptor
    }

    /// Identifier attached to every report this edge records
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl std::fmt::Debug for EdgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeContext")
            .field("environment", &self.config.environment)
            .field("listen", &self.config.listen)
            .field("upstream", &self.config.upstream.as_str())
            .field("interceptor", &self.interceptor.state())
            .field("client_id", &self.client_id)
            .finish()
    }
}
