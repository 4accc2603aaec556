//! Gateway configuration
//!
//! Loaded from a JSON file, then overridden from the environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use citadel_edge_networking::{InterceptorConfig, PrecacheManifest};
use citadel_edge_security::keys::{DEFAULT_KEY_PATH, DEFAULT_MOUNT};
use citadel_edge_security::{
    is_source_expression, CollectorConfig, Environment, KeyManagerConfig, PolicyConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const ENV_ENVIRONMENT: &str = "CITADEL_EDGE_ENV";
pub const ENV_LISTEN: &str = "CITADEL_EDGE_LISTEN";
pub const ENV_UPSTREAM: &str = "CITADEL_EDGE_UPSTREAM";
pub const ENV_VAULT_ADDR: &str = "VAULT_ADDR";
pub const ENV_VAULT_TOKEN: &str = "VAULT_TOKEN";

/// Path of the violation report endpoint served by the gateway
pub const REPORT_PATH: &str = "/csp-report";

/// Longest accepted key lifetime, one year
const MAX_KEY_TTL_HOURS: i64 = 24 * 365;
/// Longest accepted retry or backoff delay, one day
const MAX_DELAY_SECS: i64 = 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub environment: Environment,
    /// Address the gateway listens on
    pub listen: SocketAddr,
    /// Origin every non-report request is proxied to
    pub upstream: Url,
    /// Public URL of the report endpoint embedded in the policy
    pub report_endpoint: Url,
    pub extra_script_sources: Vec<String>,
    pub extra_connect_sources: Vec<String>,
    pub secrets: SecretsSettings,
    pub keys: KeySettings,
    pub violations: ViolationSettings,
    pub interceptor: InterceptorSettings,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        let listen: SocketAddr = ([127, 0, 0, 1], 8787).into();
        Self {
            environment: Environment::Production,
            listen,
            upstream: Url::parse("http://127.0.0.1:5173/").expect("static url"),
            report_endpoint: Url::parse("http://127.0.0.1:8787/csp-report").expect("static url"),
            extra_script_sources: Vec::new(),
            extra_connect_sources: Vec::new(),
            secrets: SecretsSettings::default(),
            keys: KeySettings::default(),
            violations: ViolationSettings::default(),
            interceptor: InterceptorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackendKind {
    /// Process-local; keys do not survive a restart
    Memory,
    Vault,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSettings {
    pub backend: SecretsBackendKind,
    pub vault_addr: Option<Url>,
    #[serde(skip_serializing)]
    pub vault_token: Option<String>,
    pub mount: String,
    pub path: String,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            backend: SecretsBackendKind::Memory,
            vault_addr: None,
            vault_token: None,
            mount: DEFAULT_MOUNT.to_string(),
            path: DEFAULT_KEY_PATH.to_string(),
        }
    }
}

impl std::fmt::Debug for SecretsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsSettings")
            .field("backend", &self.backend)
            .field("vault_addr", &self.vault_addr)
            .field("vault_token", &self.vault_token.as_ref().map(|_| "<redacted>"))
            .field("mount", &self.mount)
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    pub ttl_hours: i64,
    pub rotation_threshold_minutes: i64,
    pub retry_interval_secs: i64,
    /// How often the background task checks whether the key needs rotating
    pub refresh_interval_secs: u64,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            rotation_threshold_minutes: 60,
            retry_interval_secs: 30,
            refresh_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ViolationStoreSettings {
    Memory,
    File { path: PathBuf },
    Http { endpoint: Url },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationSettings {
    pub store: ViolationStoreSettings,
    /// Directory holding the local pending queue and client id
    pub state_dir: PathBuf,
    pub max_pending: usize,
    /// Delivery attempts before a buffered report is dropped
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub sync_interval_secs: u64,
    /// Largest accepted report body
    pub max_report_bytes: usize,
}

impl Default for ViolationSettings {
    fn default() -> Self {
        Self {
            store: ViolationStoreSettings::File {
                path: PathBuf::from("citadel-edge-state/violations.jsonl"),
            },
            state_dir: PathBuf::from("citadel-edge-state"),
            max_pending: 500,
            max_attempts: 10,
            backoff_base_secs: 5,
            backoff_max_secs: 600,
            sync_interval_secs: 30,
            max_report_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorSettings {
    pub version: String,
    /// Paths or absolute URLs fetched into the precache at startup
    pub precache: Vec<String>,
    pub offline_document: Option<String>,
    pub trusted_realtime_domains: Vec<String>,
}

impl Default for InterceptorSettings {
    fn default() -> Self {
        let defaults = InterceptorConfig::default();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            precache: Vec::new(),
            offline_document: None,
            trusted_realtime_domains: defaults.trusted_realtime_domains,
        }
    }
}

impl EdgeConfig {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok(serde_json::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`; an override for the vault address or
    /// token switches the secrets backend to vault.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ENVIRONMENT) {
            self.environment = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_ENVIRONMENT,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_LISTEN) {
            self.listen = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_LISTEN,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_UPSTREAM) {
            self.upstream = Url::parse(&value).map_err(|_| ConfigError::InvalidValue {
                name: ENV_UPSTREAM,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_VAULT_ADDR) {
            let addr = Url::parse(&value).map_err(|_| ConfigError::InvalidValue {
                name: ENV_VAULT_ADDR,
                value: value.clone(),
            })?;
            self.secrets.vault_addr = Some(addr);
            self.secrets.backend = SecretsBackendKind::Vault;
        }
        if let Some(value) = lookup(ENV_VAULT_TOKEN) {
            self.secrets.vault_token = Some(value);
        }
        Ok(())
    }

    /// Check the configuration; returns warnings for settings that work
    /// but should not reach production.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        if self.secrets.backend == SecretsBackendKind::Vault && self.secrets.vault_addr.is_none() {
            return Err(ConfigError::Invalid(
                "vault backend selected without a vault address".to_string(),
            ));
        }
        if self.violations.max_pending == 0 || self.violations.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "violations.max_pending and violations.max_attempts must be positive".to_string(),
            ));
        }
        if !(1..=MAX_KEY_TTL_HOURS).contains(&self.keys.ttl_hours) {
            return Err(ConfigError::Invalid(format!(
                "keys.ttl_hours must be between 1 and {}",
                MAX_KEY_TTL_HOURS
            )));
        }
        if self.keys.rotation_threshold_minutes <= 0
            || self.keys.rotation_threshold_minutes >= self.keys.ttl_hours * 60
        {
            return Err(ConfigError::Invalid(
                "rotation threshold must be positive and shorter than the key lifetime".to_string(),
            ));
        }
        for (name, secs) in [
            ("keys.retry_interval_secs", self.keys.retry_interval_secs),
            ("violations.backoff_base_secs", self.violations.backoff_base_secs),
            ("violations.backoff_max_secs", self.violations.backoff_max_secs),
        ] {
            if !(1..=MAX_DELAY_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 1 and {}",
                    name, MAX_DELAY_SECS
                )));
            }
        }
        if self.violations.backoff_base_secs > self.violations.backoff_max_secs {
            return Err(ConfigError::Invalid(
                "violations.backoff_base_secs exceeds violations.backoff_max_secs".to_string(),
            ));
        }
        let extra_sources = self
            .extra_script_sources
            .iter()
            .chain(&self.extra_connect_sources);
        for source in extra_sources {
            if !is_source_expression(source) {
                return Err(ConfigError::InvalidValue {
                    name: "extra sources",
                    value: source.clone(),
                });
            }
        }
        if self.keys.refresh_interval_secs == 0 || self.violations.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("task intervals must be positive".to_string()));
        }

        if self.environment.is_development() {
            warnings.push("development policy allows 'unsafe-inline' and 'unsafe-eval' scripts".to_string());
        }
        if self.upstream.scheme() == "http" && !is_loopback(&self.upstream) {
            warnings.push(format!("upstream {} is not served over https", self.upstream));
        }
        match self.secrets.backend {
            SecretsBackendKind::Memory => {
                warnings.push("in-memory secrets backend; report keys do not survive a restart".to_string())
            }
            SecretsBackendKind::Vault if self.secrets.vault_token.is_none() => {
                warnings.push(format!("{} is not set; vault requests are unauthenticated", ENV_VAULT_TOKEN))
            }
            SecretsBackendKind::Vault => {}
        }
        if self.violations.store == ViolationStoreSettings::Memory {
            warnings.push("in-memory violation store; reports are lost on restart".to_string());
        }

        Ok(warnings)
    }

    /// Key manager settings. Values outside the range `validate` accepts
    /// are clamped into it.
    pub fn key_manager_config(&self) -> KeyManagerConfig {
        let ttl_hours = self.keys.ttl_hours.clamp(1, MAX_KEY_TTL_HOURS);
        KeyManagerConfig {
            mount: self.secrets.mount.clone(),
            path: self.secrets.path.clone(),
            ttl: chrono::Duration::hours(ttl_hours),
            rotation_threshold: chrono::Duration::minutes(
                self.keys.rotation_threshold_minutes.clamp(1, ttl_hours * 60),
            ),
            retry_interval: delay(self.keys.retry_interval_secs),
        }
    }

    pub fn policy_config(&self) -> PolicyConfig {
        let mut config = PolicyConfig::new(self.environment, self.report_endpoint.clone());
        config.extra_script_sources = self.extra_script_sources.clone();
        config.extra_connect_sources = self.extra_connect_sources.clone();
        config
    }

    /// Collector settings, clamped like [`EdgeConfig::key_manager_config`]
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            max_pending: self.violations.max_pending.max(1),
            backoff_base: delay(self.violations.backoff_base_secs),
            backoff_max: delay(self.violations.backoff_max_secs),
            max_attempts: self.violations.max_attempts.max(1),
        }
    }

    pub fn interceptor_config(&self) -> InterceptorConfig {
        InterceptorConfig {
            version: self.interceptor.version.clone(),
            trusted_realtime_domains: self.interceptor.trusted_realtime_domains.clone(),
        }
    }

    /// The precache manifest with every entry resolved against the upstream
    pub fn precache_manifest(&self) -> Result<PrecacheManifest, ConfigError> {
        let resolve = |entry: &String| {
            self.upstream
                .join(entry)
                .map_err(|_| ConfigError::InvalidValue {
                    name: "interceptor.precache",
                    value: entry.clone(),
                })
        };
        Ok(PrecacheManifest {
            urls: self
                .interceptor
                .precache
                .iter()
                .map(resolve)
                .collect::<Result<_, _>>()?,
            offline_document: self.interceptor.offline_document.as_ref().map(resolve).transpose()?,
        })
    }
}

fn delay(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(1, MAX_DELAY_SECS))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
