//! Secrets backend abstraction.
//!
//! The key manager only needs path-addressed read and write of small JSON
//! documents under a mount, plus the ability to create that mount. Two
//! implementations are provided: an in-memory backend used in tests and a
//! Vault KV v2 client over HTTP.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use url::Url;

use crate::error::{SecurityError, SecurityResult};

/// Storage for secret documents.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Check that the backend is reachable.
    async fn health(&self) -> SecurityResult<()>;

    /// Create the mount if it does not exist yet. Must be idempotent.
    async fn ensure_mount(&self, mount: &str) -> SecurityResult<()>;

    /// Read the document at `path` under `mount`. `None` if nothing is stored.
    async fn read(&self, mount: &str, path: &str) -> SecurityResult<Option<Value>>;

    /// Write `data` at `path` under `mount`, replacing the previous version.
    async fn write(&self, mount: &str, path: &str, data: &Value) -> SecurityResult<()>;
}

/// In-memory secrets backend for tests and local development.
///
/// Availability can be toggled to simulate an outage.
#[derive(Debug)]
pub struct InMemorySecretsBackend {
    mounts: RwLock<HashSet<String>>,
    data: RwLock<HashMap<(String, String), Value>>,
    available: AtomicBool,
    writes: AtomicUsize,
    mounts_created: AtomicUsize,
}

impl Default for InMemorySecretsBackend {
    fn default() -> Self {
        Self {
            mounts: RwLock::new(HashSet::new()),
            data: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
            mounts_created: AtomicUsize::new(0),
        }
    }
}

impl InMemorySecretsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of times a mount was actually created.
    pub fn mounts_created(&self) -> usize {
        self.mounts_created.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> SecurityResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SecurityError::Connection(
                "in-memory secrets backend is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl SecretsBackend for InMemorySecretsBackend {
    async fn health(&self) -> SecurityResult<()> {
        self.check_available()
    }

    async fn ensure_mount(&self, mount: &str) -> SecurityResult<()> {
        self.check_available()?;
        let mut mounts = self.mounts.write().await;
        if mounts.insert(mount.to_string()) {
            self.mounts_created.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read(&self, mount: &str, path: &str) -> SecurityResult<Option<Value>> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data.get(&(mount.to_string(), path.to_string())).cloned())
    }

    async fn write(&self, mount: &str, path: &str, value: &Value) -> SecurityResult<()> {
        self.check_available()?;
        if !self.mounts.read().await.contains(mount) {
            return Err(SecurityError::Storage(format!("no such mount: {}", mount)));
        }
        let mut data = self.data.write().await;
        data.insert((mount.to_string(), path.to_string()), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Vault KV version 2 client.
pub struct HttpSecretsBackend {
    client: reqwest::Client,
    address: Url,
    token: String,
}

impl HttpSecretsBackend {
    pub fn new(address: Url, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            address,
            token: token.into(),
        }
    }

    fn endpoint(&self, path: &str) -> SecurityResult<Url> {
        self.address
            .join(path)
            .map_err(|e| SecurityError::InvalidConfiguration(format!("bad vault path {}: {}", path, e)))
    }

    fn data_path(mount: &str, path: &str) -> String {
        format!("v1/{}/data/{}", mount.trim_matches('/'), path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for HttpSecretsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSecretsBackend")
            .field("address", &self.address.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl SecretsBackend for HttpSecretsBackend {
    async fn health(&self) -> SecurityResult<()> {
        // Vault answers sys/health with a non-200 code for standby or sealed
        // nodes; any HTTP answer means the server is reachable.
        let url = self.endpoint("v1/sys/health")?;
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| SecurityError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn ensure_mount(&self, mount: &str) -> SecurityResult<()> {
        let mount = mount.trim_matches('/');
        let mounts: Value = self
            .client
            .get(self.endpoint("v1/sys/mounts")?)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let key = format!("{}/", mount);
        let present = mounts.get(&key).is_some()
            || mounts.get("data").and_then(|d| d.get(&key)).is_some();
        if present {
            return Ok(());
        }

        let response = self
            .client
            .post(self.endpoint(&format!("v1/sys/mounts/{}", mount))?)
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "type": "kv", "options": { "version": "2" } }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                log::info!("Created secrets mount mount={}", mount);
                Ok(())
            }
            // Another process created it between our list and our create.
            StatusCode::BAD_REQUEST => Ok(()),
            status => Err(SecurityError::Storage(format!(
                "creating mount {} failed with status {}",
                mount, status
            ))),
        }
    }

    async fn read(&self, mount: &str, path: &str) -> SecurityResult<Option<Value>> {
        let response = self
            .client
            .get(self.endpoint(&Self::data_path(mount, path))?)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response.error_for_status()?.json().await?;
        Ok(body.get("data").and_then(|d| d.get("data")).cloned())
    }

    async fn write(&self, mount: &str, path: &str, data: &Value) -> SecurityResult<()> {
        self.client
            .post(self.endpoint(&Self::data_path(mount, path))?)
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "data": data }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_mount_is_idempotent() {
        let backend = InMemorySecretsBackend::new();
        backend.ensure_mount("edge").await.unwrap();
        backend.ensure_mount("edge").await.unwrap();
        assert_eq!(backend.mounts_created(), 1);
    }

    #[tokio::test]
    async fn test_inmemory_write_requires_mount() {
        let backend = InMemorySecretsBackend::new();
        let result = backend.write("edge", "k", &json!({"a": 1})).await;
        assert!(matches!(result, Err(SecurityError::Storage(_))));

        backend.ensure_mount("edge").await.unwrap();
        backend.write("edge", "k", &json!({"a": 1})).await.unwrap();
        assert_eq!(backend.read("edge", "k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_inmemory_outage() {
        let backend = InMemorySecretsBackend::new();
        backend.set_available(false);
        let err = backend.health().await.unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn test_vault_data_path() {
        assert_eq!(
            HttpSecretsBackend::data_path("/citadel-edge/", "/csp/report-key"),
            "v1/citadel-edge/data/csp/report-key"
        );
    }
}
