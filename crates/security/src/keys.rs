//! Rotating report key.
//!
//! The key authenticates the violation-report endpoint: every policy embeds
//! it as the `key` query parameter of its `report-uri`. One key is active at
//! a time; it lives for 24 hours and is replaced once less than an hour of
//! its lifetime remains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::clock::{Clock, SystemClock};
use crate::error::{SecurityError, SecurityResult};
use crate::secrets::SecretsBackend;

/// Length of the raw key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Default secrets mount.
pub const DEFAULT_MOUNT: &str = "citadel-edge";

/// Default path of the report key inside the mount.
pub const DEFAULT_KEY_PATH: &str = "csp/report-key";

/// Key manager settings.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    pub mount: String,
    pub path: String,
    /// Lifetime of a freshly issued key.
    pub ttl: Duration,
    /// Rotate once the remaining lifetime drops below this.
    pub rotation_threshold: Duration,
    /// After a failed rotation, keep serving the still-valid key for this
    /// long before hitting the backend again.
    pub retry_interval: Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            mount: DEFAULT_MOUNT.to_string(),
            path: DEFAULT_KEY_PATH.to_string(),
            ttl: Duration::hours(24),
            rotation_threshold: Duration::hours(1),
            retry_interval: Duration::seconds(30),
        }
    }
}

/// One issued report key.
///
/// The raw bytes stay inside this type; callers only see the base64
/// reference.
pub struct KeyMaterial {
    secret: [u8; KEY_LENGTH],
    reference: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl KeyMaterial {
    fn generate(issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        let mut secret = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut secret);
        let reference = STANDARD.encode(secret);
        Self {
            secret,
            reference,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    /// The opaque base64 form embedded in policies and report URLs.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime; negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    fn matches(&self, candidate: &str) -> bool {
        let Ok(decoded) = STANDARD.decode(candidate) else {
            return false;
        };
        if decoded.len() != KEY_LENGTH {
            return false;
        }
        decoded
            .iter()
            .zip(self.secret.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.reference.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("secret", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Document written to the secrets backend.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    key: String,
    expiry: DateTime<Utc>,
}

/// Diagnostic view of the manager, free of secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotations: u64,
}

#[derive(Default)]
struct KeySlots {
    active: Option<Arc<KeyMaterial>>,
    /// The key replaced by the last rotation. Pages served before the
    /// rotation still report with it until it expires.
    retired: Option<Arc<KeyMaterial>>,
}

/// Owns the active report key and rotates it through the secrets backend.
pub struct SecretKeyManager {
    backend: Arc<dyn SecretsBackend>,
    clock: Arc<dyn Clock>,
    config: KeyManagerConfig,
    slots: RwLock<KeySlots>,
    /// Single-flight guard: backend writes and pointer swaps happen under it.
    rotation: tokio::sync::Mutex<()>,
    last_failed_rotation: Mutex<Option<DateTime<Utc>>>,
    rotations: AtomicU64,
}

impl SecretKeyManager {
    pub fn new(backend: Arc<dyn SecretsBackend>, config: KeyManagerConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn SecretsBackend>,
        config: KeyManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            clock,
            config,
            slots: RwLock::new(KeySlots::default()),
            rotation: tokio::sync::Mutex::new(()),
            last_failed_rotation: Mutex::new(None),
            rotations: AtomicU64::new(0),
        }
    }

    /// Connect to the backend, create the mount and issue the first key.
    ///
    /// An unreachable backend is fatal here: there is no previous key to
    /// fall back on.
    pub async fn initialize(&self) -> SecurityResult<()> {
        self.backend.health().await.map_err(|e| match e {
            SecurityError::Connection(msg) => SecurityError::Connection(msg),
            other => SecurityError::Connection(other.to_string()),
        })?;
        self.backend.ensure_mount(&self.config.mount).await?;
        self.rotate_key().await?;
        log::info!(
            "Key manager initialized mount={} path={}",
            self.config.mount,
            self.config.path
        );
        Ok(())
    }

    /// Return the active key, rotating first if there is none or it is close
    /// to expiry.
    ///
    /// Concurrent callers that hit the rotation window wait on the same
    /// rotation and all observe its result. If rotation fails, a key that has
    /// not yet expired is still returned; an expired key never is.
    pub async fn current_key(&self) -> SecurityResult<Arc<KeyMaterial>> {
        if let Some(key) = self.usable_key(self.clock.now()) {
            return Ok(key);
        }

        let _guard = self.rotation.lock().await;

        // Someone else may have rotated while we waited.
        let now = self.clock.now();
        if let Some(key) = self.usable_key(now) {
            return Ok(key);
        }

        match self.rotate_locked().await {
            Ok(key) => Ok(key),
            Err(err) => {
                *self.last_failed_rotation.lock() = Some(now);
                let active = self.slots.read().active.clone();
                match active {
                    Some(key) if !key.is_expired(now) => {
                        log::warn!(
                            "Key rotation failed, keeping current key expires_at={} error={}",
                            key.expires_at(),
                            err
                        );
                        Ok(key)
                    }
                    _ => {
                        log::error!("Key rotation failed with no unexpired key left error={}", err);
                        Err(SecurityError::KeyUnavailable(format!(
                            "rotation failed and no unexpired key remains: {}",
                            err
                        )))
                    }
                }
            }
        }
    }

    /// Issue a new key unconditionally.
    ///
    /// On a backend write failure the error is returned and the previous key
    /// stays active.
    pub async fn rotate_key(&self) -> SecurityResult<Arc<KeyMaterial>> {
        let _guard = self.rotation.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> SecurityResult<Arc<KeyMaterial>> {
        let material = KeyMaterial::generate(self.clock.now(), self.config.ttl);
        let stored = StoredKey {
            key: material.reference().to_string(),
            expiry: material.expires_at(),
        };
        let document = serde_json::to_value(&stored)?;

        self.backend
            .write(&self.config.mount, &self.config.path, &document)
            .await?;

        let material = Arc::new(material);
        {
            let mut slots = self.slots.write();
            slots.retired = slots.active.take();
            slots.active = Some(Arc::clone(&material));
        }
        *self.last_failed_rotation.lock() = None;
        let count = self.rotations.fetch_add(1, Ordering::SeqCst) + 1;

        log::info!(
            "Rotated report key issued_at={} expires_at={} rotation={}",
            material.issued_at(),
            material.expires_at(),
            count
        );
        Ok(material)
    }

    /// The active key when it may be used without rotating.
    fn usable_key(&self, now: DateTime<Utc>) -> Option<Arc<KeyMaterial>> {
        let key = self.slots.read().active.clone()?;
        if key.is_expired(now) {
            return None;
        }
        if key.remaining(now) >= self.config.rotation_threshold {
            return Some(key);
        }
        // Inside the rotation window: back off briefly after a failure
        // instead of hammering an unavailable backend on every request.
        let last_failure = *self.last_failed_rotation.lock();
        match last_failure {
            Some(at) if now - at < self.config.retry_interval => Some(key),
            _ => None,
        }
    }

    /// Check a key presented by a report against the active key, or the key
    /// it replaced while that one has not expired.
    pub fn verify_reference(&self, candidate: &str) -> bool {
        let now = self.clock.now();
        let slots = self.slots.read();
        let valid = [slots.active.as_ref(), slots.retired.as_ref()]
            .into_iter()
            .flatten()
            .any(|key| !key.is_expired(now) && key.matches(candidate));
        valid
    }

    pub fn key_state(&self) -> Option<KeyState> {
        let slots = self.slots.read();
        let state = slots.active.as_ref().map(|key| KeyState {
            issued_at: key.issued_at(),
            expires_at: key.expires_at(),
            rotations: self.rotations.load(Ordering::SeqCst),
        });
        state
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }
}

impl std::fmt::Debug for SecretKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKeyManager")
            .field("config", &self.config)
            .field("state", &self.key_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::secrets::InMemorySecretsBackend;
    use pretty_assertions::assert_eq;

    fn manager() -> (Arc<InMemorySecretsBackend>, Arc<ManualClock>, SecretKeyManager) {
        let backend = Arc::new(InMemorySecretsBackend::new());
        let clock = Arc::new(ManualClock::default());
        let manager = SecretKeyManager::with_clock(
            backend.clone(),
            KeyManagerConfig::default(),
            clock.clone(),
        );
        (backend, clock, manager)
    }

    #[tokio::test]
    async fn test_initialize_writes_key_document() {
        let (backend, _clock, manager) = manager();
        manager.initialize().await.unwrap();

        let stored = backend
            .read(DEFAULT_MOUNT, DEFAULT_KEY_PATH)
            .await
            .unwrap()
            .expect("key document written");
        let key = manager.current_key().await.unwrap();
        assert_eq!(stored["key"], key.reference());
        let expiry: DateTime<Utc> = serde_json::from_value(stored["expiry"].clone()).unwrap();
        assert_eq!(expiry, key.expires_at());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_backend_unreachable() {
        let (backend, _clock, manager) = manager();
        backend.set_available(false);
        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, SecurityError::Connection(_)));
    }

    #[tokio::test]
    async fn test_expiry_is_issue_plus_ttl() {
        let (_backend, _clock, manager) = manager();
        manager.initialize().await.unwrap();
        let key = manager.current_key().await.unwrap();
        assert_eq!(key.expires_at() - key.issued_at(), Duration::hours(24));
        assert_eq!(STANDARD.decode(key.reference()).unwrap().len(), KEY_LENGTH);
    }

    #[tokio::test]
    async fn test_key_kept_at_one_hour_remaining_then_rotated_past_expiry() {
        let (_backend, clock, manager) = manager();
        manager.initialize().await.unwrap();
        let s1 = manager.current_key().await.unwrap();

        clock.advance(Duration::hours(23));
        let at_23h = manager.current_key().await.unwrap();
        assert_eq!(at_23h.reference(), s1.reference());
        assert_eq!(manager.rotation_count(), 1);

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        let s2 = manager.current_key().await.unwrap();
        assert_ne!(s2.reference(), s1.reference());
        assert_eq!(manager.rotation_count(), 2);
        assert_eq!(s2.expires_at(), clock.now() + Duration::hours(24));
    }

    #[tokio::test]
    async fn test_rotation_window_triggers_single_rotation() {
        let (_backend, clock, manager) = manager();
        manager.initialize().await.unwrap();
        let first = manager.current_key().await.unwrap();

        clock.advance(Duration::minutes(23 * 60 + 1));
        let second = manager.current_key().await.unwrap();
        let third = manager.current_key().await.unwrap();

        assert_ne!(first.reference(), second.reference());
        assert_eq!(second.reference(), third.reference());
        assert_eq!(manager.rotation_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_unexpired_key() {
        let (backend, clock, manager) = manager();
        manager.initialize().await.unwrap();
        let first = manager.current_key().await.unwrap();

        backend.set_available(false);
        clock.advance(Duration::minutes(23 * 60 + 30));
        let still = manager.current_key().await.unwrap();
        assert_eq!(first.reference(), still.reference());

        let err = manager.rotate_key().await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(manager.current_key().await.unwrap().reference(), first.reference());
    }

    #[tokio::test]
    async fn test_fails_closed_when_expired_and_rotation_fails() {
        let (backend, clock, manager) = manager();
        manager.initialize().await.unwrap();

        backend.set_available(false);
        clock.advance(Duration::hours(25));
        let err = manager.current_key().await.unwrap_err();
        assert!(matches!(err, SecurityError::KeyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_verify_reference_accepts_active_and_retired() {
        let (_backend, _clock, manager) = manager();
        manager.initialize().await.unwrap();
        let old = manager.current_key().await.unwrap().reference().to_string();
        let new = manager.rotate_key().await.unwrap().reference().to_string();

        assert!(manager.verify_reference(&new));
        assert!(manager.verify_reference(&old));
        assert!(!manager.verify_reference("bm90LWEta2V5"));
        assert!(!manager.verify_reference("%%%"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = KeyMaterial::generate(Utc::now(), Duration::hours(24));
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(key.reference()));
    }
}
