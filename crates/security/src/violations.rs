//! Policy violation collection.
//!
//! Reports go straight to a durable store. When the store is unreachable the
//! report is buffered in a local pending queue and replayed later; an entry
//! only leaves the queue once it has actually been persisted.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use url::Url;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{SecurityError, SecurityResult};
use crate::local_store::LocalStore;

/// Slot holding the JSON array of buffered reports.
pub const PENDING_SLOT: &str = "pendingViolations";

/// Slot a corrupted queue is moved to before starting over.
pub const CORRUPT_PENDING_SLOT: &str = "pendingViolationsCorrupt";

/// Slot holding the locally generated client identifier.
pub const CLIENT_ID_SLOT: &str = "cspClientId";

/// A violation event as delivered by the browser
/// (`SecurityPolicyViolationEvent`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationEvent {
    #[serde(rename = "blockedURI", default)]
    pub blocked_uri: String,
    #[serde(rename = "documentURI", default)]
    pub document_uri: String,
    #[serde(default)]
    pub violated_directive: String,
    #[serde(default)]
    pub effective_directive: Option<String>,
    #[serde(default)]
    pub original_policy: String,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub column_number: Option<u32>,
}

/// Body of a legacy `report-uri` POST: `{"csp-report": {...}}`.
#[derive(Debug, Deserialize)]
struct LegacyEnvelope {
    #[serde(rename = "csp-report")]
    report: LegacyReport,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LegacyReport {
    #[serde(default)]
    blocked_uri: String,
    #[serde(default)]
    document_uri: String,
    #[serde(default)]
    violated_directive: String,
    #[serde(default)]
    effective_directive: Option<String>,
    #[serde(default)]
    original_policy: String,
    #[serde(default)]
    source_file: Option<String>,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    column_number: Option<u32>,
}

impl From<LegacyReport> for ViolationEvent {
    fn from(r: LegacyReport) -> Self {
        Self {
            blocked_uri: r.blocked_uri,
            document_uri: r.document_uri,
            violated_directive: r.violated_directive,
            effective_directive: r.effective_directive,
            original_policy: r.original_policy,
            source_file: r.source_file,
            line_number: r.line_number,
            column_number: r.column_number,
        }
    }
}

/// Parse a report body, accepting the legacy `csp-report` envelope or a
/// bare event object.
pub fn parse_report_body(body: &[u8]) -> SecurityResult<ViolationEvent> {
    let event: ViolationEvent = match serde_json::from_slice::<LegacyEnvelope>(body) {
        Ok(envelope) => envelope.report.into(),
        Err(_) => serde_json::from_slice(body)?,
    };
    let names_directive = !event.violated_directive.is_empty()
        || event.effective_directive.as_deref().map_or(false, |d| !d.is_empty());
    if !names_directive {
        return Err(SecurityError::Validation(
            "violation report names no directive".to_string(),
        ));
    }
    Ok(event)
}

/// A violation as recorded by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationReport {
    #[serde(rename = "blockedURI")]
    pub blocked_uri: String,
    #[serde(rename = "documentURI")]
    pub document_uri: String,
    pub violated_directive: String,
    pub original_policy: String,
    /// Client-side time of the violation.
    pub timestamp: DateTime<Utc>,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ViolationReport {
    pub fn from_event(
        event: &ViolationEvent,
        user_agent: &str,
        client_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let violated_directive = if event.violated_directive.is_empty() {
            event.effective_directive.clone().unwrap_or_default()
        } else {
            event.violated_directive.clone()
        };
        Self {
            blocked_uri: event.blocked_uri.clone(),
            document_uri: event.document_uri.clone(),
            violated_directive,
            original_policy: event.original_policy.clone(),
            timestamp,
            user_agent: user_agent.to_string(),
            client_id,
        }
    }
}

/// A report plus the time the store received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredViolation {
    #[serde(flatten)]
    pub report: ViolationReport,
    pub received_at: DateTime<Utc>,
}

/// Append-only durable store for violations.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Persist one violation and return its generated identifier.
    async fn persist(&self, violation: &StoredViolation) -> SecurityResult<String>;
}

/// In-memory store with outage simulation, for tests.
#[derive(Debug)]
pub struct InMemoryViolationStore {
    records: tokio::sync::RwLock<Vec<(String, StoredViolation)>>,
    available: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    refused: Mutex<HashSet<String>>,
}

impl Default for InMemoryViolationStore {
    fn default() -> Self {
        Self {
            records: tokio::sync::RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
            rejected: Mutex::new(HashSet::new()),
            refused: Mutex::new(HashSet::new()),
        }
    }
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail every persist whose blocked URI equals `uri`.
    pub fn reject_blocked_uri(&self, uri: &str) {
        self.rejected.lock().insert(uri.to_string());
    }

    /// Permanently refuse every persist whose blocked URI equals `uri`.
    pub fn refuse_blocked_uri(&self, uri: &str) {
        self.refused.lock().insert(uri.to_string());
    }

    pub fn accept_all(&self) {
        self.rejected.lock().clear();
        self.refused.lock().clear();
    }

    pub async fn records(&self) -> Vec<(String, StoredViolation)> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ViolationStore for InMemoryViolationStore {
    async fn persist(&self, violation: &StoredViolation) -> SecurityResult<String> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SecurityError::Connection("violation store is offline".to_string()));
        }
        if self.rejected.lock().contains(&violation.report.blocked_uri) {
            return Err(SecurityError::Connection(format!(
                "violation store refused {}",
                violation.report.blocked_uri
            )));
        }
        if self.refused.lock().contains(&violation.report.blocked_uri) {
            return Err(SecurityError::Storage(format!(
                "violation store rejected {}",
                violation.report.blocked_uri
            )));
        }
        let id = Uuid::new_v4().to_string();
        self.records.write().await.push((id.clone(), violation.clone()));
        Ok(id)
    }
}

/// Append-only JSON lines file.
#[derive(Debug)]
pub struct FileViolationStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileViolationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[derive(Serialize)]
struct FileRecord<'a> {
    id: &'a str,
    #[serde(flatten)]
    violation: &'a StoredViolation,
}

#[async_trait]
impl ViolationStore for FileViolationStore {
    async fn persist(&self, violation: &StoredViolation) -> SecurityResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut line = serde_json::to_vec(&FileRecord { id: &id, violation })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SecurityError::Connection(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(id)
    }
}

/// Posts violations to a collection endpoint.
#[derive(Debug)]
pub struct HttpViolationStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpViolationStore {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[derive(Deserialize)]
struct CreatedRecord {
    id: Option<String>,
}

#[async_trait]
impl ViolationStore for HttpViolationStore {
    async fn persist(&self, violation: &StoredViolation) -> SecurityResult<String> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(violation)
            .send()
            .await
            .map_err(|e| SecurityError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SecurityError::Connection(format!(
                "violation store answered {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(SecurityError::Storage(format!(
                "violation store rejected report with {}",
                status
            )));
        }

        let created: Option<CreatedRecord> = response.json().await.ok();
        Ok(created
            .and_then(|c| c.id)
            .unwrap_or_else(|| Uuid::new_v4().to_string()))
    }
}

/// A buffered report waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingViolation {
    pub id: Uuid,
    pub report: ViolationReport,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Upper bound on buffered reports; the oldest are evicted beyond it.
    pub max_pending: usize,
    /// Delay before the first retry after a failed replay pass.
    pub backoff_base: Duration,
    /// Cap on the replay delay.
    pub backoff_max: Duration,
    /// Delivery attempts after which a buffered report is dropped.
    pub max_attempts: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_pending: 500,
            backoff_base: Duration::seconds(5),
            backoff_max: Duration::minutes(10),
            max_attempts: 10,
        }
    }
}

/// Why a replay pass did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSkip {
    /// Still inside the backoff window after a failed pass.
    Backoff { until: DateTime<Utc> },
    /// Another pass is in progress.
    AlreadyRunning,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Store identifiers of the replayed reports, in replay order.
    pub replayed: Vec<String>,
    /// Number of entries left in the queue afterwards.
    pub still_pending: usize,
    /// Entries given up on: rejected by the store or out of attempts.
    pub dropped: usize,
    pub skipped: Option<SyncSkip>,
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    next_attempt: Option<DateTime<Utc>>,
}

/// Records browser-reported violations with local buffering and replay.
pub struct ViolationCollector {
    store: Arc<dyn ViolationStore>,
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    config: CollectorConfig,
    /// Serializes every read-modify-write of the pending slot.
    queue_lock: tokio::sync::Mutex<()>,
    /// Prevents overlapping replay passes.
    sync_lock: tokio::sync::Mutex<()>,
    backoff: Mutex<Backoff>,
}

impl ViolationCollector {
    pub fn new(
        store: Arc<dyn ViolationStore>,
        local: Arc<dyn LocalStore>,
        config: CollectorConfig,
    ) -> Self {
        Self::with_clock(store, local, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ViolationStore>,
        local: Arc<dyn LocalStore>,
        config: CollectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            local,
            clock,
            config,
            queue_lock: tokio::sync::Mutex::new(()),
            sync_lock: tokio::sync::Mutex::new(()),
            backoff: Mutex::new(Backoff::default()),
        }
    }

    /// Persist a violation and return its identifier.
    ///
    /// On failure the report is buffered for replay and the error is still
    /// returned to the caller.
    pub async fn report_violation(&self, report: ViolationReport) -> SecurityResult<String> {
        match self.persist(&report).await {
            Ok(id) => {
                log::debug!(
                    "Recorded violation id={} directive={} blocked={}",
                    id,
                    report.violated_directive,
                    report.blocked_uri
                );
                Ok(id)
            }
            Err(err) => {
                log::warn!(
                    "Violation store failed, buffering report directive={} blocked={} error={}",
                    report.violated_directive,
                    report.blocked_uri,
                    err
                );
                if let Err(queue_err) = self.enqueue(report, &err).await {
                    log::error!("Failed to buffer violation report error={}", queue_err);
                }
                Err(err)
            }
        }
    }

    /// Replay buffered reports in order.
    ///
    /// Each successfully replayed entry is removed individually. Entries that
    /// failed on an unreachable store stay queued until `max_attempts`; entries
    /// the store rejected are dropped. Reports buffered while the pass runs
    /// are kept. Only an unreachable store delays the next pass.
    pub async fn sync_pending_violations(&self) -> SecurityResult<SyncOutcome> {
        let Ok(_sync) = self.sync_lock.try_lock() else {
            return Ok(SyncOutcome {
                skipped: Some(SyncSkip::AlreadyRunning),
                ..SyncOutcome::default()
            });
        };

        let now = self.clock.now();
        let next_attempt = self.backoff.lock().next_attempt;
        if let Some(until) = next_attempt {
            if now < until {
                return Ok(SyncOutcome {
                    still_pending: self.pending_count().await?,
                    skipped: Some(SyncSkip::Backoff { until }),
                    ..SyncOutcome::default()
                });
            }
        }

        let snapshot = {
            let _queue = self.queue_lock.lock().await;
            self.load_queue().await?
        };
        if snapshot.is_empty() {
            *self.backoff.lock() = Backoff::default();
            return Ok(SyncOutcome::default());
        }

        let mut delivered: HashSet<Uuid> = HashSet::new();
        let mut failed: HashMap<Uuid, SecurityError> = HashMap::new();
        let mut replayed = Vec::new();
        for entry in &snapshot {
            match self.persist(&entry.report).await {
                Ok(id) => {
                    delivered.insert(entry.id);
                    replayed.push(id);
                }
                Err(err) => {
                    failed.insert(entry.id, err);
                }
            }
        }
        let unreachable = failed.values().any(SecurityError::is_connection);

        let (still_pending, dropped) = {
            let _queue = self.queue_lock.lock().await;
            let mut queue = self.load_queue().await?;
            queue.retain(|entry| !delivered.contains(&entry.id));
            for entry in queue.iter_mut() {
                if let Some(err) = failed.get(&entry.id) {
                    entry.attempts = entry.attempts.saturating_add(1);
                    entry.last_error = Some(err.to_string());
                }
            }
            let before = queue.len();
            queue.retain(|entry| {
                let Some(err) = failed.get(&entry.id) else {
                    return true;
                };
                let keep = err.is_connection() && entry.attempts < self.config.max_attempts;
                if !keep {
                    log::warn!(
                        "Dropping buffered violation id={} attempts={} directive={} error={}",
                        entry.id,
                        entry.attempts,
                        entry.report.violated_directive,
                        err
                    );
                }
                keep
            });
            let dropped = before - queue.len();
            self.save_queue(&queue).await?;
            (queue.len(), dropped)
        };

        {
            let mut backoff = self.backoff.lock();
            if !unreachable {
                *backoff = Backoff::default();
            } else {
                backoff.failures += 1;
                let delay = backoff_delay(&self.config, backoff.failures);
                backoff.next_attempt = Some(now + delay);
            }
        }

        log::info!(
            "Violation replay finished replayed={} failed={} dropped={} pending={}",
            replayed.len(),
            failed.len(),
            dropped,
            still_pending
        );
        Ok(SyncOutcome {
            replayed,
            still_pending,
            dropped,
            skipped: None,
        })
    }

    /// Current contents of the pending queue.
    pub async fn pending(&self) -> SecurityResult<Vec<PendingViolation>> {
        let _queue = self.queue_lock.lock().await;
        self.load_queue().await
    }

    pub async fn pending_count(&self) -> SecurityResult<usize> {
        Ok(self.pending().await?.len())
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    async fn persist(&self, report: &ViolationReport) -> SecurityResult<String> {
        let stored = StoredViolation {
            report: report.clone(),
            received_at: self.clock.now(),
        };
        self.store.persist(&stored).await
    }

    async fn enqueue(&self, report: ViolationReport, cause: &SecurityError) -> SecurityResult<()> {
        let _queue = self.queue_lock.lock().await;
        let mut queue = self.load_queue().await?;
        queue.push(PendingViolation {
            id: Uuid::new_v4(),
            report,
            queued_at: self.clock.now(),
            attempts: 1,
            last_error: Some(cause.to_string()),
        });

        if queue.len() > self.config.max_pending {
            let overflow = queue.len() - self.config.max_pending;
            let dropped: Vec<_> = queue.drain(..overflow).collect();
            log::error!(
                "Pending violation queue full, evicted oldest count={} max={} first_blocked={}",
                dropped.len(),
                self.config.max_pending,
                dropped
                    .first()
                    .map(|d| d.report.blocked_uri.as_str())
                    .unwrap_or("")
            );
        }

        self.save_queue(&queue).await
    }

    /// Must be called with `queue_lock` held.
    async fn load_queue(&self) -> SecurityResult<Vec<PendingViolation>> {
        let Some(raw) = self.local.get(PENDING_SLOT).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                log::error!(
                    "Pending violation queue is corrupt, moving it aside slot={} error={}",
                    CORRUPT_PENDING_SLOT,
                    e
                );
                self.local.set(CORRUPT_PENDING_SLOT, &raw).await?;
                self.local.remove(PENDING_SLOT).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Must be called with `queue_lock` held.
    async fn save_queue(&self, queue: &[PendingViolation]) -> SecurityResult<()> {
        if queue.is_empty() {
            return self.local.remove(PENDING_SLOT).await;
        }
        let raw = serde_json::to_string(queue)?;
        self.local.set(PENDING_SLOT, &raw).await
    }
}

impl std::fmt::Debug for ViolationCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationCollector")
            .field("config", &self.config)
            .finish()
    }
}

fn backoff_delay(config: &CollectorConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = config.backoff_base * 2i32.pow(exponent);
    if delay > config.backoff_max {
        config.backoff_max
    } else {
        delay
    }
}

/// Locally persisted identifier attached to every report from this client.
pub struct ClientIdentity;

impl ClientIdentity {
    pub async fn load_or_create(local: &dyn LocalStore) -> SecurityResult<String> {
        if let Some(id) = local.get(CLIENT_ID_SLOT).await? {
            let id = id.trim().to_string();
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4().to_string();
        local.set(CLIENT_ID_SLOT, &id).await?;
        Ok(id)
    }
}

/// Structured fields logged for a violation on the observability path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationLogRecord {
    pub directive: String,
    pub source: String,
    pub line: Option<u32>,
    pub blocked_uri: String,
}

/// Log a violation for observability and return the logged fields.
///
/// Best effort only; durable recording goes through [`ViolationCollector`].
pub fn log_policy_violation(event: &ViolationEvent) -> ViolationLogRecord {
    let directive = event
        .effective_directive
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| event.violated_directive.clone());
    let record = ViolationLogRecord {
        directive,
        source: event
            .source_file
            .clone()
            .unwrap_or_else(|| event.document_uri.clone()),
        line: event.line_number,
        blocked_uri: event.blocked_uri.clone(),
    };
    log::warn!(
        target: "citadel_edge::csp",
        "Policy violation directive={} source={} line={} blocked={}",
        record.directive,
        record.source,
        record
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record.blocked_uri
    );
    record
}
