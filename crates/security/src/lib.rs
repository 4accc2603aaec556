//! Citadel Edge Security Crate
//!
//! Rotating report keys backed by a secrets store, per-response nonces,
//! Content-Security-Policy assembly and durable violation collection.

pub mod clock;
pub mod error;
pub mod keys;
pub mod local_store;
pub mod nonce;
pub mod policy;
pub mod secrets;
pub mod violations;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SecurityError, SecurityResult};
pub use keys::{KeyManagerConfig, KeyMaterial, KeyState, SecretKeyManager};
pub use local_store::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use nonce::{validate_nonce, Nonce, NonceGenerator};
pub use policy::{
    companion_headers, is_source_expression, AssembledPolicy, CspDirective, Environment,
    PolicyAssembler, PolicyConfig, CSP_HEADER,
};
pub use secrets::{HttpSecretsBackend, InMemorySecretsBackend, SecretsBackend};
pub use violations::{
    log_policy_violation, parse_report_body, ClientIdentity, CollectorConfig,
    FileViolationStore, HttpViolationStore, InMemoryViolationStore, PendingViolation, SyncOutcome,
    SyncSkip, ViolationCollector, ViolationEvent, ViolationLogRecord, ViolationReport,
    ViolationStore,
};
