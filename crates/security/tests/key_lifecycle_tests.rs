use std::sync::Arc;

use chrono::Duration;
use citadel_edge_security::{
    CollectorConfig, Environment, InMemorySecretsBackend, InMemoryViolationStore,
    KeyManagerConfig, ManualClock, MemoryLocalStore, PolicyAssembler, PolicyConfig,
    SecretKeyManager, SecurityError, ViolationCollector, ViolationEvent, ViolationReport,
};
use futures::future::join_all;
use url::Url;

fn manager(backend: Arc<InMemorySecretsBackend>, clock: Arc<ManualClock>) -> Arc<SecretKeyManager> {
    Arc::new(SecretKeyManager::with_clock(
        backend,
        KeyManagerConfig::default(),
        clock,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_rotation() {
    let backend = Arc::new(InMemorySecretsBackend::new());
    let clock = Arc::new(ManualClock::default());
    let keys = manager(backend.clone(), clock.clone());
    keys.initialize().await.expect("initialize");
    let first = keys.current_key().await.expect("first key");

    // Move into the last hour of the key's lifetime
    clock.advance(Duration::hours(23) + Duration::minutes(1));

    let callers = (0..32).map(|_| {
        let keys = Arc::clone(&keys);
        tokio::spawn(async move { keys.current_key().await })
    });
    let results = join_all(callers).await;

    let references: Vec<String> = results
        .into_iter()
        .map(|joined| {
            joined
                .expect("task panicked")
                .expect("current_key")
                .reference()
                .to_string()
        })
        .collect();

    assert!(references.iter().all(|r| r == &references[0]));
    assert_ne!(references[0], first.reference());
    assert_eq!(keys.rotation_count(), 2);
    assert_eq!(backend.write_count(), 2);
}

#[tokio::test]
async fn test_key_expires_closed_when_backend_is_down() {
    let backend = Arc::new(InMemorySecretsBackend::new());
    let clock = Arc::new(ManualClock::default());
    let keys = manager(backend.clone(), clock.clone());
    keys.initialize().await.expect("initialize");

    backend.set_available(false);

    // Inside the rotation window the old key is still served
    clock.advance(Duration::hours(23) + Duration::minutes(30));
    let kept = keys.current_key().await.expect("unexpired key is kept");
    assert!(keys.verify_reference(kept.reference()));

    // Past expiry nothing is served
    clock.advance(Duration::hours(1));
    let err = keys.current_key().await.unwrap_err();
    assert!(matches!(err, SecurityError::KeyUnavailable(_)));
    assert!(!keys.verify_reference(kept.reference()));

    // Recovery issues a fresh key
    backend.set_available(true);
    clock.advance(Duration::minutes(1));
    let fresh = keys.current_key().await.expect("fresh key after recovery");
    assert_ne!(fresh.reference(), kept.reference());
}

#[tokio::test]
async fn test_policy_report_key_verifies() {
    let backend = Arc::new(InMemorySecretsBackend::new());
    let clock = Arc::new(ManualClock::default());
    let keys = manager(backend, clock);
    keys.initialize().await.expect("initialize");

    let endpoint = Url::parse("https://edge.example.com/csp-report").expect("url");
    let assembler = PolicyAssembler::new(
        Arc::clone(&keys),
        PolicyConfig::new(Environment::Production, endpoint),
    );

    let policy = assembler.get_directives().await.expect("policy");
    let key = policy.report_key().expect("report key present");
    assert!(keys.verify_reference(&key));

    // Rotation keeps the previous key acceptable for reports from older pages
    keys.rotate_key().await.expect("rotate");
    assert!(keys.verify_reference(&key));
    keys.rotate_key().await.expect("rotate again");
    assert!(!keys.verify_reference(&key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_all_reach_the_queue() {
    let store = Arc::new(InMemoryViolationStore::new());
    let local = Arc::new(MemoryLocalStore::new());
    let collector = Arc::new(ViolationCollector::new(
        store.clone(),
        local,
        CollectorConfig::default(),
    ));
    store.set_available(false);

    let reports = (0..40).map(|i| {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
            let event = ViolationEvent {
                blocked_uri: format!("https://blocked-{}.example/", i),
                document_uri: "https://app.example.com/".to_string(),
                violated_directive: "script-src".to_string(),
                ..ViolationEvent::default()
            };
            let report = ViolationReport::from_event(&event, "agent", None, chrono::Utc::now());
            collector.report_violation(report).await
        })
    });
    for joined in join_all(reports).await {
        assert!(joined.expect("task panicked").is_err());
    }
    assert_eq!(collector.pending_count().await.expect("pending"), 40);

    store.set_available(true);
    let outcome = collector.sync_pending_violations().await.expect("sync");
    assert_eq!(outcome.replayed.len(), 40);
    assert_eq!(outcome.still_pending, 0);
    assert_eq!(store.records().await.len(), 40);
}
