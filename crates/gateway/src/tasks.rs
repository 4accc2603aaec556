//! Periodic maintenance: keep the report key fresh and replay buffered
//! violation reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::EdgeContext;

/// Spawn the background tasks. They stop when `shutdown` flips to `true`.
pub fn spawn_background_tasks(
    ctx: Arc<EdgeContext>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let key_interval = Duration::from_secs(ctx.config().keys.refresh_interval_secs);
    let sync_interval = Duration::from_secs(ctx.config().violations.sync_interval_secs);

    vec![
        tokio::spawn(refresh_keys(Arc::clone(&ctx), key_interval, shutdown.clone())),
        tokio::spawn(replay_violations(ctx, sync_interval, shutdown)),
    ]
}

async fn refresh_keys(ctx: Arc<EdgeContext>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ctx.keys().current_key().await {
                    Ok(key) => log::trace!("Report key valid until {}", key.expires_at()),
                    Err(e) => log::error!("Report key unavailable: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Key refresh task stopped");
}

async fn replay_violations(
    ctx: Arc<EdgeContext>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ctx.collector().sync_pending_violations().await {
                    Ok(outcome) if !outcome.replayed.is_empty() => log::info!(
                        "Replayed violations count={} still_pending={}",
                        outcome.replayed.len(),
                        outcome.still_pending
                    ),
                    Ok(outcome) => log::trace!(
                        "Violation sync pending={} skipped={:?}",
                        outcome.still_pending,
                        outcome.skipped
                    ),
                    Err(e) => log::warn!("Violation sync failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Let in-flight asset refreshes land before the caches go away.
    ctx.interceptor().settle().await;
    log::debug!("Violation replay task stopped");
}
