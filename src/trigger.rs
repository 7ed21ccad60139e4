//! Automatic refresh triggering
//!
//! Every cache with a non-manual policy gets one tokio task that watches the
//! depot-wide change bus. Whenever anything in the depot moves, the task
//! re-evaluates its cache's dirtiness after a short debounce, so bursts of
//! upstream publications coalesce into one downstream refresh. Caches with
//! an expiry period additionally wake at their own deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::debug;

use crate::engine::CacheEngine;
use crate::hub::DepotInner;
use crate::stability;

/// Spawn the trigger task for one cache. Requires a tokio runtime.
pub(crate) fn spawn(depot: &Arc<DepotInner>, engine: Arc<CacheEngine>) {
    let weak = Arc::downgrade(depot);
    let mut receiver = depot.bus().subscribe();
    let debounce = depot.config().trigger_debounce();
    tokio::spawn(async move {
        loop {
            {
                // Holding only a weak reference lets the depot shut down
                // while trigger tasks are parked on the bus.
                let Some(depot) = weak.upgrade() else {
                    debug!("Trigger of {} exiting, depot gone", engine.identity());
                    return;
                };
                if stability::dirty(&engine) && !stability::upstream_busy(&depot, &engine) {
                    engine.schedule(&depot);
                }
            }
            let wakeup = match next_deadline(&engine) {
                Some(deadline) => match timeout(deadline, receiver.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => continue,
                },
                None => receiver.changed().await,
            };
            if wakeup.is_err() {
                return;
            }
            tokio::time::sleep(debounce).await;
            receiver.mark_unchanged();
        }
    });
}

/// Time until this cache's expiry period elapses, if it has one
fn next_deadline(engine: &CacheEngine) -> Option<Duration> {
    let period = engine.policy().expiry_period()?;
    let snapshot = engine.current_snapshot()?;
    if snapshot.cancelled || snapshot.exception.is_some() {
        return None;
    }
    let age = Utc::now()
        .signed_duration_since(snapshot.refreshed)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Some(period.saturating_sub(age).max(Duration::from_millis(10)))
}
