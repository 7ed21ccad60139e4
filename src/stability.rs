//! Staleness and stability evaluation
//!
//! Three predicates live here. [`dirty`] asks whether a single cache wants a
//! refresh right now; the trigger loop polls it. [`upstream_busy`] asks
//! whether any direct dependency is refreshing or about to, so the trigger
//! can hold off instead of refreshing against inputs that are mid-change.
//! [`stable`] answers the recursive question callers care about: is this
//! cache fully computed, fresh, and quiescent, together with its whole
//! dependency subtree? Evaluation memoizes per pass and treats dependency
//! cycles as unstable, since a cycle can never settle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::engine::CacheEngine;
use crate::hub::DepotInner;
use crate::identity::{CachePolicy, RefreshMode};
use crate::store::Snapshot;

/// Whether the cache wants a refresh right now.
///
/// Failed and cancelled caches do not retry on their own; they go dirty again
/// only when their input fingerprint moves. A cache that cannot even link yet
/// because an upstream is silently unready is not dirty either, it becomes
/// dirty once the upstream publishes.
pub(crate) fn dirty(engine: &CacheEngine) -> bool {
    let snapshot = engine.current_snapshot();
    match engine.policy().refresh_mode() {
        RefreshMode::Manual => false,
        RefreshMode::InitialOnly => snapshot.is_none() && linkable(engine),
        RefreshMode::Automatic => {
            let Some(snapshot) = snapshot else {
                return linkable(engine);
            };
            let moved = match engine.link() {
                Ok(ledger) => ledger.fingerprint() != snapshot.input,
                Err(_) => false,
            };
            if snapshot.cancelled || snapshot.exception.is_some() {
                return moved;
            }
            if moved {
                return true;
            }
            expired(engine.policy(), &snapshot)
        }
    }
}

/// A cache is worth scheduling only if linking can produce a ledger or a
/// reportable error. Silent link failures resolve upstream, not here.
fn linkable(engine: &CacheEngine) -> bool {
    match engine.link() {
        Ok(_) => true,
        Err(err) => !err.is_silent(),
    }
}

fn expired(policy: &CachePolicy, snapshot: &Snapshot) -> bool {
    let Some(period) = policy.expiry_period() else {
        return false;
    };
    match Utc::now().signed_duration_since(snapshot.refreshed).to_std() {
        Ok(age) => age >= period,
        // Clock went backwards past the refresh time; treat as fresh.
        Err(_) => false,
    }
}

/// Whether any direct dependency is refreshing or wants to.
///
/// Refreshing now would read inputs that are about to change, so the trigger
/// waits; the dependency's own publication bumps the bus and brings it back.
pub(crate) fn upstream_busy(depot: &Arc<DepotInner>, engine: &CacheEngine) -> bool {
    let ledger = engine.link().ok().or_else(|| engine.last_ledger());
    let Some(ledger) = ledger else {
        return false;
    };
    for identity in ledger.dependencies().keys() {
        if let Some(dependency) = depot.lookup(identity) {
            if dependency.current_progress().is_some() || dirty(&dependency) {
                return true;
            }
        }
    }
    false
}

/// Recursive stability of one cache, evaluated in a fresh pass
pub(crate) fn stable(depot: &Arc<DepotInner>, engine: &Arc<CacheEngine>) -> bool {
    StabilityPass::new(depot).stable(engine)
}

/// One memoized evaluation pass over the dependency graph
pub(crate) struct StabilityPass<'a> {
    depot: &'a Arc<DepotInner>,
    // None marks in-progress evaluation, which a revisit reads as a cycle.
    memo: HashMap<String, Option<bool>>,
}

impl<'a> StabilityPass<'a> {
    pub(crate) fn new(depot: &'a Arc<DepotInner>) -> Self {
        Self {
            depot,
            memo: HashMap::new(),
        }
    }

    pub(crate) fn stable(&mut self, engine: &Arc<CacheEngine>) -> bool {
        let key = engine.identity().directory_key();
        match self.memo.get(&key) {
            Some(Some(settled)) => return *settled,
            Some(None) => return false,
            None => {}
        }
        self.memo.insert(key.clone(), None);
        let settled = self.evaluate(engine);
        self.memo.insert(key, Some(settled));
        settled
    }

    /// A cache is stable when it holds a successful, unexpired snapshot
    /// whose input fingerprint still matches a fresh link, no refresh is in
    /// flight, and every declared dependency is itself stable.
    fn evaluate(&mut self, engine: &Arc<CacheEngine>) -> bool {
        if engine.current_progress().is_some() {
            return false;
        }
        let Some(snapshot) = engine.current_snapshot() else {
            return false;
        };
        if snapshot.cancelled || snapshot.exception.is_some() {
            return false;
        }
        if expired(engine.policy(), &snapshot) {
            return false;
        }
        let Ok(ledger) = engine.link() else {
            return false;
        };
        if ledger.fingerprint() != snapshot.input {
            return false;
        }
        for identity in ledger.dependencies().keys() {
            if let Some(dependency) = self.depot.lookup(identity) {
                if !self.stable(&dependency) {
                    return false;
                }
            }
        }
        true
    }
}
