//! The depot: registry and shared machinery for a set of caches
//!
//! A [`Depot`] owns everything the caches share: the storage root, the
//! refresh worker pool, the depot-wide exclusivity lock, and the change bus
//! that drives automatic refresh. Cache definitions register here and hand
//! back [`CacheHandle`]s. Dropping the last handle to a depot shuts down its
//! workers and trigger tasks.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DepotConfig;
use crate::engine::{CacheDefinition, CacheEngine, CacheHandle};
use crate::error::{LarderError, LarderResult};
use crate::identity::{CacheIdentity, CachePolicy, RefreshMode};
use crate::reactive::ChangeBus;
use crate::scheduler::{RefreshJob, Scheduler};
use crate::trigger;

pub(crate) struct DepotInner {
    config: DepotConfig,
    root: PathBuf,
    registry: Mutex<HashMap<String, Arc<CacheEngine>>>,
    /// Read side taken by ordinary refreshes, write side by exclusive ones
    exclusivity: RwLock<()>,
    scheduler: Scheduler,
    bus: Arc<ChangeBus>,
}

impl DepotInner {
    pub(crate) fn config(&self) -> &DepotConfig {
        &self.config
    }

    pub(crate) fn exclusivity(&self) -> &RwLock<()> {
        &self.exclusivity
    }

    pub(crate) fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub(crate) fn submit(&self, job: RefreshJob) {
        self.scheduler.submit(job);
    }

    pub(crate) fn lookup(&self, identity: &CacheIdentity) -> Option<Arc<CacheEngine>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity.directory_key())
            .cloned()
    }

    fn engines(&self) -> Vec<Arc<CacheEngine>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for DepotInner {
    fn drop(&mut self) {
        // Wake parked trigger tasks so they notice the depot is gone.
        self.bus.bump();
    }
}

/// Cache registry and shared refresh machinery
#[derive(Clone)]
pub struct Depot {
    inner: Arc<DepotInner>,
}

impl Depot {
    /// Create a depot with default configuration
    pub fn new() -> LarderResult<Self> {
        Self::with_config(DepotConfig::default())
    }

    /// Create a depot with the given configuration
    pub fn with_config(config: DepotConfig) -> LarderResult<Self> {
        let root = config.effective_root();
        fs::create_dir_all(&root)
            .map_err(|e| LarderError::io(format!("creating depot root {}", root.display()), e))?;
        let scheduler = Scheduler::new(config.effective_workers())?;
        info!(
            "Opened depot at {} with {} workers",
            root.display(),
            config.effective_workers()
        );
        Ok(Self {
            inner: Arc::new(DepotInner {
                config,
                root,
                registry: Mutex::new(HashMap::new()),
                exclusivity: RwLock::new(()),
                scheduler,
                bus: Arc::new(ChangeBus::new()),
            }),
        })
    }

    /// Register one cache definition and return its handle.
    ///
    /// Loading the persisted snapshot happens here, including cleanup of any
    /// files a crashed refresh left behind. Non-manual caches also get their
    /// trigger task, which requires running inside a tokio runtime.
    pub fn define(&self, definition: CacheDefinition) -> LarderResult<CacheHandle> {
        let (identity, policy, linker, supplier) = definition.into_parts();
        let supplier = supplier.ok_or_else(|| LarderError::Definition {
            cache: identity.qualified(),
            reason: "a supplier is required".to_string(),
        })?;
        let policy = policy
            .unwrap_or_else(|| CachePolicy::new().mode(self.inner.config.default_mode));
        policy.validate(&identity)?;

        let key = identity.directory_key();
        let dir = self.inner.root.join(&key);
        let engine = {
            let mut registry = self
                .inner
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if registry.contains_key(&key) {
                return Err(LarderError::DuplicateIdentity(identity.qualified()));
            }
            debug!("Defining cache {identity}");
            let engine = Arc::new(CacheEngine::new(
                identity,
                policy,
                linker,
                supplier,
                dir,
                Arc::clone(&self.inner.bus),
            ));
            registry.insert(key, Arc::clone(&engine));
            engine
        };

        if engine.policy().refresh_mode() != RefreshMode::Manual {
            if tokio::runtime::Handle::try_current().is_ok() {
                trigger::spawn(&self.inner, Arc::clone(&engine));
            } else {
                warn!(
                    "No async runtime, cache {} will not refresh automatically",
                    engine.identity()
                );
            }
        }
        // A new definition may unblock caches that depend on it.
        self.inner.bus.bump();
        Ok(CacheHandle::new(engine, Arc::clone(&self.inner)))
    }

    /// Handle to an already-defined cache
    pub fn handle(&self, identity: &CacheIdentity) -> Option<CacheHandle> {
        self.inner
            .lookup(identity)
            .map(|engine| CacheHandle::new(engine, Arc::clone(&self.inner)))
    }

    /// Identities of all defined caches
    pub fn identities(&self) -> Vec<CacheIdentity> {
        self.inner
            .engines()
            .iter()
            .map(|e| e.identity().clone())
            .collect()
    }

    /// Whether every defined cache is stable
    pub fn stable(&self) -> bool {
        let mut pass = crate::stability::StabilityPass::new(&self.inner);
        self.inner.engines().iter().all(|engine| pass.stable(engine))
    }

    /// Delete cached data not touched within the retention window.
    ///
    /// Covers both defined caches, judged by their last access and refresh
    /// times, and leftover directories of caches no longer defined. Caches
    /// with a refresh in flight are skipped. Returns the number of caches
    /// removed.
    pub fn purge(&self, retention: Duration) -> LarderResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| LarderError::Internal("retention period out of range".to_string()))?;
        let now = Utc::now();
        let mut removed = 0;

        let engines = self.inner.engines();
        let mut eligible = Vec::new();
        for engine in &engines {
            if engine.current_progress().is_some() {
                continue;
            }
            let Some(snapshot) = engine.current_snapshot() else {
                continue;
            };
            let last = engine.last_accessed().max(snapshot.refreshed);
            if now.signed_duration_since(last) > retention {
                eligible.push(Arc::clone(engine));
            }
        }
        // Anything a surviving cache still depends on stays, no matter how
        // old its own access time is.
        let doomed: HashSet<String> = eligible
            .iter()
            .map(|e| e.identity().directory_key())
            .collect();
        let mut referenced = HashSet::new();
        for engine in &engines {
            if doomed.contains(&engine.identity().directory_key()) {
                continue;
            }
            if let Some(ledger) = engine.link().ok().or_else(|| engine.last_ledger()) {
                for identity in ledger.dependencies().keys() {
                    referenced.insert(identity.directory_key());
                }
            }
        }
        for engine in eligible {
            if referenced.contains(&engine.identity().directory_key()) {
                continue;
            }
            info!("Purging unused cache {}", engine.identity());
            engine.clear()?;
            removed += 1;
        }

        let known: HashSet<String> = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let entries = fs::read_dir(&self.inner.root).map_err(|e| {
            LarderError::io(
                format!("listing depot root {}", self.inner.root.display()),
                e,
            )
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if path.is_dir() && !known.contains(name) {
                info!("Purging directory of undefined cache {name}");
                fs::remove_dir_all(&path).map_err(|e| {
                    LarderError::io(format!("removing cache directory {}", path.display()), e)
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
