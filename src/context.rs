//! Linking and supplying contexts
//!
//! The original design of this kind of engine keeps an implicit "current
//! ledger" in thread-local storage. Here the contexts are threaded
//! explicitly: a linker receives a [`LinkContext`] that records into the
//! attempt's fresh ledger, and a supplier receives a [`SupplyContext`] that
//! reads strictly through the frozen ledger produced by that linker. A
//! supplier touching anything the linker did not declare fails, which is what
//! enforces consistency between the two passes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::CacheHandle;
use crate::error::{LarderError, LarderResult};
use crate::goal::Goal;
use crate::identity::CacheIdentity;
use crate::ledger::{FrozenLedger, InputLedger};
use crate::store::artifact::Artifact;

/// Recording context handed to a cache's linker
#[derive(Debug, Default)]
pub struct LinkContext {
    ledger: InputLedger,
    blocked: bool,
}

impl LinkContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter, computing its value at most once
    pub fn parameter<F>(&mut self, key: &str, supplier: F) -> String
    where
        F: FnOnce() -> String,
    {
        self.ledger.parameter(key, supplier)
    }

    /// Declare a parameter with an explicit value
    pub fn record_parameter(&mut self, key: &str, value: impl ToString) {
        self.ledger.record_parameter(key, value);
    }

    /// Declare a dependency and return its current artifact.
    ///
    /// Records the dependency's current snapshot hash into the ledger. When
    /// the dependency is empty this fails with [`LarderError::Empty`], or
    /// marks the context blocked and fails with [`LarderError::Blocked`] when
    /// the dependency's policy is blocking.
    pub fn get(&mut self, dependency: &CacheHandle) -> LarderResult<PathBuf> {
        let snapshot = dependency.engine().observe();
        let hash = snapshot.as_ref().and_then(|s| s.hash.clone());
        self.ledger
            .record_dependency(dependency.identity().clone(), hash);
        match snapshot {
            Some(snapshot) => snapshot.require_artifact().map(Path::to_path_buf),
            None => {
                if dependency.engine().policy().is_blocking() {
                    self.blocked = true;
                    Err(LarderError::Blocked)
                } else {
                    Err(LarderError::Empty(dependency.identity().qualified()))
                }
            }
        }
    }

    /// Declare a dependency without reading its artifact.
    ///
    /// Same ledger side effect as [`get`](Self::get) but never fails; useful
    /// when the linker only needs the edge.
    pub fn touch(&mut self, dependency: &CacheHandle) {
        let snapshot = dependency.engine().observe();
        let hash = snapshot.as_ref().and_then(|s| s.hash.clone());
        self.ledger
            .record_dependency(dependency.identity().clone(), hash);
    }

    /// Whether a blocking dependency was found empty during linking
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    pub(crate) fn has_empty_dependency(&self) -> bool {
        self.ledger.has_empty_dependency()
    }

    pub(crate) fn freeze(self) -> FrozenLedger {
        self.ledger.freeze()
    }
}

/// Read-only context handed to a cache's supplier
pub struct SupplyContext<'a> {
    identity: &'a CacheIdentity,
    ledger: &'a FrozenLedger,
    goal: &'a Arc<Goal>,
    dir: &'a Path,
    blocked: AtomicBool,
}

impl<'a> SupplyContext<'a> {
    pub(crate) fn new(
        identity: &'a CacheIdentity,
        ledger: &'a FrozenLedger,
        goal: &'a Arc<Goal>,
        dir: &'a Path,
    ) -> Self {
        Self {
            identity,
            ledger,
            goal,
            dir,
            blocked: AtomicBool::new(false),
        }
    }

    /// The frozen ledger this computation runs under
    pub fn ledger(&self) -> &FrozenLedger {
        self.ledger
    }

    /// Value of a parameter declared by the linker
    pub fn parameter(&self, key: &str) -> LarderResult<String> {
        self.ledger
            .parameter(key)
            .map(String::from)
            .ok_or_else(|| LarderError::UndeclaredParameter(key.to_string()))
    }

    /// Artifact of a dependency declared by the linker.
    ///
    /// The dependency must appear in the frozen ledger. If its snapshot has
    /// moved since linking, the read is rejected as blocked rather than
    /// letting the supplier mix inputs from two generations.
    pub fn get(&self, dependency: &CacheHandle) -> LarderResult<PathBuf> {
        let recorded = self
            .ledger
            .dependency(dependency.identity())
            .ok_or_else(|| LarderError::UndeclaredDependency(dependency.identity().qualified()))?;
        let Some(recorded_hash) = recorded else {
            return Err(LarderError::Empty(dependency.identity().qualified()));
        };
        let Some(snapshot) = dependency.engine().observe() else {
            self.blocked.store(true, Ordering::Relaxed);
            return Err(LarderError::Blocked);
        };
        if snapshot.hash.as_deref() != Some(recorded_hash.as_str()) {
            self.blocked.store(true, Ordering::Relaxed);
            return Err(LarderError::Blocked);
        }
        snapshot.require_artifact().map(Path::to_path_buf)
    }

    /// Whether any read observed a dependency that had moved or vanished
    pub(crate) fn was_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Create a scratch artifact in this cache's directory
    pub fn scratch_file(&self) -> LarderResult<Artifact> {
        Artifact::scratch(self.dir)
    }

    /// Cancellation checkpoint
    pub fn check_cancelled(&self) -> LarderResult<()> {
        self.goal.tick()
    }

    /// Run a named stage under a child goal.
    ///
    /// Opening the child fails when the refresh has been cancelled, which is
    /// how long suppliers observe cancellation between stages.
    pub fn stage<T, F>(&self, name: &str, body: F) -> LarderResult<T>
    where
        F: FnOnce() -> LarderResult<T>,
    {
        let child = self.goal.child(name)?;
        let result = body();
        self.goal.remove_child(&child);
        result
    }

    /// Qualified name of the cache being computed
    pub fn cache_name(&self) -> String {
        self.identity.qualified()
    }
}
