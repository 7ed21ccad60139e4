//! Per-cache engine: definition, linking, and the refresh pipeline
//!
//! One [`CacheEngine`] exists per defined identity and lives for the life of
//! its depot. A refresh runs: re-link into a fresh ledger, acquire the
//! depot-wide exclusivity lock, run the supplier under the frozen ledger,
//! hash and commit the artifact, persist a brand-new snapshot. Any failure or
//! cancellation also persists a snapshot, which keeps the prior artifact and
//! records the failure. A refresh-cancel-refresh race is resolved by
//! comparing the attempt's goal against the currently published progress goal
//! immediately before every snapshot write.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::{LinkContext, SupplyContext};
use crate::error::{LarderError, LarderResult};
use crate::goal::Goal;
use crate::hub::DepotInner;
use crate::identity::{CacheIdentity, CachePolicy};
use crate::ledger::FrozenLedger;
use crate::reactive::{Cell, ChangeBus};
use crate::scheduler::RefreshJob;
use crate::store::{artifact, snapshot, Artifact, Snapshot};

/// Linker closure: declares dependencies and parameters into the ledger
pub type LinkerFn = dyn Fn(&mut LinkContext) -> LarderResult<()> + Send + Sync;

/// Supplier closure: computes the artifact under a frozen ledger
pub type SupplierFn = dyn Fn(&SupplyContext) -> LarderResult<Artifact> + Send + Sync;

/// Builder for one cache definition, registered via [`Depot::define`]
///
/// [`Depot::define`]: crate::hub::Depot::define
pub struct CacheDefinition {
    identity: CacheIdentity,
    policy: Option<CachePolicy>,
    linker: Arc<LinkerFn>,
    supplier: Option<Arc<SupplierFn>>,
}

impl CacheDefinition {
    /// Start a definition for the given identity
    pub fn new(identity: CacheIdentity) -> Self {
        Self {
            identity,
            policy: None,
            linker: Arc::new(|_| Ok(())),
            supplier: None,
        }
    }

    /// Set the refresh policy (defaults to the depot's configured mode)
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the linker that declares this cache's inputs
    pub fn link<F>(mut self, linker: F) -> Self
    where
        F: Fn(&mut LinkContext) -> LarderResult<()> + Send + Sync + 'static,
    {
        self.linker = Arc::new(linker);
        self
    }

    /// Set the supplier that computes this cache's artifact
    pub fn supply<F>(mut self, supplier: F) -> Self
    where
        F: Fn(&SupplyContext) -> LarderResult<Artifact> + Send + Sync + 'static,
    {
        self.supplier = Some(Arc::new(supplier));
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        CacheIdentity,
        Option<CachePolicy>,
        Arc<LinkerFn>,
        Option<Arc<SupplierFn>>,
    ) {
        (self.identity, self.policy, self.linker, self.supplier)
    }
}

/// Cloneable public handle to one defined cache
#[derive(Clone)]
pub struct CacheHandle {
    engine: Arc<CacheEngine>,
    depot: Arc<DepotInner>,
}

impl CacheHandle {
    pub(crate) fn new(engine: Arc<CacheEngine>, depot: Arc<DepotInner>) -> Self {
        Self { engine, depot }
    }

    pub(crate) fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// Identity of this cache
    pub fn identity(&self) -> &CacheIdentity {
        self.engine.identity()
    }

    /// Refresh policy of this cache
    pub fn policy(&self) -> &CachePolicy {
        self.engine.policy()
    }

    /// Current snapshot, if any refresh attempt ever completed
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.engine.snapshot.get()
    }

    /// Current artifact path.
    ///
    /// Fails with [`LarderError::Empty`] while the cache has never produced
    /// anything, or with the reconstructed prior failure when the last
    /// attempt failed without leaving an artifact. Callers of blocking
    /// caches usually prefer [`wait`](Self::wait).
    pub fn get(&self) -> LarderResult<PathBuf> {
        match self.engine.observe() {
            Some(snapshot) => snapshot.require_artifact().map(Path::to_path_buf),
            None => Err(LarderError::Empty(self.identity().qualified())),
        }
    }

    /// Progress goal of the in-flight refresh, if one is scheduled or running
    pub fn progress(&self) -> Option<Arc<Goal>> {
        self.engine.progress.get()
    }

    /// Run the linker and return the frozen ledger it produced
    pub fn link(&self) -> LarderResult<Arc<FrozenLedger>> {
        self.engine.link()
    }

    /// Schedule a refresh. No-op while a live attempt exists.
    pub fn refresh(&self) {
        self.engine.schedule(&self.depot);
    }

    /// Cancel the in-flight refresh, if any
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Recursive freshness predicate over this cache and its dependencies
    pub fn stable(&self) -> bool {
        crate::stability::stable(&self.depot, &self.engine)
    }

    /// Await a snapshot that carries an artifact.
    ///
    /// This is the suspension half of `policy.blocking`: instead of receiving
    /// [`LarderError::Empty`], async callers can park here until some refresh
    /// succeeds.
    pub async fn wait(&self) -> LarderResult<PathBuf> {
        let mut rx = self.engine.snapshot.subscribe();
        loop {
            let artifact = rx
                .borrow_and_update()
                .as_ref()
                .and_then(|s| s.artifact.clone());
            if let Some(path) = artifact {
                return Ok(path);
            }
            rx.changed()
                .await
                .map_err(|_| LarderError::Internal("depot dropped while waiting".to_string()))?;
        }
    }

    /// Await the end of any scheduled or running refresh
    pub async fn wait_idle(&self) {
        let mut rx = self.engine.progress.subscribe();
        loop {
            if rx.borrow_and_update().is_none() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("identity", &self.identity().qualified())
            .finish_non_exhaustive()
    }
}

/// Exclusivity guard covering both lock sides
enum Exclusivity<'a> {
    #[allow(dead_code)]
    Shared(std::sync::RwLockReadGuard<'a, ()>),
    #[allow(dead_code)]
    Exclusive(std::sync::RwLockWriteGuard<'a, ()>),
}

pub(crate) struct CacheEngine {
    identity: CacheIdentity,
    policy: CachePolicy,
    linker: Arc<LinkerFn>,
    supplier: Arc<SupplierFn>,
    dir: PathBuf,
    bus: Arc<ChangeBus>,
    snapshot: Cell<Option<Arc<Snapshot>>>,
    progress: Cell<Option<Arc<Goal>>>,
    started: Cell<Option<DateTime<Utc>>>,
    accessed: Cell<DateTime<Utc>>,
    last_ledger: Cell<Option<Arc<FrozenLedger>>>,
    /// Serializes scheduling decisions and snapshot publication, so the
    /// goal-identity race guard and the write it protects are atomic.
    monitor: Mutex<()>,
}

impl CacheEngine {
    /// Create the engine and load its persisted snapshot.
    ///
    /// Loading also deletes orphaned artifact files, so a crashed refresh
    /// leaves no garbage behind.
    pub(crate) fn new(
        identity: CacheIdentity,
        policy: CachePolicy,
        linker: Arc<LinkerFn>,
        supplier: Arc<SupplierFn>,
        dir: PathBuf,
        bus: Arc<ChangeBus>,
    ) -> Self {
        let loaded = snapshot::load(&dir, &identity).map(Arc::new);
        Self {
            identity,
            policy,
            linker,
            supplier,
            dir,
            bus,
            snapshot: Cell::new(loaded),
            progress: Cell::new(None),
            started: Cell::new(None),
            accessed: Cell::new(Utc::now()),
            last_ledger: Cell::new(None),
            monitor: Mutex::new(()),
        }
    }

    pub(crate) fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    pub(crate) fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub(crate) fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.get()
    }

    pub(crate) fn current_progress(&self) -> Option<Arc<Goal>> {
        self.progress.get()
    }

    pub(crate) fn last_ledger(&self) -> Option<Arc<FrozenLedger>> {
        self.last_ledger.get()
    }

    pub(crate) fn last_accessed(&self) -> DateTime<Utc> {
        self.accessed.get()
    }

    /// Read the snapshot as a dependency access, updating recency
    pub(crate) fn observe(&self) -> Option<Arc<Snapshot>> {
        self.accessed.set(Utc::now());
        self.snapshot.get()
    }

    /// Run the linker inside a fresh recording context and freeze the result.
    ///
    /// Linker failures are logged only when they are not attributable to
    /// blocking, an empty upstream, or an upstream already failed or
    /// cancelled; those cascade through dependency graphs and would spam the
    /// log on every evaluation.
    pub(crate) fn link(&self) -> LarderResult<Arc<FrozenLedger>> {
        let mut ctx = LinkContext::new();
        let result = (self.linker)(&mut ctx);
        if let Err(err) = result {
            if !err.is_silent() && !ctx.has_empty_dependency() {
                warn!("Linker of cache {} failed: {err}", self.identity);
            } else {
                debug!("Linker of cache {} not ready: {err}", self.identity);
            }
            return Err(err);
        }
        if ctx.blocked() {
            // A blocking dependency was empty but the linker swallowed the
            // error; the ledger must not be committed as complete.
            return Err(LarderError::Blocked);
        }
        let frozen = Arc::new(ctx.freeze());
        self.last_ledger.set(Some(Arc::clone(&frozen)));
        Ok(frozen)
    }

    /// Schedule a refresh unless a live attempt already exists.
    ///
    /// A cancelled attempt that never started can be superseded immediately;
    /// its goal fails the cancellation checkpoint when a worker picks it up.
    pub(crate) fn schedule(self: &Arc<Self>, depot: &Arc<DepotInner>) {
        let _guard = self.lock_monitor();
        let permitted = match self.progress.get() {
            None => true,
            Some(goal) => goal.cancelled() && self.started.get().is_none(),
        };
        if !permitted {
            return;
        }
        let goal = Goal::new(format!("refresh {}", self.identity));
        goal.stage("scheduling");
        self.progress.set(Some(Arc::clone(&goal)));
        self.bus.bump();
        info!("Scheduling refresh of {}", self.identity);

        let cost = self
            .snapshot
            .get()
            .map(|s| s.cost)
            .unwrap_or(Duration::ZERO);
        let engine = Arc::clone(self);
        // A queued job holds no strong depot reference, so dropping the last
        // handle shuts the depot down even with work still in the queue.
        let depot_for_job = Arc::downgrade(depot);
        let job = RefreshJob::new(
            self.policy.is_exclusive(),
            cost,
            Box::new(move || match depot_for_job.upgrade() {
                Some(depot) => engine.run_refresh(&depot, &goal),
                None => {
                    debug!("Dropping queued refresh of {}, depot gone", engine.identity);
                    let _guard = engine.lock_monitor();
                    if engine.is_current(&goal) {
                        engine.progress.set(None);
                        engine.started.set(None);
                    }
                }
            }),
        );
        depot.submit(job);
    }

    /// Cancel the current goal, if any. Cooperating stages observe this at
    /// their next checkpoint.
    pub(crate) fn cancel(&self) {
        if let Some(goal) = self.progress.get() {
            goal.cancel();
            self.bus.bump();
        }
    }

    /// The refresh pipeline, executed on a scheduler worker
    fn run_refresh(self: &Arc<Self>, depot: &Arc<DepotInner>, goal: &Arc<Goal>) {
        let previous = self.snapshot.get();
        let mut linked: Option<Arc<FrozenLedger>> = None;
        let outcome = self.attempt(depot, goal, &mut linked, previous.as_deref());

        match outcome {
            Ok(next) => {
                info!("Refreshed {}", self.identity);
                self.publish(goal, next);
            }
            Err(err) => {
                match &err {
                    LarderError::Cancelled => info!("Cancelled refresh of {}", self.identity),
                    LarderError::Blocked => {
                        debug!("Refresh of {} blocked on an unready dependency", self.identity)
                    }
                    _ => error!("Failed to refresh cache {}: {err}", self.identity),
                }
                // A blocked attempt is transient: it leaves no snapshot and
                // reruns once the dependency it waits for publishes.
                if !matches!(err, LarderError::Blocked) {
                    let input = linked.map(|l| l.fingerprint().to_string());
                    let _guard = self.lock_monitor();
                    if self.is_current(goal) {
                        let next = Snapshot::failure(
                            &self.identity,
                            &err,
                            input,
                            self.started.get(),
                            previous.as_deref(),
                        );
                        self.store_locked(next);
                    }
                }
            }
        }

        let _guard = self.lock_monitor();
        if self.is_current(goal) {
            self.progress.set(None);
            self.started.set(None);
            self.bus.bump();
        }
    }

    /// One refresh attempt up to (but not including) snapshot publication
    fn attempt(
        self: &Arc<Self>,
        depot: &Arc<DepotInner>,
        goal: &Arc<Goal>,
        linked: &mut Option<Arc<FrozenLedger>>,
        previous: Option<&Snapshot>,
    ) -> LarderResult<Snapshot> {
        goal.tick()?;
        // Linking is delayed until the worker picks the job up, so the ledger
        // incorporates results of refreshes scheduled before this one.
        goal.stage("linking");
        let input = self.link()?;
        *linked = Some(Arc::clone(&input));

        goal.stage("exclusivity");
        let _lock = if self.policy.is_exclusive() {
            Exclusivity::Exclusive(
                depot
                    .exclusivity()
                    .write()
                    .unwrap_or_else(PoisonError::into_inner),
            )
        } else {
            Exclusivity::Shared(
                depot
                    .exclusivity()
                    .read()
                    .unwrap_or_else(PoisonError::into_inner),
            )
        };

        {
            // Taken under the monitor so schedule() cannot observe a
            // cancelled-but-started attempt half way through this transition.
            let _guard = self.lock_monitor();
            goal.tick()?;
            goal.stage_off();
            self.started.set(Some(Utc::now()));
            self.bus.bump();
        }
        info!("Refreshing {}", self.identity);

        goal.stage("supplier");
        let ctx = SupplyContext::new(&self.identity, &input, goal, &self.dir);
        let artifact = (self.supplier)(&ctx)?;
        // A computation that saw a moved or missing dependency must not
        // commit, even if the supplier swallowed the error.
        if ctx.was_blocked() {
            return Err(LarderError::Blocked);
        }
        if !artifact.readonly() {
            return Err(LarderError::UncommittedArtifact);
        }
        goal.tick()?;

        let (hash, size) = artifact::hash_file(artifact.path())?;
        let path = artifact::promote(&artifact, &self.dir, &hash)?;
        let started = self.started.get().unwrap_or_else(Utc::now);
        Ok(Snapshot::success(
            &self.identity,
            path,
            hash,
            size,
            input.fingerprint().to_string(),
            started,
            previous,
        ))
    }

    /// Publish a successful snapshot, guarded against superseded attempts
    fn publish(&self, goal: &Arc<Goal>, next: Snapshot) {
        let _guard = self.lock_monitor();
        if self.is_current(goal) {
            self.store_locked(next);
        }
    }

    /// Replace the in-memory snapshot and persist it. Must hold the monitor.
    ///
    /// The in-memory replacement happens even if the disk write fails, which
    /// keeps the trigger loop from re-scheduling the same refresh forever.
    fn store_locked(&self, next: Snapshot) {
        let next = Arc::new(next);
        self.snapshot.set(Some(Arc::clone(&next)));
        if let Err(err) = snapshot::save(&self.dir, &next) {
            error!(
                "Unable to save snapshot of cache {}: {err}",
                self.identity
            );
        }
        self.bus.bump();
    }

    /// Clear the persisted snapshot. Used by purge; caller checks idleness.
    pub(crate) fn clear(&self) -> LarderResult<()> {
        let _guard = self.lock_monitor();
        self.snapshot.set(None);
        snapshot::clear(&self.dir)?;
        snapshot::remove_orphans(&self.dir, None);
        self.bus.bump();
        Ok(())
    }

    fn is_current(&self, goal: &Arc<Goal>) -> bool {
        self.progress
            .get()
            .is_some_and(|current| Arc::ptr_eq(&current, goal))
    }

    fn lock_monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
