//! Integration tests for the larder cache engine

mod support {
    use std::path::Path;
    use std::time::{Duration, Instant};

    use larder::{Artifact, CacheHandle, Depot, DepotConfig, LarderResult, RefreshMode, SupplyContext};

    pub fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Depot with manual refresh, so tests drive every refresh explicitly
    pub fn manual_depot(root: &Path) -> Depot {
        depot_with(root, RefreshMode::Manual, 2)
    }

    pub fn depot_with(root: &Path, mode: RefreshMode, workers: usize) -> Depot {
        init_logs();
        let config = DepotConfig {
            root: Some(root.to_path_buf()),
            workers,
            default_mode: mode,
            trigger_debounce_ms: 10,
        };
        Depot::with_config(config).unwrap()
    }

    /// Supplier producing fixed bytes
    pub fn fixed_supplier(
        bytes: &'static [u8],
    ) -> impl Fn(&SupplyContext) -> LarderResult<Artifact> {
        move |ctx| {
            let artifact = ctx.scratch_file()?;
            artifact.write(bytes)?;
            artifact.commit()?;
            Ok(artifact)
        }
    }

    /// Block until the handle has no refresh in flight
    pub fn await_idle(handle: &CacheHandle) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.progress().is_some() {
            assert!(Instant::now() < deadline, "refresh did not finish in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Block until the condition holds
    pub fn await_condition(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub const ABC_HASH: &str =
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
}

mod single_cache {
    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, LarderError};

    #[test]
    fn empty_then_refresh_then_stable_hash() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();

        assert!(matches!(x.get(), Err(LarderError::Empty(_))));

        x.refresh();
        await_idle(&x);
        let path = x.get().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        let snapshot = x.snapshot().unwrap();
        assert_eq!(snapshot.hash.as_deref(), Some(ABC_HASH));
        assert_eq!(snapshot.size, 3);
        assert!(snapshot.exception.is_none());
        assert!(!snapshot.cancelled);
    }

    #[test]
    fn rerefresh_moves_refreshed_but_not_updated() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();

        x.refresh();
        await_idle(&x);
        let first = x.snapshot().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        x.refresh();
        await_idle(&x);
        let second = x.snapshot().unwrap();

        assert_eq!(second.hash, first.hash);
        assert_eq!(second.updated, first.updated);
        assert!(second.refreshed > first.refreshed);
    }

    #[test]
    fn handle_debug_names_identity() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();
        assert!(format!("{x:?}").contains('X'));
    }

    #[test]
    fn duplicate_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let identity = CacheIdentity::new("X");
        depot
            .define(CacheDefinition::new(identity.clone()).supply(fixed_supplier(b"abc")))
            .unwrap();
        let err = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap_err();
        assert!(matches!(err, LarderError::DuplicateIdentity(_)));
    }

    #[test]
    fn definition_without_supplier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let err = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")))
            .unwrap_err();
        assert!(matches!(err, LarderError::Definition { .. }));
    }
}

mod failures {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, LarderError};

    #[test]
    fn supplier_failure_is_persisted_and_reconstructed() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CacheIdentity::new("broken");
        {
            let depot = manual_depot(dir.path());
            let x = depot
                .define(CacheDefinition::new(identity.clone()).supply(|_| {
                    Err(LarderError::Internal("flux capacitor failure".to_string()))
                }))
                .unwrap();
            x.refresh();
            await_idle(&x);
            let snapshot = x.snapshot().unwrap();
            let text = snapshot.exception.as_deref().unwrap();
            assert!(text.contains("flux capacitor failure"));
        }
        // Reopening reconstructs the failure from persisted text.
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap();
        match x.get() {
            Err(LarderError::Cached { text }) => assert!(text.contains("flux capacitor failure")),
            other => panic!("expected reconstructed failure, got {other:?}"),
        }
    }

    #[test]
    fn failure_keeps_prior_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let fail = Arc::new(AtomicBool::new(false));
        let fail_in_supplier = Arc::clone(&fail);
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("flaky")).supply(move |ctx| {
                    if fail_in_supplier.load(Ordering::SeqCst) {
                        return Err(LarderError::Internal("transient outage".to_string()));
                    }
                    let artifact = ctx.scratch_file()?;
                    artifact.write(b"abc")?;
                    artifact.commit()?;
                    Ok(artifact)
                }),
            )
            .unwrap();

        x.refresh();
        await_idle(&x);
        let good = x.snapshot().unwrap();
        assert_eq!(good.hash.as_deref(), Some(ABC_HASH));

        fail.store(true, Ordering::SeqCst);
        x.refresh();
        await_idle(&x);
        let after = x.snapshot().unwrap();
        assert!(after.exception.is_some());
        assert_eq!(after.hash.as_deref(), Some(ABC_HASH));
        assert_eq!(after.updated, good.updated);
        // The prior good artifact is still served.
        assert_eq!(std::fs::read(x.get().unwrap()).unwrap(), b"abc");
    }
}

mod persistence {
    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, LarderError};

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CacheIdentity::new("durable");
        {
            let depot = manual_depot(dir.path());
            let x = depot
                .define(CacheDefinition::new(identity.clone()).supply(fixed_supplier(b"abc")))
                .unwrap();
            x.refresh();
            await_idle(&x);
        }
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap();
        assert_eq!(std::fs::read(x.get().unwrap()).unwrap(), b"abc");
        assert_eq!(x.snapshot().unwrap().hash.as_deref(), Some(ABC_HASH));
    }

    #[test]
    fn leftovers_of_interrupted_write_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CacheIdentity::new("crashy");
        let cache_dir = dir.path().join(identity.directory_key());
        {
            let depot = manual_depot(dir.path());
            let x = depot
                .define(CacheDefinition::new(identity.clone()).supply(fixed_supplier(b"abc")))
                .unwrap();
            x.refresh();
            await_idle(&x);
        }
        // Simulate a crash between artifact write and metadata rename.
        let orphan = cache_dir.join("deadbeef.art");
        std::fs::write(&orphan, b"half-written").unwrap();
        let stale_tmp = cache_dir.join("snapshot.json.tmp");
        std::fs::write(&stale_tmp, b"{").unwrap();

        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap();
        assert!(!orphan.exists());
        assert!(!stale_tmp.exists());
        // The previous good snapshot is intact.
        assert_eq!(std::fs::read(x.get().unwrap()).unwrap(), b"abc");
    }

    #[test]
    fn corrupt_metadata_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CacheIdentity::new("corrupt");
        let cache_dir = dir.path().join(identity.directory_key());
        {
            let depot = manual_depot(dir.path());
            let x = depot
                .define(CacheDefinition::new(identity.clone()).supply(fixed_supplier(b"abc")))
                .unwrap();
            x.refresh();
            await_idle(&x);
        }
        std::fs::write(cache_dir.join("snapshot.json"), b"definitely not json").unwrap();

        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap();
        assert!(x.snapshot().is_none());
        assert!(matches!(x.get(), Err(LarderError::Empty(_))));
    }
}

mod cancellation {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, LarderError};

    #[test]
    fn cancelled_refresh_persists_cancelled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CacheIdentity::new("cancellable");
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        {
            let depot = manual_depot(dir.path());
            let entered_flag = Arc::clone(&entered);
            let release_flag = Arc::clone(&release);
            let x = depot
                .define(
                    CacheDefinition::new(identity.clone()).supply(move |ctx| {
                        entered_flag.store(true, Ordering::SeqCst);
                        while !release_flag.load(Ordering::SeqCst) {
                            std::thread::sleep(std::time::Duration::from_millis(2));
                        }
                        ctx.check_cancelled()?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(b"too late")?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
                )
                .unwrap();
            x.refresh();
            await_condition("supplier to start", || entered.load(Ordering::SeqCst));
            x.cancel();
            release.store(true, Ordering::SeqCst);
            await_idle(&x);
            let snapshot = x.snapshot().unwrap();
            assert!(snapshot.cancelled);
            assert!(!snapshot.has_artifact());
            assert!(matches!(x.get(), Err(LarderError::Cancelled)));
        }
        // The cancelled flag survives a restart.
        let depot = manual_depot(dir.path());
        let x = depot
            .define(CacheDefinition::new(identity).supply(fixed_supplier(b"abc")))
            .unwrap();
        assert!(x.snapshot().unwrap().cancelled);
    }

    #[test]
    fn refresh_cancel_refresh_race_keeps_last_attempt() {
        let dir = tempfile::tempdir().unwrap();
        // One worker, so a queued slow job lets us race scheduled refreshes.
        let depot = depot_with(dir.path(), larder::RefreshMode::Manual, 1);

        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let entered_flag = Arc::clone(&entered);
        let release_flag = Arc::clone(&release);
        let slow = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("slow")).supply(move |ctx| {
                    entered_flag.store(true, Ordering::SeqCst);
                    while !release_flag.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(2));
                    }
                    let artifact = ctx.scratch_file()?;
                    artifact.write(b"slow")?;
                    artifact.commit()?;
                    Ok(artifact)
                }),
            )
            .unwrap();
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();

        slow.refresh();
        await_condition("slow supplier to start", || entered.load(Ordering::SeqCst));

        // Queued, cancelled before it could start, then superseded.
        x.refresh();
        x.cancel();
        x.refresh();

        release.store(true, Ordering::SeqCst);
        await_idle(&slow);
        await_idle(&x);

        // Only the last attempt's write landed.
        let snapshot = x.snapshot().unwrap();
        assert!(!snapshot.cancelled);
        assert!(snapshot.exception.is_none());
        assert_eq!(snapshot.hash.as_deref(), Some(ABC_HASH));
    }
}

mod shutdown {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity};

    #[test]
    fn depot_drop_during_refresh_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot_with(dir.path(), larder::RefreshMode::Manual, 1);
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let entered_flag = Arc::clone(&entered);
        let release_flag = Arc::clone(&release);
        let finished_flag = Arc::clone(&finished);
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("X")).supply(move |ctx| {
                    entered_flag.store(true, Ordering::SeqCst);
                    while !release_flag.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    let artifact = ctx.scratch_file()?;
                    artifact.write(b"abc")?;
                    artifact.commit()?;
                    finished_flag.store(true, Ordering::SeqCst);
                    Ok(artifact)
                }),
            )
            .unwrap();
        x.refresh();
        await_condition("supplier to start", || entered.load(Ordering::SeqCst));

        // The refresh in flight now holds the only reference keeping the
        // depot alive; its worker carries the teardown when it finishes.
        drop(x);
        drop(depot);
        release.store(true, Ordering::SeqCst);
        await_condition("supplier to finish", || finished.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(100));
    }
}

mod dependencies {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::support::*;
    use larder::{CacheDefinition, CacheHandle, CacheIdentity, Depot, LarderError};

    /// Cache whose ledger and content follow an external generation counter
    fn versioned(depot: &Depot, name: &str, generation: &Arc<AtomicU64>) -> CacheHandle {
        let for_linker = Arc::clone(generation);
        depot
            .define(
                CacheDefinition::new(CacheIdentity::new(name))
                    .link(move |ctx| {
                        ctx.record_parameter("generation", for_linker.load(Ordering::SeqCst));
                        Ok(())
                    })
                    .supply(|ctx| {
                        let generation = ctx.parameter("generation")?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(format!("content-{generation}").as_bytes())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap()
    }

    /// Cache deriving its content from another cache's artifact
    fn derived(depot: &Depot, name: &str, upstream: &CacheHandle) -> CacheHandle {
        let for_linker = upstream.clone();
        let for_supplier = upstream.clone();
        depot
            .define(
                CacheDefinition::new(CacheIdentity::new(name))
                    .link(move |ctx| {
                        ctx.get(&for_linker)?;
                        Ok(())
                    })
                    .supply(move |ctx| {
                        let path = ctx.get(&for_supplier)?;
                        let text = std::fs::read_to_string(path)
                            .map_err(|e| LarderError::io("reading upstream artifact", e))?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(format!("derived:{text}").as_bytes())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap()
    }

    #[test]
    fn undeclared_dependency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let a = depot
            .define(CacheDefinition::new(CacheIdentity::new("A")).supply(fixed_supplier(b"abc")))
            .unwrap();
        a.refresh();
        await_idle(&a);

        let a_for_supplier = a.clone();
        let b = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("B")).supply(move |ctx| {
                    // Reads A without the linker having declared it.
                    let path = ctx.get(&a_for_supplier)?;
                    let artifact = ctx.scratch_file()?;
                    artifact.write(&std::fs::read(path).unwrap())?;
                    artifact.commit()?;
                    Ok(artifact)
                }),
            )
            .unwrap();
        b.refresh();
        await_idle(&b);
        let text = b.snapshot().unwrap().exception.clone().unwrap();
        assert!(text.contains("not declared"), "unexpected failure: {text}");
    }

    #[test]
    fn upstream_change_invalidates_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let generation = Arc::new(AtomicU64::new(1));
        let a = versioned(&depot, "A", &generation);
        let b = derived(&depot, "B", &a);

        a.refresh();
        await_idle(&a);
        b.refresh();
        await_idle(&b);
        assert_eq!(std::fs::read(b.get().unwrap()).unwrap(), b"derived:content-1");
        assert!(b.stable());

        generation.store(2, Ordering::SeqCst);
        assert!(!a.stable());
        a.refresh();
        await_idle(&a);

        // B's persisted input now references A's old hash.
        assert!(!b.stable());
        b.refresh();
        await_idle(&b);
        assert_eq!(std::fs::read(b.get().unwrap()).unwrap(), b"derived:content-2");
        assert!(b.stable());
    }

    #[test]
    fn downstream_unstable_while_upstream_refreshing() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());

        // The gate only arms before the second refresh, so the first one
        // runs straight through.
        let gate = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let gate_flag = Arc::clone(&gate);
        let entered_flag = Arc::clone(&entered);
        let release_flag = Arc::clone(&release);
        let a = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("A")).supply(move |ctx| {
                    if gate_flag.load(Ordering::SeqCst) {
                        entered_flag.store(true, Ordering::SeqCst);
                        while !release_flag.load(Ordering::SeqCst) {
                            std::thread::sleep(std::time::Duration::from_millis(2));
                        }
                    }
                    let artifact = ctx.scratch_file()?;
                    artifact.write(b"abc")?;
                    artifact.commit()?;
                    Ok(artifact)
                }),
            )
            .unwrap();
        let b = derived(&depot, "B", &a);

        a.refresh();
        await_idle(&a);
        b.refresh();
        await_idle(&b);
        assert!(b.stable());

        // A's content will not change, but a refresh in flight alone makes
        // the whole subtree unstable.
        gate.store(true, Ordering::SeqCst);
        a.refresh();
        await_condition("A's supplier to start", || entered.load(Ordering::SeqCst));
        assert!(!a.stable());
        assert!(!b.stable());

        release.store(true, Ordering::SeqCst);
        await_idle(&a);
        assert!(b.stable());
    }
}

mod exclusivity {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, CachePolicy, RefreshMode};

    #[test]
    fn exclusive_refresh_blocks_other_caches() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot_with(dir.path(), RefreshMode::Manual, 2);
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let entered_flag = Arc::clone(&entered);
        let release_flag = Arc::clone(&release);
        let heavy = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("heavy"))
                    .policy(CachePolicy::new().mode(RefreshMode::Manual).exclusive(true))
                    .supply(move |ctx| {
                        entered_flag.store(true, Ordering::SeqCst);
                        while !release_flag.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(2));
                        }
                        let artifact = ctx.scratch_file()?;
                        artifact.write(b"heavy")?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();

        heavy.refresh();
        await_condition("exclusive supplier to start", || {
            entered.load(Ordering::SeqCst)
        });

        // The free second worker picks X up but parks on the depot-wide
        // lock until the exclusive refresh releases it.
        x.refresh();
        std::thread::sleep(Duration::from_millis(100));
        assert!(x.snapshot().is_none());
        assert!(x.progress().is_some());

        release.store(true, Ordering::SeqCst);
        await_idle(&heavy);
        await_idle(&x);
        assert_eq!(x.snapshot().unwrap().hash.as_deref(), Some(ABC_HASH));
    }
}

mod blocking {
    use std::time::Duration;

    use super::support::*;
    use larder::{CacheDefinition, CacheHandle, CacheIdentity, CachePolicy, RefreshMode};

    fn blocking_policy() -> CachePolicy {
        CachePolicy::new().mode(RefreshMode::Manual).blocking(true)
    }

    #[test]
    fn blocked_attempt_leaves_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let a = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("A"))
                    .policy(blocking_policy())
                    .supply(fixed_supplier(b"abc")),
            )
            .unwrap();
        let a_for_linker = a.clone();
        let a_for_supplier = a.clone();
        let b = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("B"))
                    .link(move |ctx| {
                        ctx.get(&a_for_linker)?;
                        Ok(())
                    })
                    .supply(move |ctx| {
                        let path = ctx.get(&a_for_supplier)?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(&std::fs::read(path).unwrap())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();

        // Blocked on the empty upstream: transient, so nothing is persisted
        // and the attempt reruns once A fills.
        b.refresh();
        await_idle(&b);
        assert!(b.snapshot().is_none());

        a.refresh();
        await_idle(&a);
        b.refresh();
        await_idle(&b);
        assert_eq!(std::fs::read(b.get().unwrap()).unwrap(), b"abc");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_parks_until_blocking_cache_fills() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("X"))
                    .policy(blocking_policy())
                    .supply(fixed_supplier(b"abc")),
            )
            .unwrap();

        let for_task: CacheHandle = x.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for_task.refresh();
        });
        let path = tokio::time::timeout(Duration::from_secs(10), x.wait())
            .await
            .expect("wait never observed the refresh")
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }
}

mod auto_refresh {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serial_test::serial;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, CachePolicy, RefreshMode};

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn automatic_cache_fills_itself() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot_with(dir.path(), RefreshMode::Automatic, 2);
        let x = depot
            .define(CacheDefinition::new(CacheIdentity::new("X")).supply(fixed_supplier(b"abc")))
            .unwrap();

        let path = tokio::time::timeout(Duration::from_secs(10), x.wait())
            .await
            .expect("automatic refresh never produced an artifact")
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
        assert_eq!(x.snapshot().unwrap().hash.as_deref(), Some(ABC_HASH));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn downstream_follows_upstream_without_caller_action() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot_with(dir.path(), RefreshMode::Automatic, 2);
        let generation = Arc::new(AtomicU64::new(1));

        let for_linker = Arc::clone(&generation);
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("X"))
                    .link(move |ctx| {
                        ctx.record_parameter("generation", for_linker.load(Ordering::SeqCst));
                        Ok(())
                    })
                    .supply(|ctx| {
                        let generation = ctx.parameter("generation")?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(format!("content-{generation}").as_bytes())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();
        let x_for_linker = x.clone();
        let x_for_supplier = x.clone();
        let y = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("Y"))
                    .link(move |ctx| {
                        ctx.get(&x_for_linker)?;
                        Ok(())
                    })
                    .supply(move |ctx| {
                        let path = ctx.get(&x_for_supplier)?;
                        let text = std::fs::read_to_string(path).map_err(|e| {
                            larder::LarderError::io("reading upstream artifact", e)
                        })?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(format!("derived:{text}").as_bytes())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();

        let derived = |y: &larder::CacheHandle| {
            y.get().ok().map(|path| std::fs::read(path).unwrap())
        };
        let expect = |y: &larder::CacheHandle, want: &'static [u8]| {
            let y = y.clone();
            async move {
                tokio::time::timeout(Duration::from_secs(10), async {
                    while derived(&y).as_deref() != Some(want) {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await
                .unwrap_or_else(|_| panic!("never converged to {}", String::from_utf8_lossy(want)));
            }
        };

        expect(&y, b"derived:content-1").await;

        // New upstream content propagates with no caller action on Y.
        generation.store(2, Ordering::SeqCst);
        x.refresh();
        expect(&y, b"derived:content-2").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn period_expiry_refreshes_again() {
        let dir = tempfile::tempdir().unwrap();
        let depot = depot_with(dir.path(), RefreshMode::Automatic, 2);
        let calls = Arc::new(AtomicU64::new(0));
        let calls_in_supplier = Arc::clone(&calls);
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("X"))
                    .policy(CachePolicy::new().period(Duration::from_millis(100)))
                    .supply(move |ctx| {
                        let n = calls_in_supplier.fetch_add(1, Ordering::SeqCst) + 1;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(format!("run-{n}").as_bytes())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), x.wait())
            .await
            .expect("initial fill never happened")
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expiry never drove a second refresh");
    }
}

mod purge {
    use std::time::Duration;

    use super::support::*;
    use larder::{CacheDefinition, CacheIdentity, LarderError};

    #[test]
    fn referenced_caches_survive_purge() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let a = depot
            .define(CacheDefinition::new(CacheIdentity::new("A")).supply(fixed_supplier(b"abc")))
            .unwrap();
        let a_for_linker = a.clone();
        let a_for_supplier = a.clone();
        let b = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("B"))
                    .link(move |ctx| {
                        ctx.get(&a_for_linker)?;
                        Ok(())
                    })
                    .supply(move |ctx| {
                        let path = ctx.get(&a_for_supplier)?;
                        let artifact = ctx.scratch_file()?;
                        artifact.write(&std::fs::read(path).unwrap())?;
                        artifact.commit()?;
                        Ok(artifact)
                    }),
            )
            .unwrap();

        a.refresh();
        await_idle(&a);
        b.refresh();
        await_idle(&b);

        std::thread::sleep(Duration::from_millis(50));
        // B was touched just now, A only through B's dependency edge.
        b.get().unwrap();
        let removed = depot.purge(Duration::from_millis(20)).unwrap();
        assert_eq!(removed, 0);
        assert!(a.snapshot().is_some());

        // With nothing recently accessed, both go.
        std::thread::sleep(Duration::from_millis(50));
        let removed = depot.purge(Duration::from_millis(20)).unwrap();
        assert_eq!(removed, 2);
        assert!(matches!(a.get(), Err(LarderError::Empty(_))));
        assert!(matches!(b.get(), Err(LarderError::Empty(_))));
    }

    #[test]
    fn undefined_directories_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let stray = dir.path().join("0011223344556677");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("junk.art"), b"junk").unwrap();

        let removed = depot.purge(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 1);
        assert!(!stray.exists());
    }

    #[test]
    fn refreshing_caches_are_skipped() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let depot = manual_depot(dir.path());
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let entered_flag = Arc::clone(&entered);
        let release_flag = Arc::clone(&release);
        let x = depot
            .define(
                CacheDefinition::new(CacheIdentity::new("busy")).supply(move |ctx| {
                    entered_flag.store(true, Ordering::SeqCst);
                    while !release_flag.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    let artifact = ctx.scratch_file()?;
                    artifact.write(b"abc")?;
                    artifact.commit()?;
                    Ok(artifact)
                }),
            )
            .unwrap();
        x.refresh();
        await_condition("supplier to start", || entered.load(Ordering::SeqCst));

        let removed = depot.purge(Duration::ZERO).unwrap();
        assert_eq!(removed, 0);

        release.store(true, Ordering::SeqCst);
        await_idle(&x);
    }
}
