// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tests of procedures driven by a [`ProcedureExecutor`], including restarts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prometheus::Registry;
use prost::Message;

use mz_region_gc::capability::{
    AssignmentRegistry, FileArchive, MetadataStore, PlacementHints, ServerTracker,
};
use mz_region_gc::codec::{ProtoProcedureRecord, ProtoRegionIdentity};
use mz_region_gc::lock::{LockError, LockRequest};
use mz_region_gc::mem::{MemFileArchive, MemLockAuthority, MemProcedureStore, MemRegionTable};
use mz_region_gc::metrics::Metrics;
use mz_region_gc::{
    CodecError, EventKey, FatalError, Flow, GcRegionEnv, GcRegionState, Outcome, ProcId,
    Procedure, ProcedureExecutor, ProcedureStore, RegionGcConfig, RegionGcProcedure,
    RegionIdentity, TableId,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> RegionGcConfig {
    let mut config = RegionGcConfig::default();
    config.step_retry.initial_backoff = Duration::from_millis(1);
    config.step_retry.clamp_backoff = Duration::from_millis(8);
    config.executor_retry.initial_backoff = Duration::from_millis(1);
    config.executor_retry.clamp_backoff = Duration::from_millis(4);
    config
}

fn region(start: &'static str, end: &'static str, id: u64) -> RegionIdentity {
    RegionIdentity::new(TableId::new("t1"), start, end, id, 0)
}

/// Polls `cond` until it holds.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A region GC deployment that lives across executor restarts.
struct Cluster {
    archive: Arc<MemFileArchive>,
    meta: Arc<MemRegionTable>,
    assignments: Arc<MemRegionTable>,
    servers: Arc<MemRegionTable>,
    placement: Arc<MemRegionTable>,
    store: Arc<MemProcedureStore>,
    env: Arc<GcRegionEnv>,
    metrics: Arc<Metrics>,
}

impl Cluster {
    fn new() -> Self {
        let archive = Arc::new(MemFileArchive::new());
        let meta = Arc::new(MemRegionTable::new("meta"));
        let assignments = Arc::new(MemRegionTable::new("assignments"));
        let servers = Arc::new(MemRegionTable::new("servers"));
        let placement = Arc::new(MemRegionTable::new("placement"));
        let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
        let env = GcRegionEnv::new(
            &config(),
            Arc::clone(&archive) as Arc<dyn FileArchive>,
            Arc::clone(&meta) as Arc<dyn MetadataStore>,
            Arc::clone(&metrics),
        )
        .with_assignments(Arc::clone(&assignments) as Arc<dyn AssignmentRegistry>)
        .with_server_tracker(Arc::clone(&servers) as Arc<dyn ServerTracker>)
        .with_placement_hints(Arc::clone(&placement) as Arc<dyn PlacementHints>);
        Cluster {
            archive,
            meta,
            assignments,
            servers,
            placement,
            store: Arc::new(MemProcedureStore::new()),
            env: Arc::new(env),
            metrics,
        }
    }

    fn add(&self, region: &RegionIdentity) {
        self.archive.add_region(region);
        self.meta.insert(region);
        self.assignments.insert(region);
        self.servers.insert(region);
        self.placement.insert(region);
    }

    fn assert_collected(&self, region: &RegionIdentity) {
        assert!(!self.archive.has_data(region));
        assert!(self.archive.is_archived(region));
        assert!(!self.meta.contains(region));
        assert!(!self.assignments.contains(region));
        assert!(!self.servers.contains(region));
        assert!(!self.placement.contains(region));
    }

    /// Starts a process: a fresh executor with fresh locks over the same
    /// durable state.
    fn start(&self, locks: &Arc<MemLockAuthority>) -> ProcedureExecutor<RegionGcProcedure> {
        ProcedureExecutor::new(
            &config(),
            Arc::clone(&self.env),
            Arc::clone(&self.store) as Arc<dyn ProcedureStore>,
            Arc::clone(locks) as Arc<dyn mz_region_gc::lock::LockAuthority>,
            Arc::clone(&self.metrics),
        )
        .expect("valid config")
    }

    fn stored(&self, id: ProcId) -> Option<RegionGcProcedure> {
        self.store
            .get(id)
            .map(|record| RegionGcProcedure::decode(&record).expect("valid record"))
    }
}

#[tokio::test]
async fn gc_region() {
    init_logging();
    let cluster = Cluster::new();
    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let r = region("a", "m", 1700);
    cluster.add(&r);

    let id = executor
        .submit(|id| RegionGcProcedure::new(id, r.clone()))
        .await
        .expect("submitted");
    assert_eq!(id, ProcId(1));
    assert_eq!(executor.wait(id).await, Some(Outcome::Done));

    cluster.assert_collected(&r);
    assert_eq!(cluster.archive.archive_calls(), 1);
    assert!(cluster.store.is_empty());
    assert_eq!(locks.held(), 0);
    assert_eq!(cluster.metrics.finished("done").get(), 1);
    // Prepare, archive and purge each took one step.
    assert_eq!(cluster.metrics.steps("advance").get(), 2);
    assert_eq!(cluster.metrics.steps("done").get(), 1);
    assert_eq!(executor.wait(id).await, None);
}

#[tokio::test]
async fn many_regions() {
    init_logging();
    let cluster = Cluster::new();
    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let regions: Vec<_> = (0..10)
        .map(|i| RegionIdentity::new(TableId::new(format!("t{}", i % 3)), "", "", i, 0))
        .collect();
    for r in &regions {
        cluster.add(r);
        executor
            .submit(|id| RegionGcProcedure::new(id, r.clone()))
            .await
            .expect("submitted");
    }
    // Half the archive calls fail once, interleaving the procedures.
    cluster.archive.archive_failures().fail_next(5);

    let outcomes = executor.wait_all().await;
    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.values().all(|outcome| *outcome == Outcome::Done));
    for r in &regions {
        cluster.assert_collected(r);
    }
    assert_eq!(cluster.archive.archive_calls(), 10);
    assert!(cluster.store.is_empty());
    assert_eq!(locks.held(), 0);
}

#[tokio::test]
async fn region_lock_serializes_procedures() {
    init_logging();
    let cluster = Cluster::new();
    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let r = region("a", "m", 1700);
    cluster.add(&r);
    cluster.archive.archive_failures().fail_always(true);

    let first = executor
        .submit(|id| RegionGcProcedure::new(id, r.clone()))
        .await
        .expect("submitted");
    eventually("first procedure to hold the region", || {
        locks.region_holder(&r.name()) == Some(first)
    })
    .await;
    let second = executor
        .submit(|id| RegionGcProcedure::new(id, r.clone()))
        .await
        .expect("submitted");
    eventually("second procedure to hit the lock", || {
        cluster.metrics.lock_conflicts.get() > 0
    })
    .await;
    assert_eq!(locks.region_holder(&r.name()), Some(first));
    assert_eq!(
        cluster.stored(second).map(|p| p.state()),
        Some(GcRegionState::Prepare)
    );

    // A schema change can't lock the table out from under the procedure.
    let ddl = locks.acquire_exclusive_table(&TableId::new("t1"), ProcId(999));
    match ddl {
        Err(LockError::Conflict { holder, .. }) => assert_eq!(holder, first),
        other => panic!("expected a conflict, got {other:?}"),
    }

    cluster.archive.archive_failures().clear();
    assert_eq!(executor.wait(first).await, Some(Outcome::Done));
    assert_eq!(executor.wait(second).await, Some(Outcome::Done));
    // The second procedure found nothing left to archive.
    assert_eq!(cluster.archive.archive_calls(), 1);
    cluster.assert_collected(&r);
    assert_eq!(locks.held(), 0);

    let token = locks
        .acquire_exclusive_table(&TableId::new("t1"), ProcId(999))
        .expect("table is free");
    assert_eq!(locks.held(), 1);
    mz_region_gc::lock::LockAuthority::release(&*locks, token)
        .await
        .expect("released");
}

#[tokio::test]
async fn resume_after_restart() {
    init_logging();
    let cluster = Cluster::new();
    let r = region("a", "m", 1700);
    cluster.add(&r);
    cluster.archive.archive_failures().fail_always(true);

    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let id = executor
        .submit(|id| RegionGcProcedure::new(id, r.clone()))
        .await
        .expect("submitted");
    eventually("a failed archive to be persisted", || {
        cluster
            .stored(id)
            .is_some_and(|p| p.last_error().is_some())
    })
    .await;
    executor.shutdown();
    assert_eq!(executor.wait(id).await, None);

    let stored = cluster.stored(id).expect("still stored");
    assert_eq!(stored.state(), GcRegionState::Archive);
    assert_eq!(stored.last_error(), Some("external operation failed: injected failure: archive"));
    // The old process's locks died with it.
    assert_eq!(locks.held(), 2);

    cluster.archive.archive_failures().clear();
    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let recovery = executor.recover().await.expect("recovered");
    assert_eq!(recovery.resumed, vec![id]);
    assert!(recovery.failed.is_empty());
    assert!(recovery.defective.is_empty());

    assert_eq!(executor.wait(id).await, Some(Outcome::Done));
    cluster.assert_collected(&r);
    assert_eq!(cluster.archive.archive_calls(), 1);
    assert!(cluster.store.is_empty());
    assert_eq!(locks.held(), 0);

    // New procedures don't reuse recovered ids.
    let next = executor
        .submit(|id| RegionGcProcedure::new(id, region("m", "", 1701)))
        .await
        .expect("submitted");
    assert!(next > id);
    assert_eq!(executor.wait(next).await, Some(Outcome::Done));
}

#[tokio::test]
async fn recovery_reports_unusable_records() {
    init_logging();
    let cluster = Cluster::new();
    let store = Arc::clone(&cluster.store);

    let defective = ProtoProcedureRecord {
        kind: RegionGcProcedure::KIND.to_owned(),
        proc_id: 7,
        state: 99,
        region: Some(ProtoRegionIdentity {
            table_id: "t1".into(),
            ..Default::default()
        }),
        last_error: None,
    };
    store
        .put(ProcId(7), defective.encode_to_vec().into())
        .await
        .expect("put");
    store
        .put(ProcId(8), Bytes::from_static(b"\xff\xff garbage"))
        .await
        .expect("put");

    let mut failed = RegionGcProcedure::new(ProcId(3), region("a", "m", 1700));
    failed.fail(&FatalError::SteppedAfterFailure(ProcId(3)));
    store.put(ProcId(3), failed.encode()).await.expect("put");

    // A record filed under the wrong id.
    let misfiled = RegionGcProcedure::new(ProcId(4), region("m", "", 1701));
    store.put(ProcId(5), misfiled.encode()).await.expect("put");

    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let recovery = executor.recover().await.expect("recovered");
    assert!(recovery.resumed.is_empty());
    assert_eq!(recovery.failed, vec![ProcId(3)]);
    let defective: Vec<_> = recovery.defective.iter().map(|(id, _)| *id).collect();
    assert_eq!(defective, vec![ProcId(5), ProcId(7), ProcId(8)]);
    assert!(matches!(
        recovery.defective[0].1,
        CodecError::IdMismatch {
            stored: ProcId(5),
            found: ProcId(4)
        }
    ));
    assert!(matches!(
        recovery.defective[1].1,
        CodecError::UnknownState(99)
    ));
    assert!(matches!(recovery.defective[2].1, CodecError::Malformed(_)));
    assert_eq!(cluster.metrics.defective_records.get(), 3);

    // Nothing was run or removed.
    assert_eq!(store.len(), 4);
    assert_eq!(locks.held(), 0);
    assert_eq!(
        cluster.stored(ProcId(3)).map(|p| p.state()),
        Some(GcRegionState::Failed)
    );
    let id = executor
        .submit(|id| RegionGcProcedure::new(id, region("z", "", 1800)))
        .await
        .expect("submitted");
    assert_eq!(id, ProcId(9));
}

#[tokio::test]
async fn store_failures_are_retried() {
    init_logging();
    let cluster = Cluster::new();
    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let r = region("a", "m", 1700);
    cluster.add(&r);

    cluster.store.failures().fail_next(3);
    let id = executor
        .submit(|id| RegionGcProcedure::new(id, r.clone()))
        .await
        .expect("submitted");
    assert_eq!(executor.wait(id).await, Some(Outcome::Done));
    cluster.assert_collected(&r);
    assert_eq!(cluster.metrics.store_failures.get(), 3);
    assert!(cluster.store.is_empty());
}

/// A procedure that yields once, then waits for an event, then finishes, or
/// fails right away if `doomed`.
#[derive(Debug)]
struct Waiter {
    id: ProcId,
    phase: u8,
    doomed: bool,
}

const FAILED_PHASE: u8 = u8::MAX;

impl fmt::Display for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Waiter {} phase={}", self.id, self.phase)
    }
}

#[async_trait]
impl Procedure for Waiter {
    type State = u8;
    type Env = ();

    fn id(&self) -> ProcId {
        self.id
    }

    fn lock_requests(&self) -> Vec<LockRequest> {
        vec![LockRequest::SharedTable(TableId::new("t1"))]
    }

    fn is_done(&self) -> bool {
        self.phase == 3
    }

    fn is_failed(&self) -> bool {
        self.phase == FAILED_PHASE
    }

    async fn step(&mut self, _env: &()) -> Flow<u8> {
        if self.doomed {
            return Flow::Fatal(FatalError::SteppedAfterFailure(self.id));
        }
        match self.phase {
            0 => {
                self.phase = 1;
                Flow::Yield
            }
            1 => {
                self.phase = 2;
                Flow::Suspend(EventKey("go".into()))
            }
            _ => {
                self.phase = 3;
                Flow::Done
            }
        }
    }

    async fn rollback(&mut self, _env: &()) {}

    fn fail(&mut self, _err: &FatalError) {
        self.phase = FAILED_PHASE;
    }

    fn encode(&self) -> Bytes {
        Bytes::from(vec![self.phase, u8::from(self.doomed)])
    }

    fn decode(_buf: &[u8]) -> Result<Self, CodecError> {
        Err(CodecError::MissingField("id"))
    }
}

fn start_waiters(
    slots: usize,
    store: &Arc<MemProcedureStore>,
    locks: &Arc<MemLockAuthority>,
    metrics: &Arc<Metrics>,
) -> ProcedureExecutor<Waiter> {
    let mut config = config();
    config.executor_slots = slots;
    ProcedureExecutor::new(
        &config,
        Arc::new(()),
        Arc::clone(store) as Arc<dyn ProcedureStore>,
        Arc::clone(locks) as Arc<dyn mz_region_gc::lock::LockAuthority>,
        Arc::clone(metrics),
    )
    .expect("valid config")
}

#[tokio::test]
async fn suspended_procedures_release_their_slot() {
    init_logging();
    let store = Arc::new(MemProcedureStore::new());
    let locks = Arc::new(MemLockAuthority::new());
    let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
    let executor = start_waiters(1, &store, &locks, &metrics);

    let first = executor
        .submit(|id| Waiter {
            id,
            phase: 0,
            doomed: false,
        })
        .await
        .expect("submitted");
    eventually("first to suspend", || {
        store.get(first).as_deref() == Some(&[2, 0][..])
    })
    .await;
    assert_eq!(metrics.steps("yield").get(), 1);
    assert_eq!(metrics.steps("suspend").get(), 1);

    // The only slot is free while the first waiter is suspended.
    let second = executor
        .submit(|id| Waiter {
            id,
            phase: 2,
            doomed: false,
        })
        .await
        .expect("submitted");
    assert_eq!(executor.wait(second).await, Some(Outcome::Done));
    assert_eq!(store.get(first).as_deref(), Some(&[2, 0][..]));
    assert_eq!(locks.shared_holders(&TableId::new("t1")), vec![first]);

    executor.wake(&EventKey("go".into()));
    assert_eq!(executor.wait(first).await, Some(Outcome::Done));
    assert!(store.is_empty());
    assert_eq!(locks.held(), 0);
}

#[tokio::test]
async fn wake_before_suspend_is_not_lost() {
    init_logging();
    let store = Arc::new(MemProcedureStore::new());
    let locks = Arc::new(MemLockAuthority::new());
    let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
    let executor = start_waiters(2, &store, &locks, &metrics);

    executor.wake(&EventKey("go".into()));
    let id = executor
        .submit(|id| Waiter {
            id,
            phase: 0,
            doomed: false,
        })
        .await
        .expect("submitted");
    assert_eq!(executor.wait(id).await, Some(Outcome::Done));
    assert!(store.is_empty());
}

#[tokio::test]
async fn fatal_errors_fail_the_procedure() {
    init_logging();
    let store = Arc::new(MemProcedureStore::new());
    let locks = Arc::new(MemLockAuthority::new());
    let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
    let executor = start_waiters(2, &store, &locks, &metrics);

    let id = executor
        .submit(|id| Waiter {
            id,
            phase: 0,
            doomed: true,
        })
        .await
        .expect("submitted");
    assert_eq!(
        executor.wait(id).await,
        Some(Outcome::Failed(FatalError::SteppedAfterFailure(id)))
    );
    // The failed record is kept for an operator, and its locks are released.
    assert_eq!(store.get(id).as_deref(), Some(&[FAILED_PHASE, 1][..]));
    assert_eq!(locks.held(), 0);
    assert_eq!(metrics.steps("fatal").get(), 1);
    assert_eq!(metrics.finished("failed").get(), 1);
}

#[tokio::test]
async fn wake_resumes_every_suspended_procedure() {
    init_logging();
    let store = Arc::new(MemProcedureStore::new());
    let locks = Arc::new(MemLockAuthority::new());
    let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
    let executor = start_waiters(2, &store, &locks, &metrics);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let id = executor
            .submit(|id| Waiter {
                id,
                phase: 0,
                doomed: false,
            })
            .await
            .expect("submitted");
        ids.push(id);
    }
    eventually("both to suspend", || metrics.steps("suspend").get() == 2).await;

    executor.wake(&EventKey("go".into()));
    for id in ids {
        let outcome = tokio::time::timeout(Duration::from_secs(5), executor.wait(id))
            .await
            .expect("procedure was resumed");
        assert_eq!(outcome, Some(Outcome::Done));
    }
    assert!(store.is_empty());
    assert_eq!(locks.held(), 0);
}

#[tokio::test]
async fn rejects_procedures_with_the_wrong_id() {
    init_logging();
    let store = Arc::new(MemProcedureStore::new());
    let locks = Arc::new(MemLockAuthority::new());
    let metrics = Arc::new(Metrics::register(&Registry::new()).expect("registered"));
    let executor = start_waiters(2, &store, &locks, &metrics);

    let err = executor
        .submit(|_| Waiter {
            id: ProcId(42),
            phase: 0,
            doomed: false,
        })
        .await
        .expect_err("wrong id");
    assert!(
        matches!(
            err,
            CodecError::IdMismatch {
                stored: ProcId(1),
                found: ProcId(42)
            }
        ),
        "{err:?}"
    );
    assert!(store.is_empty());
    assert_eq!(locks.held(), 0);
}

#[tokio::test]
async fn rejects_invalid_config() {
    let cluster = Cluster::new();
    let mut config = config();
    config.executor_slots = 0;
    let err = ProcedureExecutor::<RegionGcProcedure>::new(
        &config,
        Arc::clone(&cluster.env),
        Arc::clone(&cluster.store) as Arc<dyn ProcedureStore>,
        Arc::new(MemLockAuthority::new()) as Arc<dyn mz_region_gc::lock::LockAuthority>,
        Arc::clone(&cluster.metrics),
    )
    .expect_err("zero slots");
    assert!(
        err.to_string().contains("executor_slots must be at least 1"),
        "{err}"
    );
}

#[tokio::test]
async fn recovery_handles_the_largest_id() {
    init_logging();
    let cluster = Cluster::new();
    cluster
        .store
        .put(ProcId(u64::MAX), Bytes::from_static(b"\xff\xff garbage"))
        .await
        .expect("put");

    let locks = Arc::new(MemLockAuthority::new());
    let executor = cluster.start(&locks);
    let recovery = executor.recover().await.expect("recovered");
    let defective: Vec<_> = recovery.defective.iter().map(|(id, _)| *id).collect();
    assert_eq!(defective, vec![ProcId(u64::MAX)]);
    assert_eq!(cluster.store.len(), 1);
}
