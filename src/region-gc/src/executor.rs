// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives procedures to completion.
//!
//! The executor upholds the procedure contract: before the first step it
//! acquires every lock the procedure asks for, it persists the procedure after
//! every step, and it releases the locks once the procedure is done or has
//! failed. Each procedure runs on its own task, but only `executor_slots`
//! steps execute at a time; a procedure gives up its slot while it backs off,
//! is suspended, or yields.
//!
//! There is no way to cancel a running procedure. A process that stops (see
//! [`ProcedureExecutor::shutdown`]) leaves its procedures in the store, and
//! [`ProcedureExecutor::recover`] picks them up again on the next start.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::RegionGcConfig;
use crate::error::{CodecError, ConfigError, ExternalError, FatalError};
use crate::lock::{LockAuthority, LockError, LockToken};
use crate::metrics::Metrics;
use crate::procedure::{EventKey, Flow, ProcId, Procedure};
use crate::retry::RetryConfig;

/// Durable storage for in-flight procedures, keyed by procedure id.
#[async_trait]
pub trait ProcedureStore: Debug + Send + Sync {
    /// Inserts or replaces the record of procedure `id`.
    async fn put(&self, id: ProcId, record: Bytes) -> Result<(), ExternalError>;

    /// Removes the record of procedure `id`. Removing an absent record is a
    /// no-op.
    async fn delete(&self, id: ProcId) -> Result<(), ExternalError>;

    /// Returns every stored record, in id order.
    async fn list(&self) -> Result<Vec<(ProcId, Bytes)>, ExternalError>;
}

/// How a procedure ended.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Done,
    /// The procedure hit a fatal defect. Its record is kept, marked failed,
    /// for an operator to look at.
    Failed(FatalError),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// What [`ProcedureExecutor::recover`] found in the procedure store.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Procedures that were resumed from their persisted state.
    pub resumed: Vec<ProcId>,
    /// Procedures that had previously failed. They are not run.
    pub failed: Vec<ProcId>,
    /// Records that could not be decoded. They are left untouched and are
    /// not run: they need manual intervention.
    pub defective: Vec<(ProcId, CodecError)>,
}

/// The most distinct events that are tracked at once for wakes that arrived
/// before anyone was suspended on them. Events with suspended procedures are
/// always tracked.
const MAX_PENDING_WAKES: usize = 1024;

#[derive(Debug, Default)]
struct EventState {
    notify: Arc<Notify>,
    /// The number of procedures suspended on the event.
    waiters: usize,
    /// Bumped by every wake that finds waiters.
    generation: u64,
    /// A wake arrived while nobody was waiting. Consumed by the next waiter.
    pending: bool,
}

impl EventState {
    fn is_idle(&self) -> bool {
        self.waiters == 0 && !self.pending
    }
}

/// Wakes suspended procedures.
///
/// Entries exist only while an event has waiters or a pending wake.
#[derive(Debug, Default)]
struct EventBus {
    events: Mutex<BTreeMap<EventKey, EventState>>,
}

impl EventBus {
    async fn wait(&self, event: &EventKey) {
        let (notify, seen) = {
            let mut events = self.events.lock().expect("lock poisoned");
            let state = events.entry(event.clone()).or_default();
            if state.pending {
                state.pending = false;
                if state.is_idle() {
                    events.remove(event);
                }
                return;
            }
            state.waiters += 1;
            (Arc::clone(&state.notify), state.generation)
        };
        let _registration = Registration { bus: self, event };
        loop {
            // `notify_waiters` reaches a `Notified` from the moment it is
            // created, so a wake between here and the await isn't missed.
            let notified = notify.notified();
            if self.generation(event) != Some(seen) {
                return;
            }
            notified.await;
        }
    }

    fn wake(&self, event: &EventKey) {
        let mut events = self.events.lock().expect("lock poisoned");
        if let Some(state) = events.get_mut(event) {
            if state.waiters > 0 {
                state.generation += 1;
                state.notify.notify_waiters();
            } else {
                state.pending = true;
            }
            return;
        }
        if events.len() < MAX_PENDING_WAKES {
            let state = EventState {
                pending: true,
                ..Default::default()
            };
            events.insert(event.clone(), state);
        } else {
            warn!(
                "dropping wake of {event}: {} events already tracked",
                events.len()
            );
        }
    }

    fn generation(&self, event: &EventKey) -> Option<u64> {
        let events = self.events.lock().expect("lock poisoned");
        events.get(event).map(|state| state.generation)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.events.lock().expect("lock poisoned").len()
    }
}

/// A procedure suspended on an event. Dropping it, including when the waiting
/// task is aborted, unregisters the waiter.
struct Registration<'a> {
    bus: &'a EventBus,
    event: &'a EventKey,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut events = self.bus.events.lock().expect("lock poisoned");
        if let Some(state) = events.get_mut(self.event) {
            state.waiters -= 1;
            if state.is_idle() {
                events.remove(self.event);
            }
        }
    }
}

/// Runs [`Procedure`]s of type `P`.
pub struct ProcedureExecutor<P: Procedure> {
    driver: Driver<P>,
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<ProcId, JoinHandle<Outcome>>>,
}

impl<P: Procedure> Debug for ProcedureExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureExecutor")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<P: Procedure> ProcedureExecutor<P> {
    pub fn new(
        config: &RegionGcConfig,
        env: Arc<P::Env>,
        store: Arc<dyn ProcedureStore>,
        locks: Arc<dyn LockAuthority>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ProcedureExecutor {
            driver: Driver {
                env,
                store,
                locks,
                metrics,
                retry: config.executor_retry.clone(),
                slots: Arc::new(Semaphore::new(config.executor_slots)),
                events: Arc::new(EventBus::default()),
            },
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(BTreeMap::new()),
        })
    }

    /// Resumes every procedure in the procedure store.
    ///
    /// Must be called once at startup, before new procedures are submitted,
    /// so that new ids don't collide with persisted ones.
    pub async fn recover(&self) -> Result<Recovery, ExternalError> {
        let records = self.driver.store.list().await?;
        let mut recovery = Recovery::default();
        for (id, record) in records {
            self.next_id.fetch_max(id.0.saturating_add(1), Ordering::SeqCst);
            if self.tasks.lock().expect("lock poisoned").contains_key(&id) {
                continue;
            }
            let proc = P::decode(&record).and_then(|proc| {
                if proc.id() == id {
                    Ok(proc)
                } else {
                    Err(CodecError::IdMismatch {
                        stored: id,
                        found: proc.id(),
                    })
                }
            });
            match proc {
                Err(err) => {
                    error!("procedure {id} is defective and needs manual intervention: {err}");
                    self.driver.metrics.defective_records.inc();
                    recovery.defective.push((id, err));
                }
                Ok(proc) if proc.is_failed() => {
                    warn!("{proc} failed before the restart; not resuming it");
                    recovery.failed.push(id);
                }
                Ok(proc) => {
                    info!("resuming {proc}");
                    self.spawn(proc);
                    recovery.resumed.push(id);
                }
            }
        }
        Ok(recovery)
    }

    /// Persists and starts a new procedure built by `build` from a fresh id.
    ///
    /// A procedure that doesn't carry the id it was built with is rejected
    /// without being persisted.
    pub async fn submit(&self, build: impl FnOnce(ProcId) -> P) -> Result<ProcId, CodecError> {
        let id = ProcId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let proc = build(id);
        if proc.id() != id {
            error!("rejecting {proc}: it was built with {id}");
            return Err(CodecError::IdMismatch {
                stored: id,
                found: proc.id(),
            });
        }
        self.driver.persist(&proc).await;
        info!("submitted {proc}");
        self.spawn(proc);
        Ok(id)
    }

    /// Resumes procedures suspended on `event`.
    pub fn wake(&self, event: &EventKey) {
        self.driver.events.wake(event);
    }

    /// Waits for procedure `id` to finish.
    ///
    /// Returns `None` if the procedure is unknown, already waited for, or was
    /// stopped by [`Self::shutdown`].
    pub async fn wait(&self, id: ProcId) -> Option<Outcome> {
        let handle = self.tasks.lock().expect("lock poisoned").remove(&id)?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => None,
        }
    }

    /// Waits for every running procedure to finish.
    pub async fn wait_all(&self) -> BTreeMap<ProcId, Outcome> {
        let ids: Vec<_> = self
            .tasks
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        let outcomes = futures::future::join_all(ids.iter().map(|id| self.wait(*id))).await;
        ids.into_iter()
            .zip(outcomes)
            .filter_map(|(id, outcome)| outcome.map(|outcome| (id, outcome)))
            .collect()
    }

    /// Stops every procedure where it is, as a process exit would.
    ///
    /// Nothing is written to the procedure store and no locks are released:
    /// the procedures are resumed by [`Self::recover`] in the next process.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        info!("shutting down with {} procedures in flight", tasks.len());
        for (_, handle) in tasks {
            handle.abort();
        }
    }

    fn spawn(&self, proc: P) {
        let id = proc.id();
        let handle = tokio::spawn(self.driver.clone().run(proc));
        self.tasks.lock().expect("lock poisoned").insert(id, handle);
    }
}

/// The state a procedure's task needs.
struct Driver<P: Procedure> {
    env: Arc<P::Env>,
    store: Arc<dyn ProcedureStore>,
    locks: Arc<dyn LockAuthority>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
    slots: Arc<Semaphore>,
    events: Arc<EventBus>,
}

impl<P: Procedure> Clone for Driver<P> {
    fn clone(&self) -> Self {
        Driver {
            env: Arc::clone(&self.env),
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            metrics: Arc::clone(&self.metrics),
            retry: self.retry.clone(),
            slots: Arc::clone(&self.slots),
            events: Arc::clone(&self.events),
        }
    }
}

impl<P: Procedure> Driver<P> {
    async fn run(self, mut proc: P) -> Outcome {
        let id = proc.id();
        let tokens = self.acquire_locks(&proc).await;
        debug!("{proc} acquired {} locks", tokens.len());

        let outcome = loop {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let flow = proc.step(&*self.env).await;
            self.metrics.steps(flow.label()).inc();
            match flow {
                Flow::Advance(state) => {
                    trace!("{proc} advanced to {state:?}");
                    self.persist(&proc).await;
                }
                Flow::Retry { backoff } => {
                    self.persist(&proc).await;
                    drop(permit);
                    tokio::time::sleep(backoff).await;
                }
                Flow::Yield => {
                    self.persist(&proc).await;
                    drop(permit);
                    tokio::task::yield_now().await;
                }
                Flow::Suspend(event) => {
                    self.persist(&proc).await;
                    drop(permit);
                    debug!("{proc} suspended until {event}");
                    self.events.wait(&event).await;
                }
                Flow::Done => {
                    let store = &self.store;
                    self.retry_external("delete procedure", || store.delete(id))
                        .await;
                    break Outcome::Done;
                }
                Flow::Fatal(err) => {
                    error!("{proc} failed and needs manual intervention: {err}");
                    proc.rollback(&*self.env).await;
                    proc.fail(&err);
                    self.persist(&proc).await;
                    break Outcome::Failed(err);
                }
            }
        };

        self.release_locks(tokens).await;
        self.metrics.finished(outcome.label()).inc();
        outcome
    }

    /// Acquires every lock `proc` needs, all or nothing.
    ///
    /// If any lock is unavailable, the ones already granted are released
    /// before backing off, so two procedures can't deadlock on each other.
    async fn acquire_locks(&self, proc: &P) -> Vec<LockToken> {
        let requests = proc.lock_requests();
        let mut retry = self.retry.clone().into_retry_stream();
        'attempt: loop {
            let mut tokens = Vec::with_capacity(requests.len());
            for request in &requests {
                match request.acquire(&*self.locks, proc.id()).await {
                    Ok(token) => tokens.push(token),
                    Err(err) => {
                        match &err {
                            LockError::Conflict { .. } => {
                                self.metrics.lock_conflicts.inc();
                                debug!("{proc} waiting for locks: {err}");
                            }
                            LockError::External(_) => {
                                warn!("{proc} failed to acquire {request}: {err}");
                            }
                        }
                        self.release_locks(tokens).await;
                        tokio::time::sleep(retry.next_backoff()).await;
                        continue 'attempt;
                    }
                }
            }
            return tokens;
        }
    }

    async fn release_locks(&self, tokens: Vec<LockToken>) {
        for token in tokens.into_iter().rev() {
            let locks = &self.locks;
            self.retry_external("release lock", || locks.release(token))
                .await;
        }
    }

    async fn persist(&self, proc: &P) {
        let id = proc.id();
        let record = proc.encode();
        let store = &self.store;
        self.retry_external("persist procedure", || store.put(id, record.clone()))
            .await;
    }

    async fn retry_external<R, F, WorkFn>(&self, name: &str, mut work_fn: WorkFn) -> R
    where
        F: Future<Output = Result<R, ExternalError>>,
        WorkFn: FnMut() -> F,
    {
        let mut retry = self.retry.clone().into_retry_stream();
        loop {
            match work_fn().await {
                Ok(x) => return x,
                Err(err) => {
                    self.metrics.store_failures.inc();
                    let backoff = retry.next_backoff();
                    warn!(
                        "external operation {} failed, retrying in {:?}: {}",
                        name, backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn event(name: &str) -> EventKey {
        EventKey(name.to_owned())
    }

    fn waiters(bus: &EventBus, event: &EventKey) -> usize {
        let events = bus.events.lock().expect("lock poisoned");
        events.get(event).map_or(0, |state| state.waiters)
    }

    async fn until_waiting(bus: &EventBus, event: &EventKey, n: usize) {
        for _ in 0..1_000 {
            if waiters(bus, event) == n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {n} waiters on {event}");
    }

    #[tokio::test]
    async fn wake_resumes_every_waiter() {
        crate::init_test_logging();
        let bus = Arc::new(EventBus::default());
        let go = event("go");
        let spawn_waiter = || {
            let bus = Arc::clone(&bus);
            let go = go.clone();
            tokio::spawn(async move { bus.wait(&go).await })
        };
        let first = vec![spawn_waiter(), spawn_waiter(), spawn_waiter()];
        until_waiting(&bus, &go, 3).await;

        bus.wake(&go);
        for waiter in first {
            tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("waiter was resumed")
                .expect("waiter did not panic");
        }
        assert_eq!(bus.len(), 0);

        // The event can be waited on and woken again.
        let second = spawn_waiter();
        until_waiting(&bus, &go, 1).await;
        bus.wake(&go);
        tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("waiter was resumed")
            .expect("waiter did not panic");
        assert_eq!(bus.len(), 0);
    }

    #[tokio::test]
    async fn early_wakes_are_kept_until_consumed() {
        let bus = EventBus::default();
        let go = event("go");
        bus.wake(&go);
        bus.wake(&go);
        assert_eq!(bus.len(), 1);

        // Returns right away.
        bus.wait(&go).await;
        assert_eq!(bus.len(), 0);

        // Both wakes collapsed into one, so the next waiter parks. Giving up
        // on it leaves nothing behind.
        let parked = tokio::time::timeout(Duration::from_millis(20), bus.wait(&go)).await;
        assert!(parked.is_err());
        assert_eq!(bus.len(), 0);
    }

    #[tokio::test]
    async fn stray_wakes_are_bounded() {
        let bus = EventBus::default();
        for i in 0..MAX_PENDING_WAKES + 10 {
            bus.wake(&event(&format!("e{i}")));
        }
        assert_eq!(bus.len(), MAX_PENDING_WAKES);

        bus.wait(&event("e0")).await;
        assert_eq!(bus.len(), MAX_PENDING_WAKES - 1);
    }
}
