// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementations for testing and single-process deployments.
//!
//! Every implementation can be told to fail through a [`FailureInjector`],
//! and can record the operations it performs into a shared [`Journal`] so
//! tests can assert on the order of side effects across collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::capability::{
    AssignmentRegistry, FileArchive, MetadataStore, PlacementHints, ServerTracker,
};
use crate::error::ExternalError;
use crate::executor::ProcedureStore;
use crate::lock::{LockAuthority, LockError, LockToken};
use crate::procedure::ProcId;
use crate::region::{RegionIdentity, RegionName, TableId};

/// Makes operations of an in-memory implementation fail on demand.
#[derive(Debug, Default)]
pub struct FailureInjector {
    fail_next: AtomicU64,
    fail_always: AtomicBool,
}

impl FailureInjector {
    /// Fails the next `n` operations.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every operation until called again with `false`.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Stops injecting failures.
    pub fn clear(&self) {
        self.fail_next(0);
        self.fail_always(false);
    }

    fn check(&self, op: &str) -> Result<(), ExternalError> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(ExternalError::msg(format!("injected failure: {op}")));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ExternalError::msg(format!("injected failure: {op}")));
        }
        Ok(())
    }
}

/// An ordered record of the side effects of in-memory collaborators.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("lock poisoned").clone()
    }

    fn record(&self, entry: String) {
        self.entries.lock().expect("lock poisoned").push(entry);
    }
}

#[derive(Debug, Default)]
struct MemArchiveState {
    live: BTreeSet<RegionName>,
    archived: BTreeSet<RegionName>,
}

/// An in-memory implementation of [`FileArchive`].
#[derive(Debug, Default)]
pub struct MemFileArchive {
    state: Mutex<MemArchiveState>,
    exists_failures: FailureInjector,
    archive_failures: FailureInjector,
    archive_calls: AtomicUsize,
    journal: Option<Arc<Journal>>,
}

impl MemFileArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Arc<Journal>) -> Self {
        MemFileArchive {
            journal: Some(journal),
            ..Default::default()
        }
    }

    /// Creates a data directory for `region`.
    pub fn add_region(&self, region: &RegionIdentity) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.live.insert(region.name());
    }

    pub fn has_data(&self, region: &RegionIdentity) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.live.contains(&region.name())
    }

    pub fn is_archived(&self, region: &RegionIdentity) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.archived.contains(&region.name())
    }

    /// The number of successful [`FileArchive::archive`] calls.
    pub fn archive_calls(&self) -> usize {
        self.archive_calls.load(Ordering::SeqCst)
    }

    pub fn exists_failures(&self) -> &FailureInjector {
        &self.exists_failures
    }

    pub fn archive_failures(&self) -> &FailureInjector {
        &self.archive_failures
    }
}

#[async_trait]
impl FileArchive for MemFileArchive {
    async fn exists(&self, region: &RegionIdentity) -> Result<bool, ExternalError> {
        self.exists_failures.check("exists")?;
        Ok(self.has_data(region))
    }

    async fn archive(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.archive_failures.check("archive")?;
        let name = region.name();
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.live.remove(&name);
            state.archived.insert(name.clone());
        }
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(format!("archive {name}"));
        }
        Ok(())
    }
}

/// A set of regions known to some bookkeeping system.
///
/// Implements every region-keyed collaborator: [`MetadataStore`],
/// [`AssignmentRegistry`], [`ServerTracker`] and [`PlacementHints`]. Use one
/// instance per collaborator.
#[derive(Debug)]
pub struct MemRegionTable {
    name: &'static str,
    regions: Mutex<BTreeSet<RegionName>>,
    failures: FailureInjector,
    removals: AtomicUsize,
    journal: Option<Arc<Journal>>,
}

impl MemRegionTable {
    pub fn new(name: &'static str) -> Self {
        MemRegionTable {
            name,
            regions: Mutex::new(BTreeSet::new()),
            failures: FailureInjector::default(),
            removals: AtomicUsize::new(0),
            journal: None,
        }
    }

    pub fn with_journal(name: &'static str, journal: Arc<Journal>) -> Self {
        MemRegionTable {
            journal: Some(journal),
            ..Self::new(name)
        }
    }

    pub fn insert(&self, region: &RegionIdentity) {
        self.regions
            .lock()
            .expect("lock poisoned")
            .insert(region.name());
    }

    pub fn contains(&self, region: &RegionIdentity) -> bool {
        self.regions
            .lock()
            .expect("lock poisoned")
            .contains(&region.name())
    }

    /// The number of successful removals, including removals of regions that
    /// were already absent.
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    fn remove(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.failures.check(self.name)?;
        let name = region.name();
        let existed = self
            .regions
            .lock()
            .expect("lock poisoned")
            .remove(&name);
        if !existed {
            debug!("{}: region {} already absent", self.name, name);
        }
        self.removals.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(format!("{} {name}", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemRegionTable {
    async fn delete_region(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.remove(region)
    }
}

#[async_trait]
impl AssignmentRegistry for MemRegionTable {
    async fn forget_region(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.remove(region)
    }
}

#[async_trait]
impl ServerTracker for MemRegionTable {
    async fn remove_region(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.remove(region)
    }
}

#[async_trait]
impl PlacementHints for MemRegionTable {
    async fn clear_favored_nodes(&self, region: &RegionIdentity) -> Result<(), ExternalError> {
        self.remove(region)
    }
}

#[derive(Debug)]
enum Held {
    SharedTable(TableId),
    ExclusiveTable(TableId),
    ExclusiveRegion(RegionName),
}

#[derive(Debug, Default)]
struct TableLocks {
    shared: BTreeMap<LockToken, ProcId>,
    exclusive: Option<(LockToken, ProcId)>,
}

#[derive(Debug, Default)]
struct LockTable {
    next_token: u64,
    tables: BTreeMap<TableId, TableLocks>,
    regions: BTreeMap<RegionName, (LockToken, ProcId)>,
    held: BTreeMap<LockToken, Held>,
}

impl LockTable {
    fn mint(&mut self, held: Held) -> LockToken {
        self.next_token += 1;
        let token = LockToken(self.next_token);
        self.held.insert(token, held);
        token
    }
}

/// An in-memory implementation of [`LockAuthority`].
///
/// Locks live only as long as this value: a process restart loses them,
/// which is exactly what replayed procedures expect.
#[derive(Debug, Default)]
pub struct MemLockAuthority {
    table: Mutex<LockTable>,
}

impl MemLockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `owner` an exclusive lock on `table`, as a schema change would
    /// take. Conflicts with every other lock on the table.
    pub fn acquire_exclusive_table(
        &self,
        table: &TableId,
        owner: ProcId,
    ) -> Result<LockToken, LockError> {
        let mut locks = self.table.lock().expect("lock poisoned");
        let entry = locks.tables.entry(table.clone()).or_default();
        if let Some((_, holder)) = entry.exclusive {
            return Err(conflict(format!("exclusive lock on table {table}"), holder));
        }
        if let Some(holder) = entry.shared.values().next() {
            return Err(conflict(
                format!("exclusive lock on table {table}"),
                *holder,
            ));
        }
        let token = locks.mint(Held::ExclusiveTable(table.clone()));
        locks
            .tables
            .get_mut(table)
            .expect("inserted above")
            .exclusive = Some((token, owner));
        Ok(token)
    }

    /// The holder of the exclusive lock on `region`, if any.
    pub fn region_holder(&self, region: &RegionName) -> Option<ProcId> {
        let locks = self.table.lock().expect("lock poisoned");
        locks.regions.get(region).map(|(_, holder)| *holder)
    }

    /// The procedures holding a shared lock on `table`.
    pub fn shared_holders(&self, table: &TableId) -> Vec<ProcId> {
        let locks = self.table.lock().expect("lock poisoned");
        locks
            .tables
            .get(table)
            .map(|t| t.shared.values().copied().collect())
            .unwrap_or_default()
    }

    /// The number of outstanding locks.
    pub fn held(&self) -> usize {
        self.table.lock().expect("lock poisoned").held.len()
    }
}

fn conflict(what: String, holder: ProcId) -> LockError {
    LockError::Conflict { what, holder }
}

#[async_trait]
impl LockAuthority for MemLockAuthority {
    async fn acquire_shared(
        &self,
        table: &TableId,
        owner: ProcId,
    ) -> Result<LockToken, LockError> {
        let mut locks = self.table.lock().expect("lock poisoned");
        if let Some((_, holder)) = locks.tables.get(table).and_then(|t| t.exclusive) {
            return Err(conflict(format!("shared lock on table {table}"), holder));
        }
        let token = locks.mint(Held::SharedTable(table.clone()));
        locks
            .tables
            .entry(table.clone())
            .or_default()
            .shared
            .insert(token, owner);
        Ok(token)
    }

    async fn acquire_exclusive(
        &self,
        region: &RegionName,
        owner: ProcId,
    ) -> Result<LockToken, LockError> {
        let mut locks = self.table.lock().expect("lock poisoned");
        if let Some((_, holder)) = locks.regions.get(region) {
            return Err(conflict(
                format!("exclusive lock on region {region}"),
                *holder,
            ));
        }
        let token = locks.mint(Held::ExclusiveRegion(region.clone()));
        locks.regions.insert(region.clone(), (token, owner));
        Ok(token)
    }

    async fn release(&self, token: LockToken) -> Result<(), ExternalError> {
        let mut locks = self.table.lock().expect("lock poisoned");
        match locks.held.remove(&token) {
            Some(Held::SharedTable(table)) => {
                if let Some(t) = locks.tables.get_mut(&table) {
                    t.shared.remove(&token);
                }
            }
            Some(Held::ExclusiveTable(table)) => {
                if let Some(t) = locks.tables.get_mut(&table) {
                    t.exclusive = None;
                }
            }
            Some(Held::ExclusiveRegion(region)) => {
                locks.regions.remove(&region);
            }
            None => debug!("releasing unknown lock {:?}", token),
        }
        Ok(())
    }
}

/// An in-memory implementation of [`ProcedureStore`].
///
/// Share one between successive executors to simulate a restart.
#[derive(Debug, Default)]
pub struct MemProcedureStore {
    records: Mutex<BTreeMap<ProcId, Bytes>>,
    failures: FailureInjector,
}

impl MemProcedureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ProcId) -> Option<Bytes> {
        self.records
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }
}

#[async_trait]
impl ProcedureStore for MemProcedureStore {
    async fn put(&self, id: ProcId, record: Bytes) -> Result<(), ExternalError> {
        self.failures.check("put")?;
        self.records
            .lock()
            .expect("lock poisoned")
            .insert(id, record);
        Ok(())
    }

    async fn delete(&self, id: ProcId) -> Result<(), ExternalError> {
        self.failures.check("delete")?;
        self.records.lock().expect("lock poisoned").remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(ProcId, Bytes)>, ExternalError> {
        self.failures.check("list")?;
        let records = self.records.lock().expect("lock poisoned");
        Ok(records
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect())
    }
}
