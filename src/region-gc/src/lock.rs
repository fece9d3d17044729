// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Table and region locks.
//!
//! Procedures that touch a region take a shared lock on its table, which
//! admits other region procedures but keeps out table-level schema changes,
//! and an exclusive lock on the region itself, which keeps out every other
//! procedure (split, merge, another GC) on that region.

use std::fmt;

use async_trait::async_trait;

use crate::error::ExternalError;
use crate::procedure::ProcId;
use crate::region::{RegionName, TableId};

/// A lock a procedure needs before it can run.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRequest {
    SharedTable(TableId),
    ExclusiveRegion(RegionName),
}

impl LockRequest {
    /// Asks `authority` to grant this lock to `owner`.
    pub async fn acquire(
        &self,
        authority: &dyn LockAuthority,
        owner: ProcId,
    ) -> Result<LockToken, LockError> {
        match self {
            LockRequest::SharedTable(table) => authority.acquire_shared(table, owner).await,
            LockRequest::ExclusiveRegion(region) => {
                authority.acquire_exclusive(region, owner).await
            }
        }
    }
}

impl fmt::Display for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockRequest::SharedTable(table) => write!(f, "shared lock on table {table}"),
            LockRequest::ExclusiveRegion(region) => {
                write!(f, "exclusive lock on region {region}")
            }
        }
    }
}

/// Proof of a granted lock, handed back to release it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockToken(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is currently held in a conflicting mode.
    #[error("{what} conflicts with a lock held by {holder}")]
    Conflict { what: String, holder: ProcId },
    #[error(transparent)]
    External(#[from] ExternalError),
}

/// Grants table and region locks.
#[async_trait]
pub trait LockAuthority: fmt::Debug + Send + Sync {
    /// Grants `owner` a shared lock on `table`, unless the table is locked
    /// exclusively.
    async fn acquire_shared(&self, table: &TableId, owner: ProcId)
        -> Result<LockToken, LockError>;

    /// Grants `owner` the exclusive lock on `region`, unless anyone holds it.
    async fn acquire_exclusive(
        &self,
        region: &RegionName,
        owner: ProcId,
    ) -> Result<LockToken, LockError>;

    /// Releases a lock. Releasing an unknown token is a no-op.
    async fn release(&self, token: LockToken) -> Result<(), ExternalError>;
}
