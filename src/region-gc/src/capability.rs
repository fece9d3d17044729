// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The collaborators a region GC procedure calls into.
//!
//! Each is responsible for its own internal consistency; the procedure
//! doesn't lock them. Every deletion must be idempotent: removing something
//! that is already gone succeeds, because a step may be re-run after a crash
//! or after a later sub-step failed.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::ExternalError;
use crate::region::RegionIdentity;

/// Where data files of dead regions are moved to.
#[async_trait]
pub trait FileArchive: Debug + Send + Sync {
    /// Whether the region still has a data directory to archive.
    async fn exists(&self, region: &RegionIdentity) -> Result<bool, ExternalError>;

    /// Moves the region's data files into the archive.
    async fn archive(&self, region: &RegionIdentity) -> Result<(), ExternalError>;
}

/// The canonical table recording every region and its assignment.
#[async_trait]
pub trait MetadataStore: Debug + Send + Sync {
    async fn delete_region(&self, region: &RegionIdentity) -> Result<(), ExternalError>;
}

/// The in-memory registry of region states and assignments.
#[async_trait]
pub trait AssignmentRegistry: Debug + Send + Sync {
    async fn forget_region(&self, region: &RegionIdentity) -> Result<(), ExternalError>;
}

/// Per-server bookkeeping of the regions each server reported.
#[async_trait]
pub trait ServerTracker: Debug + Send + Sync {
    async fn remove_region(&self, region: &RegionIdentity) -> Result<(), ExternalError>;
}

/// Favored-node placement hints.
#[async_trait]
pub trait PlacementHints: Debug + Send + Sync {
    async fn clear_favored_nodes(&self, region: &RegionIdentity) -> Result<(), ExternalError>;
}
