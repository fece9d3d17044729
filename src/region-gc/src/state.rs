// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The states of a region GC procedure.

use std::fmt;

/// A step of a [`RegionGcProcedure`](crate::RegionGcProcedure).
///
/// States are ordered by progress: a procedure only ever moves to a greater
/// state. Each state is persisted as a stable number (see [`Self::number`]),
/// which must never be reused or renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcRegionState {
    /// Nothing to do yet; a hook for pre-checks.
    Prepare,
    /// Move the region's data files into the archive.
    Archive,
    /// Remove every bookkeeping entry that still refers to the region.
    PurgeMetadata,
    /// All work is complete.
    Done,
    /// The procedure hit a non-retryable defect and needs an operator.
    Failed,
}

impl GcRegionState {
    /// The state every procedure starts in.
    pub const INITIAL: GcRegionState = GcRegionState::Prepare;

    pub const ALL: [GcRegionState; 5] = [
        GcRegionState::Prepare,
        GcRegionState::Archive,
        GcRegionState::PurgeMetadata,
        GcRegionState::Done,
        GcRegionState::Failed,
    ];

    /// The number this state is persisted as.
    pub fn number(&self) -> i32 {
        match self {
            GcRegionState::Prepare => 1,
            GcRegionState::Archive => 2,
            GcRegionState::PurgeMetadata => 3,
            GcRegionState::Done => 4,
            GcRegionState::Failed => 5,
        }
    }

    /// The inverse of [`Self::number`]. Returns `None` for numbers that don't
    /// belong to any state.
    pub fn from_number(number: i32) -> Option<GcRegionState> {
        match number {
            1 => Some(GcRegionState::Prepare),
            2 => Some(GcRegionState::Archive),
            3 => Some(GcRegionState::PurgeMetadata),
            4 => Some(GcRegionState::Done),
            5 => Some(GcRegionState::Failed),
            _ => None,
        }
    }

    /// The state a successful step moves to, if any.
    pub fn successor(&self) -> Option<GcRegionState> {
        match self {
            GcRegionState::Prepare => Some(GcRegionState::Archive),
            GcRegionState::Archive => Some(GcRegionState::PurgeMetadata),
            GcRegionState::PurgeMetadata => Some(GcRegionState::Done),
            GcRegionState::Done | GcRegionState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GcRegionState::Done | GcRegionState::Failed)
    }

    /// A lowercase name, suitable as a metric label.
    pub fn label(&self) -> &'static str {
        match self {
            GcRegionState::Prepare => "prepare",
            GcRegionState::Archive => "archive",
            GcRegionState::PurgeMetadata => "purge_metadata",
            GcRegionState::Done => "done",
            GcRegionState::Failed => "failed",
        }
    }
}

impl fmt::Display for GcRegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcRegionState::Prepare => "PREPARE",
            GcRegionState::Archive => "ARCHIVE",
            GcRegionState::PurgeMetadata => "PURGE_METADATA",
            GcRegionState::Done => "DONE",
            GcRegionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
