// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Garbage collection of regions that are no longer referenced.
//!
//! A region is a contiguous key range of a table. Once a split or merge has
//! replaced a region and an external janitor has decided that nothing refers
//! to it anymore, a [`RegionGcProcedure`] is scheduled to clean it up. The
//! procedure is a small persisted state machine:
//!
//! ```text
//! PREPARE -> ARCHIVE -> PURGE_METADATA -> DONE
//! ```
//!
//! It is driven by a [`ProcedureExecutor`], which holds a shared lock on the
//! owning table and an exclusive lock on the region for the procedure's whole
//! lifetime, persists the procedure after every step, and replays persisted
//! procedures after a restart. Every step is idempotent, so replaying a step
//! that had already (partially) run before a crash is safe.
//!
//! Failures talking to the file archive or the metadata collaborators are
//! transient by definition: the procedure stays in its current state and is
//! retried, without bound, using a configurable backoff. Corrupt persisted
//! records are the only fatal errors and are surfaced to operators instead of
//! being retried.

pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod gc;
pub mod lock;
pub mod mem;
pub mod metrics;
pub mod procedure;
pub mod region;
pub mod retry;
pub mod state;

pub use crate::config::RegionGcConfig;
pub use crate::error::{CodecError, ExternalError, FatalError};
pub use crate::executor::{Outcome, ProcedureExecutor, ProcedureStore, Recovery};
pub use crate::gc::{GcRegionEnv, RegionGcProcedure};
pub use crate::procedure::{EventKey, Flow, ProcId, Procedure};
pub use crate::region::{RegionIdentity, RegionName, TableId};
pub use crate::state::GcRegionState;

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
