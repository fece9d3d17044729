// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The region GC state machine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::capability::{
    AssignmentRegistry, FileArchive, MetadataStore, PlacementHints, ServerTracker,
};
use crate::codec::{ProtoProcedureRecord, RustType};
use crate::config::RegionGcConfig;
use crate::error::{CodecError, ExternalError, FatalError};
use crate::lock::LockRequest;
use crate::metrics::Metrics;
use crate::procedure::{Flow, ProcId, Procedure};
use crate::region::RegionIdentity;
use crate::retry::{RetryConfig, RetryStream};
use crate::state::GcRegionState;

/// Everything a [`RegionGcProcedure`] step may call into.
///
/// The assignment registry, server tracker and placement hints are optional:
/// a deployment that doesn't run one of them simply skips that part of the
/// purge. The archive and the metadata store are always required.
#[derive(Debug)]
pub struct GcRegionEnv {
    pub archive: Arc<dyn FileArchive>,
    pub metadata: Arc<dyn MetadataStore>,
    pub assignments: Option<Arc<dyn AssignmentRegistry>>,
    pub servers: Option<Arc<dyn ServerTracker>>,
    pub placement: Option<Arc<dyn PlacementHints>>,
    pub retry: RetryConfig,
    pub metrics: Arc<Metrics>,
}

impl GcRegionEnv {
    pub fn new(
        config: &RegionGcConfig,
        archive: Arc<dyn FileArchive>,
        metadata: Arc<dyn MetadataStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        GcRegionEnv {
            archive,
            metadata,
            assignments: None,
            servers: None,
            placement: None,
            retry: config.step_retry.clone(),
            metrics,
        }
    }

    pub fn with_assignments(mut self, assignments: Arc<dyn AssignmentRegistry>) -> Self {
        self.assignments = Some(assignments);
        self
    }

    pub fn with_server_tracker(mut self, servers: Arc<dyn ServerTracker>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn with_placement_hints(mut self, placement: Arc<dyn PlacementHints>) -> Self {
        self.placement = Some(placement);
        self
    }
}

/// The work a state performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Nothing,
    Archive,
    PurgeMetadata,
}

/// An entry of the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    /// Perform `action`; on success move to `next`, on failure stay put.
    Run {
        action: Action,
        next: GcRegionState,
    },
    /// Nothing left to do.
    Complete,
    /// The procedure failed and must not run again.
    Defect,
}

/// The transition table. Adding a state without deciding what it does is a
/// compile error.
fn transition(state: GcRegionState) -> Transition {
    match state {
        // Nothing to do to prepare.
        GcRegionState::Prepare => Transition::Run {
            action: Action::Nothing,
            next: GcRegionState::Archive,
        },
        GcRegionState::Archive => Transition::Run {
            action: Action::Archive,
            next: GcRegionState::PurgeMetadata,
        },
        GcRegionState::PurgeMetadata => Transition::Run {
            action: Action::PurgeMetadata,
            next: GcRegionState::Done,
        },
        GcRegionState::Done => Transition::Complete,
        GcRegionState::Failed => Transition::Defect,
    }
}

/// Garbage collects a region that is no longer in use because it was split
/// or merged away.
///
/// The caller decides whether it is time to GC the region; this procedure
/// doesn't check. It runs under a shared lock on the table and the exclusive
/// lock on the region.
///
/// There is intentionally no way to construct a procedure in an arbitrary
/// state: procedures start in [`GcRegionState::INITIAL`] via [`Self::new`],
/// or come back from the procedure store via [`Self::decode`].
#[derive(Debug)]
pub struct RegionGcProcedure {
    id: ProcId,
    region: RegionIdentity,
    state: GcRegionState,
    last_error: Option<String>,
    // Not persisted: after a restart backoff starts over.
    retry: Option<RetryStream>,
    span: Span,
}

impl RegionGcProcedure {
    /// The kind tag of persisted records.
    pub const KIND: &'static str = "RegionGcProcedure";

    pub fn new(id: ProcId, region: RegionIdentity) -> Self {
        Self::restore(id, region, GcRegionState::INITIAL, None)
    }

    fn restore(
        id: ProcId,
        region: RegionIdentity,
        state: GcRegionState,
        last_error: Option<String>,
    ) -> Self {
        let span = info_span!("region_gc", pid = id.0, region = %region.short_name());
        RegionGcProcedure {
            id,
            region,
            state,
            last_error,
            retry: None,
            span,
        }
    }

    pub fn region(&self) -> &RegionIdentity {
        &self.region
    }

    pub fn state(&self) -> GcRegionState {
        self.state
    }

    /// The most recent transient error, cleared once the failing state
    /// succeeds.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    async fn execute(&mut self, env: &GcRegionEnv) -> Flow<GcRegionState> {
        trace!("{self} execute state={}", self.state);
        let (action, next) = match transition(self.state) {
            Transition::Run { action, next } => (action, next),
            Transition::Complete => return Flow::Done,
            Transition::Defect => return Flow::Fatal(FatalError::SteppedAfterFailure(self.id)),
        };

        let result = match action {
            Action::Nothing => Ok(()),
            Action::Archive => self.archive(env).await,
            Action::PurgeMetadata => self.purge_metadata(env).await,
        };
        if let Err(err) = result {
            return self.retry_later(env, err);
        }

        self.last_error = None;
        self.retry = None;
        if let Err(err) = self.advance_to(next) {
            return Flow::Fatal(err);
        }
        if next == GcRegionState::Done {
            info!("{self} finished");
            Flow::Done
        } else {
            Flow::Advance(next)
        }
    }

    async fn archive(&self, env: &GcRegionEnv) -> Result<(), ExternalError> {
        // Archiving an already archived region is a no-op, which is what
        // makes this state safe to replay.
        if env.archive.exists(&self.region).await? {
            debug!("archiving region={}", self.region.short_name());
            env.archive.archive(&self.region).await?;
        } else {
            debug!("nothing to archive for region={}", self.region.short_name());
        }
        Ok(())
    }

    async fn purge_metadata(&self, env: &GcRegionEnv) -> Result<(), ExternalError> {
        // The same teardown order as everywhere else a region's bookkeeping
        // is removed. Each deletion is idempotent, so after a partial failure
        // the whole sequence is simply run again.
        if let Some(assignments) = &env.assignments {
            assignments.forget_region(&self.region).await?;
        }
        env.metadata.delete_region(&self.region).await?;
        if let Some(servers) = &env.servers {
            servers.remove_region(&self.region).await?;
        }
        if let Some(placement) = &env.placement {
            placement.clear_favored_nodes(&self.region).await?;
        }
        Ok(())
    }

    fn retry_later(&mut self, env: &GcRegionEnv, err: ExternalError) -> Flow<GcRegionState> {
        let retry = self
            .retry
            .get_or_insert_with(|| env.retry.clone().into_retry_stream());
        let attempt = retry.attempt();
        let backoff = retry.next_backoff();
        warn!(
            "error trying to GC {} in state {}; retrying in {:?} (attempt {}): {}",
            self.region.short_name(),
            self.state,
            backoff,
            attempt,
            err
        );
        env.metrics.retries(self.state.label()).inc();
        self.last_error = Some(err.to_string());
        Flow::Retry { backoff }
    }

    fn advance_to(&mut self, next: GcRegionState) -> Result<(), FatalError> {
        if self.state.successor() != Some(next) {
            return Err(FatalError::ForbiddenTransition {
                id: self.id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

impl fmt::Display for RegionGcProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegionGcProcedure {}, region={}, state={}",
            self.id,
            self.region.short_name(),
            self.state
        )
    }
}

#[async_trait]
impl Procedure for RegionGcProcedure {
    type State = GcRegionState;
    type Env = GcRegionEnv;

    fn id(&self) -> ProcId {
        self.id
    }

    fn lock_requests(&self) -> Vec<LockRequest> {
        vec![
            LockRequest::SharedTable(self.region.table_id().clone()),
            LockRequest::ExclusiveRegion(self.region.name()),
        ]
    }

    fn is_done(&self) -> bool {
        self.state == GcRegionState::Done
    }

    fn is_failed(&self) -> bool {
        self.state == GcRegionState::Failed
    }

    async fn step(&mut self, env: &GcRegionEnv) -> Flow<GcRegionState> {
        let span = self.span.clone();
        self.execute(env).instrument(span).await
    }

    async fn rollback(&mut self, _env: &GcRegionEnv) {
        // Archived files can't be put back, and a region scheduled for GC is
        // unreachable anyway. Nothing to undo.
        debug!(parent: &self.span, "{} rollback is a no-op", self);
    }

    fn fail(&mut self, err: &FatalError) {
        self.state = GcRegionState::Failed;
        self.last_error = Some(err.to_string());
    }

    fn encode(&self) -> Bytes {
        ProtoProcedureRecord {
            kind: Self::KIND.to_owned(),
            proc_id: self.id.0,
            state: self.state.into_proto(),
            region: Some(self.region.into_proto()),
            last_error: self.last_error.clone(),
        }
        .encode_to_vec()
        .into()
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let proto = ProtoProcedureRecord::decode(buf)?;
        if proto.kind != Self::KIND {
            return Err(CodecError::UnknownKind {
                expected: Self::KIND,
                found: proto.kind,
            });
        }
        let state = GcRegionState::from_proto(proto.state)?;
        let region = proto
            .region
            .ok_or(CodecError::MissingField("region"))
            .and_then(RegionIdentity::from_proto)?;
        Ok(Self::restore(
            ProcId(proto.proc_id),
            region,
            state,
            proto.last_error,
        ))
    }
}
