// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The contract between a procedure and the executor that drives it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CodecError, FatalError};
use crate::lock::LockRequest;

/// An opaque procedure identifier, assigned by the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcId(pub u64);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={}", self.0)
    }
}

/// Names an external event that a suspended procedure is waiting for.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey(pub String);

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the executor should do after a step.
///
/// Only [`Flow::Fatal`] is a failure. [`Flow::Retry`], [`Flow::Suspend`] and
/// [`Flow::Yield`] are scheduling signals: the procedure is healthy and will
/// be stepped again in its current state.
#[derive(Debug, PartialEq)]
pub enum Flow<S> {
    /// The procedure moved to the given state and has more work to do.
    Advance(S),
    /// The step hit a transient error. Step again, in the same state, after
    /// `backoff`.
    Retry { backoff: Duration },
    /// Park the procedure until the event fires.
    Suspend(EventKey),
    /// Let other ready procedures run first, then step again promptly.
    Yield,
    /// The procedure is complete and must not be stepped again.
    Done,
    /// The procedure hit a non-retryable defect.
    Fatal(FatalError),
}

impl<S> Flow<S> {
    /// A name for this outcome, suitable as a metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Flow::Advance(_) => "advance",
            Flow::Retry { .. } => "retry",
            Flow::Suspend(_) => "suspend",
            Flow::Yield => "yield",
            Flow::Done => "done",
            Flow::Fatal(_) => "fatal",
        }
    }
}

/// A persisted, resumable state machine.
///
/// An executor guarantees that it holds every lock in
/// [`Procedure::lock_requests`] before the first call to [`Procedure::step`],
/// that it never steps the same procedure concurrently, and that it persists
/// [`Procedure::encode`] after every step. After a crash the procedure is
/// rebuilt with [`Procedure::decode`] and stepped from its persisted state.
#[async_trait]
pub trait Procedure: fmt::Debug + fmt::Display + Send + Sync + Sized + 'static {
    /// The procedure's step marker.
    type State: fmt::Debug + Send;
    /// The collaborators a step may call into.
    type Env: Send + Sync + 'static;

    fn id(&self) -> ProcId;

    /// The locks this procedure needs, in acquisition order.
    fn lock_requests(&self) -> Vec<LockRequest>;

    /// Whether the procedure completed successfully.
    fn is_done(&self) -> bool;

    /// Whether the procedure hit a fatal defect and must not run again.
    fn is_failed(&self) -> bool;

    /// Executes the current state.
    async fn step(&mut self, env: &Self::Env) -> Flow<Self::State>;

    /// Undoes the work of the current state after a fatal error.
    async fn rollback(&mut self, env: &Self::Env);

    /// Marks the procedure as failed because of `err`.
    fn fail(&mut self, err: &FatalError);

    /// Serializes the procedure for the procedure store.
    fn encode(&self) -> Bytes;

    /// Reconstructs a procedure from the bytes produced by [`Self::encode`].
    fn decode(buf: &[u8]) -> Result<Self, CodecError>;
}
