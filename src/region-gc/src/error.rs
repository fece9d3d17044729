// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Region GC errors.

use std::io;

use crate::procedure::ProcId;

/// A failure of an external collaborator (the file archive, the metadata
/// store, the lock authority, ...).
///
/// These are always considered transient: the operation that hit one is
/// retried until it succeeds.
#[derive(Debug, thiserror::Error)]
#[error("external operation failed: {inner:#}")]
pub struct ExternalError {
    #[from]
    inner: anyhow::Error,
}

impl ExternalError {
    /// Constructs an [`ExternalError`] from a message.
    pub fn msg<M>(msg: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        ExternalError {
            inner: anyhow::Error::msg(msg),
        }
    }
}

impl From<io::Error> for ExternalError {
    fn from(err: io::Error) -> Self {
        ExternalError {
            inner: anyhow::Error::new(err),
        }
    }
}

/// A persisted procedure record that could not be decoded.
///
/// This indicates corruption or version skew and is never retried.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed procedure record: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("unexpected procedure kind {found:?}, expected {expected:?}")]
    UnknownKind {
        expected: &'static str,
        found: String,
    },
    #[error("unknown procedure state number {0}")]
    UnknownState(i32),
    #[error("missing value for `{0}`")]
    MissingField(&'static str),
    #[error("record stored under {stored} claims to be {found}")]
    IdMismatch { stored: ProcId, found: ProcId },
}

/// A non-retryable defect observed while stepping a procedure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("procedure {0} was stepped after it failed")]
    SteppedAfterFailure(ProcId),
    #[error("procedure {id} cannot move from {from} to {to}")]
    ForbiddenTransition {
        id: ProcId,
        from: String,
        to: String,
    },
}

/// An invalid [`RegionGcConfig`](crate::RegionGcConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_error_display() {
        let err = ExternalError::from(io::Error::new(io::ErrorKind::TimedOut, "archive timed out"));
        assert_eq!(err.to_string(), "external operation failed: archive timed out");

        let err = ExternalError::from(anyhow::anyhow!("meta down").context("deleting region"));
        assert_eq!(
            err.to_string(),
            "external operation failed: deleting region: meta down"
        );
    }
}
