// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus monitoring metrics for region GC.
///
/// Intentionally not Clone because we expect this to be passed around in an
/// Arc.
pub struct Metrics {
    /// Steps executed, by outcome.
    steps: IntCounterVec,
    /// Transient step failures, by the state that failed.
    retries: IntCounterVec,
    /// Procedures that reached a terminal state, by outcome.
    finished: IntCounterVec,
    /// Persisted records that could not be decoded on recovery.
    pub defective_records: IntCounter,
    /// Lock acquisitions that found the lock held by someone else.
    pub lock_conflicts: IntCounter,
    /// Failed writes to the procedure store.
    pub store_failures: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Returns a new [Metrics] instance connected to the given registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let steps = IntCounterVec::new(
            Opts::new("mz_region_gc_steps_count", "count of procedure steps executed"),
            &["outcome"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new(
                "mz_region_gc_retries_count",
                "count of steps that failed with a transient error",
            ),
            &["state"],
        )?;
        let finished = IntCounterVec::new(
            Opts::new(
                "mz_region_gc_finished_count",
                "count of procedures that reached a terminal state",
            ),
            &["outcome"],
        )?;
        let defective_records = IntCounter::new(
            "mz_region_gc_defective_records_count",
            "count of persisted procedure records that failed to decode",
        )?;
        let lock_conflicts = IntCounter::new(
            "mz_region_gc_lock_conflicts_count",
            "count of lock acquisitions that found the lock held",
        )?;
        let store_failures = IntCounter::new(
            "mz_region_gc_store_failures_count",
            "count of failed procedure store operations",
        )?;

        registry.register(Box::new(steps.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(finished.clone()))?;
        registry.register(Box::new(defective_records.clone()))?;
        registry.register(Box::new(lock_conflicts.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;

        Ok(Metrics {
            steps,
            retries,
            finished,
            defective_records,
            lock_conflicts,
            store_failures,
        })
    }

    pub fn steps(&self, outcome: &str) -> IntCounter {
        self.steps.with_label_values(&[outcome])
    }

    pub fn retries(&self, state: &str) -> IntCounter {
        self.retries.with_label_values(&[state])
    }

    pub fn finished(&self, outcome: &str) -> IntCounter {
        self.finished.with_label_values(&[outcome])
    }
}
