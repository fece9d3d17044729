// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::prelude::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::config::deserialize_duration;

/// Configures a retry operation.
///
/// There's intentionally no cap on the number of attempts: everything this
/// crate retries is mandatory cleanup that must eventually succeed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// The initial backoff for the exponential backoff retries.
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial_backoff: Duration,
    /// The backoff multiplier.
    pub multiplier: u32,
    /// Clamps the maximum backoff for the retry operation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub clamp_backoff: Duration,
    /// A seed for the random jitter.
    pub seed: u64,
}

impl RetryConfig {
    /// The default retry configuration.
    ///
    /// Uses the given SystemTime to initialize the seed for random jitter.
    pub fn defaults(now: SystemTime) -> Self {
        RetryConfig {
            // A power of two that's close to the latency of a metadata store
            // round trip.
            initial_backoff: Duration::from_millis(4),
            multiplier: 2,
            clamp_backoff: Duration::from_secs(16),
            seed: now
                .duration_since(UNIX_EPOCH)
                .map_or(0, |x| u64::from(x.subsec_nanos())),
        }
    }

    /// Convert into [`RetryStream`]
    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let backoff = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            attempt: 0,
            backoff,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::defaults(SystemTime::now())
    }
}

/// A series of exponential, jittered, clamped backoffs.
///
/// Unlike a sleeping retry loop, the stream only hands out durations: the
/// caller decides how to wait (a procedure hands the backoff to its executor).
#[derive(Debug)]
pub struct RetryStream {
    cfg: RetryConfig,
    rng: SmallRng,
    attempt: usize,
    backoff: Duration,
}

impl RetryStream {
    /// How many backoffs have been handed out.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The next backoff (without jitter for easy printing in logs).
    pub fn next_sleep(&self) -> Duration {
        self.backoff
    }

    /// Returns the next backoff in the series, with jitter applied, and
    /// advances the series.
    pub fn next_backoff(&mut self) -> Duration {
        let jitter = self.rng.random_range(0.9..=1.1);
        let backoff = self.next_sleep().mul_f64(jitter);
        self.advance();
        backoff
    }

    fn advance(&mut self) {
        self.attempt += 1;
        self.backoff = std::cmp::min(
            self.backoff.saturating_mul(self.cfg.multiplier),
            self.cfg.clamp_backoff,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_stream() {
        #[track_caller]
        fn testcase(r: RetryConfig, expected_sleep_ms: Vec<u64>) {
            let mut r = r.into_retry_stream();
            for expected_sleep_ms in expected_sleep_ms {
                let expected = Duration::from_millis(expected_sleep_ms);
                let actual = r.next_sleep();
                assert_eq!(actual, expected);
                r.advance();
            }
        }

        testcase(
            RetryConfig {
                initial_backoff: Duration::from_millis(1_200),
                multiplier: 2,
                clamp_backoff: Duration::from_secs(16),
                seed: 0,
            },
            vec![1_200, 2_400, 4_800, 9_600, 16_000, 16_000],
        );
        testcase(
            RetryConfig {
                initial_backoff: Duration::from_millis(100),
                multiplier: 3,
                clamp_backoff: Duration::from_secs(1),
                seed: 0,
            },
            vec![100, 300, 900, 1_000, 1_000],
        );
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut r = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            multiplier: 1,
            clamp_backoff: Duration::from_millis(100),
            seed: 42,
        }
        .into_retry_stream();
        for attempt in 0..100 {
            assert_eq!(r.attempt(), attempt);
            let backoff = r.next_backoff();
            assert!(backoff >= Duration::from_millis(89), "{backoff:?}");
            assert!(backoff <= Duration::from_millis(111), "{backoff:?}");
        }
    }

    #[test]
    fn zero_backoff() {
        let mut r = RetryConfig {
            initial_backoff: Duration::ZERO,
            multiplier: 2,
            clamp_backoff: Duration::ZERO,
            seed: 0,
        }
        .into_retry_stream();
        for _ in 0..10 {
            assert_eq!(r.next_backoff(), Duration::ZERO);
        }
    }
}
