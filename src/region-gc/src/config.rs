// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration for region GC.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Configuration for region GC procedures and the executor that runs them.
///
/// Every field has a default, so a config only needs to mention what it
/// overrides. Durations are written in [`humantime`] syntax, e.g. `"250ms"`.
///
/// ```json
/// {
///     "step_retry": { "initial_backoff": "10ms", "clamp_backoff": "30s" },
///     "executor_slots": 8
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionGcConfig {
    /// Backoff between attempts of a step that failed with a transient error.
    pub step_retry: RetryConfig,
    /// Backoff between attempts to acquire a procedure's locks and to write
    /// to the procedure store.
    pub executor_retry: RetryConfig,
    /// The number of procedure steps that may execute concurrently.
    pub executor_slots: usize,
}

impl Default for RegionGcConfig {
    fn default() -> Self {
        RegionGcConfig {
            step_retry: RetryConfig::default(),
            executor_retry: RetryConfig::default(),
            executor_slots: 4,
        }
    }
}

impl RegionGcConfig {
    /// Parses and validates a JSON config.
    pub fn parse_json(json: &str) -> Result<Self, ConfigError> {
        let config: RegionGcConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor_slots == 0 {
            return Err(ConfigError::Invalid(
                "executor_slots must be at least 1".into(),
            ));
        }
        for (name, retry) in [
            ("step_retry", &self.step_retry),
            ("executor_retry", &self.executor_retry),
        ] {
            if retry.multiplier == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.multiplier must be at least 1"
                )));
            }
            if retry.clamp_backoff < retry.initial_backoff {
                return Err(ConfigError::Invalid(format!(
                    "{name}.clamp_backoff ({:?}) is less than {name}.initial_backoff ({:?})",
                    retry.clamp_backoff, retry.initial_backoff
                )));
            }
        }
        Ok(())
    }
}

/// Deserializes a [`Duration`] written in [`humantime`] syntax.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}
