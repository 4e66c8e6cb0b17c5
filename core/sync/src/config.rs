//! Engine configuration and partial updates.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::{Error, Result};

use crate::conflict::{ConflictResolver, ConflictStrategy};
use crate::retry::{RetryBackoff, RetryController};

/// Serde helper storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Delay between scheduler ticks.
    #[serde(with = "duration_ms", rename = "syncIntervalMs")]
    pub sync_interval: Duration,
    /// Failed attempts after which an item is marked failed.
    pub max_retries: u32,
    /// Maximum items drained per tick.
    pub batch_size: usize,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// Bound on a single transmission.
    #[serde(with = "duration_ms", rename = "requestTimeoutMs")]
    pub request_timeout: Duration,
    /// Spacing between attempts of a failed item.
    pub backoff: RetryBackoff,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 10,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            request_timeout: Duration::from_secs(30),
            backoff: RetryBackoff::Fixed,
        }
    }
}

impl SyncConfig {
    /// Check the configuration for values the engine cannot run with.
    ///
    /// Nothing is clamped: any out-of-range value is an error.
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sync_interval must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        RetryController::new(self.max_retries, self.backoff.clone())?;
        Ok(())
    }

    /// Return a copy with every field set in `patch` replaced.
    pub fn merged(&self, patch: &ConfigPatch) -> Self {
        let mut merged = self.clone();
        if let Some(interval) = patch.sync_interval {
            merged.sync_interval = interval;
        }
        if let Some(max_retries) = patch.max_retries {
            merged.max_retries = max_retries;
        }
        if let Some(batch_size) = patch.batch_size {
            merged.batch_size = batch_size;
        }
        if let Some(strategy) = patch.conflict_strategy {
            merged.conflict_strategy = strategy;
        }
        if let Some(timeout) = patch.request_timeout {
            merged.request_timeout = timeout;
        }
        if let Some(backoff) = &patch.backoff {
            merged.backoff = backoff.clone();
        }
        merged
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON and validate it.
    ///
    /// Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Partial configuration update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub sync_interval: Option<Duration>,
    pub max_retries: Option<u32>,
    pub batch_size: Option<usize>,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub request_timeout: Option<Duration>,
    pub backoff: Option<RetryBackoff>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Whether applying this patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Configuration plus the collaborators derived from it, swapped as a unit.
#[derive(Clone)]
pub(crate) struct EngineSettings {
    pub config: SyncConfig,
    pub retry: RetryController,
    pub resolver: Arc<dyn ConflictResolver>,
}

impl EngineSettings {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            retry: RetryController::new(config.max_retries, config.backoff.clone())?,
            resolver: config.conflict_strategy.resolver(),
            config,
        })
    }

    /// Settings after applying a patch, keeping a custom resolver unless the
    /// patch picks a strategy.
    pub fn patched(&self, patch: &ConfigPatch) -> Result<Self> {
        let config = self.config.merged(patch);
        config.validate()?;
        Ok(Self {
            retry: RetryController::new(config.max_retries, config.backoff.clone())?,
            resolver: match patch.conflict_strategy {
                Some(strategy) => strategy.resolver(),
                None => self.resolver.clone(),
            },
            config,
        })
    }
}
