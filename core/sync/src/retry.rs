//! Retry accounting for failed transmissions, with optional backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldsync_common::{Error, Result};

use crate::config::duration_ms;
use crate::item::SyncQueueItem;

/// Exponential backoff between attempts of the same item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    #[serde(with = "duration_ms", rename = "initialDelayMs")]
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    #[serde(with = "duration_ms", rename = "maxDelayMs")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomise delays by +/- 25%.
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "backoff multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig(
                "backoff max delay must not be below the initial delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Spacing between attempts of a failed item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetryBackoff {
    /// A failed item is eligible again on the next tick.
    #[default]
    Fixed,
    /// A failed item waits an exponentially growing delay.
    Exponential(ExponentialBackoff),
}

impl RetryBackoff {
    /// Delay before the retry following failure number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryBackoff::Fixed => None,
            RetryBackoff::Exponential(backoff) => Some(backoff.delay_for_attempt(attempt)),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            RetryBackoff::Fixed => Ok(()),
            RetryBackoff::Exponential(backoff) => backoff.validate(),
        }
    }
}

/// What happens to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending; `attempts` failures recorded so far.
    Retry {
        attempts: u32,
        not_before: Option<DateTime<Utc>>,
    },
    /// Permanently failed after `attempts` failures.
    GiveUp { attempts: u32 },
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryDecision::Retry { attempts, .. } | RetryDecision::GiveUp { attempts } => *attempts,
        }
    }
}

/// Tracks per-item failure counts against the retry limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryController {
    max_retries: u32,
    backoff: RetryBackoff,
}

impl RetryController {
    /// Create a controller.
    ///
    /// # Errors
    /// - `max_retries` is zero
    /// - backoff parameters are inconsistent
    pub fn new(max_retries: u32, backoff: RetryBackoff) -> Result<Self> {
        if max_retries == 0 {
            return Err(Error::InvalidConfig(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        backoff.validate()?;
        Ok(Self {
            max_retries,
            backoff,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide the fate of an item that has already failed `previous_failures`
    /// times and just failed again.
    pub fn decide(&self, previous_failures: u32, now: DateTime<Utc>) -> RetryDecision {
        let attempts = previous_failures.saturating_add(1);
        if attempts >= self.max_retries {
            return RetryDecision::GiveUp {
                attempts: attempts.min(self.max_retries),
            };
        }

        let not_before = self
            .backoff
            .delay_for_attempt(attempts - 1)
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| now + delay);

        RetryDecision::Retry {
            attempts,
            not_before,
        }
    }

    /// Record a failed attempt on a processing item.
    ///
    /// # Postconditions
    /// - The item is pending again or failed, never processing
    /// - `retry_count` never exceeds `max_retries`
    pub fn record_failure(&self, item: &mut SyncQueueItem, error: &str) -> Result<RetryDecision> {
        let decision = self.decide(item.retry_count, Utc::now());
        match decision {
            RetryDecision::Retry { not_before, .. } => item.mark_retry(error, not_before)?,
            RetryDecision::GiveUp { .. } => item.mark_failed(error)?,
        }
        item.retry_count = decision.attempts();
        Ok(decision)
    }
}

impl RetryController {
    /// Whether an item has no attempts left, e.g. after the limit was lowered.
    pub fn is_exhausted(&self, item: &SyncQueueItem) -> bool {
        item.retry_count >= self.max_retries
    }

    /// Fail a processing item whose budget is already spent, without an
    /// attempt.
    ///
    /// # Postconditions
    /// - The item is failed with `retry_count` clamped to `max_retries`
    pub fn give_up(&self, item: &mut SyncQueueItem) -> Result<RetryDecision> {
        let attempts = item.retry_count.min(self.max_retries);
        item.mark_exhausted(format!("retry limit of {} reached", self.max_retries))?;
        item.retry_count = attempts;
        Ok(RetryDecision::GiveUp { attempts })
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: RetryBackoff::Fixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{NewItem, Operation, SyncStatus};
    use serde_json::json;

    fn processing_item() -> SyncQueueItem {
        let mut item =
            SyncQueueItem::from_new(NewItem::new("Job", Operation::Update, json!({})), 0);
        item.mark_processing().unwrap();
        item
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_max_retries_rejected() {
        assert!(RetryController::new(0, RetryBackoff::Fixed).is_err());
    }

    #[test]
    fn test_inconsistent_backoff_rejected() {
        let shrinking = ExponentialBackoff::new(Duration::from_secs(1)).with_multiplier(0.5);
        assert!(RetryController::new(3, RetryBackoff::Exponential(shrinking)).is_err());

        let inverted = ExponentialBackoff::new(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(1));
        assert!(RetryController::new(3, RetryBackoff::Exponential(inverted)).is_err());
    }

    #[test]
    fn test_fixed_retry_until_limit() {
        let controller = RetryController::new(3, RetryBackoff::Fixed).unwrap();
        let mut item = processing_item();

        for expected in 1..3 {
            let decision = controller.record_failure(&mut item, "503").unwrap();
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    attempts: expected,
                    not_before: None
                }
            );
            assert_eq!(item.status, SyncStatus::Pending);
            assert_eq!(item.retry_count, expected);
            item.mark_processing().unwrap();
        }

        let decision = controller.record_failure(&mut item, "503").unwrap();
        assert_eq!(decision, RetryDecision::GiveUp { attempts: 3 });
        assert_eq!(item.status, SyncStatus::Failed);
        assert_eq!(item.retry_count, 3);
    }

    #[test]
    fn test_lowered_limit_never_exceeded() {
        let controller = RetryController::new(2, RetryBackoff::Fixed).unwrap();
        let mut item = processing_item();
        item.retry_count = 3;

        assert!(controller.is_exhausted(&item));
        assert_eq!(controller.decide(3, Utc::now()), RetryDecision::GiveUp { attempts: 2 });

        let decision = controller.give_up(&mut item).unwrap();
        assert_eq!(decision, RetryDecision::GiveUp { attempts: 2 });
        assert_eq!(item.status, SyncStatus::Failed);
        assert_eq!(item.retry_count, 2);
        assert!(item.last_error.unwrap().contains("retry limit"));
    }

    #[test]
    fn test_backoff_sets_next_attempt() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5)).with_jitter(false);
        let controller = RetryController::new(5, RetryBackoff::Exponential(backoff)).unwrap();
        let now = Utc::now();

        match controller.decide(0, now) {
            RetryDecision::Retry { not_before, .. } => {
                assert_eq!(not_before, Some(now + chrono::Duration::seconds(5)));
            }
            other => panic!("unexpected decision {:?}", other),
        }
        match controller.decide(1, now) {
            RetryDecision::Retry { not_before, .. } => {
                assert_eq!(not_before, Some(now + chrono::Duration::seconds(10)));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_backoff_serde_shape() {
        let backoff = RetryBackoff::Exponential(
            ExponentialBackoff::new(Duration::from_millis(500)).with_jitter(false),
        );
        let value = serde_json::to_value(&backoff).unwrap();
        assert_eq!(value["kind"], "exponential");
        assert_eq!(value["initialDelayMs"], 500);

        let fixed: RetryBackoff = serde_json::from_value(json!({"kind": "fixed"})).unwrap();
        assert_eq!(fixed, RetryBackoff::Fixed);
    }
}
