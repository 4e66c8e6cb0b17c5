//! Queue item model and its status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use fieldsync_common::{Error, ItemId, QueueKey, Result};

/// Kind of mutation a queue item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation '{}'", other))),
        }
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting for a batch.
    Pending,
    /// Claimed by a batch, transmission in progress.
    Processing,
    /// Accepted by the remote endpoint.
    Completed,
    /// Gave up after reaching the retry limit.
    Failed,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 4] = [
        SyncStatus::Pending,
        SyncStatus::Processing,
        SyncStatus::Completed,
        SyncStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    /// Completed and failed items never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SyncStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown status '{}'", s)))
    }
}

/// A mutation as handed over by the caller, before it is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub model_type: String,
    pub operation: Operation,
    pub data: Value,
}

impl NewItem {
    pub fn new(model_type: impl Into<String>, operation: Operation, data: Value) -> Self {
        Self {
            model_type: model_type.into(),
            operation,
            data,
        }
    }

    /// Reject mutations the queue cannot route.
    pub fn validate(&self) -> Result<()> {
        if self.model_type.trim().is_empty() {
            return Err(Error::InvalidInput("modelType cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// A queued mutation and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Unique identifier, assigned at enqueue.
    pub id: ItemId,
    /// Domain entity kind.
    pub model_type: String,
    pub operation: Operation,
    /// Opaque domain payload.
    pub data: Value,
    /// Enqueue time, primary FIFO key.
    pub timestamp: DateTime<Utc>,
    /// Insertion counter, breaks timestamp ties.
    pub sequence: u64,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    pub status: SyncStatus,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the item may be picked again, set only under backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Version the remote side settled on, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_data: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl SyncQueueItem {
    /// Create a pending item from a caller mutation.
    pub fn from_new(item: NewItem, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::generate(),
            model_type: item.model_type,
            operation: item.operation,
            data: item.data,
            timestamp: now,
            sequence,
            retry_count: 0,
            status: SyncStatus::Pending,
            last_error: None,
            next_attempt_at: None,
            canonical_data: None,
            updated_at: now,
        }
    }

    /// Store key of this item.
    pub fn key(&self) -> QueueKey {
        QueueKey::for_item(&self.id)
    }

    /// FIFO ordering key.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }

    /// Whether a batch may pick this item at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// pending -> processing.
    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(SyncStatus::Pending, SyncStatus::Processing)
    }

    /// processing -> completed.
    pub fn mark_completed(&mut self, canonical: Option<Value>) -> Result<()> {
        self.transition(SyncStatus::Processing, SyncStatus::Completed)?;
        self.canonical_data = canonical;
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    /// processing -> pending after a failed attempt that will be retried.
    pub fn mark_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.transition(SyncStatus::Processing, SyncStatus::Pending)?;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = next_attempt_at;
        Ok(())
    }

    /// processing -> failed once the retry budget is spent.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(SyncStatus::Processing, SyncStatus::Failed)?;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// processing -> failed without counting an attempt, for items whose
    /// retry budget ran out before this attempt.
    pub fn mark_exhausted(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(SyncStatus::Processing, SyncStatus::Failed)?;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// processing -> pending without touching the retry count.
    ///
    /// Used when an attempt was interrupted by something that is not a
    /// transmission failure (connectivity loss, process restart).
    pub fn release(&mut self) -> Result<()> {
        self.transition(SyncStatus::Processing, SyncStatus::Pending)
    }

    fn transition(&mut self, from: SyncStatus, to: SyncStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::Conflict(format!(
                "item {} is {}, expected {} before moving to {}",
                self.id, self.status, from, to
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Serialize to JSON bytes for the store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from store bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
