//! Conflict detection and resolution.
//!
//! A conflict exists when the remote endpoint answers a transmission with a
//! canonical record that differs from the payload we sent. A
//! [`ConflictResolver`] then picks the version the rest of the system should
//! treat as authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use fieldsync_common::{Error, ItemId, Result};

use crate::item::Operation;

/// Payload fields inspected for a client timestamp, in priority order.
pub const TIMESTAMP_FIELDS: [&str; 3] = ["updatedAt", "updated_at", "timestamp"];

/// Built-in conflict resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The version with the more recent embedded timestamp wins.
    #[default]
    LastWriteWins,
    /// Local payload always wins.
    PreferLocal,
    /// Canonical remote record always wins.
    PreferRemote,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::PreferLocal => "prefer-local",
            ConflictStrategy::PreferRemote => "prefer-remote",
        }
    }

    /// Instantiate the resolver implementing this strategy.
    pub fn resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ConflictStrategy::LastWriteWins => Arc::new(LastWriteWins),
            ConflictStrategy::PreferLocal => Arc::new(PreferLocal),
            ConflictStrategy::PreferRemote => Arc::new(PreferRemote),
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
            "prefer-local" => Ok(ConflictStrategy::PreferLocal),
            "prefer-remote" => Ok(ConflictStrategy::PreferRemote),
            other => Err(Error::InvalidConfig(format!(
                "Unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

/// Which side a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

/// Both versions of a record, as seen when a transmission completes.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    pub item_id: &'a ItemId,
    pub model_type: &'a str,
    pub operation: Operation,
    /// Payload we transmitted.
    pub local: &'a Value,
    /// Canonical record returned by the remote endpoint.
    pub remote: &'a Value,
}

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Winner,
    /// Canonical data after resolution.
    pub data: Value,
    /// Set when the strategy could not apply its rule and fell back to the
    /// local payload; holds the reason.
    pub fallback: Option<String>,
}

impl Resolution {
    pub fn local(conflict: &Conflict<'_>) -> Self {
        Self {
            winner: Winner::Local,
            data: conflict.local.clone(),
            fallback: None,
        }
    }

    pub fn remote(conflict: &Conflict<'_>) -> Self {
        Self {
            winner: Winner::Remote,
            data: conflict.remote.clone(),
            fallback: None,
        }
    }
}

/// Pluggable conflict policy.
///
/// Implementations must be deterministic: the same pair of versions always
/// resolves the same way.
pub trait ConflictResolver: Send + Sync {
    /// Strategy name used in logs and events.
    fn name(&self) -> &str;

    /// Pick the canonical version.
    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution;
}

/// Whether the local payload and the canonical record diverge.
pub fn detect_conflict(local: &Value, remote: &Value) -> bool {
    local != remote
}

/// Extract the client timestamp embedded in a payload.
///
/// Accepts RFC 3339 strings and integer epoch milliseconds.
pub fn record_timestamp(data: &Value) -> std::result::Result<DateTime<Utc>, String> {
    let object = data
        .as_object()
        .ok_or_else(|| "payload is not an object".to_string())?;

    let (field, value) = TIMESTAMP_FIELDS
        .iter()
        .find_map(|field| object.get(*field).map(|value| (*field, value)))
        .ok_or_else(|| "payload carries no timestamp field".to_string())?;

    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| format!("{} '{}' is not RFC 3339: {}", field, raw, e)),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| format!("{} {} is not a valid epoch millisecond value", field, number)),
        other => Err(format!("{} has unsupported type: {}", field, other)),
    }
}

/// Last-write-wins on the embedded client timestamp.
///
/// Equal timestamps keep the remote version. Missing or malformed timestamps
/// keep the local version and report the reason through `fallback`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &str {
        "last-write-wins"
    }

    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution {
        match (
            record_timestamp(conflict.local),
            record_timestamp(conflict.remote),
        ) {
            (Ok(local), Ok(remote)) if local > remote => Resolution::local(conflict),
            (Ok(_), Ok(_)) => Resolution::remote(conflict),
            (local, remote) => {
                let reason = [("local", local.err()), ("remote", remote.err())]
                    .into_iter()
                    .filter_map(|(side, err)| err.map(|e| format!("{}: {}", side, e)))
                    .collect::<Vec<_>>()
                    .join("; ");
                Resolution {
                    fallback: Some(reason),
                    ..Resolution::local(conflict)
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreferLocal;

impl ConflictResolver for PreferLocal {
    fn name(&self) -> &str {
        "prefer-local"
    }

    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution {
        Resolution::local(conflict)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreferRemote;

impl ConflictResolver for PreferRemote {
    fn name(&self) -> &str {
        "prefer-remote"
    }

    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution {
        Resolution::remote(conflict)
    }
}
