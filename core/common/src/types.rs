//! Common types used throughout FieldSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a queued mutation.
///
/// Identifiers are generated at enqueue time and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ItemId from an existing string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    /// - `id` must not contain `:` or `*`, which are reserved by the key format
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a reserved character
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ItemId cannot be empty".to_string(),
            ));
        }
        if id.contains(':') || id.contains('*') {
            return Err(crate::Error::InvalidInput(format!(
                "ItemId '{}' contains a reserved character",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key under which a queue item is persisted: `sync:queue:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    id: ItemId,
}

impl QueueKey {
    /// Namespace prefix shared by every queue key.
    pub const PREFIX: &'static str = "sync:queue:";

    /// Pattern matching every queue key.
    pub const PATTERN: &'static str = "sync:queue:*";

    /// Build the key for an item.
    pub fn for_item(id: &ItemId) -> Self {
        Self { id: id.clone() }
    }

    /// Parse a raw store key.
    ///
    /// # Errors
    /// - Key does not start with the queue prefix
    /// - Identifier part is not a valid ItemId
    pub fn parse(key: &str) -> crate::Result<Self> {
        let id = key.strip_prefix(Self::PREFIX).ok_or_else(|| {
            crate::Error::InvalidInput(format!("'{}' is not a queue key", key))
        })?;
        Ok(Self {
            id: ItemId::new(id)?,
        })
    }

    /// Identifier of the item this key points to.
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Raw key string as stored.
    pub fn to_key_string(&self) -> String {
        format!("{}{}", Self::PREFIX, self.id)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.id)
    }
}
