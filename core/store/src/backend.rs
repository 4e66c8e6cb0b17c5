//! Queue store trait definition.

use async_trait::async_trait;

use fieldsync_common::Result;

/// Key-value store backing the sync queue.
///
/// Keys are plain strings (the engine uses `sync:queue:{id}`), values are
/// opaque bytes. Implementations only need single-key atomicity; the engine
/// serialises read-modify-write sequences per key itself.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - A subsequent `get(key)` returns `value`, also after a restart for
    ///   durable backends
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// List keys matching `pattern`.
    ///
    /// `*` matches any run of characters; every other character matches
    /// itself. Ordering of the result is unspecified.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete a key.
    ///
    /// # Returns
    /// Whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key held by this store.
    async fn flush(&self) -> Result<()>;
}

/// Glob match used by `keys(pattern)`.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, k));
            p += 1;
        } else if p < pattern.len() && pattern[p] == key[k] {
            p += 1;
            k += 1;
        } else if let Some((star, matched)) = backtrack {
            // Let the last star swallow one more character
            p = star + 1;
            k = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
