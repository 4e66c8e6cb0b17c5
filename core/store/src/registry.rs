//! Resolve a queue store backend by name.

use serde_json::Value;
use std::sync::Arc;

use crate::backend::QueueStore;
use crate::local::LocalStore;
use crate::memory::MemoryStore;
use fieldsync_common::{Error, Result};

/// Open the built-in store called `name`.
///
/// `memory` ignores `config`. `local` reads its root directory from the
/// `root` field.
///
/// # Errors
/// - `NotFound` for an unknown name
/// - `InvalidInput` when `local` has no `root`
pub fn open_store(name: &str, config: &Value) -> Result<Arc<dyn QueueStore>> {
    match name {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "local" => {
            let root = config
                .get("root")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidInput("Local store requires 'root' path".to_string()))?;
            Ok(Arc::new(LocalStore::new(root)?))
        }
        other => Err(Error::NotFound(format!("Unknown store '{}'", other))),
    }
}
