//! Durable queue store abstraction for FieldSync.
//!
//! This module provides a trait-based interface for the key-value store that
//! persists queued mutations, plus an in-memory backend, a local filesystem
//! backend, and a lookup that opens a backend by name.
//!
//! # Design Principles
//! - Opaque values: stores persist bytes, the sync engine owns the encoding
//! - Async operations: all I/O operations are async
//! - Unified error semantics: every backend reports `Error::Store` or `Error::Io`

pub mod backend;
pub mod local;
pub mod memory;
pub mod registry;

pub use backend::{key_matches, QueueStore};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::open_store;
