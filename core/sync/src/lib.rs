//! FieldSync Sync Engine
//!
//! Offline-first synchronisation of local mutations to a remote endpoint:
//! - Durable FIFO queue over a pluggable key-value store
//! - Periodic, connectivity-aware batch transmission
//! - Per-item retry limits with optional backoff
//! - Pluggable conflict resolution (last-write-wins by default)
//! - Typed lifecycle events

pub mod batch;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod events;
pub mod item;
pub mod manager;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testing;

// Re-export main types
pub use batch::TickOutcome;
pub use config::{ConfigPatch, SyncConfig};
pub use conflict::{
    detect_conflict, Conflict, ConflictResolver, ConflictStrategy, LastWriteWins, PreferLocal,
    PreferRemote, Resolution, Winner,
};
pub use connectivity::{Connectivity, ConnectivityMonitor, ManualConnectivity, ProbeConnectivity};
pub use events::{
    BatchProcessed, ConflictResolved, ErrorSource, EventBus, EventKind, EventPayload,
    ItemCompleted, SubscriptionId, SyncErrorEvent, SyncEvent,
};
pub use item::{NewItem, Operation, SyncQueueItem, SyncStatus};
pub use manager::SyncManager;
pub use queue::{QueueStats, SyncQueue};
pub use remote::{HttpEndpoint, Mutation, RemoteAck, RemoteEndpoint};
pub use retry::{ExponentialBackoff, RetryBackoff, RetryController, RetryDecision};
pub use scheduler::TickScheduler;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _patch = ConfigPatch::default();
        let _retry = RetryController::default();
        let _resolver = ConflictStrategy::default().resolver();
        let _bus = EventBus::new();
        let _connectivity = ManualConnectivity::offline();
    }
}
