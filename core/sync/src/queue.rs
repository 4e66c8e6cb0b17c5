//! The sync queue: typed access to queue items held in a [`QueueStore`].
//!
//! Every status or retry-count change goes through a per-item lock, so the
//! read-modify-write against the store is never interleaved with another
//! writer touching the same item. Locks are per key; nothing holds a lock
//! spanning more than one item.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use fieldsync_common::{Error, ItemId, QueueKey, Result};
use fieldsync_store::QueueStore;

use crate::item::{NewItem, SyncQueueItem, SyncStatus};

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    fn count(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Processing => self.processing += 1,
            SyncStatus::Completed => self.completed += 1,
            SyncStatus::Failed => self.failed += 1,
        }
    }
}

/// Per-item async locks.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<ItemId, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, id: &ItemId) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id.clone()).or_default().clone()
        };
        KeyGuard {
            locks: self,
            id: id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Drop the entry for `id` if nobody else references it.
    fn prune(&self, id: &ItemId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under this mutex, so a count of one is stable
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    id: ItemId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.id);
    }
}

/// Queue of mutations awaiting transmission.
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
    locks: KeyLocks,
    sequence: AtomicU64,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Prepare a queue over a store that may already hold items.
    ///
    /// Resumes the insertion counter after the highest stored sequence, then
    /// runs [`recover_interrupted`](Self::recover_interrupted).
    ///
    /// # Returns
    /// Number of recovered items.
    pub async fn init(&self) -> Result<usize> {
        let items = self.load_all().await?;
        let next = items.iter().map(|item| item.sequence + 1).max().unwrap_or(0);
        self.sequence.fetch_max(next, Ordering::SeqCst);

        self.recover_interrupted().await
    }

    /// Hand items left in `processing` by an interrupted run back to
    /// `pending`, without counting an attempt.
    ///
    /// Only safe while no batch is running.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let items = self.list(Some(SyncStatus::Processing)).await?;

        let mut recovered = 0;
        for item in items {
            let released = self
                .update(&item.id, |item| {
                    if item.status == SyncStatus::Processing {
                        item.release()?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                })
                .await?;
            if released {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered interrupted queue items");
        }
        Ok(recovered)
    }

    /// Persist a new pending item.
    ///
    /// # Errors
    /// - Invalid mutation (empty model type)
    /// - Store failure
    pub async fn enqueue(&self, new_item: NewItem) -> Result<SyncQueueItem> {
        new_item.validate()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let item = SyncQueueItem::from_new(new_item, sequence);
        let key = item.key().to_key_string();

        let _guard = self.locks.acquire(&item.id).await;
        if self.store.get(&key).await?.is_some() {
            return Err(Error::AlreadyExists(format!("queue item {}", item.id)));
        }
        self.store.set(&key, item.to_bytes()?).await?;

        debug!(id = %item.id, model_type = %item.model_type, operation = %item.operation, "Enqueued item");
        Ok(item)
    }

    /// Fetch one item.
    pub async fn get(&self, id: &ItemId) -> Result<Option<SyncQueueItem>> {
        let key = QueueKey::for_item(id).to_key_string();
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(SyncQueueItem::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All items, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<SyncStatus>) -> Result<Vec<SyncQueueItem>> {
        let mut items = self.load_all().await?;
        if let Some(status) = status {
            items.retain(|item| item.status == status);
        }
        Ok(items)
    }

    /// Up to `limit` items eligible for a batch, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let now = Utc::now();
        let mut items = self.load_all().await?;
        items.retain(|item| item.is_eligible(now));
        items.truncate(limit);
        Ok(items)
    }

    /// Atomically move an item from pending to processing.
    ///
    /// # Returns
    /// The claimed item, or `None` when it is no longer pending (claimed by
    /// an overlapping batch, purged, ...).
    pub async fn claim(&self, id: &ItemId) -> Result<Option<SyncQueueItem>> {
        let _guard = self.locks.acquire(id).await;
        let key = QueueKey::for_item(id).to_key_string();

        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let mut item = SyncQueueItem::from_bytes(&bytes)?;
        if !item.is_eligible(Utc::now()) {
            return Ok(None);
        }

        item.mark_processing()?;
        self.store.set(&key, item.to_bytes()?).await?;
        Ok(Some(item))
    }

    /// Read-modify-write one item under its lock.
    ///
    /// The closure's changes are persisted only if it returns `Ok`.
    ///
    /// # Errors
    /// - Item not found
    /// - Closure error
    /// - Store failure
    pub async fn update<T, F>(&self, id: &ItemId, f: F) -> Result<T>
    where
        F: FnOnce(&mut SyncQueueItem) -> Result<T>,
    {
        let _guard = self.locks.acquire(id).await;
        let key = QueueKey::for_item(id).to_key_string();

        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))?;
        let mut item = SyncQueueItem::from_bytes(&bytes)?;

        let result = f(&mut item)?;
        self.store.set(&key, item.to_bytes()?).await?;
        Ok(result)
    }

    /// Item counts per status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.load_all().await? {
            stats.count(item.status);
        }
        Ok(stats)
    }

    /// Delete items in the given terminal statuses.
    ///
    /// # Errors
    /// - A non-terminal status was requested; in-flight and pending items are
    ///   never purged
    pub async fn purge(&self, statuses: &[SyncStatus]) -> Result<usize> {
        if let Some(status) = statuses.iter().find(|status| !status.is_terminal()) {
            return Err(Error::InvalidInput(format!(
                "cannot purge {} items",
                status
            )));
        }

        let mut purged = 0;
        for item in self.load_all().await? {
            if !statuses.contains(&item.status) {
                continue;
            }

            let _guard = self.locks.acquire(&item.id).await;
            let key = item.key().to_key_string();
            // Terminal items never change status, but re-check anyway
            let current = match self.store.get(&key).await? {
                Some(bytes) => SyncQueueItem::from_bytes(&bytes)?,
                None => continue,
            };
            if statuses.contains(&current.status) && self.store.delete(&key).await? {
                purged += 1;
            }
        }

        info!(purged, "Purged queue items");
        Ok(purged)
    }

    /// Queue a failed item again under a fresh id with a clean retry count.
    ///
    /// The failed item itself is left in place until purged.
    ///
    /// # Errors
    /// - Item not found
    /// - Item is not failed
    pub async fn requeue_failed(&self, id: &ItemId) -> Result<SyncQueueItem> {
        let failed = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))?;

        if failed.status != SyncStatus::Failed {
            return Err(Error::Conflict(format!(
                "queue item {} is {}, only failed items can be re-queued",
                id, failed.status
            )));
        }

        let requeued = self
            .enqueue(NewItem::new(failed.model_type, failed.operation, failed.data))
            .await?;
        info!(from = %id, to = %requeued.id, "Re-queued failed item");
        Ok(requeued)
    }

    /// Load and order all items. Undecodable entries are skipped.
    async fn load_all(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items = Vec::new();

        for key in self.store.keys(QueueKey::PATTERN).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                // Deleted between keys() and get()
                continue;
            };
            match SyncQueueItem::from_bytes(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => warn!(key = %key, "Skipping undecodable queue entry: {}", e),
            }
        }

        items.sort_by_key(SyncQueueItem::order_key);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Operation;
    use fieldsync_store::{LocalStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn job(id: &str) -> NewItem {
        NewItem::new("Job", Operation::Create, json!({ "id": id }))
    }

    fn memory_queue() -> (MemoryStore, SyncQueue) {
        let store = MemoryStore::new();
        let queue = SyncQueue::new(Arc::new(store.clone()));
        (store, queue)
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_item() {
        let (store, queue) = memory_queue();
        let item = queue.enqueue(job("1")).await.unwrap();

        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.retry_count, 0);

        let key = format!("sync:queue:{}", item.id);
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(queue.get(&item.id).await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_model_type() {
        let (_, queue) = memory_queue();
        let result = queue.enqueue(NewItem::new(" ", Operation::Create, json!({}))).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_pending_is_fifo_and_limited() {
        let (_, queue) = memory_queue();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(queue.enqueue(job(&n.to_string())).await.unwrap().id);
        }

        let pending: Vec<ItemId> = queue
            .pending(3)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(pending, ids[..3].to_vec());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_, queue) = memory_queue();
        let queue = Arc::new(queue);
        let id = queue.enqueue(job("1")).await.unwrap().id;

        let (a, b) = tokio::join!(queue.claim(&id), queue.claim(&id));
        let claimed = [a.unwrap(), b.unwrap()];
        assert_eq!(claimed.iter().filter(|c| c.is_some()).count(), 1);

        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().status,
            SyncStatus::Processing
        );
        assert!(queue.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locks_released_after_use() {
        let (_, queue) = memory_queue();
        let queue = Arc::new(queue);
        let id = queue.enqueue(job("1")).await.unwrap().id;
        assert_eq!(queue.locks.len(), 0);

        let (a, b) = tokio::join!(queue.claim(&id), queue.claim(&id));
        assert!(a.unwrap().is_some() != b.unwrap().is_some());
        queue
            .update(&id, |item| item.mark_completed(None))
            .await
            .unwrap();
        assert_eq!(queue.locks.len(), 0);

        // A held guard keeps its entry; dropping it removes it
        let guard = queue.locks.acquire(&id).await;
        assert_eq!(queue.locks.len(), 1);
        drop(guard);
        assert_eq!(queue.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_update_discards_changes_on_error() {
        let (_, queue) = memory_queue();
        let id = queue.enqueue(job("1")).await.unwrap().id;

        let result = queue
            .update(&id, |item| {
                item.retry_count = 99;
                item.mark_completed(None)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(queue.get(&id).await.unwrap().unwrap().retry_count, 0);

        let missing = queue.update(&ItemId::generate(), |_| Ok(())).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let (_, queue) = memory_queue();
        let done = queue.enqueue(job("1")).await.unwrap().id;
        let failed = queue.enqueue(job("2")).await.unwrap().id;
        queue.enqueue(job("3")).await.unwrap();

        queue.claim(&done).await.unwrap();
        queue.update(&done, |item| item.mark_completed(None)).await.unwrap();
        queue.claim(&failed).await.unwrap();
        queue.update(&failed, |item| item.mark_failed("boom")).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                processing: 0,
                completed: 1,
                failed: 1
            }
        );

        assert!(queue.purge(&[SyncStatus::Pending]).await.is_err());
        assert_eq!(queue.purge(&[SyncStatus::Completed]).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().total(), 2);
        assert_eq!(
            queue
                .purge(&[SyncStatus::Completed, SyncStatus::Failed])
                .await
                .unwrap(),
            1
        );
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_requeue_failed() {
        let (_, queue) = memory_queue();
        let id = queue.enqueue(job("7")).await.unwrap().id;

        assert!(matches!(queue.requeue_failed(&id).await, Err(Error::Conflict(_))));

        queue.claim(&id).await.unwrap();
        queue.update(&id, |item| item.mark_failed("boom")).await.unwrap();

        let fresh = queue.requeue_failed(&id).await.unwrap();
        assert_ne!(fresh.id, id);
        assert_eq!(fresh.status, SyncStatus::Pending);
        assert_eq!(fresh.retry_count, 0);
        assert_eq!(fresh.data, json!({"id": "7"}));
        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().status,
            SyncStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_init_recovers_interrupted_items() {
        let temp = TempDir::new().unwrap();
        let id = {
            let queue = SyncQueue::new(Arc::new(LocalStore::new(temp.path()).unwrap()));
            queue.enqueue(job("1")).await.unwrap();
            let id = queue.enqueue(job("2")).await.unwrap().id;
            queue.claim(&id).await.unwrap();
            id
        };

        let queue = SyncQueue::new(Arc::new(LocalStore::new(temp.path()).unwrap()));
        assert_eq!(queue.init().await.unwrap(), 1);

        let item = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.retry_count, 0);

        let next = queue.enqueue(job("3")).await.unwrap();
        assert_eq!(next.sequence, 2);
        assert_eq!(queue.pending(10).await.unwrap().last().unwrap().id, next.id);
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped() {
        let (store, queue) = memory_queue();
        store.set("sync:queue:garbage", b"not json".to_vec()).await.unwrap();
        queue.enqueue(job("1")).await.unwrap();

        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }
}
