//! The sync manager: the public face of the engine.

use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use fieldsync_common::{ItemId, Result};
use fieldsync_store::QueueStore;

use crate::batch::{BatchProcessor, TickOutcome};
use crate::config::{ConfigPatch, EngineSettings, SyncConfig};
use crate::conflict::ConflictResolver;
use crate::connectivity::ConnectivityMonitor;
use crate::events::{EventBus, EventKind, EventPayload, SubscriptionId, SyncEvent};
use crate::item::{NewItem, SyncQueueItem, SyncStatus};
use crate::queue::{QueueStats, SyncQueue};
use crate::remote::RemoteEndpoint;
use crate::scheduler::TickScheduler;

/// Offline-first sync manager.
///
/// Mutations are accepted at any time through
/// [`add_to_sync_queue`](Self::add_to_sync_queue) and persisted in the queue
/// store. While started, the manager transmits them in FIFO batches every
/// sync interval, and immediately whenever connectivity comes back.
///
/// # Example
/// ```ignore
/// let manager = SyncManager::new(store, endpoint, connectivity, SyncConfig::default())?;
/// manager.init().await?;
/// manager.on_event::<SyncErrorEvent, _>(|e| eprintln!("sync failed: {}", e.message));
/// manager.start_sync();
/// manager.add_to_sync_queue(NewItem::new("Job", Operation::Update, data)).await?;
/// ```
pub struct SyncManager {
    queue: Arc<SyncQueue>,
    events: Arc<EventBus>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    settings: Arc<RwLock<EngineSettings>>,
    processor: Arc<BatchProcessor>,
    scheduler: Arc<TickScheduler>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    /// Create a stopped manager.
    ///
    /// # Errors
    /// - `config` is invalid
    pub fn new(
        store: Arc<dyn QueueStore>,
        endpoint: Arc<dyn RemoteEndpoint>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        let settings = Arc::new(RwLock::new(EngineSettings::new(config)?));
        let queue = Arc::new(SyncQueue::new(store));
        let events = Arc::new(EventBus::new());
        let processor = Arc::new(BatchProcessor::new(
            queue.clone(),
            endpoint,
            connectivity.clone(),
            events.clone(),
            settings.clone(),
        ));

        Ok(Self {
            queue,
            events,
            connectivity,
            settings,
            processor,
            scheduler: Arc::new(TickScheduler::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Replace the conflict resolver with a custom one.
    ///
    /// The resolver stays in place until a later
    /// [`configure`](Self::configure) picks a built-in strategy.
    pub fn with_resolver(self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .resolver = resolver;
        self
    }

    /// Prepare the queue after a restart.
    ///
    /// Items left in `processing` by an interrupted run go back to `pending`
    /// without an attempt being counted.
    ///
    /// # Returns
    /// Number of recovered items.
    pub async fn init(&self) -> Result<usize> {
        self.queue.init().await
    }

    /// Current configuration.
    pub fn config(&self) -> SyncConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .config
            .clone()
    }

    /// Merge a partial configuration into the current one.
    ///
    /// An empty patch changes nothing. A changed sync interval takes effect
    /// immediately when running: the next tick comes one new interval from
    /// now. Other fields apply from the next batch.
    ///
    /// # Errors
    /// - The merged configuration is invalid; the current one is kept
    pub fn configure(&self, patch: ConfigPatch) -> Result<()> {
        if patch.is_empty() {
            debug!("Empty configuration patch ignored");
            return Ok(());
        }

        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        let next = settings.patched(&patch)?;
        let interval_changed = next.config.sync_interval != settings.config.sync_interval;
        let interval = next.config.sync_interval;
        *settings = next;
        drop(settings);

        info!(?patch, "Configuration updated");
        if interval_changed {
            self.scheduler.reschedule(interval);
        }
        Ok(())
    }

    /// Persist a mutation for transmission. Works offline.
    ///
    /// # Errors
    /// - Invalid mutation (empty model type)
    /// - Store failure; nothing was queued
    pub async fn add_to_sync_queue(&self, item: NewItem) -> Result<ItemId> {
        let item = self.queue.enqueue(item).await?;
        Ok(item.id)
    }

    /// Start periodic syncing. Calling it while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    /// Whether the manager was started by this call.
    pub fn start_sync(&self) -> bool {
        let interval = self.config().sync_interval;
        let processor = self.processor.clone();
        let started = self.scheduler.start(interval, move || {
            let processor = processor.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.run_tick().await {
                    error!("Sync tick failed: {}", e);
                }
            });
        });

        if started {
            self.spawn_watcher();
            info!(
                interval_ms = interval.as_millis() as u64,
                online = self.connectivity.is_online(),
                "Sync started"
            );
        }
        started
    }

    /// Stop periodic syncing. A batch already running finishes normally.
    ///
    /// # Returns
    /// Whether the manager was running.
    pub fn stop_sync(&self) -> bool {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        let stopped = self.scheduler.stop();
        if stopped {
            info!("Sync stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Register a typed event handler.
    ///
    /// Handlers run synchronously on the engine task; keep them short.
    pub fn on_event<P, F>(&self, handler: F) -> SubscriptionId
    where
        P: EventPayload,
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.events.on::<P, F>(handler)
    }

    /// Register a handler for one event kind.
    pub fn on_event_kind<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.on_kind(kind, handler)
    }

    pub fn off_event(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    /// Receive every event on an async channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run one batch now, independent of the schedule.
    ///
    /// Skipped (not queued) while another batch is running.
    pub async fn sync_now(&self) -> Result<TickOutcome> {
        self.processor.run_tick().await
    }

    /// Wait until no batch is running.
    pub async fn wait_idle(&self) {
        self.processor.wait_idle().await;
    }

    /// Stop syncing and wait for the running batch, if any, to finish.
    pub async fn dispose(&self) {
        self.stop_sync();
        self.wait_idle().await;
        debug!("Sync manager disposed");
    }

    pub async fn get_item(&self, id: &ItemId) -> Result<Option<SyncQueueItem>> {
        self.queue.get(id).await
    }

    /// Queue items, optionally filtered by status, oldest first.
    pub async fn list_items(&self, status: Option<SyncStatus>) -> Result<Vec<SyncQueueItem>> {
        self.queue.list(status).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Delete completed and/or failed items.
    pub async fn purge(&self, statuses: &[SyncStatus]) -> Result<usize> {
        self.queue.purge(statuses).await
    }

    /// Queue a failed item again under a fresh id.
    pub async fn requeue_failed(&self, id: &ItemId) -> Result<ItemId> {
        Ok(self.queue.requeue_failed(id).await?.id)
    }

    fn spawn_watcher(&self) {
        let mut changes = self.connectivity.subscribe();
        let scheduler = self.scheduler.clone();

        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                if state.is_online() {
                    info!("Connectivity restored, syncing");
                    scheduler.trigger();
                }
            }
        });

        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        self.scheduler.stop();
    }
}
