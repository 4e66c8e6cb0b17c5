//! One scheduler tick: select, transmit, record.

use futures::stream::{self, StreamExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fieldsync_common::{Error, ItemId, Result};

use crate::config::EngineSettings;
use crate::conflict::{detect_conflict, Conflict, Resolution};
use crate::connectivity::ConnectivityMonitor;
use crate::events::{
    BatchProcessed, ConflictResolved, ErrorSource, EventBus, ItemCompleted, SyncErrorEvent,
};
use crate::item::{SyncQueueItem, SyncStatus};
use crate::queue::SyncQueue;
use crate::remote::{Mutation, RemoteAck, RemoteEndpoint};

/// What a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Connectivity was offline; nothing was touched.
    Offline,
    /// A previous batch was still running; this tick was skipped.
    Overlapping,
    /// No eligible items.
    Empty,
    /// A batch ran.
    Processed(BatchProcessed),
}

/// Runs batches against the queue. At most one batch runs at a time.
pub(crate) struct BatchProcessor {
    queue: Arc<SyncQueue>,
    endpoint: Arc<dyn RemoteEndpoint>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    events: Arc<EventBus>,
    settings: Arc<RwLock<EngineSettings>>,
    in_flight: Arc<Mutex<()>>,
    /// Items left processing because neither their outcome nor their release
    /// could be written.
    stranded: std::sync::Mutex<Vec<ItemId>>,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<SyncQueue>,
        endpoint: Arc<dyn RemoteEndpoint>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        events: Arc<EventBus>,
        settings: Arc<RwLock<EngineSettings>>,
    ) -> Self {
        Self {
            queue,
            endpoint,
            connectivity,
            events,
            settings,
            in_flight: Arc::new(Mutex::new(())),
            stranded: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Wait until no batch is running.
    pub async fn wait_idle(&self) {
        drop(self.in_flight.lock().await);
    }

    /// Run one tick.
    ///
    /// # Postconditions
    /// - Every item selected by this tick is completed, pending or failed,
    ///   unless the store rejected the write; such items are handed back to
    ///   pending, at the latest on the next tick
    /// - Outcomes are recorded in selection order
    ///
    /// # Errors
    /// - The queue store could not be read; a `sync:error` event has been
    ///   emitted and no item was modified
    pub async fn run_tick(&self) -> Result<TickOutcome> {
        let Ok(_guard) = self.in_flight.clone().try_lock_owned() else {
            debug!("Batch still in flight, skipping tick");
            return Ok(TickOutcome::Overlapping);
        };

        if !self.connectivity.is_online() {
            debug!("Offline, skipping tick");
            return Ok(TickOutcome::Offline);
        }

        self.release_stranded().await;

        let settings = self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let batch_size = settings.config.batch_size;
        let started = Instant::now();

        let candidates = match self.queue.pending(batch_size).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to read pending items: {}", e);
                self.store_error(None, &e);
                return Err(e);
            }
        };

        let mut report = BatchProcessed {
            count: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            released: 0,
            conflicts: 0,
            duration: Duration::ZERO,
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.queue.claim(&candidate.id).await {
                // The limit may have been lowered since the item last failed
                Ok(Some(item)) if settings.retry.is_exhausted(&item) => {
                    if let Err((item, e)) =
                        self.give_up_exhausted(item, &settings, &mut report).await
                    {
                        self.outcome_not_recorded(item, e).await;
                    }
                }
                Ok(Some(item)) => claimed.push(item),
                Ok(None) => debug!(id = %candidate.id, "Item no longer eligible"),
                Err(e) => {
                    warn!(id = %candidate.id, "Failed to claim item: {}", e);
                    self.store_error(Some(&candidate), &e);
                }
            }
        }

        if claimed.is_empty() && report.count == 0 {
            return Ok(TickOutcome::Empty);
        }

        let timeout = settings.config.request_timeout;
        let results: Vec<(SyncQueueItem, Result<RemoteAck>)> = stream::iter(claimed)
            .map(|item| async move {
                let result = self.transmit(&item, timeout).await;
                (item, result)
            })
            .buffered(batch_size)
            .collect()
            .await;

        for (item, result) in results {
            let recorded = match result {
                Ok(ack) => self.record_success(item, ack, &settings, &mut report).await,
                Err(e) => self.record_failure(item, e, &settings, &mut report).await,
            };
            if let Err((item, e)) = recorded {
                self.outcome_not_recorded(item, e).await;
            }
        }

        report.duration = started.elapsed();
        info!(
            count = report.count,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            released = report.released,
            "Batch processed"
        );
        self.events.emit(report.clone());
        Ok(TickOutcome::Processed(report))
    }

    async fn transmit(&self, item: &SyncQueueItem, timeout: Duration) -> Result<RemoteAck> {
        let mutation = Mutation::from(item);
        debug!(id = %item.id, endpoint = self.endpoint.name(), "Transmitting item");
        match tokio::time::timeout(timeout, self.endpoint.push(&mutation)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn record_success(
        &self,
        item: SyncQueueItem,
        ack: RemoteAck,
        settings: &EngineSettings,
        report: &mut BatchProcessed,
    ) -> std::result::Result<(), (SyncQueueItem, Error)> {
        let resolution = ack
            .canonical
            .as_ref()
            .filter(|remote| detect_conflict(&item.data, remote))
            .map(|remote| {
                settings.resolver.resolve(&Conflict {
                    item_id: &item.id,
                    model_type: &item.model_type,
                    operation: item.operation,
                    local: &item.data,
                    remote,
                })
            });

        let canonical = match &resolution {
            Some(resolution) => Some(resolution.data.clone()),
            None => ack.canonical,
        };

        let completed = match self
            .queue
            .update(&item.id, |stored| {
                stored.mark_completed(canonical)?;
                Ok(stored.clone())
            })
            .await
        {
            Ok(completed) => completed,
            Err(e) => return Err((item, e)),
        };

        report.count += 1;
        report.completed += 1;

        if let Some(resolution) = resolution {
            report.conflicts += 1;
            self.conflict_resolved(&completed, resolution, settings);
        }

        debug!(id = %completed.id, "Item completed");
        self.events.emit(ItemCompleted { item: completed });
        Ok(())
    }

    fn conflict_resolved(
        &self,
        item: &SyncQueueItem,
        resolution: Resolution,
        settings: &EngineSettings,
    ) {
        let strategy = settings.resolver.name().to_string();
        info!(id = %item.id, %strategy, winner = ?resolution.winner, "Conflict resolved");

        if let Some(reason) = resolution.fallback {
            warn!(id = %item.id, "Conflict resolution fell back to local: {}", reason);
            self.events.emit(SyncErrorEvent {
                source: ErrorSource::Conflict,
                item_id: Some(item.id.clone()),
                model_type: Some(item.model_type.clone()),
                retry_count: Some(item.retry_count),
                will_retry: false,
                message: format!("conflict resolution fell back to local version: {}", reason),
            });
        }

        self.events.emit(ConflictResolved {
            item_id: item.id.clone(),
            model_type: item.model_type.clone(),
            operation: item.operation,
            strategy,
            winner: resolution.winner,
            data: resolution.data,
        });
    }

    async fn record_failure(
        &self,
        item: SyncQueueItem,
        error: Error,
        settings: &EngineSettings,
        report: &mut BatchProcessed,
    ) -> std::result::Result<(), (SyncQueueItem, Error)> {
        // Losing connectivity mid-batch is not the item's fault
        if error.is_transient() && !self.connectivity.is_online() {
            if let Err(e) = self.queue.update(&item.id, |stored| stored.release()).await {
                return Err((item, e));
            }
            debug!(id = %item.id, "Connectivity lost, released item: {}", error);
            report.count += 1;
            report.released += 1;
            return Ok(());
        }

        let message = error.to_string();
        let decision = match self
            .queue
            .update(&item.id, |stored| settings.retry.record_failure(stored, &message))
            .await
        {
            Ok(decision) => decision,
            Err(e) => return Err((item, e)),
        };

        report.count += 1;
        if decision.will_retry() {
            report.retried += 1;
            warn!(id = %item.id, attempts = decision.attempts(), "Transmission failed, will retry: {}", message);
        } else {
            report.failed += 1;
            warn!(id = %item.id, attempts = decision.attempts(), "Transmission failed, giving up: {}", message);
        }

        self.events.emit(SyncErrorEvent {
            source: ErrorSource::Transmission,
            item_id: Some(item.id),
            model_type: Some(item.model_type),
            retry_count: Some(decision.attempts()),
            will_retry: decision.will_retry(),
            message,
        });
        Ok(())
    }

    /// Fail an item whose retry budget is already spent, without transmitting.
    async fn give_up_exhausted(
        &self,
        item: SyncQueueItem,
        settings: &EngineSettings,
        report: &mut BatchProcessed,
    ) -> std::result::Result<(), (SyncQueueItem, Error)> {
        let decision = match self
            .queue
            .update(&item.id, |stored| settings.retry.give_up(stored))
            .await
        {
            Ok(decision) => decision,
            Err(e) => return Err((item, e)),
        };

        let max_retries = settings.retry.max_retries();
        warn!(id = %item.id, retry_count = item.retry_count, max_retries, "Retry limit already reached, giving up");
        report.count += 1;
        report.failed += 1;

        self.events.emit(SyncErrorEvent {
            source: ErrorSource::Transmission,
            item_id: Some(item.id),
            model_type: Some(item.model_type),
            retry_count: Some(decision.attempts()),
            will_retry: false,
            message: format!("retry limit of {} reached", max_retries),
        });
        Ok(())
    }

    /// Report a failed outcome write and hand the item back to pending.
    async fn outcome_not_recorded(&self, item: SyncQueueItem, error: Error) {
        warn!(id = %item.id, "Failed to record outcome: {}", error);
        self.store_error(Some(&item), &error);
        self.release_or_strand(&item.id).await;
    }

    async fn release_stranded(&self) {
        let stranded = std::mem::take(&mut *self.stranded.lock().unwrap_or_else(|e| e.into_inner()));
        for id in stranded {
            self.release_or_strand(&id).await;
        }
    }

    async fn release_or_strand(&self, id: &ItemId) {
        let released = self
            .queue
            .update(id, |item| match item.status {
                SyncStatus::Processing => item.release(),
                _ => Ok(()),
            })
            .await;

        match released {
            Ok(()) => debug!(%id, "Released item back to pending"),
            Err(Error::NotFound(_)) => debug!(%id, "Stranded item no longer exists"),
            Err(e) => {
                warn!(%id, "Failed to release item, retrying next tick: {}", e);
                self.stranded
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(id.clone());
            }
        }
    }

    fn store_error(&self, item: Option<&SyncQueueItem>, error: &Error) {
        self.events.emit(SyncErrorEvent {
            source: ErrorSource::Store,
            item_id: item.map(|item| item.id.clone()),
            model_type: item.map(|item| item.model_type.clone()),
            retry_count: item.map(|item| item.retry_count),
            will_retry: true,
            message: error.to_string(),
        });
    }
}
