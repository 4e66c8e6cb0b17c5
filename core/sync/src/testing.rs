//! Test doubles shared by the engine tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldsync_common::{Error, Result};
use fieldsync_store::{MemoryStore, QueueStore};

use crate::events::{EventBus, EventKind, SyncErrorEvent, SyncEvent};
use crate::remote::{Mutation, RemoteAck, RemoteEndpoint};

type Respond = Box<dyn Fn(&Mutation) -> Result<RemoteAck> + Send + Sync>;
type Delay = Box<dyn Fn(&Mutation) -> Duration + Send + Sync>;

/// Endpoint answering from a closure, recording every call.
pub struct ScriptedEndpoint {
    calls: Mutex<Vec<Mutation>>,
    respond: Respond,
    delay: Delay,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedEndpoint {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&Mutation) -> Result<RemoteAck> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
            delay: Box::new(|_| Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| Ok(RemoteAck::empty()))
    }

    pub fn failing(message: &'static str) -> Self {
        Self::new(move |_| {
            Err(Error::Remote {
                status: 500,
                message: message.to_string(),
            })
        })
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&Mutation) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> Vec<Mutation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most pushes observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedEndpoint {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn push(&self, mutation: &Mutation) -> Result<RemoteAck> {
        self.calls.lock().unwrap().push(mutation.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = (self.delay)(mutation);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(mutation)
    }
}

/// Memory store whose reads can be switched to fail, and whose writes can be
/// made to fail a given number of times.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    failing_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Store("write rejected".to_string()));
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Store("disk unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_write()?;
        self.inner.set(key, value).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.keys(pattern).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

/// Records every event emitted on a bus.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let log = Self::default();
        for kind in EventKind::ALL {
            let events = log.events.clone();
            bus.on_kind(kind, move |event| events.lock().unwrap().push(event.clone()));
        }
        log
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(SyncEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn errors(&self) -> Vec<SyncErrorEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::Error(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }
}
