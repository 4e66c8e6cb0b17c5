//! Periodic tick scheduling.
//!
//! A [`TickScheduler`] owns one background loop that fires a callback every
//! period. The loop accepts control messages so the period can change and
//! extra ticks can be requested without restarting it.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Messages accepted by a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Use a new period, counted from now.
    Reschedule(Duration),
    /// Fire once immediately; the periodic schedule is unchanged.
    Trigger,
}

type TickFn = Arc<dyn Fn() + Send + Sync>;

struct Running {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
    period: Duration,
}

/// Cancellable periodic scheduler.
///
/// The callback runs on the scheduler loop and must not block; long work
/// should be spawned from it so that [`TickScheduler::stop`] never cancels
/// work in progress.
#[derive(Default)]
pub struct TickScheduler {
    running: Mutex<Option<Running>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start firing `on_tick` every `period`, first after one full period.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    /// `false` if the scheduler was already running; the existing loop is
    /// kept and `on_tick` is dropped.
    pub fn start<F>(&self, period: Duration, on_tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Scheduler already running");
            return false;
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(period, control_rx, Arc::new(on_tick)));
        *running = Some(Running {
            control,
            task,
            period,
        });

        info!(period_ms = period.as_millis() as u64, "Scheduler started");
        true
    }

    /// Change the period of a running loop. The next tick comes one new
    /// period from now.
    ///
    /// # Returns
    /// Whether a loop was running.
    pub fn reschedule(&self, period: Duration) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.as_mut() {
            Some(r) if r.control.send(Control::Reschedule(period)).is_ok() => {
                r.period = period;
                true
            }
            _ => false,
        }
    }

    /// Request an immediate extra tick.
    ///
    /// # Returns
    /// Whether a loop was running.
    pub fn trigger(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| r.control.send(Control::Trigger).is_ok())
    }

    /// Stop the loop. No tick fires after this returns.
    ///
    /// # Returns
    /// Whether a loop was running.
    pub fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        match running {
            Some(r) => {
                r.task.abort();
                info!("Scheduler stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Period of the running loop.
    pub fn period(&self) -> Option<Duration> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.period)
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        if let Some(r) = self.running.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            r.task.abort();
        }
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_loop(
    period: Duration,
    mut control: mpsc::UnboundedReceiver<Control>,
    on_tick: TickFn,
) {
    let mut ticker = new_ticker(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Periodic tick");
                on_tick();
            }
            message = control.recv() => match message {
                Some(Control::Reschedule(period)) => {
                    debug!(period_ms = period.as_millis() as u64, "Rescheduling");
                    ticker = new_ticker(period);
                }
                Some(Control::Trigger) => {
                    debug!("Triggered tick");
                    on_tick();
                }
                None => break,
            },
        }
    }
}
