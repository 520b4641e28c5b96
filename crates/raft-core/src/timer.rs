//! # timer
//!
//! why: keep election jitter and heartbeat cadence swappable and out of the state machine
//! relations: armed and disarmed by manager.rs, configured from config.rs
//! what: ElectionTimer and HeartbeatScheduler traits, tokio-backed implementations

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Invoked when a timer fires; the returned future is spawned, never awaited inline
pub type Callback = Arc<dyn Fn() -> BoxFuture<()> + Send + Sync>;

/// Single-shot, resettable election timeout
pub trait ElectionTimer: Send + Sync {
    /// Arm the countdown if it is not already running
    fn start(&self);
    /// Restart the countdown with a fresh random duration
    fn reset(&self);
    /// Disarm; a pending timeout never fires
    fn stop(&self);
    /// Register the callback run when the countdown elapses
    fn on_timeout(&self, callback: Callback);
}

/// Periodic ticker driving leader replication
pub trait HeartbeatScheduler: Send + Sync {
    /// Begin ticking at `interval` (restarts if already running)
    fn start(&self, interval: Duration);
    fn stop(&self);
    /// Register the callback run on every tick
    fn on_tick(&self, callback: Callback);
}

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms.max(min_ms));
    Duration::from_millis(timeout_ms)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking callback must not wedge the timer
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// -- randomized election timer --

#[derive(Default)]
struct TimerSlots {
    callback: Option<Callback>,
    pending: Option<JoinHandle<()>>,
}

/// Election timer backed by `tokio::time::sleep` with a uniformly random
/// duration in `[min, max]` milliseconds. Must be armed inside a tokio runtime.
pub struct RandomizedElectionTimer {
    min_ms: u64,
    max_ms: u64,
    slots: Mutex<TimerSlots>,
}

impl RandomizedElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            slots: Mutex::new(TimerSlots::default()),
        }
    }

    pub fn from_config(config: &crate::RaftConfig) -> Self {
        Self::new(config.election_timeout_min, config.election_timeout_max)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slots)
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn arm(&self, slots: &mut TimerSlots) {
        if let Some(previous) = slots.pending.take() {
            previous.abort();
        }
        let Some(callback) = slots.callback.clone() else {
            tracing::warn!("Election timer armed without a timeout callback");
            return;
        };
        let timeout = random_election_timeout(self.min_ms, self.max_ms);
        slots.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::trace!(timeout_ms = timeout.as_millis() as u64, "Election timeout elapsed");
            // detached so that stop/reset from inside the callback cannot cancel it
            tokio::spawn(callback());
        }));
    }
}

impl ElectionTimer for RandomizedElectionTimer {
    fn start(&self) {
        let mut slots = lock(&self.slots);
        let running = slots.pending.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            self.arm(&mut slots);
        }
    }

    fn reset(&self) {
        let mut slots = lock(&self.slots);
        self.arm(&mut slots);
    }

    fn stop(&self) {
        if let Some(pending) = lock(&self.slots).pending.take() {
            pending.abort();
        }
    }

    fn on_timeout(&self, callback: Callback) {
        lock(&self.slots).callback = Some(callback);
    }
}

impl Drop for RandomizedElectionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

// -- interval heartbeat --

/// Heartbeat scheduler backed by `tokio::time::interval`; the first tick is immediate
#[derive(Default)]
pub struct IntervalHeartbeat {
    slots: Mutex<TimerSlots>,
}

impl IntervalHeartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slots)
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl HeartbeatScheduler for IntervalHeartbeat {
    fn start(&self, interval: Duration) {
        let mut slots = lock(&self.slots);
        if let Some(previous) = slots.pending.take() {
            previous.abort();
        }
        let Some(callback) = slots.callback.clone() else {
            tracing::warn!("Heartbeat started without a tick callback");
            return;
        };
        slots.pending = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tokio::spawn(callback());
            }
        }));
    }

    fn stop(&self) {
        if let Some(pending) = lock(&self.slots).pending.take() {
            pending.abort();
        }
    }

    fn on_tick(&self, callback: Callback) {
        lock(&self.slots).callback = Some(callback);
    }
}

impl Drop for IntervalHeartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
