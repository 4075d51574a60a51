//! Timing Wheel
//!
//! Schedules one-shot jobs keyed by name. Used to expire keys.
//!
//! ## Design
//!
//! ```text
//!            current
//!               │
//!   ┌────┬────┬─▼──┬────┬────┬────┐
//!   │ s0 │ s1 │ s2 │ s3 │ .. │sN-1│   one slot per `interval`
//!   └────┴────┴────┴────┴────┴────┘
//!               │
//!        [job(circle=0), job(circle=2), ...]
//! ```
//!
//! A job with delay `d` lands in slot `(current + d / interval) % N` and
//! waits `d / interval / N` extra revolutions (its circle). Every tick the
//! slot under `current` is inspected: jobs with circle 0 are removed and
//! run, the others have their circle decremented. Then `current` advances.
//!
//! Because ticks are whole intervals, a job may fire up to one interval
//! before or after its exact deadline. Callers re-check their own state
//! when the job runs.
//!
//! All wheel state lives inside one Tokio task; the handle only sends it
//! messages, so [`TimeWheel::delay`] and [`TimeWheel::cancel`] never block.
//! Jobs run on the blocking pool, each wrapped so a panic is logged and
//! does not affect the tick loop or other jobs.

use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Wheel geometry.
#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// Length of one tick (default: 1s)
    pub interval: Duration,
    /// Number of slots in the ring (default: 3600)
    pub slots: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            slots: 3600,
        }
    }
}

enum Op {
    Add { key: Bytes, delay: Duration, job: Job },
    Remove(Bytes),
}

/// Handle to a running wheel. Dropping it stops the tick loop.
#[derive(Debug)]
pub struct TimeWheel {
    ops: mpsc::UnboundedSender<Op>,
    shutdown_tx: watch::Sender<bool>,
}

impl TimeWheel {
    /// Spawns the tick loop on the current Tokio runtime.
    pub fn start(config: WheelConfig) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = WheelState::new(config.interval, config.slots.max(1));
        tokio::spawn(wheel_loop(state, ops_rx, shutdown_rx));

        info!(
            interval_ms = config.interval.as_millis() as u64,
            slots = config.slots,
            "Time wheel started"
        );

        Self { ops, shutdown_tx }
    }

    /// Runs `job` after `delay`. An existing job under the same key is
    /// replaced.
    pub fn delay(&self, key: Bytes, delay: Duration, job: Job) {
        let _ = self.ops.send(Op::Add { key, delay, job });
    }

    /// Runs `job` at `at`. A deadline already in the past fires on the
    /// next tick.
    pub fn at(&self, key: Bytes, at: SystemTime, job: Job) {
        let delay = at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.delay(key, delay, job);
    }

    /// Drops the pending job for `key`, if any.
    pub fn cancel(&self, key: &[u8]) {
        let _ = self.ops.send(Op::Remove(Bytes::copy_from_slice(key)));
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Task {
    key: Bytes,
    circle: usize,
    job: Job,
}

struct WheelState {
    interval: Duration,
    slots: Vec<Vec<Task>>,
    index: HashMap<Bytes, usize>,
    current: usize,
}

impl WheelState {
    fn new(interval: Duration, slots: usize) -> Self {
        Self {
            interval,
            slots: (0..slots).map(|_| Vec::new()).collect(),
            index: HashMap::new(),
            current: 0,
        }
    }

    /// (slot, circle) for a job added now with `delay`.
    fn position(&self, delay: Duration) -> (usize, usize) {
        let n = self.slots.len();
        let offset = (delay.as_nanos() / self.interval.as_nanos().max(1)) as usize;
        ((self.current + offset) % n, offset / n)
    }

    fn add(&mut self, key: Bytes, delay: Duration, job: Job) {
        self.remove(&key);
        let (slot, circle) = self.position(delay);
        self.slots[slot].push(Task {
            key: key.clone(),
            circle,
            job,
        });
        self.index.insert(key, slot);
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(slot) = self.index.remove(key) {
            self.slots[slot].retain(|task| task.key != key);
        }
    }

    /// Processes the current slot and advances. Returns the jobs due now.
    fn tick(&mut self) -> Vec<Task> {
        let pending = std::mem::take(&mut self.slots[self.current]);
        let mut due = Vec::new();

        for mut task in pending {
            if task.circle > 0 {
                task.circle -= 1;
                self.slots[self.current].push(task);
            } else {
                self.index.remove(&task.key);
                due.push(task);
            }
        }

        self.current = (self.current + 1) % self.slots.len();
        due
    }
}

async fn wheel_loop(
    mut state: WheelState,
    mut ops: mpsc::UnboundedReceiver<Op>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + state.interval, state.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for task in state.tick() {
                    run_job(task);
                }
            }
            op = ops.recv() => match op {
                Some(Op::Add { key, delay, job }) => state.add(key, delay, job),
                Some(Op::Remove(key)) => state.remove(&key),
                None => return,
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Time wheel received shutdown signal");
                    return;
                }
            }
        }
    }
}

fn run_job(task: Task) {
    let Task { key, job, .. } = task;
    tokio::task::spawn_blocking(move || {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(key = %String::from_utf8_lossy(&key), "Time wheel job panicked");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> Job {
        Box::new(|| {})
    }

    #[test]
    fn test_position_and_circle() {
        let mut state = WheelState::new(Duration::from_secs(1), 5);
        assert_eq!(state.position(Duration::from_secs(0)), (0, 0));
        assert_eq!(state.position(Duration::from_secs(3)), (3, 0));
        assert_eq!(state.position(Duration::from_secs(7)), (2, 1));
        assert_eq!(state.position(Duration::from_millis(1500)), (1, 0));

        state.current = 4;
        assert_eq!(state.position(Duration::from_secs(2)), (1, 0));
    }

    #[test]
    fn test_tick_fires_after_circles() {
        let mut state = WheelState::new(Duration::from_secs(1), 2);
        // offset 4 -> slot 0, two extra revolutions
        state.add(Bytes::from("k"), Duration::from_secs(4), noop());

        let mut fired_at = None;
        for tick in 0..6 {
            if !state.tick().is_empty() {
                fired_at = Some(tick);
                break;
            }
        }
        assert_eq!(fired_at, Some(4));
        assert!(state.index.is_empty());
    }

    #[test]
    fn test_remove_and_replace() {
        let mut state = WheelState::new(Duration::from_secs(1), 8);
        state.add(Bytes::from("k"), Duration::from_secs(2), noop());
        state.add(Bytes::from("k"), Duration::from_secs(5), noop());
        assert_eq!(state.slots[2].len(), 0);
        assert_eq!(state.slots[5].len(), 1);

        state.remove(b"k");
        assert!(state.slots.iter().all(|s| s.is_empty()));
        state.remove(b"missing");
    }

    #[tokio::test]
    async fn test_job_runs() {
        let wheel = TimeWheel::start(WheelConfig {
            interval: Duration::from_millis(20),
            slots: 16,
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        wheel.delay(
            Bytes::from("job"),
            Duration::from_millis(40),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_never_runs() {
        let wheel = TimeWheel::start(WheelConfig {
            interval: Duration::from_millis(20),
            slots: 16,
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        wheel.delay(
            Bytes::from("job"),
            Duration::from_millis(100),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wheel.cancel(b"job");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_wheel() {
        let wheel = TimeWheel::start(WheelConfig {
            interval: Duration::from_millis(20),
            slots: 16,
        });
        let hits = Arc::new(AtomicUsize::new(0));

        wheel.delay(Bytes::from("bad"), Duration::ZERO, Box::new(|| panic!("boom")));
        let h = Arc::clone(&hits);
        wheel.delay(
            Bytes::from("good"),
            Duration::from_millis(60),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
