//! scheduler.rs - Fires once a minute on the minute
//!
//! Each tick runs as its own task. At most one cycle is in flight: a tick
//! that arrives while the previous cycle is still running is skipped.

use chrono::{DateTime, DurationRound, Utc};
use log::{debug, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::models::ScheduleTrigger;

/// Next top of the minute strictly after `now`
pub fn next_tick(now: DateTime<Utc>) -> DateTime<Utc> {
    let minute = chrono::Duration::minutes(1);
    let floor = now.duration_trunc(minute).unwrap_or(now);
    floor + minute
}

/// Next tick after `now` that is also a full minute past the `last` one
/// fired, so a wall clock running behind the timer never repeats a minute
pub fn following_tick(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let next = next_tick(now);
    match last {
        Some(last) => next.max(last + chrono::Duration::minutes(1)),
        None => next,
    }
}

/// Marks a cycle as in flight until dropped
#[derive(Debug)]
pub struct CycleGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    in_flight: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single cycle slot, or `None` if a cycle is running
    pub fn try_begin(&self) -> Option<CycleGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                flag: self.in_flight.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawn `cycle` for `trigger` unless another cycle is in flight.
    /// Returns whether the cycle was started.
    pub fn fire<F, Fut>(&self, trigger: ScheduleTrigger, cycle: &mut F) -> bool
    where
        F: FnMut(ScheduleTrigger) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(guard) = self.try_begin() else {
            warn!("Previous cycle still running, skipping tick at {}", trigger);
            return false;
        };

        let task = cycle(trigger);
        tokio::spawn(async move {
            task.await;
            drop(guard);
        });
        true
    }

    /// Tick at second 0 of every minute until `shutdown` flips to true
    pub async fn run<F, Fut>(&self, mut cycle: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(ScheduleTrigger) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("Scheduling job");
        let mut last = None;

        loop {
            let now = Utc::now();
            let next = following_tick(now, last);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!("Next update at {}", next.format("%H:%M:%S"));

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.fire(ScheduleTrigger { fired_at: next }, &mut cycle);
            last = Some(next);
        }

        debug!("Scheduler stopped");
    }
}
