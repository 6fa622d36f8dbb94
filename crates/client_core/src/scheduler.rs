//! Owned, cancellable timers. Every task the engine schedules lives here so teardown is a single
//! `shutdown` call.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
pub struct Scheduler {
    next_id: AtomicU64,
    timers: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` every `every`, first after one full period. A run that overlaps the next tick
    /// delays it instead of stacking up.
    pub fn schedule<F, Fut>(&self, every: Duration, mut task: F) -> TimerId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        self.register(handle)
    }

    /// Runs `task` once after `after`.
    pub fn schedule_once<F, Fut>(&self, after: Duration, task: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(after).await;
            task().await;
        });
        self.register(handle)
    }

    fn register(&self, handle: JoinHandle<()>) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|_, timer| !timer.is_finished());
        timers.insert(id, handle);
        id
    }

    /// Returns whether the timer was still registered.
    pub fn cancel(&self, id: TimerId) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Timers that have not finished or been cancelled.
    pub fn active(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|timer| !timer.is_finished())
            .count()
    }

    pub fn shutdown(&self) {
        let drained: Vec<JoinHandle<()>> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        if !drained.is_empty() {
            debug!(timers = drained.len(), "scheduler: cancelling timers");
        }
        for handle in drained {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
