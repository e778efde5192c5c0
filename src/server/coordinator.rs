// src/server/coordinator.rs

//! The cross-worker coordination plane: task broadcast in its three
//! flavors, load-divergence evaluation for session rebalancing, and
//! shutdown orchestration.

use crate::server::inbox::{BroadcastTask, Task};
use crate::server::runtime::Shared;
use crate::server::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

/// Counts outstanding completions; `wait` blocks until the count drains.
/// Built on a mutex-condvar pair; the counterpart of the semaphore the
/// broadcast contract describes.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }

    /// Blocks up to `timeout`; returns true when the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.condvar.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        *count == 0
    }
}

/// The coordination handle over a running worker set.
///
/// Broadcast and shutdown must be driven from outside the worker threads;
/// a worker waiting on its own completion would deadlock.
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Fire-and-forget broadcast: the task runs once on every worker and
    /// disposes itself after the last execution.
    pub fn broadcast(&self, f: impl Fn(&mut Worker) + Send + Sync + 'static) {
        let task = BroadcastTask::new(self.shared.worker_count, None, f);
        for inbox in &self.shared.inboxes {
            inbox.post(Task::Broadcast(Arc::clone(&task)));
        }
    }

    /// Broadcast with a completion semaphore: returns once every worker
    /// has executed the task.
    pub fn broadcast_wait(&self, f: impl Fn(&mut Worker) + Send + Sync + 'static) {
        let wait = Arc::new(WaitGroup::new());
        wait.add(self.shared.worker_count);
        let task = BroadcastTask::new(self.shared.worker_count, Some(Arc::clone(&wait)), f);
        for inbox in &self.shared.inboxes {
            inbox.post(Task::Broadcast(Arc::clone(&task)));
        }
        wait.wait();
    }

    /// Serial broadcast: worker 0 first, then 1, and so on, waiting for
    /// each before submitting to the next. Used when the accumulated
    /// per-worker result would be too large to hold in parallel.
    pub fn broadcast_serial(&self, f: impl Fn(&mut Worker) + Send + Sync + 'static) {
        let f = Arc::new(f);
        for inbox in &self.shared.inboxes {
            let wait = Arc::new(WaitGroup::new());
            wait.add(1);
            let step = Arc::clone(&f);
            let signal = Arc::clone(&wait);
            inbox.post_fn(move |worker| {
                step(worker);
                signal.done();
            });
            wait.wait();
        }
    }

    /// Posts a point task to one worker.
    pub fn post_to(&self, worker: usize, f: impl FnOnce(&mut Worker) + Send + 'static) {
        if let Some(inbox) = self.shared.inboxes.get(worker) {
            inbox.post_fn(f);
        }
    }

    /// Begins graceful shutdown: every worker installs its drain
    /// callback and reports finished once its registry empties.
    pub fn start_shutdown(&self) {
        if self.shared.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutdown requested, draining workers");
        self.broadcast(|worker| worker.begin_drain());
    }

    /// Blocks until every worker reported finished.
    pub fn wait_finished(&self) {
        self.shared.finished.wait();
    }
}

/// Decides whether the load spread warrants a migration: returns the
/// busiest worker, the quietest worker and their percentage difference
/// when it exceeds the threshold.
pub fn evaluate_rebalance(readings: &[u32], threshold: u32) -> Option<(usize, usize, u32)> {
    if readings.len() < 2 {
        return None;
    }
    let (mut busiest, mut quietest) = (0, 0);
    for (index, value) in readings.iter().enumerate() {
        if *value > readings[busiest] {
            busiest = index;
        }
        if *value < readings[quietest] {
            quietest = index;
        }
    }
    let diff = readings[busiest] - readings[quietest];
    (diff > threshold).then_some((busiest, quietest, diff))
}
