// src/server/inbox.rs

//! The per-worker task inbox: the one true cross-worker channel.
//!
//! Submission is lock-free from any thread; a waker tied to the worker's
//! readiness set turns a post into a wakeup. Tasks posted by one thread
//! to one worker execute in submission order relative to that thread; no
//! order is defined across posting threads.

use crate::server::coordinator::WaitGroup;
use crate::server::worker::Worker;
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::Waker;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// A one-worker, one-execution task.
pub type PointTask = Box<dyn FnOnce(&mut Worker) + Send>;

/// A refcounted task executed once on every worker and disposed when the
/// last execution finishes.
pub struct BroadcastTask {
    run: Box<dyn Fn(&mut Worker) + Send + Sync>,
    remaining: AtomicUsize,
    /// Signalled once per execution when the caller waits for completions.
    wait: Option<Arc<WaitGroup>>,
}

impl BroadcastTask {
    pub fn new(
        worker_count: usize,
        wait: Option<Arc<WaitGroup>>,
        run: impl Fn(&mut Worker) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            run: Box::new(run),
            remaining: AtomicUsize::new(worker_count),
            wait,
        })
    }

    /// Runs the task on one worker, signalling and disposing as needed.
    pub fn execute(&self, worker: &mut Worker) {
        (self.run)(worker);
        if let Some(wait) = &self.wait {
            wait.done();
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!("broadcast task fully executed, disposing");
        }
    }
}

/// One unit of inbox work.
pub enum Task {
    Point(PointTask),
    Broadcast(Arc<BroadcastTask>),
}

/// The producer half of one worker's inbox, cloneable to any thread.
#[derive(Clone)]
pub struct InboxHandle {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl InboxHandle {
    /// Posts a task and wakes the worker. Posting to a stopped worker is
    /// harmless; the task is dropped with the channel.
    pub fn post(&self, task: Task) {
        let _ = self.tx.send(task);
        let _ = self.waker.wake();
    }

    /// Convenience wrapper for point tasks.
    pub fn post_fn(&self, f: impl FnOnce(&mut Worker) + Send + 'static) {
        self.post(Task::Point(Box::new(f)));
    }
}

/// Builds the inbox pair for one worker. The waker must be created from
/// the worker's own poll registry before the worker thread starts.
pub fn inbox(waker: Arc<Waker>) -> (InboxHandle, Receiver<Task>) {
    let (tx, rx) = unbounded();
    (InboxHandle { tx, waker }, rx)
}
