// src/core/pool/target.rs

//! Shared per-target accounting: connection counts, admission intents,
//! and the set of workers with parked waiters.
//!
//! Counters use relaxed/acq-rel atomics; admission is best-effort and may
//! over-admit by at most one connection per racing worker.

use crate::config::TargetConfig;
use crate::core::ids::TargetId;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// One backend server the proxy routes to, shared by all workers.
#[derive(Debug)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub addr: SocketAddr,
    /// Hard cap on concurrent connections across all workers; 0 means
    /// unlimited.
    pub max_connections: u32,
    pub persist_max_age: Option<Duration>,
    pub waiter_allowed: bool,

    connections: AtomicU32,
    intents: AtomicU32,
    pooled: AtomicU32,
    up: AtomicBool,
    /// Workers that currently hold at least one waiter for this target;
    /// a release or close posts an activation task to each.
    waiting_workers: Mutex<Vec<usize>>,
}

impl Target {
    pub fn from_config(id: TargetId, config: &TargetConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            addr: config.addr,
            max_connections: config.max_connections,
            persist_max_age: config.persist_max_age,
            waiter_allowed: config.waiter_allowed,
            connections: AtomicU32::new(0),
            intents: AtomicU32::new(0),
            pooled: AtomicU32::new(0),
            up: AtomicBool::new(true),
            waiting_workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Marks the target up or down; monitors (external) call this through
    /// the runtime.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    pub fn intent_count(&self) -> u32 {
        self.intents.load(Ordering::Acquire)
    }

    pub fn pooled_count(&self) -> u32 {
        self.pooled.load(Ordering::Acquire)
    }

    pub fn pooled_inc(&self) {
        self.pooled.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pooled_dec(&self) {
        self.pooled.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records a connection close (any path: error, expiry, drain).
    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Best-effort admission control. Registers an intent, re-reads the
    /// count-plus-intents sum, and backs out if the cap is exceeded. The
    /// returned guard drops the intent when the attempt concludes,
    /// whatever its outcome; a successful connect calls
    /// [`ConnectionIntent::commit`] first.
    pub fn try_admit(self: &Arc<Self>) -> Option<ConnectionIntent> {
        self.intents.fetch_add(1, Ordering::AcqRel);
        if self.max_connections > 0 {
            let sum =
                self.connections.load(Ordering::Acquire) + self.intents.load(Ordering::Acquire);
            if sum > self.max_connections {
                self.intents.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        }
        Some(ConnectionIntent {
            target: Arc::clone(self),
        })
    }

    /// Registers `worker` as holding waiters for this target. Deduplicated.
    pub fn add_waiting_worker(&self, worker: usize) {
        let mut workers = self.waiting_workers.lock();
        if !workers.contains(&worker) {
            workers.push(worker);
        }
    }

    /// Removes `worker` once its waiter queue for this target drains.
    pub fn remove_waiting_worker(&self, worker: usize) {
        self.waiting_workers.lock().retain(|w| *w != worker);
    }

    /// Snapshot of workers to notify after a release or close.
    pub fn waiting_workers(&self) -> Vec<usize> {
        self.waiting_workers.lock().clone()
    }
}

/// RAII token for one in-flight connection attempt. The intent counter
/// stays raised for exactly the lifetime of the attempt; a bounded retry
/// takes a fresh intent.
#[derive(Debug)]
pub struct ConnectionIntent {
    target: Arc<Target>,
}

impl ConnectionIntent {
    /// Converts the intent into an opened connection.
    pub fn commit(self) {
        self.target.connections.fetch_add(1, Ordering::AcqRel);
        // Drop runs next and releases the intent.
    }
}

impl Drop for ConnectionIntent {
    fn drop(&mut self) {
        self.target.intents.fetch_sub(1, Ordering::AcqRel);
    }
}
