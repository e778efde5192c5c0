// src/core/pool/waiters.rs

//! Per-target FIFO of sessions waiting for a backend connection slot.
//!
//! A waiter is an endpoint: "session S wants a connection to target T".
//! Queues are owned by one worker and only touched on its thread; oldest
//! waiters activate first.

use crate::core::ids::{SessionId, TargetId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// One parked connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub session: SessionId,
    pub target: TargetId,
    pub enqueued_at: Instant,
}

/// What activating one waiter produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    /// The waiter got its connection; remove it.
    Success,
    /// Still no capacity; stop processing this target's queue.
    Wait,
    /// The waiter cannot proceed (session gone, target down); remove it
    /// and surface the error.
    Fail,
}

/// Outcome of parking an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The session already holds a waiter for this target.
    AlreadyQueued,
    /// The queue is at its bound; the statement fails fast instead.
    Full,
}

/// Bound on parked endpoints per target per worker; past it, statements
/// fail fast with a busy error rather than queueing without end.
pub const WAITER_QUEUE_LIMIT: usize = 256;

/// All waiter queues for one worker.
#[derive(Debug, Default)]
pub struct WaiterQueues {
    queues: HashMap<TargetId, VecDeque<Endpoint>>,
}

impl WaiterQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks an endpoint at the back of its target's queue. A session
    /// holds at most one waiter per target; duplicates are refused, and
    /// a full queue rejects outright.
    pub fn enqueue(&mut self, endpoint: Endpoint) -> EnqueueOutcome {
        let queue = self.queues.entry(endpoint.target).or_default();
        if queue.iter().any(|e| e.session == endpoint.session) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if queue.len() >= WAITER_QUEUE_LIMIT {
            return EnqueueOutcome::Full;
        }
        queue.push_back(endpoint);
        EnqueueOutcome::Queued
    }

    /// The oldest waiter for `target`, without removing it.
    pub fn front(&self, target: TargetId) -> Option<Endpoint> {
        self.queues.get(&target).and_then(|q| q.front().copied())
    }

    /// Removes and returns the oldest waiter for `target`.
    pub fn pop_front(&mut self, target: TargetId) -> Option<Endpoint> {
        let queue = self.queues.get_mut(&target)?;
        let endpoint = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&target);
        }
        endpoint
    }

    /// Drops every waiter belonging to `session` (it died or was killed).
    /// Returns the targets whose queues shrank.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<TargetId> {
        let mut touched = Vec::new();
        self.queues.retain(|target, queue| {
            let before = queue.len();
            queue.retain(|e| e.session != session);
            if queue.len() != before {
                touched.push(*target);
            }
            !queue.is_empty()
        });
        touched
    }

    /// Collects waiters older than the multiplex timeout; they fail with
    /// a busy error.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Endpoint> {
        let mut expired = Vec::new();
        self.queues.retain(|_, queue| {
            queue.retain(|e| {
                if now.duration_since(e.enqueued_at) >= timeout {
                    expired.push(*e);
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        expired
    }

    pub fn len(&self, target: TargetId) -> usize {
        self.queues.get(&target).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, target: TargetId) -> bool {
        self.len(target) == 0
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}
