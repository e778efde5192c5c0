// src/core/pool/mod.rs

//! The per-worker backend connection pool.
//!
//! Each worker keeps, per target, an unordered set of idle backend
//! connections. A pooled connection is linked to no session; its
//! descriptor runs a stub handler that evicts the entry on any traffic.
//! The pool group is guarded by a per-worker mutex because administrative
//! broadcasts may inspect it from another worker; the owning worker is
//! the only mutator.

pub mod target;
pub mod waiters;

pub use target::{ConnectionIntent, Target};
pub use waiters::{ActivationStatus, Endpoint, EnqueueOutcome, WAITER_QUEUE_LIMIT, WaiterQueues};

use crate::core::ids::{DescriptorHandle, TargetId};
use crate::core::protocol::{ReuseAttrs, ReuseScore};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One idle backend connection held by the pool.
#[derive(Debug)]
pub struct PoolEntry {
    /// The connection's descriptor, owned by this worker.
    pub descriptor: DescriptorHandle,
    /// Session-neutral snapshot taken when the connection was pooled.
    pub attrs: ReuseAttrs,
    pub created_at: Instant,
}

/// Statistics for one target's idle set on one worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub size: usize,
    pub max_size: usize,
    pub times_found: u64,
    pub times_empty: u64,
}

#[derive(Debug, Default)]
struct TargetPool {
    entries: Vec<PoolEntry>,
    stats: PoolStats,
}

/// Outcome of trying to return a connection to the pool.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// The entry was pooled.
    Pooled,
    /// No room (or pooling disabled); the caller must close the entry.
    Rejected(PoolEntry),
}

/// All idle sets for one worker, keyed by target.
#[derive(Debug)]
pub struct PoolGroup {
    pools: HashMap<TargetId, TargetPool>,
    /// This worker's share of the per-target capacity.
    capacity: usize,
}

impl PoolGroup {
    pub fn new(capacity_share: usize) -> Self {
        Self {
            pools: HashMap::new(),
            capacity: capacity_share,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live-adjusts the per-target capacity share. Excess entries are
    /// removed by the next expiry sweep.
    pub fn set_capacity(&mut self, capacity_share: usize) {
        self.capacity = capacity_share;
    }

    /// Picks the best-scoring idle connection for a session, removing it
    /// from the pool. `Optimal` short-circuits the scan; ties break
    /// arbitrarily. Returns `None` (and counts an empty hit) when nothing
    /// suitable is pooled.
    pub fn acquire(
        &mut self,
        target: TargetId,
        score: impl Fn(&ReuseAttrs) -> ReuseScore,
    ) -> Option<PoolEntry> {
        let pool = self.pools.entry(target).or_default();
        let mut best: Option<(usize, ReuseScore)> = None;
        for (index, entry) in pool.entries.iter().enumerate() {
            let s = score(&entry.attrs);
            if s == ReuseScore::NotPossible {
                continue;
            }
            if s == ReuseScore::Optimal {
                best = Some((index, s));
                break;
            }
            match &best {
                Some((_, current)) if !s.beats(current) => {}
                _ => best = Some((index, s)),
            }
        }
        match best {
            Some((index, _)) => {
                let entry = pool.entries.swap_remove(index);
                pool.stats.size = pool.entries.len();
                pool.stats.times_found += 1;
                Some(entry)
            }
            None => {
                pool.stats.times_empty += 1;
                None
            }
        }
    }

    /// Re-adds a connection whose release preconditions already passed.
    /// Rejects when the idle set is at capacity.
    pub fn release(&mut self, target: TargetId, entry: PoolEntry) -> ReleaseOutcome {
        let pool = self.pools.entry(target).or_default();
        if pool.entries.len() >= self.capacity {
            return ReleaseOutcome::Rejected(entry);
        }
        pool.entries.push(entry);
        pool.stats.size = pool.entries.len();
        pool.stats.max_size = pool.stats.max_size.max(pool.entries.len());
        ReleaseOutcome::Pooled
    }

    /// Removes the entry owning `descriptor`, if pooled. Used by the
    /// stub handler when traffic or an error lands on an idle connection.
    pub fn remove_by_descriptor(
        &mut self,
        target: TargetId,
        descriptor: DescriptorHandle,
    ) -> Option<PoolEntry> {
        let pool = self.pools.get_mut(&target)?;
        let index = pool
            .entries
            .iter()
            .position(|e| e.descriptor == descriptor)?;
        let entry = pool.entries.swap_remove(index);
        pool.stats.size = pool.entries.len();
        Some(entry)
    }

    /// Collects entries that must be closed: older than the target's
    /// max idle age, belonging to a down target, or in excess of the
    /// capacity after a runtime reduction.
    pub fn expire(
        &mut self,
        target: TargetId,
        now: Instant,
        max_age: Duration,
        target_up: bool,
    ) -> Vec<PoolEntry> {
        let capacity = self.capacity;
        let Some(pool) = self.pools.get_mut(&target) else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        let mut index = 0;
        while index < pool.entries.len() {
            let too_old = now.duration_since(pool.entries[index].created_at) >= max_age;
            if too_old || !target_up {
                expired.push(pool.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        while pool.entries.len() > capacity {
            expired.push(pool.entries.swap_remove(0));
        }
        pool.stats.size = pool.entries.len();
        expired
    }

    /// Empties every idle set; used by the shutdown drain callback.
    pub fn drain_all(&mut self) -> Vec<(TargetId, PoolEntry)> {
        let mut all = Vec::new();
        for (target, pool) in self.pools.iter_mut() {
            all.extend(pool.entries.drain(..).map(|e| (*target, e)));
            pool.stats.size = 0;
        }
        all
    }

    pub fn stats(&self, target: TargetId) -> PoolStats {
        self.pools
            .get(&target)
            .map(|p| p.stats)
            .unwrap_or_default()
    }

    pub fn idle_count(&self, target: TargetId) -> usize {
        self.pools.get(&target).map(|p| p.entries.len()).unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.pools.values().map(|p| p.entries.len()).sum()
    }

    pub fn targets(&self) -> Vec<TargetId> {
        self.pools.keys().copied().collect()
    }
}
