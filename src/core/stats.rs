// src/core/stats.rs

//! Per-worker statistics and the cross-worker load gauge.
//!
//! The statistics block is plain counters touched only by the owning
//! worker; an aggregate view is assembled by a serial broadcast that
//! snapshots each block in turn. The load gauge is the one exception:
//! single-writer, multi-reader atomics so the coordinator can sample
//! load without a task round-trip.

use std::sync::atomic::{AtomicU32, Ordering};

/// Counters owned by one worker. Snapshotting is a plain copy.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub hangups: u64,
    pub accepts: u64,

    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub sessions_migrated_in: u64,
    pub sessions_migrated_out: u64,
    pub migrations_declined: u64,

    pub zombies_parked: u64,
    pub zombies_reparked: u64,
    pub zombies_destroyed: u64,

    pub waiters_enqueued: u64,
    pub waiters_activated: u64,
    pub waiters_expired: u64,

    /// Sum of readiness-queue lengths over all turns, for the average.
    pub event_queue_total: u64,
    pub event_queue_max: usize,
    pub turns: u64,

    /// Wall time spent executing handlers, in nanoseconds.
    pub busy_nanos: u64,
    /// Wall time spent blocked in the readiness call, in nanoseconds.
    pub blocked_nanos: u64,
    /// Handler execution time split by what the event dispatched into.
    pub client_handler_nanos: u64,
    pub backend_handler_nanos: u64,
    pub accept_nanos: u64,

    /// Descriptors currently registered.
    pub fd_count: usize,
    /// Descriptors ever registered.
    pub fd_total: u64,
}

impl WorkerStats {
    /// Average readiness-queue length across all loop turns so far.
    pub fn event_queue_avg(&self) -> f64 {
        if self.turns == 0 {
            0.0
        } else {
            self.event_queue_total as f64 / self.turns as f64
        }
    }
}

/// Aggregate of all workers' statistics blocks.
#[derive(Debug, Default, Clone)]
pub struct StatsAggregate {
    pub per_worker: Vec<WorkerStats>,
}

impl StatsAggregate {
    pub fn total_sessions_created(&self) -> u64 {
        self.per_worker.iter().map(|s| s.sessions_created).sum()
    }

    pub fn total_accepts(&self) -> u64 {
        self.per_worker.iter().map(|s| s.accepts).sum()
    }

    pub fn total_fd_count(&self) -> usize {
        self.per_worker.iter().map(|s| s.fd_count).sum()
    }
}

/// Moving average of the fraction of wall time a worker spends executing
/// handlers versus blocked in its readiness call, over one-second,
/// one-minute and one-hour horizons. Values are percentages (0-100).
///
/// Written by the owning worker after each one-second window; read by the
/// coordinator with relaxed ordering.
#[derive(Debug, Default)]
pub struct LoadGauge {
    one_sec: AtomicU32,
    /// Longer horizons are stored scaled by 1000 so the integer EWMA
    /// keeps resolution for small loads.
    one_min_scaled: AtomicU32,
    one_hour_scaled: AtomicU32,
}

/// A point-in-time sample of one worker's load gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReading {
    pub one_sec: u32,
    pub one_min: u32,
    pub one_hour: u32,
}

impl LoadGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed one-second window. `percent` is the busy
    /// share of that window, clamped to 0-100.
    pub fn record_window(&self, percent: u32) {
        let percent = percent.min(100);
        self.one_sec.store(percent, Ordering::Release);

        // Exponentially weighted averages approximating the longer
        // horizons; single writer, integer math over scaled values.
        let minute = self.one_min_scaled.load(Ordering::Relaxed) as u64;
        let minute = (minute * 59 + u64::from(percent) * 1000) / 60;
        self.one_min_scaled
            .store(minute as u32, Ordering::Release);
        let hour = self.one_hour_scaled.load(Ordering::Relaxed) as u64;
        let hour = (hour * 3599 + u64::from(percent) * 1000) / 3600;
        self.one_hour_scaled.store(hour as u32, Ordering::Release);
    }

    pub fn read(&self) -> LoadReading {
        LoadReading {
            one_sec: self.one_sec.load(Ordering::Relaxed),
            one_min: self.one_min_scaled.load(Ordering::Relaxed) / 1000,
            one_hour: self.one_hour_scaled.load(Ordering::Relaxed) / 1000,
        }
    }
}
