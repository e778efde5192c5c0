// src/config.rs

//! Programmatic core configuration: tuning knobs, target and listener
//! declarations, and validation.
//!
//! The core accepts configuration exclusively through these structs; file
//! loading, CLI parsing and environment handling belong to the embedding
//! application.

use crate::core::protocol::{ProtocolFactory, RouterFactory};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs recognized by the core runtime.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Number of worker threads. Each worker owns one readiness set and
    /// everything reachable from it.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Upper bound on how long a worker blocks in its readiness call per
    /// loop turn.
    #[serde(with = "humantime_serde", default = "default_loop_tick")]
    pub loop_tick: Duration,

    /// Global budget for the parsed-statement cache, split evenly across
    /// workers. `0` disables the cache entirely.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Global number of idle connections retained per target, split evenly
    /// across workers. `0` disables pooling.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity_per_target: usize,

    /// Idle pooled connections older than this are closed by the expiry
    /// sweep. Targets may override it individually.
    #[serde(with = "humantime_serde", default = "default_pool_idle_max_age")]
    pub pool_idle_max_age: Duration,

    /// How long a statement may wait for a pooled connection slot before
    /// it fails with a busy error.
    #[serde(with = "humantime_serde", default = "default_multiplex_timeout")]
    pub multiplex_timeout: Duration,

    /// Rebalance when the busiest and quietest workers' load percentages
    /// diverge by more than this.
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: u32,

    /// Interval between load samples taken by the coordinator. `0`
    /// disables session rebalancing.
    #[serde(with = "humantime_serde", default = "default_rebalance_window")]
    pub rebalance_window: Duration,

    /// Grace window for zombie descriptors and draining sessions during
    /// shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

fn default_worker_count() -> usize {
    4
}
fn default_loop_tick() -> Duration {
    Duration::from_millis(100)
}
fn default_cache_max_bytes() -> usize {
    16 * 1024 * 1024 // 16 MiB
}
fn default_pool_capacity() -> usize {
    64
}
fn default_pool_idle_max_age() -> Duration {
    Duration::from_secs(300)
}
fn default_multiplex_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_rebalance_threshold() -> u32 {
    20
}
fn default_rebalance_window() -> Duration {
    Duration::from_secs(10)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            loop_tick: default_loop_tick(),
            cache_max_bytes: default_cache_max_bytes(),
            pool_capacity_per_target: default_pool_capacity(),
            pool_idle_max_age: default_pool_idle_max_age(),
            multiplex_timeout: default_multiplex_timeout(),
            rebalance_threshold: default_rebalance_threshold(),
            rebalance_window: default_rebalance_window(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Config {
    /// Validates the configuration, returning a descriptive error for the
    /// first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        if self.loop_tick.is_zero() {
            bail!("loop_tick must be non-zero");
        }
        if self.rebalance_threshold > 100 {
            bail!(
                "rebalance_threshold is a percent difference; got {}",
                self.rebalance_threshold
            );
        }
        if self.shutdown_grace.is_zero() {
            bail!("shutdown_grace must be non-zero");
        }
        Ok(())
    }

    /// The per-worker share of the statement-cache budget.
    pub fn cache_budget_per_worker(&self) -> usize {
        self.cache_max_bytes / self.worker_count
    }

    /// The per-worker share of the idle-pool capacity for one target.
    pub fn pool_capacity_per_worker(&self) -> usize {
        self.pool_capacity_per_target / self.worker_count
    }
}

/// Declaration of one backend server the proxy may route to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetConfig {
    /// Human-readable name, used in logs and error replies.
    pub name: String,
    /// Address the core connects to.
    pub addr: SocketAddr,
    /// Hard cap on concurrent connections to this target across all
    /// workers. `0` means unlimited.
    #[serde(default)]
    pub max_connections: u32,
    /// Overrides `Config::pool_idle_max_age` for this target when set.
    #[serde(with = "humantime_serde", default)]
    pub persist_max_age: Option<Duration>,
    /// Whether statements may wait for a connection slot when the cap is
    /// reached, instead of failing fast.
    #[serde(default = "default_waiter_allowed")]
    pub waiter_allowed: bool,
}

fn default_waiter_allowed() -> bool {
    true
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            max_connections: 0,
            persist_max_age: None,
            waiter_allowed: default_waiter_allowed(),
        }
    }

    pub fn max_connections(mut self, cap: u32) -> Self {
        self.max_connections = cap;
        self
    }

    pub fn persist_max_age(mut self, age: Duration) -> Self {
        self.persist_max_age = Some(age);
        self
    }

    pub fn waiter_allowed(mut self, allowed: bool) -> Self {
        self.waiter_allowed = allowed;
        self
    }
}

/// Declaration of one listening socket and the codec/router pair that
/// sessions accepted on it are built from.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Builds the protocol module for each accepted session.
    pub protocol: Arc<dyn ProtocolFactory>,
    /// Builds the router policy instance for each accepted session.
    pub router: Arc<dyn RouterFactory>,
    /// Sessions idle longer than this are killed by the timeout sweep.
    pub session_idle_timeout: Option<Duration>,
    /// Statements in flight longer than this kill their session.
    pub statement_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(
        addr: SocketAddr,
        protocol: Arc<dyn ProtocolFactory>,
        router: Arc<dyn RouterFactory>,
    ) -> Self {
        Self {
            addr,
            protocol,
            router,
            session_idle_timeout: None,
            statement_timeout: None,
        }
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = Some(timeout);
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("addr", &self.addr)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}
