// src/server/runtime.rs

//! The explicit runtime handle: bootstrap, the state shared between
//! workers, and the embedding application's control surface.
//!
//! There are no process-wide singletons; everything workers share lives
//! here and is passed to constructors, and a worker thread keeps only its
//! own identity.

use crate::config::{Config, ListenerConfig, TargetConfig};
use crate::core::cache::{CacheEntrySnapshot, CacheStats};
use crate::core::ids::TargetId;
use crate::core::pool::{PoolStats, Target};
use crate::core::stats::{LoadGauge, LoadReading, StatsAggregate};
use crate::server::coordinator::{Coordinator, WaitGroup};
use crate::server::inbox::{InboxHandle, inbox};
use crate::server::listener::{ListenerSocket, MAX_LISTENERS, TOKEN_WAKER, bind};
use crate::server::worker::Worker;
use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::info;

/// State reachable from every worker thread.
pub struct Shared {
    /// Runtime configuration; workers re-read it on their maintenance
    /// sweep, which is how live reconfiguration propagates.
    pub config: RwLock<Config>,
    pub targets: Vec<Arc<Target>>,
    pub listeners: Vec<ListenerSocket>,
    pub inboxes: Vec<InboxHandle>,
    pub load_gauges: Vec<Arc<LoadGauge>>,
    pub worker_count: usize,
    pub shutdown_requested: AtomicBool,
    /// Drained by workers as they finish; `Runtime::join` waits on it.
    pub finished: WaitGroup,
    next_session_id: AtomicU64,
}

impl Shared {
    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.targets.get(id.0).cloned()
    }

    pub fn target_by_name(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.iter().find(|t| t.name == name).cloned()
    }

    /// Hands out globally unique, monotonically increasing session ids.
    pub fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Builds and starts a runtime from configuration, targets and
/// listeners.
pub struct RuntimeBuilder {
    config: Config,
    targets: Vec<TargetConfig>,
    listeners: Vec<ListenerConfig>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            targets: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn target(mut self, target: TargetConfig) -> Self {
        self.targets.push(target);
        self
    }

    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validates, binds, and spawns the worker threads.
    pub fn start(self) -> Result<Runtime> {
        self.config.validate()?;
        if self.listeners.len() > MAX_LISTENERS {
            bail!("too many listeners ({} max)", MAX_LISTENERS);
        }

        let targets: Vec<Arc<Target>> = self
            .targets
            .iter()
            .enumerate()
            .map(|(index, tc)| Arc::new(Target::from_config(TargetId(index), tc)))
            .collect();

        let mut listeners = Vec::new();
        for lc in self.listeners {
            let addr = lc.addr;
            listeners.push(bind(lc).with_context(|| format!("failed to bind {addr}"))?);
        }

        let worker_count = self.config.worker_count;
        let mut polls = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        let mut inboxes = Vec::with_capacity(worker_count);
        let mut load_gauges = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let poll = mio::Poll::new().context("failed to create readiness set")?;
            let waker = Arc::new(
                mio::Waker::new(poll.registry(), TOKEN_WAKER)
                    .context("failed to create worker waker")?,
            );
            let (handle, rx) = inbox(waker);
            polls.push(poll);
            receivers.push(rx);
            inboxes.push(handle);
            load_gauges.push(Arc::new(LoadGauge::new()));
        }

        let shared = Arc::new(Shared {
            config: RwLock::new(self.config),
            targets,
            listeners,
            inboxes,
            load_gauges,
            worker_count,
            shutdown_requested: AtomicBool::new(false),
            finished: WaitGroup::new(),
            next_session_id: AtomicU64::new(0),
        });
        shared.finished.add(worker_count);

        let mut handles = Vec::with_capacity(worker_count);
        for (index, (poll, rx)) in polls.into_iter().zip(receivers).enumerate() {
            let shared = Arc::clone(&shared);
            let load = Arc::clone(&shared.load_gauges[index]);
            let handle = std::thread::Builder::new()
                .name(format!("shunt-worker-{index}"))
                .spawn(move || {
                    let mut worker =
                        Worker::new(crate::core::ids::WorkerId(index), shared, poll, rx, load);
                    worker.run();
                })
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }
        info!(workers = worker_count, "runtime started");

        let coordinator = Coordinator::new(Arc::clone(&shared));
        Ok(Runtime {
            shared,
            coordinator,
            handles: Mutex::new(handles),
        })
    }
}

/// A running worker set and its control surface.
pub struct Runtime {
    shared: Arc<Shared>,
    coordinator: Coordinator,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// The addresses the runtime actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .listeners
            .iter()
            .filter_map(|l| l.socket.local_addr().ok())
            .collect()
    }

    pub fn target_id(&self, name: &str) -> Option<TargetId> {
        self.shared.target_by_name(name).map(|t| t.id)
    }

    /// Marks a target up or down; down targets stop being routed to and
    /// their pooled connections are closed by the next expiry sweep.
    pub fn set_target_up(&self, name: &str, up: bool) {
        if let Some(target) = self.shared.target_by_name(name) {
            target.set_up(up);
        }
    }

    /// Posts a point task to one worker.
    pub fn post_to(&self, worker: usize, f: impl FnOnce(&mut Worker) + Send + 'static) {
        self.coordinator.post_to(worker, f);
    }

    /// Posts a point task and blocks until the worker ran it.
    pub fn call_on<T: Send + 'static>(
        &self,
        worker: usize,
        f: impl FnOnce(&mut Worker) -> T + Send + 'static,
    ) -> Option<T> {
        let wait = Arc::new(WaitGroup::new());
        wait.add(1);
        let result = Arc::new(Mutex::new(None));
        let signal = Arc::clone(&wait);
        let slot = Arc::clone(&result);
        self.coordinator.post_to(worker, move |w| {
            *slot.lock() = Some(f(w));
            signal.done();
        });
        wait.wait();
        let mut slot = result.lock();
        slot.take()
    }

    /// Aggregate statistics, assembled by serial broadcast.
    pub fn aggregate_stats(&self) -> StatsAggregate {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.coordinator.broadcast_serial(move |worker| {
            sink.lock().push(worker.stats().clone());
        });
        StatsAggregate {
            per_worker: Arc::try_unwrap(collected)
                .map(|m| m.into_inner())
                .unwrap_or_default(),
        }
    }

    /// Per-worker cache statistics.
    pub fn cache_stats(&self) -> Vec<CacheStats> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.coordinator
            .broadcast_serial(move |worker| sink.lock().push(worker.cache_stats()));
        Arc::try_unwrap(collected)
            .map(|m| m.into_inner())
            .unwrap_or_default()
    }

    /// Every cache entry on every worker. Deliberately serial: the
    /// accumulated result can be too large to hold for all workers in
    /// parallel, so each worker's snapshot is collected before the next
    /// worker is asked.
    pub fn cache_entries(&self) -> Vec<Vec<CacheEntrySnapshot>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.coordinator
            .broadcast_serial(move |worker| sink.lock().push(worker.cache_entries()));
        Arc::try_unwrap(collected)
            .map(|m| m.into_inner())
            .unwrap_or_default()
    }

    /// Per-worker pool statistics for one target.
    pub fn pool_stats(&self, target: TargetId) -> Vec<PoolStats> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.coordinator
            .broadcast_serial(move |worker| sink.lock().push(worker.pool_stats(target)));
        Arc::try_unwrap(collected)
            .map(|m| m.into_inner())
            .unwrap_or_default()
    }

    /// Total live sessions across workers.
    pub fn session_count(&self) -> usize {
        let collected = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&collected);
        self.coordinator
            .broadcast_serial(move |worker| *sink.lock() += worker.session_count());
        let count = *collected.lock();
        count
    }

    /// Current load readings, one per worker.
    pub fn load_readings(&self) -> Vec<LoadReading> {
        self.shared.load_gauges.iter().map(|g| g.read()).collect()
    }

    /// Live-shrinks (or grows) the statement-cache budget. Workers apply
    /// it on their next maintenance sweep; this broadcast applies it now.
    pub fn resize_cache(&self, max_bytes: usize) {
        self.shared.config.write().cache_max_bytes = max_bytes;
        self.coordinator.broadcast(move |worker| {
            let share = worker.shared_config_snapshot().cache_budget_per_worker();
            worker.cache_mut().shrink_to(share);
        });
    }

    /// Live-adjusts the per-target pool capacity; excess idle entries are
    /// closed by the next expiry sweep.
    pub fn resize_pool(&self, capacity_per_target: usize) {
        self.shared.config.write().pool_capacity_per_target = capacity_per_target;
        self.coordinator.broadcast(move |worker| {
            let share = worker.shared_config_snapshot().pool_capacity_per_worker();
            worker.pool_handle().lock().set_capacity(share);
        });
    }

    /// Begins graceful shutdown: pools close, idle sessions drain, busy
    /// sessions are politely killed.
    pub fn start_shutdown(&self) {
        self.coordinator.start_shutdown();
    }

    /// Waits until every worker reported finished and joins the threads.
    pub fn join(self) {
        self.coordinator.wait_finished();
        for handle in self.handles.into_inner() {
            let _ = handle.join();
        }
        info!("runtime stopped");
    }
}
