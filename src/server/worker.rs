// src/server/worker.rs

//! One OS thread bound to one readiness set.
//!
//! A worker exclusively owns its descriptors, sessions, pool, cache and
//! waiter queues; nothing on this thread blocks and no handler suspends
//! mid-flight. Each loop turn: block in the readiness call up to the
//! configured tick, dispatch descriptor events, drain the task inbox,
//! run due timed callbacks, then per-turn maintenance (zombie
//! destruction, load accounting).

use crate::config::Config;
use crate::core::cache::{CacheEntrySnapshot, CacheStats, StatementCache};
use crate::core::errors::ShuntError;
use crate::core::ids::{DescriptorHandle, SessionId, TargetId, WorkerId};
use crate::core::pool::{ActivationStatus, PoolGroup, PoolStats, WaiterQueues};
use crate::core::session::Session;
use crate::core::stats::{LoadGauge, WorkerStats};
use crate::server::context::{DeferredAction, WorkerCtx, install_descriptor};
use crate::server::descriptor::{Descriptor, DescriptorRole, EventHandler, Zombie};
use crate::server::inbox::Task;
use crate::server::listener::{TOKEN_WAKER, listener_index, listener_token};
use crate::server::registry::SessionRegistry;
use crate::server::runtime::Shared;
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const EVENTS_CAPACITY: usize = 1024;
const DRAIN_TICK: Duration = Duration::from_millis(100);
const LOAD_WINDOW: Duration = Duration::from_secs(1);

/// Accept batch bound per listener wakeup. A burst larger than this is
/// left for the next turn, so one worker cannot drain the whole backlog
/// solo while the kernel has other workers awake for it.
const MAX_ACCEPTS_PER_TURN: usize = 32;

/// Verdict a timed callback returns: finish, or run again after a delay.
pub enum TimerVerdict {
    Done,
    Rearm(Duration),
}

type TimerCallback = Box<dyn FnMut(&mut Worker) -> TimerVerdict + Send>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // Reversed so the binary heap pops the nearest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A migrating session and the descriptors it takes along: a one-shot
/// ownership transfer between workers.
pub struct SessionTicket {
    session: Session,
    client: Descriptor,
    backends: Vec<Descriptor>,
}

/// Snapshot of one readiness event, detached from the event buffer so
/// dispatch can borrow the worker freely.
#[derive(Debug, Clone, Copy)]
struct EventView {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    hangup: bool,
}

/// Outcome of the descriptor-level I/O phase of one event.
struct IoOutcome {
    handle: DescriptorHandle,
    role: DescriptorRole,
    handler: EventHandler,
    got_data: bool,
    became_connected: bool,
    /// Present when the descriptor is finished (EOF, error, hangup);
    /// carries the error to surface, if any.
    dead: Option<Option<ShuntError>>,
}

pub struct Worker {
    id: WorkerId,
    shared: Arc<Shared>,
    cfg: Config,
    poll: Poll,
    events: Events,
    descriptors: Slab<Descriptor>,
    generation: u32,
    sessions: SessionRegistry,
    zombies: Vec<Zombie>,
    inbox: Receiver<Task>,
    cache: StatementCache,
    pool: Arc<Mutex<PoolGroup>>,
    waiters: WaiterQueues,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    load: Arc<LoadGauge>,
    stats: WorkerStats,
    actions: Vec<DeferredAction>,
    draining: bool,
    stopped: bool,
    window_start: Instant,
    window_busy: Duration,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        shared: Arc<Shared>,
        poll: Poll,
        inbox: Receiver<Task>,
        load: Arc<LoadGauge>,
    ) -> Self {
        let cfg = shared.config.read().clone();
        let cache = StatementCache::new(cfg.cache_budget_per_worker());
        let pool = Arc::new(Mutex::new(PoolGroup::new(cfg.pool_capacity_per_worker())));
        Self {
            id,
            shared,
            cfg,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            descriptors: Slab::new(),
            generation: 0,
            sessions: SessionRegistry::new(),
            zombies: Vec::new(),
            inbox,
            cache,
            pool,
            waiters: WaiterQueues::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            load,
            stats: WorkerStats::default(),
            actions: Vec::new(),
            draining: false,
            stopped: false,
            window_start: Instant::now(),
            window_busy: Duration::ZERO,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn cache_mut(&mut self) -> &mut StatementCache {
        &mut self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_entries(&self) -> Vec<CacheEntrySnapshot> {
        self.cache.entries_snapshot()
    }

    pub fn pool_handle(&self) -> Arc<Mutex<PoolGroup>> {
        Arc::clone(&self.pool)
    }

    pub fn pool_stats(&self, target: TargetId) -> PoolStats {
        self.pool.lock().stats(target)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.ids()
    }

    pub fn waiter_count(&self, target: TargetId) -> usize {
        self.waiters.len(target)
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// A fresh copy of the shared configuration.
    pub fn shared_config_snapshot(&self) -> Config {
        self.shared.config.read().clone()
    }

    /// Schedules a one-shot timed callback.
    pub fn dcall(&mut self, delay: Duration, callback: impl FnOnce(&mut Worker) + Send + 'static) {
        let mut callback = Some(callback);
        self.schedule(delay, move |worker| {
            if let Some(cb) = callback.take() {
                cb(worker);
            }
            TimerVerdict::Done
        });
    }

    /// Schedules a timed callback that decides per run whether to re-arm.
    pub fn schedule(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&mut Worker) -> TimerVerdict + Send + 'static,
    ) {
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq,
            callback: Box::new(callback),
        });
    }

    /// The worker main loop. Returns when shutdown draining finishes.
    pub fn run(&mut self) {
        if let Err(e) = self.register_listeners() {
            warn!(worker = %self.id, error = %e, "failed to register listeners");
        }
        self.schedule(Duration::from_secs(1), |worker| {
            worker.run_maintenance();
            TimerVerdict::Rearm(Duration::from_secs(1))
        });
        if self.id.0 == 0 && self.shared.worker_count > 1 && !self.cfg.rebalance_window.is_zero() {
            let window = self.cfg.rebalance_window;
            self.schedule(window, move |worker| {
                worker.rebalance_tick();
                TimerVerdict::Rearm(window)
            });
        }
        info!(worker = %self.id, "worker started");
        while !self.stopped {
            self.turn();
        }
        self.teardown();
        info!(worker = %self.id, "worker finished");
        self.shared.finished.done();
    }

    fn register_listeners(&mut self) -> io::Result<()> {
        for (index, listener) in self.shared.listeners.iter().enumerate() {
            let fd = listener.socket.as_raw_fd();
            let mut source = SourceFd(&fd);
            self.poll
                .registry()
                .register(&mut source, listener_token(index), Interest::READABLE)?;
        }
        Ok(())
    }

    fn turn(&mut self) {
        let mut timeout = self.cfg.loop_tick;
        if let Some(entry) = self.timers.peek() {
            timeout = timeout.min(entry.deadline.saturating_duration_since(Instant::now()));
        }

        let block_start = Instant::now();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(worker = %self.id, error = %e, "readiness poll failed");
            }
        }
        let awake = Instant::now();
        self.stats.blocked_nanos += awake.duration_since(block_start).as_nanos() as u64;

        let batch: Vec<EventView> = self
            .events
            .iter()
            .map(|e| EventView {
                token: e.token(),
                readable: e.is_readable(),
                writable: e.is_writable(),
                error: e.is_error(),
                hangup: e.is_read_closed() || e.is_write_closed(),
            })
            .collect();
        self.stats.turns += 1;
        self.stats.event_queue_total += batch.len() as u64;
        self.stats.event_queue_max = self.stats.event_queue_max.max(batch.len());

        for event in batch {
            self.dispatch(event);
            self.apply_actions();
        }

        while let Ok(task) = self.inbox.try_recv() {
            match task {
                Task::Point(f) => f(self),
                Task::Broadcast(b) => b.execute(self),
            }
            self.apply_actions();
        }

        self.run_due_timers();
        self.reap_zombies();

        // Load accounting: busy share of the wall-clock window.
        let busy = awake.elapsed();
        self.stats.busy_nanos += busy.as_nanos() as u64;
        self.window_busy += busy;
        let window = self.window_start.elapsed();
        if window >= LOAD_WINDOW {
            let percent =
                (self.window_busy.as_nanos() * 100 / window.as_nanos().max(1)) as u32;
            self.load.record_window(percent);
            self.window_start = Instant::now();
            self.window_busy = Duration::ZERO;
        }
    }

    // --- Event dispatch ---------------------------------------------------

    fn dispatch(&mut self, event: EventView) {
        if event.token == TOKEN_WAKER {
            return;
        }
        if let Some(index) = listener_index(event.token) {
            let started = Instant::now();
            self.accept_ready(index);
            self.stats.accept_nanos += started.elapsed().as_nanos() as u64;
            return;
        }
        let Some(io) = self.descriptor_io(event) else {
            return;
        };

        let started = Instant::now();
        match io.handler {
            EventHandler::PoolStub(target) => self.pool_stub_event(io.handle, target),
            EventHandler::Session(session) => match io.role {
                DescriptorRole::Client => {
                    if io.got_data {
                        self.with_session(session, |s, ctx| s.on_client_data(ctx));
                    }
                    if io.dead.is_some() {
                        self.stats.hangups += 1;
                        self.close_descriptor(io.handle, Some(session), "client hangup");
                        self.with_session(session, |s, ctx| s.on_client_closed(ctx));
                    }
                    self.stats.client_handler_nanos += started.elapsed().as_nanos() as u64;
                }
                DescriptorRole::Backend => {
                    if io.became_connected {
                        self.with_session(session, |s, ctx| s.on_backend_connected(ctx, io.handle));
                    }
                    if io.got_data {
                        self.with_session(session, |s, ctx| s.on_backend_data(ctx, io.handle));
                    }
                    if let Some(err) = io.dead {
                        self.stats.hangups += 1;
                        self.close_descriptor(io.handle, Some(session), "backend hangup");
                        self.with_session(session, |s, ctx| {
                            s.on_backend_closed(ctx, io.handle, err)
                        });
                    }
                    self.stats.backend_handler_nanos += started.elapsed().as_nanos() as u64;
                }
            },
        }
    }

    /// Phase one of event handling: socket reads/writes on the
    /// descriptor, before any session logic runs.
    fn descriptor_io(&mut self, event: EventView) -> Option<IoOutcome> {
        let registry = self.poll.registry();
        let key = event.token.0;
        let desc = self.descriptors.get_mut(key)?;
        let handle = desc.handle(key);
        let mut outcome = IoOutcome {
            handle,
            role: desc.role,
            handler: desc.handler,
            got_data: false,
            became_connected: false,
            dead: None,
        };

        if event.readable {
            self.stats.reads += 1;
            match desc.fill() {
                Ok(read) => {
                    outcome.got_data = read.bytes > 0;
                    if read.eof {
                        desc.hung_up = true;
                        outcome.dead = Some(None);
                    }
                }
                Err(e) => {
                    desc.hung_up = true;
                    outcome.dead = Some(Some(e.into()));
                }
            }
        }

        if event.writable && outcome.dead.is_none() {
            if !desc.connected {
                match desc.take_connect_error() {
                    Some(e) => {
                        desc.hung_up = true;
                        outcome.dead = Some(Some(ShuntError::BackendTransient(format!(
                            "connect failed: {e}"
                        ))));
                    }
                    None => {
                        desc.connected = true;
                        outcome.became_connected = true;
                    }
                }
            }
            if desc.connected {
                match desc.flush() {
                    Ok(write) if !write.pending => {
                        let _ = desc.disarm_writable(registry, event.token);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        desc.hung_up = true;
                        outcome.dead = Some(Some(e.into()));
                    }
                }
            }
        }

        if (event.error || event.hangup) && outcome.dead.is_none() {
            self.stats.errors += u64::from(event.error);
            desc.hung_up = true;
            let err = desc
                .take_connect_error()
                .map(|e| ShuntError::BackendTransient(e.to_string()));
            outcome.dead = Some(err);
        }

        Some(outcome)
    }

    /// Any traffic on a pooled connection evicts and closes it.
    fn pool_stub_event(&mut self, handle: DescriptorHandle, target_id: TargetId) {
        debug!(worker = %self.id, %handle, target = %target_id, "traffic on pooled connection, evicting");
        let removed = self.pool.lock().remove_by_descriptor(target_id, handle);
        if removed.is_some()
            && let Some(target) = self.shared.target(target_id)
        {
            target.pooled_dec();
            target.connection_closed();
        }
        self.close_descriptor(handle, None, "pooled connection traffic");
        self.actions.push(DeferredAction::ReleaseNotify(target_id));
    }

    // --- Accept path ------------------------------------------------------

    fn accept_ready(&mut self, index: usize) {
        if self.draining {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let Some(listener) = shared.listeners.get(index) else {
            return;
        };
        let mut accepted = 0;
        loop {
            if accepted >= MAX_ACCEPTS_PER_TURN {
                // Edge-triggered readiness will not refire for a backlog
                // that is already pending, so hand the remainder to the
                // next loop turn through the inbox.
                if let Some(inbox) = shared.inboxes.get(self.id.0) {
                    inbox.post_fn(move |w| w.accept_ready(index));
                }
                break;
            }
            match listener.socket.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(worker = %self.id, error = %e, "accepted socket misconfigured");
                        continue;
                    }
                    self.spawn_session(index, TcpStream::from_std(stream), peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn spawn_session(&mut self, index: usize, stream: TcpStream, peer: std::net::SocketAddr) {
        let shared = Arc::clone(&self.shared);
        let listener = &shared.listeners[index];
        let session_id = SessionId(shared.allocate_session_id());
        let desc = Descriptor::new(
            stream,
            DescriptorRole::Client,
            EventHandler::Session(session_id),
        );
        let handle = match install_descriptor(
            &mut self.descriptors,
            self.poll.registry(),
            &mut self.generation,
            desc,
            Interest::READABLE,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "failed to register accepted client");
                return;
            }
        };
        self.stats.accepts += 1;
        self.stats.fd_count += 1;
        self.stats.fd_total += 1;
        self.stats.sessions_created += 1;

        let session = Session::new(
            session_id,
            self.id,
            handle,
            peer,
            listener.config.protocol.create(),
            listener.config.router.create(),
            listener.config.session_idle_timeout,
            listener.config.statement_timeout,
        );
        self.sessions.insert(session);
        self.with_session(session_id, |s, ctx| s.begin(ctx));
        debug!(worker = %self.id, session = %session_id, %peer, "client accepted");
    }

    // --- Split-borrow plumbing --------------------------------------------

    /// Runs a closure over one session plus the context slice of this
    /// worker. The split borrow keeps per-session code off the registry.
    pub fn with_session<T>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut Session, &mut WorkerCtx<'_>) -> T,
    ) -> Option<T> {
        let Worker {
            id: worker_id,
            shared,
            cfg,
            poll,
            descriptors,
            generation,
            sessions,
            zombies,
            cache,
            pool,
            waiters,
            stats,
            actions,
            draining,
            ..
        } = self;
        let session = sessions.get_mut(id)?;
        let mut ctx = WorkerCtx {
            worker: *worker_id,
            registry: poll.registry(),
            descriptors,
            generation,
            zombies,
            cache,
            pool: pool.as_ref(),
            waiters,
            stats,
            shared,
            config: cfg,
            actions,
            draining: *draining,
        };
        Some(f(session, &mut ctx))
    }

    /// Runs a closure over the context slice alone.
    fn with_ctx<T>(&mut self, f: impl FnOnce(&mut WorkerCtx<'_>) -> T) -> T {
        let Worker {
            id: worker_id,
            shared,
            cfg,
            poll,
            descriptors,
            generation,
            zombies,
            cache,
            pool,
            waiters,
            stats,
            actions,
            draining,
            ..
        } = self;
        let mut ctx = WorkerCtx {
            worker: *worker_id,
            registry: poll.registry(),
            descriptors,
            generation,
            zombies,
            cache,
            pool: pool.as_ref(),
            waiters,
            stats,
            shared,
            config: cfg,
            actions,
            draining: *draining,
        };
        f(&mut ctx)
    }

    fn close_descriptor(
        &mut self,
        handle: DescriptorHandle,
        session: Option<SessionId>,
        reason: &'static str,
    ) {
        self.with_ctx(|ctx| ctx.close_descriptor(handle, session, reason));
    }

    // --- Deferred actions -------------------------------------------------

    fn apply_actions(&mut self) {
        while !self.actions.is_empty() {
            let batch: Vec<DeferredAction> = self.actions.drain(..).collect();
            for action in batch {
                match action {
                    DeferredAction::ReleaseNotify(target_id) => {
                        self.activate_waiting_endpoints(target_id);
                        if let Some(target) = self.shared.target(target_id) {
                            for worker in target.waiting_workers() {
                                if worker != self.id.0
                                    && let Some(inbox) = self.shared.inboxes.get(worker)
                                {
                                    inbox.post_fn(move |w| {
                                        w.activate_waiting_endpoints(target_id);
                                    });
                                }
                            }
                        }
                    }
                    DeferredAction::DestroySession(session_id) => {
                        if self.sessions.remove(session_id).is_some() {
                            self.stats.sessions_destroyed += 1;
                        }
                    }
                }
            }
        }
    }

    /// Walks this worker's waiter FIFO for a target, giving each waiter
    /// one chance: success removes it, wait stops the walk, failure
    /// removes it with the error already surfaced.
    pub fn activate_waiting_endpoints(&mut self, target_id: TargetId) {
        loop {
            let Some(endpoint) = self.waiters.front(target_id) else {
                break;
            };
            let status = self
                .with_session(endpoint.session, |s, ctx| s.resume_waiter(ctx, target_id))
                .unwrap_or(ActivationStatus::Fail);
            match status {
                ActivationStatus::Success | ActivationStatus::Fail => {
                    self.waiters.pop_front(target_id);
                }
                ActivationStatus::Wait => break,
            }
        }
        if self.waiters.is_empty(target_id)
            && let Some(target) = self.shared.target(target_id)
        {
            target.remove_waiting_worker(self.id.0);
        }
    }

    // --- Timers -----------------------------------------------------------

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            match self.timers.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            let mut entry = self.timers.pop().expect("peeked entry");
            match (entry.callback)(self) {
                TimerVerdict::Done => {}
                TimerVerdict::Rearm(delay) => {
                    entry.deadline = Instant::now() + delay;
                    self.timers.push(entry);
                }
            }
            self.apply_actions();
        }
    }

    // --- Per-second maintenance -------------------------------------------

    fn run_maintenance(&mut self) {
        let now = Instant::now();

        // Pick up runtime reconfiguration (live shrink of cache or pool).
        let fresh = self.shared.config.read().clone();
        if fresh.cache_max_bytes != self.cfg.cache_max_bytes {
            self.cache.shrink_to(fresh.cache_budget_per_worker());
        }
        if fresh.pool_capacity_per_target != self.cfg.pool_capacity_per_target {
            self.pool
                .lock()
                .set_capacity(fresh.pool_capacity_per_worker());
        }
        self.cfg = fresh;

        // Session idle and statement timeouts.
        for session_id in self.sessions.ids() {
            self.with_session(session_id, |s, ctx| s.check_timeouts(ctx, now));
            self.apply_actions();
        }

        // Waiters past the multiplex timeout fail their statements.
        let expired = self.waiters.sweep_expired(now, self.cfg.multiplex_timeout);
        for endpoint in expired {
            let target_id = endpoint.target;
            self.with_session(endpoint.session, |s, ctx| s.fail_waiter(ctx, target_id));
            if self.waiters.is_empty(target_id)
                && let Some(target) = self.shared.target(target_id)
            {
                target.remove_waiting_worker(self.id.0);
            }
            self.apply_actions();
        }

        // Idle-pool expiry: age, down targets, capacity reductions.
        let targets = self.pool.lock().targets();
        for target_id in targets {
            let Some(target) = self.shared.target(target_id) else {
                continue;
            };
            let max_age = target.persist_max_age.unwrap_or(self.cfg.pool_idle_max_age);
            let expired = self
                .pool
                .lock()
                .expire(target_id, now, max_age, target.is_up());
            for entry in expired {
                trace!(worker = %self.id, target = %target.name, "closing expired pooled connection");
                target.pooled_dec();
                target.connection_closed();
                self.close_descriptor(entry.descriptor, None, "pooled connection expired");
                self.actions.push(DeferredAction::ReleaseNotify(target_id));
            }
            self.apply_actions();
        }
    }

    // --- Zombies ----------------------------------------------------------

    /// End-of-turn destruction of parked descriptors. A zombie dies once
    /// its replies are flushed and its session's backends report safe to
    /// close, or when the grace window expires; anything else is
    /// re-parked with a recorded reason.
    fn reap_zombies(&mut self) {
        if self.zombies.is_empty() {
            return;
        }
        let grace = self.cfg.shutdown_grace;
        let mut kept = Vec::new();
        for mut zombie in std::mem::take(&mut self.zombies) {
            let _ = zombie.descriptor.flush();
            let flushed = zombie.descriptor.write_buf.is_empty() || zombie.descriptor.hung_up;
            let session_safe = match zombie.session {
                None => true,
                Some(id) => self
                    .sessions
                    .get(id)
                    .map(|s| s.backends_safe_to_close())
                    .unwrap_or(true),
            };
            if (flushed && session_safe) || zombie.parked_at.elapsed() >= grace {
                self.stats.zombies_destroyed += 1;
            } else {
                zombie.reason = if flushed {
                    "backends not ready"
                } else {
                    "unflushed replies"
                };
                self.stats.zombies_reparked += 1;
                kept.push(zombie);
            }
        }
        self.zombies = kept;
    }

    // --- Migration --------------------------------------------------------

    /// Picks up to `count` of the most recently active movable sessions
    /// and transfers them to another worker. Non-movable candidates are
    /// declined and counted.
    pub fn migrate_sessions(&mut self, to: usize, count: usize) {
        if to == self.id.0 || to >= self.shared.worker_count {
            return;
        }
        let mut candidates: Vec<(SessionId, Instant)> = self
            .sessions
            .iter()
            .map(|(id, s)| (*id, s.last_activity))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut moved = 0;
        for (session_id, _) in candidates {
            if moved >= count {
                break;
            }
            match self.extract_session(session_id) {
                Some(ticket) => {
                    let from = self.id.0;
                    if let Some(inbox) = self.shared.inboxes.get(to) {
                        inbox.post_fn(move |w| w.install_ticket(ticket, from));
                    }
                    moved += 1;
                }
                None => self.stats.migrations_declined += 1,
            }
        }
        if moved > 0 {
            info!(worker = %self.id, to, moved, "migrated sessions");
        }
    }

    /// Detaches a movable session and its descriptors from this worker.
    fn extract_session(&mut self, id: SessionId) -> Option<SessionTicket> {
        if !self.sessions.get(id)?.is_movable() {
            return None;
        }
        let session = self.sessions.remove(id)?;
        let Some(client) = self.detach_descriptor(session.client) else {
            // Client descriptor went away underneath; session is gone.
            self.stats.sessions_destroyed += 1;
            return None;
        };
        let mut backends = Vec::new();
        for backend in &session.backends {
            if let Some(desc) = self.detach_descriptor(backend.descriptor) {
                backends.push(desc);
            }
        }
        Some(SessionTicket {
            session,
            client,
            backends,
        })
    }

    fn detach_descriptor(&mut self, handle: DescriptorHandle) -> Option<Descriptor> {
        let desc = self.descriptors.get(handle.key)?;
        if desc.generation() != handle.generation {
            return None;
        }
        let mut desc = self.descriptors.remove(handle.key);
        let _ = desc.deregister(self.poll.registry());
        self.stats.fd_count = self.stats.fd_count.saturating_sub(1);
        Some(desc)
    }

    /// Reconstructs a migrated session on this worker and acknowledges
    /// the source so its bookkeeping matches.
    pub fn install_ticket(&mut self, ticket: SessionTicket, from: usize) {
        let SessionTicket {
            mut session,
            client,
            backends,
        } = ticket;
        let interest = |desc: &Descriptor| {
            if desc.write_buf.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            }
        };
        let client_interest = interest(&client);
        let client_handle = match install_descriptor(
            &mut self.descriptors,
            self.poll.registry(),
            &mut self.generation,
            client,
            client_interest,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "failed to install migrated client");
                return;
            }
        };
        self.stats.fd_count += 1;
        self.stats.fd_total += 1;
        session.client = client_handle;
        session.owner = self.id;

        for (index, desc) in backends.into_iter().enumerate() {
            let backend_interest = interest(&desc);
            match install_descriptor(
                &mut self.descriptors,
                self.poll.registry(),
                &mut self.generation,
                desc,
                backend_interest,
            ) {
                Ok(handle) => {
                    self.stats.fd_count += 1;
                    self.stats.fd_total += 1;
                    if let Some(backend) = session.backends.get_mut(index) {
                        backend.descriptor = handle;
                    }
                }
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "failed to install migrated backend");
                }
            }
        }

        let session_id = session.id;
        self.sessions.insert(session);
        self.stats.sessions_migrated_in += 1;
        debug!(worker = %self.id, session = %session_id, from, "session migrated in");
        if let Some(inbox) = self.shared.inboxes.get(from) {
            inbox.post_fn(|w| w.stats.sessions_migrated_out += 1);
        }
    }

    // --- Rebalance (runs on worker 0) -------------------------------------

    fn rebalance_tick(&mut self) {
        let readings: Vec<u32> = self
            .shared
            .load_gauges
            .iter()
            .map(|g| g.read().one_sec)
            .collect();
        let Some((busiest, quietest, diff)) =
            crate::server::coordinator::evaluate_rebalance(&readings, self.cfg.rebalance_threshold)
        else {
            return;
        };
        info!(
            busiest,
            quietest, diff, "load divergence past threshold, requesting migration"
        );
        if let Some(inbox) = self.shared.inboxes.get(busiest) {
            inbox.post_fn(move |w| {
                let count = (w.session_count() * diff as usize / 200).max(1);
                w.migrate_sessions(quietest, count);
            });
        }
    }

    // --- Shutdown ---------------------------------------------------------

    /// Installs the per-worker drain callback: every 100 ms, close pool
    /// entries, then stop once the session registry is empty, otherwise
    /// politely kill each session.
    pub fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        info!(worker = %self.id, "draining");
        self.draining = true;
        self.drain_tick();
        if !self.stopped {
            self.schedule(DRAIN_TICK, |worker| match worker.drain_tick() {
                true => TimerVerdict::Done,
                false => TimerVerdict::Rearm(DRAIN_TICK),
            });
        }
    }

    /// One drain pass; returns true once the worker stopped.
    fn drain_tick(&mut self) -> bool {
        let drained = self.pool.lock().drain_all();
        for (target_id, entry) in drained {
            if let Some(target) = self.shared.target(target_id) {
                target.pooled_dec();
                target.connection_closed();
            }
            self.close_descriptor(entry.descriptor, None, "shutdown");
        }
        if self.sessions.is_empty() {
            self.stopped = true;
            return true;
        }
        for session_id in self.sessions.ids() {
            self.with_session(session_id, |s, ctx| {
                s.kill(ctx, Some(ShuntError::SessionKilled))
            });
            self.apply_actions();
        }
        false
    }

    fn teardown(&mut self) {
        // Final zombie flush: everything goes now, grace or not.
        for mut zombie in std::mem::take(&mut self.zombies) {
            let _ = zombie.descriptor.flush();
            self.stats.zombies_destroyed += 1;
        }
    }
}
