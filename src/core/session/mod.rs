// src/core/session/mod.rs

//! The per-client-connection state machine.
//!
//! A session owns its client descriptor, references its backend
//! connections, and coordinates the protocol codec and the router policy.
//! Every method runs on the owning worker; a handler that cannot finish
//! synchronously records its residual state on the session and returns,
//! and the worker re-dispatches when readiness or a task fires.

mod routing;

pub use routing::BackendSlot;

use crate::core::errors::ShuntError;
use crate::core::ids::{DescriptorHandle, SessionId, TargetId, WorkerId};
use crate::core::pool::{PoolEntry, ReleaseOutcome, Target};
use crate::core::protocol::{
    BackendFlags, ClientPacket, ProtocolModule, ReplyShape, ReuseAttrs, RoutePlan, RouterModule,
    SessionView, Statement, StatementKind,
};
use crate::server::context::{DeferredAction, WorkerCtx};
use crate::server::descriptor::EventHandler;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tracing::debug;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionPhase {
    Init,
    Auth,
    Routing,
    Draining,
    Closed,
}

/// One live backend connection held by a session.
#[derive(Debug)]
pub struct SessionBackend {
    pub target: Arc<Target>,
    pub descriptor: DescriptorHandle,
    /// Session-neutral state snapshot, kept current so pooling and
    /// migration can judge the connection without waking it.
    pub attrs: ReuseAttrs,
    /// False until the non-blocking connect completes.
    pub connected: bool,
    /// Reply shapes still expected from this backend, oldest first.
    pub expected: VecDeque<ReplyShape>,
}

/// Bookkeeping for one dispatched statement: how many targets still owe a
/// terminal reply.
#[derive(Debug)]
pub(crate) struct StatementTracker {
    pub outstanding: usize,
    pub kind: StatementKind,
}

/// A statement parked because a target hit its connection cap; resumed by
/// waiter activation.
#[derive(Debug)]
pub(crate) struct SuspendedStatement {
    pub statement: Statement,
    pub plan: RoutePlan,
    /// Targets not yet dispatched, in plan order.
    pub pending: Vec<TargetId>,
}

pub struct Session {
    pub id: SessionId,
    pub owner: WorkerId,
    pub client: DescriptorHandle,
    pub peer: SocketAddr,
    pub phase: SessionPhase,
    pub backends: Vec<SessionBackend>,
    pub kill_requested: bool,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub idle_timeout: Option<Duration>,
    pub statement_timeout: Option<Duration>,

    pub(crate) protocol: Box<dyn ProtocolModule>,
    pub(crate) router: Box<dyn RouterModule>,
    pub(crate) trackers: VecDeque<StatementTracker>,
    pub(crate) suspended: Option<SuspendedStatement>,
    /// Packets framed by the codec while a statement was suspended;
    /// replayed in order once the suspension lifts.
    pub(crate) queued_packets: VecDeque<ClientPacket>,
    pub(crate) statement_deadline: Option<Instant>,
    /// The most recently fully dispatched statement, kept for one bounded
    /// transparent retry after a transient backend loss.
    pub(crate) last_statement: Option<(Statement, RoutePlan)>,
    pub(crate) retried_statement: bool,
    pub(crate) in_transaction: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        owner: WorkerId,
        client: DescriptorHandle,
        peer: SocketAddr,
        protocol: Box<dyn ProtocolModule>,
        router: Box<dyn RouterModule>,
        idle_timeout: Option<Duration>,
        statement_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            owner,
            client,
            peer,
            phase: SessionPhase::Init,
            backends: Vec::new(),
            kill_requested: false,
            created_at: now,
            last_activity: now,
            idle_timeout,
            statement_timeout,
            protocol,
            router,
            trackers: VecDeque::new(),
            suspended: None,
            queued_packets: VecDeque::new(),
            statement_deadline: None,
            last_statement: None,
            retried_statement: false,
            in_transaction: false,
        }
    }

    /// Runs once right after the accept: sends the server greeting when
    /// the protocol starts server-first and enters the auth exchange.
    pub fn begin(&mut self, ctx: &mut WorkerCtx<'_>) {
        if let Some(greeting) = self.protocol.client_greeting() {
            ctx.queue_write(self.client, greeting);
        }
        self.phase = SessionPhase::Auth;
    }

    /// True when no statement is in flight or parked.
    pub fn is_idle(&self) -> bool {
        self.trackers.is_empty() && self.suspended.is_none() && self.queued_packets.is_empty()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether every backend has settled: nothing expected, nothing
    /// mid-transaction. Zombie client descriptors wait on this before
    /// they are destroyed.
    pub fn backends_safe_to_close(&self) -> bool {
        self.backends
            .iter()
            .all(|b| b.expected.is_empty() && b.attrs.is_clean())
    }

    /// A session may be relocated between workers only when every backend
    /// is in a clean, self-contained protocol state and nothing is in
    /// flight.
    pub fn is_movable(&self) -> bool {
        self.phase == SessionPhase::Routing
            && !self.kill_requested
            && self.is_idle()
            && self
                .backends
                .iter()
                .all(|b| b.connected && b.expected.is_empty() && b.attrs.is_clean())
    }

    pub(crate) fn backend_index(&self, handle: DescriptorHandle) -> Option<usize> {
        self.backends.iter().position(|b| b.descriptor == handle)
    }

    pub(crate) fn backend_for_target(&self, target: TargetId) -> Option<usize> {
        self.backends.iter().position(|b| b.target.id == target)
    }

    pub(crate) fn live_targets(&self) -> Vec<TargetId> {
        self.backends.iter().map(|b| b.target.id).collect()
    }

    pub(crate) fn view<'a>(&self, targets: &'a [TargetId]) -> SessionView<'a> {
        SessionView {
            id: self.id,
            in_transaction: self.in_transaction,
            live_targets: targets,
        }
    }

    /// Sends a protocol-framed error to the client.
    pub(crate) fn surface_error(&mut self, ctx: &mut WorkerCtx<'_>, err: &ShuntError) {
        let reply = self.protocol.error_reply(err);
        ctx.queue_write(self.client, reply);
    }

    /// Enforces the idle and per-statement timeouts. Returns true when
    /// the session was killed.
    pub fn check_timeouts(&mut self, ctx: &mut WorkerCtx<'_>, now: Instant) -> bool {
        if matches!(self.phase, SessionPhase::Closed | SessionPhase::Draining) {
            return false;
        }
        if let Some(deadline) = self.statement_deadline
            && now >= deadline
        {
            debug!(session = %self.id, "statement timeout exceeded, killing session");
            self.kill(
                ctx,
                Some(ShuntError::ResourceBusy("statement timed out".into())),
            );
            return true;
        }
        if self.is_idle()
            && let Some(idle) = self.idle_timeout
            && now.duration_since(self.last_activity) >= idle
        {
            debug!(session = %self.id, "idle timeout exceeded, killing session");
            self.kill(ctx, None);
            return true;
        }
        false
    }

    /// The client descriptor closed. Clean backends are returned to the
    /// pool, dirty ones closed; the session object is destroyed while its
    /// descriptors linger as zombies under the grace window.
    pub fn on_client_closed(&mut self, ctx: &mut WorkerCtx<'_>) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        debug!(session = %self.id, peer = %self.peer, "client closed, draining session");
        self.phase = SessionPhase::Draining;
        while let Some(backend) = self.backends.pop() {
            if backend.connected && backend.expected.is_empty() && backend.attrs.is_clean() {
                self.pool_or_close_backend(ctx, backend);
            } else {
                self.close_backend(ctx, backend, "client gone with backend busy");
            }
        }
        self.forget_waiters(ctx);
        self.phase = SessionPhase::Closed;
        ctx.actions.push(DeferredAction::DestroySession(self.id));
    }

    /// Explicit kill: idle timeout, administrative request, shutdown, or
    /// an unrecoverable session error. Surfaces `err` to the client when
    /// the protocol can still frame a reply, then tears everything down.
    pub fn kill(&mut self, ctx: &mut WorkerCtx<'_>, err: Option<ShuntError>) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        if let Some(e) = &err {
            self.surface_error(ctx, e);
        }
        self.phase = SessionPhase::Draining;
        self.kill_requested = true;
        while let Some(backend) = self.backends.pop() {
            self.close_backend(ctx, backend, "session killed");
        }
        self.forget_waiters(ctx);
        ctx.close_descriptor(self.client, Some(self.id), "session closing");
        self.phase = SessionPhase::Closed;
        ctx.actions.push(DeferredAction::DestroySession(self.id));
    }

    /// Returns a finished-with backend to the pool when the release
    /// preconditions hold (healthy, clean, poolable, target up, space in
    /// the idle set); closes it otherwise. Either way the freed capacity
    /// is announced to waiters.
    pub(crate) fn pool_or_close_backend(&mut self, ctx: &mut WorkerCtx<'_>, backend: SessionBackend) {
        let target_id = backend.target.id;
        let healthy = ctx
            .descriptor(backend.descriptor)
            .map(|d| !d.hung_up && d.write_buf.is_empty())
            .unwrap_or(false);
        // Sessions parked on another worker cannot reach this worker's
        // idle set; closing instead of pooling frees the target capacity
        // they are actually waiting for.
        let others_starving = backend
            .target
            .waiting_workers()
            .iter()
            .any(|w| *w != ctx.worker.0);
        let poolable = healthy
            && !others_starving
            && backend.attrs.is_clean()
            && self.protocol.is_safe_to_reuse(&backend.attrs)
            && backend.target.is_up()
            && !ctx.draining;
        if poolable {
            let entry = PoolEntry {
                descriptor: backend.descriptor,
                attrs: backend.attrs.clone(),
                created_at: Instant::now(),
            };
            match ctx.pool.lock().release(target_id, entry) {
                ReleaseOutcome::Pooled => {
                    if let Some(desc) = ctx.descriptor(backend.descriptor) {
                        desc.handler = EventHandler::PoolStub(target_id);
                    }
                    backend.target.pooled_inc();
                    ctx.actions.push(DeferredAction::ReleaseNotify(target_id));
                    debug!(session = %self.id, target = %backend.target.name, "backend pooled");
                    return;
                }
                ReleaseOutcome::Rejected(_) => {}
            }
        }
        self.close_backend(ctx, backend, "backend not poolable");
    }

    /// Closes a backend connection outright, updating the target's shared
    /// counters and announcing the freed capacity.
    pub(crate) fn close_backend(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        backend: SessionBackend,
        reason: &'static str,
    ) {
        let target_id = backend.target.id;
        ctx.close_descriptor(backend.descriptor, Some(self.id), reason);
        backend.target.connection_closed();
        ctx.actions.push(DeferredAction::ReleaseNotify(target_id));
    }

    /// Drops any waiters this session holds and unregisters this worker
    /// from targets whose queues drained.
    fn forget_waiters(&mut self, ctx: &mut WorkerCtx<'_>) {
        let touched = ctx.waiters.remove_session(self.id);
        for target_id in touched {
            if ctx.waiters.is_empty(target_id)
                && let Some(target) = ctx.shared.target(target_id)
            {
                target.remove_waiting_worker(ctx.worker.0);
            }
        }
        self.suspended = None;
        self.queued_packets.clear();
    }

    /// Clears transaction state on every live backend.
    pub(crate) fn end_transaction(&mut self) {
        self.in_transaction = false;
        for backend in &mut self.backends {
            backend.attrs.flags.remove(BackendFlags::OPEN_TRANSACTION);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("backends", &self.backends.len())
            .field("in_flight", &self.trackers.len())
            .field("suspended", &self.suspended.is_some())
            .finish_non_exhaustive()
    }
}
