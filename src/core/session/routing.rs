// src/core/session/routing.rs

//! The per-statement flow: classify, route, dispatch, collect replies,
//! and recover from backend failures.

use super::{Session, SessionPhase, SessionBackend, StatementTracker, SuspendedStatement};
use crate::core::cache::StatementGuard;
use crate::core::errors::{ErrorSeverity, ShuntError};
use crate::core::ids::{DescriptorHandle, TargetId};
use crate::core::pool::{ActivationStatus, Endpoint, EnqueueOutcome};
use crate::core::protocol::{
    BackendFlags, ClientEvent, ClientPacket, RecoveryAction, ReplyShape, RoutePlan, Statement,
    StatementKind,
};
use crate::server::context::{DeferredAction, WorkerCtx};
use crate::server::descriptor::EventHandler;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Outcome of resolving a backend connection for one target.
#[derive(Debug)]
pub enum BackendSlot {
    /// Index into the session's backend list, ready for writes.
    Ready(usize),
    /// The target's connection cap is reached; a waiter was parked.
    Wait,
    Failed(ShuntError),
}

impl Session {
    /// Drives the client side: frames buffered bytes into events and
    /// routes each statement. While a statement is suspended on a waiter
    /// the client bytes stay buffered, which is how backpressure reaches
    /// the client.
    pub fn on_client_data(&mut self, ctx: &mut WorkerCtx<'_>) {
        if !matches!(self.phase, SessionPhase::Auth | SessionPhase::Routing) {
            if let Some(desc) = ctx.descriptor(self.client) {
                desc.read_buf.clear();
            }
            return;
        }
        if self.suspended.is_some() {
            return;
        }
        let mut events = Vec::new();
        let framing = {
            let Some(desc) = ctx.descriptor(self.client) else {
                return;
            };
            if desc.read_buf.is_empty() {
                return;
            }
            self.protocol.on_client_bytes(&mut desc.read_buf, &mut events)
        };
        if let Err(e) = framing {
            warn!(session = %self.id, error = %e, "malformed client bytes");
            self.kill(ctx, Some(e));
            return;
        }
        for event in events {
            if self.phase == SessionPhase::Closed {
                return;
            }
            match event {
                ClientEvent::AuthSucceeded => {
                    if self.phase == SessionPhase::Auth {
                        trace!(session = %self.id, "authentication complete");
                        self.phase = SessionPhase::Routing;
                    }
                }
                ClientEvent::AuthFailed(reply) => {
                    ctx.queue_write(self.client, reply);
                    self.kill(ctx, None);
                    return;
                }
                ClientEvent::Packet(packet) => {
                    if self.phase != SessionPhase::Routing {
                        self.kill(
                            ctx,
                            Some(ShuntError::InvalidState(
                                "statement before authentication".into(),
                            )),
                        );
                        return;
                    }
                    if self.suspended.is_some() {
                        self.queued_packets.push_back(packet);
                        continue;
                    }
                    self.last_activity = Instant::now();
                    let statement = self.classify(ctx, packet);
                    self.dispatch_statement(ctx, statement);
                }
                ClientEvent::Quit => {
                    debug!(session = %self.id, "client quit");
                    self.kill(ctx, None);
                    return;
                }
            }
        }
    }

    /// Obtains the parse result for a packet: an O(1) cache hit, or a
    /// fresh parse inserted by the scope guard on the way out. Statements
    /// whose meaning depends on session state are excluded from caching.
    pub(crate) fn classify(&mut self, ctx: &mut WorkerCtx<'_>, packet: ClientPacket) -> Statement {
        let parse = match packet.fingerprint.as_deref() {
            Some(fingerprint) => {
                let mut guard = StatementGuard::new(ctx.cache, fingerprint);
                match guard.cached() {
                    Some(parse) => parse,
                    None => {
                        let fresh = Arc::new(self.protocol.parse(&packet));
                        if fresh.touches_session_state {
                            guard.exclude();
                        }
                        guard.produced(Arc::clone(&fresh));
                        fresh
                    }
                }
            }
            None => Arc::new(self.protocol.parse(&packet)),
        };
        Statement { packet, parse }
    }

    /// Routes one statement: asks the policy for a target set, resolves a
    /// backend per target (reuse, fresh connect, or waiter), and writes
    /// the serialized statement to each.
    pub(crate) fn dispatch_statement(&mut self, ctx: &mut WorkerCtx<'_>, statement: Statement) {
        let targets = self.live_targets();
        let plan = {
            let view = self.view(&targets);
            match self.router.on_statement(&statement, &view) {
                Ok(plan) => plan,
                Err(e) => {
                    debug!(session = %self.id, error = %e, "router rejected statement");
                    self.surface_error(ctx, &e);
                    return;
                }
            }
        };
        if plan.targets.is_empty() {
            self.surface_error(
                ctx,
                &ShuntError::NoTargetAvailable("router produced no targets".into()),
            );
            return;
        }
        if statement.parse.kind == StatementKind::Begin {
            self.in_transaction = true;
        }
        let expecting = match plan.reply_shape {
            ReplyShape::NoReply => 0,
            _ => plan.targets.len(),
        };
        self.trackers.push_back(StatementTracker {
            outstanding: expecting,
            kind: statement.parse.kind,
        });
        if let Some(timeout) = self.statement_timeout {
            self.statement_deadline = Some(Instant::now() + timeout);
        }

        let mut pending: Vec<TargetId> = plan.targets.clone();
        while let Some(target_id) = pending.first().copied() {
            match self.ensure_backend(ctx, target_id) {
                BackendSlot::Ready(index) => {
                    self.write_statement(ctx, index, &statement, &plan);
                    pending.remove(0);
                }
                BackendSlot::Wait => {
                    trace!(session = %self.id, target = %target_id, "statement suspended on waiter");
                    self.suspended = Some(SuspendedStatement {
                        statement,
                        plan,
                        pending,
                    });
                    return;
                }
                BackendSlot::Failed(e) => {
                    self.dispatch_failed(ctx, e);
                    return;
                }
            }
        }
        let kind = statement.parse.kind;
        self.last_statement = Some((statement, plan));
        if expecting == 0 {
            self.trackers.pop_back();
            self.on_statement_complete(ctx, kind);
        }
    }

    /// Finds or creates a backend connection for a target: an existing
    /// session backend, a scored pool reuse, or a fresh connect under the
    /// target's admission control. When the cap is hit and the target
    /// allows waiting, the session parks an endpoint instead.
    pub(crate) fn ensure_backend(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        target_id: TargetId,
    ) -> BackendSlot {
        if let Some(index) = self.backend_for_target(target_id) {
            return BackendSlot::Ready(index);
        }
        let Some(target) = ctx.target(target_id) else {
            return BackendSlot::Failed(ShuntError::NoTargetAvailable(format!(
                "unknown target {target_id}"
            )));
        };
        if !target.is_up() {
            return BackendSlot::Failed(ShuntError::NoTargetAvailable(format!(
                "target '{}' is down",
                target.name
            )));
        }

        // Reuse: score every idle entry against this session's needs.
        let wanted = self.protocol.wanted_attrs();
        let reused = {
            let protocol = &self.protocol;
            ctx.pool
                .lock()
                .acquire(target_id, |idle| protocol.reuse_score(idle, &wanted))
        };
        if let Some(entry) = reused {
            target.pooled_dec();
            let session_id = self.id;
            let descriptor_live = ctx
                .descriptor(entry.descriptor)
                .map(|d| d.handler = EventHandler::Session(session_id))
                .is_some();
            if descriptor_live {
                if let Some(reset) = self.protocol.reset_for_pooling(target_id) {
                    ctx.queue_write(entry.descriptor, reset);
                }
                trace!(session = %self.id, target = %target.name, "reusing pooled backend");
                self.backends.push(SessionBackend {
                    target,
                    descriptor: entry.descriptor,
                    attrs: entry.attrs,
                    connected: true,
                    expected: VecDeque::new(),
                });
                return BackendSlot::Ready(self.backends.len() - 1);
            }
            // Stale pooled descriptor; fall through to a fresh connect.
            debug!(target = %target.name, "pooled entry had a stale descriptor");
        }

        // Fresh connection under intent-based admission control.
        match target.try_admit() {
            Some(intent) => match ctx.connect_backend(&target, self.id) {
                Ok(handle) => {
                    intent.commit();
                    if let Some(greeting) = self.protocol.backend_greeting(target_id) {
                        ctx.queue_write(handle, greeting);
                    }
                    self.backends.push(SessionBackend {
                        target,
                        descriptor: handle,
                        attrs: self.protocol.wanted_attrs(),
                        connected: false,
                        expected: VecDeque::new(),
                    });
                    BackendSlot::Ready(self.backends.len() - 1)
                }
                // The intent guard drops here, before any retry would
                // re-admit.
                Err(e) => BackendSlot::Failed(e),
            },
            None if target.waiter_allowed => {
                let endpoint = Endpoint {
                    session: self.id,
                    target: target_id,
                    enqueued_at: Instant::now(),
                };
                match ctx.waiters.enqueue(endpoint) {
                    EnqueueOutcome::Queued => {
                        target.add_waiting_worker(ctx.worker.0);
                        ctx.stats.waiters_enqueued += 1;
                        BackendSlot::Wait
                    }
                    EnqueueOutcome::AlreadyQueued => BackendSlot::Wait,
                    EnqueueOutcome::Full => BackendSlot::Failed(ShuntError::ResourceBusy(
                        format!("waiter queue for '{}' is full", target.name),
                    )),
                }
            }
            None => BackendSlot::Failed(ShuntError::ConnectionCapReached(target.name.clone())),
        }
    }

    /// Serializes and queues one statement on a backend, recording the
    /// expected reply shape.
    pub(crate) fn write_statement(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        index: usize,
        statement: &Statement,
        plan: &RoutePlan,
    ) {
        let payload = self
            .protocol
            .serialize_for_backend(statement, plan.transform.as_ref());
        let backend = &mut self.backends[index];
        if plan.reply_shape != ReplyShape::NoReply {
            backend.expected.push_back(plan.reply_shape);
        }
        if self.in_transaction {
            backend.attrs.flags.insert(BackendFlags::OPEN_TRANSACTION);
        }
        let handle = backend.descriptor;
        ctx.queue_write(handle, payload);
        ctx.stats.writes += 1;
    }

    /// A non-blocking backend connect completed.
    pub fn on_backend_connected(&mut self, _ctx: &mut WorkerCtx<'_>, handle: DescriptorHandle) {
        if let Some(index) = self.backend_index(handle) {
            trace!(session = %self.id, target = %self.backends[index].target.name, "backend connected");
            self.backends[index].connected = true;
        }
    }

    /// Frames buffered backend bytes into reply packets and lets the
    /// router judge each: splice to the client, account the terminal
    /// reply, or both.
    pub fn on_backend_data(&mut self, ctx: &mut WorkerCtx<'_>, handle: DescriptorHandle) {
        let Some(index) = self.backend_index(handle) else {
            // A reply for a backend the session no longer tracks.
            ctx.close_descriptor(handle, Some(self.id), "reply on untracked backend");
            return;
        };
        let target_id = self.backends[index].target.id;
        let mut packets = Vec::new();
        let framing = {
            let Some(desc) = ctx.descriptor(handle) else {
                return;
            };
            self.protocol
                .on_backend_bytes(target_id, &mut desc.read_buf, &mut packets)
        };
        if let Err(e) = framing {
            self.backend_failed(ctx, handle, e);
            return;
        }
        let targets = self.live_targets();
        for packet in packets {
            if self.phase == SessionPhase::Closed {
                return;
            }
            let disposition = {
                let view = self.view(&targets);
                self.router.on_reply(target_id, &packet, &view)
            };
            if disposition.append_to_client {
                ctx.queue_write(self.client, packet);
            }
            if disposition.is_terminal {
                // Completing a statement may release other backends and
                // shift the list; resolve the index fresh per packet.
                let Some(index) = self.backend_index(handle) else {
                    break;
                };
                let backend = &mut self.backends[index];
                backend.expected.pop_front();
                match disposition.next_expected {
                    Some(shape) => backend.expected.push_front(shape),
                    None => self.statement_reply_complete(ctx),
                }
            }
        }
    }

    /// One target delivered its terminal reply; when every target of the
    /// oldest statement has, the statement is done.
    fn statement_reply_complete(&mut self, ctx: &mut WorkerCtx<'_>) {
        let completed = match self.trackers.front_mut() {
            Some(tracker) => {
                tracker.outstanding = tracker.outstanding.saturating_sub(1);
                tracker.outstanding == 0
            }
            None => {
                debug!(session = %self.id, "terminal reply with no statement in flight");
                false
            }
        };
        if completed
            && let Some(tracker) = self.trackers.pop_front()
        {
            self.on_statement_complete(ctx, tracker.kind);
        }
    }

    /// Statement epilogue: reset retry budget, close the transaction on
    /// commit/rollback, hand idle backends back to the pool, and honor a
    /// deferred kill.
    fn on_statement_complete(&mut self, ctx: &mut WorkerCtx<'_>, kind: StatementKind) {
        self.last_activity = Instant::now();
        self.retried_statement = false;
        if self.trackers.is_empty() {
            self.statement_deadline = None;
        }
        if matches!(kind, StatementKind::Commit | StatementKind::Rollback) {
            self.end_transaction();
        }
        if !self.in_transaction && self.suspended.is_none() {
            self.release_idle_backends(ctx);
        }
        if self.kill_requested && self.is_idle() {
            self.kill(ctx, None);
        }
    }

    /// Detaches every finished, clean backend and hands it to the pool.
    pub(crate) fn release_idle_backends(&mut self, ctx: &mut WorkerCtx<'_>) {
        let mut index = 0;
        while index < self.backends.len() {
            let backend = &self.backends[index];
            let releasable = backend.connected
                && backend.expected.is_empty()
                && backend.attrs.is_clean()
                && self.protocol.is_safe_to_reuse(&backend.attrs);
            if releasable {
                let backend = self.backends.remove(index);
                self.pool_or_close_backend(ctx, backend);
            } else {
                index += 1;
            }
        }
    }

    /// A backend descriptor died (hangup, error, EOF). The worker has
    /// already parked the descriptor; this applies the failure semantics.
    pub fn on_backend_closed(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        handle: DescriptorHandle,
        err: Option<ShuntError>,
    ) {
        let Some(index) = self.backend_index(handle) else {
            return;
        };
        let backend = self.backends.remove(index);
        let target_id = backend.target.id;
        let target_name = backend.target.name.clone();
        let had_in_flight = !backend.expected.is_empty();
        let was_in_transaction =
            self.in_transaction || backend.attrs.flags.contains(BackendFlags::OPEN_TRANSACTION);
        backend.target.connection_closed();
        ctx.actions.push(DeferredAction::ReleaseNotify(target_id));

        let err = err.unwrap_or_else(|| {
            ShuntError::BackendTransient(format!("connection to '{target_name}' lost"))
        });

        if !had_in_flight && !was_in_transaction {
            // An idle backend went away; the session routes around it.
            debug!(session = %self.id, target = %target_name, "idle backend lost");
            return;
        }

        self.backend_failure_semantics(ctx, target_id, err, was_in_transaction);
    }

    /// A backend produced malformed bytes or a codec-level error; close
    /// it and apply the failure semantics.
    pub(crate) fn backend_failed(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        handle: DescriptorHandle,
        err: ShuntError,
    ) {
        let Some(index) = self.backend_index(handle) else {
            return;
        };
        let backend = self.backends.remove(index);
        let target_id = backend.target.id;
        let was_in_transaction =
            self.in_transaction || backend.attrs.flags.contains(BackendFlags::OPEN_TRANSACTION);
        self.close_backend(ctx, backend, "backend protocol failure");
        self.backend_failure_semantics(ctx, target_id, err, was_in_transaction);
    }

    /// Transient errors outside an open transaction earn one silent
    /// retry; transient errors inside a transaction and permanent errors
    /// surface to the client with the transaction considered aborted.
    /// Losing the last backend while work is in flight drains the
    /// session.
    fn backend_failure_semantics(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        target_id: TargetId,
        err: ShuntError,
        was_in_transaction: bool,
    ) {
        let targets = self.live_targets();
        let action = {
            let view = self.view(&targets);
            self.router.on_failure(target_id, &err, &view)
        };
        let may_retry = err.severity() == ErrorSeverity::Transient
            && !was_in_transaction
            && !self.retried_statement
            && self.last_statement.is_some();

        match action {
            RecoveryAction::Retry if may_retry => {
                self.retried_statement = true;
                let (statement, plan) = self.last_statement.clone().expect("checked above");
                debug!(session = %self.id, target = %target_id, "retrying statement on a fresh backend");
                match self.ensure_backend(ctx, target_id) {
                    BackendSlot::Ready(index) => {
                        // The tracker still counts this target; only the
                        // per-backend expectation needs rebuilding.
                        self.write_statement(ctx, index, &statement, &plan);
                    }
                    BackendSlot::Wait | BackendSlot::Failed(_) => {
                        self.fail_in_flight(ctx, &err, was_in_transaction);
                    }
                }
            }
            RecoveryAction::Retry => self.fail_in_flight(ctx, &err, was_in_transaction),
            RecoveryAction::Surface(e) => self.fail_in_flight(ctx, &e, was_in_transaction),
            RecoveryAction::Drain => {
                self.kill(ctx, Some(err));
                return;
            }
        }

        if self.backends.is_empty() && !self.is_idle() && self.phase != SessionPhase::Closed {
            // Lost the last backend with work still in flight.
            self.kill(ctx, None);
        }
    }

    /// Fails everything currently in flight with one client-visible
    /// error; the session survives unless draining follows.
    fn fail_in_flight(&mut self, ctx: &mut WorkerCtx<'_>, err: &ShuntError, aborted_txn: bool) {
        if aborted_txn {
            self.end_transaction();
            self.surface_error(ctx, &ShuntError::TransactionAborted);
        } else {
            self.surface_error(ctx, err);
        }
        self.trackers.clear();
        self.statement_deadline = None;
    }

    /// One waiter activation chance for this session's suspended
    /// statement. Success finishes the dispatch and replays queued
    /// packets; Wait leaves the endpoint parked.
    pub fn resume_waiter(&mut self, ctx: &mut WorkerCtx<'_>, target_id: TargetId) -> ActivationStatus {
        let Some(mut suspended) = self.suspended.take() else {
            return ActivationStatus::Fail;
        };
        if !suspended.pending.contains(&target_id) {
            // Stale activation for a target this statement no longer
            // needs; put the suspension back untouched.
            self.suspended = Some(suspended);
            return ActivationStatus::Fail;
        }
        while let Some(next) = suspended.pending.first().copied() {
            match self.ensure_backend(ctx, next) {
                BackendSlot::Ready(index) => {
                    self.write_statement(ctx, index, &suspended.statement, &suspended.plan);
                    suspended.pending.remove(0);
                }
                BackendSlot::Wait => {
                    self.suspended = Some(suspended);
                    return ActivationStatus::Wait;
                }
                BackendSlot::Failed(e) => {
                    self.surface_error(ctx, &e);
                    self.trackers.pop_back();
                    self.replay_queued(ctx);
                    return ActivationStatus::Fail;
                }
            }
        }
        self.last_statement = Some((suspended.statement, suspended.plan));
        ctx.stats.waiters_activated += 1;
        self.replay_queued(ctx);
        ActivationStatus::Success
    }

    /// This session's waiter for `target_id` exceeded the multiplex
    /// timeout: the statement fails, the session survives.
    pub fn fail_waiter(&mut self, ctx: &mut WorkerCtx<'_>, target_id: TargetId) {
        let Some(suspended) = self.suspended.take() else {
            return;
        };
        if !suspended.pending.contains(&target_id) {
            self.suspended = Some(suspended);
            return;
        }
        let target_name = ctx
            .target(target_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| target_id.to_string());
        self.surface_error(ctx, &ShuntError::WaiterTimeout(target_name));
        self.trackers.pop_back();
        ctx.stats.waiters_expired += 1;
        self.replay_queued(ctx);
    }

    /// Replays packets that were framed while the session was suspended,
    /// then resumes consuming the client read buffer.
    fn replay_queued(&mut self, ctx: &mut WorkerCtx<'_>) {
        while self.suspended.is_none() && self.phase == SessionPhase::Routing {
            let Some(packet) = self.queued_packets.pop_front() else {
                break;
            };
            self.last_activity = Instant::now();
            let statement = self.classify(ctx, packet);
            self.dispatch_statement(ctx, statement);
        }
        if self.suspended.is_none() && self.phase == SessionPhase::Routing {
            self.on_client_data(ctx);
        }
    }

    /// A routing-time failure before anything was written: the tracker
    /// created for this statement is discarded and the error surfaced.
    fn dispatch_failed(&mut self, ctx: &mut WorkerCtx<'_>, err: ShuntError) {
        self.trackers.pop_back();
        if self.trackers.is_empty() {
            self.statement_deadline = None;
        }
        self.surface_error(ctx, &err);
    }
}
