// src/core/protocol.rs

//! Contracts between the core and its external collaborators: the wire
//! codec (protocol module) and the routing policy (router module).
//!
//! The core is protocol-agnostic. The one protocol-shaped invariant it
//! enforces is packet framing opacity: the codec says "here is one logical
//! packet, ready to forward" and the core splices it without
//! interpretation. Codecs and routers never touch descriptors, worker
//! state, or the pool directly; these traits are the entire boundary.

use crate::core::errors::ShuntError;
use crate::core::ids::{SessionId, TargetId};
use crate::server::buffer::ChunkQueue;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;

/// Coarse classification of a routable statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
    /// Alters per-session state (e.g. `USE db`, `SET ...`); routed to all
    /// live backends so their state stays coherent.
    SessionState,
    Begin,
    Commit,
    Rollback,
    Other,
}

/// The immutable, shareable output of the CPU-heavy statement
/// classification. The core caches these per worker; a cache hit hands out
/// a cheap `Arc` clone, never a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    pub kind: StatementKind,
    pub is_write: bool,
    pub touches_session_state: bool,
    /// Heap bytes held by the parser's output, reported by the parser so
    /// the cache can account for it.
    pub size_hint: usize,
}

/// A shared reference to a cached parse result.
pub type SharedParse = Arc<ParseResult>;

/// One logical client packet produced by the codec.
#[derive(Debug, Clone)]
pub struct ClientPacket {
    /// The framed payload, ready to forward.
    pub payload: Bytes,
    /// Canonical statement text (literals stripped, whitespace
    /// normalized), present iff the packet is a routable, cacheable
    /// statement.
    pub fingerprint: Option<Box<str>>,
}

/// A classified statement ready for routing.
#[derive(Debug, Clone)]
pub struct Statement {
    pub packet: ClientPacket,
    pub parse: SharedParse,
}

/// Events the codec surfaces from the client side of a session.
#[derive(Debug)]
pub enum ClientEvent {
    /// The protocol-level auth exchange completed.
    AuthSucceeded,
    /// The auth exchange failed; the payload is already a protocol-framed
    /// error reply for the client.
    AuthFailed(Bytes),
    /// One complete, routable packet.
    Packet(ClientPacket),
    /// The client asked to close the session cleanly.
    Quit,
}

/// How many reply messages a routed statement expects from each target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Exactly one reply.
    Single,
    /// A known number of replies.
    Multiple(u32),
    /// Fire-and-forget; no reply will arrive.
    NoReply,
}

/// The router's decision for one statement.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Targets the statement is dispatched to, in order. The first entry
    /// is the reply source unless the router says otherwise per packet.
    pub targets: Vec<TargetId>,
    pub reply_shape: ReplyShape,
    /// Replacement payload when the router rewrites the statement.
    pub transform: Option<Bytes>,
}

/// The router's verdict on one backend reply packet.
#[derive(Debug, Clone, Copy)]
pub struct ReplyDisposition {
    /// Splice this packet into the client's write buffer.
    pub append_to_client: bool,
    /// This packet completes the current expected reply.
    pub is_terminal: bool,
    /// A follow-up reply the backend will send beyond the original shape
    /// (e.g. a result set continued past the first header).
    pub next_expected: Option<ReplyShape>,
}

/// What the router wants done about a backend failure.
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Reconnect and replay the in-flight statement (bounded by the
    /// session's retry budget).
    Retry,
    /// Surface the error to the client; the session continues.
    Surface(ShuntError),
    /// The session cannot continue; drain it.
    Drain,
}

bitflags! {
    /// Per-backend-connection protocol state that blocks pooling or
    /// migration while set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackendFlags: u8 {
        const OPEN_TRANSACTION   = 0b0000_0001;
        const STREAMING_RESULT   = 0b0000_0010;
        const PREPARED_IN_FLIGHT = 0b0000_0100;
    }
}

/// Session-neutral snapshot of a backend connection's state, kept with
/// pooled entries so reuse can answer "can I serve session X?" without
/// waking the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReuseAttrs {
    pub database: Option<Box<str>>,
    pub user: Option<Box<str>>,
    pub flags: BackendFlags,
}

impl ReuseAttrs {
    /// A connection is clean when no protocol state is in flight.
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Ranking of how well an idle pooled connection matches a session's
/// requirements. `Optimal` short-circuits the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseScore {
    NotPossible,
    Possible(u32),
    Optimal,
}

impl ReuseScore {
    /// True when `self` ranks strictly better than `other`.
    pub fn beats(&self, other: &ReuseScore) -> bool {
        match (self, other) {
            (ReuseScore::Optimal, ReuseScore::Optimal) => false,
            (ReuseScore::Optimal, _) => true,
            (_, ReuseScore::Optimal) => false,
            (ReuseScore::Possible(a), ReuseScore::Possible(b)) => a > b,
            (ReuseScore::Possible(_), ReuseScore::NotPossible) => true,
            (ReuseScore::NotPossible, _) => false,
        }
    }
}

/// Read-only view of a session handed to router callbacks.
#[derive(Debug)]
pub struct SessionView<'a> {
    pub id: SessionId,
    pub in_transaction: bool,
    /// Targets the session currently holds live backends for.
    pub live_targets: &'a [TargetId],
}

/// The wire-protocol codec for one session. Implemented by external
/// protocol modules (MySQL, PostgreSQL, ...); the core never interprets
/// payload bytes itself.
pub trait ProtocolModule: Send {
    /// Bytes to send to the client immediately after accept (a server
    /// greeting), if the protocol starts server-first.
    fn client_greeting(&mut self) -> Option<Bytes> {
        None
    }

    /// Consumes the client read buffer and yields zero or more events.
    /// Incomplete frames stay buffered for the next readiness wakeup.
    fn on_client_bytes(
        &mut self,
        buf: &mut ChunkQueue,
        out: &mut Vec<ClientEvent>,
    ) -> Result<(), ShuntError>;

    /// The CPU-heavy statement classification. The core memoizes results
    /// by fingerprint in the per-worker statement cache; this runs only on
    /// a cache miss.
    fn parse(&mut self, packet: &ClientPacket) -> ParseResult;

    /// Frames `stmt` (or the router's `transform` of it) for a backend.
    fn serialize_for_backend(&mut self, stmt: &Statement, transform: Option<&Bytes>) -> Bytes;

    /// Bytes to send on a freshly opened backend connection (handshake /
    /// auth), if the protocol needs them. Handshake replies are consumed
    /// inside `on_backend_bytes` and not surfaced as packets.
    fn backend_greeting(&mut self, target: TargetId) -> Option<Bytes> {
        let _ = target;
        None
    }

    /// Consumes a backend read buffer and yields complete logical reply
    /// packets, each ready to forward verbatim.
    fn on_backend_bytes(
        &mut self,
        target: TargetId,
        buf: &mut ChunkQueue,
        out: &mut Vec<Bytes>,
    ) -> Result<(), ShuntError>;

    /// The session's current requirements, matched against pooled
    /// connections' snapshots during acquire.
    fn wanted_attrs(&self) -> ReuseAttrs {
        ReuseAttrs::default()
    }

    /// Scores an idle pooled connection against this session's
    /// requirements.
    fn reuse_score(&self, idle: &ReuseAttrs, wanted: &ReuseAttrs) -> ReuseScore {
        if !idle.is_clean() {
            return ReuseScore::NotPossible;
        }
        if idle == wanted {
            ReuseScore::Optimal
        } else {
            ReuseScore::Possible(1)
        }
    }

    /// Whether a backend connection in state `attrs` may be detached from
    /// this session and returned to the pool.
    fn is_safe_to_reuse(&self, attrs: &ReuseAttrs) -> bool {
        attrs.is_clean()
    }

    /// Bytes that reset a backend's session-scoped state before pooling
    /// (e.g. `COM_RESET_CONNECTION`), if the protocol needs them.
    fn reset_for_pooling(&mut self, target: TargetId) -> Option<Bytes> {
        let _ = target;
        None
    }

    /// A protocol-framed error reply the core can send to the client.
    fn error_reply(&self, err: &ShuntError) -> Bytes;
}

/// The routing policy for one session. Implemented by external router
/// modules (read/write split, sharding, ...).
pub trait RouterModule: Send {
    /// Decides where one classified statement goes.
    fn on_statement(
        &mut self,
        stmt: &Statement,
        view: &SessionView<'_>,
    ) -> Result<RoutePlan, ShuntError>;

    /// Judges one backend reply packet.
    fn on_reply(&mut self, target: TargetId, packet: &Bytes, view: &SessionView<'_>)
    -> ReplyDisposition;

    /// Decides how the session recovers from a backend failure.
    fn on_failure(
        &mut self,
        target: TargetId,
        err: &ShuntError,
        view: &SessionView<'_>,
    ) -> RecoveryAction;
}

/// Builds the protocol module for each accepted session.
pub trait ProtocolFactory: Send + Sync {
    fn create(&self) -> Box<dyn ProtocolModule>;
}

impl<F> ProtocolFactory for F
where
    F: Fn() -> Box<dyn ProtocolModule> + Send + Sync,
{
    fn create(&self) -> Box<dyn ProtocolModule> {
        self()
    }
}

/// Builds the router policy instance for each accepted session.
pub trait RouterFactory: Send + Sync {
    fn create(&self) -> Box<dyn RouterModule>;
}

impl<F> RouterFactory for F
where
    F: Fn() -> Box<dyn RouterModule> + Send + Sync,
{
    fn create(&self) -> Box<dyn RouterModule> {
        self()
    }
}
