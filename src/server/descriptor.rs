// src/server/descriptor.rs

//! The in-process wrapper over one network endpoint: owns the socket,
//! buffers reads and writes, and carries the handler tag that routes
//! readiness events.
//!
//! A descriptor is owned by exactly one worker at a time; only that
//! worker touches its buffers. Closure is two-phase: the worker unhooks
//! the descriptor from its readiness set and parks it on the zombies
//! list, and destruction happens at the end of a later loop turn once the
//! backing session reports safe-to-close or the grace window expires.

use crate::core::ids::{DescriptorHandle, SessionId, TargetId};
use crate::server::buffer::{ChunkQueue, ReadOutcome, WriteOutcome};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io;
use std::time::Instant;

/// What kind of endpoint the descriptor wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRole {
    Client,
    Backend,
}

/// Routes readiness events to their consumer. The two kinds visible to
/// the core: session-attached descriptors dispatch into the session state
/// machine; pool stubs evict and close the idle entry on any traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandler {
    Session(SessionId),
    PoolStub(TargetId),
}

#[derive(Debug)]
pub struct Descriptor {
    stream: TcpStream,
    pub role: DescriptorRole,
    pub handler: EventHandler,
    pub read_buf: ChunkQueue,
    pub write_buf: ChunkQueue,
    pub last_read_at: Instant,
    pub last_write_at: Instant,
    pub hung_up: bool,
    /// True once a backend connect has completed (clients start true).
    pub connected: bool,
    generation: u32,
    interest: Interest,
}

impl Descriptor {
    pub fn new(stream: TcpStream, role: DescriptorRole, handler: EventHandler) -> Self {
        let now = Instant::now();
        Self {
            stream,
            role,
            handler,
            read_buf: ChunkQueue::new(),
            write_buf: ChunkQueue::new(),
            last_read_at: now,
            last_write_at: now,
            hung_up: false,
            connected: role == DescriptorRole::Client,
            generation: 0,
            interest: Interest::READABLE,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    pub fn handle(&self, key: usize) -> DescriptorHandle {
        DescriptorHandle {
            key,
            generation: self.generation,
        }
    }

    /// Registers the socket with a worker's readiness set. Client and
    /// backend descriptors are edge-triggered by the OS selector, so one
    /// wakeup consumes all available bytes until the kernel reports
    /// would-block.
    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        self.interest = interest;
        registry.register(&mut self.stream, token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Adds writable interest if not already armed. Re-registering also
    /// re-arms the edge state, so a currently writable socket reports
    /// readiness again.
    pub fn arm_writable(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if self.interest.is_writable() {
            return Ok(());
        }
        self.interest = Interest::READABLE | Interest::WRITABLE;
        registry.reregister(&mut self.stream, token, self.interest)
    }

    /// Drops writable interest once the write buffer has drained.
    pub fn disarm_writable(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if !self.interest.is_writable() {
            return Ok(());
        }
        self.interest = Interest::READABLE;
        registry.reregister(&mut self.stream, token, self.interest)
    }

    /// Appends all readable bytes to the read buffer.
    pub fn fill(&mut self) -> io::Result<ReadOutcome> {
        let outcome = self.read_buf.fill_from(&mut self.stream)?;
        if outcome.bytes > 0 {
            self.last_read_at = Instant::now();
        }
        Ok(outcome)
    }

    /// Drains the pending-write buffer into the socket.
    pub fn flush(&mut self) -> io::Result<WriteOutcome> {
        let outcome = self.write_buf.drain_to(&mut self.stream)?;
        if outcome.bytes > 0 {
            self.last_write_at = Instant::now();
        }
        Ok(outcome)
    }

    /// Surfaces a deferred connect error on a backend socket, if any.
    pub fn take_connect_error(&mut self) -> Option<io::Error> {
        match self.stream.take_error() {
            Ok(Some(e)) => Some(e),
            Ok(None) => None,
            Err(e) => Some(e),
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}

/// A descriptor whose close has been requested but which may still have
/// unflushed replies or a session with backends mid-handshake. Destroyed
/// during a later loop turn.
#[derive(Debug)]
pub struct Zombie {
    pub descriptor: Descriptor,
    /// The session the descriptor belonged to, if it was session-attached.
    pub session: Option<SessionId>,
    pub parked_at: Instant,
    /// Why the zombie was (re-)parked; recorded for stats and logs.
    pub reason: &'static str,
}
