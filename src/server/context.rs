// src/server/context.rs

//! The slice of worker state handed to session and pool code during one
//! handler dispatch.
//!
//! Sessions never hold references into the worker between turns; they
//! receive a fresh `WorkerCtx` per dispatch and reach descriptors, the
//! cache and the pool through it. Whole-worker mutations that cannot run
//! mid-dispatch (destroying the session being dispatched, activating
//! waiters on another session) are queued as deferred actions and applied
//! by the worker once the handler returns.

use crate::config::Config;
use crate::core::cache::StatementCache;
use crate::core::errors::ShuntError;
use crate::core::ids::{DescriptorHandle, SessionId, TargetId, WorkerId};
use crate::core::pool::{PoolGroup, Target, WaiterQueues};
use crate::core::stats::WorkerStats;
use crate::server::descriptor::{Descriptor, DescriptorRole, EventHandler, Zombie};
use crate::server::runtime::Shared;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Work that must wait until the current handler returns.
#[derive(Debug)]
pub enum DeferredAction {
    /// Capacity for this target was freed (release or close); run the
    /// waiter activation walk and notify other waiting workers.
    ReleaseNotify(TargetId),
    /// Remove a finished session from the registry.
    DestroySession(SessionId),
}

/// Mutable views of the worker pieces a handler may touch.
pub struct WorkerCtx<'a> {
    pub worker: WorkerId,
    pub registry: &'a Registry,
    pub descriptors: &'a mut Slab<Descriptor>,
    pub generation: &'a mut u32,
    pub zombies: &'a mut Vec<Zombie>,
    pub cache: &'a mut StatementCache,
    pub pool: &'a Mutex<PoolGroup>,
    pub waiters: &'a mut WaiterQueues,
    pub stats: &'a mut WorkerStats,
    pub shared: &'a Arc<Shared>,
    pub config: &'a Config,
    pub actions: &'a mut Vec<DeferredAction>,
    /// True once shutdown draining started on this worker.
    pub draining: bool,
}

impl WorkerCtx<'_> {
    /// Resolves a descriptor handle, refusing stale generations.
    pub fn descriptor(&mut self, handle: DescriptorHandle) -> Option<&mut Descriptor> {
        let desc = self.descriptors.get_mut(handle.key)?;
        if desc.generation() != handle.generation {
            return None;
        }
        Some(desc)
    }

    /// Queues bytes on a descriptor and pushes them toward the socket.
    /// Anything the socket will not take stays buffered with writable
    /// interest armed.
    pub fn queue_write(&mut self, handle: DescriptorHandle, bytes: Bytes) {
        let registry = self.registry;
        let Some(desc) = self.descriptor(handle) else {
            debug!(%handle, "write to a stale descriptor dropped");
            return;
        };
        desc.write_buf.push(bytes);
        if !desc.connected {
            // The connect-completion event flushes and manages interest.
            return;
        }
        match desc.flush() {
            Ok(outcome) if outcome.pending => {
                if let Err(e) = desc.arm_writable(registry, Token(handle.key)) {
                    warn!(%handle, error = %e, "failed to arm writable interest");
                }
            }
            Ok(_) => {
                let _ = desc.disarm_writable(registry, Token(handle.key));
            }
            Err(e) => {
                debug!(%handle, error = %e, "write failed, marking hangup");
                desc.hung_up = true;
            }
        }
    }

    /// Two-phase close: unhooks the descriptor from the readiness set and
    /// parks it on the zombies list. Destruction happens at the end of a
    /// later loop turn.
    pub fn close_descriptor(
        &mut self,
        handle: DescriptorHandle,
        session: Option<SessionId>,
        reason: &'static str,
    ) {
        let Some(desc) = self.descriptors.get(handle.key) else {
            return;
        };
        if desc.generation() != handle.generation {
            return;
        }
        let mut desc = self.descriptors.remove(handle.key);
        if let Err(e) = desc.deregister(self.registry) {
            debug!(%handle, error = %e, "deregister on close failed");
        }
        self.stats.fd_count = self.stats.fd_count.saturating_sub(1);
        self.stats.zombies_parked += 1;
        self.zombies.push(Zombie {
            descriptor: desc,
            session,
            parked_at: Instant::now(),
            reason,
        });
    }

    /// Opens a non-blocking connection to a target and registers it with
    /// this worker. The descriptor reports connected on its first
    /// writable event.
    pub fn connect_backend(
        &mut self,
        target: &Arc<Target>,
        session: SessionId,
    ) -> Result<DescriptorHandle, ShuntError> {
        let stream = TcpStream::connect(target.addr).map_err(|e| {
            ShuntError::BackendTransient(format!("connect to '{}' failed: {e}", target.name))
        })?;
        let desc = Descriptor::new(stream, DescriptorRole::Backend, EventHandler::Session(session));
        let handle = install_descriptor(
            self.descriptors,
            self.registry,
            self.generation,
            desc,
            Interest::READABLE | Interest::WRITABLE,
        )
        .map_err(|e| {
            ShuntError::BackendTransient(format!("register for '{}' failed: {e}", target.name))
        })?;
        self.stats.fd_count += 1;
        self.stats.fd_total += 1;
        Ok(handle)
    }

    /// Looks up a target in the shared table.
    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.shared.target(id)
    }
}

/// Inserts a descriptor into a worker's arena and readiness set, stamping
/// a fresh generation.
pub fn install_descriptor(
    descriptors: &mut Slab<Descriptor>,
    registry: &Registry,
    generation: &mut u32,
    mut desc: Descriptor,
    interest: Interest,
) -> io::Result<DescriptorHandle> {
    *generation = generation.wrapping_add(1);
    desc.set_generation(*generation);
    let entry = descriptors.vacant_entry();
    let token = Token(entry.key());
    desc.register(registry, token, interest)?;
    let handle = desc.handle(entry.key());
    entry.insert(desc);
    Ok(handle)
}
