// src/server/mod.rs

//! The runtime plumbing: descriptors, workers, the shared accept path,
//! the cross-worker coordination plane, and the runtime handle itself.

pub mod buffer;
pub mod context;
pub mod coordinator;
pub mod descriptor;
pub mod inbox;
pub mod listener;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use runtime::{Runtime, RuntimeBuilder, Shared};
pub use worker::{SessionTicket, TimerVerdict, Worker};
