// src/core/mod.rs

//! The central module containing the core logic and data structures of Shunt.

pub mod cache;
pub mod errors;
pub mod ids;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod stats;

pub use errors::{ErrorSeverity, ShuntError};
pub use ids::{DescriptorHandle, SessionId, TargetId, WorkerId};
