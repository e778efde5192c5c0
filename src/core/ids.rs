// src/core/ids.rs

//! Small identifier newtypes shared across the core.
//!
//! Sessions, workers, targets and descriptors reference each other by
//! these values instead of pointers; a stale `DescriptorHandle` becomes a
//! failed lookup rather than a dangling reference.

use std::fmt;

/// Globally unique, monotonically increasing session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Dense worker index, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Index of a backend target in the runtime's target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub usize);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// Slot-plus-generation reference to a descriptor owned by a worker.
///
/// The generation guards against slot reuse: a handle taken before a slot
/// was recycled no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub key: usize,
    pub generation: u32,
}

impl fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd-slot-{}.{}", self.key, self.generation)
    }
}
