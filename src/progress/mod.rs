//! Per-session progress tracking and live batch control state.
//!
//! Provides atomic per-domain transitions with pluggable backends:
//! - In-memory (single process)
//! - Redis (shared by many worker processes)

mod backend;
mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use backend::{
    ActiveSession, ControlState, DomainResult, DomainStatus, ProgressCounters, ProgressStore,
    Transition,
};
pub use memory::InMemoryProgressStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisProgressStore;
