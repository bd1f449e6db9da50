//! Durable batch session records.
//!
//! A session outlives its live progress keys: counters, status and the
//! extracted records stay until the retention cleanup removes them.

mod backend;
mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use backend::{Outcome, Session, SessionStatus, SessionStore};
pub use memory::InMemorySessionStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisSessionStore;
