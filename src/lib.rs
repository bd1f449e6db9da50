//! Harvester - batch web fetch orchestration.
//!
//! Fetches one page per domain for large batches, escalates to a headless
//! browser when blocked, hands the content to an extraction collaborator and
//! tracks per-domain progress atomically across a pool of workers.

pub mod config;
pub mod delivery;
pub mod extraction;
pub mod orchestrator;
pub mod progress;
pub mod proxy;
pub mod runtime_config;
pub mod scheduler;
pub mod scrapers;
pub mod session;
pub mod store;

/// Prefix applied to every key this crate writes to a shared store.
pub const KEY_PREFIX: &str = "harvester:";
