//! Keepsake - Tiered long-term memory with value-driven eviction
//!
//! Records live in capacity-bounded tiers. A background scheduler scores them,
//! backs up the least valuable ones and removes them when a tier runs out of
//! room, with optional human confirmation for borderline cases.

pub mod config;
pub mod error;
pub mod eviction;
pub mod memory;
pub mod plugins;
pub mod service;
pub mod storage;
pub mod testing;
pub mod vector;

pub use error::KeepsakeError;
pub use service::{MemoryService, ServiceBuilder};
