//! Storage Module
//!
//! Per-shard organization of tables into tiers.
//!
//! ## Responsibilities
//! - Keep each tier's tables ordered newest → oldest
//! - Serve point lookups across a tier under a read lock
//! - Provide the exclusive swap step compaction uses to replace inputs with
//!   their merged output
//! - Hold the shard's active table pointer and rotation lock

mod level_queue;
mod shard;

pub use level_queue::{LevelQueue, LevelQueueWriteGuard};
pub use shard::Shard;
