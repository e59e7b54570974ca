//! # tiercache
//!
//! A sharded, multi-tier, in-process key-value cache for session-like data:
//! - Lock-light append-only active table per shard
//! - Immutable hash-sorted tables guarded by bloom filters
//! - Background LSM-style compaction with tombstone and TTL garbage collection
//! - Optional LZ4 value compression and read-path locality promotion
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Cache                              │
//! │              (routes put/get/delete by key hash)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  one per shard
//!                       ▼
//!   ┌─────────────┐  rotate   ┌─────────────┐
//!   │ ActiveTable │ ────────▶ │   Level 0   │  frozen active tables
//!   │ (mutable)   │           └──────┬──────┘
//!   └─────────────┘                  │ 2-way merge (Level0 merger)
//!                                    ▼
//!                             ┌─────────────┐
//!                             │   Level 1   │  sorted tables
//!                             └──────┬──────┘
//!                                    │ 4-way merge (Level1 merger)
//!                                    ▼
//!                             ┌─────────────┐
//!                             │   Level 2   │  single compacted table
//!                             └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod clock;

pub mod arena;
pub mod entry;
pub mod compression;
pub mod table;
pub mod storage;
pub mod compaction;
pub mod stats;
pub mod cache;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::Cache;
pub use compression::{Codec, Lz4Codec, NoopCodec};
pub use config::CacheConfig;
pub use entry::NO_TIMEOUT;
pub use error::{CacheError, Result};
pub use stats::{CacheStats, NoopStats, Operation, StatsSink};
pub use table::Tier;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tiercache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
