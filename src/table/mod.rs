//! Table Module
//!
//! The two table kinds that hold a shard's data.
//!
//! ## Responsibilities
//! - [`ActiveTable`]: the single mutable, hash-indexed write target of a shard
//! - [`SortedTable`]: immutable, (hash, key)-ordered output of compaction
//! - Shared point lookup semantics through [`MapTable::get`]
//!
//! Both tables store fixed-stride metadata in one arena and key/value bytes
//! in another (see [`crate::entry`]).

mod active;
mod sorted;

use std::fmt;

pub use active::ActiveTable;
pub use sorted::{SortedTable, FALSE_POSITIVE_RATE};

use crate::arena::Arena;
use crate::compression::Codec;
use crate::entry::{EntryMeta, Record};
use crate::error::Result;

/// Stage of the freshness-to-compactness hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// The mutable active table
    Active,
    /// Frozen active tables awaiting the level 0 merger
    Level0,
    /// Sorted tables produced by the level 0 merger
    Level1,
    /// The single fully compacted table
    Level2,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Active, Tier::Level0, Tier::Level1, Tier::Level2];

    /// Dense index for per-tier arrays
    pub fn index(self) -> usize {
        match self {
            Tier::Active => 0,
            Tier::Level0 => 1,
            Tier::Level1 => 2,
            Tier::Level2 => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Active => write!(f, "active"),
            Tier::Level0 => write!(f, "level0"),
            Tier::Level1 => write!(f, "level1"),
            Tier::Level2 => write!(f, "level2"),
        }
    }
}

/// Outcome of a point lookup in one table
///
/// `found` is a structural hit: the key has a record here, whether live,
/// deleted or expired. `value` is only set for live hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub found: bool,
    pub value: Option<Vec<u8>>,
    pub deleted: bool,
    pub expired: bool,
    pub tier: Tier,
    pub ttl: i64,
    pub created_at: i64,
}

impl GetResult {
    pub fn not_found(tier: Tier) -> Self {
        Self {
            found: false,
            value: None,
            deleted: false,
            expired: false,
            tier,
            ttl: 0,
            created_at: 0,
        }
    }

    /// Found, not deleted and not expired
    pub fn is_live(&self) -> bool {
        self.found && !self.deleted && !self.expired
    }
}

/// Behavior shared by every table a level queue can hold
pub trait MapTable: Send + Sync {
    fn shard(&self) -> usize;

    fn tier(&self) -> Tier;

    /// Strictly increasing creation stamp; larger means newer
    fn created_at(&self) -> u64;

    /// Number of appended records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the record in slot `index`
    fn record(&self, index: usize) -> Result<Record>;

    fn get(&self, key: &[u8]) -> Result<GetResult>;

    /// Bytes held by this table's arenas
    fn memory_usage(&self) -> u64;
}

/// Turn a located record into a lookup result. Deleted and expired records
/// are reported without touching (or decompressing) their value.
pub(crate) fn resolve(
    meta: &EntryMeta,
    data: &Arena,
    tier: Tier,
    codec: &dyn Codec,
    now_ms: i64,
) -> Result<GetResult> {
    let mut result = GetResult {
        found: true,
        value: None,
        deleted: meta.status.deleted(),
        expired: false,
        tier,
        ttl: meta.ttl,
        created_at: meta.created_at,
    };

    if result.deleted {
        return Ok(result);
    }
    if meta.is_expired(now_ms) {
        result.expired = true;
        return Ok(result);
    }

    let raw = meta.value(data)?;
    result.value = Some(if meta.status.compressed() {
        codec.decompress(raw)?
    } else {
        raw.to_vec()
    });
    Ok(result)
}
