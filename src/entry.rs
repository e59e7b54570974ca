//! Entry codec
//!
//! Fixed-stride metadata records shared by both table types. Key and value
//! bytes live contiguously in a separate data arena at `offset`.
//!
//! ## Metadata Layout (40 bytes, little-endian)
//! ```text
//! ┌──────────┬─────────┬─────────┬─────────┬────────────┬──────────┬────────┬─────┐
//! │offset u64│ klen u32│ vlen u32│ ttl i64 │created i64 │ hash u32 │ status │ pad │
//! │   @0     │   @8    │   @12   │   @16   │    @24     │   @32    │  @36   │ @37 │
//! └──────────┴─────────┴─────────┴─────────┴────────────┴──────────┴────────┴─────┘
//! ```

use std::cmp::Ordering;

use crate::arena::Arena;
use crate::error::{CacheError, Result};

/// Stride of one metadata record
pub const META_LEN: usize = 40;

/// TTL value meaning "never expires"
pub const NO_TIMEOUT: i64 = -1;

/// Single byte stored in place of deleted or expired values
pub const PLACEHOLDER: &[u8] = &[0];

const OFFSET_AT: usize = 0;
const KEY_LEN_AT: usize = 8;
const VALUE_LEN_AT: usize = 12;
const TTL_AT: usize = 16;
const CREATED_AT: usize = 24;
const HASH_AT: usize = 32;
const STATUS_AT: usize = 36;

/// 32-bit hash used for shard routing and sorted table order
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Order by (hash, key bytes)
pub fn compare_keys(hash_a: u32, key_a: &[u8], hash_b: u32, key_b: &[u8]) -> Ordering {
    hash_a.cmp(&hash_b).then_with(|| key_a.cmp(key_b))
}

// =============================================================================
// Status Byte
// =============================================================================

/// Status flags: bit0 in-use, bit1 deleted, bit2 compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(u8);

impl Status {
    const IN_USE: u8 = 1;
    const DELETED: u8 = 1 << 1;
    const COMPRESSED: u8 = 1 << 2;

    /// In-use status. A tombstone never carries the compressed bit.
    pub fn new(deleted: bool, compressed: bool) -> Self {
        let mut bits = Self::IN_USE;
        if deleted {
            bits |= Self::DELETED;
        } else if compressed {
            bits |= Self::COMPRESSED;
        }
        Status(bits)
    }

    pub fn from_bits(bits: u8) -> Self {
        Status(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn in_use(self) -> bool {
        self.0 & Self::IN_USE != 0
    }

    pub fn deleted(self) -> bool {
        self.0 & Self::DELETED != 0
    }

    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }
}

// =============================================================================
// Entry Metadata
// =============================================================================

/// Decoded metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Offset of the key bytes in the data arena; the value follows the key
    pub offset: u64,
    pub key_len: u32,
    pub value_len: u32,
    pub ttl: i64,
    pub created_at: i64,
    pub key_hash: u32,
    pub status: Status,
}

impl EntryMeta {
    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[OFFSET_AT..OFFSET_AT + 8].copy_from_slice(&self.offset.to_le_bytes());
        buf[KEY_LEN_AT..KEY_LEN_AT + 4].copy_from_slice(&self.key_len.to_le_bytes());
        buf[VALUE_LEN_AT..VALUE_LEN_AT + 4].copy_from_slice(&self.value_len.to_le_bytes());
        buf[TTL_AT..TTL_AT + 8].copy_from_slice(&self.ttl.to_le_bytes());
        buf[CREATED_AT..CREATED_AT + 8].copy_from_slice(&self.created_at.to_le_bytes());
        buf[HASH_AT..HASH_AT + 4].copy_from_slice(&self.key_hash.to_le_bytes());
        buf[STATUS_AT] = self.status.bits();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_LEN {
            return Err(CacheError::Memory(format!(
                "metadata record needs {} bytes, got {}",
                META_LEN,
                buf.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        Ok(Self {
            offset: u64_at(OFFSET_AT),
            key_len: u32_at(KEY_LEN_AT),
            value_len: u32_at(VALUE_LEN_AT),
            ttl: u64_at(TTL_AT) as i64,
            created_at: u64_at(CREATED_AT) as i64,
            key_hash: u32_at(HASH_AT),
            status: Status::from_bits(buf[STATUS_AT]),
        })
    }

    /// Read the record stored in metadata slot `index`
    pub fn read_slot(index_arena: &Arena, index: usize) -> Result<Self> {
        let at = index
            .checked_mul(META_LEN)
            .ok_or_else(|| CacheError::Memory(format!("slot {} overflows", index)))?;
        Self::decode(index_arena.read(at, META_LEN)?)
    }

    /// `ttl > 0 && now - created_at > ttl`. Monotone in `now`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        is_expired(self.ttl, self.created_at, now_ms)
    }

    pub fn key<'a>(&self, data_arena: &'a Arena) -> Result<&'a [u8]> {
        data_arena.read(self.offset as usize, self.key_len as usize)
    }

    pub fn value<'a>(&self, data_arena: &'a Arena) -> Result<&'a [u8]> {
        data_arena.read(
            self.offset as usize + self.key_len as usize,
            self.value_len as usize,
        )
    }

    /// Bytes this record occupies in the data arena
    pub fn data_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }
}

pub fn is_expired(ttl: i64, created_at: i64, now_ms: i64) -> bool {
    ttl > 0 && now_ms.saturating_sub(created_at) > ttl
}

// =============================================================================
// Owned Record
// =============================================================================

/// Fully decoded entry, as moved between tables by compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    /// Stored bytes: compressed when `compressed` is set
    pub value: Vec<u8>,
    pub key_hash: u32,
    pub ttl: i64,
    pub created_at: i64,
    pub deleted: bool,
    pub compressed: bool,
}

impl Record {
    /// Decode slot `index` of a table's arenas
    pub fn load(index_arena: &Arena, data_arena: &Arena, index: usize) -> Result<Self> {
        let meta = EntryMeta::read_slot(index_arena, index)?;
        Ok(Self {
            key: meta.key(data_arena)?.to_vec(),
            value: meta.value(data_arena)?.to_vec(),
            key_hash: meta.key_hash,
            ttl: meta.ttl,
            created_at: meta.created_at,
            deleted: meta.status.deleted(),
            compressed: meta.status.compressed(),
        })
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        is_expired(self.ttl, self.created_at, now_ms)
    }

    pub fn cmp_key(&self, other: &Record) -> Ordering {
        compare_keys(self.key_hash, &self.key, other.key_hash, &other.key)
    }
}
