//! Sorted table
//!
//! Immutable table produced by compaction. Records are bulk-loaded once in
//! ascending (key hash, key) order, then [`SortedTable::truncate`] shrinks
//! the arenas to the bytes actually used. Lookups consult a bloom filter
//! before binary searching on the key hash.

use std::cmp::Ordering;
use std::sync::Arc;

use bloomfilter::Bloom;

use crate::arena::Arena;
use crate::clock;
use crate::compression::Codec;
use crate::entry::{self, EntryMeta, Record, Status, META_LEN};
use crate::error::{CacheError, Result};

use super::{resolve, GetResult, MapTable, Tier};

/// Target false-positive rate of the membership filter
pub const FALSE_POSITIVE_RATE: f64 = 0.001;

/// Immutable (hash, key)-ordered table with a membership filter
pub struct SortedTable {
    shard: usize,
    tier: Tier,
    created_at: u64,

    index_arena: Arena,
    data_arena: Arena,

    len: usize,
    data_used: usize,
    truncated: bool,

    bloom: Bloom<[u8]>,
    codec: Arc<dyn Codec>,
}

impl SortedTable {
    /// Create an empty table sized for `expected_entries` records and
    /// `expected_bytes` of key/value data
    pub fn new(
        shard: usize,
        tier: Tier,
        created_at: u64,
        expected_entries: usize,
        expected_bytes: usize,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let index_len = expected_entries.checked_mul(META_LEN).ok_or_else(|| {
            CacheError::Memory(format!("{} entries overflow the index arena", expected_entries))
        })?;
        let bloom = Bloom::new_for_fp_rate(expected_entries.max(1), FALSE_POSITIVE_RATE)
            .map_err(|e| CacheError::Memory(format!("bloom filter: {}", e)))?;

        Ok(Self {
            shard,
            tier,
            created_at,
            index_arena: Arena::with_capacity(index_len)?,
            data_arena: Arena::with_capacity(expected_bytes)?,
            len: 0,
            data_used: 0,
            truncated: false,
            bloom,
            codec,
        })
    }

    /// Append one record. Calls must arrive in strictly ascending
    /// (key hash, key) order and stop once the table is truncated.
    #[allow(clippy::too_many_arguments)]
    pub fn append_new(
        &mut self,
        key: &[u8],
        key_hash: u32,
        value: &[u8],
        ttl: i64,
        created_at: i64,
        deleted: bool,
        compressed: bool,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::invalid("key is empty"));
        }
        if value.is_empty() {
            return Err(CacheError::invalid("value is empty"));
        }
        if self.truncated {
            return Err(CacheError::invalid("sorted table is truncated and sealed"));
        }
        if self.len > 0 {
            let last = EntryMeta::read_slot(&self.index_arena, self.len - 1)?;
            let last_key = last.key(&self.data_arena)?;
            if entry::compare_keys(last.key_hash, last_key, key_hash, key) != Ordering::Less {
                return Err(CacheError::invalid(
                    "sorted table input out of (hash, key) order",
                ));
            }
        }

        let meta_at = self.len * META_LEN;
        let data_len = key.len() + value.len();
        if meta_at + META_LEN > self.index_arena.len()
            || self.data_used + data_len > self.data_arena.len()
        {
            return Err(CacheError::Memory(format!(
                "sorted table full: {} records, {} of {} data bytes",
                self.len,
                self.data_used,
                self.data_arena.len()
            )));
        }

        let meta = EntryMeta {
            offset: self.data_used as u64,
            key_len: key.len() as u32,
            value_len: value.len() as u32,
            ttl,
            created_at,
            key_hash,
            status: Status::new(deleted, compressed),
        };
        self.index_arena.write(meta_at, &meta.encode())?;
        self.data_arena.write(self.data_used, key)?;
        self.data_arena.write(self.data_used + key.len(), value)?;

        self.bloom.set(key);
        self.data_used += data_len;
        self.len += 1;
        Ok(())
    }

    /// Append an owned record
    pub fn append_record(&mut self, record: &Record) -> Result<()> {
        self.append_new(
            &record.key,
            record.key_hash,
            &record.value,
            record.ttl,
            record.created_at,
            record.deleted,
            record.compressed,
        )
    }

    /// Shrink both arenas to the bytes used. Runs once; the table never
    /// grows afterwards.
    pub fn truncate(&mut self) -> Result<()> {
        if self.truncated {
            return Ok(());
        }

        let index_used = self.len * META_LEN;
        if index_used < self.index_arena.len() {
            self.index_arena = self.index_arena.shrink_to(index_used)?;
        }
        if self.data_used < self.data_arena.len() {
            self.data_arena = self.data_arena.shrink_to(self.data_used)?;
        }

        self.truncated = true;
        Ok(())
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// No false negatives: `false` means the key is definitely absent
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    pub fn data_used(&self) -> usize {
        self.data_used
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Binary search on the key hash, then scan same-hash neighbours on both
    /// sides for the exact key
    fn find(&self, key: &[u8]) -> Result<Option<EntryMeta>> {
        let hash = entry::key_hash(key);
        let matches = |meta: &EntryMeta| -> Result<bool> {
            Ok(meta.key_hash == hash && meta.key(&self.data_arena)? == key)
        };

        let (mut lo, mut hi) = (0usize, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let meta = EntryMeta::read_slot(&self.index_arena, mid)?;

            match hash.cmp(&meta.key_hash) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    if matches(&meta)? {
                        return Ok(Some(meta));
                    }
                    for index in (0..mid).rev() {
                        let left = EntryMeta::read_slot(&self.index_arena, index)?;
                        if left.key_hash != hash {
                            break;
                        }
                        if matches(&left)? {
                            return Ok(Some(left));
                        }
                    }
                    for index in mid + 1..self.len {
                        let right = EntryMeta::read_slot(&self.index_arena, index)?;
                        if right.key_hash != hash {
                            break;
                        }
                        if matches(&right)? {
                            return Ok(Some(right));
                        }
                    }
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }
}

impl MapTable for SortedTable {
    fn shard(&self) -> usize {
        self.shard
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn len(&self) -> usize {
        self.len
    }

    fn record(&self, index: usize) -> Result<Record> {
        if index >= self.len {
            return Err(CacheError::invalid(format!(
                "index {} out of range ({} records)",
                index, self.len
            )));
        }
        Record::load(&self.index_arena, &self.data_arena, index)
    }

    fn get(&self, key: &[u8]) -> Result<GetResult> {
        if key.is_empty() {
            return Err(CacheError::invalid("key is empty"));
        }
        if self.len == 0 || !self.might_contain(key) {
            return Ok(GetResult::not_found(self.tier));
        }

        match self.find(key)? {
            Some(meta) => resolve(
                &meta,
                &self.data_arena,
                self.tier,
                self.codec.as_ref(),
                clock::now_millis(),
            ),
            None => Ok(GetResult::not_found(self.tier)),
        }
    }

    fn memory_usage(&self) -> u64 {
        (self.index_arena.len() + self.data_arena.len()) as u64
    }
}

impl std::fmt::Debug for SortedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedTable")
            .field("shard", &self.shard)
            .field("tier", &self.tier)
            .field("created_at", &self.created_at)
            .field("len", &self.len)
            .field("truncated", &self.truncated)
            .finish()
    }
}
