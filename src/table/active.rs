//! Active table
//!
//! Append-only, hash-indexed table that takes every write for its shard.
//!
//! ## Append Protocol
//! 1. Reserve a metadata slot and a data range under `cursor` (short lock)
//! 2. Write metadata and key/value bytes outside the lock
//! 3. Publish `key -> slot` in the index last
//!
//! The index insert is the release point and the index lookup the acquire
//! point: a reader that sees a slot also sees its payload. Overflow is
//! permanent; once a reservation fails the table never accepts another write.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::clock;
use crate::compression::Codec;
use crate::entry::{self, EntryMeta, Record, Status, META_LEN, NO_TIMEOUT, PLACEHOLDER};
use crate::error::{CacheError, Result};

use super::{resolve, GetResult, MapTable, Tier};

/// Append position, guarded by the table's append lock
#[derive(Debug, Default)]
struct Cursor {
    next_slot: usize,
    next_offset: usize,
    sealed: bool,
}

/// The mutable write target of a shard
pub struct ActiveTable {
    shard: usize,
    created_at: u64,

    /// Slot and byte capacity, fixed at creation
    slot_capacity: usize,
    byte_capacity: usize,

    index_arena: Arena,
    data_arena: Arena,

    /// Published keys: key -> newest slot holding it
    keys: DashMap<Vec<u8>, u32>,

    cursor: Mutex<Cursor>,
    /// Mirror of `cursor.next_slot` readable without the lock
    appended: AtomicUsize,
    /// Reserved slots whose payload is not yet published
    pending: AtomicUsize,
    frozen: AtomicBool,

    codec: Arc<dyn Codec>,
    compress: bool,
}

impl ActiveTable {
    /// Create an empty table with room for `slots` records and `bytes` of
    /// key/value data
    pub fn new(
        shard: usize,
        created_at: u64,
        slots: usize,
        bytes: usize,
        codec: Arc<dyn Codec>,
        compress: bool,
    ) -> Result<Self> {
        let index_len = slots.checked_mul(META_LEN).ok_or_else(|| {
            CacheError::Config(format!("{} slots overflow the index arena", slots))
        })?;

        Ok(Self {
            shard,
            created_at,
            slot_capacity: slots,
            byte_capacity: bytes,
            index_arena: Arena::with_capacity(index_len)?,
            data_arena: Arena::with_capacity(bytes)?,
            keys: DashMap::new(),
            cursor: Mutex::new(Cursor::default()),
            appended: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            codec,
            compress,
        })
    }

    /// Append a record.
    ///
    /// Returns `Ok(false)` on overflow: the caller must rotate this table out.
    /// A delete stores a one-byte placeholder value and ignores `value`.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: i64,
        created_at: i64,
        is_delete: bool,
    ) -> Result<bool> {
        if key.is_empty() {
            return Err(CacheError::invalid("key is empty"));
        }
        if value.is_empty() && !is_delete {
            return Err(CacheError::invalid("value is empty"));
        }

        let (stored, compressed): (Cow<'_, [u8]>, bool) = if is_delete {
            (Cow::Borrowed(PLACEHOLDER), false)
        } else if self.compress {
            (Cow::Owned(self.codec.compress(value)?), true)
        } else {
            (Cow::Borrowed(value), false)
        };

        let Some((slot, offset)) = self.reserve(key.len() + stored.len())? else {
            return Ok(false);
        };

        let meta = EntryMeta {
            offset: offset as u64,
            key_len: key.len() as u32,
            value_len: stored.len() as u32,
            ttl,
            created_at,
            key_hash: entry::key_hash(key),
            status: Status::new(is_delete, compressed),
        };

        let written = self.write_reserved(slot, offset, &meta, key, &stored);
        if written.is_ok() {
            self.publish(key, slot as u32);
        }
        self.pending.fetch_sub(1, Ordering::Release);
        written.map(|_| true)
    }

    /// Append a tombstone for `key`
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.put(key, PLACEHOLDER, NO_TIMEOUT, clock::now_millis(), true)
    }

    /// Refuse all further writes
    pub fn freeze(&self) {
        let mut cursor = self.cursor.lock();
        cursor.sealed = true;
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Block until every reserved slot has been published.
    ///
    /// Only meaningful after [`freeze`](Self::freeze): no new reservations
    /// can start, so the pending count only goes down.
    pub fn wait_for_writers(&self) {
        while self.pending.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    /// Number of distinct published keys
    pub fn live_len(&self) -> usize {
        self.keys.len()
    }

    /// Key/value bytes consumed so far
    pub fn used_bytes(&self) -> usize {
        self.cursor.lock().next_offset
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    pub fn byte_capacity(&self) -> usize {
        self.byte_capacity
    }

    /// Published `(key_hash, key, slot)` triples in (hash, key) order
    pub fn sorted_slots(&self) -> Result<Vec<(u32, Vec<u8>, u32)>> {
        let mut slots = Vec::with_capacity(self.keys.len());
        for item in self.keys.iter() {
            let slot = *item.value();
            let meta = EntryMeta::read_slot(&self.index_arena, slot as usize)?;
            slots.push((meta.key_hash, item.key().clone(), slot));
        }
        slots.sort_by(|a, b| entry::compare_keys(a.0, &a.1, b.0, &b.1));
        Ok(slots)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// `Ok(None)` on overflow. An entry no empty table could hold is an
    /// argument error and leaves the table open.
    fn reserve(&self, data_len: usize) -> Result<Option<(usize, usize)>> {
        if data_len > self.byte_capacity {
            return Err(CacheError::invalid(format!(
                "entry of {} bytes exceeds the table capacity of {} bytes",
                data_len, self.byte_capacity
            )));
        }

        let mut cursor = self.cursor.lock();
        if cursor.sealed {
            return Ok(None);
        }

        let fits = cursor.next_slot < self.slot_capacity
            && cursor.next_offset + data_len <= self.byte_capacity;
        if !fits {
            cursor.sealed = true;
            self.frozen.store(true, Ordering::Release);
            return Ok(None);
        }

        let reserved = (cursor.next_slot, cursor.next_offset);
        cursor.next_slot += 1;
        cursor.next_offset += data_len;
        self.appended.store(cursor.next_slot, Ordering::Release);
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(Some(reserved))
    }

    fn write_reserved(
        &self,
        slot: usize,
        offset: usize,
        meta: &EntryMeta,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        // SAFETY: `reserve` handed this slot and byte range to exactly one
        // caller, and nobody reads them before `publish`.
        unsafe {
            self.index_arena.write_shared(slot * META_LEN, &meta.encode())?;
            self.data_arena.write_shared(offset, key)?;
            self.data_arena.write_shared(offset + key.len(), value)?;
        }
        Ok(())
    }

    fn publish(&self, key: &[u8], slot: u32) {
        // Racing writers of one key: the later reservation wins
        self.keys
            .entry(key.to_vec())
            .and_modify(|current| {
                if *current < slot {
                    *current = slot;
                }
            })
            .or_insert(slot);
    }
}

impl MapTable for ActiveTable {
    fn shard(&self) -> usize {
        self.shard
    }

    fn tier(&self) -> Tier {
        if self.is_frozen() {
            Tier::Level0
        } else {
            Tier::Active
        }
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn len(&self) -> usize {
        self.appended.load(Ordering::Acquire)
    }

    fn record(&self, index: usize) -> Result<Record> {
        if index >= self.len() {
            return Err(CacheError::invalid(format!(
                "slot {} out of range ({} appended)",
                index,
                self.len()
            )));
        }
        Record::load(&self.index_arena, &self.data_arena, index)
    }

    fn get(&self, key: &[u8]) -> Result<GetResult> {
        if key.is_empty() {
            return Err(CacheError::invalid("key is empty"));
        }

        let tier = self.tier();
        let slot = match self.keys.get(key) {
            Some(slot) => *slot,
            None => return Ok(GetResult::not_found(tier)),
        };

        let meta = EntryMeta::read_slot(&self.index_arena, slot as usize)?;
        resolve(&meta, &self.data_arena, tier, self.codec.as_ref(), clock::now_millis())
    }

    fn memory_usage(&self) -> u64 {
        (self.index_arena.len() + self.data_arena.len()) as u64
    }
}

impl std::fmt::Debug for ActiveTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTable")
            .field("shard", &self.shard)
            .field("created_at", &self.created_at)
            .field("appended", &self.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
