//! Compaction Module
//!
//! Deduplicating k-way merges that move data down the tier hierarchy.
//!
//! ## Responsibilities
//! - Stream records out of each input table in (hash, key) order
//! - Merge the streams through a min-heap, keeping only the freshest record
//!   of every key
//! - Apply the tier's garbage collection policy to deleted/expired records
//! - Swap inputs for the output under the level queue write locks
//!   ([`level0`], [`level1`])
//! - Run passes in the background ([`MergeWorker`])
//!
//! ## Duplicate Resolution
//! ```text
//! heap order: (key_hash ↑, key ↑, source tier ↑, source created_at ↓)
//!
//! pop ──▶ first item of a key is the freshest copy
//!     └─▶ every following item with the same key is stale: drop it
//! ```

mod level0;
mod level1;
mod worker;

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub use level0::{merge_level0, merge_level0_all};
pub use level1::{merge_level1, merge_level1_all};
pub use worker::{MergeContext, MergePass, MergeWorker};

use crate::entry::{Record, PLACEHOLDER};
use crate::error::Result;
use crate::table::{ActiveTable, MapTable, SortedTable, Tier};

/// Tables folded by one background level 0 pass
pub const LEVEL0_WAYS: usize = 2;

/// Tables folded by one background level 1 pass (level 2 table included)
pub const LEVEL1_WAYS: usize = 4;

// =============================================================================
// Garbage Collection Policy
// =============================================================================

/// What a merge does with deleted or expired records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    /// Keep the record and its metadata, but replace the value with the
    /// one-byte placeholder. Still shadows older copies further down.
    KeepTombstones,
    /// Drop the record. Only valid when nothing older remains below.
    DropTombstones,
}

impl GcPolicy {
    /// Apply the policy; `None` means the record is not written out
    pub fn apply(self, mut record: Record, now_ms: i64) -> Option<Record> {
        if !record.deleted && !record.is_expired(now_ms) {
            return Some(record);
        }
        match self {
            GcPolicy::KeepTombstones => {
                record.value = PLACEHOLDER.to_vec();
                record.compressed = false;
                Some(record)
            }
            GcPolicy::DropTombstones => None,
        }
    }
}

// =============================================================================
// Merge Sources
// =============================================================================

/// Priority of a source when the same key appears in several inputs
///
/// Lower tiers are fresher than higher ones; within a tier, the table with
/// the larger creation stamp is fresher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRank {
    pub tier: Tier,
    pub created_at: u64,
}

impl Ord for SourceRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for SourceRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered stream of records out of one input table
pub trait MergeSource {
    fn rank(&self) -> SourceRank;

    /// Next record in (hash, key) order, `None` when exhausted
    fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Frozen active table, read through a sorted snapshot of its key index
pub struct ActiveSource {
    table: Arc<ActiveTable>,
    slots: std::vec::IntoIter<(u32, Vec<u8>, u32)>,
}

impl ActiveSource {
    /// The table must be frozen with no writer in flight
    pub fn new(table: Arc<ActiveTable>) -> Result<Self> {
        let slots = table.sorted_slots()?.into_iter();
        Ok(Self { table, slots })
    }
}

impl MergeSource for ActiveSource {
    fn rank(&self) -> SourceRank {
        // A frozen active table is a level 0 input whatever its current state
        SourceRank {
            tier: Tier::Level0,
            created_at: self.table.created_at(),
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        match self.slots.next() {
            Some((_, _, slot)) => self.table.record(slot as usize).map(Some),
            None => Ok(None),
        }
    }
}

/// Sorted table read in batches of `read_ahead` records
pub struct SortedSource {
    table: Arc<SortedTable>,
    next_index: usize,
    read_ahead: usize,
    buffer: VecDeque<Record>,
}

impl SortedSource {
    pub fn new(table: Arc<SortedTable>, read_ahead: usize) -> Self {
        let read_ahead = read_ahead.max(1);
        Self {
            table,
            next_index: 0,
            read_ahead,
            buffer: VecDeque::with_capacity(read_ahead),
        }
    }

    fn fill(&mut self) -> Result<()> {
        let end = (self.next_index + self.read_ahead).min(self.table.len());
        for index in self.next_index..end {
            self.buffer.push_back(self.table.record(index)?);
        }
        self.next_index = end;
        Ok(())
    }
}

impl MergeSource for SortedSource {
    fn rank(&self) -> SourceRank {
        SourceRank {
            tier: self.table.tier(),
            created_at: self.table.created_at(),
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.buffer.is_empty() {
            self.fill()?;
        }
        Ok(self.buffer.pop_front())
    }
}

// =============================================================================
// K-way Merge
// =============================================================================

/// Head record of one source, as held in the merge heap
#[derive(Debug)]
pub struct HeapItem {
    pub record: Record,
    pub rank: SourceRank,
    /// Index of the source the record came from
    pub source: usize,
}

impl HeapItem {
    fn same_key(&self, other: &HeapItem) -> bool {
        self.record.key_hash == other.record.key_hash && self.record.key == other.record.key
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .cmp_key(&other.record)
            .then_with(|| self.rank.cmp(&other.rank))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

/// Record counts of one merge
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeCounts {
    /// Records read from all sources
    pub entries_in: usize,
    /// Records written to the output
    pub entries_out: usize,
    /// Stale copies shadowed by a fresher record of the same key
    pub duplicates: usize,
    /// Deleted or expired records placeholdered or dropped
    pub collected: usize,
}

/// Merge `sources` into `emit` in (hash, key) order, one record per key
pub fn merge_sources<F>(
    mut sources: Vec<Box<dyn MergeSource + '_>>,
    policy: GcPolicy,
    now_ms: i64,
    mut emit: F,
) -> Result<MergeCounts>
where
    F: FnMut(Record) -> Result<()>,
{
    let mut counts = MergeCounts::default();
    let mut heap = BinaryHeap::with_capacity(sources.len());

    for (index, source) in sources.iter_mut().enumerate() {
        advance(source.as_mut(), index, &mut heap, &mut counts)?;
    }

    while let Some(Reverse(head)) = heap.pop() {
        while let Some(Reverse(next)) = heap.peek() {
            if !next.same_key(&head) {
                break;
            }
            if let Some(Reverse(stale)) = heap.pop() {
                counts.duplicates += 1;
                advance(sources[stale.source].as_mut(), stale.source, &mut heap, &mut counts)?;
            }
        }

        let source = head.source;
        let was_live = !head.record.deleted && !head.record.is_expired(now_ms);
        if !was_live {
            counts.collected += 1;
        }
        if let Some(record) = policy.apply(head.record, now_ms) {
            emit(record)?;
            counts.entries_out += 1;
        }

        advance(sources[source].as_mut(), source, &mut heap, &mut counts)?;
    }

    Ok(counts)
}

fn advance(
    source: &mut (dyn MergeSource + '_),
    index: usize,
    heap: &mut BinaryHeap<Reverse<HeapItem>>,
    counts: &mut MergeCounts,
) -> Result<()> {
    if let Some(record) = source.next_record()? {
        counts.entries_in += 1;
        heap.push(Reverse(HeapItem {
            record,
            rank: source.rank(),
            source: index,
        }));
    }
    Ok(())
}

// =============================================================================
// Pass Outcome
// =============================================================================

/// Result of one merge pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Tier the inputs were taken from
    pub tier: Tier,
    /// Input tables consumed; zero when nothing was eligible
    pub tables_in: usize,
    pub counts: MergeCounts,
    pub elapsed: Duration,
}

impl MergeOutcome {
    pub fn skipped(tier: Tier) -> Self {
        Self {
            tier,
            tables_in: 0,
            counts: MergeCounts::default(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.tables_in == 0
    }
}
