//! Level 1 → 2 merge
//!
//! Folds the oldest level 1 tables, together with the current level 2 table
//! when there is one, into a replacement level 2 table. Level 2 is the bottom
//! of the hierarchy, so deleted and expired records are dropped here.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::clock::{self, TableClock};
use crate::compression::Codec;
use crate::entry::Record;
use crate::error::Result;
use crate::storage::Shard;
use crate::table::{MapTable, SortedTable, Tier};

use super::{merge_sources, GcPolicy, MergeOutcome, MergeSource, SortedSource};

/// Merge `ways` tables into a new level 2 table: the existing level 2 table
/// (if any) plus the oldest level 1 tables making up the rest. Skipped when
/// level 1 cannot supply its share.
pub fn merge_level1(
    shard: &Shard,
    ways: usize,
    read_ahead: usize,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let _pass = shard.merge_lock(Tier::Level1)?;
    run(shard, ways, read_ahead, codec, clock)
}

/// Merge every level 1 table, plus the level 2 table, into a new level 2
/// table. Skipped when level 1 is empty.
pub fn merge_level1_all(
    shard: &Shard,
    read_ahead: usize,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let _pass = shard.merge_lock(Tier::Level1)?;
    let ways = shard.level1.len() + shard.level2.len();
    run(shard, ways, read_ahead, codec, clock)
}

fn run(
    shard: &Shard,
    ways: usize,
    read_ahead: usize,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let base = shard.level2.oldest(1);
    let take = ways.saturating_sub(base.len());
    let inputs = shard.level1.oldest(take);
    if take == 0 || inputs.len() < take {
        return Ok(MergeOutcome::skipped(Tier::Level1));
    }

    let started = Instant::now();
    info!(
        shard = shard.id(),
        level1 = shard.level1.len(),
        level2 = shard.level2.len(),
        ways,
        "level 1 merge started"
    );

    let mut expected_entries = 0usize;
    let mut expected_bytes = 0usize;
    let mut sources: Vec<Box<dyn MergeSource>> = Vec::with_capacity(inputs.len() + base.len());
    for table in inputs.iter().chain(base.iter()) {
        expected_entries += table.len();
        expected_bytes += table.data_used();
        sources.push(Box::new(SortedSource::new(Arc::clone(table), read_ahead)));
    }

    let mut output = SortedTable::new(
        shard.id(),
        Tier::Level2,
        clock.next_stamp(),
        expected_entries,
        expected_bytes,
        Arc::clone(codec),
    )?;

    let batch_len = read_ahead.max(1) * ways;
    let mut batch: Vec<Record> = Vec::with_capacity(batch_len);
    let counts = merge_sources(
        sources,
        GcPolicy::DropTombstones,
        clock::now_millis(),
        |record| {
            batch.push(record);
            if batch.len() >= batch_len {
                flush(&mut output, &mut batch)?;
            }
            Ok(())
        },
    )?;
    flush(&mut output, &mut batch)?;
    output.truncate()?;

    {
        let mut level1 = shard.level1.write();
        let mut level2 = shard.level2.write();
        level1.verify_oldest(&inputs)?;
        level2.verify_oldest(&base)?;
        level1.remove_oldest(&inputs)?;
        level2.remove_oldest(&base)?;
        if !output.is_empty() {
            level2.add_first(Arc::new(output));
        }
    }

    let outcome = MergeOutcome {
        tier: Tier::Level1,
        tables_in: inputs.len() + base.len(),
        counts,
        elapsed: started.elapsed(),
    };
    debug!(shard = shard.id(), ?counts, "level 1 merge counts");
    info!(
        shard = shard.id(),
        tables_in = outcome.tables_in,
        entries_in = counts.entries_in,
        entries_out = counts.entries_out,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "level 1 merge finished"
    );
    Ok(outcome)
}

fn flush(output: &mut SortedTable, batch: &mut Vec<Record>) -> Result<()> {
    for record in batch.drain(..) {
        output.append_record(&record)?;
    }
    Ok(())
}
