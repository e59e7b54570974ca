//! Level 0 → 1 merge
//!
//! Folds the oldest frozen active tables of a shard into one sorted level 1
//! table. Deleted and expired records survive as placeholders so they keep
//! shadowing older copies in levels 1 and 2.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::clock::{self, TableClock};
use crate::compression::Codec;
use crate::error::Result;
use crate::storage::Shard;
use crate::table::{MapTable, SortedTable, Tier};

use super::{merge_sources, ActiveSource, GcPolicy, MergeOutcome, MergeSource};

/// Merge the `ways` oldest level 0 tables of `shard` into a new level 1
/// table. Skipped when fewer than `ways` tables are waiting.
pub fn merge_level0(
    shard: &Shard,
    ways: usize,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let _pass = shard.merge_lock(Tier::Level0)?;
    run(shard, ways, codec, clock)
}

/// Merge every level 0 table of `shard` into a new level 1 table
pub fn merge_level0_all(
    shard: &Shard,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let _pass = shard.merge_lock(Tier::Level0)?;
    run(shard, shard.level0.len(), codec, clock)
}

fn run(
    shard: &Shard,
    ways: usize,
    codec: &Arc<dyn Codec>,
    clock: &TableClock,
) -> Result<MergeOutcome> {
    let inputs = shard.level0.oldest(ways);
    if ways == 0 || inputs.len() < ways {
        return Ok(MergeOutcome::skipped(Tier::Level0));
    }

    let started = Instant::now();
    info!(
        shard = shard.id(),
        level0 = shard.level0.len(),
        level1 = shard.level1.len(),
        ways,
        "level 0 merge started"
    );

    let mut expected_entries = 0usize;
    let mut expected_bytes = 0usize;
    let mut sources: Vec<Box<dyn MergeSource>> = Vec::with_capacity(inputs.len());
    for table in &inputs {
        table.freeze();
        table.wait_for_writers();
        expected_entries += table.live_len();
        expected_bytes += table.used_bytes();
        sources.push(Box::new(ActiveSource::new(Arc::clone(table))?));
    }

    let mut output = SortedTable::new(
        shard.id(),
        Tier::Level1,
        clock.next_stamp(),
        expected_entries,
        expected_bytes,
        Arc::clone(codec),
    )?;
    let counts = merge_sources(
        sources,
        GcPolicy::KeepTombstones,
        clock::now_millis(),
        |record| output.append_record(&record),
    )?;
    output.truncate()?;

    {
        let mut level0 = shard.level0.write();
        let mut level1 = shard.level1.write();
        level0.remove_oldest(&inputs)?;
        if !output.is_empty() {
            level1.add_first(Arc::new(output));
        }
    }

    let outcome = MergeOutcome {
        tier: Tier::Level0,
        tables_in: inputs.len(),
        counts,
        elapsed: started.elapsed(),
    };
    debug!(shard = shard.id(), ?counts, "level 0 merge counts");
    info!(
        shard = shard.id(),
        tables_in = outcome.tables_in,
        entries_in = counts.entries_in,
        entries_out = counts.entries_out,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "level 0 merge finished"
    );
    Ok(outcome)
}
