//! Level 0 Merge Tests
//!
//! Tests verify:
//! - Two frozen active tables fold into one level 1 table
//! - The newest copy of a duplicate key wins
//! - Deleted/expired records keep their metadata behind a placeholder value
//! - Inputs are removed and the skip rule when too few tables wait
//! - The background worker picks up eligible work and survives failed passes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tiercache::clock::{now_millis, TableClock};
use tiercache::compaction::{
    merge_level0, merge_level0_all, MergeContext, MergeOutcome, MergePass, MergeWorker, LEVEL0_WAYS,
};
use tiercache::compression::{Codec, Lz4Codec, NoopCodec};
use tiercache::entry::{Record, NO_TIMEOUT, PLACEHOLDER};
use tiercache::stats::{CacheStats, StatsSink};
use tiercache::storage::Shard;
use tiercache::table::{ActiveTable, MapTable, SortedTable, Tier};
use tiercache::{CacheError, Operation, Result};

fn codec() -> Arc<dyn Codec> {
    Arc::new(NoopCodec)
}

fn shard() -> Shard {
    Shard::new(0, ActiveTable::new(0, 0, 64, 4096, codec(), false).unwrap())
}

fn table(clock: &TableClock) -> ActiveTable {
    ActiveTable::new(0, clock.next_stamp(), 256, 1 << 16, codec(), false).unwrap()
}

fn put(table: &ActiveTable, key: &str, value: &str) {
    assert!(table.put(key.as_bytes(), value.as_bytes(), NO_TIMEOUT, now_millis(), false).unwrap());
}

fn freeze_into_level0(shard: &Shard, table: ActiveTable) {
    table.freeze();
    shard.level0.add_first(Arc::new(table));
}

fn records(table: &SortedTable) -> Vec<Record> {
    (0..table.len()).map(|i| table.record(i).unwrap()).collect()
}

fn level1_output(shard: &Shard) -> Arc<SortedTable> {
    let tables = shard.level1.snapshot();
    assert_eq!(tables.len(), 1);
    Arc::clone(&tables[0])
}

// =============================================================================
// Merge Semantics Tests
// =============================================================================

#[test]
fn test_merge_keeps_all_keys_and_placeholders_collected() {
    let clock = TableClock::new();
    let shard = shard();

    // k0..k9 in the older table, k5..k14 in the newer one
    let older = table(&clock);
    for i in 0..10 {
        put(&older, &format!("k{}", i), "old");
    }
    let newer = table(&clock);
    for i in 8..15 {
        put(&newer, &format!("k{}", i), "new");
    }
    newer.delete(b"k5").unwrap();
    newer.delete(b"k6").unwrap();
    newer.put(b"k7", b"short-lived", 50, now_millis() - 10_000, false).unwrap();

    freeze_into_level0(&shard, older);
    freeze_into_level0(&shard, newer);

    let outcome = merge_level0(&shard, 2, &codec(), &clock).unwrap();
    assert_eq!(outcome.tables_in, 2);
    assert_eq!(outcome.counts.entries_out, 15);
    assert_eq!(outcome.counts.collected, 3);
    assert_eq!(outcome.counts.duplicates, 5);

    let output = level1_output(&shard);
    assert_eq!(output.tier(), Tier::Level1);
    let records = records(&output);
    assert_eq!(records.len(), 15);

    let placeholders: Vec<&Record> = records.iter().filter(|r| r.value == PLACEHOLDER).collect();
    assert_eq!(placeholders.len(), 3);

    let k5 = records.iter().find(|r| r.key == b"k5").unwrap();
    assert!(k5.deleted);
    let k7 = records.iter().find(|r| r.key == b"k7").unwrap();
    assert!(!k7.deleted);
    assert_eq!(k7.ttl, 50);
    assert!(k7.is_expired(now_millis()));
    assert_eq!(k7.value, PLACEHOLDER);

    for i in [0, 1, 2, 3, 4] {
        let hit = output.get(format!("k{}", i).as_bytes()).unwrap();
        assert_eq!(hit.value, Some(b"old".to_vec()));
    }
    for i in 8..15 {
        let hit = output.get(format!("k{}", i).as_bytes()).unwrap();
        assert_eq!(hit.value, Some(b"new".to_vec()));
    }
    assert!(output.get(b"k6").unwrap().deleted);
    assert!(output.get(b"k7").unwrap().expired);
}

#[test]
fn test_newest_table_wins_whatever_queue_position() {
    let clock = TableClock::new();
    let shard = shard();
    let older = table(&clock);
    let newer = table(&clock);
    put(&older, "key", "stale");
    put(&newer, "key", "fresh");

    // Inserted in reverse; only the creation stamp decides
    freeze_into_level0(&shard, newer);
    freeze_into_level0(&shard, older);

    merge_level0(&shard, 2, &codec(), &clock).unwrap();
    let output = level1_output(&shard);
    assert_eq!(output.len(), 1);
    assert_eq!(output.get(b"key").unwrap().value, Some(b"fresh".to_vec()));
}

#[test]
fn test_tombstone_in_newer_table_shadows_older_value() {
    let clock = TableClock::new();
    let shard = shard();
    let older = table(&clock);
    put(&older, "session", "alive");
    let newer = table(&clock);
    newer.delete(b"session").unwrap();

    freeze_into_level0(&shard, older);
    freeze_into_level0(&shard, newer);
    merge_level0(&shard, 2, &codec(), &clock).unwrap();

    let hit = level1_output(&shard).get(b"session").unwrap();
    assert!(hit.found && hit.deleted);
    assert_eq!(hit.value, None);
}

#[test]
fn test_rewrite_after_delete_in_newer_table_is_live() {
    let clock = TableClock::new();
    let shard = shard();
    let older = table(&clock);
    older.delete(b"key").unwrap();
    let newer = table(&clock);
    put(&newer, "key", "back");

    freeze_into_level0(&shard, older);
    freeze_into_level0(&shard, newer);
    merge_level0(&shard, 2, &codec(), &clock).unwrap();

    let hit = level1_output(&shard).get(b"key").unwrap();
    assert!(hit.is_live());
    assert_eq!(hit.value, Some(b"back".to_vec()));
}

#[test]
fn test_compressed_values_move_untouched() {
    let clock = TableClock::new();
    let lz4: Arc<dyn Codec> = Arc::new(Lz4Codec);
    let shard = shard();
    let value = b"compressible-".repeat(30);

    for _ in 0..2 {
        let table = ActiveTable::new(0, clock.next_stamp(), 16, 4096, Arc::clone(&lz4), true).unwrap();
        table.put(b"key", &value, NO_TIMEOUT, now_millis(), false).unwrap();
        table.delete(b"gone").unwrap();
        freeze_into_level0(&shard, table);
    }

    merge_level0(&shard, 2, &lz4, &clock).unwrap();
    let output = level1_output(&shard);
    let stored = records(&output);
    let key = stored.iter().find(|r| r.key == b"key").unwrap();
    assert!(key.compressed);
    assert!(key.value.len() < value.len());
    assert_eq!(output.get(b"key").unwrap().value, Some(value));

    let gone = stored.iter().find(|r| r.key == b"gone").unwrap();
    assert!(gone.deleted && !gone.compressed);
}

// =============================================================================
// Queue Handling Tests
// =============================================================================

#[test]
fn test_merge_consumes_the_two_oldest() {
    let clock = TableClock::new();
    let shard = shard();
    for i in 0..3 {
        let table = table(&clock);
        put(&table, &format!("key{}", i), "v");
        freeze_into_level0(&shard, table);
    }

    merge_level0(&shard, LEVEL0_WAYS, &codec(), &clock).unwrap();

    assert_eq!(shard.level0.len(), 1);
    let remaining = shard.level0.snapshot();
    assert!(remaining[0].get(b"key2").unwrap().found);

    let output = level1_output(&shard);
    assert_eq!(output.len(), 2);
    assert!(output.get(b"key0").unwrap().found);
    assert!(output.get(b"key1").unwrap().found);
}

#[test]
fn test_skipped_when_too_few_tables() {
    let clock = TableClock::new();
    let shard = shard();
    let table = table(&clock);
    put(&table, "key", "v");
    freeze_into_level0(&shard, table);

    let outcome = merge_level0(&shard, 2, &codec(), &clock).unwrap();
    assert!(outcome.is_skipped());
    assert_eq!(shard.level0.len(), 1);
    assert!(shard.level1.is_empty());
}

#[test]
fn test_merge_all_folds_every_table() {
    let clock = TableClock::new();
    let shard = shard();
    for i in 0..5 {
        let table = table(&clock);
        put(&table, "shared", &format!("v{}", i));
        freeze_into_level0(&shard, table);
    }

    let outcome = merge_level0_all(&shard, &codec(), &clock).unwrap();
    assert_eq!(outcome.tables_in, 5);
    assert!(shard.level0.is_empty());
    assert_eq!(level1_output(&shard).get(b"shared").unwrap().value, Some(b"v4".to_vec()));

    assert!(merge_level0_all(&shard, &codec(), &clock).unwrap().is_skipped());
}

#[test]
fn test_output_stamped_newer_than_inputs() {
    let clock = TableClock::new();
    let shard = shard();
    let mut newest_input = 0;
    for _ in 0..2 {
        let table = table(&clock);
        newest_input = table.created_at();
        put(&table, "k", "v");
        freeze_into_level0(&shard, table);
    }

    merge_level0(&shard, 2, &codec(), &clock).unwrap();
    assert!(level1_output(&shard).created_at() > newest_input);
}

// =============================================================================
// Background Worker Tests
// =============================================================================

#[test]
fn test_worker_merges_in_background() {
    let clock = Arc::new(TableClock::new());
    let stats = Arc::new(CacheStats::new());
    let shard = Arc::new(shard());

    let ctx = MergeContext {
        codec: codec(),
        clock: Arc::clone(&clock),
        stats: Arc::clone(&stats) as Arc<dyn StatsSink>,
        read_ahead: 8,
    };
    let mut worker =
        MergeWorker::spawn(Arc::clone(&shard), Tier::Level0, Duration::from_millis(20), ctx).unwrap();

    for i in 0..2 {
        let table = table(&clock);
        put(&table, &format!("key{}", i), "v");
        freeze_into_level0(&shard, table);
    }
    worker.wake();

    let deadline = Instant::now() + Duration::from_secs(10);
    while shard.level1.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    worker.stop();

    assert!(shard.level0.is_empty());
    assert_eq!(shard.level1.len(), 1);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.merges(Tier::Level0).count, 1);
    assert_eq!(snapshot.errors(Operation::Merge), 0);
}

/// Fails its first `failures` passes, then merges normally
struct FlakyPass {
    inner: MergeContext,
    failures: AtomicUsize,
}

impl MergePass for FlakyPass {
    fn run_pass(&self, shard: &Shard, tier: Tier) -> Result<MergeOutcome> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(CacheError::MergeFailure("merge input vanished".into()));
        }
        self.inner.run_pass(shard, tier)
    }

    fn stats(&self) -> &dyn StatsSink {
        self.inner.stats()
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_worker_retries_after_failed_passes() {
    let clock = Arc::new(TableClock::new());
    let stats = Arc::new(CacheStats::new());
    let shard = Arc::new(shard());

    for i in 0..2 {
        let table = table(&clock);
        put(&table, &format!("key{}", i), "v");
        freeze_into_level0(&shard, table);
    }

    let pass = FlakyPass {
        inner: MergeContext {
            codec: codec(),
            clock: Arc::clone(&clock),
            stats: Arc::clone(&stats) as Arc<dyn StatsSink>,
            read_ahead: 8,
        },
        failures: AtomicUsize::new(3),
    };
    let mut worker =
        MergeWorker::spawn(Arc::clone(&shard), Tier::Level0, Duration::from_millis(5), pass).unwrap();

    // Three failures, then the waiting pair is merged
    wait_until(|| stats.snapshot().merges(Tier::Level0).count == 1);
    assert_eq!(shard.level1.len(), 1);
    assert!(worker.is_running());
    assert!(shard.level0.is_empty());
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.errors(Operation::Merge), 3);
    assert_eq!(snapshot.merges(Tier::Level0).count, 1);

    // Still picks up new work afterwards
    for i in 2..4 {
        let table = table(&clock);
        put(&table, &format!("key{}", i), "v");
        freeze_into_level0(&shard, table);
    }
    worker.wake();
    wait_until(|| stats.snapshot().merges(Tier::Level0).count == 2);
    assert!(worker.is_running());

    worker.stop();
    assert!(!worker.is_running());
    assert_eq!(shard.level1.len(), 2);
    assert_eq!(stats.snapshot().errors(Operation::Merge), 3);
}

#[test]
fn test_worker_rejects_tiers_without_a_merger() {
    let clock = Arc::new(TableClock::new());
    let shard = Arc::new(shard());
    let ctx = MergeContext {
        codec: codec(),
        clock,
        stats: Arc::new(CacheStats::new()),
        read_ahead: 8,
    };

    for tier in [Tier::Active, Tier::Level2] {
        let result = MergeWorker::spawn(Arc::clone(&shard), tier, Duration::from_millis(5), ctx.clone());
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }
}
