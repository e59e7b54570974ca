//! Cache
//!
//! The public entry point: routes every operation to a shard by key hash
//! and owns the background threads.
//!
//! ## Responsibilities
//! - Validate input and route put/get/delete to `hash(key) % shard_count`
//! - Rotate a shard's active table when it overflows
//! - Search tiers newest → oldest on reads, optionally promoting level 2 hits
//! - Start and stop the merge workers and the memory statistics collector

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::{self, TableClock};
use crate::compaction::{merge_level0_all, merge_level1_all, MergeContext, MergeOutcome, MergeWorker};
use crate::compression::{Codec, Lz4Codec};
use crate::config::CacheConfig;
use crate::entry::{self, NO_TIMEOUT, PLACEHOLDER};
use crate::error::{CacheError, Result};
use crate::stats::{self, CacheStats, MemoryStatsCollector, Operation, StatsSink, StatsSnapshot};
use crate::storage::Shard;
use crate::table::{ActiveTable, GetResult, MapTable, Tier};

/// Sharded, tiered key-value cache
///
/// ## Concurrency:
/// - All operations take `&self`; share a `Cache` across threads with `Arc`
/// - Shards never synchronize with each other
/// - Within a shard, writers only contend on the active table's short
///   append lock, and on the rotation lock when the table overflows
pub struct Cache {
    config: CacheConfig,
    shards: Vec<Arc<Shard>>,
    ctx: MergeContext,

    /// Set by [`Cache::open`], which aggregates in process
    local_stats: Option<Arc<CacheStats>>,

    workers: Mutex<Vec<MergeWorker>>,
    collector: Mutex<Option<MemoryStatsCollector>>,
    closed: AtomicBool,
}

impl Cache {
    /// Open a cache with LZ4 compression and in-process statistics
    pub fn open(config: CacheConfig) -> Result<Self> {
        let stats = Arc::new(CacheStats::new());
        let mut cache = Self::open_with(config, Arc::new(Lz4Codec), Arc::clone(&stats) as Arc<dyn StatsSink>)?;
        cache.local_stats = Some(stats);
        Ok(cache)
    }

    /// Open a cache with an explicit codec and statistics sink
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Create one active table per shard
    /// 3. Start two merge workers per shard
    /// 4. Start the memory statistics collector
    pub fn open_with(
        config: CacheConfig,
        codec: Arc<dyn Codec>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = MergeContext {
            codec,
            clock: Arc::new(TableClock::new()),
            stats,
            read_ahead: config.read_ahead,
        };

        let mut shards = Vec::with_capacity(config.shard_count);
        for id in 0..config.shard_count {
            let active = new_active(&config, &ctx, id)?;
            shards.push(Arc::new(Shard::new(id, active)));
        }

        let mut workers = Vec::with_capacity(config.shard_count * 2);
        for shard in &shards {
            workers.push(MergeWorker::spawn(
                Arc::clone(shard),
                Tier::Level0,
                config.level0_idle,
                ctx.clone(),
            )?);
            workers.push(MergeWorker::spawn(
                Arc::clone(shard),
                Tier::Level1,
                config.level1_idle,
                ctx.clone(),
            )?);
        }

        let collector = MemoryStatsCollector::spawn(
            shards.clone(),
            config.stats_interval,
            config.max_memory_bytes,
            Arc::clone(&ctx.stats),
        )?;

        info!(
            shards = config.shard_count,
            codec = ctx.codec.name(),
            compression = config.compression_enabled,
            locality = config.locality_enabled,
            "cache opened"
        );

        Ok(Self {
            config,
            shards,
            ctx,
            local_stats: None,
            workers: Mutex::new(workers),
            collector: Mutex::new(Some(collector)),
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Store a value that never expires
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_ttl(key, value, NO_TIMEOUT)
    }

    /// Store a value that expires `ttl_ms` milliseconds from now.
    /// A ttl of zero or less never expires.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: i64) -> Result<()> {
        let started = Instant::now();
        let result = self.ensure_open().and_then(|_| {
            if key.is_empty() {
                return Err(CacheError::invalid("key is empty"));
            }
            if value.is_empty() {
                return Err(CacheError::invalid("value is empty"));
            }
            self.write(self.shard_for(key), key, value, ttl_ms, clock::now_millis(), false)
        });
        self.finish(Operation::Put, Tier::Active, started, result)
    }

    /// Remove a key. Deleting an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let started = Instant::now();
        let result = self.ensure_open().and_then(|_| {
            if key.is_empty() {
                return Err(CacheError::invalid("key is empty"));
            }
            self.write(
                self.shard_for(key),
                key,
                PLACEHOLDER,
                NO_TIMEOUT,
                clock::now_millis(),
                true,
            )
        });
        self.finish(Operation::Delete, Tier::Active, started, result)
    }

    /// Look up a key. `None` covers absent, deleted and expired keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let result = self.ensure_open().and_then(|_| {
            if key.is_empty() {
                return Err(CacheError::invalid("key is empty"));
            }
            self.lookup(self.shard_for(key), key)
        });

        match result {
            Ok((value, tier)) => {
                self.ctx
                    .stats
                    .record_operation(Operation::Get, tier, started.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.ctx.stats.record_error(Operation::Get);
                Err(e)
            }
        }
    }

    /// Synchronously push everything down to level 2.
    ///
    /// Per shard: rotate a non-empty active table, merge all of level 0 into
    /// level 1, then all of level 1 together with level 2 into a new level 2
    /// table. Deleted and expired records written before the call are gone
    /// from every tier afterwards.
    pub fn force_compaction(&self) -> Result<()> {
        self.ensure_open()?;

        for shard in &self.shards {
            {
                let _rotation = shard.rotation_lock();
                let active = shard.active()?;
                if !active.is_empty() {
                    let fresh = new_active(&self.config, &self.ctx, shard.id())?;
                    shard.rotate(Arc::new(fresh))?;
                    debug!(shard = shard.id(), "active table rotated for compaction");
                }
            }

            let outcome = merge_level0_all(shard, &self.ctx.codec, &self.ctx.clock)?;
            self.record_merge(&outcome);
            let outcome =
                merge_level1_all(shard, self.ctx.read_ahead, &self.ctx.codec, &self.ctx.clock)?;
            self.record_merge(&outcome);
        }
        Ok(())
    }

    /// Stop background threads and release every table.
    ///
    /// Waits for in-flight merge passes to finish. Idempotent; afterwards
    /// every operation fails with [`CacheError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.signal_stop();
        }
        for worker in workers.iter_mut() {
            worker.stop();
        }
        if let Some(mut collector) = self.collector.lock().take() {
            collector.stop();
        }

        for shard in &self.shards {
            shard.release();
        }
        info!(shards = self.shards.len(), "cache closed");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The sink every measurement goes to
    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.ctx.stats
    }

    /// Aggregated statistics, when opened with [`Cache::open`]
    pub fn stats_snapshot(&self) -> Option<StatsSnapshot> {
        self.local_stats.as_ref().map(|stats| stats.snapshot())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard a key routes to
    pub fn shard_index(&self, key: &[u8]) -> usize {
        entry::key_hash(key) as usize % self.shards.len()
    }

    /// Tables currently held in `tier` of shard `shard`
    pub fn tier_len(&self, shard: usize, tier: Tier) -> Result<usize> {
        let shard = self.shards.get(shard).ok_or_else(|| {
            CacheError::invalid(format!("shard {} out of range ({} shards)", shard, self.shards.len()))
        })?;
        Ok(shard.tier_len(tier))
    }

    /// Arena bytes held across all shards and tiers
    pub fn memory_usage(&self) -> u64 {
        stats::tier_usage(&self.shards).iter().sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn finish(&self, op: Operation, tier: Tier, started: Instant, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.ctx.stats.record_operation(op, tier, started.elapsed()),
            Err(_) => self.ctx.stats.record_error(op),
        }
        result
    }

    fn record_merge(&self, outcome: &MergeOutcome) {
        if !outcome.is_skipped() {
            self.ctx.stats.record_merge_cost(outcome.tier, outcome.elapsed);
        }
    }

    /// Append to the shard's active table, rotating it on overflow
    fn write(
        &self,
        shard: &Shard,
        key: &[u8],
        value: &[u8],
        ttl: i64,
        created_at: i64,
        is_delete: bool,
    ) -> Result<()> {
        loop {
            let active = shard.active()?;
            if active.put(key, value, ttl, created_at, is_delete)? {
                return Ok(());
            }
            self.rotate(shard, &active)?;
        }
    }

    /// Replace `full` unless another writer already did
    fn rotate(&self, shard: &Shard, full: &Arc<ActiveTable>) -> Result<()> {
        let _rotation = shard.rotation_lock();
        if !Arc::ptr_eq(&shard.active()?, full) {
            return Ok(());
        }

        let fresh = new_active(&self.config, &self.ctx, shard.id())?;
        shard.rotate(Arc::new(fresh))?;
        debug!(
            shard = shard.id(),
            records = full.len(),
            level0 = shard.level0.len(),
            "active table rotated"
        );

        for worker in self.workers.lock().iter() {
            if worker.shard() == shard.id() && worker.tier() == Tier::Level0 {
                worker.wake();
            }
        }
        Ok(())
    }

    /// First structural hit, newest tier first. Returns the value (if live)
    /// and the deepest tier consulted.
    fn lookup(&self, shard: &Shard, key: &[u8]) -> Result<(Option<Vec<u8>>, Tier)> {
        let hit = shard.active()?.get(key)?;
        if hit.found {
            return Ok((hit.value, Tier::Active));
        }
        if let Some(hit) = shard.level0.search(key)? {
            return Ok((hit.value, Tier::Level0));
        }
        if let Some(hit) = shard.level1.search(key)? {
            return Ok((hit.value, Tier::Level1));
        }

        match shard.level2.search(key)? {
            Some(hit) => {
                if self.config.locality_enabled && hit.is_live() {
                    self.promote(shard, key, &hit)?;
                }
                Ok((hit.value, Tier::Level2))
            }
            None => Ok((None, Tier::Level2)),
        }
    }

    /// Re-write a live level 2 hit into the active table with its original
    /// ttl and creation time
    fn promote(&self, shard: &Shard, key: &[u8], hit: &GetResult) -> Result<()> {
        let Some(value) = hit.value.as_deref() else {
            return Ok(());
        };
        // A write that landed since the lookup started is fresher
        if shard.active()?.get(key)?.found {
            return Ok(());
        }
        self.write(shard, key, value, hit.ttl, hit.created_at, false)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("shards", &self.shards.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn new_active(config: &CacheConfig, ctx: &MergeContext, shard: usize) -> Result<ActiveTable> {
    ActiveTable::new(
        shard,
        ctx.clock.next_stamp(),
        config.active_table_slots,
        config.active_table_bytes,
        Arc::clone(&ctx.codec),
        config.compression_enabled,
    )
}
