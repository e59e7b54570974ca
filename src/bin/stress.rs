//! tiercache Stress Binary
//!
//! Drives a concurrent put / get / delete workload against an in-process
//! cache and verifies every read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tiercache::{Cache, CacheConfig, Result, Tier};
use tracing_subscriber::{fmt, EnvFilter};

/// tiercache stress test
#[derive(Parser, Debug, Clone)]
#[command(name = "tiercache-stress")]
#[command(about = "Concurrent load generator for the tiercache key-value cache")]
#[command(version)]
struct Args {
    /// Number of shards
    #[arg(short, long, default_value = "4")]
    shards: usize,

    /// Number of distinct keys
    #[arg(short, long, default_value = "200000")]
    count: usize,

    /// Worker threads per phase
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Key length in bytes
    #[arg(long, default_value = "16")]
    key_len: usize,

    /// Value length in bytes
    #[arg(long, default_value = "256")]
    value_len: usize,

    /// Store values uncompressed
    #[arg(long)]
    no_compression: bool,

    /// Promote level 2 hits back into the active table
    #[arg(long)]
    locality: bool,

    /// Entry time-to-live in milliseconds (0 = never expire)
    #[arg(long, default_value = "0")]
    ttl_ms: i64,

    /// Active table capacity in MB
    #[arg(short = 'm', long, default_value = "8")]
    active_mb: usize,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tiercache=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("tiercache stress v{}", tiercache::VERSION);
    tracing::info!(
        "{} keys x {} bytes, {} shards, {} threads",
        args.count,
        args.value_len,
        args.shards,
        args.threads
    );

    match run(&args) {
        Ok(0) => tracing::info!("All reads verified"),
        Ok(mismatches) => {
            tracing::error!("{} reads returned the wrong value", mismatches);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Stress run failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<u64> {
    let config = CacheConfig::builder()
        .shard_count(args.shards)
        .compression_enabled(!args.no_compression)
        .locality_enabled(args.locality)
        .active_table_bytes(args.active_mb * 1024 * 1024)
        .active_table_slots((args.active_mb * 1024 * 1024 / (args.key_len + 1).max(1)).max(1))
        .level0_idle(Duration::from_millis(200))
        .level1_idle(Duration::from_millis(500))
        .build();
    let cache = Arc::new(Cache::open(config)?);
    let mismatches = Arc::new(AtomicU64::new(0));

    // Phase 1: every key
    phase("put", args, |i| {
        cache.put_with_ttl(&key(i, args.key_len), &value(i, args.value_len), args.ttl_ms)
    })?;

    // Phase 2: every key reads back
    phase("get", args, |i| {
        let got = cache.get(&key(i, args.key_len))?;
        let expected = value(i, args.value_len);
        if !matches(got.as_deref(), Some(&expected[..]), args.ttl_ms) {
            mismatches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })?;

    // Phase 3: drop every other key
    phase("delete", args, |i| {
        if i % 2 == 0 {
            cache.delete(&key(i, args.key_len))?;
        }
        Ok(())
    })?;

    let started = Instant::now();
    cache.force_compaction()?;
    tracing::info!("Forced compaction took {:?}", started.elapsed());
    for shard in 0..cache.shard_count() {
        tracing::debug!(
            "shard {}: level0={} level1={} level2={}",
            shard,
            cache.tier_len(shard, Tier::Level0)?,
            cache.tier_len(shard, Tier::Level1)?,
            cache.tier_len(shard, Tier::Level2)?
        );
    }

    // Phase 4: survivors read back, deleted keys stay gone
    phase("verify", args, |i| {
        let got = cache.get(&key(i, args.key_len))?;
        let expected = (i % 2 == 1).then(|| value(i, args.value_len));
        if !matches(got.as_deref(), expected.as_deref(), args.ttl_ms) {
            mismatches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })?;

    tracing::info!("Memory in use: {} bytes", cache.memory_usage());
    if let Some(snapshot) = cache.stats_snapshot() {
        tracing::info!("Statistics:\n{}", snapshot);
    }
    cache.close()?;

    Ok(mismatches.load(Ordering::Relaxed))
}

/// Run `op` over `0..count`, split across the worker threads
fn phase<F>(name: &str, args: &Args, op: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    let started = Instant::now();
    let threads = args.threads.max(1);
    let per_thread = args.count.div_ceil(threads);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let op = &op;
                scope.spawn(move || {
                    let start = t * per_thread;
                    let end = (start + per_thread).min(args.count);
                    (start..end).try_for_each(op)
                })
            })
            .collect();

        handles
            .into_iter()
            .try_for_each(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
    })?;

    let elapsed = started.elapsed();
    tracing::info!(
        "{:<6} {} ops in {:?} ({:.0} ops/s)",
        name,
        args.count,
        elapsed,
        args.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn matches(got: Option<&[u8]>, expected: Option<&[u8]>, ttl_ms: i64) -> bool {
    // With a ttl, anything may have expired by the time it is read
    got == expected || (ttl_ms > 0 && got.is_none())
}

fn key(i: usize, len: usize) -> Vec<u8> {
    let mut key = format!("key-{:012}", i).into_bytes();
    key.resize(len.max(key.len()), b'.');
    key
}

fn value(i: usize, len: usize) -> Vec<u8> {
    let seed = (i as u64).to_le_bytes();
    seed.iter().copied().cycle().take(len.max(1)).collect()
}
