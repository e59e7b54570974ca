//! Statistics Module
//!
//! Outward-facing hooks the cache reports to, plus an in-process aggregator.
//!
//! ## Responsibilities
//! - [`StatsSink`]: collaborator interface; every method defaults to a no-op
//! - [`CacheStats`]: lock-free counters per (operation, tier), errors, merge
//!   cost and memory gauges, readable as a [`StatsSnapshot`]
//! - [`MemoryStatsCollector`]: background sampler of per-tier arena usage

mod collector;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use collector::{tier_usage, MemoryStatsCollector};

use crate::table::Tier;

/// Kind of work being measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Delete,
    Merge,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Get,
        Operation::Put,
        Operation::Delete,
        Operation::Merge,
    ];

    fn index(self) -> usize {
        match self {
            Operation::Get => 0,
            Operation::Put => 1,
            Operation::Delete => 2,
            Operation::Merge => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => write!(f, "get"),
            Operation::Put => write!(f, "put"),
            Operation::Delete => write!(f, "delete"),
            Operation::Merge => write!(f, "merge"),
        }
    }
}

/// Receiver of cache measurements
pub trait StatsSink: Send + Sync {
    /// A foreground operation finished; `tier` is the deepest tier it reached
    fn record_operation(&self, _op: Operation, _tier: Tier, _latency: Duration) {}

    fn record_error(&self, _op: Operation) {}

    /// A merge pass out of `tier` finished
    fn record_merge_cost(&self, _tier: Tier, _latency: Duration) {}

    /// Arena bytes currently held in `tier`, summed over shards
    fn record_memory_usage(&self, _tier: Tier, _bytes: u64) {}

    fn record_total_memory(&self, _bytes: u64) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {}

// =============================================================================
// In-process Aggregation
// =============================================================================

#[derive(Debug, Default)]
struct LatencyCounter {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl LatencyCounter {
    fn record(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn load(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_nanos.load(Ordering::Relaxed);
        LatencyStats {
            count,
            avg: Duration::from_nanos(if count == 0 { 0 } else { total / count }),
            max: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Counts and latencies aggregated in memory
#[derive(Debug, Default)]
pub struct CacheStats {
    operations: [[LatencyCounter; 4]; 4],
    errors: [AtomicU64; 4],
    merges: [LatencyCounter; 4],
    memory: [AtomicU64; 4],
    total_memory: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        for op in Operation::ALL {
            for tier in Tier::ALL {
                snapshot.operations[op.index()][tier.index()] =
                    self.operations[op.index()][tier.index()].load();
            }
            snapshot.errors[op.index()] = self.errors[op.index()].load(Ordering::Relaxed);
        }
        for tier in Tier::ALL {
            snapshot.merges[tier.index()] = self.merges[tier.index()].load();
            snapshot.memory[tier.index()] = self.memory[tier.index()].load(Ordering::Relaxed);
        }
        snapshot.total_memory = self.total_memory.load(Ordering::Relaxed);
        snapshot
    }
}

impl StatsSink for CacheStats {
    fn record_operation(&self, op: Operation, tier: Tier, latency: Duration) {
        self.operations[op.index()][tier.index()].record(latency);
    }

    fn record_error(&self, op: Operation) {
        self.errors[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_merge_cost(&self, tier: Tier, latency: Duration) {
        self.merges[tier.index()].record(latency);
    }

    fn record_memory_usage(&self, tier: Tier, bytes: u64) {
        self.memory[tier.index()].store(bytes, Ordering::Relaxed);
    }

    fn record_total_memory(&self, bytes: u64) {
        self.total_memory.store(bytes, Ordering::Relaxed);
    }
}

/// Count, mean and worst latency of one measured series
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub avg: Duration,
    pub max: Duration,
}

/// Copy of [`CacheStats`] taken by [`CacheStats::snapshot`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    operations: [[LatencyStats; 4]; 4],
    errors: [u64; 4],
    merges: [LatencyStats; 4],
    memory: [u64; 4],
    total_memory: u64,
}

impl StatsSnapshot {
    pub fn operation(&self, op: Operation, tier: Tier) -> LatencyStats {
        self.operations[op.index()][tier.index()]
    }

    /// Operations of one kind across every tier
    pub fn operation_count(&self, op: Operation) -> u64 {
        self.operations[op.index()].iter().map(|s| s.count).sum()
    }

    pub fn errors(&self, op: Operation) -> u64 {
        self.errors[op.index()]
    }

    /// Merge passes out of `tier`
    pub fn merges(&self, tier: Tier) -> LatencyStats {
        self.merges[tier.index()]
    }

    pub fn memory(&self, tier: Tier) -> u64 {
        self.memory[tier.index()]
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in Operation::ALL {
            for tier in Tier::ALL {
                let stats = self.operation(op, tier);
                if stats.count > 0 {
                    writeln!(
                        f,
                        "{:<6} {:<6} count={:<10} avg={:?} max={:?}",
                        op, tier, stats.count, stats.avg, stats.max
                    )?;
                }
            }
            if self.errors(op) > 0 {
                writeln!(f, "{:<6} errors={}", op, self.errors(op))?;
            }
        }
        for tier in Tier::ALL {
            let merges = self.merges(tier);
            if merges.count > 0 {
                writeln!(
                    f,
                    "merge  {:<6} passes={:<8} avg={:?} max={:?}",
                    tier, merges.count, merges.avg, merges.max
                )?;
            }
        }
        for tier in Tier::ALL {
            writeln!(f, "memory {:<6} {} bytes", tier, self.memory(tier))?;
        }
        write!(f, "memory total  {} bytes", self.total_memory)
    }
}
