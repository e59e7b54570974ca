//! Memory statistics collector
//!
//! Background thread that periodically sums arena usage per tier across all
//! shards and reports it. The advisory memory cap is only logged against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::Shard;
use crate::table::Tier;

use super::StatsSink;

/// Arena bytes per tier, summed over `shards`, indexed by [`Tier::index`]
pub fn tier_usage(shards: &[Arc<Shard>]) -> [u64; 4] {
    let mut usage = [0u64; 4];
    for shard in shards {
        for tier in Tier::ALL {
            usage[tier.index()] += shard.memory_usage(tier);
        }
    }
    usage
}

/// Periodic sampler of memory usage
pub struct MemoryStatsCollector {
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryStatsCollector {
    pub fn spawn(
        shards: Vec<Arc<Shard>>,
        interval: Duration,
        max_memory_bytes: Option<u64>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = channel::bounded::<()>(1);

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("tiercache-mem-stats".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    Self::sample(&shards, stats.as_ref(), max_memory_bytes);
                    match wake_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("memory stats collector stopped");
            })?;

        Ok(Self {
            stop,
            wake,
            handle: Some(handle),
        })
    }

    /// Take one sample, report it and return the total
    pub fn sample(shards: &[Arc<Shard>], stats: &dyn StatsSink, max_memory_bytes: Option<u64>) -> u64 {
        let usage = tier_usage(shards);
        for tier in Tier::ALL {
            stats.record_memory_usage(tier, usage[tier.index()]);
        }

        let total: u64 = usage.iter().sum();
        stats.record_total_memory(total);
        debug!(
            active = usage[Tier::Active.index()],
            level0 = usage[Tier::Level0.index()],
            level1 = usage[Tier::Level1.index()],
            level2 = usage[Tier::Level2.index()],
            total,
            "memory sample"
        );

        if let Some(cap) = max_memory_bytes {
            if total > cap {
                warn!(total, cap, "memory usage exceeds the configured cap");
            }
        }
        total
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryStatsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
