//! Background merge worker
//!
//! One thread per (shard, merge tier). Runs a pass whenever one is eligible
//! and otherwise waits on its wake channel for at most the idle period.
//!
//! ## Loop
//! ```text
//! while !stop:
//!     pass ok, merged   → loop again right away
//!     pass ok, skipped  → wait(idle)
//!     pass failed       → log, count, wait(idle), retry later
//! ```
//! The stop flag is read once per iteration; a pass in flight always
//! completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info};

use crate::clock::TableClock;
use crate::compression::Codec;
use crate::error::{CacheError, Result};
use crate::stats::{Operation, StatsSink};
use crate::storage::Shard;
use crate::table::Tier;

use super::{merge_level0, merge_level1, MergeOutcome, LEVEL0_WAYS, LEVEL1_WAYS};

/// One unit of background work, run repeatedly by a [`MergeWorker`]
pub trait MergePass: Send + 'static {
    /// Run one pass out of `tier`; a skipped outcome means nothing was eligible
    fn run_pass(&self, shard: &Shard, tier: Tier) -> Result<MergeOutcome>;

    /// Where failed passes are counted
    fn stats(&self) -> &dyn StatsSink;
}

/// Shared inputs of every merge pass
#[derive(Clone)]
pub struct MergeContext {
    pub codec: Arc<dyn Codec>,
    pub clock: Arc<TableClock>,
    pub stats: Arc<dyn StatsSink>,
    pub read_ahead: usize,
}

impl MergePass for MergeContext {
    /// Run one background-sized pass out of `tier`
    fn run_pass(&self, shard: &Shard, tier: Tier) -> Result<MergeOutcome> {
        let outcome = match tier {
            Tier::Level0 => merge_level0(shard, LEVEL0_WAYS, &self.codec, &self.clock)?,
            Tier::Level1 => merge_level1(
                shard,
                LEVEL1_WAYS,
                self.read_ahead,
                &self.codec,
                &self.clock,
            )?,
            other => {
                return Err(CacheError::invalid(format!("no merger runs out of {}", other)))
            }
        };
        if !outcome.is_skipped() {
            self.stats.record_merge_cost(tier, outcome.elapsed);
        }
        Ok(outcome)
    }

    fn stats(&self) -> &dyn StatsSink {
        self.stats.as_ref()
    }
}

/// Handle to a running merge thread
pub struct MergeWorker {
    tier: Tier,
    shard: usize,
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Start a thread merging out of `tier`, which must be level 0 or 1
    pub fn spawn<P: MergePass>(shard: Arc<Shard>, tier: Tier, idle: Duration, pass: P) -> Result<Self> {
        if !matches!(tier, Tier::Level0 | Tier::Level1) {
            return Err(CacheError::invalid(format!("no merger runs out of {}", tier)));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = channel::bounded::<()>(1);
        let shard_id = shard.id();

        let name = match tier {
            Tier::Level1 => format!("tiercache-l1-merge-{}", shard_id),
            _ => format!("tiercache-l0-merge-{}", shard_id),
        };
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(shard, tier, idle, pass, thread_stop, wake_rx))?;

        Ok(Self {
            tier,
            shard: shard_id,
            stop,
            wake,
            handle: Some(handle),
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Cut the current idle wait short. Never blocks.
    pub fn wake(&self) {
        let _ = self.wake.try_send(());
    }

    /// Ask the thread to exit after its current iteration
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// Whether the thread is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signal and wait for the thread to exit
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(shard = self.shard, tier = %self.tier, "merge thread panicked");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<P: MergePass>(
    shard: Arc<Shard>,
    tier: Tier,
    idle: Duration,
    pass: P,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
) {
    info!(shard = shard.id(), %tier, "merge thread started");

    while !stop.load(Ordering::Acquire) {
        match pass.run_pass(&shard, tier) {
            Ok(outcome) if !outcome.is_skipped() => continue,
            Ok(_) => {}
            Err(e) => {
                error!(shard = shard.id(), %tier, error = %e, "merge pass failed");
                pass.stats().record_error(Operation::Merge);
            }
        }

        match wake.recv_timeout(idle) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(shard = shard.id(), %tier, "merge thread stopped");
}
