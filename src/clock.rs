//! Time sources
//!
//! Entries carry wall-clock milliseconds (TTL arithmetic). Tables carry a
//! strictly increasing stamp so merges can always order duplicates by age.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Issues table creation stamps. Every stamp is larger than the previous
/// one, even when the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct TableClock {
    last: AtomicU64,
}

impl TableClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_stamp(&self) -> u64 {
        let now = now_nanos();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
