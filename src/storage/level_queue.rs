//! Level queue
//!
//! Newest-first list of the tables of one (shard, tier) pair.
//!
//! ## Concurrency:
//! - Readers iterate under the read lock, so a search never sees a half-done
//!   compaction swap
//! - Writers insert at the head; compaction removes from the tail, under the
//!   write lock, exactly the tables it consumed

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{CacheError, Result};
use crate::table::{GetResult, MapTable, Tier};

/// Ordered tables of one tier, newest at the head
pub struct LevelQueue<T: MapTable> {
    tier: Tier,
    tables: RwLock<VecDeque<Arc<T>>>,
}

impl<T: MapTable> LevelQueue<T> {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            tables: RwLock::new(VecDeque::new()),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Insert a table as the newest of this tier
    pub fn add_first(&self, table: Arc<T>) {
        self.tables.write().push_front(table);
    }

    /// Up to `n` tables from the tail, oldest first
    pub fn oldest(&self, n: usize) -> Vec<Arc<T>> {
        self.tables.read().iter().rev().take(n).cloned().collect()
    }

    /// All tables, newest first
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.tables.read().iter().cloned().collect()
    }

    /// First structural hit (live, deleted or expired), searching newest to
    /// oldest
    pub fn search(&self, key: &[u8]) -> Result<Option<GetResult>> {
        let tables = self.tables.read();
        for table in tables.iter() {
            let result = table.get(key)?;
            if result.found {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Exclusive access for an atomic consume/replace step
    pub fn write(&self) -> LevelQueueWriteGuard<'_, T> {
        LevelQueueWriteGuard {
            tier: self.tier,
            tables: self.tables.write(),
        }
    }

    /// Bytes held by every table in this tier
    pub fn memory_usage(&self) -> u64 {
        self.tables.read().iter().map(|t| t.memory_usage()).sum()
    }

    /// Remove every table, newest first
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.tables.write().drain(..).collect()
    }
}

/// Write-locked view of a level queue
pub struct LevelQueueWriteGuard<'a, T: MapTable> {
    tier: Tier,
    tables: RwLockWriteGuard<'a, VecDeque<Arc<T>>>,
}

impl<'a, T: MapTable> LevelQueueWriteGuard<'a, T> {
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn add_first(&mut self, table: Arc<T>) {
        self.tables.push_front(table);
    }

    /// Remove `consumed` (oldest first) from the tail.
    ///
    /// Fails without touching the queue unless the tail holds exactly those
    /// tables in that order.
    pub fn remove_oldest(&mut self, consumed: &[Arc<T>]) -> Result<()> {
        self.verify_oldest(consumed)?;
        for _ in consumed {
            self.tables.pop_back();
        }
        Ok(())
    }

    /// Check that the tail holds exactly `consumed`, oldest first
    pub fn verify_oldest(&self, consumed: &[Arc<T>]) -> Result<()> {
        if consumed.len() > self.tables.len() {
            return Err(CacheError::MergeFailure(format!(
                "{} holds {} tables, cannot remove {}",
                self.tier,
                self.tables.len(),
                consumed.len()
            )));
        }

        let tail = self.tables.iter().rev();
        for (position, (expected, actual)) in consumed.iter().zip(tail).enumerate() {
            if !Arc::ptr_eq(expected, actual) {
                return Err(CacheError::MergeFailure(format!(
                    "{} tail changed under merge at position {}",
                    self.tier, position
                )));
            }
        }
        Ok(())
    }
}
