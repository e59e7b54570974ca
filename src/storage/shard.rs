//! Shard
//!
//! One independent slice of the cache: the active table plus the three level
//! queues. Nothing here is shared with any other shard.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{CacheError, Result};
use crate::table::{ActiveTable, SortedTable, Tier};

use super::LevelQueue;

/// Per-shard state shared by the cache and its merge workers
///
/// ## Locks:
/// - `active`: pointer to the mutable table, replaced only on rotation
/// - `rotation`: serializes rotations (double-checked by writers)
/// - `level*_merge`: one pass at a time per merge tier, so forced compaction
///   never races a background pass
/// - queue swaps always lock the lower tier before the higher one
pub struct Shard {
    id: usize,
    active: RwLock<Option<Arc<ActiveTable>>>,
    rotation: Mutex<()>,

    pub level0: LevelQueue<ActiveTable>,
    pub level1: LevelQueue<SortedTable>,
    pub level2: LevelQueue<SortedTable>,

    level0_merge: Mutex<()>,
    level1_merge: Mutex<()>,
}

impl Shard {
    pub fn new(id: usize, active: ActiveTable) -> Self {
        Self {
            id,
            active: RwLock::new(Some(Arc::new(active))),
            rotation: Mutex::new(()),
            level0: LevelQueue::new(Tier::Level0),
            level1: LevelQueue::new(Tier::Level1),
            level2: LevelQueue::new(Tier::Level2),
            level0_merge: Mutex::new(()),
            level1_merge: Mutex::new(()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Current active table
    pub fn active(&self) -> Result<Arc<ActiveTable>> {
        self.active.read().clone().ok_or(CacheError::Closed)
    }

    pub fn rotation_lock(&self) -> MutexGuard<'_, ()> {
        self.rotation.lock()
    }

    /// Freeze the current active table, push it to the head of level 0 and
    /// install `fresh`. The caller must hold the rotation lock.
    pub fn rotate(&self, fresh: Arc<ActiveTable>) -> Result<Arc<ActiveTable>> {
        let frozen = self.active()?;
        frozen.freeze();
        self.level0.add_first(Arc::clone(&frozen));
        *self.active.write() = Some(fresh);
        Ok(frozen)
    }

    /// Guard serializing merge passes out of `tier`
    pub fn merge_lock(&self, tier: Tier) -> Result<MutexGuard<'_, ()>> {
        match tier {
            Tier::Level0 => Ok(self.level0_merge.lock()),
            Tier::Level1 => Ok(self.level1_merge.lock()),
            other => Err(CacheError::invalid(format!("no merger runs out of {}", other))),
        }
    }

    /// Tables held in `tier` (the active tier always counts one while open)
    pub fn tier_len(&self, tier: Tier) -> usize {
        match tier {
            Tier::Active => usize::from(self.active.read().is_some()),
            Tier::Level0 => self.level0.len(),
            Tier::Level1 => self.level1.len(),
            Tier::Level2 => self.level2.len(),
        }
    }

    /// Arena bytes held in `tier`
    pub fn memory_usage(&self, tier: Tier) -> u64 {
        use crate::table::MapTable;

        match tier {
            Tier::Active => self
                .active
                .read()
                .as_ref()
                .map_or(0, |table| table.memory_usage()),
            Tier::Level0 => self.level0.memory_usage(),
            Tier::Level1 => self.level1.memory_usage(),
            Tier::Level2 => self.level2.memory_usage(),
        }
    }

    /// Drop every table this shard owns. Arenas are freed as soon as the last
    /// in-flight reader lets go of its handle.
    pub fn release(&self) {
        if let Some(active) = self.active.write().take() {
            active.freeze();
        }
        self.level0.drain();
        self.level1.drain();
        self.level2.drain();
    }
}
