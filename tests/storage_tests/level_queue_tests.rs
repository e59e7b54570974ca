//! Level Queue and Shard Tests
//!
//! Tests verify:
//! - Newest-first ordering and tail selection
//! - Search order across tables
//! - Atomic tail removal with identity checks
//! - Shard rotation and release

use std::sync::Arc;

use tiercache::clock::now_millis;
use tiercache::compression::NoopCodec;
use tiercache::entry::NO_TIMEOUT;
use tiercache::storage::{LevelQueue, Shard};
use tiercache::table::{ActiveTable, MapTable, Tier};
use tiercache::CacheError;

fn active(stamp: u64, pairs: &[(&[u8], &[u8])]) -> Arc<ActiveTable> {
    let table = ActiveTable::new(0, stamp, 64, 4096, Arc::new(NoopCodec), false).unwrap();
    for (key, value) in pairs {
        assert!(table.put(key, value, NO_TIMEOUT, now_millis(), false).unwrap());
    }
    table.freeze();
    Arc::new(table)
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_new_queue_is_empty() {
    let queue: LevelQueue<ActiveTable> = LevelQueue::new(Tier::Level0);
    assert!(queue.is_empty());
    assert_eq!(queue.tier(), Tier::Level0);
    assert!(queue.oldest(2).is_empty());
    assert_eq!(queue.memory_usage(), 0);
}

#[test]
fn test_add_first_keeps_newest_at_head() {
    let queue = LevelQueue::new(Tier::Level0);
    for stamp in 1..=3 {
        queue.add_first(active(stamp, &[]));
    }

    let stamps: Vec<u64> = queue.snapshot().iter().map(|t| t.created_at()).collect();
    assert_eq!(stamps, vec![3, 2, 1]);

    let oldest: Vec<u64> = queue.oldest(2).iter().map(|t| t.created_at()).collect();
    assert_eq!(oldest, vec![1, 2]);
    assert_eq!(queue.oldest(10).len(), 3);
}

#[test]
fn test_search_returns_newest_hit() {
    let queue = LevelQueue::new(Tier::Level0);
    queue.add_first(active(1, &[(b"key", b"old"), (b"only-old", b"x")]));
    queue.add_first(active(2, &[(b"key", b"new")]));

    let hit = queue.search(b"key").unwrap().unwrap();
    assert_eq!(hit.value, Some(b"new".to_vec()));
    assert!(queue.search(b"only-old").unwrap().unwrap().is_live());
    assert!(queue.search(b"absent").unwrap().is_none());
}

#[test]
fn test_search_stops_at_tombstone() {
    let queue = LevelQueue::new(Tier::Level0);
    queue.add_first(active(1, &[(b"key", b"old")]));

    let newer = ActiveTable::new(0, 2, 64, 4096, Arc::new(NoopCodec), false).unwrap();
    newer.delete(b"key").unwrap();
    newer.freeze();
    queue.add_first(Arc::new(newer));

    let hit = queue.search(b"key").unwrap().unwrap();
    assert!(hit.deleted);
    assert_eq!(hit.value, None);
}

// =============================================================================
// Swap Tests
// =============================================================================

#[test]
fn test_remove_oldest_checks_identity() {
    let queue = LevelQueue::new(Tier::Level0);
    let (a, b, c) = (active(1, &[]), active(2, &[]), active(3, &[]));
    queue.add_first(Arc::clone(&a));
    queue.add_first(Arc::clone(&b));
    queue.add_first(Arc::clone(&c));

    {
        let mut guard = queue.write();
        // Wrong order
        let result = guard.remove_oldest(&[Arc::clone(&b), Arc::clone(&a)]);
        assert!(matches!(result, Err(CacheError::MergeFailure(_))));
        assert_eq!(guard.len(), 3);

        // Not the tail
        assert!(guard.remove_oldest(&[Arc::clone(&c)]).is_err());

        guard.remove_oldest(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        assert_eq!(guard.len(), 1);
    }

    let left: Vec<u64> = queue.snapshot().iter().map(|t| t.created_at()).collect();
    assert_eq!(left, vec![3]);
}

#[test]
fn test_remove_more_than_held_fails() {
    let queue = LevelQueue::new(Tier::Level1);
    let a = active(1, &[]);
    queue.add_first(Arc::clone(&a));

    let mut guard = queue.write();
    assert!(guard.remove_oldest(&[Arc::clone(&a), Arc::clone(&a)]).is_err());
    assert!(guard.remove_oldest(&[]).is_ok());
    assert_eq!(guard.len(), 1);
}

#[test]
fn test_drain_empties_queue() {
    let queue = LevelQueue::new(Tier::Level0);
    queue.add_first(active(1, &[(b"k", b"v")]));
    queue.add_first(active(2, &[]));
    assert!(queue.memory_usage() > 0);

    assert_eq!(queue.drain().len(), 2);
    assert!(queue.is_empty());
    assert_eq!(queue.memory_usage(), 0);
}

// =============================================================================
// Shard Tests
// =============================================================================

#[test]
fn test_shard_rotate_moves_active_to_level0() {
    let first = ActiveTable::new(3, 1, 64, 4096, Arc::new(NoopCodec), false).unwrap();
    first.put(b"k", b"v", NO_TIMEOUT, now_millis(), false).unwrap();
    let shard = Shard::new(3, first);
    assert_eq!(shard.id(), 3);
    assert_eq!(shard.tier_len(Tier::Active), 1);
    assert_eq!(shard.tier_len(Tier::Level0), 0);

    let fresh = Arc::new(ActiveTable::new(3, 2, 64, 4096, Arc::new(NoopCodec), false).unwrap());
    let frozen = {
        let _rotation = shard.rotation_lock();
        shard.rotate(Arc::clone(&fresh)).unwrap()
    };

    assert!(frozen.is_frozen());
    assert!(Arc::ptr_eq(&shard.active().unwrap(), &fresh));
    assert_eq!(shard.tier_len(Tier::Level0), 1);
    assert!(shard.level0.search(b"k").unwrap().unwrap().is_live());
}

#[test]
fn test_shard_release_drops_everything() {
    let shard = Shard::new(0, ActiveTable::new(0, 1, 64, 4096, Arc::new(NoopCodec), false).unwrap());
    shard.level0.add_first(active(2, &[(b"k", b"v")]));
    assert!(shard.memory_usage(Tier::Level0) > 0);

    shard.release();

    assert!(matches!(shard.active(), Err(CacheError::Closed)));
    for tier in Tier::ALL {
        assert_eq!(shard.tier_len(tier), 0);
        assert_eq!(shard.memory_usage(tier), 0);
    }
}

#[test]
fn test_merge_lock_only_for_merge_tiers() {
    let shard = Shard::new(0, ActiveTable::new(0, 1, 8, 64, Arc::new(NoopCodec), false).unwrap());
    assert!(shard.merge_lock(Tier::Level0).is_ok());
    assert!(shard.merge_lock(Tier::Level1).is_ok());
    assert!(shard.merge_lock(Tier::Level2).is_err());
    assert!(shard.merge_lock(Tier::Active).is_err());
}
