// Allocation Tracking Integration Tests
//
// These tests verify that tracked allocators and tracked arenas report to
// the ledger, that protocol violations are caught before the wrapped
// allocator is touched, and that leaks are counted at shutdown.

mod common;

use bedrock_mem::{Allocator, Arena, ArenaConfig, Error, HeapAllocator, TrackedAllocator};
use common::{GrowableBuffer, quiet_tracker};

/// One 64-byte allocation that is never freed is one leak
#[test]
fn test_single_leak() {
    let tracker = quiet_tracker();
    let heap = TrackedAllocator::new(HeapAllocator::default(), &tracker);

    let block = heap.allocate(64).unwrap();
    let leaks = tracker.leaks();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].size, 64);
    assert_eq!(leaks[0].address, block.as_ptr() as usize);
    assert_eq!(tracker.report_leaks(), 1);

    unsafe { heap.free(Some(block)).unwrap() };
    assert_eq!(tracker.report_leaks(), 0);
}

/// Intentional long-lived allocations are excluded from the report
#[test]
fn test_not_a_leak() {
    let tracker = quiet_tracker();
    let heap = TrackedAllocator::new(HeapAllocator::default(), &tracker);

    let global = heap.allocate(128).unwrap();
    assert!(tracker.mark_not_a_leak(global.as_ptr() as usize));
    assert_eq!(tracker.live_count(), 1);
    assert_eq!(tracker.clone().shutdown(), 0);

    unsafe { heap.free(Some(global)).unwrap() };
}

/// A tracked arena records its header and follows commit growth
#[test]
fn test_tracked_arena_lifecycle() {
    let tracker = quiet_tracker();
    let arena = Arena::tracked(1 << 20, &tracker).unwrap();
    assert!(arena.is_tracked());

    let base = arena.base().as_ptr() as usize;
    let record = tracker.record(base).unwrap();
    assert!(record.live);
    assert_eq!(record.size, arena.page_size());
    assert_eq!(record.allocator, arena.id());

    arena.alloc(arena.page_size() * 4, 16, false).unwrap();
    assert_eq!(tracker.record(base).unwrap().size, arena.committed());
    assert_eq!(tracker.live_count(), 1);

    arena.release().unwrap();
    assert!(!tracker.record(base).unwrap().live);
    assert_eq!(tracker.shutdown(), 0);
}

/// An arena dropped without release still reports its free
#[test]
fn test_dropped_arena_is_not_leaked() {
    let tracker = quiet_tracker();
    {
        let arena = Arena::with_config(ArenaConfig::new(1 << 16).tracker(&tracker)).unwrap();
        arena.alloc(100, 8, true).unwrap();
    }
    assert_eq!(tracker.live_count(), 0);
    assert_eq!(tracker.report_leaks(), 0);
}

/// An unreleased tracked arena is itself a leak
#[test]
fn test_forgotten_arena_leaks() {
    let tracker = quiet_tracker();
    let arena = Arena::tracked(1 << 16, &tracker).unwrap();
    assert_eq!(tracker.report_leaks(), 1);
    drop(arena);
    assert_eq!(tracker.report_leaks(), 0);
}

/// Double free is reported with the recorded size
#[test]
fn test_double_free() {
    let tracker = quiet_tracker();
    let heap = TrackedAllocator::new(HeapAllocator::default(), &tracker);
    let block = heap.allocate(48).unwrap();

    unsafe {
        heap.free(Some(block)).unwrap();
        let err = heap.free(Some(block)).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(err, Error::DoubleFree { size: 48, .. }));
    }
}

/// Freeing memory the tracker never saw is an unknown free
#[test]
fn test_unknown_free() {
    let tracker = quiet_tracker();
    let raw = HeapAllocator::default();
    let tracked = TrackedAllocator::new(&raw, &tracker);

    let block = raw.allocate(16).unwrap();
    let err = unsafe { tracked.free(Some(block)) }.unwrap_err();
    assert_eq!(
        err,
        Error::UnknownFree {
            address: block.as_ptr() as usize
        }
    );
    // The wrapped allocator was never asked to free it.
    unsafe { raw.free(Some(block)).unwrap() };
}

/// Memory from one allocator released through another is a mismatch
#[test]
fn test_allocator_mismatch() {
    let tracker = quiet_tracker();
    let first = TrackedAllocator::new(HeapAllocator::new("first"), &tracker);
    let second = TrackedAllocator::new(HeapAllocator::new("second"), &tracker);

    let block = first.allocate(32).unwrap();
    let err = unsafe { second.free(Some(block)) }.unwrap_err();
    assert_eq!(
        err,
        Error::AllocatorMismatch {
            address: block.as_ptr() as usize,
            owner: first.id(),
            caller: second.id(),
        }
    );
    unsafe { first.free(Some(block)).unwrap() };
    assert_eq!(tracker.shutdown(), 0);
}

/// Growable containers over a tracked arena keep one live record each
#[test]
fn test_tracked_arena_allocator() {
    let tracker = quiet_tracker();
    let arena = Arena::create(1 << 20).unwrap();
    let tracked = TrackedAllocator::new(&arena, &tracker);

    let mut values = GrowableBuffer::<u16, _>::new(&tracked, 4);
    for i in 0..1000u16 {
        values.push(i).unwrap();
    }

    let address = values.as_ptr().unwrap().as_ptr() as usize;
    let record = tracker.record(address).unwrap();
    assert!(record.live);
    assert_eq!(record.size, values.capacity_bytes());
    assert_eq!(tracker.live_count(), 1);
}

/// Independent trackers keep independent ledgers
#[test]
fn test_independent_contexts() {
    let a = quiet_tracker();
    let b = quiet_tracker();
    let heap = TrackedAllocator::new(HeapAllocator::default(), &a);

    let block = heap.allocate(8).unwrap();
    assert_eq!(a.live_count(), 1);
    assert_eq!(b.live_count(), 0);
    assert!(b.record(block.as_ptr() as usize).is_none());
    unsafe { heap.free(Some(block)).unwrap() };
}

/// Stack capture records the allocation site when enabled
#[cfg(feature = "stack-capture")]
#[test]
fn test_allocation_site_is_captured() {
    use bedrock_mem::{Tracker, TrackerConfig};

    let tracker = Tracker::with_config(TrackerConfig {
        ledger_reserve: 16 * 1024 * 1024,
        ..TrackerConfig::default()
    })
    .unwrap();
    let heap = TrackedAllocator::new(HeapAllocator::default(), &tracker);

    let block = heap.allocate(24).unwrap();
    let record = tracker.record(block.as_ptr() as usize).unwrap();
    assert!(!record.allocated_at.is_empty());
    assert!(record.freed_at.is_empty());

    unsafe { heap.free(Some(block)).unwrap() };
    let record = tracker.record(block.as_ptr() as usize).unwrap();
    assert!(!record.freed_at.is_empty());
}
