// Arena Growth Integration Tests
//
// These tests drive arenas the way container code does: through the
// allocator capability, growing the most recent allocation in place and
// committing pages as the head moves.

mod common;

use bedrock_mem::arena::{HEADER_SIZE, POISON_BYTE};
use bedrock_mem::{Allocator, Arena, ArenaConfig, Error, FailFast, HashTable};
use common::GrowableBuffer;

/// 3000 four-byte pushes from an 8-byte buffer grow in place to 16 KiB
#[test]
fn test_push_back_growth() {
    let arena = Arena::create(1 << 20).unwrap();
    let mut values = GrowableBuffer::<u32, _>::new(&arena, 8);

    for i in 0..3000u32 {
        values.push(i.wrapping_mul(2_654_435_761)).unwrap();
    }

    let stats = arena.stats();
    assert!(stats.commit_count >= 1, "growth must commit pages");
    assert_eq!(values.capacity_bytes(), 16384);
    assert_eq!(arena.head(), HEADER_SIZE + 16384);
    assert_eq!(stats.used, 16384);
    assert!(stats.committed >= arena.head());

    // Every doubling extended the only allocation in place.
    assert_eq!(
        values.as_ptr().map(|p| p.as_ptr() as usize),
        Some(arena.base().as_ptr() as usize + HEADER_SIZE)
    );
    for i in 0..3000u32 {
        assert_eq!(values.get(i as usize), Some(i.wrapping_mul(2_654_435_761)));
    }
}

/// Two interleaved buffers force copying reallocation
#[test]
fn test_interleaved_buffers_copy() {
    let arena = Arena::create(1 << 20).unwrap();
    let mut evens = GrowableBuffer::<u64, _>::new(&arena, 16);
    let mut odds = GrowableBuffer::<u64, _>::new(&arena, 16);

    for i in 0..500u64 {
        evens.push(i * 2).unwrap();
        odds.push(i * 2 + 1).unwrap();
    }

    for i in 0..500 {
        assert_eq!(evens.get(i), Some(i as u64 * 2));
        assert_eq!(odds.get(i), Some(i as u64 * 2 + 1));
    }
    // Abandoned copies stay behind as dead space.
    assert!(arena.used() > 2 * 500 * 8);
}

/// Allocation past the reservation fails without moving the head
#[test]
fn test_growth_stops_at_reservation() {
    let arena = Arena::create(64 * 1024).unwrap();
    let reserved = arena.reserved();

    let mut total = 0;
    let err = loop {
        match arena.alloc(1000, 8, false) {
            Ok(_) => total += 1000,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::ArenaExhausted { reserved: r, .. } if r == reserved));
    assert_eq!(arena.committed(), reserved);
    assert!(arena.used() >= total);
    assert!(arena.head() <= reserved);
}

/// Reset then the same allocation sequence lands on the same offsets
#[test]
fn test_reset_replays_offsets() {
    let mut arena = Arena::create(1 << 20).unwrap();
    let sizes = [(3, 1), (17, 8), (100, 16), (5, 64), (4096, 4096)];

    let first: Vec<_> = sizes
        .iter()
        .map(|&(size, align)| arena.offset_of(arena.alloc(size, align, false).unwrap()))
        .collect();

    arena.reset(true);
    let second: Vec<_> = sizes
        .iter()
        .map(|&(size, align)| arena.offset_of(arena.alloc(size, align, false).unwrap()))
        .collect();

    assert_eq!(first, second);
    assert!(first.iter().all(Option::is_some));
}

/// Poisoned bytes are visible until zero-initialized allocation clears them
#[test]
fn test_poison_then_zero() {
    let mut arena = Arena::create(1 << 20).unwrap();
    let ptr = arena.alloc(256, 16, true).unwrap();
    arena.reset(true);

    let stale = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
    assert!(stale.iter().all(|&b| b == POISON_BYTE));

    let fresh = arena.alloc(256, 16, true).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(fresh.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));
}

/// Tables and typed values share one arena
#[test]
fn test_arena_shared_by_containers() {
    let arena = Arena::with_config(ArenaConfig::new(1 << 20).name("shared")).or_abort();
    assert_eq!(arena.name(), "shared");

    let mut names = HashTable::new(&arena);
    let mut sizes = HashTable::new(&arena);
    for i in 0..100u32 {
        let label = arena.alloc_str(&format!("item-{i}")).unwrap();
        names.add(i, label).unwrap();
        sizes.add(label, i * 10).unwrap();
    }

    assert_eq!(names.get(&42), Some(&"item-42"));
    assert_eq!(sizes.get(&"item-42"), Some(&420));
    assert!(arena.stats().alloc_count > 100);
}
