// Shared helpers for the integration tests.

#![allow(dead_code)]

use std::marker::PhantomData;
use std::ptr::NonNull;

use bedrock_mem::{Allocator, Result, Tracker, TrackerConfig};

/// Tracker without stack capture and with a small ledger.
pub fn quiet_tracker() -> Tracker {
    Tracker::with_config(TrackerConfig {
        capture_stacks: false,
        ledger_reserve: 16 * 1024 * 1024,
        initial_capacity: 64,
        ..TrackerConfig::default()
    })
    .unwrap()
}

/// Minimal growable sequence that doubles its byte capacity through
/// `Allocator::reallocate`, the way container code drives an allocator.
pub struct GrowableBuffer<T: Copy, A: Allocator> {
    alloc: A,
    data: Option<NonNull<u8>>,
    len: usize,
    capacity_bytes: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy, A: Allocator> GrowableBuffer<T, A> {
    pub fn new(alloc: A, initial_bytes: usize) -> Self {
        Self {
            alloc,
            data: None,
            len: 0,
            capacity_bytes: initial_bytes,
            _marker: PhantomData,
        }
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let needed = (self.len + 1) * size_of::<T>();
        if self.data.is_none() {
            self.data = Some(self.alloc.allocate(self.capacity_bytes)?);
        }
        if needed > self.capacity_bytes {
            let new_capacity = (self.capacity_bytes * 2).max(needed);
            let grown = unsafe {
                self.alloc
                    .reallocate(self.data, new_capacity, self.capacity_bytes)?
            };
            self.data = Some(grown);
            self.capacity_bytes = new_capacity;
        }
        let base = self.data.unwrap().cast::<T>();
        unsafe { base.add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| unsafe { self.data.unwrap().cast::<T>().add(index).read() })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.data
    }
}
