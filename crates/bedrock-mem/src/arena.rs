//! Region allocator over reserved virtual memory.
//!
//! An [`Arena`] reserves one large address range up front and serves
//! allocations by advancing a bump head through it. Pages are committed
//! lazily, only when the head crosses the committed frontier, so a generous
//! reservation costs nothing until it is used.
//!
//! # Layout
//!
//! ```text
//! base                                                           base + reserved
//! │ header │ allocations ........ │ committed, unused │ reserved, uncommitted │
//! 0        HEADER_SIZE            head                committed               reserved
//! ```
//!
//! Positions are kept as offsets from `base`, so the invariant
//! `HEADER_SIZE <= head <= committed <= reserved` is checked on plain
//! integers. The first page holds a small inline header; its address is the
//! arena's identity in the allocation tracker and is never handed out.
//!
//! # Lifetime
//!
//! Individual allocations are never reclaimed. [`Arena::reset`] rewinds the
//! head (keeping pages committed for cheap reuse) and [`Arena::release`]
//! returns the whole reservation to the host.
//!
//! # Example
//!
//! ```
//! use bedrock_mem::Arena;
//!
//! let arena = Arena::create(1 << 20).unwrap();
//! let a = arena.alloc(24, 8, true).unwrap();
//! let b = arena.alloc(100, 16, false).unwrap();
//! assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 24);
//!
//! let name = arena.alloc_str("region").unwrap();
//! assert_eq!(name, "region");
//! arena.release().unwrap();
//! ```

use std::cell::Cell;
use std::fmt;
use std::ptr::{self, NonNull};

use bedrock_log::{debug, error, trace};

use crate::allocator::{Allocator, AllocatorId, MIN_ALIGNMENT};
use crate::error::{Error, Result};
use crate::tracker::Tracker;
use crate::vm::{SYSTEM_MEMORY, VirtualMemory, align_up};

/// Alignment used by the [`Allocator`] implementation.
pub const DEFAULT_ALIGNMENT: usize = MIN_ALIGNMENT;

/// Reservation used by [`ArenaConfig::default`] (64 MiB).
pub const DEFAULT_RESERVE: usize = 64 * 1024 * 1024;

/// Byte pattern written over used memory by `reset(true)`.
pub const POISON_BYTE: u8 = 0xCD;

/// Bytes at the start of the reservation owned by the inline header.
pub const HEADER_SIZE: usize = 64;

const HEADER_MAGIC: u64 = 0xA4E1_A5ED_BEDF_0C4B;

#[repr(C)]
struct ArenaHeader {
    magic: u64,
    id: u64,
}

/// Arena construction parameters.
#[derive(Clone)]
pub struct ArenaConfig {
    /// Address space to reserve, rounded up to page granularity.
    pub reserve_size: usize,
    /// Name used in diagnostics.
    pub name: &'static str,
    /// Tracker notified of the arena's own lifecycle and commit growth.
    /// `None` creates a no-track arena.
    pub tracker: Option<Tracker>,
    /// Virtual memory provider.
    pub vm: &'static dyn VirtualMemory,
}

impl ArenaConfig {
    /// Untracked configuration reserving `reserve_size` bytes.
    #[must_use]
    pub fn new(reserve_size: usize) -> Self {
        Self {
            reserve_size,
            ..Self::default()
        }
    }

    /// Sets the diagnostic name.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Reports the arena to `tracker`.
    #[must_use]
    pub fn tracker(mut self, tracker: &Tracker) -> Self {
        self.tracker = Some(tracker.clone());
        self
    }

    /// Uses a custom virtual memory provider.
    #[must_use]
    pub fn vm(mut self, vm: &'static dyn VirtualMemory) -> Self {
        self.vm = vm;
        self
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            reserve_size: DEFAULT_RESERVE,
            name: "arena",
            tracker: None,
            vm: &SYSTEM_MEMORY,
        }
    }
}

impl fmt::Debug for ArenaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaConfig")
            .field("reserve_size", &self.reserve_size)
            .field("name", &self.name)
            .field("tracked", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

/// Arena memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Size of the reservation in bytes.
    pub reserved: usize,
    /// Bytes committed so far, header page included.
    pub committed: usize,
    /// Bytes between the start of the allocation area and the head.
    pub used: usize,
    /// Number of commit-growth steps taken after creation.
    pub commit_count: usize,
    /// Number of allocations served since creation (resets included).
    pub alloc_count: usize,
}

/// Bump allocator over a single virtual memory reservation.
///
/// Allocation takes `&self`, so several containers can draw from one arena
/// at the same time; `reset` takes `&mut self`, so nothing borrowed from the
/// arena can survive it. The arena is single threaded (`!Sync`).
pub struct Arena {
    id: AllocatorId,
    name: Cell<&'static str>,
    base: NonNull<u8>,
    head: Cell<usize>,
    committed: Cell<usize>,
    reserved: usize,
    page_size: usize,
    tracker: Option<Tracker>,
    vm: &'static dyn VirtualMemory,
    commit_count: Cell<usize>,
    alloc_count: Cell<usize>,
    released: bool,
}

impl Arena {
    /// Reserves `reserve_size` bytes and commits the first page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReserveFailed`] or [`Error::CommitFailed`] when the
    /// host refuses the memory.
    pub fn create(reserve_size: usize) -> Result<Self> {
        Self::with_config(ArenaConfig::new(reserve_size))
    }

    /// Creates an arena that reports itself to `tracker`.
    ///
    /// # Errors
    ///
    /// See [`Arena::create`].
    pub fn tracked(reserve_size: usize, tracker: &Tracker) -> Result<Self> {
        Self::with_config(ArenaConfig::new(reserve_size).tracker(tracker))
    }

    /// Creates an arena from a full configuration.
    ///
    /// # Errors
    ///
    /// See [`Arena::create`].
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        let ArenaConfig {
            reserve_size,
            name,
            tracker,
            vm,
        } = config;

        let page_size = vm.page_size();
        let reserved = align_up(reserve_size.max(page_size), page_size)
            .ok_or(Error::ReserveFailed { size: reserve_size })?;
        let base = vm
            .reserve(reserved)
            .ok_or(Error::ReserveFailed { size: reserved })?;

        // SAFETY: the first page of a fresh, page-aligned reservation.
        if !unsafe { vm.commit(base, page_size) } {
            // SAFETY: base/reserved describe the reservation made above.
            unsafe { vm.release(base, reserved) };
            return Err(Error::CommitFailed {
                offset: 0,
                size: page_size,
            });
        }

        let id = AllocatorId::next();
        // SAFETY: the header fits in the committed first page (HEADER_SIZE is
        // far below any page size) and base is page aligned.
        unsafe {
            base.cast::<ArenaHeader>().write(ArenaHeader {
                magic: HEADER_MAGIC,
                id: id.as_u64(),
            });
        }

        if let Some(tracker) = &tracker
            && let Err(err) = tracker.on_allocate(id, base.as_ptr() as usize, page_size)
        {
            // SAFETY: nothing has been handed out from the reservation yet.
            unsafe { vm.release(base, reserved) };
            return Err(err);
        }

        let arena = Arena {
            id,
            name: Cell::new(name),
            base,
            head: Cell::new(HEADER_SIZE),
            committed: Cell::new(page_size),
            reserved,
            page_size,
            tracker,
            vm,
            commit_count: Cell::new(0),
            alloc_count: Cell::new(0),
            released: false,
        };

        debug!(
            "{} `{}`: reserved {reserved} bytes at {:p} (page {page_size}, tracked: {})",
            arena.id,
            name,
            base,
            arena.tracker.is_some()
        );
        Ok(arena)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Commits more pages first if the new head passes the committed
    /// frontier. With `zero` set the returned range is zero-filled; memory
    /// reused after a [`reset`](Arena::reset) is otherwise not.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAlignment`] for a non power-of-two `align`,
    /// [`Error::ArenaExhausted`] past the reservation, and
    /// [`Error::CommitFailed`] if the host refuses pages.
    pub fn alloc(&self, size: usize, align: usize, zero: bool) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment: align });
        }

        let base = self.base_addr();
        let start = align_up(base + self.head.get(), align)
            .map(|addr| addr - base)
            .ok_or_else(|| self.exhausted(usize::MAX))?;
        let end = start
            .checked_add(size)
            .ok_or_else(|| self.exhausted(usize::MAX))?;
        self.ensure_committed(end)?;

        self.head.set(end);
        self.alloc_count.set(self.alloc_count.get() + 1);

        // SAFETY: start..end lies inside the committed part of the
        // reservation (checked by ensure_committed).
        let ptr = unsafe { self.base.add(start) };
        if zero {
            // SAFETY: as above.
            unsafe { ptr.as_ptr().write_bytes(0, size) };
        }
        Ok(ptr)
    }

    /// Resizes an allocation.
    ///
    /// - `None` behaves like [`alloc`](Arena::alloc).
    /// - Shrinking keeps the pointer and zeroes the abandoned tail.
    /// - The most recent allocation grows in place if it already satisfies
    ///   `align`.
    /// - Anything else is copied into a fresh allocation; the old bytes stay
    ///   behind as dead arena space.
    ///
    /// # Errors
    ///
    /// [`Error::ForeignPointer`] if `ptr`/`old_size` do not describe memory
    /// below the head, plus the errors of [`alloc`](Arena::alloc).
    pub fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
        align: usize,
        zero: bool,
    ) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment: align });
        }
        let Some(ptr) = ptr else {
            return self.alloc(new_size, align, zero);
        };

        let foreign = || Error::ForeignPointer {
            address: ptr.as_ptr() as usize,
        };
        let offset = self.offset_of(ptr).ok_or_else(foreign)?;
        let old_end = offset
            .checked_add(old_size)
            .filter(|&end| end <= self.head.get())
            .ok_or_else(foreign)?;

        if new_size <= old_size {
            // SAFETY: offset + new_size..old_end is below the head.
            unsafe {
                ptr.as_ptr()
                    .add(new_size)
                    .write_bytes(0, old_size - new_size);
            }
            return Ok(ptr);
        }

        let aligned = (ptr.as_ptr() as usize & (align - 1)) == 0;
        if aligned && old_end == self.head.get() {
            let new_end = offset
                .checked_add(new_size)
                .ok_or_else(|| self.exhausted(usize::MAX))?;
            self.ensure_committed(new_end)?;
            self.head.set(new_end);
            if zero {
                // SAFETY: old_end..new_end was just committed and claimed.
                unsafe {
                    ptr.as_ptr()
                        .add(old_size)
                        .write_bytes(0, new_size - old_size);
                }
            }
            return Ok(ptr);
        }

        let moved = self.alloc(new_size, align, false)?;
        // SAFETY: both ranges are live arena memory and cannot overlap, since
        // `moved` was carved out above the old head.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size);
            if zero {
                moved
                    .as_ptr()
                    .add(old_size)
                    .write_bytes(0, new_size - old_size);
            }
        }
        Ok(moved)
    }

    /// Rewinds the head to the start of the allocation area.
    ///
    /// With `stamp` set the previously used range is overwritten with
    /// [`POISON_BYTE`] so that stale pointers read obvious garbage. Committed
    /// pages are kept.
    pub fn reset(&mut self, stamp: bool) {
        let used = self.used();
        if stamp {
            // SAFETY: HEADER_SIZE..head is committed arena memory and the
            // exclusive borrow rules out outstanding references into it.
            unsafe {
                self.base
                    .as_ptr()
                    .add(HEADER_SIZE)
                    .write_bytes(POISON_BYTE, used);
            }
        }
        self.head.set(HEADER_SIZE);
        trace!("{} `{}`: reset after {used} bytes", self.id, self.name());
    }

    /// Returns the reservation to the host.
    ///
    /// A tracked arena first reports its header address as freed.
    ///
    /// # Errors
    ///
    /// Propagates a tracker violation (for instance an arena header that the
    /// tracker never saw); the memory is released regardless.
    pub fn release(mut self) -> Result<()> {
        self.release_region()
    }

    fn release_region(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let notified = match &self.tracker {
            Some(tracker) => tracker.on_free(self.id, self.base_addr()),
            None => Ok(()),
        };

        // SAFETY: base/reserved describe this arena's reservation, which is
        // released exactly once.
        unsafe { self.vm.release(self.base, self.reserved) };
        debug!(
            "{} `{}`: released {} bytes ({} committed)",
            self.id,
            self.name(),
            self.reserved,
            self.committed.get()
        );
        notified
    }

    /// Moves `value` into the arena.
    ///
    /// The value's destructor never runs.
    ///
    /// # Errors
    ///
    /// See [`alloc`](Arena::alloc).
    pub fn alloc_value<T>(&self, value: T) -> Result<NonNull<T>> {
        let ptr = self
            .alloc(size_of::<T>(), align_of::<T>(), false)?
            .cast::<T>();
        // SAFETY: ptr is fresh, aligned for T and large enough.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    /// Copies a string into the arena.
    ///
    /// # Errors
    ///
    /// See [`alloc`](Arena::alloc).
    pub fn alloc_str(&self, s: &str) -> Result<&str> {
        let ptr = self.alloc(s.len(), 1, false)?;
        // SAFETY: ptr is valid for s.len() bytes, freshly allocated, and the
        // bytes copied are valid UTF-8. The returned borrow of `self` keeps
        // reset/release from invalidating them.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), s.len());
            Ok(std::str::from_utf8_unchecked(bytes))
        }
    }

    /// Offset of `ptr` from the base, if it lies in the allocation area
    /// (the head itself included, for zero-sized allocations).
    #[must_use]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base_addr())?;
        (HEADER_SIZE..=self.head.get())
            .contains(&offset)
            .then_some(offset)
    }

    /// Returns true if `ptr` points into memory handed out by this arena.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Base address of the reservation.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Bytes between the start of the allocation area and the head.
    #[must_use]
    pub fn used(&self) -> usize {
        self.head.get() - HEADER_SIZE
    }

    /// Current head offset from the base.
    #[must_use]
    pub fn head(&self) -> usize {
        self.head.get()
    }

    /// Committed bytes, header page included.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.get()
    }

    /// Size of the reservation.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Page granularity used for commits.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns true unless the arena was created no-track.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.tracker.is_some()
    }

    /// Returns usage statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved: self.reserved,
            committed: self.committed.get(),
            used: self.used(),
            commit_count: self.commit_count.get(),
            alloc_count: self.alloc_count.get(),
        }
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    fn exhausted(&self, requested: usize) -> Error {
        Error::ArenaExhausted {
            requested,
            reserved: self.reserved,
        }
    }

    /// Makes sure `[0, end)` is committed, growing the frontier if needed.
    #[inline]
    fn ensure_committed(&self, end: usize) -> Result<()> {
        if end > self.reserved {
            return Err(self.exhausted(end));
        }
        if end > self.committed.get() {
            self.grow(end)?;
        }
        Ok(())
    }

    #[cold]
    fn grow(&self, end: usize) -> Result<()> {
        let old = self.committed.get();
        // reserved is a page multiple, so rounding never passes it.
        let new = align_up(end, self.page_size)
            .ok_or_else(|| self.exhausted(end))?
            .min(self.reserved);
        let size = new - old;

        // SAFETY: old..new is page aligned and inside the reservation.
        let ok = unsafe { self.vm.commit(self.base.add(old), size) };
        if !ok {
            error!(
                "{} `{}`: commit of {size} bytes at offset {old:#x} failed",
                self.id,
                self.name()
            );
            return Err(Error::CommitFailed { offset: old, size });
        }

        self.committed.set(new);
        self.commit_count.set(self.commit_count.get() + 1);
        trace!(
            "{} `{}`: committed {size} bytes, frontier {new:#x}/{:#x}",
            self.id,
            self.name(),
            self.reserved
        );

        if let Some(tracker) = &self.tracker {
            let base = self.base_addr();
            tracker.on_reallocate(self.id, base, base, new, old)?;
        }
        Ok(())
    }
}

impl Allocator for Arena {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.alloc(size, DEFAULT_ALIGNMENT, false)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.alloc(size, align, false)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
    ) -> Result<NonNull<u8>> {
        self.realloc(ptr, new_size, old_size, DEFAULT_ALIGNMENT, false)
    }

    unsafe fn free(&self, _ptr: Option<NonNull<u8>>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name.get()
    }

    fn set_name(&self, name: &'static str) {
        self.name.set(name);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(err) = self.release_region() {
            error!("{} `{}`: release failed: {err}", self.id, self.name());
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("name", &self.name.get())
            .field("base", &self.base)
            .field("head", &self.head.get())
            .field("committed", &self.committed.get())
            .field("reserved", &self.reserved)
            .field("tracked", &self.tracker.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_create_commits_one_page() {
        let arena = Arena::create(MIB).unwrap();
        assert_eq!(arena.committed(), arena.page_size());
        assert_eq!(arena.reserved(), MIB);
        assert_eq!(arena.used(), 0);
        assert!(!arena.is_tracked());
    }

    #[test]
    fn test_reserve_rounds_to_pages() {
        let arena = Arena::create(1).unwrap();
        assert_eq!(arena.reserved(), arena.page_size());

        let page = arena.page_size();
        let arena = Arena::create(page + 1).unwrap();
        assert_eq!(arena.reserved(), page * 2);
    }

    #[test]
    fn test_header_is_never_handed_out() {
        let arena = Arena::create(MIB).unwrap();
        let first = arena.alloc(0, 1, false).unwrap();
        assert_eq!(addr(first), addr(arena.base()) + HEADER_SIZE);
    }

    #[test]
    fn test_alloc_alignment() {
        let arena = Arena::create(MIB).unwrap();
        for align in [1, 2, 4, 8, 16, 64, 256, 4096] {
            arena.alloc(3, 1, false).unwrap();
            let ptr = arena.alloc(10, align, false).unwrap();
            assert_eq!(addr(ptr) % align, 0, "alignment {align}");
        }
    }

    #[test]
    fn test_invalid_alignment() {
        let arena = Arena::create(MIB).unwrap();
        assert_eq!(
            arena.alloc(8, 3, false),
            Err(Error::InvalidAlignment { alignment: 3 })
        );
        assert_eq!(
            arena.alloc(8, 0, false),
            Err(Error::InvalidAlignment { alignment: 0 })
        );
    }

    #[test]
    fn test_growth_commits_pages() {
        let arena = Arena::create(MIB).unwrap();
        let page = arena.page_size();

        arena.alloc(page * 3, 8, true).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.commit_count, 1);
        assert_eq!(stats.committed, page * 4);
        assert!(stats.committed >= arena.head());
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let arena = Arena::create(MIB).unwrap();
        let err = arena.alloc(MIB, 8, false).unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { reserved, .. } if reserved == MIB));

        // The failed request left the arena untouched.
        assert_eq!(arena.used(), 0);
        assert!(arena.alloc(1024, 8, false).is_ok());
    }

    #[test]
    fn test_zero_init_after_reset() {
        let mut arena = Arena::create(MIB).unwrap();
        let ptr = arena.alloc(64, 8, false).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xFF, 64) };

        arena.reset(false);
        let again = arena.alloc(64, 8, true).unwrap();
        assert_eq!(addr(ptr), addr(again));
        let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reset_stamps_poison() {
        let mut arena = Arena::create(MIB).unwrap();
        let ptr = arena.alloc(32, 8, true).unwrap();

        arena.reset(true);
        let stale = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(stale.iter().all(|&b| b == POISON_BYTE));
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_realloc_shrink_zeroes_tail() {
        let arena = Arena::create(MIB).unwrap();
        let ptr = arena.alloc(16, 8, false).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAA, 16) };
        arena.alloc(8, 8, false).unwrap();

        let shrunk = arena.realloc(Some(ptr), 4, 16, 8, false).unwrap();
        assert_eq!(shrunk, ptr);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 16) };
        assert!(bytes[..4].iter().all(|&b| b == 0xAA));
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_realloc_extends_last_allocation_in_place() {
        let arena = Arena::create(MIB).unwrap();
        let ptr = arena.alloc(8, 8, false).unwrap();
        let head = arena.head();

        let grown = arena.realloc(Some(ptr), 64, 8, 8, true).unwrap();
        assert_eq!(grown, ptr);
        assert_eq!(arena.head(), head + 56);
    }

    #[test]
    fn test_realloc_honours_stricter_alignment() {
        let arena = Arena::create(MIB).unwrap();
        arena.alloc(1, 1, false).unwrap();
        let ptr = arena.alloc(8, 8, false).unwrap();
        assert_ne!(addr(ptr) % 64, 0);

        let grown = arena.realloc(Some(ptr), 32, 8, 64, false).unwrap();
        assert_ne!(grown, ptr);
        assert_eq!(addr(grown) % 64, 0);

        assert_eq!(
            arena.realloc(Some(grown), 64, 32, 3, false),
            Err(Error::InvalidAlignment { alignment: 3 })
        );
    }

    #[test]
    fn test_realloc_moves_inner_allocation() {
        let arena = Arena::create(MIB).unwrap();
        let ptr = arena.alloc(8, 8, false).unwrap();
        unsafe { ptr.cast::<u64>().write(0x0123_4567_89AB_CDEF) };
        let blocker = arena.alloc(8, 8, false).unwrap();

        let moved = arena.realloc(Some(ptr), 32, 8, 8, true).unwrap();
        assert_ne!(moved, ptr);
        assert!(addr(moved) > addr(blocker));
        unsafe {
            assert_eq!(moved.cast::<u64>().read(), 0x0123_4567_89AB_CDEF);
            let tail = std::slice::from_raw_parts(moved.as_ptr().add(8), 24);
            assert!(tail.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_realloc_absent_pointer_allocates() {
        let arena = Arena::create(MIB).unwrap();
        let ptr = arena.realloc(None, 24, 0, 8, true).unwrap();
        assert!(arena.contains(ptr));
        assert_eq!(arena.used(), 24);
    }

    #[test]
    fn test_realloc_rejects_foreign_pointer() {
        let arena = Arena::create(MIB).unwrap();
        let other = Arena::create(MIB).unwrap();
        let ptr = other.alloc(8, 8, false).unwrap();

        let err = arena.realloc(Some(ptr), 16, 8, 8, false).unwrap_err();
        assert_eq!(err, Error::ForeignPointer { address: addr(ptr) });

        let own = arena.alloc(8, 8, false).unwrap();
        assert!(arena.realloc(Some(own), 16, 4096, 8, false).is_err());
    }

    #[test]
    fn test_alloc_value_and_str() {
        let arena = Arena::create(MIB).unwrap();
        let value = arena.alloc_value([7u64; 4]).unwrap();
        assert_eq!(addr(value.cast()) % align_of::<u64>(), 0);
        assert_eq!(unsafe { value.read() }, [7; 4]);

        assert_eq!(arena.alloc_str("").unwrap(), "");
        assert_eq!(arena.alloc_str("héllo").unwrap(), "héllo");
    }

    #[test]
    fn test_allocator_capability() {
        let arena = Arena::create(MIB).unwrap();
        arena.set_name("scratch");
        assert_eq!(Allocator::name(&arena), "scratch");

        let ptr = arena.allocate(10).unwrap();
        assert_eq!(addr(ptr) % DEFAULT_ALIGNMENT, 0);
        unsafe {
            let ptr = arena.reallocate(Some(ptr), 100, 10).unwrap();
            arena.free(Some(ptr)).unwrap();
            arena.free(None).unwrap();
        }
        assert_eq!(arena.stats().alloc_count, 1);
    }

    #[test]
    fn test_release_is_terminal() {
        let arena = Arena::create(MIB).unwrap();
        arena.alloc(128, 8, false).unwrap();
        assert!(arena.release().is_ok());
    }
}
