//! The allocator capability.
//!
//! Containers in this crate (and the growable sequences and string builders
//! built on top of it) only ever see an [`Allocator`]: something that can
//! hand out, resize and take back raw byte blocks. Two concrete allocators
//! exist:
//!
//! - [`Arena`](crate::arena::Arena): bump allocation over reserved virtual
//!   memory, where `free` is a no-op.
//! - [`HeapAllocator`]: size-prefixed blocks from the global heap.
//!
//! Either can be wrapped in a
//! [`TrackedAllocator`](crate::tracker::TrackedAllocator) to have every call
//! recorded by an allocation tracker.
//!
//! All data-moving operations accept an absent pointer and a zero size, so
//! callers never special-case empty buffers.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Alignment guaranteed by [`Allocator::allocate`].
pub const MIN_ALIGNMENT: usize = 16;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque allocator identity.
///
/// Used by the tracker to notice memory released through the wrong
/// allocator. Identities are unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocatorId(u64);

impl AllocatorId {
    /// Returns a fresh, never before issued identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identity value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator#{}", self.0)
    }
}

/// Raw byte allocation capability.
pub trait Allocator {
    /// Identity of this allocator.
    fn id(&self) -> AllocatorId;

    /// Allocates `size` bytes aligned to at least [`MIN_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Fails when the underlying memory source is exhausted.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// The default implementation only supports alignments up to
    /// [`MIN_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Fails on unsupported alignment or exhaustion.
    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() || align > MIN_ALIGNMENT {
            return Err(Error::InvalidAlignment { alignment: align });
        }
        self.allocate(size)
    }

    /// Resizes a block, possibly moving it.
    ///
    /// A `None` pointer behaves like [`allocate`](Allocator::allocate).
    ///
    /// # Errors
    ///
    /// Fails on exhaustion or, for tracked allocators, protocol violations.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a live block from this allocator whose current
    /// size is `old_size`.
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
    ) -> Result<NonNull<u8>>;

    /// Releases a block. `None` is accepted and ignored.
    ///
    /// # Errors
    ///
    /// Tracked allocators report unknown frees, double frees and allocator
    /// mismatches.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a block from this allocator that is not used
    /// afterwards.
    unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()>;

    /// Human readable name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Renames the allocator.
    fn set_name(&self, name: &'static str);
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn id(&self) -> AllocatorId {
        (**self).id()
    }

    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).allocate(size)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        (**self).allocate_aligned(size, align)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
    ) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).reallocate(ptr, new_size, old_size) }
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(ptr) }
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn set_name(&self, name: &'static str) {
        (**self).set_name(name);
    }
}

impl<A: Allocator + ?Sized> Allocator for Rc<A> {
    fn id(&self) -> AllocatorId {
        (**self).id()
    }

    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).allocate(size)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        (**self).allocate_aligned(size, align)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
    ) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).reallocate(ptr, new_size, old_size) }
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(ptr) }
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn set_name(&self, name: &'static str) {
        (**self).set_name(name);
    }
}

/// Bytes reserved in front of every heap block to remember its size.
const HEADER_SIZE: usize = MIN_ALIGNMENT;

/// Allocator over the global heap.
///
/// Each block carries a small size header so that `free` needs only the
/// pointer, matching the allocator capability's signature.
///
/// ```
/// use bedrock_mem::{Allocator, HeapAllocator};
///
/// let heap = HeapAllocator::new("scratch");
/// let block = heap.allocate(64).unwrap();
/// unsafe {
///     block.as_ptr().write_bytes(0x5A, 64);
///     let block = heap.reallocate(Some(block), 128, 64).unwrap();
///     assert_eq!(*block.as_ptr().add(63), 0x5A);
///     heap.free(Some(block)).unwrap();
/// }
/// ```
#[derive(Debug)]
pub struct HeapAllocator {
    id: AllocatorId,
    name: Cell<&'static str>,
}

impl HeapAllocator {
    /// Creates a heap allocator with a fresh identity.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: AllocatorId::next(),
            name: Cell::new(name),
        }
    }

    fn layout(size: usize) -> Result<Layout> {
        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(Error::HeapAllocationFailed { size })?;
        Layout::from_size_align(total, MIN_ALIGNMENT)
            .map_err(|_| Error::HeapAllocationFailed { size })
    }

    /// Writes the size header and returns the user pointer.
    ///
    /// # Safety
    ///
    /// `block` must be a fresh heap block of at least `HEADER_SIZE` bytes.
    unsafe fn finish(block: *mut u8, size: usize) -> Result<NonNull<u8>> {
        let block = NonNull::new(block).ok_or(Error::HeapAllocationFailed { size })?;
        // SAFETY: the block is 16-aligned and at least HEADER_SIZE bytes long.
        unsafe {
            block.cast::<usize>().write(size);
            Ok(block.add(HEADER_SIZE))
        }
    }

    /// Recovers the block start and recorded size from a user pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator.
    unsafe fn header(ptr: NonNull<u8>) -> (NonNull<u8>, usize) {
        // SAFETY: every user pointer sits HEADER_SIZE bytes into its block.
        unsafe {
            let block = ptr.sub(HEADER_SIZE);
            (block, block.cast::<usize>().read())
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new("heap")
    }
}

impl Allocator for HeapAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size (the header).
        unsafe { Self::finish(alloc::alloc(layout), size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        _old_size: usize,
    ) -> Result<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size);
        };
        let new_layout = Self::layout(new_size)?;
        // SAFETY: caller guarantees ptr is one of ours; the old layout is
        // rebuilt from the recorded size.
        unsafe {
            let (block, size) = Self::header(ptr);
            let old_layout = Self::layout(size)?;
            let grown = alloc::realloc(block.as_ptr(), old_layout, new_layout.size());
            Self::finish(grown, new_size)
        }
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        // SAFETY: caller guarantees ptr is one of ours.
        unsafe {
            let (block, size) = Self::header(ptr);
            alloc::dealloc(block.as_ptr(), Self::layout(size)?);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name.get()
    }

    fn set_name(&self, name: &'static str) {
        self.name.set(name);
    }
}
