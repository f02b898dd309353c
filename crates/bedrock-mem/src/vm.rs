//! Virtual memory provider.
//!
//! Arenas never talk to the operating system directly; they go through a
//! [`VirtualMemory`] implementation that can reserve an address range, commit
//! pages inside it and release it again. [`SystemMemory`] is the host
//! implementation:
//!
//! - **Unix**: `mmap(PROT_NONE)` reserves, `mprotect(PROT_READ | PROT_WRITE)`
//!   commits, `munmap` releases.
//! - **Elsewhere**: the whole reservation is one zeroed heap block and commit
//!   is a bounds check against it.

use std::ptr::NonNull;

/// Host primitives for page-granular memory management.
///
/// # Safety
///
/// Implementations must hand out ranges that stay valid until released, and
/// a successful [`commit`](VirtualMemory::commit) must leave the committed
/// bytes readable, writable and zero-filled on first touch.
pub unsafe trait VirtualMemory {
    /// Reported page granularity in bytes. Always a power of two.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of address space without backing them.
    ///
    /// `size` is a multiple of [`page_size`](VirtualMemory::page_size).
    fn reserve(&self, size: usize) -> Option<NonNull<u8>>;

    /// Commits `size` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must lie inside a live reservation from this
    /// provider and be page aligned.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool;

    /// Returns a whole reservation to the host.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one live reservation, and no
    /// reference into it may be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// The host virtual memory system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

/// Shared instance used by arenas that are not given a provider.
pub static SYSTEM_MEMORY: SystemMemory = SystemMemory;

#[cfg(unix)]
mod imp {
    use std::ptr::{self, NonNull};
    use std::sync::OnceLock;

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    pub(super) fn page_size() -> usize {
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            // SAFETY: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw)
                .ok()
                .filter(|size| size.is_power_of_two())
                .unwrap_or(4096)
        })
    }

    pub(super) fn reserve(size: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping with no fixed address.
        let ptr = unsafe {
            libc::mmap(ptr::null_mut(), size, libc::PROT_NONE, RESERVE_FLAGS, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> bool {
        // SAFETY: caller guarantees the range lies in a live reservation.
        unsafe {
            libc::mprotect(
                ptr.as_ptr().cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }
    }

    pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) {
        // SAFETY: caller guarantees ptr/size describe one whole reservation.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        if rc != 0 {
            bedrock_log::error!(
                "munmap({:p}, {size}) failed: {}",
                ptr,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::alloc::{self, Layout};
    use std::ptr::NonNull;

    const PAGE_SIZE: usize = 4096;

    pub(super) fn page_size() -> usize {
        PAGE_SIZE
    }

    pub(super) fn reserve(size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // SAFETY: size is non-zero (at least one page).
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    pub(super) unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> bool {
        // The reservation is already backed; the arena's limit check is the
        // only capacity check needed.
        true
    }

    pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
            // SAFETY: ptr was returned by reserve() with this exact layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

// SAFETY: mmap'd pages are zero-filled; mprotect makes them read/write. The
// heap fallback zeroes the whole block up front.
unsafe impl VirtualMemory for SystemMemory {
    fn page_size(&self) -> usize {
        imp::page_size()
    }

    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        imp::reserve(size)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe { imp::commit(ptr, size) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { imp::release(ptr, size) }
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two(), "Alignment must be a power of two");
    Some(value.checked_add(align - 1)? & !(align - 1))
}
