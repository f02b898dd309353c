//! Allocation tracking.
//!
//! A [`Tracker`] keeps a shadow ledger of every allocation, reallocation and
//! free made through a tracked allocator. It detects
//!
//! - frees of addresses it never saw ([`Error::UnknownFree`]),
//! - frees of addresses already freed ([`Error::DoubleFree`]),
//! - memory released through the wrong allocator ([`Error::AllocatorMismatch`]),
//!
//! and reports allocations still live at shutdown as leaks.
//!
//! # Bookkeeping
//!
//! The ledger is a [`HashTable`] keyed by address and backed by its own
//! untracked [`Arena`]. Nothing on the ledger's allocation path can reach a
//! tracker, so recording an allocation never records another one.
//!
//! A tracker is an explicit context: create one, hand clones of it to the
//! allocators and arenas that should report to it, and call
//! [`Tracker::shutdown`] at the end. Clones share one ledger. Trackers are
//! single threaded and cannot be sent across threads.
//!
//! ```
//! use bedrock_mem::{Allocator, HeapAllocator, TrackedAllocator, Tracker};
//!
//! let tracker = Tracker::new().unwrap();
//! let heap = TrackedAllocator::new(HeapAllocator::default(), &tracker);
//!
//! let block = heap.allocate(64).unwrap();
//! assert_eq!(tracker.live_count(), 1);
//!
//! unsafe { heap.free(Some(block)).unwrap() };
//! assert!(unsafe { heap.free(Some(block)) }.is_err());
//! assert_eq!(tracker.shutdown(), 0);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use bedrock_log::{debug, error, trace, warn};

use crate::allocator::{Allocator, AllocatorId};
use crate::arena::{Arena, ArenaConfig};
use crate::error::{Error, Result};
use crate::stack::{MAX_FRAMES, StackTrace};
use crate::table::HashTable;

/// Environment variable that disables stack capture when set to `0`.
pub const STACKS_ENV: &str = "BEDROCK_TRACK_STACKS";

/// Tracker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Capture call stacks for allocation and free sites.
    pub capture_stacks: bool,
    /// Frames kept per stack (at most [`MAX_FRAMES`]).
    pub max_frames: usize,
    /// Innermost frames dropped from every stack, hiding the tracker itself.
    pub skip_frames: usize,
    /// Address space reserved for the ledger arena.
    pub ledger_reserve: usize,
    /// Initial ledger slot count.
    pub initial_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_stacks: cfg!(feature = "stack-capture"),
            max_frames: MAX_FRAMES,
            skip_frames: 2,
            ledger_reserve: 256 * 1024 * 1024,
            initial_capacity: 1024,
        }
    }
}

impl TrackerConfig {
    /// Default configuration, with stack capture turned off if
    /// `BEDROCK_TRACK_STACKS=0`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(STACKS_ENV)
            && value.trim() == "0"
        {
            config.capture_stacks = false;
        }
        config
    }
}

/// Ledger entry for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    /// The tracked address.
    pub address: usize,
    /// Allocator that owns the address.
    pub allocator: AllocatorId,
    /// Current size in bytes.
    pub size: usize,
    /// False once the address has been freed.
    pub live: bool,
    /// Excluded from leak reports.
    pub not_a_leak: bool,
    /// Where the allocation was made.
    pub allocated_at: StackTrace,
    /// Where the allocation was last freed (empty while never freed).
    pub freed_at: StackTrace,
}

impl AllocationRecord {
    fn new(allocator: AllocatorId, address: usize, size: usize, allocated_at: StackTrace) -> Self {
        Self {
            address,
            allocator,
            size,
            live: true,
            not_a_leak: false,
            allocated_at,
            freed_at: StackTrace::EMPTY,
        }
    }
}

/// A live allocation found at leak-check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    /// Leaked address.
    pub address: usize,
    /// Size of the leaked allocation.
    pub size: usize,
    /// Owning allocator.
    pub allocator: AllocatorId,
    /// Allocation site.
    pub allocated_at: StackTrace,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "leaked {} bytes at {:#x} ({})\n{}",
            self.size,
            self.address,
            self.allocator,
            self.allocated_at.render()
        )
    }
}

struct Ledger {
    records: HashTable<usize, AllocationRecord, Rc<Arena>>,
    config: TrackerConfig,
}

impl Ledger {
    fn allocate(
        &mut self,
        allocator: AllocatorId,
        address: usize,
        size: usize,
        site: StackTrace,
    ) -> Result<()> {
        match self.records.get_mut(&address) {
            Some(record) if record.live => {
                warn!(
                    "{address:#x} allocated by {allocator} while still live ({} bytes from {}); replacing record",
                    record.size, record.allocator
                );
                *record = AllocationRecord::new(allocator, address, size, site);
            }
            Some(record) => {
                record.allocator = allocator;
                record.size = size;
                record.live = true;
                record.not_a_leak = false;
                record.allocated_at = site;
            }
            None => {
                self.records
                    .add(address, AllocationRecord::new(allocator, address, size, site))?;
            }
        }
        Ok(())
    }

    /// Looks up a record that `caller` is about to release or resize.
    fn owned_record(&self, caller: AllocatorId, address: usize) -> Result<Option<AllocationRecord>> {
        let Some(record) = self.records.get(&address).copied() else {
            return Ok(None);
        };
        if record.allocator != caller {
            let err = Error::AllocatorMismatch {
                address,
                owner: record.allocator,
                caller,
            };
            error!("{err}");
            return Err(err);
        }
        Ok(Some(record))
    }
}

/// Handle to a shared allocation ledger.
#[derive(Clone)]
pub struct Tracker {
    ledger: Rc<RefCell<Ledger>>,
}

impl Tracker {
    /// Creates a tracker with [`TrackerConfig::from_env`].
    ///
    /// # Errors
    ///
    /// Fails if the ledger arena cannot be reserved.
    pub fn new() -> Result<Self> {
        Self::with_config(TrackerConfig::from_env())
    }

    /// Creates a tracker from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the ledger arena cannot be reserved.
    pub fn with_config(config: TrackerConfig) -> Result<Self> {
        let arena = Arena::with_config(
            ArenaConfig::new(config.ledger_reserve).name("tracker-ledger"),
        )?;
        let records = HashTable::with_capacity(Rc::new(arena), config.initial_capacity)?;
        debug!(
            "tracker created (stacks: {}, ledger reserve: {} bytes)",
            config.capture_stacks, config.ledger_reserve
        );
        Ok(Self {
            ledger: Rc::new(RefCell::new(Ledger { records, config })),
        })
    }

    /// Returns the tracker's configuration.
    #[must_use]
    pub fn config(&self) -> TrackerConfig {
        self.ledger.borrow().config
    }

    #[inline(never)]
    fn capture(&self) -> StackTrace {
        let config = self.config();
        if config.capture_stacks {
            StackTrace::capture(config.skip_frames, config.max_frames)
        } else {
            StackTrace::EMPTY
        }
    }

    /// Records a new allocation.
    ///
    /// An address that is still live (an arena reset can hand it out again)
    /// gets a fresh record and a warning; a freed address is revived.
    ///
    /// # Errors
    ///
    /// Fails only if the ledger itself cannot grow.
    pub fn on_allocate(&self, allocator: AllocatorId, address: usize, size: usize) -> Result<()> {
        let site = self.capture();
        trace!("{allocator}: allocate {size} bytes at {address:#x}");
        self.ledger
            .borrow_mut()
            .allocate(allocator, address, size, site)
    }

    /// Records a reallocation from `old_address` to `new_address`.
    ///
    /// - Unknown `old_address`: recorded as a fresh allocation.
    /// - Same address: the size is updated in place.
    /// - Moved: the old record is freed and a new one created.
    ///
    /// # Errors
    ///
    /// [`Error::AllocatorMismatch`] or [`Error::ReallocAfterFree`] for a
    /// known old address that `allocator` may not resize.
    pub fn on_reallocate(
        &self,
        allocator: AllocatorId,
        new_address: usize,
        old_address: usize,
        new_size: usize,
        old_size: usize,
    ) -> Result<()> {
        let site = self.capture();
        trace!(
            "{allocator}: reallocate {old_address:#x} ({old_size} bytes) -> {new_address:#x} ({new_size} bytes)"
        );

        let mut guard = self.ledger.borrow_mut();
        let ledger = &mut *guard;
        let Some(old) = ledger.owned_record(allocator, old_address)? else {
            return ledger.allocate(allocator, new_address, new_size, site);
        };
        if !old.live {
            let err = Error::ReallocAfterFree {
                address: old_address,
                freed_at: old.freed_at.render(),
            };
            error!("{err}");
            return Err(err);
        }

        if let Some(record) = ledger.records.get_mut(&old_address) {
            if new_address == old_address {
                record.size = new_size;
                return Ok(());
            }
            record.live = false;
            record.freed_at = site;
        }
        ledger.allocate(allocator, new_address, new_size, site)
    }

    /// Checks that `allocator` may resize `address` without recording
    /// anything.
    pub(crate) fn check_reallocate(&self, allocator: AllocatorId, address: usize) -> Result<()> {
        match self.ledger.borrow().owned_record(allocator, address)? {
            Some(record) if !record.live => {
                let err = Error::ReallocAfterFree {
                    address,
                    freed_at: record.freed_at.render(),
                };
                error!("{err}");
                Err(err)
            }
            _ => Ok(()),
        }
    }

    /// Records a free.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownFree`], [`Error::AllocatorMismatch`] or
    /// [`Error::DoubleFree`]; the ledger is left unchanged in each case.
    pub fn on_free(&self, allocator: AllocatorId, address: usize) -> Result<()> {
        let site = self.capture();
        trace!("{allocator}: free {address:#x}");

        let mut guard = self.ledger.borrow_mut();
        let ledger = &mut *guard;
        let Some(record) = ledger.owned_record(allocator, address)? else {
            let err = Error::UnknownFree { address };
            error!("{err}");
            return Err(err);
        };
        if !record.live {
            let err = Error::DoubleFree {
                address,
                size: record.size,
                allocated_at: record.allocated_at.render(),
                first_free: record.freed_at.render(),
                second_free: site.render(),
            };
            error!("{err}");
            return Err(err);
        }

        if let Some(record) = ledger.records.get_mut(&address) {
            record.live = false;
            record.freed_at = site;
        }
        Ok(())
    }

    /// Excludes `address` from leak reports. Returns false if the address
    /// is unknown.
    pub fn mark_not_a_leak(&self, address: usize) -> bool {
        match self.ledger.borrow_mut().records.get_mut(&address) {
            Some(record) => {
                record.not_a_leak = true;
                true
            }
            None => false,
        }
    }

    /// Live allocations not marked as intentional, ordered by address.
    #[must_use]
    pub fn leaks(&self) -> Vec<LeakReport> {
        let ledger = self.ledger.borrow();
        let mut leaks: Vec<_> = ledger
            .records
            .iter()
            .map(|(_, record)| record)
            .filter(|record| record.live && !record.not_a_leak)
            .map(|record| LeakReport {
                address: record.address,
                size: record.size,
                allocator: record.allocator,
                allocated_at: record.allocated_at,
            })
            .collect();
        leaks.sort_unstable_by_key(|leak| leak.address);
        leaks
    }

    /// Logs every leak at `warn` level and returns how many there are.
    pub fn report_leaks(&self) -> usize {
        let leaks = self.leaks();
        for leak in &leaks {
            warn!("{leak}");
        }
        if !leaks.is_empty() {
            let bytes: usize = leaks.iter().map(|leak| leak.size).sum();
            warn!("{} leaked allocations, {bytes} bytes total", leaks.len());
        }
        leaks.len()
    }

    /// Number of live records.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.ledger
            .borrow()
            .records
            .iter()
            .filter(|(_, record)| record.live)
            .count()
    }

    /// Sum of live record sizes.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.ledger
            .borrow()
            .records
            .iter()
            .filter(|(_, record)| record.live)
            .map(|(_, record)| record.size)
            .sum()
    }

    /// Returns the record for `address`, live or not.
    #[must_use]
    pub fn record(&self, address: usize) -> Option<AllocationRecord> {
        self.ledger.borrow().records.get(&address).copied()
    }

    /// Reports leaks and drops this handle. Returns the leak count.
    ///
    /// The ledger and its arena are released once the last clone is gone.
    pub fn shutdown(self) -> usize {
        let leaks = self.report_leaks();
        debug!(
            "tracker shut down with {leaks} leaks ({} handles remaining)",
            Rc::strong_count(&self.ledger) - 1
        );
        leaks
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.borrow();
        f.debug_struct("Tracker")
            .field("records", &ledger.records.len())
            .field("config", &ledger.config)
            .finish()
    }
}

/// Allocator decorator that reports every call to a [`Tracker`].
///
/// Frees and reallocations are validated before they reach the wrapped
/// allocator, so a double free is reported without touching freed memory.
pub struct TrackedAllocator<A: Allocator> {
    inner: A,
    tracker: Tracker,
}

impl<A: Allocator> TrackedAllocator<A> {
    /// Wraps `inner`, reporting to `tracker`.
    pub fn new(inner: A, tracker: &Tracker) -> Self {
        Self {
            inner,
            tracker: tracker.clone(),
        }
    }

    /// The wrapped allocator.
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The tracker calls are reported to.
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Unwraps the allocator.
    pub fn into_inner(self) -> A {
        self.inner
    }

    fn record(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        self.tracker
            .on_allocate(self.inner.id(), ptr.as_ptr() as usize, size)?;
        Ok(ptr)
    }
}

impl<A: Allocator> Allocator for TrackedAllocator<A> {
    fn id(&self) -> AllocatorId {
        self.inner.id()
    }

    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.inner.allocate(size)?;
        self.record(ptr, size)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let ptr = self.inner.allocate_aligned(size, align)?;
        self.record(ptr, size)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        old_size: usize,
    ) -> Result<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.allocate(new_size);
        };
        let old_address = old.as_ptr() as usize;
        self.tracker.check_reallocate(self.id(), old_address)?;

        // SAFETY: forwarded caller contract; the tracker has vetted `old`.
        let new = unsafe { self.inner.reallocate(ptr, new_size, old_size)? };
        self.tracker.on_reallocate(
            self.id(),
            new.as_ptr() as usize,
            old_address,
            new_size,
            old_size,
        )?;
        Ok(new)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        let Some(block) = ptr else {
            return Ok(());
        };
        self.tracker.on_free(self.id(), block.as_ptr() as usize)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.free(ptr) }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn set_name(&self, name: &'static str) {
        self.inner.set_name(name);
    }
}

impl<A: Allocator + fmt::Debug> fmt::Debug for TrackedAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedAllocator")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
