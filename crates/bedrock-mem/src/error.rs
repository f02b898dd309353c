//! Error types for the memory substrate.
//!
//! Every failure in this crate is a hard failure in production use: a
//! reservation that cannot be satisfied, an arena pushed past its reserved
//! limit, or an allocator protocol violation spotted by the tracker. The core
//! still reports them as values so that they can be asserted on in tests;
//! [`FailFast`] turns any of them back into an immediate process abort.

use std::fmt;

use crate::allocator::AllocatorId;

/// Errors raised by arenas, allocators and the allocation tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The virtual memory provider refused to reserve an address range.
    ReserveFailed {
        /// Requested reservation in bytes (after page rounding).
        size: usize,
    },

    /// Committing pages inside a reservation failed.
    CommitFailed {
        /// Offset of the first page from the arena base.
        offset: usize,
        /// Number of bytes that were to be committed.
        size: usize,
    },

    /// An arena allocation would cross the end of its reservation.
    ArenaExhausted {
        /// End offset the allocation needed.
        requested: usize,
        /// Size of the reservation.
        reserved: usize,
    },

    /// Alignment is zero or not a power of two.
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },

    /// A pointer handed back to an arena does not belong to it.
    ForeignPointer {
        /// The pointer value.
        address: usize,
    },

    /// A hash table was asked for more slots than fit in the address space.
    TableCapacityOverflow {
        /// Requested number of slots.
        requested: usize,
    },

    /// The system heap returned null.
    HeapAllocationFailed {
        /// Requested size in bytes.
        size: usize,
    },

    /// Free of an address the tracker never saw allocated.
    UnknownFree {
        /// The freed address.
        address: usize,
    },

    /// Second free of an address that is no longer live.
    DoubleFree {
        /// The freed address.
        address: usize,
        /// Size recorded for the allocation.
        size: usize,
        /// Rendered stack of the allocation site.
        allocated_at: String,
        /// Rendered stack of the first free.
        first_free: String,
        /// Rendered stack of the offending free.
        second_free: String,
    },

    /// Memory released through an allocator other than the one that owns it.
    AllocatorMismatch {
        /// The address being released.
        address: usize,
        /// Allocator recorded as the owner.
        owner: AllocatorId,
        /// Allocator that attempted the release.
        caller: AllocatorId,
    },

    /// Reallocation of an address that was already freed.
    ReallocAfterFree {
        /// The stale address.
        address: usize,
        /// Rendered stack of the earlier free.
        freed_at: String,
    },
}

impl Error {
    /// Returns true for violations detected by the allocation tracker.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownFree { .. }
                | Error::DoubleFree { .. }
                | Error::AllocatorMismatch { .. }
                | Error::ReallocAfterFree { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReserveFailed { size } => {
                write!(f, "Failed to reserve {size} bytes of address space")
            }
            Error::CommitFailed { offset, size } => {
                write!(f, "Failed to commit {size} bytes at arena offset {offset:#x}")
            }
            Error::ArenaExhausted {
                requested,
                reserved,
            } => {
                write!(
                    f,
                    "Arena exhausted: allocation needs {requested} bytes, reservation is {reserved} bytes"
                )
            }
            Error::InvalidAlignment { alignment } => {
                write!(f, "Invalid alignment: {alignment} is not a power of two")
            }
            Error::ForeignPointer { address } => {
                write!(f, "Pointer {address:#x} does not belong to this arena")
            }
            Error::TableCapacityOverflow { requested } => {
                write!(f, "Hash table capacity overflow: {requested} slots requested")
            }
            Error::HeapAllocationFailed { size } => {
                write!(f, "Heap allocation of {size} bytes failed")
            }
            Error::UnknownFree { address } => {
                write!(f, "Free of unknown address {address:#x}")
            }
            Error::DoubleFree {
                address,
                size,
                allocated_at,
                first_free,
                second_free,
            } => {
                write!(
                    f,
                    "Double free of {address:#x} ({size} bytes)\nallocated at:\n{allocated_at}\nfirst freed at:\n{first_free}\nfreed again at:\n{second_free}"
                )
            }
            Error::AllocatorMismatch {
                address,
                owner,
                caller,
            } => {
                write!(
                    f,
                    "Allocator mismatch for {address:#x}: owned by {owner}, released through {caller}"
                )
            }
            Error::ReallocAfterFree { address, freed_at } => {
                write!(
                    f,
                    "Reallocation of freed address {address:#x}\nfreed at:\n{freed_at}"
                )
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for memory substrate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fail-fast adapter over [`Result`].
///
/// Reproduces the trap-on-violation behaviour expected by callers that have
/// no use for a recoverable error: the error is logged and the process is
/// aborted on the spot.
pub trait FailFast<T> {
    /// Unwraps the value or aborts the process.
    fn or_abort(self) -> T;
}

impl<T> FailFast<T> for Result<T> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                let location = std::panic::Location::caller();
                bedrock_log::error!("fatal memory error at {location}: {err}");
                std::process::abort()
            }
        }
    }
}
