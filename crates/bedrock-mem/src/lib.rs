//! Bedrock memory substrate
//!
//! Low-level memory management for programs that avoid per-object heap
//! allocation:
//!
//! - **Arenas** ([`Arena`]): bump allocation over reserved virtual memory,
//!   committed a page range at a time as the head advances.
//! - **Allocation tracking** ([`Tracker`], [`TrackedAllocator`]): a shadow
//!   ledger that catches unknown frees, double frees and allocator
//!   mismatches, and reports leaks at shutdown.
//! - **Hash table** ([`HashTable`]): a linear-probing table over
//!   allocator-provided storage, used for the tracker's own ledger.
//!
//! Everything here is single threaded. Failures come back as [`Error`]
//! values; callers that want the process to stop on the spot use
//! [`FailFast::or_abort`].
//!
//! # Features
//!
//! - `stack-capture` (default): record call stacks for allocation and free
//!   sites through the `backtrace` crate.
//!
//! # Example
//!
//! ```
//! use bedrock_mem::{Arena, FailFast, HashTable, Tracker};
//!
//! let tracker = Tracker::new().or_abort();
//! let arena = Arena::tracked(1 << 20, &tracker).or_abort();
//!
//! let mut table = HashTable::new(&arena);
//! table.add(7u32, "seven").or_abort();
//! assert_eq!(table.get(&7), Some(&"seven"));
//!
//! drop(table);
//! arena.release().or_abort();
//! assert_eq!(tracker.shutdown(), 0);
//! ```

pub mod allocator;
pub mod arena;
pub mod error;
pub mod stack;
pub mod table;
pub mod tracker;
pub mod vm;

pub use allocator::{Allocator, AllocatorId, HeapAllocator, MIN_ALIGNMENT};
pub use arena::{Arena, ArenaConfig, ArenaStats};
pub use error::{Error, FailFast, Result};
pub use stack::StackTrace;
pub use table::{HashKey, HashTable};
pub use tracker::{AllocationRecord, LeakReport, TrackedAllocator, Tracker, TrackerConfig};
pub use vm::{SYSTEM_MEMORY, SystemMemory, VirtualMemory};
