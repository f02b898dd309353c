//! Open-addressing hash table over allocator-backed storage.
//!
//! [`HashTable`] keeps its slots in a single block obtained from an
//! [`Allocator`], normally an [`Arena`](crate::arena::Arena). Collisions are
//! resolved by linear probing from the home slot `hash % table_size`.
//!
//! # Slot states
//!
//! A slot whose stored hash equals [`UNUSED`] is empty; any other slot holds
//! a key and a value. Real hashes that happen to equal the sentinel are
//! bumped past it. There are no tombstones: [`HashTable::erase`] uses
//! backward-shift deletion, moving later members of the probe chain into the
//! hole so that every remaining key stays reachable from its home slot.
//!
//! # Growth
//!
//! The load factor is kept below 0.9. When an insertion would reach it, the
//! table is rehashed to `2 * ceil((count + 1) / 0.9)` slots, rounded up to a
//! power of two no smaller than [`MIN_TABLE_SIZE`]. Entries are moved with
//! their stored hash, which is never recomputed. The old block is handed back
//! through [`Allocator::free`], which an arena ignores.
//!
//! # Example
//!
//! ```
//! use bedrock_mem::{Arena, HashTable};
//!
//! let arena = Arena::create(1 << 20).unwrap();
//! let mut ages = HashTable::with_capacity(&arena, 8).unwrap();
//! ages.add("ada", 36).unwrap();
//! *ages.get_or_add("grace").unwrap() = 85;
//!
//! assert_eq!(ages.get(&"ada"), Some(&36));
//! assert_eq!(ages.erase(&"grace"), Some(85));
//! assert_eq!(ages.len(), 1);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use bedrock_log::error;

use crate::allocator::Allocator;
use crate::error::{Error, Result};

/// Stored hash marking an empty slot.
pub const UNUSED: u64 = 0;

/// Smallest non-empty table size.
pub const MIN_TABLE_SIZE: usize = 8;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Hash and equality policy for table keys.
pub trait HashKey {
    /// Returns the 64-bit hash of the key.
    fn hash_key(&self) -> u64;

    /// Returns true if both keys are equal.
    fn key_eq(&self, other: &Self) -> bool;
}

macro_rules! impl_hash_key_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HashKey for $ty {
                #[inline]
                fn hash_key(&self) -> u64 {
                    fold(fxhash::hash64(self))
                }

                #[inline]
                fn key_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_hash_key_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

macro_rules! impl_hash_key_float {
    ($($ty:ty),* $(,)?) => {
        $(
            /// Floats hash and compare by bit pattern, so `NaN` finds itself
            /// and `0.0` and `-0.0` are distinct keys.
            impl HashKey for $ty {
                #[inline]
                fn hash_key(&self) -> u64 {
                    fold(fxhash::hash64(&self.to_bits()))
                }

                #[inline]
                fn key_eq(&self, other: &Self) -> bool {
                    self.to_bits() == other.to_bits()
                }
            }
        )*
    };
}

impl_hash_key_float!(f32, f64);

impl<T: ?Sized> HashKey for *const T {
    #[inline]
    fn hash_key(&self) -> u64 {
        fold(fxhash::hash64(&self.cast::<()>().addr()))
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self.cast::<()>() == other.cast::<()>()
    }
}

impl<T: ?Sized> HashKey for *mut T {
    #[inline]
    fn hash_key(&self) -> u64 {
        self.cast_const().hash_key()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self.cast_const().key_eq(&other.cast_const())
    }
}

impl HashKey for [u8] {
    #[inline]
    fn hash_key(&self) -> u64 {
        u64::from(fnv1a_32(self))
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl HashKey for str {
    #[inline]
    fn hash_key(&self) -> u64 {
        self.as_bytes().hash_key()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl HashKey for String {
    #[inline]
    fn hash_key(&self) -> u64 {
        self.as_bytes().hash_key()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl HashKey for Vec<u8> {
    #[inline]
    fn hash_key(&self) -> u64 {
        self.as_slice().hash_key()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: HashKey + ?Sized> HashKey for &T {
    #[inline]
    fn hash_key(&self) -> u64 {
        (**self).hash_key()
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        (**self).key_eq(*other)
    }
}

/// Folds the high half of a word hash into the low half.
///
/// `fxhash` is a single multiply, so its low bits keep the trailing zeros
/// of the key. Power-of-two tables index with those low bits, and aligned
/// addresses would otherwise share a handful of home slots.
#[inline]
const fn fold(hash: u64) -> u64 {
    hash ^ (hash >> 32)
}

/// 32-bit FNV-1a.
#[inline]
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash of `key` as stored in a slot, biased away from [`UNUSED`].
#[inline]
fn slot_hash<K: HashKey + ?Sized>(key: &K) -> u64 {
    match key.hash_key() {
        UNUSED => UNUSED + 1,
        hash => hash,
    }
}

struct Slot<K, V> {
    hash: u64,
    entry: MaybeUninit<(K, V)>,
}

/// Linear-probing hash table whose storage comes from an [`Allocator`].
///
/// `add` never looks for an existing key: inserting a key twice stores two
/// entries and lookups find whichever comes first in the probe chain. Use
/// [`get_or_add`](HashTable::get_or_add) for upserts.
pub struct HashTable<K, V, A: Allocator> {
    slots: NonNull<Slot<K, V>>,
    table_size: usize,
    count: usize,
    alloc: A,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, A: Allocator> HashTable<K, V, A> {
    /// Creates an empty table. No storage is allocated until the first
    /// insertion.
    pub fn new(alloc: A) -> Self {
        Self {
            slots: NonNull::dangling(),
            table_size: 0,
            count: 0,
            alloc,
            _marker: PhantomData,
        }
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the table has no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// The allocator backing the table.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Iterates over entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slot_array().iter().filter_map(|slot| {
            (slot.hash != UNUSED).then(|| {
                // SAFETY: occupied slots hold an initialized entry.
                let (key, value) = unsafe { slot.entry.assume_init_ref() };
                (key, value)
            })
        })
    }

    fn slot_array(&self) -> &[Slot<K, V>] {
        // SAFETY: slots points to table_size initialized slot headers (or is
        // dangling with a length of zero).
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.table_size) }
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut Slot<K, V> {
        debug_assert!(index < self.table_size);
        // SAFETY: index is within the slot array.
        unsafe { self.slots.as_ptr().add(index) }
    }

    #[inline]
    fn home(&self, hash: u64) -> usize {
        (hash % self.table_size as u64) as usize
    }

    /// Writes an entry into the first unused slot of its probe chain.
    ///
    /// The table must have at least one unused slot.
    fn insert_hashed(&mut self, hash: u64, key: K, value: V) -> usize {
        let mut index = self.home(hash);
        // SAFETY: slot() stays in bounds and the load factor guarantees an
        // unused slot, so the loop terminates.
        unsafe {
            while (*self.slot(index)).hash != UNUSED {
                index = (index + 1) % self.table_size;
            }
            let slot = self.slot(index);
            (*slot).hash = hash;
            (*slot).entry.write((key, value));
        }
        self.count += 1;
        index
    }

    /// Grows the table to at least `required` slots.
    ///
    /// Does nothing if the table is already that large. Otherwise the size
    /// doubles, starting from [`MIN_TABLE_SIZE`], until it reaches
    /// `required`, and every entry moves to a fresh block with its stored
    /// hash.
    ///
    /// # Errors
    ///
    /// [`Error::TableCapacityOverflow`] if the slot array cannot be sized,
    /// or the allocator's error. The table is unchanged on failure.
    pub fn rehash(&mut self, required: usize) -> Result<()> {
        if self.table_size >= required {
            return Ok(());
        }

        let overflow = || Error::TableCapacityOverflow {
            requested: required,
        };
        let mut size = self.table_size.max(MIN_TABLE_SIZE);
        while size < required {
            size = size.checked_mul(2).ok_or_else(overflow)?;
        }
        let bytes = size
            .checked_mul(size_of::<Slot<K, V>>())
            .ok_or_else(overflow)?;
        let fresh = self
            .alloc
            .allocate_aligned(bytes, align_of::<Slot<K, V>>())?
            .cast::<Slot<K, V>>();
        for index in 0..size {
            // SAFETY: fresh holds `size` slots.
            unsafe {
                fresh.add(index).write(Slot {
                    hash: UNUSED,
                    entry: MaybeUninit::uninit(),
                });
            }
        }

        let old = std::mem::replace(&mut self.slots, fresh);
        let old_size = std::mem::replace(&mut self.table_size, size);
        self.count = 0;
        for index in 0..old_size {
            // SAFETY: index < old_size; occupied entries are moved out
            // exactly once and the old block is never read again.
            unsafe {
                let slot = old.as_ptr().add(index);
                if (*slot).hash != UNUSED {
                    let (key, value) = (*slot).entry.assume_init_read();
                    self.insert_hashed((*slot).hash, key, value);
                }
            }
        }

        if old_size > 0 {
            // SAFETY: old came from this allocator and holds no live entries.
            unsafe { self.alloc.free(Some(old.cast()))? };
        }
        Ok(())
    }
}

impl<K: HashKey, V, A: Allocator> HashTable<K, V, A> {
    /// Creates a table with room for `capacity` slots (at least
    /// [`MIN_TABLE_SIZE`], rounded up to a power of two).
    ///
    /// # Errors
    ///
    /// See [`rehash`](HashTable::rehash).
    pub fn with_capacity(alloc: A, capacity: usize) -> Result<Self> {
        let mut table = Self::new(alloc);
        table.rehash(capacity)?;
        Ok(table)
    }

    /// Inserts an entry without looking for an existing key.
    ///
    /// Rehashes first if the insertion would bring the load factor to 0.9.
    ///
    /// # Errors
    ///
    /// Fails if growing the table fails.
    pub fn add(&mut self, key: K, value: V) -> Result<&mut V> {
        if (self.count + 1) * 10 >= self.table_size * 9 {
            let needed = ((self.count + 1) * 10).div_ceil(9);
            self.rehash(2 * needed)?;
        }
        let index = self.insert_hashed(slot_hash(&key), key, value);
        // SAFETY: insert_hashed just initialized this slot.
        Ok(unsafe { &mut (*self.slot(index)).entry.assume_init_mut().1 })
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.find(key)?;
        // SAFETY: find only returns occupied slots.
        Some(unsafe { &(*self.slot(index)).entry.assume_init_ref().1 })
    }

    /// Looks up a key for mutation.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find(key)?;
        // SAFETY: find only returns occupied slots.
        Some(unsafe { &mut (*self.slot(index)).entry.assume_init_mut().1 })
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Returns the value for `key`, adding `V::default()` if it is missing.
    ///
    /// # Errors
    ///
    /// Fails if growing the table fails.
    pub fn get_or_add(&mut self, key: K) -> Result<&mut V>
    where
        V: Default,
    {
        if let Some(index) = self.find(&key) {
            // SAFETY: find only returns occupied slots.
            return Ok(unsafe { &mut (*self.slot(index)).entry.assume_init_mut().1 });
        }
        self.add(key, V::default())
    }

    /// Removes a key and returns its value.
    ///
    /// Later members of the probe chain are shifted back into the hole, so
    /// no other key becomes unreachable.
    pub fn erase(&mut self, key: &K) -> Option<V> {
        let mut hole = self.find(key)?;
        // SAFETY: hole is occupied; its entry is moved out once and the slot
        // is either refilled or marked unused below.
        let (_key, value) = unsafe { (*self.slot(hole)).entry.assume_init_read() };

        let size = self.table_size;
        let mut next = (hole + 1) % size;
        // SAFETY: all indices are reduced modulo table_size.
        unsafe {
            loop {
                let hash = (*self.slot(next)).hash;
                if hash == UNUSED {
                    break;
                }
                let home = self.home(hash);
                // The entry at `next` may fill the hole only if the hole lies
                // on its probe path, i.e. between its home slot and `next`.
                if (hole + size - home) % size < (next + size - home) % size {
                    ptr::copy_nonoverlapping(self.slot(next), self.slot(hole), 1);
                    hole = next;
                }
                next = (next + 1) % size;
            }
            (*self.slot(hole)).hash = UNUSED;
        }
        self.count -= 1;
        Some(value)
    }

    fn find(&self, key: &K) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let hash = slot_hash(key);
        let mut index = self.home(hash);
        for _ in 0..self.table_size {
            // SAFETY: index < table_size; occupied slots are initialized.
            unsafe {
                let slot = self.slot(index);
                match (*slot).hash {
                    UNUSED => return None,
                    stored if stored == hash => {
                        if (*slot).entry.assume_init_ref().0.key_eq(key) {
                            return Some(index);
                        }
                    }
                    _ => {}
                }
            }
            index = (index + 1) % self.table_size;
        }
        None
    }
}

impl<K, V, A: Allocator> Drop for HashTable<K, V, A> {
    fn drop(&mut self) {
        if self.table_size == 0 {
            return;
        }
        for index in 0..self.table_size {
            // SAFETY: occupied slots hold initialized entries, dropped once.
            unsafe {
                let slot = self.slot(index);
                if (*slot).hash != UNUSED {
                    (*slot).entry.assume_init_drop();
                }
            }
        }
        // SAFETY: slots came from this allocator and is not used again.
        if let Err(err) = unsafe { self.alloc.free(Some(self.slots.cast())) } {
            error!("failed to free hash table storage: {err}");
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, A: Allocator> fmt::Debug for HashTable<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
