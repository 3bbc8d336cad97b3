use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

use crate::config::seeded_hasher;
use crate::error::OveError;

pub(crate) mod bucket;
pub mod cursor;
mod iter;
mod random;
mod table;

pub use self::iter::{Iter, SafeIter};

use self::table::{Fallibility, PreparedInsert, RawSet};

/// Describes how a set keys, hashes and compares its elements.
///
/// A descriptor is a zero-sized type parameter rather than a table of
/// function pointers: the element type, the key extraction, the hash
/// function and the comparator are all bound at compile time. Ownership of
/// elements follows plain Rust rules — deleting or clearing drops the
/// element (a no-op for plain integers), popping moves it out to the caller.
pub trait SetType {
    /// The element type stored in the set. Intended to be pointer-sized
    /// (integers, references, boxes), so that a bucket of seven elements
    /// plus its metadata is exactly one cache line.
    type Element;
    /// The key type lookups are expressed in.
    type Key: ?Sized;

    /// Extracts the lookup key from an element.
    fn key(element: &Self::Element) -> &Self::Key;

    /// Hashes a key. All 64 bits are used: the low byte becomes the in-
    /// bucket tag and the bits above it pick the bucket.
    fn hash(key: &Self::Key) -> u64;

    /// Compares a lookup key with the key of a stored element.
    fn key_eq(a: &Self::Key, b: &Self::Key) -> bool;

    /// When set, a resize runs to completion within the operation that
    /// triggered it and rehashing is never observable from the outside.
    const INSTANT_REHASHING: bool = false;
}

/// Descriptor for sets whose elements are their own key, hashed with the
/// process-wide seeded hash function.
pub struct SelfKeyed<E> {
    marker: PhantomData<E>,
}

impl<E: Hash + Eq> SetType for SelfKeyed<E> {
    type Element = E;
    type Key = E;

    #[inline]
    fn key(element: &E) -> &E {
        element
    }

    #[inline]
    fn hash(key: &E) -> u64 {
        let mut hasher = seeded_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn key_eq(a: &E, b: &E) -> bool {
        a == b
    }
}

/// A cache-line conscious hash set with incremental resizing.
///
/// Lookups hash the key once; the low byte of the hash is kept as a per-slot
/// tag so that probing filters candidates from bucket metadata alone. While
/// a resize is in flight both the old and the new table are live: lookups
/// consult both, inserts go to the incoming table, and every operation
/// migrates a bucket's worth of elements until the old table drains.
pub struct Hashset<T: SetType> {
    pub(crate) raw: RawSet<T::Element>,
    marker: PhantomData<T>,
}

/// Outcome of [`Hashset::find_position_for_insert`].
pub enum FindPosition<'a, T: SetType> {
    /// The key is absent; a slot has been reserved for it.
    Vacant(Position<'a, T>),
    /// An element with this key is already present.
    Existing(&'a T::Element),
}

/// A slot reserved for an insert, valid until used or dropped. Holding it
/// borrows the set mutably, so no other operation can slip between the two
/// phases; rehashing and automatic shrinking stay paused while it exists.
pub struct Position<'a, T: SetType> {
    set: &'a mut Hashset<T>,
    table: usize,
    bucket: usize,
    slot: usize,
    hash: u64,
}

impl<'a, T: SetType> Position<'a, T> {
    /// Fills the reserved slot. The element must carry the key the position
    /// was found for.
    pub fn insert(self, element: T::Element) {
        debug_assert_eq!(T::hash(T::key(&element)), self.hash);
        self.set
            .raw
            .insert_prepared(self.table, self.bucket, self.slot, self.hash, element);
    }
}

impl<'a, T: SetType> Drop for Position<'a, T> {
    fn drop(&mut self) {
        self.set.raw.resume_rehashing();
        self.set.raw.resume_auto_shrink();
    }
}

/// First phase of a two-phase pop: a located element whose removal is
/// deferred. The set's size is unchanged until [`delete`] runs; dropping the
/// guard without deleting leaves the element in place.
///
/// [`delete`]: TwoPhasePop::delete
pub struct TwoPhasePop<'a, T: SetType> {
    set: &'a mut Hashset<T>,
    table: usize,
    bucket: usize,
    slot: usize,
    taken: bool,
}

impl<'a, T: SetType> TwoPhasePop<'a, T> {
    /// The located element, in place.
    pub fn element(&self) -> &T::Element {
        unsafe { self.set.raw.slot_ref(self.table, self.bucket, self.slot) }
    }

    /// Read access to the set while the pop is pending.
    pub fn set(&self) -> &Hashset<T> {
        self.set
    }

    /// Second phase: removes the element and hands it to the caller.
    pub fn delete(mut self) -> T::Element {
        let element = unsafe { self.set.raw.take_at(self.table, self.bucket, self.slot) };
        self.taken = true;
        element
    }
}

impl<'a, T: SetType> Drop for TwoPhasePop<'a, T> {
    fn drop(&mut self) {
        self.set.raw.resume_rehashing();
        self.set.raw.resume_auto_shrink();
        if self.taken {
            self.set
                .raw
                .shrink_if_needed(&|element: &T::Element| T::hash(T::key(element)));
        }
    }
}

impl<T: SetType> Hashset<T> {
    pub fn new() -> Self {
        Self {
            raw: RawSet::new(T::INSTANT_REHASHING),
            marker: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut set = Self::new();
        set.expand(capacity);
        set
    }

    #[inline]
    fn element_hasher() -> impl Fn(&T::Element) -> u64 {
        |element| T::hash(T::key(element))
    }

    /// Number of elements in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot capacity of the currently allocated tables.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Whether an incremental resize is in flight.
    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.raw.is_rehashing()
    }

    /// Pre-sizes the set for `capacity` elements. Returns whether a resize
    /// took place; sizing down or pre-sizing mid-rehash does nothing.
    pub fn expand(&mut self, capacity: usize) -> bool {
        self.raw
            .reserve(capacity, Fallibility::Infallible, &Self::element_hasher())
            .unwrap_or(false)
    }

    /// Like [`expand`], but reports capacity overflow and allocation failure
    /// instead of aborting.
    ///
    /// [`expand`]: Hashset::expand
    pub fn try_expand(&mut self, capacity: usize) -> Result<bool, OveError> {
        self.raw
            .reserve(capacity, Fallibility::Fallible, &Self::element_hasher())
    }

    /// Adds an element. Returns false, dropping the given element, if one
    /// with the same key is already present.
    pub fn add(&mut self, element: T::Element) -> bool {
        let hash = T::hash(T::key(&element));
        match self.raw.prepare_insert(
            hash,
            |e| T::key_eq(T::key(e), T::key(&element)),
            Self::element_hasher(),
        ) {
            PreparedInsert::Existing { .. } => false,
            PreparedInsert::Vacant {
                table,
                bucket,
                slot,
            } => {
                self.raw.insert_prepared(table, bucket, slot, hash, element);
                true
            }
        }
    }

    /// Looks up an element by key. Performs one unit of migration work when
    /// a resize is in flight, hence `&mut`.
    pub fn find(&mut self, key: &T::Key) -> Option<&T::Element> {
        let hash = T::hash(key);
        self.raw.find(
            hash,
            |e| T::key_eq(T::key(e), key),
            Self::element_hasher(),
        )
    }

    /// Removes and drops the element with this key.
    pub fn delete(&mut self, key: &T::Key) -> bool {
        self.pop(key).is_some()
    }

    /// Removes the element with this key and transfers it to the caller.
    pub fn pop(&mut self, key: &T::Key) -> Option<T::Element> {
        let hash = T::hash(key);
        self.raw.remove(
            hash,
            |e| T::key_eq(T::key(e), key),
            Self::element_hasher(),
        )
    }

    /// Inserts the element, or overwrites the element carrying the same key.
    /// Returns the previous element if one was replaced.
    pub fn replace(&mut self, element: T::Element) -> Option<T::Element> {
        let hash = T::hash(T::key(&element));
        match self.raw.prepare_insert(
            hash,
            |e| T::key_eq(T::key(e), T::key(&element)),
            Self::element_hasher(),
        ) {
            PreparedInsert::Existing {
                table,
                bucket,
                slot,
            } => {
                let old = unsafe { self.raw.slot_mut(table, bucket, slot) };
                Some(mem::replace(old, element))
            }
            PreparedInsert::Vacant {
                table,
                bucket,
                slot,
            } => {
                self.raw.insert_prepared(table, bucket, slot, hash, element);
                None
            }
        }
    }

    /// Locates the key or reserves a slot for it without requiring the
    /// element yet — useful when constructing the element is expensive and
    /// should be skipped for duplicate keys. Pair with [`Position::insert`].
    pub fn find_position_for_insert(&mut self, key: &T::Key) -> FindPosition<'_, T> {
        let hash = T::hash(key);
        match self.raw.prepare_insert(
            hash,
            |e| T::key_eq(T::key(e), key),
            Self::element_hasher(),
        ) {
            PreparedInsert::Existing {
                table,
                bucket,
                slot,
            } => FindPosition::Existing(unsafe { self.raw.slot_ref(table, bucket, slot) }),
            PreparedInsert::Vacant {
                table,
                bucket,
                slot,
            } => {
                self.raw.pause_rehashing();
                self.raw.pause_auto_shrink();
                FindPosition::Vacant(Position {
                    set: self,
                    table,
                    bucket,
                    slot,
                    hash,
                })
            }
        }
    }

    /// First phase of a two-phase pop: locates the element and defers its
    /// removal to [`TwoPhasePop::delete`]. The set's size is unchanged in
    /// between.
    pub fn two_phase_pop_find(&mut self, key: &T::Key) -> Option<TwoPhasePop<'_, T>> {
        if self.raw.len() == 0 {
            return None;
        }
        let hash = T::hash(key);
        let (table, bucket, slot) = self
            .raw
            .probe_find(hash, |e| T::key_eq(T::key(e), key))?;
        self.raw.pause_rehashing();
        self.raw.pause_auto_shrink();
        Some(TwoPhasePop {
            set: self,
            table,
            bucket,
            slot,
            taken: false,
        })
    }

    /// Drops every element and frees the tables.
    pub fn clear(&mut self) {
        self.clear_with(|| {});
    }

    /// Like [`clear`], invoking `progress` periodically during the walk so
    /// long-running clears can yield.
    ///
    /// [`clear`]: Hashset::clear
    pub fn clear_with(&mut self, progress: impl FnMut()) {
        self.raw.clear_with(progress);
    }

    /// Visits the bucket at `cursor` (in both tables while rehashing) and
    /// returns the next cursor. Starting from zero and repeating until zero
    /// comes back emits every element that stays in the set for the whole
    /// walk at least once and at most twice, tolerating inserts, deletes and
    /// resizes in between calls.
    pub fn scan(&mut self, cursor: usize, mut emit: impl FnMut(&T::Element)) -> usize {
        self.raw.scan(cursor, &mut emit)
    }

    /// Iterator for a set that is not mutated while iterating.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self)
    }

    /// Iterator that tolerates adds and deletes between steps; see
    /// [`SafeIter`].
    pub fn safe_iter(&mut self) -> SafeIter<'_, T> {
        SafeIter::new(self)
    }

    /// Picks an element uniformly at random, compensating for uneven bucket
    /// occupancy.
    pub fn fair_random_element(&self) -> Option<&T::Element> {
        self.raw.fair_random_element(&mut rand::thread_rng())
    }

    /// Suppresses automatic shrinking until the matching resume, e.g. around
    /// a bulk delete that will be followed by a refill.
    pub fn pause_auto_shrink(&mut self) {
        self.raw.pause_auto_shrink();
    }

    pub fn resume_auto_shrink(&mut self) {
        self.raw.resume_auto_shrink();
        self.raw
            .shrink_if_needed(&Self::element_hasher());
    }

    /// Longest probe chain in either table, in buckets. Diagnostic.
    pub fn longest_bucket_chain(&self) -> usize {
        self.raw.longest_bucket_chain()
    }
}

impl<T: SetType> Default for Hashset<T> {
    fn default() -> Self {
        Self::new()
    }
}
