use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::config::{resize_policy, ResizePolicy};
use crate::error::OveError;
use crate::hint::unlikely;
use crate::set::bucket::{Bucket, ENTRIES_PER_BUCKET};
use crate::set::cursor::next_cursor;

/// Width of the per-slot hash tag. The tag keeps the low bits of the hash;
/// the bucket index is taken from the bits above it, so the two never
/// overlap.
const TAG_BITS: u32 = 8;

/// Progress callbacks during [`RawSet::clear_with`] fire every this many
/// buckets, starting with the first.
const CLEAR_PROGRESS_INTERVAL: usize = 1 << 16;

#[inline]
fn tag(hash: u64) -> u8 {
    hash as u8
}

#[inline]
fn home_index(hash: u64, mask: usize) -> usize {
    ((hash >> TAG_BITS) as usize) & mask
}

/// Smallest power-of-two bucket count that holds `elements` at no more than
/// one element per bucket on average. `None` on overflow.
#[inline]
fn buckets_for(elements: usize) -> Option<usize> {
    usize::max(1, elements).checked_next_power_of_two()
}

/// Whether memory allocation errors should return an error or abort.
#[derive(Copy, Clone)]
pub(crate) enum Fallibility {
    Fallible,
    Infallible,
}

impl Fallibility {
    /// Error to return on capacity overflow.
    #[inline]
    fn capacity_overflow(self, elements: usize) -> OveError {
        match self {
            Fallibility::Fallible => OveError::CapacityOverflow(elements),
            Fallibility::Infallible => panic!("Hash set capacity overflow"),
        }
    }

    /// Error to return on allocation error.
    #[inline]
    fn alloc_failed(self, layout: Layout) -> OveError {
        match self {
            Fallibility::Fallible => OveError::AllocFailed(layout.size()),
            Fallibility::Infallible => handle_alloc_error(layout),
        }
    }
}

/// One bucket array. `num_buckets` is zero for the unallocated placeholder
/// and a power of two otherwise.
struct Table<E> {
    buckets: NonNull<Bucket<E>>,
    num_buckets: usize,
    used: usize,
    // Tell dropck that we own instances of E.
    marker: PhantomData<E>,
}

impl<E> Table<E> {
    #[inline]
    fn unallocated() -> Self {
        Self {
            buckets: NonNull::dangling(),
            num_buckets: 0,
            used: 0,
            marker: PhantomData,
        }
    }

    /// Allocates a zeroed bucket array; zeroed buckets are valid and empty.
    fn alloc(num_buckets: usize, fallibility: Fallibility) -> Result<Self, OveError> {
        debug_assert!(num_buckets.is_power_of_two());
        let layout = match Layout::array::<Bucket<E>>(num_buckets) {
            Ok(layout) => layout,
            Err(_) => return Err(fallibility.capacity_overflow(num_buckets)),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let buckets = match NonNull::new(ptr as *mut Bucket<E>) {
            Some(buckets) => buckets,
            None => return Err(fallibility.alloc_failed(layout)),
        };
        Ok(Self {
            buckets,
            num_buckets,
            used: 0,
            marker: PhantomData,
        })
    }

    #[inline]
    fn mask(&self) -> usize {
        debug_assert!(self.num_buckets > 0);
        self.num_buckets - 1
    }

    #[inline]
    fn bucket(&self, idx: usize) -> &Bucket<E> {
        debug_assert!(idx < self.num_buckets);
        unsafe { &*self.buckets.as_ptr().add(idx) }
    }

    #[inline]
    fn bucket_mut(&mut self, idx: usize) -> &mut Bucket<E> {
        debug_assert!(idx < self.num_buckets);
        unsafe { &mut *self.buckets.as_ptr().add(idx) }
    }

    #[inline]
    fn slots(&self) -> usize {
        self.num_buckets * ENTRIES_PER_BUCKET
    }

    /// Probes for the first unused slot reachable from the hash's home
    /// bucket, marking every full bucket passed on the way as everfull.
    /// The table must have at least one unused slot.
    fn probe_free_slot(&mut self, hash: u64) -> (usize, usize) {
        debug_assert!(self.used < self.slots());
        let mask = self.mask();
        let mut idx = home_index(hash, mask);
        loop {
            let bucket = self.bucket_mut(idx);
            if let Some(slot) = bucket.first_free() {
                return (idx, slot);
            }
            bucket.set_everfull();
            idx = (idx + 1) & mask;
        }
    }
}

impl<E> Drop for Table<E> {
    fn drop(&mut self) {
        // Elements are dropped by the owning set; this only returns the
        // bucket array itself.
        if self.num_buckets > 0 {
            let layout = Layout::array::<Bucket<E>>(self.num_buckets)
                .expect("layout computed once before");
            unsafe { dealloc(self.buckets.as_ptr() as *mut u8, layout) };
        }
    }
}

/// Outcome of preparing an insert: either the key is already present at the
/// given slot, or an unused slot has been reserved for it.
pub(crate) enum PreparedInsert {
    Existing {
        table: usize,
        bucket: usize,
        slot: usize,
    },
    Vacant {
        table: usize,
        bucket: usize,
        slot: usize,
    },
}

/// Cursor of the shared bucket-stepping primitive used by both iterator
/// flavors.
#[derive(Clone, Copy)]
pub(crate) struct IterState {
    table: usize,
    bucket: usize,
    slot: usize,
}

/// The hash-agnostic core: a pair of bucket arrays, the incremental rehash
/// state and the probing machinery. Key semantics come in from the outside,
/// as a hash value plus an equality closure per operation and a hasher
/// closure wherever migration may have to re-bucket elements.
pub(crate) struct RawSet<E> {
    tables: [Table<E>; 2],
    /// Next bucket of `tables[0]` to migrate; `None` when not rehashing.
    /// While rehashing, `tables[0]` is the outgoing table and all inserts go
    /// to `tables[1]`.
    rehash_idx: Option<usize>,
    pause_rehash: u32,
    pause_auto_shrink: u32,
    instant_rehash: bool,
}

impl<E> RawSet<E> {
    pub(crate) fn new(instant_rehash: bool) -> Self {
        Self {
            tables: [Table::unallocated(), Table::unallocated()],
            rehash_idx: None,
            pause_rehash: 0,
            pause_auto_shrink: 0,
            instant_rehash,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    #[inline]
    pub(crate) fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Total slot capacity of the currently allocated tables.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.tables[0].slots() + self.tables[1].slots()
    }

    #[inline]
    pub(crate) fn num_buckets(&self, table: usize) -> usize {
        self.tables[table].num_buckets
    }

    #[inline]
    pub(crate) fn bucket(&self, table: usize, idx: usize) -> &Bucket<E> {
        self.tables[table].bucket(idx)
    }

    #[inline]
    pub(crate) fn pause_rehashing(&mut self) {
        self.pause_rehash += 1;
    }

    #[inline]
    pub(crate) fn resume_rehashing(&mut self) {
        // Saturating: clearing the set zeroes the counters even while a
        // guard is outstanding.
        self.pause_rehash = self.pause_rehash.saturating_sub(1);
    }

    #[inline]
    pub(crate) fn pause_auto_shrink(&mut self) {
        self.pause_auto_shrink += 1;
    }

    #[inline]
    pub(crate) fn resume_auto_shrink(&mut self) {
        self.pause_auto_shrink = self.pause_auto_shrink.saturating_sub(1);
    }

    /// # Safety
    /// The slot must be filled.
    #[inline]
    pub(crate) unsafe fn slot_ref(&self, table: usize, bucket: usize, slot: usize) -> &E {
        self.tables[table].bucket(bucket).slot(slot)
    }

    /// # Safety
    /// The slot must be filled.
    #[inline]
    pub(crate) unsafe fn slot_mut(&mut self, table: usize, bucket: usize, slot: usize) -> &mut E {
        self.tables[table].bucket_mut(bucket).slot_mut(slot)
    }

    /// Moves the element out of a filled slot and adjusts the count. The
    /// bucket's everfull bit stays set, so probe chains running through it
    /// remain intact.
    ///
    /// # Safety
    /// The slot must be filled.
    pub(crate) unsafe fn take_at(&mut self, table: usize, bucket: usize, slot: usize) -> E {
        let element = self.tables[table].bucket_mut(bucket).take(slot);
        self.tables[table].used -= 1;
        element
    }

    /// Follows the probe sequence of `hash` in every live table until a
    /// matching element or a chain-terminating bucket is found.
    pub(crate) fn probe_find(
        &self,
        hash: u64,
        mut eq: impl FnMut(&E) -> bool,
    ) -> Option<(usize, usize, usize)> {
        let tag = tag(hash);
        for t in 0..2 {
            let table = &self.tables[t];
            if table.used == 0 {
                continue;
            }
            let mask = table.mask();
            let mut idx = home_index(hash, mask);
            // The wrap guard keeps a lookup for an absent key finite even if
            // every bucket of the table has become everfull.
            let mut remaining = table.num_buckets;
            loop {
                let bucket = table.bucket(idx);
                if let Some(slot) = bucket.find(tag, &mut eq) {
                    return Some((t, idx, slot));
                }
                remaining -= 1;
                if !bucket.everfull() || remaining == 0 {
                    break;
                }
                idx = (idx + 1) & mask;
            }
        }
        None
    }

    /// One unit of incremental rehashing, skipped while paused.
    #[inline]
    fn rehash_step_if_needed(&mut self, hasher: &impl Fn(&E) -> u64) {
        if self.rehash_idx.is_some() && self.pause_rehash == 0 {
            self.rehash_step(hasher);
        }
    }

    /// Migrates one bucket from the outgoing table and advances the cursor.
    fn rehash_step(&mut self, hasher: &impl Fn(&E) -> u64) {
        let idx = match self.rehash_idx {
            Some(idx) => idx,
            None => return,
        };
        let [old, new] = &mut self.tables;
        rehash_bucket(old, new, idx, hasher);
        if idx + 1 == old.num_buckets {
            self.finish_rehash();
        } else {
            self.rehash_idx = Some(idx + 1);
        }
    }

    /// Runs the rehash to completion regardless of pause counters.
    fn rehash_entire(&mut self, hasher: &impl Fn(&E) -> u64) {
        while self.rehash_idx.is_some() {
            self.rehash_step(hasher);
        }
    }

    fn finish_rehash(&mut self) {
        debug_assert_eq!(self.tables[0].used, 0);
        self.tables[0] = mem::replace(&mut self.tables[1], Table::unallocated());
        self.rehash_idx = None;
    }

    /// Allocates the incoming table and begins migration. With instant
    /// rehashing, or when nothing has been allocated yet, the switch
    /// completes before returning.
    fn start_resize(
        &mut self,
        num_buckets: usize,
        fallibility: Fallibility,
        hasher: &impl Fn(&E) -> u64,
    ) -> Result<(), OveError> {
        debug_assert!(!self.is_rehashing());
        debug_assert_ne!(num_buckets, self.tables[0].num_buckets);
        let table = Table::alloc(num_buckets, fallibility)?;
        if self.tables[0].num_buckets == 0 {
            self.tables[0] = table;
            return Ok(());
        }
        self.tables[1] = table;
        self.rehash_idx = Some(0);
        if self.instant_rehash {
            self.rehash_entire(hasher);
        }
        Ok(())
    }

    /// Grows the table pair if the upcoming insert would push the fill
    /// factor over the policy threshold.
    fn expand_if_needed(&mut self, hasher: &impl Fn(&E) -> u64) {
        if self.is_rehashing() {
            // A new resize cannot start while one is in flight. The incoming
            // table must still never fill up completely (inserts while
            // rehashing is paused could get it there), or the free-slot
            // probe would not terminate; finish the rehash first.
            if unlikely(self.tables[1].used == self.tables[1].slots()) {
                self.rehash_entire(hasher);
            } else {
                return;
            }
        }
        let used = self.len();
        let num_buckets = self.tables[0].num_buckets;
        if num_buckets == 0 {
            let _ = self.start_resize(1, Fallibility::Infallible, hasher);
            return;
        }
        let growth = match resize_policy() {
            ResizePolicy::Allow => 1,
            ResizePolicy::Avoid => 5,
        };
        if used + 1 > num_buckets.saturating_mul(growth) {
            let target = match buckets_for(used + 1) {
                Some(target) => target,
                None => {
                    let _ = Fallibility::Infallible.capacity_overflow(used + 1);
                    return;
                }
            };
            let _ = self.start_resize(target, Fallibility::Infallible, hasher);
        }
    }

    /// Shrinks the table pair when the fill factor has fallen under the
    /// policy threshold. Suppressed while rehashing or paused.
    pub(crate) fn shrink_if_needed(&mut self, hasher: &impl Fn(&E) -> u64) {
        if self.is_rehashing() || self.pause_auto_shrink > 0 {
            return;
        }
        let num_buckets = self.tables[0].num_buckets;
        if num_buckets <= 1 {
            return;
        }
        let used = self.tables[0].used;
        let divisor = match resize_policy() {
            ResizePolicy::Allow => 8,
            ResizePolicy::Avoid => 32,
        };
        if used.saturating_mul(divisor) < num_buckets {
            let target = match buckets_for(used) {
                Some(target) => target,
                None => return,
            };
            if target < num_buckets {
                let _ = self.start_resize(target, Fallibility::Infallible, hasher);
            }
        }
    }

    /// Pre-sizes the set for `elements`. No-op while rehashing or when the
    /// current table is already large enough.
    pub(crate) fn reserve(
        &mut self,
        elements: usize,
        fallibility: Fallibility,
        hasher: &impl Fn(&E) -> u64,
    ) -> Result<bool, OveError> {
        if elements == 0 || self.is_rehashing() {
            return Ok(false);
        }
        let target = match buckets_for(elements) {
            Some(target) => target,
            None => return Err(fallibility.capacity_overflow(elements)),
        };
        if target <= self.tables[0].num_buckets {
            return Ok(false);
        }
        self.start_resize(target, fallibility, hasher)?;
        Ok(true)
    }

    /// Locates the key or reserves an unused slot for it, growing and
    /// migrating as a side effect. The reserved slot stays valid until the
    /// next mutating operation.
    pub(crate) fn prepare_insert(
        &mut self,
        hash: u64,
        eq: impl FnMut(&E) -> bool,
        hasher: impl Fn(&E) -> u64,
    ) -> PreparedInsert {
        self.expand_if_needed(&hasher);
        self.rehash_step_if_needed(&hasher);
        if let Some((table, bucket, slot)) = self.probe_find(hash, eq) {
            return PreparedInsert::Existing {
                table,
                bucket,
                slot,
            };
        }
        let target = if self.is_rehashing() { 1 } else { 0 };
        let (bucket, slot) = self.tables[target].probe_free_slot(hash);
        PreparedInsert::Vacant {
            table: target,
            bucket,
            slot,
        }
    }

    /// Fills a slot reserved by [`prepare_insert`].
    pub(crate) fn insert_prepared(
        &mut self,
        table: usize,
        bucket: usize,
        slot: usize,
        hash: u64,
        element: E,
    ) {
        self.tables[table]
            .bucket_mut(bucket)
            .write(slot, tag(hash), element);
        self.tables[table].used += 1;
    }

    pub(crate) fn find(
        &mut self,
        hash: u64,
        eq: impl FnMut(&E) -> bool,
        hasher: impl Fn(&E) -> u64,
    ) -> Option<&E> {
        if self.len() == 0 {
            return None;
        }
        self.rehash_step_if_needed(&hasher);
        let (table, bucket, slot) = self.probe_find(hash, eq)?;
        Some(unsafe { self.tables[table].bucket(bucket).slot(slot) })
    }

    /// Removes the matching element and hands it to the caller.
    pub(crate) fn remove(
        &mut self,
        hash: u64,
        eq: impl FnMut(&E) -> bool,
        hasher: impl Fn(&E) -> u64,
    ) -> Option<E> {
        if self.len() == 0 {
            return None;
        }
        self.rehash_step_if_needed(&hasher);
        let (table, bucket, slot) = self.probe_find(hash, eq)?;
        let element = unsafe { self.take_at(table, bucket, slot) };
        self.shrink_if_needed(&hasher);
        Some(element)
    }

    /// Drops every element, frees both tables and resets the set to its
    /// initial state. `progress` is invoked periodically during the walk so
    /// long-running clears can yield.
    pub(crate) fn clear_with(&mut self, mut progress: impl FnMut()) {
        for t in 0..2 {
            let table = &mut self.tables[t];
            for idx in 0..table.num_buckets {
                if idx % CLEAR_PROGRESS_INTERVAL == 0 {
                    progress();
                }
                table.bucket_mut(idx).drop_filled();
            }
            table.used = 0;
        }
        self.tables = [Table::unallocated(), Table::unallocated()];
        self.rehash_idx = None;
        self.pause_rehash = 0;
        self.pause_auto_shrink = 0;
    }

    /// Emits every element of one bucket in each live table and advances the
    /// cursor, in an order that keeps a full traversal complete across
    /// resizes. See `cursor.rs` for the ordering argument.
    pub(crate) fn scan(&mut self, cursor: usize, emit: &mut impl FnMut(&E)) -> usize {
        if self.len() == 0 {
            return 0;
        }
        // Keep the tables still for the duration of the call; the emit
        // closure observes live slots.
        self.pause_rehash += 1;
        let next = if !self.is_rehashing() {
            let mask = self.tables[0].mask();
            self.tables[0].bucket(cursor & mask).each_filled(|e| emit(e));
            next_cursor(cursor, mask)
        } else {
            let (small, large) = if self.tables[0].num_buckets <= self.tables[1].num_buckets {
                (0, 1)
            } else {
                (1, 0)
            };
            let small_mask = self.tables[small].mask();
            let large_mask = self.tables[large].mask();
            self.tables[small]
                .bucket(cursor & small_mask)
                .each_filled(|e| emit(e));
            // Visit every bucket of the larger table that the smaller
            // table's bucket expands to: all indices equal to the cursor
            // under the small mask.
            let mut cursor = cursor;
            loop {
                self.tables[large]
                    .bucket(cursor & large_mask)
                    .each_filled(|e| emit(e));
                cursor = next_cursor(cursor, large_mask);
                if cursor & (small_mask ^ large_mask) == 0 {
                    break;
                }
            }
            cursor
        };
        self.pause_rehash -= 1;
        next
    }

    /// Starting state for the bucket-stepping primitive. While rehashing,
    /// the migrated prefix of the outgoing table is already empty and is
    /// skipped.
    pub(crate) fn iter_start(&self) -> IterState {
        IterState {
            table: 0,
            bucket: self.rehash_idx.unwrap_or(0),
            slot: 0,
        }
    }

    /// Shared stepping primitive of both iterator flavors: walks buckets in
    /// index order, outgoing table first, then the incoming table while
    /// rehashing.
    pub(crate) fn iter_next<'s>(&'s self, state: &mut IterState) -> Option<&'s E> {
        loop {
            let table = &self.tables[state.table];
            if state.bucket >= table.num_buckets {
                if state.table == 0 && self.is_rehashing() {
                    *state = IterState {
                        table: 1,
                        bucket: 0,
                        slot: 0,
                    };
                    continue;
                }
                return None;
            }
            let bucket = table.bucket(state.bucket);
            while state.slot < ENTRIES_PER_BUCKET {
                let slot = state.slot;
                state.slot += 1;
                if bucket.is_filled(slot) {
                    return Some(unsafe { bucket.slot(slot) });
                }
            }
            state.slot = 0;
            state.bucket += 1;
        }
    }

    /// Snapshot of the table identities and counts, used by the unsafe
    /// iterator to detect use-after-mutation in debug builds.
    pub(crate) fn fingerprint(&self) -> u64 {
        use std::hash::Hasher;
        let mut hasher = fxhash::FxHasher::default();
        for table in &self.tables {
            hasher.write_usize(table.buckets.as_ptr() as usize);
            hasher.write_usize(table.num_buckets);
            hasher.write_usize(table.used);
        }
        hasher.write_usize(self.rehash_idx.map_or(usize::MAX, |idx| idx));
        hasher.finish()
    }

    /// Length of the longest probe chain in either table: the longest run
    /// of consecutive everfull buckets plus its terminating bucket.
    pub(crate) fn longest_bucket_chain(&self) -> usize {
        let mut longest = 0;
        for table in &self.tables {
            let mut run = 0;
            for idx in 0..table.num_buckets {
                if table.bucket(idx).everfull() {
                    run += 1;
                    longest = usize::max(longest, run + 1);
                } else {
                    run = 0;
                }
            }
        }
        longest
    }
}

/// Moves every element of `old`'s bucket `idx` into `new`, re-bucketed by
/// its hash. Presence bits of the migrated bucket are cleared; its everfull
/// bit stays, since probe chains of not-yet-migrated elements may still run
/// through it.
fn rehash_bucket<E>(
    old: &mut Table<E>,
    new: &mut Table<E>,
    idx: usize,
    hasher: &impl Fn(&E) -> u64,
) {
    let mut bits = old.bucket(idx).presence();
    while bits != 0 {
        let slot = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        let element = unsafe { old.bucket_mut(idx).take(slot) };
        old.used -= 1;
        let hash = hasher(&element);
        let (new_idx, new_slot) = new.probe_free_slot(hash);
        new.bucket_mut(new_idx).write(new_slot, tag(hash), element);
        new.used += 1;
    }
}

impl<E> Drop for RawSet<E> {
    fn drop(&mut self) {
        if mem::needs_drop::<E>() {
            for table in &mut self.tables {
                for idx in 0..table.num_buckets {
                    table.bucket_mut(idx).drop_filled();
                }
            }
        }
        // The tables' own drops free the bucket arrays.
    }
}

unsafe impl<E: Send> Send for RawSet<E> {}
unsafe impl<E: Sync> Sync for RawSet<E> {}
