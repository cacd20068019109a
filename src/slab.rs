use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use tracing::trace;

use crate::Pointer;

/// Value of [`SlabPool::current`] when the registry is empty.
const NO_CURRENT: usize = usize::MAX;

/// Descriptor of one slab: a contiguous system allocation that many `T`
/// runs are carved from.
pub(crate) struct Slab<T> {
    /// Pointer returned by the system allocator for this slab.
    base: NonNull<T>,
    /// Outstanding allocation *calls* satisfied from this slab. Starts at
    /// 1 because the act that creates a slab also performs its first
    /// allocation. One call of any length counts once; the matching
    /// release decrements once. The pool never learns element counts at
    /// release time, so batch lifetimes are all-or-nothing per call and
    /// released pointers must be exactly the pointers handed out.
    live: usize,
    /// Cursor value inside the *previous* slab at the moment this slab
    /// was created, so the previous slab can resume as current when this
    /// one is released.
    saved_offset: usize,
    /// Capacity in `T` slots. Equal to `SLOTS` except for oversize
    /// one-off slabs.
    capacity: usize,
}

/// Multi-slab bump allocator for runs of `T`. One of these exists per
/// `BlockAlloc` instantiation, process-wide, behind the concurrency
/// shell.
///
/// ```text
///            slabs (insertion order)
///            +--------+--------+--------+--------+
///            | slab 0 | slab 1 | slab 2 | slab 3 | <- current (always last)
///            +--------+--------+--------+--------+
///                 ^        ^                  |
///                 |        |                  +-- offset: next free slot
///   sorted by base|        |
///            +----+---+----+---+--------+--------+
///            | 2      | 0      | 3      | 1      | <- indices, rebuilt on
///            +--------+--------+--------+--------+    every insert/remove
/// ```
///
/// Allocation bumps `offset` inside the current slab and opens a fresh
/// slab when the request doesn't fit, remembering the old cursor in the
/// old slab's `saved_offset`. Release binary-searches the sorted view for
/// the owning slab (the last base `<=` the pointer), decrements its live
/// count and returns the whole slab to the system when the count hits
/// zero. If the released slab was the current one, the previous slab
/// resumes as current with its saved cursor, which makes strictly LIFO
/// workloads reuse a single slab indefinitely.
///
/// Requests larger than `SLOTS` can be served as oversize slabs: a
/// one-off slab of exactly the requested capacity, spliced in right below
/// the current slab so the running cursor is untouched. Its
/// `saved_offset` is pre-set to its capacity so it reads as full if it
/// ever becomes current.
pub(crate) struct SlabPool<T, const SLOTS: usize> {
    /// Index into `slabs` of the slab the cursor is in.
    current: usize,
    /// Cursor in `T` slots into the current slab.
    offset: usize,
    /// Insertion-ordered slab registry. The last element is the current
    /// slab.
    slabs: Vec<Slab<T>>,
    /// The same slabs as indices ordered by ascending base. Used only for
    /// pointer-to-slab lookup on release; any mutation of `slabs`
    /// invalidates it and is followed by a rebuild.
    sorted: Vec<usize>,
}

impl<T, const SLOTS: usize> Default for SlabPool<T, SLOTS> {
    fn default() -> Self {
        Self {
            current: NO_CURRENT,
            offset: 0,
            slabs: Vec::new(),
            sorted: Vec::new(),
        }
    }
}

// The pool owns raw slab memory and hands out raw pointers; it only ever
// reads or drops `T` values on behalf of callers that moved them in, so
// it can travel between threads whenever `T` can.
unsafe impl<T: Send, const SLOTS: usize> Send for SlabPool<T, SLOTS> {}

impl<T, const SLOTS: usize> SlabPool<T, SLOTS> {
    /// Allocates a run of `count` contiguous `T` slots. Returns the null
    /// sentinel for a zero-size request, for an oversize request when
    /// `oversize` is off, and on system allocation failure.
    pub fn allocate(&mut self, count: usize, oversize: bool) -> Pointer<T> {
        if count == 0 {
            return None;
        }

        if count > SLOTS {
            if !oversize {
                return None;
            }
            return self.allocate_oversize(count);
        }

        if self.slabs.is_empty() {
            let base = map_slab::<T>(SLOTS)?;
            self.slabs.push(Slab {
                base,
                live: 1,
                saved_offset: 0,
                capacity: SLOTS,
            });
            self.rebuild_sorted();
            self.current = 0;
            self.offset = count;

            return Some(base);
        }

        if count > self.slabs[self.current].capacity - self.offset {
            // Doesn't fit: open a fresh slab, but remember where we left
            // off so the old slab can resume if it becomes current again.
            let base = map_slab::<T>(SLOTS)?;
            self.slabs[self.current].saved_offset = self.offset;
            self.slabs.push(Slab {
                base,
                live: 1,
                saved_offset: 0,
                capacity: SLOTS,
            });
            self.rebuild_sorted();
            self.current += 1;
            self.offset = count;

            return Some(base);
        }

        let slab = &mut self.slabs[self.current];
        // SAFETY: `offset + count` fits in the current slab.
        let pointer = unsafe { NonNull::new_unchecked(slab.base.as_ptr().add(self.offset)) };
        self.offset += count;
        slab.live += 1;

        Some(pointer)
    }

    /// Serves a request larger than the slab capacity from a private
    /// one-off slab of exactly `count` slots. Future allocations continue
    /// in the prior current slab.
    fn allocate_oversize(&mut self, count: usize) -> Pointer<T> {
        let base = map_slab::<T>(count)?;
        let slab = Slab {
            base,
            live: 1,
            saved_offset: count,
            capacity: count,
        };

        if self.slabs.is_empty() {
            self.slabs.push(slab);
            self.current = 0;
            // Reads as full, so the next standard request opens a fresh
            // slab on top of it.
            self.offset = count;
        } else {
            // Splice below the current slab: the running cursor and every
            // saved offset keep their meaning.
            let last = self.slabs.len() - 1;
            self.slabs.insert(last, slab);
            self.current += 1;
        }
        self.rebuild_sorted();

        Some(base)
    }

    /// Releases a run previously returned by [`SlabPool::allocate`].
    ///
    /// The owning slab is the one whose base is the last base `<=`
    /// `pointer` in the sorted view. Its live count drops by one; at zero
    /// the slab is returned to the system and, if it was the current
    /// slab, the cursor resumes in the previous slab at its saved offset.
    /// Releasing a slab that is *not* current (an oversize slab, or a
    /// slab drained out of order) leaves the cursor alone.
    ///
    /// # Safety (logical)
    ///
    /// `pointer` must have been returned by `allocate` on this pool and
    /// not released yet. The pool cannot detect foreign pointers; the
    /// adapters' contracts forward this requirement.
    pub fn deallocate(&mut self, pointer: NonNull<T>) {
        let index = self.owner_of(pointer);

        self.slabs[index].live -= 1;
        if self.slabs[index].live > 0 {
            return;
        }

        let was_current = index == self.current;
        let slab = self.slabs.remove(index);
        unmap_slab(slab.base, slab.capacity);
        self.rebuild_sorted();

        if self.slabs.is_empty() {
            // Back to the empty form.
            self.current = NO_CURRENT;
            self.offset = 0;
            return;
        }

        // The removed slab sat at or below `current` in insertion order,
        // so after the removal shifted everything down this keeps
        // indexing the same slab, or the predecessor when the current
        // slab itself went away.
        self.current -= 1;
        if was_current {
            self.offset = self.slabs[self.current].saved_offset;
        }
    }

    /// Binary search of the sorted view: the owning slab is the last
    /// descriptor with base `<=` the pointer.
    fn owner_of(&self, pointer: NonNull<T>) -> usize {
        let address = pointer.as_ptr() as usize;
        let slabs = &self.slabs;
        let position = self
            .sorted
            .partition_point(|&index| slabs[index].base.as_ptr() as usize <= address);

        debug_assert!(position > 0, "released pointer was not allocated here");

        self.sorted[position - 1]
    }

    /// Recomputes the sorted view from `slabs` by projection and sort.
    /// Must run after every insertion or deletion in `slabs` before the
    /// next release; indices (not pointers) keep registry reallocation
    /// harmless.
    fn rebuild_sorted(&mut self) {
        self.sorted.clear();
        self.sorted.extend(0..self.slabs.len());

        let slabs = &self.slabs;
        self.sorted
            .sort_unstable_by_key(|&index| slabs[index].base.as_ptr() as usize);
    }

    /// Number of slabs currently held.
    #[cfg(test)]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Cursor in `T` slots into the current slab.
    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.offset
    }

    /// Whether the pool is back to its empty form.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty() && self.current == NO_CURRENT
    }
}

/// Requests a slab of `capacity` `T` slots from the system allocator.
/// Zero-sized `T` has no meaningful slab and yields the null sentinel.
fn map_slab<T>(capacity: usize) -> Pointer<T> {
    let layout = Layout::array::<T>(capacity).ok()?;
    if layout.size() == 0 {
        return None;
    }

    // SAFETY: non-zero size checked above.
    let base = NonNull::new(unsafe { alloc::alloc(layout) })?.cast::<T>();

    trace!(capacity, bytes = layout.size(), "mapped slab");

    Some(base)
}

/// Returns a slab to the system allocator.
fn unmap_slab<T>(base: NonNull<T>, capacity: usize) {
    trace!(capacity, "unmapped slab");

    // The layout was validated when the slab was mapped.
    let layout = Layout::array::<T>(capacity).unwrap();
    // SAFETY: `base` came from `map_slab` with the same layout.
    unsafe { alloc::dealloc(base.as_ptr().cast(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiny deterministic generator, enough to shuffle release orders.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound as u64) as usize
        }
    }

    #[test]
    fn fills_slabs_and_rolls_back() {
        let mut pool = SlabPool::<u64, 4>::default();

        let p1 = pool.allocate(3, false).unwrap();
        let p2 = pool.allocate(1, false).unwrap();

        // Same slab, contiguous.
        assert_eq!(p2.as_ptr(), unsafe { p1.as_ptr().add(3) });
        assert_eq!(pool.slab_count(), 1);

        // Doesn't fit: second slab opens.
        let p3 = pool.allocate(1, false).unwrap();
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(pool.cursor(), 1);

        // Releasing the second slab resumes the first, full at 4.
        pool.deallocate(p3);
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.cursor(), 4);

        pool.deallocate(p2);
        pool.deallocate(p1);
        assert!(pool.is_empty());
    }

    #[test]
    fn zero_count_is_the_null_sentinel() {
        let mut pool = SlabPool::<u32, 8>::default();

        assert!(pool.allocate(0, true).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn oversize_needs_the_extended_variant() {
        let mut pool = SlabPool::<u64, 4>::default();

        // Basic variant: null.
        assert!(pool.allocate(5, false).is_none());
        assert!(pool.is_empty());

        // Extended variant: a private slab of exactly 5 slots.
        let big = pool.allocate(5, true).unwrap();
        assert_eq!(pool.slab_count(), 1);

        // Subsequent normal allocations don't land in the oversize slab.
        let small = pool.allocate(2, true).unwrap();
        assert_eq!(pool.slab_count(), 2);
        assert_ne!(small, big);
        assert_eq!(pool.cursor(), 2);

        pool.deallocate(big);
        // The cursor in the standard slab was not disturbed.
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.cursor(), 2);

        pool.deallocate(small);
        assert!(pool.is_empty());
    }

    #[test]
    fn oversize_below_a_running_slab() {
        let mut pool = SlabPool::<u64, 4>::default();

        let small = pool.allocate(3, true).unwrap();
        let big = pool.allocate(9, true).unwrap();

        // The oversize slab was spliced below the current slab: bumping
        // continues where it left off.
        let more = pool.allocate(1, true).unwrap();
        assert_eq!(more.as_ptr(), unsafe { small.as_ptr().add(3) });
        assert_eq!(pool.slab_count(), 2);

        // Releasing the oversize run must not move the cursor either.
        pool.deallocate(big);
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.cursor(), 4);

        pool.deallocate(small);
        pool.deallocate(more);
        assert!(pool.is_empty());
    }

    #[test]
    fn release_decrements_the_owning_slab_only() {
        let mut pool = SlabPool::<u16, 4>::default();

        // Two full slabs.
        let a = pool.allocate(4, false).unwrap();
        let b = pool.allocate(4, false).unwrap();
        assert_eq!(pool.slab_count(), 2);

        // Interior pointers resolve to their own slab: releasing `b`
        // leaves slab `a` alone even though addresses interleave
        // arbitrarily.
        pool.deallocate(b);
        assert_eq!(pool.slab_count(), 1);

        // Slab `a` is still usable at its saved cursor (full).
        assert_eq!(pool.cursor(), 4);
        pool.deallocate(a);
        assert!(pool.is_empty());
    }

    #[test]
    fn lifo_reuses_one_slab() {
        let mut pool = SlabPool::<u64, 8>::default();

        // Strictly LIFO: one slab covers the peak working set, so the
        // pool never opens a second one.
        for _ in 0..100 {
            let a = pool.allocate(3, false).unwrap();
            let b = pool.allocate(5, false).unwrap();
            assert_eq!(pool.slab_count(), 1);
            pool.deallocate(b);
            pool.deallocate(a);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn random_release_orders_drain_to_empty() {
        let mut lcg = Lcg(0xfeed_f00d);

        for round in 0..20 {
            let mut pool = SlabPool::<u64, 4>::default();
            let mut outstanding = Vec::new();
            let mut slots = 0;

            for _ in 0..10 {
                let count = 1 + lcg.below(3);
                if let Some(pointer) = pool.allocate(count, false) {
                    outstanding.push(pointer);
                    slots += count;
                }

                // Every slab carries at least one outstanding call, and
                // a slab of 4 never holds more than 4 outstanding slots.
                assert!(pool.slab_count() <= outstanding.len());
                assert!(slots <= pool.slab_count() * 4, "round {round}");
            }

            // Release in a shuffled order.
            while !outstanding.is_empty() {
                let index = lcg.below(outstanding.len());
                let pointer = outstanding.swap_remove(index);
                pool.deallocate(pointer);
            }

            assert!(pool.is_empty(), "round {round}: slabs leaked");
        }
    }

    #[test]
    fn zero_sized_elements_are_rejected() {
        let mut pool = SlabPool::<(), 16>::default();

        assert!(pool.allocate(1, true).is_none());
        assert!(pool.is_empty());
    }
}
