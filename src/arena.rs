use std::{
    alloc::{self, Layout},
    mem,
    ptr::{self, NonNull},
};

use tracing::trace;

use crate::{
    alignment::align_up,
    header::{self, ArenaHeader},
    Pointer,
};

/// Handle to a bounded bump arena: one contiguous system allocation with
/// an [`ArenaHeader`] below the user base and a monotonic cursor inside.
///
/// The handle is just the user base pointer, so it is `Copy` and as cheap
/// to pass around as `*mut u8`. That also means the compiler cannot track
/// ownership for us: every operation except [`RawArena::create`] is
/// `unsafe` and requires that the region has not been destroyed yet. For
/// an owned handle with safe methods see [`crate::Region`].
///
/// Individual deallocation is a no-op by design; the region is a unit of
/// collective reclamation. [`RawArena::clear`] rewinds the cursor in O(1)
/// and runs no destructors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RawArena {
    user: NonNull<u8>,
}

impl RawArena {
    /// Creates an arena with `size` bytes of bump space, aligned to the
    /// header's own alignment. Returns `None` if the system allocator
    /// fails.
    pub fn create(size: usize) -> Option<RawArena> {
        Self::create_aligned(size, mem::align_of::<ArenaHeader>())
    }

    /// Creates an arena with `size` bytes of bump space whose user base
    /// is aligned to `align`. The header is placed in the padding bytes
    /// right below the user base, so single-type allocations of any `T`
    /// with `align_of::<T>() <= align` land aligned without per-request
    /// cursor fixups.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn create_aligned(size: usize, align: usize) -> Option<RawArena> {
        assert!(align.is_power_of_two(), "arena alignment must be a power of 2");

        let padding = header::padding_for(align);
        let align = header::effective_align(align);
        let layout = Layout::from_size_align(size.checked_add(padding)?, align).ok()?;

        // SAFETY: layout size is at least the header padding, never zero.
        let base = NonNull::new(unsafe { alloc::alloc(layout) })?;

        // SAFETY: the allocation is `padding + size` bytes, so the user
        // base and the header slot right below it are both in bounds.
        let user = unsafe { NonNull::new_unchecked(base.as_ptr().add(padding)) };
        unsafe {
            ArenaHeader::below(user).as_ptr().write(ArenaHeader {
                alignment: align,
                total_size: size + padding,
                user_size: size,
                offset: 0,
            });
        }

        trace!(size, align, "created arena");

        Some(RawArena { user })
    }

    /// Rebuilds a handle from a user base pointer previously obtained
    /// through [`RawArena::user_base`].
    ///
    /// # Safety
    ///
    /// `user` must be the user base of a live arena created by this
    /// crate.
    #[inline]
    pub unsafe fn from_user_base(user: NonNull<u8>) -> RawArena {
        RawArena { user }
    }

    /// The user base pointer this handle wraps.
    #[inline]
    pub fn user_base(self) -> NonNull<u8> {
        self.user
    }

    /// Returns the underlying system allocation. The caller must have
    /// released every object stored in the region; no destructors run.
    ///
    /// # Safety
    ///
    /// The arena must be live and no copy of this handle may be used
    /// afterwards.
    pub unsafe fn destroy(self) {
        let header = *ArenaHeader::below(self.user).as_ptr();
        let padding = header.total_size - header.user_size;
        let base = self.user.as_ptr().sub(padding);

        trace!(size = header.user_size, "destroyed arena");

        alloc::dealloc(
            base,
            Layout::from_size_align_unchecked(header.total_size, header.alignment),
        );
    }

    /// Borrows the arena header for introspection.
    ///
    /// # Safety
    ///
    /// The arena must be live, and the reference must be dropped before
    /// any other operation mutates the arena.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a ArenaHeader {
        ArenaHeader::below(self.user).as_ref()
    }

    /// Resets the cursor to 0. O(1), runs no destructors.
    ///
    /// # Safety
    ///
    /// The arena must be live. Previously returned pointers become
    /// eligible for reuse, so no live references into the arena may
    /// remain.
    #[inline]
    pub unsafe fn clear(self) {
        (*ArenaHeader::below(self.user).as_ptr()).offset = 0;
    }

    /// Current cursor in bytes from the user base. Together with
    /// [`RawArena::set_offset`] this gives scoped scratch semantics:
    /// checkpoint, allocate freely, restore.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn offset(self) -> usize {
        (*ArenaHeader::below(self.user).as_ptr()).offset
    }

    /// Restores a cursor previously read with [`RawArena::offset`].
    ///
    /// # Safety
    ///
    /// The arena must be live and `offset` must not exceed the value the
    /// cursor had when it was read, or allocations handed out since the
    /// checkpoint will be handed out again.
    #[inline]
    pub unsafe fn set_offset(self, offset: usize) {
        (*ArenaHeader::below(self.user).as_ptr()).offset = offset;
    }

    /// Shared bump path. Advances the cursor by `needed` bytes, first
    /// realigning it to `realign_to` (pass 1 for the single-type shape),
    /// and returns the pre-advance position. With `checked` the request
    /// fails with `None` when it would reach the end of the region.
    #[inline]
    pub(crate) unsafe fn bump(self, needed: usize, realign_to: usize, checked: bool) -> Pointer<u8> {
        let header = &mut *ArenaHeader::below(self.user).as_ptr();
        let base = self.user.as_ptr() as usize;

        let cursor = if realign_to > 1 {
            align_up(base + header.offset, realign_to)
        } else {
            base + header.offset
        };

        if checked && cursor + needed >= base + header.user_size {
            return None;
        }

        header.offset = cursor + needed - base;

        Some(NonNull::new_unchecked(cursor as *mut u8))
    }

    /// Allocates `count` contiguous `T` slots, bounds-checked. Returns
    /// `None` when the request does not fit in the remaining space.
    ///
    /// The arena does not realign: the returned pointer is aligned for
    /// `T` provided the region was created with at least `align_of::<T>()`
    /// and only `T` runs are carved from it. For mixed element types use
    /// [`RawArena::alloc_multi`].
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn alloc<T>(self, count: usize) -> Pointer<T> {
        self.bump(count * mem::size_of::<T>(), 1, true)
            .map(NonNull::cast)
    }

    /// Like [`RawArena::alloc`] without the bounds check.
    ///
    /// # Safety
    ///
    /// The arena must be live and the caller must have verified via
    /// [`RawArena::free_slots`] that `count` slots fit.
    #[inline]
    pub unsafe fn alloc_unchecked<T>(self, count: usize) -> NonNull<T> {
        // `bump` is infallible when unchecked.
        self.bump(count * mem::size_of::<T>(), 1, false)
            .unwrap_unchecked()
            .cast()
    }

    /// Allocates `count` contiguous `T` slots after realigning the cursor
    /// up to `align_of::<T>()`, so arbitrary element types can share the
    /// region. Bounds-checked.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn alloc_multi<T>(self, count: usize) -> Pointer<T> {
        self.bump(count * mem::size_of::<T>(), mem::align_of::<T>(), true)
            .map(NonNull::cast)
    }

    /// Like [`RawArena::alloc_multi`] without the bounds check.
    ///
    /// # Safety
    ///
    /// The arena must be live and the caller must have verified via
    /// [`RawArena::free_slots_multi`] that `count` slots fit.
    #[inline]
    pub unsafe fn alloc_multi_unchecked<T>(self, count: usize) -> NonNull<T> {
        self.bump(count * mem::size_of::<T>(), mem::align_of::<T>(), false)
            .unwrap_unchecked()
            .cast()
    }

    /// Remaining capacity in `T` slots for the single-type shape.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn free_slots<T>(self) -> usize {
        let header = self.header();

        (header.user_size - header.offset) / mem::size_of::<T>()
    }

    /// Remaining capacity in `T` slots for the multi-type shape,
    /// accounting for the padding a realigning allocation would insert at
    /// the current cursor.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn free_slots_multi<T>(self) -> usize {
        let header = self.header();
        let base = self.user.as_ptr() as usize;
        let aligned = align_up(base + header.offset, mem::align_of::<T>());

        (base + header.user_size).saturating_sub(aligned) / mem::size_of::<T>()
    }

    /// Rewinds the cursor by `count` `T` slots, clamping at 0.
    ///
    /// # Safety
    ///
    /// The arena must be live. The rewound range becomes eligible for
    /// reuse.
    #[inline]
    pub unsafe fn step_back<T>(self, count: usize) {
        let header = &mut *ArenaHeader::below(self.user).as_ptr();

        header.offset = header.offset.saturating_sub(count * mem::size_of::<T>());
    }

    /// Like [`RawArena::step_back`] without the clamp.
    ///
    /// # Safety
    ///
    /// The arena must be live and the cursor must currently be at least
    /// `count * size_of::<T>()` bytes in.
    #[inline]
    pub unsafe fn step_back_unchecked<T>(self, count: usize) {
        let header = &mut *ArenaHeader::below(self.user).as_ptr();

        header.offset -= count * mem::size_of::<T>();
    }

    /// Allocates `count` slots with [`RawArena::alloc`] and
    /// clone-initializes each one with `value`. The matching teardown is
    /// [`destroy_slice`]; the arena never runs destructors on its own.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    pub unsafe fn construct<T: Clone>(self, count: usize, value: T) -> Pointer<T> {
        let data = self.alloc::<T>(count)?;
        for i in 0..count {
            data.as_ptr().add(i).write(value.clone());
        }

        Some(data)
    }

    /// Allocates `count` slots with [`RawArena::alloc`] and initializes
    /// slot `i` with `init(i)`.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    pub unsafe fn construct_with<T>(
        self,
        count: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Pointer<T> {
        let data = self.alloc::<T>(count)?;
        for i in 0..count {
            data.as_ptr().add(i).write(init(i));
        }

        Some(data)
    }

    /// Multi-type counterpart of [`RawArena::construct`].
    ///
    /// # Safety
    ///
    /// The arena must be live.
    pub unsafe fn construct_multi<T: Clone>(self, count: usize, value: T) -> Pointer<T> {
        let data = self.alloc_multi::<T>(count)?;
        for i in 0..count {
            data.as_ptr().add(i).write(value.clone());
        }

        Some(data)
    }
}

// The handle is a plain pointer into memory it does not uniquely own;
// whoever coordinates arena access can move handles across threads.
unsafe impl Send for RawArena {}

/// Runs the destructor of `count` `T`s starting at `pointer`. Arenas
/// never drop the values stored in them, so callers that put `Drop` types
/// into a region pair their `construct` calls with this before the region
/// goes away.
///
/// # Safety
///
/// `pointer` must point at `count` initialized, not-yet-dropped `T`s.
pub unsafe fn destroy_slice<T>(pointer: NonNull<T>, count: usize) {
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(pointer.as_ptr(), count));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_bounds() {
        unsafe {
            let arena = RawArena::create(64).unwrap();

            let first = arena.alloc::<u64>(3).unwrap();
            let second = arena.alloc::<u64>(2).unwrap();

            // Contiguous, disjoint runs.
            assert_eq!(second.as_ptr(), first.as_ptr().add(3));
            assert_eq!(arena.offset(), 40);

            // An allocation that would exactly fill the region fails;
            // the cursor is untouched by failed requests.
            assert!(arena.alloc::<u64>(3).is_none());
            assert_eq!(arena.offset(), 40);

            let third = arena.alloc::<u64>(2).unwrap();
            for i in 0..2 {
                third.as_ptr().add(i).write(i as u64);
            }

            arena.destroy();
        }
    }

    #[test]
    fn multi_type_realigns() {
        unsafe {
            let arena = RawArena::create(64).unwrap();

            let _small = arena.alloc_multi::<u32>(1).unwrap();
            assert_eq!(arena.offset(), 4);

            // The cursor realigns to 8 before the 8-byte bump.
            let big = arena.alloc_multi::<u64>(1).unwrap();
            assert_eq!(arena.offset(), 16);
            assert_eq!(big.as_ptr() as usize % mem::align_of::<u64>(), 0);

            assert_eq!(arena.free_slots_multi::<u64>(), 6);

            arena.destroy();
        }
    }

    #[test]
    fn clear_is_idempotent() {
        unsafe {
            let arena = RawArena::create(128).unwrap();
            let base = arena.alloc::<u8>(100).unwrap();

            arena.clear();
            assert_eq!(arena.offset(), 0);

            // Next allocation returns the arena's base again.
            assert_eq!(arena.alloc::<u8>(1).unwrap(), base);

            arena.clear();
            arena.clear();
            assert_eq!(arena.offset(), 0);

            arena.destroy();
        }
    }

    #[test]
    fn checkpoint_and_step_back() {
        unsafe {
            let arena = RawArena::create(256).unwrap();

            let _persistent = arena.alloc::<u32>(4).unwrap();
            let checkpoint = arena.offset();

            let _scratch = arena.alloc::<u32>(32).unwrap();
            arena.set_offset(checkpoint);
            assert_eq!(arena.offset(), 16);

            arena.step_back::<u32>(2);
            assert_eq!(arena.offset(), 8);

            // The safe variant clamps at 0.
            arena.step_back::<u32>(100);
            assert_eq!(arena.offset(), 0);

            arena.destroy();
        }
    }

    #[test]
    fn unchecked_after_free_slots() {
        unsafe {
            let arena = RawArena::create(64).unwrap();

            let slots = arena.free_slots::<u16>();
            assert!(slots >= 4);

            let run = arena.alloc_unchecked::<u16>(4);
            for i in 0..4 {
                run.as_ptr().add(i).write(i as u16);
            }
            assert_eq!(arena.offset(), 8);

            arena.destroy();
        }
    }

    #[test]
    fn aligned_creation() {
        unsafe {
            for align in [8, 16, 64, 256] {
                let arena = RawArena::create_aligned(96, align).unwrap();
                assert_eq!(arena.user_base().as_ptr() as usize % align, 0);
                assert_eq!(arena.header().user_size, 96);
                arena.destroy();
            }
        }
    }

    #[test]
    fn construct_and_destroy_values() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Clone)]
        struct Counted(#[allow(dead_code)] u32);

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        unsafe {
            let arena = RawArena::create(256).unwrap();

            let values = arena.construct::<Counted>(5, Counted(7)).unwrap();
            let more = arena.construct_with::<u32>(3, |i| i as u32).unwrap();
            assert_eq!(*more.as_ptr().add(2), 2);

            // The clone source itself has already dropped by now.
            let baseline = DROPS.load(Ordering::Relaxed);
            destroy_slice(values, 5);
            assert_eq!(DROPS.load(Ordering::Relaxed), baseline + 5);

            arena.destroy();
        }
    }
}
