use std::{mem, ptr::NonNull};

use tracing::debug;

use crate::{
    alignment::align_up,
    header::{ArenaHeader, ARENA_HEADER_SIZE},
    platform, Pointer,
};

// The packed header field below needs room for a granule count in its
// high half next to a full granularity value in the low half.
const _: () = assert!(
    mem::size_of::<usize>() >= 8,
    "the virtual arena requires a 64 bit usize"
);

/// Number of low bits of [`ArenaHeader::alignment`] holding the commit
/// granularity; the bits above hold the reserved ceiling in granularity
/// units. A bounded arena stores a plain alignment in that field, but a
/// virtual arena is always page aligned, so the field is free to carry
/// the two values [`VirtualArena::destroy`] and [`VirtualArena::grow`]
/// need instead.
const GRANULARITY_BITS: u32 = 32;

/// Growable bump arena backed by reserved virtual memory.
///
/// [`VirtualArena::create`] reserves a large range of address space
/// without backing storage and commits only a small prefix. When the
/// cursor runs past the committed prefix, [`VirtualArena::alloc`] commits
/// more (at least doubling each time to amortize the system calls) until
/// the reserved ceiling is reached, at which point allocations fail
/// for good. Committed memory is never returned until
/// [`VirtualArena::destroy`] releases the entire range in one call.
///
/// The committed prefix is always granularity-aligned and the uncommitted
/// tail is never touched, so a fault past the cursor means a caller bug,
/// not an allocator one.
///
/// Like [`crate::RawArena`], the handle is a copyable user base pointer
/// and all operations are `unsafe` with a "must be live" contract.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VirtualArena {
    user: NonNull<u8>,
}

impl VirtualArena {
    /// Reserves `reserve_size` bytes of address space and commits the
    /// first `initial_size` (both rounded up to the allocation
    /// granularity; the commit includes the header). Returns `None` if
    /// the reservation fails or the initial commit would not fit under
    /// the rounded reservation.
    pub fn create(reserve_size: usize, initial_size: usize) -> Option<VirtualArena> {
        let granularity = platform::allocation_granularity();
        let reserved = align_up(reserve_size, granularity);
        let committed = align_up(initial_size.max(1), granularity);

        if committed > reserved {
            return None;
        }

        // SAFETY: lengths are granularity-aligned and non-zero.
        let base = unsafe { platform::reserve(reserved) }?;
        if unsafe { !platform::commit(base, committed) } {
            unsafe { platform::release(base, reserved) };
            return None;
        }

        let units = reserved / granularity;
        let user = unsafe { NonNull::new_unchecked(base.as_ptr().add(ARENA_HEADER_SIZE)) };
        unsafe {
            ArenaHeader::below(user).as_ptr().write(ArenaHeader {
                alignment: (units << GRANULARITY_BITS) | granularity,
                total_size: committed,
                user_size: committed - ARENA_HEADER_SIZE,
                offset: 0,
            });
        }

        debug!(reserved, committed, granularity, "reserved virtual arena");

        Some(VirtualArena { user })
    }

    /// Commits the next `ceil(requested / granularity) * granularity`
    /// bytes. Returns the number of bytes added, or 0 when the new
    /// committed prefix would exceed the reserved ceiling or the system
    /// refuses the commit; the arena is unchanged on failure.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    pub unsafe fn grow(self, requested: usize) -> usize {
        let header = &mut *ArenaHeader::below(self.user).as_ptr();
        let granularity = header.alignment & ((1 << GRANULARITY_BITS) - 1);
        let ceiling = (header.alignment >> GRANULARITY_BITS) * granularity;

        let new_total = align_up(header.total_size + requested, granularity);
        if new_total > ceiling {
            return 0;
        }

        let grown = new_total - header.total_size;
        let base = self.user.as_ptr().sub(ARENA_HEADER_SIZE);
        let tail = NonNull::new_unchecked(base.add(header.total_size));
        if !platform::commit(tail, grown) {
            return 0;
        }

        header.total_size = new_total;
        header.user_size += grown;

        debug!(grown, total = new_total, "grew virtual arena");

        grown
    }

    /// Allocates `count` contiguous `T` slots like [`crate::RawArena::alloc`],
    /// but on overflow first tries to grow the committed prefix by
    /// `max(total_size, shortfall)`, which doubles the arena while
    /// requests stay small. Only fails when [`VirtualArena::grow`] fails.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    pub unsafe fn alloc<T>(self, count: usize) -> Pointer<T> {
        let needed = count * mem::size_of::<T>();

        let header = &*ArenaHeader::below(self.user).as_ptr();
        if header.offset + needed >= header.user_size {
            let shortfall = header.offset + needed - header.user_size;
            let request = shortfall.max(header.total_size);
            if self.grow(request) == 0 {
                return None;
            }
        }

        // The grow above committed at least `shortfall` more bytes, so
        // this cannot run past the committed prefix.
        let header = &mut *ArenaHeader::below(self.user).as_ptr();
        let pointer = self.user.as_ptr().add(header.offset);
        header.offset += needed;

        Some(NonNull::new_unchecked(pointer.cast()))
    }

    /// Releases the entire reserved range in one call, committed and
    /// uncommitted parts alike. No destructors run.
    ///
    /// # Safety
    ///
    /// The arena must be live and no copy of this handle may be used
    /// afterwards.
    pub unsafe fn destroy(self) {
        let header = *ArenaHeader::below(self.user).as_ptr();
        let granularity = header.alignment & ((1 << GRANULARITY_BITS) - 1);
        let reserved = (header.alignment >> GRANULARITY_BITS) * granularity;
        let base = self.user.as_ptr().sub(header.total_size - header.user_size);

        debug!(reserved, "released virtual arena");

        platform::release(NonNull::new_unchecked(base), reserved);
    }

    /// Borrows the arena header for introspection. Note the packed
    /// meaning of [`ArenaHeader::alignment`] described on
    /// [`GRANULARITY_BITS`].
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::RawArena::header`].
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a ArenaHeader {
        ArenaHeader::below(self.user).as_ref()
    }

    /// Resets the cursor to 0 without decommitting anything.
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::RawArena::clear`].
    #[inline]
    pub unsafe fn clear(self) {
        (*ArenaHeader::below(self.user).as_ptr()).offset = 0;
    }

    /// Current cursor in bytes from the user base.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn offset(self) -> usize {
        (*ArenaHeader::below(self.user).as_ptr()).offset
    }

    /// Restores a cursor previously read with [`VirtualArena::offset`].
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::RawArena::set_offset`].
    #[inline]
    pub unsafe fn set_offset(self, offset: usize) {
        (*ArenaHeader::below(self.user).as_ptr()).offset = offset;
    }

    /// Remaining committed capacity in `T` slots. Growth can raise this;
    /// use the header's ceiling to reason about the hard limit.
    ///
    /// # Safety
    ///
    /// The arena must be live.
    #[inline]
    pub unsafe fn free_slots<T>(self) -> usize {
        let header = self.header();

        (header.user_size - header.offset) / mem::size_of::<T>()
    }
}

// Same reasoning as for `RawArena`.
unsafe impl Send for VirtualArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_hits_the_ceiling() {
        let granularity = platform::allocation_granularity();

        // Reserve 256 granules, commit one.
        let arena = VirtualArena::create(256 * granularity, granularity).unwrap();

        unsafe {
            assert_eq!(arena.header().total_size, granularity);

            // Allocate 1.25 granules: overflow, the arena doubles.
            let pointer = arena.alloc::<u8>(granularity + granularity / 4).unwrap();
            pointer.as_ptr().write(69);
            assert_eq!(arena.header().total_size, 2 * granularity);

            // totalSize is non-decreasing across successful allocations
            // and never exceeds the reserved ceiling.
            let mut previous = arena.header().total_size;
            while let Some(run) = arena.alloc::<u8>(granularity) {
                run.as_ptr().write(42);
                let total = arena.header().total_size;
                assert!(total >= previous);
                assert!(total <= 256 * granularity);
                previous = total;
            }

            // The ceiling was reached: allocation failed and the
            // committed prefix did not move.
            assert_eq!(arena.header().total_size, previous);
            assert!(arena.alloc::<u8>(granularity).is_none());

            arena.destroy();
        }
    }

    #[test]
    fn grow_past_ceiling_fails() {
        let granularity = platform::allocation_granularity();
        let arena = VirtualArena::create(2 * granularity, granularity).unwrap();

        unsafe {
            assert_eq!(arena.grow(3 * granularity), 0);
            assert_eq!(arena.header().total_size, granularity);

            // Growing within the ceiling still works afterwards.
            assert_eq!(arena.grow(1), granularity);
            assert_eq!(arena.header().total_size, 2 * granularity);

            arena.destroy();
        }
    }

    #[test]
    fn committed_prefix_is_granularity_aligned() {
        let granularity = platform::allocation_granularity();
        let arena = VirtualArena::create(8 * granularity, granularity / 2).unwrap();

        unsafe {
            assert_eq!(arena.header().total_size % granularity, 0);

            arena.alloc::<u64>(granularity / 4).unwrap();
            assert_eq!(arena.header().total_size % granularity, 0);

            arena.destroy();
        }
    }

    #[test]
    fn initial_commit_cannot_exceed_reservation() {
        let granularity = platform::allocation_granularity();

        assert!(VirtualArena::create(granularity, 3 * granularity).is_none());
    }

    #[test]
    fn clear_and_checkpoint() {
        let granularity = platform::allocation_granularity();
        let arena = VirtualArena::create(4 * granularity, granularity).unwrap();

        unsafe {
            let base = arena.alloc::<u32>(16).unwrap();
            let checkpoint = arena.offset();
            arena.alloc::<u32>(16).unwrap();

            arena.set_offset(checkpoint);
            assert_eq!(arena.offset(), 64);

            arena.clear();
            assert_eq!(arena.offset(), 0);
            assert_eq!(arena.alloc::<u32>(1).unwrap(), base);

            arena.destroy();
        }
    }
}
