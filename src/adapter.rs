use std::{
    alloc::{AllocError, Allocator, Layout},
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    arena::RawArena,
    region::Region,
    shell::{self, Shell, SingleThread, ThreadSafe},
    slab::SlabPool,
    AllocResult, Pointer,
};

/// Arena safety tag: allocating operations bound-check against the
/// region and return the null sentinel on exhaustion.
pub struct Checked;

/// Arena safety tag: allocating operations skip the bounds check. The
/// caller promises to consult `free_slots` first; adapters built with
/// this tag are only reachable through `unsafe` constructors.
pub struct Unchecked;

/// Arena shape tag: the region holds a single element type, so the
/// cursor is never realigned. Pointers come out aligned because the
/// region was created with the element's alignment and every run is a
/// whole number of elements.
pub struct SingleType;

/// Arena shape tag: arbitrary element types share the region, so every
/// allocation first realigns the cursor up to the request's alignment.
pub struct MultiType;

/// Construction tag: lifetimes of the stored values are entirely the
/// caller's business. The allocator moves bytes, nothing else.
pub struct NoConstruct;

/// Construction tag: the allocator offers `construct`, and `dealloc`
/// runs the destructors of the released run before returning it.
pub struct Construct;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Checked {}
    impl Sealed for super::Unchecked {}
    impl Sealed for super::SingleType {}
    impl Sealed for super::MultiType {}
    impl Sealed for super::NoConstruct {}
    impl Sealed for super::Construct {}
}

/// Compile-time safety axis, see [`Checked`] and [`Unchecked`].
pub trait Safety: sealed::Sealed + 'static {
    const CHECKED: bool;
}

impl Safety for Checked {
    const CHECKED: bool = true;
}

impl Safety for Unchecked {
    const CHECKED: bool = false;
}

/// Compile-time shape axis, see [`SingleType`] and [`MultiType`].
pub trait Shape: sealed::Sealed + 'static {
    const REALIGN: bool;
}

impl Shape for SingleType {
    const REALIGN: bool = false;
}

impl Shape for MultiType {
    const REALIGN: bool = true;
}

/// Compile-time construction axis, see [`NoConstruct`] and [`Construct`].
pub trait Construction: sealed::Sealed + 'static {
    const RUNS_DROPS: bool;
}

impl Construction for NoConstruct {
    const RUNS_DROPS: bool = false;
}

impl Construction for Construct {
    const RUNS_DROPS: bool = true;
}

/// Number of `T` slots described by `layout`, or `None` when the layout
/// doesn't describe an array of `T` this allocator family can serve.
fn slots_of<T>(layout: Layout) -> Option<usize> {
    let size = mem::size_of::<T>();
    if size == 0 || layout.size() % size != 0 || layout.align() > mem::align_of::<T>() {
        return None;
    }

    Some(layout.size() / size)
}

/// Container-facing handle of the slab-backed block allocator.
///
/// All handles of one instantiation `<T, SLOTS, S, C, OVERSIZE, UID>`
/// share a single process-wide slab pool behind the concurrency shell
/// `S`, so the handle itself is an empty `Copy` token and equality is
/// trivially true, the propagation story containers expect from an
/// always-equal allocator. Distinct `UID`s mint fully independent
/// families of the same element type and slab size.
///
/// `OVERSIZE` selects the extended variant: requests larger than `SLOTS`
/// get a private one-off slab instead of failing.
///
/// # Examples
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use carve::BlockAlloc;
///
/// type StringSlots = BlockAlloc<u8, 512_000>;
///
/// let mut buffer = Vec::new_in(StringSlots::new());
/// buffer.extend_from_slice(b"carved");
/// assert_eq!(&buffer[..], b"carved");
/// ```
pub struct BlockAlloc<
    T,
    const SLOTS: usize,
    S: Shell = ThreadSafe,
    C = NoConstruct,
    const OVERSIZE: bool = true,
    const UID: usize = 0,
> {
    marker: PhantomData<fn() -> (T, S, C)>,
}

impl<T, const SLOTS: usize, C, const OVERSIZE: bool, const UID: usize>
    BlockAlloc<T, SLOTS, ThreadSafe, C, OVERSIZE, UID>
{
    /// Builds a handle to the thread-safe family. Every operation takes
    /// the family's lock, so handles can be used from any thread.
    pub const fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T, const SLOTS: usize, C, const OVERSIZE: bool, const UID: usize>
    BlockAlloc<T, SLOTS, SingleThread, C, OVERSIZE, UID>
{
    /// Builds a handle to the lock-free single-threaded family.
    ///
    /// # Safety
    ///
    /// Every handle of this instantiation, including copies of this one,
    /// must only ever be used from one thread. The family's state is
    /// process-wide and completely unsynchronized.
    pub const unsafe fn new_unchecked() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T, const SLOTS: usize, S, C, const OVERSIZE: bool, const UID: usize>
    BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
where
    T: Send + 'static,
    S: Shell,
    C: Construction,
{
    /// The family's shared pool, created on first touch.
    fn pool() -> &'static S::Wrap<SlabPool<T, SLOTS>> {
        shell::state::<Self, S::Wrap<SlabPool<T, SLOTS>>>()
    }

    /// The UID distinguishing this family from others with the same
    /// element type and slab size.
    pub const fn uid(&self) -> usize {
        UID
    }

    /// Allocates a run of `count` contiguous `T` slots. Returns the null
    /// sentinel for zero-size requests, oversize requests in the basic
    /// variant, and system allocation failure.
    pub fn alloc(&self, count: usize) -> Pointer<T> {
        S::with(Self::pool(), |pool| pool.allocate(count, OVERSIZE))
    }

    /// Releases a run previously returned by [`BlockAlloc::alloc`] (or
    /// [`BlockAlloc::construct`]). Under the [`Construct`] tag the
    /// destructors of all `count` values run first.
    ///
    /// # Safety
    ///
    /// `pointer` must be exactly a pointer returned by this family's
    /// `alloc` and not yet released; `count` must be the length that was
    /// allocated. Sub-ranges of a run cannot be released.
    pub unsafe fn dealloc(&self, pointer: NonNull<T>, count: usize) {
        S::with(Self::pool(), |pool| {
            if C::RUNS_DROPS {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(pointer.as_ptr(), count));
            }
            pool.deallocate(pointer);
        });
    }
}

impl<T, const SLOTS: usize, S, const OVERSIZE: bool, const UID: usize>
    BlockAlloc<T, SLOTS, S, Construct, OVERSIZE, UID>
where
    T: Send + Clone + 'static,
    S: Shell,
{
    /// Allocates `count` slots and clone-initializes each one with
    /// `value`. Release with [`BlockAlloc::dealloc`], which runs the
    /// destructors under this tag.
    pub fn construct(&self, count: usize, value: T) -> Pointer<T> {
        let data = self.alloc(count)?;
        for i in 0..count {
            // SAFETY: `alloc` reserved `count` slots.
            unsafe { data.as_ptr().add(i).write(value.clone()) };
        }

        Some(data)
    }
}

// A handle to a `Construct` family cannot implement `Allocator`:
// containers drop their elements themselves before calling `deallocate`,
// and the tag would run the destructors a second time.
unsafe impl<T, const SLOTS: usize, S, const OVERSIZE: bool, const UID: usize> Allocator
    for BlockAlloc<T, SLOTS, S, NoConstruct, OVERSIZE, UID>
where
    T: Send + 'static,
    S: Shell,
{
    fn allocate(&self, layout: Layout) -> AllocResult {
        let count = slots_of::<T>(layout).ok_or(AllocError)?;

        match self.alloc(count) {
            Some(address) => Ok(NonNull::slice_from_raw_parts(
                address.cast::<u8>(),
                count * mem::size_of::<T>(),
            )),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
        let count = layout.size() / mem::size_of::<T>();

        self.dealloc(address.cast(), count);
    }
}

impl<T, const SLOTS: usize, S: Shell, C, const OVERSIZE: bool, const UID: usize> Clone
    for BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const SLOTS: usize, S: Shell, C, const OVERSIZE: bool, const UID: usize> Copy
    for BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
{
}

impl<T, const SLOTS: usize, S: Shell, C, const OVERSIZE: bool, const UID: usize> PartialEq
    for BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
{
    /// All handles of one instantiation share one pool.
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl<T, const SLOTS: usize, S: Shell, C, const OVERSIZE: bool, const UID: usize> Eq
    for BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
{
}

impl<T, const SLOTS: usize, S: Shell, C, const OVERSIZE: bool, const UID: usize> fmt::Debug
    for BlockAlloc<T, SLOTS, S, C, OVERSIZE, UID>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAlloc").field("uid", &UID).finish()
    }
}

impl<T, const SLOTS: usize, C, const OVERSIZE: bool, const UID: usize> Default
    for BlockAlloc<T, SLOTS, ThreadSafe, C, OVERSIZE, UID>
{
    fn default() -> Self {
        Self::new()
    }
}

/// Container-facing adapter over an externally-owned [`Region`].
///
/// The adapter borrows the region, so the borrow checker enforces the
/// lifetime rule instead of a comment: the region must outlive every
/// adapter and every container using it. Two adapters compare equal iff
/// they borrow the same region. Copying the adapter copies the
/// reference, never the region.
///
/// Deallocation through this adapter is a no-op; the region reclaims
/// collectively when it is dropped or cleared.
pub struct RegionAlloc<'a, S: Safety = Checked, M: Shape = MultiType> {
    region: &'a Region,
    marker: PhantomData<fn() -> (S, M)>,
}

impl<'a, M: Shape> RegionAlloc<'a, Checked, M> {
    /// Adapts `region` with bounds-checked allocation.
    pub fn new(region: &'a Region) -> Self {
        Self {
            region,
            marker: PhantomData,
        }
    }
}

impl<'a, M: Shape> RegionAlloc<'a, Unchecked, M> {
    /// Adapts `region` with unchecked allocation.
    ///
    /// # Safety
    ///
    /// Every allocation made through this adapter must fit in the
    /// region's remaining capacity; the caller verifies that via
    /// [`RegionAlloc::free_slots`] (or bounds the total up front).
    pub unsafe fn new_unchecked(region: &'a Region) -> Self {
        Self {
            region,
            marker: PhantomData,
        }
    }
}

impl<'a, S: Safety, M: Shape> RegionAlloc<'a, S, M> {
    /// The borrowed region.
    pub fn region(&self) -> &'a Region {
        self.region
    }

    /// Allocates `count` contiguous `T` slots under this adapter's tags.
    pub fn alloc<T>(&self, count: usize) -> Pointer<T> {
        let realign = if M::REALIGN { mem::align_of::<T>() } else { 1 };

        self.region
            .bump(count * mem::size_of::<T>(), realign, S::CHECKED)
            .map(NonNull::cast)
    }

    /// Remaining capacity in `T` slots under this adapter's shape.
    pub fn free_slots<T>(&self) -> usize {
        if M::REALIGN {
            self.region.free_slots_multi::<T>()
        } else {
            self.region.free_slots::<T>()
        }
    }

    /// Rewinds the cursor by `count` `T` slots; the [`Checked`] flavor
    /// clamps at zero.
    pub fn step_back<T>(&self, count: usize) {
        if S::CHECKED {
            self.region.step_back::<T>(count);
        } else {
            // SAFETY: the `Unchecked` constructor contract puts cursor
            // discipline on the caller.
            unsafe { self.region.step_back_unchecked::<T>(count) };
        }
    }

    /// Resets the region's cursor. See [`Region::clear`].
    pub fn clear(&self) {
        self.region.clear();
    }
}

unsafe impl<S: Safety, M: Shape> Allocator for RegionAlloc<'_, S, M> {
    fn allocate(&self, layout: Layout) -> AllocResult {
        let realign = if M::REALIGN { layout.align() } else { 1 };

        match self.region.bump(layout.size(), realign, S::CHECKED) {
            Some(address) => Ok(NonNull::slice_from_raw_parts(address, layout.size())),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, _address: NonNull<u8>, _layout: Layout) {
        // Individual releases are no-ops; the region is a unit of
        // collective reclamation.
    }
}

impl<S: Safety, M: Shape> Clone for RegionAlloc<'_, S, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Safety, M: Shape> Copy for RegionAlloc<'_, S, M> {}

impl<S: Safety, M: Shape> PartialEq for RegionAlloc<'_, S, M> {
    /// Equal iff both adapters borrow the same region.
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.region, other.region)
    }
}

impl<S: Safety, M: Shape> Eq for RegionAlloc<'_, S, M> {}

impl<S: Safety, M: Shape> fmt::Debug for RegionAlloc<'_, S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAlloc")
            .field("region", &(self.region as *const Region))
            .finish()
    }
}

/// Container-facing adapter over a [`RawArena`] handle.
///
/// Unlike [`RegionAlloc`] there is no owner to borrow from (the handle
/// is a bare pointer), so construction is `unsafe` and liveness is the
/// caller's promise, mirroring the raw arena itself. Two adapters
/// compare equal iff they wrap the same arena.
pub struct ArenaAlloc<S: Safety = Checked, M: Shape = MultiType> {
    arena: RawArena,
    marker: PhantomData<fn() -> (S, M)>,
}

impl<M: Shape> ArenaAlloc<Checked, M> {
    /// Adapts `arena` with bounds-checked allocation.
    ///
    /// # Safety
    ///
    /// `arena` must stay live for as long as this adapter (or any copy
    /// of it, or any container using it) exists, and the arena must not
    /// be bumped from multiple threads.
    pub unsafe fn new(arena: RawArena) -> Self {
        Self {
            arena,
            marker: PhantomData,
        }
    }
}

impl<M: Shape> ArenaAlloc<Unchecked, M> {
    /// Adapts `arena` with unchecked allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`ArenaAlloc::new`], plus every allocation must
    /// fit in the remaining capacity as verified via
    /// [`ArenaAlloc::free_slots`].
    pub unsafe fn new_unchecked(arena: RawArena) -> Self {
        Self {
            arena,
            marker: PhantomData,
        }
    }
}

impl<S: Safety, M: Shape> ArenaAlloc<S, M> {
    /// The wrapped arena handle.
    pub fn arena(&self) -> RawArena {
        self.arena
    }

    /// Allocates `count` contiguous `T` slots under this adapter's tags.
    pub fn alloc<T>(&self, count: usize) -> Pointer<T> {
        let realign = if M::REALIGN { mem::align_of::<T>() } else { 1 };

        // SAFETY: liveness was promised to the constructor.
        unsafe { self.arena.bump(count * mem::size_of::<T>(), realign, S::CHECKED) }
            .map(NonNull::cast)
    }

    /// Remaining capacity in `T` slots under this adapter's shape.
    pub fn free_slots<T>(&self) -> usize {
        // SAFETY: liveness was promised to the constructor.
        unsafe {
            if M::REALIGN {
                self.arena.free_slots_multi::<T>()
            } else {
                self.arena.free_slots::<T>()
            }
        }
    }

    /// Resets the arena's cursor. See [`RawArena::clear`].
    pub fn clear(&self) {
        // SAFETY: liveness was promised to the constructor.
        unsafe { self.arena.clear() };
    }
}

unsafe impl<S: Safety, M: Shape> Allocator for ArenaAlloc<S, M> {
    fn allocate(&self, layout: Layout) -> AllocResult {
        let realign = if M::REALIGN { layout.align() } else { 1 };

        // SAFETY: liveness was promised to the constructor.
        match unsafe { self.arena.bump(layout.size(), realign, S::CHECKED) } {
            Some(address) => Ok(NonNull::slice_from_raw_parts(address, layout.size())),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, _address: NonNull<u8>, _layout: Layout) {}
}

impl<S: Safety, M: Shape> Clone for ArenaAlloc<S, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Safety, M: Shape> Copy for ArenaAlloc<S, M> {}

impl<S: Safety, M: Shape> PartialEq for ArenaAlloc<S, M> {
    /// Equal iff both adapters wrap the same arena.
    fn eq(&self, other: &Self) -> bool {
        self.arena == other.arena
    }
}

impl<S: Safety, M: Shape> Eq for ArenaAlloc<S, M> {}

impl<S: Safety, M: Shape> fmt::Debug for ArenaAlloc<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAlloc").field("arena", &self.arena).finish()
    }
}

/// Per-type-family singleton arena adapter: all handles of one
/// instantiation `<T, UID, S, M>` share one process-wide arena, created
/// with [`StaticArena::create_arena`] and torn down with
/// [`StaticArena::destroy_arena`]. Equality is trivially true. Distinct
/// `UID`s mint independent singletons of the same element type.
///
/// Before `create_arena`, allocating operations return the null sentinel.
pub struct StaticArena<T, const UID: usize = 0, S: Safety = Checked, M: Shape = MultiType> {
    marker: PhantomData<fn() -> (T, S, M)>,
}

impl<T, const UID: usize, S, M> StaticArena<T, UID, S, M>
where
    T: 'static,
    S: Safety,
    M: Shape,
{
    /// The family's published arena base. Null until created.
    fn cell() -> &'static AtomicPtr<u8> {
        shell::state::<Self, AtomicPtr<u8>>()
    }

    /// The family's arena, if one has been created.
    fn arena() -> Option<RawArena> {
        // SAFETY: only `create_arena` publishes pointers here, and those
        // are live user bases.
        NonNull::new(Self::cell().load(Ordering::Acquire))
            .map(|user| unsafe { RawArena::from_user_base(user) })
    }

    /// Creates the family's arena with room for `count` elements, aligned
    /// for `T`, and publishes it. A previously created arena is simply
    /// unpublished; destroying it remains the caller's business.
    pub fn create_arena(count: usize) -> Option<RawArena> {
        let arena = RawArena::create_aligned(
            count.checked_mul(mem::size_of::<T>())?,
            mem::align_of::<T>(),
        )?;
        Self::cell().store(arena.user_base().as_ptr(), Ordering::Release);

        Some(arena)
    }

    /// Unpublishes and destroys the family's arena.
    ///
    /// # Safety
    ///
    /// Every object stored in the arena must have been released and no
    /// handle may allocate from the family afterwards until a new arena
    /// is created.
    pub unsafe fn destroy_arena() {
        let user = Self::cell().swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(user) = NonNull::new(user) {
            RawArena::from_user_base(user).destroy();
        }
    }

    /// Builds a handle to the family.
    ///
    /// # Safety
    ///
    /// The family's arena is bumped without synchronization: all handles
    /// of this instantiation must stay on one thread.
    pub unsafe fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }

    /// The UID distinguishing this family.
    pub const fn uid(&self) -> usize {
        UID
    }

    /// Allocates `count` contiguous `T` slots from the family's arena.
    pub fn alloc(&self, count: usize) -> Pointer<T> {
        let arena = Self::arena()?;
        let realign = if M::REALIGN { mem::align_of::<T>() } else { 1 };

        // SAFETY: published arenas are live until `destroy_arena`, whose
        // contract forbids later allocation.
        unsafe { arena.bump(count * mem::size_of::<T>(), realign, S::CHECKED) }.map(NonNull::cast)
    }

    /// Remaining capacity in `T` slots, 0 before the arena exists.
    pub fn free_slots(&self) -> usize {
        let Some(arena) = Self::arena() else {
            return 0;
        };

        // SAFETY: as in `alloc`.
        unsafe {
            if M::REALIGN {
                arena.free_slots_multi::<T>()
            } else {
                arena.free_slots::<T>()
            }
        }
    }

    /// Resets the family's cursor, if an arena exists.
    pub fn clear(&self) {
        if let Some(arena) = Self::arena() {
            // SAFETY: as in `alloc`.
            unsafe { arena.clear() };
        }
    }
}

unsafe impl<T, const UID: usize, S, M> Allocator for StaticArena<T, UID, S, M>
where
    T: 'static,
    S: Safety,
    M: Shape,
{
    fn allocate(&self, layout: Layout) -> AllocResult {
        let arena = Self::arena().ok_or(AllocError)?;
        let realign = if M::REALIGN { layout.align() } else { 1 };

        // SAFETY: as in `StaticArena::alloc`.
        match unsafe { arena.bump(layout.size(), realign, S::CHECKED) } {
            Some(address) => Ok(NonNull::slice_from_raw_parts(address, layout.size())),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, _address: NonNull<u8>, _layout: Layout) {}
}

impl<T: 'static, const UID: usize, S: Safety, M: Shape> Clone for StaticArena<T, UID, S, M> {
    fn clone(&self) -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T: 'static, const UID: usize, S: Safety, M: Shape> Copy for StaticArena<T, UID, S, M> {}

impl<T: 'static, const UID: usize, S: Safety, M: Shape> PartialEq for StaticArena<T, UID, S, M> {
    /// All handles of one instantiation share one arena.
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl<T: 'static, const UID: usize, S: Safety, M: Shape> Eq for StaticArena<T, UID, S, M> {}

impl<T: 'static, const UID: usize, S: Safety, M: Shape> fmt::Debug for StaticArena<T, UID, S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticArena").field("uid", &UID).finish()
    }
}
