#![feature(allocator_api)]

//! Region-based memory allocators designed to be plugged into generic
//! containers through [`std::alloc::Allocator`].
//!
//! Two families are provided, each solving a different lifetime problem:
//!
//! - [`BlockAlloc`]: a growing collection of fixed-capacity slabs that
//!   hands out contiguous runs of `T` bump-style inside the current slab
//!   and returns a whole slab to the system once every run carved from it
//!   has been released. Built for string-like workloads where millions of
//!   short-lived arrays share one element type and come and go in roughly
//!   stack order.
//! - Bump arenas ([`RawArena`], [`VirtualArena`], [`Region`]): one
//!   contiguous pre-reserved span with a monotonic cursor. Individual
//!   deallocation is a no-op; the whole region is reclaimed in one shot.
//!   The virtual variant reserves a large address range up front and
//!   commits it in granularity-sized chunks as the cursor advances.
//!
//! The safety, element-shape and thread-safety axes are compile-time tags
//! ([`Checked`]/[`Unchecked`], [`SingleType`]/[`MultiType`],
//! [`ThreadSafe`]/[`SingleThread`]) so the dispatch vanishes under
//! monomorphization.

use std::{alloc::AllocError, ptr::NonNull};

mod adapter;
mod alignment;
mod arena;
mod header;
mod platform;
mod region;
mod shell;
mod slab;
mod virt;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case. `None` doubles as the null sentinel that every allocating
/// operation returns on exhaustion.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for [`std::alloc::Allocator`] return types.
pub(crate) type AllocResult = Result<NonNull<[u8]>, AllocError>;

pub use adapter::{
    ArenaAlloc, BlockAlloc, Checked, Construct, Construction, MultiType, NoConstruct, RegionAlloc,
    Safety, Shape, SingleType, StaticArena, Unchecked,
};
pub use arena::{destroy_slice, RawArena};
pub use header::ArenaHeader;
pub use region::Region;
pub use shell::{Shell, SingleThread, ThreadSafe};
pub use virt::VirtualArena;
