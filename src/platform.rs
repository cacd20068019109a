use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Pointer;

/// Abstraction for platform specific virtual memory handling. The virtual
/// arena needs to reserve a range of address space, commit chunks of it
/// on demand and eventually return the whole range, but it doesn't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformVirtualMemory {
    /// Reserves `length` bytes of address space without backing storage.
    /// Nothing can be read or written through the returned pointer until
    /// the bytes are committed.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Commits `length` bytes starting at `address`, making them readable
    /// and writable. Both values must be granularity-aligned and inside a
    /// previously reserved range. Returns whether the commit succeeded.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns the entire reserved range starting at `address` to the
    /// kernel, committed or not.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;

    /// Minimum increment of committed memory. Same as the page size on
    /// Unix; usually 64 KiB on Windows.
    unsafe fn allocation_granularity() -> usize;
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be
/// a constant but we don't know the value at compile time, so the first
/// call caches it.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Allocation granularity, cached the same way as [`PAGE_SIZE`].
static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn cached(cache: &AtomicUsize, query: fn() -> usize) -> usize {
    let value = cache.load(Ordering::Relaxed);
    if value != 0 {
        return value;
    }

    let value = query();
    cache.store(value, Ordering::Relaxed);

    value
}

/// Convenience wrapper for [`PlatformVirtualMemory::page_size`].
#[inline]
#[allow(dead_code)]
pub(crate) fn page_size() -> usize {
    cached(&PAGE_SIZE, || unsafe { Platform::page_size() })
}

/// Convenience wrapper for [`PlatformVirtualMemory::allocation_granularity`].
#[inline]
pub(crate) fn allocation_granularity() -> usize {
    cached(&GRANULARITY, || unsafe {
        Platform::allocation_granularity()
    })
}

/// Convenience wrapper for [`PlatformVirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // No protection at all. The pages only become usable once
            // `commit` flips them to read-write, which keeps the
            // committed prefix explicit like on Windows.
            let protection = libc::PROT_NONE;

            // Private to our process, not mapped to any file, and not
            // counted against overcommit limits until committed.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            libc::mprotect(address.cast().as_ptr(), length, protection) == 0
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is
                // still valid here, it wasn't unmapped.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }

        unsafe fn allocation_granularity() -> usize {
            // mmap works at page granularity, there is no separate
            // allocation granularity concept on Unix.
            Self::page_size()
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Reserve only. Committing happens later, chunk by chunk, as
            // the arena grows. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address =
                Memory::VirtualAlloc(None, length, Memory::MEM_RESERVE, Memory::PAGE_READWRITE);

            NonNull::new(address.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let address: *const c_void = address.cast().as_ptr();
            let committed =
                Memory::VirtualAlloc(Some(address), length, Memory::MEM_COMMIT, Memory::PAGE_READWRITE);

            !committed.is_null()
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // Length of 0 with MEM_RELEASE returns the entire reserved
            // range, decommitting along the way.
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if Memory::VirtualFree(address, length, flags).is_err() {
                // TODO: Release failed, don't know what to do here yet.
                // Same problem as munmap on Unix.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }

        unsafe fn allocation_granularity() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwAllocationGranularity as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so instead we'll use the global
    //! allocator to mock virtual memory. Reservations are backed
    //! immediately and commits are bookkeeping no-ops, which is enough to
    //! exercise the arena logic and lets Miri find leaked reservations.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformVirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }

        unsafe fn allocation_granularity() -> usize {
            4096
        }
    }
}
