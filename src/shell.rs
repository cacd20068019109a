use std::{
    any::{Any, TypeId},
    cell::UnsafeCell,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Thread-safety tag: every public operation of an allocator built with
/// this tag takes a scoped exclusive lock, covering the whole operation
/// including registry rebuilds.
pub struct ThreadSafe;

/// Thread-safety tag: no synchronization at all. Allocators built with
/// this tag are only reachable through `unsafe` constructors whose
/// contract is that the whole allocator family stays on one thread.
pub struct SingleThread;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::ThreadSafe {}
    impl Sealed for super::SingleThread {}
}

/// Selects, at compile time, how an allocator's shared state is guarded.
/// Monomorphization erases the dispatch: the [`ThreadSafe`] wrap is a
/// mutex, the [`SingleThread`] wrap is a bare cell.
///
/// # Safety
///
/// Implementations must hand `with` exclusive access to the state for the
/// duration of the closure, under the tag's documented contract.
pub unsafe trait Shell: sealed::Sealed + Sized + 'static {
    /// Storage wrapping a state value of type `T`.
    type Wrap<T: Send + Default + 'static>: Send + Sync + Default + 'static;

    /// Runs `operation` with exclusive access to the wrapped state.
    fn with<T: Send + Default + 'static, R>(
        wrap: &Self::Wrap<T>,
        operation: impl FnOnce(&mut T) -> R,
    ) -> R;
}

unsafe impl Shell for ThreadSafe {
    type Wrap<T: Send + Default + 'static> = Mutex<T>;

    fn with<T: Send + Default + 'static, R>(
        wrap: &Mutex<T>,
        operation: impl FnOnce(&mut T) -> R,
    ) -> R {
        operation(&mut wrap.lock())
    }
}

/// State cell with no synchronization whatsoever, the [`SingleThread`]
/// counterpart of [`parking_lot::Mutex`]. `Sync` is asserted because the
/// process-wide registry requires it; actual cross-thread use is ruled
/// out by the `unsafe` constructor contracts of the adapters.
pub struct Unsynchronized<T>(UnsafeCell<T>);

impl<T: Default> Default for Unsynchronized<T> {
    fn default() -> Self {
        Self(UnsafeCell::new(T::default()))
    }
}

unsafe impl<T: Send> Send for Unsynchronized<T> {}
unsafe impl<T: Send> Sync for Unsynchronized<T> {}

unsafe impl Shell for SingleThread {
    type Wrap<T: Send + Default + 'static> = Unsynchronized<T>;

    fn with<T: Send + Default + 'static, R>(
        wrap: &Unsynchronized<T>,
        operation: impl FnOnce(&mut T) -> R,
    ) -> R {
        // SAFETY: the adapter constructors for this tag are `unsafe` and
        // require that the family is used from a single thread, which
        // makes this the only live access.
        operation(unsafe { &mut *wrap.0.get() })
    }
}

/// Process-wide registry holding one lazily-initialized state per
/// monomorphized allocator type.
///
/// Rust has no generic statics, so a `static` cannot depend on the type
/// parameters of the allocator it belongs to. The equivalent is a map
/// keyed by [`TypeId`] of the full adapter type (element type, slab
/// size, tags and UID included). States are leaked on first touch and live
/// for the rest of the process, exactly like a function-local static.
static REGISTRY: Lazy<DashMap<TypeId, &'static (dyn Any + Send + Sync)>> =
    Lazy::new(DashMap::new);

/// Returns the state of the allocator family `Key`, creating it on first
/// use. `Key` is the adapter type itself; two adapter types that differ
/// in any parameter get fully independent states.
pub(crate) fn state<Key: 'static, State: Any + Send + Sync + Default>() -> &'static State {
    let entry: &'static (dyn Any + Send + Sync) = *REGISTRY
        .entry(TypeId::of::<Key>())
        .or_insert_with(|| Box::leak(Box::<State>::default()));

    // The entry for this key is always created with type `State`.
    entry.downcast_ref().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct KeyA;
    struct KeyB;

    #[test]
    fn one_state_per_key() {
        let first: &'static Mutex<Vec<u8>> = state::<KeyA, _>();
        let again: &'static Mutex<Vec<u8>> = state::<KeyA, _>();
        let other: &'static Mutex<Vec<u8>> = state::<KeyB, _>();

        assert!(std::ptr::eq(first, again));
        assert!(!std::ptr::eq(first, other));

        first.lock().push(1);
        assert_eq!(again.lock().len(), 1);
        assert_eq!(other.lock().len(), 0);
    }

    #[test]
    fn state_survives_concurrent_first_touch() {
        struct Racy;

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let cell: &'static Mutex<u64> = state::<Racy, _>();
                        *cell.lock() += 1;
                        cell as *const _ as usize
                    })
                })
                .collect();

            let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
        });

        assert_eq!(*state::<Racy, Mutex<u64>>().lock(), 8);
    }

    #[test]
    fn shells_run_operations() {
        let safe: Mutex<u32> = Default::default();
        ThreadSafe::with(&safe, |value| *value += 2);
        assert_eq!(ThreadSafe::with(&safe, |value| *value), 2);

        let bare: Unsynchronized<u32> = Default::default();
        SingleThread::with(&bare, |value| *value += 3);
        assert_eq!(SingleThread::with(&bare, |value| *value), 3);
    }
}
