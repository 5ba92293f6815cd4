//! Read-copy-update cell.
//!
//! Readers pin the current epoch, observe whichever generation is published and never
//! block. Writers publish a complete replacement with a single atomic swap; the old
//! generation is reclaimed only after every reader pinned before the swap has left.
//! Writers are expected to serialise among themselves (the cell only guarantees that a
//! reader sees a fully-formed generation, not that concurrent writers compose).

use std::fmt;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

pub struct RcuCell<T: Send + Sync + 'static> {
    ptr: Atomic<T>,
}

impl<T: Send + Sync + 'static> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: Atomic::new(value),
        }
    }

    /// Runs `f` against the currently published generation.
    #[inline]
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = epoch::pin();
        let shared = self.ptr.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null; it is created from a value and only ever
        // swapped for another owned value. It stays alive while `guard` is pinned.
        let value = unsafe { shared.deref() };
        f(value)
    }

    /// Publishes `value`, retiring the previous generation once no reader can see it.
    pub fn replace(&self, value: T) {
        let guard = epoch::pin();
        let old = self.ptr.swap(Owned::new(value), Ordering::AcqRel, &guard);
        // SAFETY: `old` is unlinked from the cell; readers pinned before the swap keep
        // it alive until their guards drop.
        unsafe { guard.defer_destroy(old) };
    }

    /// Builds the next generation from the current one and publishes it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = self.read(f);
        self.replace(next);
    }
}

impl<T: Clone + Send + Sync + 'static> RcuCell<T> {
    #[inline]
    pub fn load(&self) -> T {
        self.read(T::clone)
    }
}

impl<T: Send + Sync + 'static> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers holding this generation.
        unsafe {
            let guard = epoch::unprotected();
            let current = self.ptr.load(Ordering::Relaxed, guard);
            drop(current.into_owned());
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read(|value| f.debug_tuple("RcuCell").field(value).finish())
    }
}
