//! Sharing a heap behind a lock.
//!
//! [`BestFitHeap`] takes `&mut self` everywhere and knows nothing about
//! threads. [`LockedHeap`] wraps it behind a caller-chosen [`Lock`] so it can
//! be reached through a shared reference; in `no_std` there is no one true
//! mutex, so the locking primitive is a trait the embedder implements over
//! whatever their platform has.

use crate::{ArenaSource, BestFitHeap, GrowthStats, HeapError, HeapFault};
use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;

/// A mutual-exclusion primitive.
///
/// # Safety
///
/// Between a return from `acquire` and the matching `release`, no other
/// acquisition of the same lock may return. Implementations on actually
/// concurrent platforms must also make writes under the lock visible to the
/// next holder.
pub unsafe trait Lock {
    /// Block until the lock is held.
    fn acquire(&self);
    /// Give the lock up. Called exactly once per `acquire`, by the holder.
    fn release(&self);
}

/// A lock for contexts that have no concurrency at all.
///
/// Does no synchronization; it only catches reentrant use (say, from an
/// interrupt handler on the same core) by panicking instead of letting two
/// operations interleave on the heap.
#[derive(Default)]
pub struct SingleThreadedLock {
    held: Cell<bool>,
}

impl SingleThreadedLock {
    /// Create the lock, initially released.
    pub const fn new() -> Self {
        SingleThreadedLock {
            held: Cell::new(false),
        }
    }
}

// Safety: `Cell` is not `Sync`, so this lock can never actually be reached
// from two threads; within one thread the `held` flag rejects reentry.
unsafe impl Lock for SingleThreadedLock {
    fn acquire(&self) {
        assert!(!self.held.replace(true), "heap lock acquired reentrantly");
    }

    fn release(&self) {
        self.held.set(false);
    }
}

/// A [`BestFitHeap`] usable through a shared reference.
pub struct LockedHeap<S: ArenaSource, L: Lock> {
    heap: UnsafeCell<BestFitHeap<S>>,
    lock: L,
}

// Safety: the heap is only touched under the lock, and the lock's contract
// serializes holders and publishes their writes.
unsafe impl<S: ArenaSource + Send, L: Lock + Send> Send for LockedHeap<S, L> {}
unsafe impl<S: ArenaSource + Send, L: Lock + Sync> Sync for LockedHeap<S, L> {}

/// Releases on drop, so a panicking closure does not leave the lock held.
struct Guard<'a, L: Lock>(&'a L);

impl<L: Lock> Drop for Guard<'_, L> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl<S: ArenaSource, L: Lock> LockedHeap<S, L> {
    /// Wrap `heap` behind `lock`.
    pub fn new(heap: BestFitHeap<S>, lock: L) -> Self {
        LockedHeap {
            heap: UnsafeCell::new(heap),
            lock,
        }
    }

    /// Take the heap back out.
    pub fn into_inner(self) -> BestFitHeap<S> {
        self.heap.into_inner()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BestFitHeap<S>) -> T) -> T {
        self.lock.acquire();
        let guard = Guard(&self.lock);
        // Safety: the lock is held, so this is the only live reference.
        let heap = unsafe { &mut *self.heap.get() };
        let result = f(heap);
        drop(guard);
        result
    }

    /// Locked [`BestFitHeap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with(|heap| heap.allocate(size))
    }

    /// Locked [`BestFitHeap::free`].
    ///
    /// # Safety
    ///
    /// Same contract as [`BestFitHeap::free`].
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.with(|heap| heap.free(ptr))
    }

    /// Locked [`BestFitHeap::reallocate`].
    ///
    /// # Safety
    ///
    /// Same contract as [`BestFitHeap::reallocate`].
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.with(|heap| heap.reallocate(ptr, new_size))
    }

    /// Locked [`BestFitHeap::verify`].
    pub fn verify(&self) -> Result<(), HeapFault> {
        self.with(|heap| heap.verify())
    }

    /// Locked [`BestFitHeap::growth_stats`].
    pub fn growth_stats(&self) -> GrowthStats {
        self.with(|heap| heap.growth_stats())
    }
}
