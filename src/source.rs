//! Backing stores for the arena.
//!
//! The heap never allocates for itself; it asks an [`ArenaSource`] for more
//! arena whenever it grows. A source hands out one contiguous region, one
//! extension at a time, and keeps it alive for as long as the source lives.

use crate::{AllocError, Allocator, OutOfMemory, ALIGNMENT};
use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

/// A supplier of contiguous arena memory.
///
/// # Safety
///
/// Implementations must uphold the arena contract:
///
/// * The first successful `extend` returns a pointer aligned to
///   [`ALIGNMENT`].
/// * Every later successful `extend` returns a pointer exactly one past the
///   end of the previously returned region, so all extensions together form
///   one contiguous region.
/// * Returned memory is valid for reads and writes, unaliased, and stays so
///   until the source is dropped.
/// * A failed `extend` has no effect on the region handed out so far.
pub unsafe trait ArenaSource {
    /// Grow the arena by exactly `additional` bytes, returning the start of
    /// the new portion.
    fn extend(&mut self, additional: usize) -> Result<NonNull<u8>, OutOfMemory>;
}

/// An arena carved out of a caller-provided memory region.
///
/// The region can live anywhere: a static, the stack, or memory obtained from
/// another allocator. The source bumps through it and fails once it is used
/// up. The region's start is rounded up to [`ALIGNMENT`] internally, so the
/// caller does not need an aligned buffer.
#[derive(Debug)]
pub struct RegionArena<'a> {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    _region: PhantomData<&'a mut [MaybeUninit<u8>]>,
}

// Safety: the source exclusively borrows the region for 'a.
unsafe impl Send for RegionArena<'_> {}

impl<'a> RegionArena<'a> {
    /// Wrap a region. Bytes lost to aligning the region's start (at most
    /// [`ALIGNMENT`]` - 1`) do not count toward the capacity.
    pub fn new(region: &'a mut [MaybeUninit<u8>]) -> Self {
        let start = region.as_mut_ptr() as usize;
        let offset = (start.wrapping_neg() % ALIGNMENT).min(region.len());
        let capacity = region.len() - offset;
        // Safety: `start + offset` is within (or one past) the region.
        let base = unsafe { NonNull::new_unchecked(region.as_mut_ptr().cast::<u8>().add(offset)) };
        RegionArena {
            base,
            capacity,
            used: 0,
            _region: PhantomData,
        }
    }

    /// How many bytes of the region are still unhanded-out.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

unsafe impl ArenaSource for RegionArena<'_> {
    fn extend(&mut self, additional: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if additional > self.remaining() {
            return Err(OutOfMemory);
        }
        // Safety: `used + additional <= capacity`, so the offset stays inside
        // the borrowed region.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
        self.used += additional;
        Ok(ptr)
    }
}

/// An arena reserved up front from an [`Allocator`].
///
/// The whole capacity is allocated once at construction; extensions bump
/// through the reservation. Reserving eagerly is what makes the contiguity
/// contract possible on top of a general-purpose allocator, which is free to
/// place separate allocations anywhere.
pub struct ReserveArena<A: Allocator> {
    inner: A,
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
}

// Safety: the reservation is exclusively owned; sending the source sends the
// allocator that will free it.
unsafe impl<A: Allocator + Send> Send for ReserveArena<A> {}

impl<A: Allocator> ReserveArena<A> {
    /// Reserve `capacity` bytes from `inner`.
    pub fn new(inner: A, capacity: usize) -> Result<Self, OutOfMemory> {
        let layout = Self::layout(capacity)?;
        let base = inner.allocate(layout).map_err(|AllocError| OutOfMemory)?;
        Ok(ReserveArena {
            inner,
            base: base.cast::<u8>(),
            capacity,
            used: 0,
        })
    }

    /// How many bytes of the reservation are still unhanded-out.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    fn layout(capacity: usize) -> Result<Layout, OutOfMemory> {
        Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| OutOfMemory)
    }
}

unsafe impl<A: Allocator> ArenaSource for ReserveArena<A> {
    fn extend(&mut self, additional: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if additional > self.remaining() {
            return Err(OutOfMemory);
        }
        // Safety: the offset stays inside the reservation.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
        self.used += additional;
        Ok(ptr)
    }
}

impl<A: Allocator> Drop for ReserveArena<A> {
    fn drop(&mut self) {
        // Safety: `base` came from `inner.allocate` with this same layout,
        // which `new` proved valid.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, ALIGNMENT);
            self.inner.deallocate(self.base, layout);
        }
    }
}
