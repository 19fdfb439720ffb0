//! Boundary-tag block layout.
//!
//! Every block, free or allocated, starts with a one-slot leading tag holding
//! `size | allocated_bit`. Free blocks additionally mirror the plain size in a
//! trailing tag occupying the block's last slot, and carry the three embedded
//! index fields (`left`, `right`, `height`) in the first three payload slots:
//!
//! ```text
//! free:      | size|0 | left | right | height | ...unused... | size |
//! allocated: | size|1 |              payload                        |
//! ```
//!
//! The trailing tag is what lets a freed block find the neighbor that ends
//! immediately before it in O(1). Allocated blocks give that slot (and the
//! index slots) back to the payload, so the minimum block size is what a free
//! block needs: two tags plus three index fields.
//!
//! This module is pure address arithmetic over raw arena bytes. A bug here
//! corrupts the whole heap, so every accessor asserts the alignment invariant
//! in debug builds.

use crate::ALIGNMENT;
use core::mem;
use core::ptr::NonNull;

/// Width of one metadata slot. Tags, embedded pointers, and the height field
/// each occupy one slot so that payload addresses stay aligned.
pub(crate) const WORD: usize = ALIGNMENT;

/// Per-block metadata overhead: the leading and trailing tags.
pub(crate) const META: usize = 2 * WORD;

/// The smallest payload a free block can have: room for the embedded `left`,
/// `right`, and `height` fields. Splitting never produces a remainder whose
/// payload would be smaller than this.
pub(crate) const MIN_PAYLOAD: usize = 3 * WORD;

/// The smallest block that can exist.
pub(crate) const MIN_BLOCK: usize = META + MIN_PAYLOAD;

/// Total size of one pre-populated small block.
pub(crate) const SMALL_BLOCK: usize = 64 + META;

/// How many small blocks one batch pre-populates.
pub(crate) const SMALL_BATCH: usize = 8;

const ALLOCATED_BIT: usize = 1;

// A slot must be able to hold a size or an embedded pointer.
const _: () = assert!(mem::size_of::<usize>() <= WORD);
const _: () = assert!(mem::size_of::<*mut u8>() <= WORD);
const _: () = assert!(ALIGNMENT.is_power_of_two());

/// Round a payload size up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` on overflow.
pub(crate) fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// Total block size needed to serve a request of `size` payload bytes.
///
/// Returns `None` when the request is too large to represent.
pub(crate) fn request_size(size: usize) -> Option<usize> {
    let payload = align_up(size)?.max(MIN_PAYLOAD);
    payload.checked_add(META)
}

/// A block address inside the arena.
///
/// This is a plain address plus accessors; it does not own the bytes behind
/// it and is `Copy`. All accessors that touch memory are `unsafe`: the caller
/// must know that the address is a live block boundary inside the arena, and
/// for the free-block accessors (`left`, `right`, `height`, trailing tag)
/// that the block is actually free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    #[inline]
    pub(crate) fn from_raw(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        Block(ptr)
    }

    /// Recover the block from a payload address previously handed out.
    ///
    /// # Safety
    ///
    /// `payload` must point one slot past a block boundary.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        debug_assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
        Block(NonNull::new_unchecked(payload.as_ptr().sub(WORD)))
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The client-visible payload address, one slot past the leading tag.
    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // Safety: one slot past a non-null block boundary cannot wrap to null.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(WORD)) }
    }

    #[inline]
    unsafe fn slot(self, index: usize) -> *mut usize {
        debug_assert_eq!(self.addr() % ALIGNMENT, 0);
        self.0.as_ptr().add(index * WORD).cast::<usize>()
    }

    /// Raw leading tag: size with the allocated bit still packed in.
    #[inline]
    pub(crate) unsafe fn tag(self) -> usize {
        self.slot(0).read()
    }

    /// The block's total size in bytes, metadata included.
    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        let size = self.tag() & !ALLOCATED_BIT;
        debug_assert_eq!(size % ALIGNMENT, 0);
        size
    }

    #[inline]
    pub(crate) unsafe fn is_allocated(self) -> bool {
        self.tag() & ALLOCATED_BIT != 0
    }

    /// Payload capacity of this block.
    #[inline]
    pub(crate) unsafe fn payload_size(self) -> usize {
        self.size() - META
    }

    /// Write both boundary tags for a free block of `size` bytes.
    ///
    /// # Safety
    ///
    /// The `size` bytes starting at this block must lie within the arena and
    /// must not belong to any live allocation.
    #[inline]
    pub(crate) unsafe fn write_free(self, size: usize) {
        debug_assert!(size >= MIN_BLOCK);
        debug_assert_eq!(size % ALIGNMENT, 0);
        self.slot(0).write(size);
        self.trailing_tag_ptr(size).write(size);
    }

    /// Set the allocated bit. The trailing tag becomes payload from here on.
    #[inline]
    pub(crate) unsafe fn mark_allocated(self) {
        self.slot(0).write(self.size() | ALLOCATED_BIT);
    }

    #[inline]
    unsafe fn trailing_tag_ptr(self, size: usize) -> *mut usize {
        self.0.as_ptr().add(size - WORD).cast::<usize>()
    }

    /// Read the trailing size mirror. Only meaningful on a free block.
    #[inline]
    pub(crate) unsafe fn trailing_size(self) -> usize {
        self.trailing_tag_ptr(self.size()).read()
    }

    /// The physically next block, at `self + size`.
    ///
    /// Only a real block boundary if `self + size` is below the arena's high
    /// boundary; the caller checks.
    #[inline]
    pub(crate) unsafe fn next(self) -> Block {
        Block(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// The slot immediately before this block, i.e. where the preceding
    /// block's trailing tag sits if (and only if) that block is free.
    ///
    /// # Safety
    ///
    /// The caller must have checked that this block does not start at the
    /// arena's low boundary. The returned value is only a size if the
    /// preceding block is actually free; see the validation in the coalescer.
    #[inline]
    pub(crate) unsafe fn preceding_tag(self) -> usize {
        self.0.as_ptr().sub(WORD).cast::<usize>().read()
    }

    /// The block starting `distance` bytes before this one.
    #[inline]
    pub(crate) unsafe fn backward(self, distance: usize) -> Block {
        debug_assert_eq!(distance % ALIGNMENT, 0);
        Block(NonNull::new_unchecked(self.0.as_ptr().sub(distance)))
    }

    // Embedded index fields, valid only while the block is free.

    #[inline]
    pub(crate) unsafe fn left(self) -> Option<Block> {
        NonNull::new(self.slot(1).cast::<*mut u8>().read()).map(Block)
    }

    #[inline]
    pub(crate) unsafe fn set_left(self, left: Option<Block>) {
        let raw = left.map_or(core::ptr::null_mut(), Block::as_ptr);
        self.slot(1).cast::<*mut u8>().write(raw);
    }

    #[inline]
    pub(crate) unsafe fn right(self) -> Option<Block> {
        NonNull::new(self.slot(2).cast::<*mut u8>().read()).map(Block)
    }

    #[inline]
    pub(crate) unsafe fn set_right(self, right: Option<Block>) {
        let raw = right.map_or(core::ptr::null_mut(), Block::as_ptr);
        self.slot(2).cast::<*mut u8>().write(raw);
    }

    #[inline]
    pub(crate) unsafe fn height(self) -> usize {
        self.slot(3).read()
    }

    #[inline]
    pub(crate) unsafe fn set_height(self, height: usize) {
        self.slot(3).write(height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    #[repr(align(8))]
    struct Arena<const N: usize>([MaybeUninit<u8>; N]);

    #[test]
    fn request_size_rounds_and_clamps() {
        assert_eq!(request_size(0), Some(META + MIN_PAYLOAD));
        assert_eq!(request_size(1), Some(META + MIN_PAYLOAD));
        assert_eq!(request_size(MIN_PAYLOAD), Some(MIN_BLOCK));
        assert_eq!(request_size(100), Some(META + 104));
        assert_eq!(request_size(usize::MAX), None);
    }

    #[test]
    fn tags_round_trip() {
        let mut arena = Arena([MaybeUninit::uninit(); 128]);
        let ptr = NonNull::new(arena.0.as_mut_ptr().cast::<u8>()).unwrap();
        let block = Block::from_raw(ptr);
        unsafe {
            block.write_free(MIN_BLOCK);
            assert_eq!(block.size(), MIN_BLOCK);
            assert_eq!(block.trailing_size(), MIN_BLOCK);
            assert!(!block.is_allocated());

            block.mark_allocated();
            assert!(block.is_allocated());
            assert_eq!(block.size(), MIN_BLOCK);

            block.write_free(MIN_BLOCK);
            assert!(!block.is_allocated());
            assert_eq!(block.payload_size(), MIN_BLOCK - META);
        }
    }

    #[test]
    fn neighbors_and_payload() {
        let mut arena = Arena([MaybeUninit::uninit(); 256]);
        let ptr = NonNull::new(arena.0.as_mut_ptr().cast::<u8>()).unwrap();
        let first = Block::from_raw(ptr);
        unsafe {
            first.write_free(MIN_BLOCK);
            let second = first.next();
            assert_eq!(second.addr(), first.addr() + MIN_BLOCK);
            second.write_free(SMALL_BLOCK);

            // The second block can see the first through its trailing tag.
            assert_eq!(second.preceding_tag(), MIN_BLOCK);
            assert_eq!(second.backward(second.preceding_tag()), first);

            let payload = first.payload();
            assert_eq!(Block::from_payload(payload), first);
        }
    }

    #[test]
    fn index_fields_round_trip() {
        let mut arena = Arena([MaybeUninit::uninit(); 256]);
        let base = NonNull::new(arena.0.as_mut_ptr().cast::<u8>()).unwrap();
        let a = Block::from_raw(base);
        unsafe {
            a.write_free(MIN_BLOCK);
            let b = a.next();
            b.write_free(MIN_BLOCK);

            a.set_left(Some(b));
            a.set_right(None);
            a.set_height(2);
            assert_eq!(a.left(), Some(b));
            assert_eq!(a.right(), None);
            assert_eq!(a.height(), 2);
        }
    }
}
