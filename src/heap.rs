//! The best-fit heap.
//!
//! One heap instance owns one arena: a contiguous region that grows through
//! its [`ArenaSource`] and never shrinks. Allocation queries the free-block
//! index for the tightest fit, splitting off any tail surplus; a miss either
//! pre-populates a batch of small blocks (for small requests) or extends the
//! arena, absorbing a free block at the arena's end when one exists so the
//! extension only covers the shortfall. Freeing eagerly merges the block with
//! its free physical neighbors before re-indexing it, so fragmentation from
//! splitting is undone as soon as both halves are free again.
//!
//! Every operation runs to completion before the next may begin; the heap
//! takes `&mut self` throughout and holds no locks. See the crate-level
//! documentation for the locking adaptation.

use crate::{ArenaSource, HeapError, HeapFault, OutOfMemory, ALIGNMENT};
use core::ptr::{self, NonNull};

mod index;
mod layout;

use index::FreeIndex;
use layout::{request_size, Block, MIN_BLOCK, SMALL_BATCH, SMALL_BLOCK, WORD};

/// Counters for arena growth.
///
/// These make the amortization heuristics observable: the small-object batch
/// and the reallocation over-sizing both exist to keep `extensions` low.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrowthStats {
    /// How many times the backing source was asked to extend the arena.
    pub extensions: usize,
    /// Total number of bytes the arena has grown by.
    pub extended_bytes: usize,
}

/// A single-arena, best-fit, eagerly coalescing heap allocator.
///
/// The heap hands out raw payload pointers. A payload pointer stays valid
/// until it is passed to [`BestFitHeap::free`], successfully relocated by
/// [`BestFitHeap::reallocate`], or the heap (and with it the source's
/// backing memory) is dropped.
#[derive(Debug)]
pub struct BestFitHeap<S: ArenaSource> {
    source: S,
    /// Lowest address the arena covers. Null only before the first extension.
    low: *mut u8,
    /// One past the highest address the arena covers.
    high: *mut u8,
    index: FreeIndex,
    stats: GrowthStats,
}

// Safety: the heap exclusively owns every byte of its arena; moving it to
// another thread moves that ownership along with the source.
unsafe impl<S: ArenaSource + Send> Send for BestFitHeap<S> {}

impl<S: ArenaSource> BestFitHeap<S> {
    /// Create a heap over the given backing source.
    ///
    /// Pre-populates the small-object batch, so this extends the arena
    /// immediately; a source that cannot supply the initial batch is reported
    /// as [`HeapError::OutOfMemory`].
    pub fn new(source: S) -> Result<Self, HeapError> {
        let mut heap = BestFitHeap {
            source,
            low: ptr::null_mut(),
            high: ptr::null_mut(),
            index: FreeIndex::new(),
            stats: GrowthStats::default(),
        };
        heap.populate_small()?;
        Ok(heap)
    }

    /// A shared reference to the backing source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Growth counters since the heap was created.
    pub fn growth_stats(&self) -> GrowthStats {
        self.stats
    }

    /// Current size of the arena in bytes.
    pub fn arena_size(&self) -> usize {
        self.high as usize - self.low as usize
    }

    /// Allocate `size` bytes, returning the payload address.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and the payload
    /// capacity is at least `size` (zero-byte requests still get a
    /// minimum-sized block). Fails only when the backing store is exhausted,
    /// in which case existing allocations and free blocks are unaffected.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let reqsize = request_size(size).ok_or(HeapError::OutOfMemory)?;
        unsafe {
            let mut fit = self.index.best_fit(reqsize);
            if fit.is_none() && reqsize <= SMALL_BLOCK {
                // Exhaustion mid-batch is not fatal here: whatever did get
                // inserted can still serve this request, and a true miss
                // falls through to the growth path which reports it.
                let _ = self.populate_small();
                fit = self.index.best_fit(reqsize);
            }
            let block = match fit {
                Some(block) => {
                    self.index.remove(block)?;
                    self.split_tail(block, reqsize);
                    block
                }
                None => self.grow_for(reqsize)?,
            };
            block.mark_allocated();
            Ok(block.payload())
        }
    }

    /// Release the allocation behind `ptr`.
    ///
    /// A null `ptr` is a no-op. The freed block is merged with its free
    /// physical neighbors before being re-indexed. Double frees and pointers
    /// the heap never handed out are reported as faults.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a payload pointer obtained from this heap's
    /// `allocate`/`reallocate` whose payload is no longer read or written
    /// after this call.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };
        let block = self.checked_block(payload)?;

        // Clearing the allocated bit and restoring the trailing mirror turns
        // the payload back into free-block metadata space.
        block.write_free(block.size());

        let mut merged = block;
        if let Some(prev) = self.preceding_free_block(merged) {
            self.index.remove(prev)?;
            prev.write_free(prev.size() + merged.size());
            merged = prev;
        }
        if merged.next().as_ptr() < self.high {
            let next = merged.next();
            if !next.is_allocated() {
                self.index.remove(next)?;
                merged.write_free(merged.size() + next.size());
            }
        }
        self.index.insert(merged);

        // Coalescing is eager: the block we just indexed must not abut
        // another free block.
        debug_assert!(self.preceding_free_block(merged).is_none());
        debug_assert!(
            merged.next().as_ptr() >= self.high || merged.next().is_allocated()
        );
        Ok(())
    }

    /// Resize the allocation behind `ptr` to `new_size` bytes.
    ///
    /// A null `ptr` behaves as `allocate`; `new_size == 0` behaves as `free`
    /// and returns `Ok(None)`. If the block's existing capacity already
    /// covers the request the same address is returned without moving any
    /// data. Otherwise a block sized at twice the request is allocated (an
    /// amortized-growth heuristic), the payload is copied over, and the old
    /// block is freed. On failure the original allocation is left intact and
    /// still owned by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`BestFitHeap::free`] for non-null `ptr`, except the
    /// payload stays valid when an error is returned.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = self.checked_block(payload)?;
        let reqsize = request_size(new_size).ok_or(HeapError::OutOfMemory)?;
        if block.size() >= reqsize {
            return Ok(Some(payload));
        }

        // Twice the requested size, not twice the block size, so a growing
        // allocation keeps room to grow in place next time.
        let doubled = new_size.checked_mul(2).ok_or(HeapError::OutOfMemory)?;
        let new_payload = self.allocate(doubled)?;
        let new_block = Block::from_payload(new_payload);
        let ncopy = block.payload_size().min(new_block.payload_size());
        ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), ncopy);
        self.free(ptr)?;
        Ok(Some(new_payload))
    }

    /// Walk the whole heap and the free-block index, verifying their shared
    /// invariants: sane tags, trailing mirrors on free blocks, free ⇔
    /// indexed, `(size, address)` ordering, and AVL balance.
    ///
    /// This is diagnostic tooling for tests and debugging, not part of any
    /// steady-state path; it is linear in the number of blocks.
    pub fn verify(&self) -> Result<(), HeapFault> {
        let low = self.low as usize;
        let high = self.high as usize;
        unsafe {
            let mut addr = low;
            let mut free_count = 0usize;
            while addr < high {
                let block = Block::from_raw(NonNull::new_unchecked(addr as *mut u8));
                let tag = block.tag();
                let size = tag & !1;
                if size % ALIGNMENT != 0 || size < MIN_BLOCK || size > high - addr {
                    return Err(HeapFault::BadBlockSize);
                }
                if tag & 1 == 0 {
                    if block.trailing_size() != size {
                        return Err(HeapFault::TagMismatch);
                    }
                    if !self.index.contains(block) {
                        return Err(HeapFault::UnindexedFreeBlock);
                    }
                    free_count += 1;
                }
                addr += size;
            }

            let (indexed, _) = verify_subtree(self.index.root(), low, high, None, None)?;
            if indexed != free_count {
                return Err(HeapFault::StrayIndexNode);
            }
        }
        Ok(())
    }

    /// Grow the arena, tracking the boundaries and growth counters.
    fn extend_arena(&mut self, additional: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let ptr = self.source.extend(additional)?;
        if self.low.is_null() {
            debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
            self.low = ptr.as_ptr();
        } else {
            // The source contract: extensions are contiguous.
            debug_assert_eq!(ptr.as_ptr(), self.high);
        }
        self.high = unsafe { ptr.as_ptr().add(additional) };
        self.stats.extensions += 1;
        self.stats.extended_bytes += additional;
        Ok(ptr)
    }

    /// Extend the arena by one batch of small free blocks and index them all.
    ///
    /// The batch amortizes extension cost over the common small-allocation
    /// workload. The blocks are deliberately left unmerged; they only
    /// coalesce once they have been allocated and freed.
    fn populate_small(&mut self) -> Result<(), OutOfMemory> {
        for _ in 0..SMALL_BATCH {
            let ptr = self.extend_arena(SMALL_BLOCK)?;
            unsafe {
                let block = Block::from_raw(ptr);
                block.write_free(SMALL_BLOCK);
                self.index.insert(block);
            }
        }
        Ok(())
    }

    /// Shrink `block` (currently free, not indexed) to `reqsize` and index
    /// the tail remainder, unless the remainder would be below the minimum
    /// block size. The split always comes off the tail, never the head.
    unsafe fn split_tail(&mut self, block: Block, reqsize: usize) {
        let surplus = block.size() - reqsize;
        if surplus >= MIN_BLOCK {
            block.write_free(reqsize);
            let rest = block.next();
            rest.write_free(surplus);
            self.index.insert(rest);
        }
    }

    /// Produce a free block of exactly `reqsize` bytes by growing the arena.
    ///
    /// Called only when the index has no fit. If a free block ends at the
    /// arena's high boundary, the extension covers only the shortfall and the
    /// trailing block absorbs it; otherwise a fresh block covers the whole
    /// request. On exhaustion nothing is left half-done: the trailing block,
    /// if one was claimed, is re-indexed untouched.
    unsafe fn grow_for(&mut self, reqsize: usize) -> Result<Block, HeapError> {
        if let Some(last) = self.trailing_free_block() {
            // Anything this large would have been found by the fit query.
            debug_assert!(last.size() < reqsize);
            self.index.remove(last)?;
            let shortfall = reqsize - last.size();
            return match self.extend_arena(shortfall) {
                Ok(_) => {
                    last.write_free(reqsize);
                    Ok(last)
                }
                Err(oom) => {
                    self.index.insert(last);
                    Err(oom.into())
                }
            };
        }

        let ptr = self.extend_arena(reqsize)?;
        let block = Block::from_raw(ptr);
        block.write_free(reqsize);
        Ok(block)
    }

    /// The free block whose last byte is the arena's last byte, if the arena
    /// ends in a free block.
    unsafe fn trailing_free_block(&self) -> Option<Block> {
        if self.low == self.high {
            return None;
        }
        // `high` is not a block, but the probe only looks backwards from it.
        self.preceding_free_block(Block::from_raw(NonNull::new_unchecked(self.high)))
    }

    /// The free block that ends exactly where `block` begins, if there is
    /// one.
    ///
    /// The slot before `block` holds the predecessor's trailing tag only when
    /// the predecessor is free; otherwise it is payload bytes. The candidate
    /// it points at is therefore validated: plausible size, in bounds, a
    /// matching free leading tag, and present in the index. The index check
    /// makes the probe sound — a block that is indexed is a real free block,
    /// and a real free block ending here owns the trailing tag we read.
    unsafe fn preceding_free_block(&self, block: Block) -> Option<Block> {
        if block.addr() <= self.low as usize {
            return None;
        }
        let tag = block.preceding_tag();
        if tag % ALIGNMENT != 0 || tag < MIN_BLOCK || tag > block.addr() - self.low as usize {
            return None;
        }
        let prev = block.backward(tag);
        if prev.tag() == tag && self.index.contains(prev) {
            Some(prev)
        } else {
            None
        }
    }

    /// Validate that `payload` designates a live allocation of this heap and
    /// recover its block.
    unsafe fn checked_block(&self, payload: NonNull<u8>) -> Result<Block, HeapFault> {
        if payload.as_ptr() as usize % ALIGNMENT != 0 {
            return Err(HeapFault::Misaligned);
        }
        let addr = (payload.as_ptr() as usize).wrapping_sub(WORD);
        let low = self.low as usize;
        let high = self.high as usize;
        if addr < low || addr >= high {
            return Err(HeapFault::ForeignPointer);
        }
        let block = Block::from_payload(payload);
        let tag = block.tag();
        let size = tag & !1;
        if size % ALIGNMENT != 0 || size < MIN_BLOCK || size > high - addr {
            return Err(HeapFault::BadBlockSize);
        }
        if tag & 1 == 0 {
            return Err(HeapFault::DoubleFree);
        }
        Ok(block)
    }
}

/// Check one index subtree: every node is a free block inside the arena,
/// keys are strictly ordered between `lo` and `hi`, and stored heights match
/// reality within the AVL bound. Returns `(node count, height)`.
unsafe fn verify_subtree(
    node: Option<Block>,
    low: usize,
    high: usize,
    lo: Option<(usize, usize)>,
    hi: Option<(usize, usize)>,
) -> Result<(usize, usize), HeapFault> {
    let Some(cur) = node else {
        return Ok((0, 0));
    };
    let addr = cur.addr();
    if addr < low || addr >= high || addr % ALIGNMENT != 0 {
        return Err(HeapFault::StrayIndexNode);
    }
    let tag = cur.tag();
    let size = tag & !1;
    if size % ALIGNMENT != 0 || size < MIN_BLOCK || size > high - addr {
        return Err(HeapFault::StrayIndexNode);
    }
    if tag & 1 != 0 {
        return Err(HeapFault::IndexedAllocatedBlock);
    }
    let key = (size, addr);
    if lo.is_some_and(|bound| key <= bound) || hi.is_some_and(|bound| key >= bound) {
        return Err(HeapFault::BrokenOrdering);
    }
    let (lcount, lheight) = verify_subtree(cur.left(), low, high, lo, Some(key))?;
    let (rcount, rheight) = verify_subtree(cur.right(), low, high, Some(key), hi)?;
    let height = lheight.max(rheight) + 1;
    if cur.height() != height || lheight.abs_diff(rheight) >= 2 {
        return Err(HeapFault::BadHeight);
    }
    Ok((lcount + rcount + 1, height))
}

#[cfg(test)]
mod tests {
    use super::layout::{META, MIN_BLOCK, SMALL_BATCH, SMALL_BLOCK};
    use super::*;
    use crate::RegionArena;
    use core::mem::MaybeUninit;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    const BATCH_BYTES: usize = SMALL_BATCH * SMALL_BLOCK;

    fn storage(len: usize) -> Box<[MaybeUninit<u8>]> {
        vec![MaybeUninit::uninit(); len].into_boxed_slice()
    }

    fn heap(storage: &mut [MaybeUninit<u8>]) -> BestFitHeap<RegionArena<'_>> {
        BestFitHeap::new(RegionArena::new(storage)).unwrap()
    }

    #[test]
    fn init_populates_small_batch() {
        let mut storage = storage(1 << 16);
        let heap = heap(&mut storage);
        assert_eq!(
            heap.growth_stats(),
            GrowthStats {
                extensions: SMALL_BATCH,
                extended_bytes: BATCH_BYTES,
            }
        );
        assert_eq!(heap.arena_size(), BATCH_BYTES);
        heap.verify().unwrap();
    }

    #[test]
    fn init_fails_when_batch_does_not_fit() {
        let mut storage = storage(SMALL_BLOCK * 3);
        let err = BestFitHeap::new(RegionArena::new(&mut storage)).unwrap_err();
        assert_eq!(err, HeapError::OutOfMemory);
    }

    #[test]
    fn small_allocations_reuse_the_batch() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        // Payload 64 fits a small block exactly; no growth needed.
        let before = heap.growth_stats();
        let p = heap.allocate(64).unwrap();
        assert_eq!(heap.growth_stats(), before);
        heap.verify().unwrap();
        unsafe { heap.free(p.as_ptr()).unwrap() };
        heap.verify().unwrap();
    }

    #[test]
    fn small_miss_repopulates_the_batch() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        let mut live = Vec::new();
        for _ in 0..SMALL_BATCH {
            live.push(heap.allocate(64).unwrap());
        }
        assert_eq!(heap.growth_stats().extensions, SMALL_BATCH);

        // The batch is exhausted; the next small request triggers another.
        let p = heap.allocate(64).unwrap();
        assert_eq!(heap.growth_stats().extensions, 2 * SMALL_BATCH);
        assert_eq!(heap.growth_stats().extended_bytes, 2 * BATCH_BYTES);
        heap.verify().unwrap();

        unsafe {
            heap.free(p.as_ptr()).unwrap();
            for q in live {
                heap.free(q.as_ptr()).unwrap();
            }
        }
        heap.verify().unwrap();
    }

    #[test]
    fn tail_absorption_extends_by_the_shortfall_only() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        // req = 120; the last batch block (80 bytes, free, at the arena's
        // end) absorbs a 40-byte extension instead of growing by 120.
        let p = heap.allocate(100).unwrap();
        assert_eq!(
            heap.growth_stats(),
            GrowthStats {
                extensions: SMALL_BATCH + 1,
                extended_bytes: BATCH_BYTES + 40,
            }
        );
        heap.verify().unwrap();
        unsafe { heap.free(p.as_ptr()).unwrap() };
    }

    #[test]
    fn example_scenario_reuses_and_coalesces() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(200).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0xA1, 100);
            b.as_ptr().write_bytes(0xB2, 200);
            heap.free(a.as_ptr()).unwrap();
        }
        heap.verify().unwrap();

        // 90 bytes must be served from A's freed (and coalesced) region
        // without growing the arena, and must not land inside B.
        let grown = heap.growth_stats();
        let c = heap.allocate(90).unwrap();
        assert_eq!(heap.growth_stats(), grown);
        let c_addr = c.as_ptr() as usize;
        let b_addr = b.as_ptr() as usize;
        assert!(c_addr + 90 <= b_addr - META, "c overlaps b's block");

        // B's bytes survived all of the above.
        unsafe {
            let b_bytes = core::slice::from_raw_parts(b.as_ptr(), 200);
            assert!(b_bytes.iter().all(|&byte| byte == 0xB2));
        }

        unsafe {
            heap.free(c.as_ptr()).unwrap();
            heap.free(b.as_ptr()).unwrap();
        }
        heap.verify().unwrap();

        // Everything coalesced: 250 bytes fit into the merged region with no
        // further growth.
        let d = heap.allocate(250).unwrap();
        assert_eq!(heap.growth_stats(), grown);
        assert!((d.as_ptr() as usize) < heap.high as usize);
        heap.verify().unwrap();
    }

    #[test]
    fn best_fit_picks_the_tightest_block() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);

        // x and z end up physically separated by g1, so freeing both leaves
        // two distinct free blocks: 296 bytes (x merged with the last batch
        // block) and exactly 136 bytes (z).
        let x = heap.allocate(200).unwrap();
        let g1 = heap.allocate(80).unwrap();
        let z = heap.allocate(120).unwrap();
        let g2 = heap.allocate(80).unwrap();
        unsafe {
            heap.free(x.as_ptr()).unwrap();
            heap.free(z.as_ptr()).unwrap();
        }
        heap.verify().unwrap();

        // req = 128: both free blocks fit, the 136-byte one is tighter, so
        // the allocation reuses z's exact block.
        let grown = heap.growth_stats();
        let w = heap.allocate(110).unwrap();
        assert_eq!(w, z);
        assert_eq!(heap.growth_stats(), grown);
        heap.verify().unwrap();

        unsafe {
            heap.free(w.as_ptr()).unwrap();
            heap.free(g1.as_ptr()).unwrap();
            heap.free(g2.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }

    #[test]
    fn live_allocations_never_overlap() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        let sizes = [1usize, 64, 100, 7, 250, 32, 80, 500, 24];
        let mut live: Vec<(usize, usize)> = Vec::new();
        for &size in &sizes {
            let p = heap.allocate(size).unwrap().as_ptr() as usize;
            for &(start, len) in &live {
                assert!(p + size <= start || start + len <= p);
            }
            live.push((p, size));
            heap.verify().unwrap();
        }
    }

    #[test]
    fn free_faults_are_checked() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        let p = heap.allocate(64).unwrap();

        unsafe {
            // Null is a no-op, not a fault.
            heap.free(ptr::null_mut()).unwrap();

            // Misaligned and foreign pointers are rejected up front.
            assert_eq!(
                heap.free(p.as_ptr().add(1)),
                Err(HeapError::Fault(HeapFault::Misaligned))
            );
            let mut outside = 0u64;
            assert_eq!(
                heap.free((&mut outside as *mut u64).cast()),
                Err(HeapError::Fault(HeapFault::ForeignPointer))
            );

            // Double free is detected via the allocated bit.
            heap.free(p.as_ptr()).unwrap();
            assert_eq!(
                heap.free(p.as_ptr()),
                Err(HeapError::Fault(HeapFault::DoubleFree))
            );
        }
        heap.verify().unwrap();
    }

    #[test]
    fn allocate_zero_bytes_gets_a_minimum_block() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        let p = heap.allocate(0).unwrap();
        let q = heap.allocate(0).unwrap();
        assert_ne!(p, q);
        unsafe {
            heap.free(p.as_ptr()).unwrap();
            heap.free(q.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }

    #[test]
    fn exhaustion_is_clean() {
        let mut storage = storage(BATCH_BYTES + MIN_BLOCK);
        let mut heap = heap(&mut storage);
        assert_eq!(heap.allocate(10_000), Err(HeapError::OutOfMemory));
        // The failed allocation did not disturb anything.
        heap.verify().unwrap();
        let p = heap.allocate(50).unwrap();
        unsafe { heap.free(p.as_ptr()).unwrap() };
        heap.verify().unwrap();
    }

    #[test]
    fn reallocate_null_and_zero_edge_cases() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        unsafe {
            // Null behaves as allocate.
            let p = heap.reallocate(ptr::null_mut(), 40).unwrap().unwrap();
            // Zero behaves as free and returns no block.
            assert_eq!(heap.reallocate(p.as_ptr(), 0).unwrap(), None);
            assert_eq!(
                heap.free(p.as_ptr()),
                Err(HeapError::Fault(HeapFault::DoubleFree))
            );
        }
        heap.verify().unwrap();
    }

    #[test]
    fn reallocate_in_place_when_capacity_covers() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        unsafe {
            let p = heap.allocate(64).unwrap();
            // Shrinking, or growing within the block, never moves.
            assert_eq!(heap.reallocate(p.as_ptr(), 10).unwrap(), Some(p));
            assert_eq!(heap.reallocate(p.as_ptr(), 64).unwrap(), Some(p));
            heap.free(p.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }

    #[test]
    fn reallocate_growth_copies_and_overprovisions() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        unsafe {
            let p = heap.allocate(100).unwrap();
            p.as_ptr().write_bytes(0xC3, 100);

            let q = heap.reallocate(p.as_ptr(), 200).unwrap().unwrap();
            assert_ne!(q, p);
            let q_bytes = core::slice::from_raw_parts(q.as_ptr(), 100);
            assert!(q_bytes.iter().all(|&byte| byte == 0xC3));
            // The old block was freed.
            assert_eq!(
                heap.free(p.as_ptr()),
                Err(HeapError::Fault(HeapFault::DoubleFree))
            );

            // The new block was sized at twice the request, so growing again
            // within that slack stays in place.
            assert_eq!(heap.reallocate(q.as_ptr(), 380).unwrap(), Some(q));

            heap.free(q.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }

    #[test]
    fn reallocate_failure_leaves_original_intact() {
        let mut storage = storage(BATCH_BYTES + 256);
        let mut heap = heap(&mut storage);
        unsafe {
            let p = heap.allocate(100).unwrap();
            p.as_ptr().write_bytes(0xD4, 100);

            // Growing needs a 4000-byte block; the region cannot supply it.
            assert_eq!(
                heap.reallocate(p.as_ptr(), 2000),
                Err(HeapError::OutOfMemory)
            );

            // The original is untouched and still allocated.
            let bytes = core::slice::from_raw_parts(p.as_ptr(), 100);
            assert!(bytes.iter().all(|&byte| byte == 0xD4));
            heap.verify().unwrap();
            heap.free(p.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }

    #[test]
    fn churn_stays_consistent() {
        let mut storage = storage(1 << 16);
        let mut heap = heap(&mut storage);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        // A deterministic mixed workload; verify after every operation.
        for round in 0u8..60 {
            let size = 8 + (round as usize * 37) % 300;
            let p = heap.allocate(size).unwrap();
            unsafe { p.as_ptr().write_bytes(round, size) };
            live.push((p, size, round));
            heap.verify().unwrap();

            if round % 3 == 2 {
                let (p, size, pattern) = live.remove(live.len() / 2);
                unsafe {
                    let bytes = core::slice::from_raw_parts(p.as_ptr(), size);
                    assert!(bytes.iter().all(|&byte| byte == pattern));
                    heap.free(p.as_ptr()).unwrap();
                }
                heap.verify().unwrap();
            }
        }

        for (p, size, pattern) in live {
            unsafe {
                let bytes = core::slice::from_raw_parts(p.as_ptr(), size);
                assert!(bytes.iter().all(|&byte| byte == pattern));
                heap.free(p.as_ptr()).unwrap();
            }
            heap.verify().unwrap();
        }
    }

    #[cfg(feature = "allocator_api2")]
    #[test]
    fn reserve_arena_backed_heap() {
        use crate::ReserveArena;
        use allocator_api2::alloc::Global;

        let source = ReserveArena::new(Global, 1 << 16).unwrap();
        let mut heap = BestFitHeap::new(source).unwrap();
        let p = heap.allocate(1000).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0x5A, 1000);
            heap.free(p.as_ptr()).unwrap();
        }
        heap.verify().unwrap();
    }
}
