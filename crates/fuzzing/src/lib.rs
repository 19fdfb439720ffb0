//! Shared fuzzing and testing infrastructure for `bestfit-heap`.
//!
//! The core of this crate is [`Ops`]: a mutatable, serializable sequence of
//! heap operations, plus an interpreter that replays them against a real heap
//! while maintaining a model of what should be live. The interpreter checks
//! the heap's behavior against the model after every step: alignment,
//! capacity, non-overlap, byte preservation across moves, clean failure, and
//! a full structural verification of the heap's metadata.

use bestfit_heap::{BestFitHeap, HeapError, RegionArena, ALIGNMENT};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, mem::MaybeUninit, ptr::NonNull};

/// A requested allocation size.
//
// Note: a newtype rather than a bare `u32` so that we can hang a bounded
// default mutator off of it; orphan rules won't let us replace the stock
// `u32` mutator.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct ReqSize(pub u32);

impl DefaultMutate for ReqSize {
    type DefaultMutate = ReqSizeMutator;
}

/// A mutator for [`ReqSize`] with a configurable maximum.
///
/// Unbounded sizes would make every op an out-of-memory probe; keeping
/// requests small relative to the arena exercises the interesting paths
/// (batching, splitting, coalescing, tail absorption) instead.
#[derive(Debug)]
pub struct ReqSizeMutator {
    pub max_size: u32,
}

impl Default for ReqSizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

impl Mutate<ReqSize> for ReqSizeMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        size: &mut ReqSize,
    ) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max as usize + 1).unwrap() as u32;
            Ok(())
        })?;
        Ok(())
    }
}

impl Generate<ReqSize> for ReqSizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<ReqSize> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(ReqSize(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: ReqSize },
    Free { id: u32 },
    Realloc { id: u32, new_size: ReqSize },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<ReqSize>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    new_size: m::default::<ReqSize>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Free { id } | Op::Realloc { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free an existing allocation. Frees of never-allocated ids are
        // mostly no-ops in the interpreter, so biasing toward live ids is
        // what actually exercises the coalescer.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let new_size = m::default::<ReqSize>().generate(ctx)?;
                    let realloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(realloc_index, Op::Realloc { id, new_size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Drop the last operation, if any. Used to shrink a sequence until it
    /// fits a serialization budget.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a heap over an arena of the given
    /// capacity.
    pub fn run(&self, arena_capacity: usize) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut storage = vec![MaybeUninit::<u8>::uninit(); arena_capacity];
        let mut heap = match BestFitHeap::new(RegionArena::new(&mut storage)) {
            Ok(heap) => heap,
            // An arena too small for the initial batch fails cleanly; there
            // is nothing further to test.
            Err(HeapError::OutOfMemory) => return Ok(()),
            Err(e) => return Err(format!("heap construction fault: {e}")),
        };

        // Keep the model well inside the arena so most operations succeed;
        // out-of-memory is still reachable through fragmentation.
        let allocation_limit = arena_capacity / 2;
        let mut live = LiveMap::new(allocation_limit);

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, size } => {
                    let size = size.0 as usize;
                    if live.beyond_allocation_limit(size) {
                        continue;
                    }
                    match heap.allocate(size) {
                        Ok(ptr) => {
                            if let Some(old) = live.remove(*id) {
                                free_checked(&mut heap, *id, old)?;
                            }
                            new_alloc(&mut live, *id, ptr, size)?;
                        }
                        Err(HeapError::OutOfMemory) => {}
                        Err(e) => return Err(format!("allocate faulted: {e}")),
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        free_checked(&mut heap, *id, alloc)?;
                    }
                }

                Op::Realloc { id, new_size } => {
                    let new_size = new_size.0 as usize;
                    let Some(old) = live.remove(*id) else {
                        continue;
                    };
                    if live.beyond_allocation_limit(new_size) {
                        live.insert(*id, old);
                        continue;
                    }

                    assert_pattern(&old, "bytes changed while allocation was live")?;
                    match unsafe { heap.reallocate(old.ptr.as_ptr(), new_size) } {
                        Ok(Some(new_ptr)) => {
                            log::debug!(
                                "resized id{id}: {:p}/{} -> {new_ptr:p}/{new_size}",
                                old.ptr,
                                old.size,
                            );
                            let preserved = old.size.min(new_size);
                            let slice = unsafe {
                                std::slice::from_raw_parts(new_ptr.as_ptr(), preserved)
                            };
                            ensure!(
                                slice.iter().all(|b| *b == old.pattern),
                                "original bytes not carried into the resized allocation",
                            );
                            new_alloc(&mut live, *id, new_ptr, new_size)?;
                        }
                        Ok(None) => {
                            // Resizing to zero bytes frees the allocation.
                            ensure!(
                                new_size == 0,
                                "reallocation returned no block for a non-zero size",
                            );
                        }
                        Err(HeapError::OutOfMemory) => {
                            // The original must have survived the failure.
                            assert_pattern(&old, "failed reallocation disturbed the original")?;
                            live.insert(*id, old);
                        }
                        Err(e) => return Err(format!("reallocate faulted: {e}")),
                    }
                }
            }

            heap.verify()
                .map_err(|fault| format!("heap verification failed after {op:?}: {fault}"))?;
        }

        // Finally, free any remaining live allocations.
        let remaining: Vec<_> = live.map.keys().copied().collect();
        for id in remaining {
            let alloc = live.remove(id).unwrap();
            free_checked(&mut heap, id, alloc)?;
        }
        heap.verify()
            .map_err(|fault| format!("heap verification failed after teardown: {fault}"))?;

        Ok(())
    }
}

/// Check properties of a fresh allocation and add it to the live set.
fn new_alloc(
    live: &mut LiveMap,
    id: u32,
    ptr: NonNull<u8>,
    size: usize,
) -> Result<(), String> {
    log::debug!("new allocation: id{id} -> {{ address: {ptr:p}, size: {size} }}");

    ensure!(
        ptr.as_ptr() as usize % ALIGNMENT == 0,
        "allocation is not aligned to the heap's alignment unit",
    );

    let start = ptr.as_ptr() as usize;
    let end = start + size;
    for other in live.map.values() {
        let other_start = other.ptr.as_ptr() as usize;
        let other_end = other_start + other.size;
        ensure!(
            end <= other_start || other_end <= start,
            "two distinct live allocations should never overlap",
        );
    }

    // Each id gets its own fill pattern, so a block that gets handed out
    // twice, or a copy from the wrong source, shows up as a byte mismatch.
    let pattern = pattern_for(id);
    unsafe { ptr.as_ptr().write_bytes(pattern, size) };

    live.insert(id, LiveAlloc { ptr, size, pattern });
    Ok(())
}

/// Check that a live allocation still holds its fill pattern, poison it, and
/// free it.
fn free_checked<S: bestfit_heap::ArenaSource>(
    heap: &mut BestFitHeap<S>,
    id: u32,
    alloc: LiveAlloc,
) -> Result<(), String> {
    log::debug!("freeing id{id} -> {alloc:?}");
    assert_pattern(&alloc, "bytes changed while allocation was live")?;
    unsafe {
        alloc.ptr.as_ptr().write_bytes(FREE_POISON_PATTERN, alloc.size);
        heap.free(alloc.ptr.as_ptr())
            .map_err(|e| format!("freeing a live allocation failed: {e}"))?;
    }
    Ok(())
}

fn assert_pattern(alloc: &LiveAlloc, what: &str) -> Result<(), String> {
    let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.size) };
    ensure!(slice.iter().all(|b| *b == alloc.pattern), "{what}");
    Ok(())
}

fn pattern_for(id: u32) -> u8 {
    // Anything non-zero and id-dependent; freed memory is poisoned with
    // `FREE_POISON_PATTERN`, so the live pattern must avoid it.
    let byte = (id as u8).wrapping_mul(167).wrapping_add(13);
    if byte == FREE_POISON_PATTERN || byte == 0 {
        0x5A
    } else {
        byte
    }
}

// Freed memory is filled with a poison pattern before the free, to catch a
// heap that hands the same bytes to two owners or reads payload it should
// not.
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// The requested size; the block's real capacity may be larger.
    size: usize,
    /// Every byte of the allocation holds this value while it is live.
    pattern: u8,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, pattern } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", size)
            .field("pattern", pattern)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,

    /// Sum of the requested sizes of all live allocations.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    /// Remove a live allocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }
}
