#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::fmt;

mod heap;
mod lock;
mod source;

pub use heap::{BestFitHeap, GrowthStats};
pub use lock::{Lock, LockedHeap, SingleThreadedLock};
pub use source::{ArenaSource, RegionArena, ReserveArena};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// The alignment unit of the heap.
///
/// Every block address, block size, and payload address is a multiple of this.
/// It is also the width of one metadata slot (a boundary tag or an embedded
/// index field), so the low bits of a size slot are available for flags.
pub const ALIGNMENT: usize = 8;

/// The arena's backing store cannot supply any more memory.
///
/// This is the only failure mode of [`ArenaSource::extend`], and the only
/// error `allocate` can report on a well-formed heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("arena backing store exhausted")
    }
}

/// A detected violation of the heap's invariants.
///
/// Allocators in this family traditionally treat these conditions (double
/// free, removing an unindexed block, corrupt tags) as undefined behavior.
/// Here they are surfaced as checked faults instead. A fault means
/// the heap's metadata no longer describes its memory; callers cannot recover
/// locally beyond abandoning the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeapFault {
    /// The pointer is not aligned to [`ALIGNMENT`], so it cannot be a payload
    /// address this heap handed out.
    Misaligned,
    /// The pointer does not lie within the arena.
    ForeignPointer,
    /// The block behind the pointer is not currently allocated.
    DoubleFree,
    /// A block that should be in the free-block index was not found there.
    MissingFromIndex,
    /// A block's size slot holds an impossible value.
    BadBlockSize,
    /// A free block's leading and trailing tags disagree.
    TagMismatch,
    /// A free block is not reachable from the index root.
    UnindexedFreeBlock,
    /// A block reachable from the index root is marked allocated.
    IndexedAllocatedBlock,
    /// The index holds a node that is not a block boundary in the arena.
    StrayIndexNode,
    /// The index's `(size, address)` ordering is violated.
    BrokenOrdering,
    /// A stored subtree height is wrong or a subtree is out of balance.
    BadHeight,
}

impl fmt::Display for HeapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HeapFault::Misaligned => "pointer is not aligned to the heap's alignment unit",
            HeapFault::ForeignPointer => "pointer does not lie within the arena",
            HeapFault::DoubleFree => "block is not currently allocated",
            HeapFault::MissingFromIndex => "block is missing from the free-block index",
            HeapFault::BadBlockSize => "block size slot holds an impossible value",
            HeapFault::TagMismatch => "free block's leading and trailing tags disagree",
            HeapFault::UnindexedFreeBlock => "free block is not reachable from the index root",
            HeapFault::IndexedAllocatedBlock => "indexed block is marked allocated",
            HeapFault::StrayIndexNode => "index holds a node that is not a block in the arena",
            HeapFault::BrokenOrdering => "free-block index ordering is violated",
            HeapFault::BadHeight => "free-block index is out of balance",
        };
        f.write_str(msg)
    }
}

/// The error type for heap operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The backing store is exhausted. The heap is still consistent and the
    /// operation had no observable effect on existing allocations.
    OutOfMemory,
    /// An invariant violation was detected; see [`HeapFault`].
    Fault(HeapFault),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => OutOfMemory.fmt(f),
            HeapError::Fault(fault) => fault.fmt(f),
        }
    }
}

impl From<OutOfMemory> for HeapError {
    fn from(_: OutOfMemory) -> Self {
        HeapError::OutOfMemory
    }
}

impl From<HeapFault> for HeapError {
    fn from(fault: HeapFault) -> Self {
        HeapError::Fault(fault)
    }
}
