//! The free-block index: an AVL tree threaded through the free blocks
//! themselves.
//!
//! Each node of the tree *is* a free block; the `left`/`right` links and the
//! subtree height live in the block's first three payload slots (see the
//! layout module). This allocator cannot call another allocator for its own
//! bookkeeping, so the index borrows the very bytes it indexes.
//!
//! Blocks are ordered by `(size, address)`. Sorting by size first turns
//! best-fit into a single descent; the address tie-break gives every block a
//! distinct key, so deletion-by-identity and membership probes are exact.

use super::layout::Block;
use crate::HeapFault;
use core::cmp::Ordering;

/// The size-then-address ordered index of every free block in the arena.
#[derive(Debug)]
pub(crate) struct FreeIndex {
    root: Option<Block>,
}

/// Compare two free blocks by `(size, address)`.
///
/// Equality implies identity, because no two blocks share an address.
unsafe fn key_cmp(a: Block, b: Block) -> Ordering {
    a.size()
        .cmp(&b.size())
        .then_with(|| a.addr().cmp(&b.addr()))
}

fn height_of(node: Option<Block>) -> usize {
    // Safety of the read: `node` is an indexed free block.
    node.map_or(0, |block| unsafe { block.height() })
}

unsafe fn update_height(block: Block) {
    let height = height_of(block.left()).max(height_of(block.right())) + 1;
    block.set_height(height);
}

/// Right rotation: the left child becomes the subtree root.
unsafe fn rotate_right(block: Block) -> Block {
    let pivot = block.left().expect("left-heavy subtree has a left child");
    block.set_left(pivot.right());
    pivot.set_right(Some(block));
    update_height(block);
    update_height(pivot);
    pivot
}

/// Left rotation: the right child becomes the subtree root.
unsafe fn rotate_left(block: Block) -> Block {
    let pivot = block.right().expect("right-heavy subtree has a right child");
    block.set_right(pivot.left());
    pivot.set_left(Some(block));
    update_height(block);
    update_height(pivot);
    pivot
}

/// Restore the AVL balance of the subtree rooted at `block`, returning the
/// possibly new root. Rotation is triggered when the child heights differ by
/// two; the double rotation is chosen when the inner grandchild is the taller
/// one.
unsafe fn rebalance(block: Block) -> Block {
    let lh = height_of(block.left()) as isize;
    let rh = height_of(block.right()) as isize;
    if lh - rh == 2 {
        let left = block.left().expect("left-heavy subtree has a left child");
        if height_of(left.right()) as isize - height_of(left.left()) as isize == 1 {
            block.set_left(Some(rotate_left(left)));
        }
        rotate_right(block)
    } else if rh - lh == 2 {
        let right = block.right().expect("right-heavy subtree has a right child");
        if height_of(right.left()) as isize - height_of(right.right()) as isize == 1 {
            block.set_right(Some(rotate_right(right)));
        }
        rotate_left(block)
    } else {
        debug_assert!((lh - rh).abs() < 2);
        block
    }
}

unsafe fn insert_at(node: Option<Block>, new: Block) -> Block {
    let Some(cur) = node else {
        new.set_left(None);
        new.set_right(None);
        new.set_height(1);
        return new;
    };
    match key_cmp(new, cur) {
        Ordering::Less => cur.set_left(Some(insert_at(cur.left(), new))),
        Ordering::Greater => cur.set_right(Some(insert_at(cur.right(), new))),
        Ordering::Equal => debug_assert!(false, "block inserted into the index twice"),
    }
    update_height(cur);
    rebalance(cur)
}

unsafe fn leftmost(block: Block) -> Block {
    match block.left() {
        Some(left) => leftmost(left),
        None => block,
    }
}

unsafe fn remove_at(node: Option<Block>, target: Block) -> Result<Option<Block>, HeapFault> {
    let Some(cur) = node else {
        return Err(HeapFault::MissingFromIndex);
    };
    match key_cmp(target, cur) {
        Ordering::Less => cur.set_left(remove_at(cur.left(), target)?),
        Ordering::Greater => cur.set_right(remove_at(cur.right(), target)?),
        Ordering::Equal => {
            debug_assert_eq!(cur, target);
            match (cur.left(), cur.right()) {
                (Some(left), Some(right)) => {
                    // Replace with the leftmost block of the right subtree,
                    // splicing it out of its old position first.
                    let successor = leftmost(right);
                    let new_right = remove_at(Some(right), successor)?;
                    successor.set_left(Some(left));
                    successor.set_right(new_right);
                    update_height(successor);
                    return Ok(Some(rebalance(successor)));
                }
                (None, right) => return Ok(right),
                (left, None) => return Ok(left),
            }
        }
    }
    update_height(cur);
    Ok(Some(rebalance(cur)))
}

unsafe fn best_fit_at(node: Option<Block>, reqsize: usize) -> Option<Block> {
    let cur = node?;
    if reqsize <= cur.size() {
        // This block fits; a tighter fit can only be to the left.
        Some(best_fit_at(cur.left(), reqsize).unwrap_or(cur))
    } else {
        best_fit_at(cur.right(), reqsize)
    }
}

unsafe fn contains_at(node: Option<Block>, target: Block) -> bool {
    let Some(cur) = node else {
        return false;
    };
    match key_cmp(target, cur) {
        Ordering::Less => contains_at(cur.left(), target),
        Ordering::Greater => contains_at(cur.right(), target),
        Ordering::Equal => true,
    }
}

impl FreeIndex {
    pub(crate) fn new() -> Self {
        FreeIndex { root: None }
    }

    pub(crate) fn root(&self) -> Option<Block> {
        self.root
    }

    /// Add a free block to the index.
    ///
    /// Never fails: the node storage is the block itself.
    ///
    /// # Safety
    ///
    /// `block` must be a free block inside the arena, with valid tags, and
    /// must not already be indexed.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        self.root = Some(insert_at(self.root, block));
    }

    /// Remove a specific block from the index.
    ///
    /// Reports [`HeapFault::MissingFromIndex`] if the block is not present:
    /// that only happens when the heap's metadata and the index disagree.
    ///
    /// # Safety
    ///
    /// `block` must be a free block inside the arena with valid tags.
    pub(crate) unsafe fn remove(&mut self, block: Block) -> Result<(), HeapFault> {
        self.root = remove_at(self.root, block)?;
        Ok(())
    }

    /// The free block with the smallest `size >= reqsize`, lowest address
    /// among equals, or `None` when nothing fits.
    ///
    /// # Safety
    ///
    /// Every indexed block must have valid tags.
    pub(crate) unsafe fn best_fit(&self, reqsize: usize) -> Option<Block> {
        best_fit_at(self.root, reqsize)
    }

    /// Is this exact block currently indexed?
    ///
    /// # Safety
    ///
    /// `block`'s leading tag must be readable, and every indexed block must
    /// have valid tags.
    pub(crate) unsafe fn contains(&self, block: Block) -> bool {
        contains_at(self.root, block)
    }
}
