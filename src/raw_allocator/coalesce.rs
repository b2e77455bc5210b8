//! Boundary-tag coalescing of physically adjacent free blocks.
//!
//! Whenever a block becomes free (because it was freed or because the heap
//! grew), its physical neighbors are inspected: the footer directly in front of
//! the block belongs to the preceding block, the header directly after the
//! block belongs to the following one. Each free neighbor is removed from the
//! free list and merged with the block, and the result is inserted at the head
//! of the list. Therefore there are never two adjacent free blocks, unless
//! their combined size does not fit into a tag.
use super::block::{merged_size, Block, Tag};
use super::free_list::FreeList;
use super::memory::Memory;

use log::trace;

/// The physical neighborhood of a block that just became free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Neighbors {
    /// Neither neighbor is free.
    Isolated,
    /// Only the following block is free.
    Following(Block, usize),
    /// Only the preceding block is free.
    Preceding(Block, usize),
    /// Both neighbors are free.
    Both {
        preceding: (Block, usize),
        following: (Block, usize),
    },
}

/// Merge the free block `block` with its free neighbors and put the result
/// into the free list.
///
/// `high` is the offset of the last word of the heap: a following block is only
/// considered, if its header lies at or below it. The block must carry a free
/// tag but must not be a member of the free list yet. Returns the (possibly
/// merged) block, which is the new head of the free list.
pub fn coalesce(memory: &mut Memory<'_>, list: FreeList, block: Block, high: usize) -> Block {
    let size = memory.tag(block).size();
    debug_assert!(memory.tag(block).is_free());

    let merged = match neighbors(memory, block, size, high) {
        Neighbors::Isolated => block,
        Neighbors::Following(next, next_size) => {
            list.unlink(memory, next);
            memory.write_tags(block, Tag::free(size + next_size));
            block
        }
        Neighbors::Preceding(prev, prev_size) => {
            list.unlink(memory, prev);
            memory.write_tags(prev, Tag::free(prev_size + size));
            prev
        }
        Neighbors::Both {
            preceding: (prev, prev_size),
            following: (next, next_size),
        } => {
            list.unlink(memory, prev);
            list.unlink(memory, next);
            memory.write_tags(prev, Tag::free(prev_size + size + next_size));
            prev
        }
    };
    trace!(
        "coalesced block {} into block {} of size {}",
        block.offset(),
        merged.offset(),
        memory.tag(merged).size()
    );

    list.insert_at_head(memory, merged);
    merged
}

fn neighbors(memory: &Memory<'_>, block: Block, size: usize, high: usize) -> Neighbors {
    let before = memory.preceding_tag(block);
    let preceding = before
        .is_free()
        .then(|| (Block::at(block.offset() - before.size()), before.size()));

    let next = Block::at(block.offset() + size);
    let following = (next.offset() <= high)
        .then(|| memory.tag(next))
        .filter(|tag| tag.is_free())
        .map(|tag| (next, tag.size()));

    plan(preceding, size, following)
}

/// Decide which free neighbors to merge with a block of `size` bytes.
///
/// A neighbor is left alone, if the merged block would not fit into a tag.
fn plan(
    preceding: Option<(Block, usize)>,
    size: usize,
    following: Option<(Block, usize)>,
) -> Neighbors {
    let with_preceding = preceding.filter(|&(_, prev)| merged_size(prev, size).is_some());
    let with_following = following.filter(|&(_, next)| merged_size(size, next).is_some());
    let with_both = |prev: usize, next: usize| {
        merged_size(prev, size).and_then(|merged| merged_size(merged, next))
    };

    match (with_preceding, with_following) {
        (None, None) => Neighbors::Isolated,
        (None, Some((next, next_size))) => Neighbors::Following(next, next_size),
        (Some((prev, prev_size)), None) => Neighbors::Preceding(prev, prev_size),
        (Some(preceding), Some(following)) if with_both(preceding.1, following.1).is_some() => {
            Neighbors::Both {
                preceding,
                following,
            }
        }
        (Some((prev, prev_size)), Some(_)) => Neighbors::Preceding(prev, prev_size),
    }
}
