//! Consistency checks of the heap metadata.
//!
//! These checks are diagnostics only: the allocator never relies on them and
//! never tries to repair what they find.
use super::block::{merged_size, Block, Tag, ALIGNMENT, MIN_BLOCK_SIZE, WORD};
use super::free_list::FreeList;
use super::memory::Memory;

use core::fmt;
use log::trace;

/// Summary of a consistent heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of bytes obtained from the heap grower.
    pub heap_size: usize,
    /// The number of blocks, excluding the sentinel.
    pub blocks: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of all free blocks.
    pub free_bytes: usize,
    /// The size of the largest free block.
    pub largest_free: usize,
}

/// A violated heap invariant, found by [`check_heap()`](super::RawAllocator::check_heap).
///
/// Blocks are identified by their offset from the low end of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The sentinel block does not carry its allocated 24-byte tags.
    BadSentinel,
    /// The payload of a block is not aligned to 8.
    Misaligned { block: usize },
    /// A block size is too small or not a multiple of 8.
    BadSize { block: usize, size: usize },
    /// A block extends past the end of the heap.
    OutOfBounds { block: usize },
    /// Header and footer of a block disagree.
    TagMismatch { block: usize },
    /// A free block directly follows another free block, although both would
    /// fit into one.
    Uncoalesced { block: usize },
    /// A member of the free list is marked as allocated.
    AllocatedInFreeList { block: usize },
    /// The back link of a free-list member does not name its predecessor.
    BrokenBackLink { block: usize },
    /// The free list visits more blocks than there are free blocks.
    Cycle,
    /// The free list does not contain every free block.
    LostBlocks { listed: usize, free: usize },
}
impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadSentinel => write!(f, "bad sentinel block"),
            Self::Misaligned { block } => write!(f, "block {block} is not doubleword aligned"),
            Self::BadSize { block, size } => write!(f, "block {block} has invalid size {size}"),
            Self::OutOfBounds { block } => write!(f, "block {block} exceeds the heap"),
            Self::TagMismatch { block } => {
                write!(f, "header does not match footer of block {block}")
            }
            Self::Uncoalesced { block } => {
                write!(f, "free block {block} follows another free block")
            }
            Self::AllocatedInFreeList { block } => {
                write!(f, "allocated block {block} is in the free list")
            }
            Self::BrokenBackLink { block } => write!(f, "back link of block {block} is broken"),
            Self::Cycle => write!(f, "free list contains a cycle"),
            Self::LostBlocks { listed, free } => {
                write!(f, "free list holds {listed} of {free} free blocks")
            }
        }
    }
}

/// Walk all blocks in address order and then the free list.
///
/// `memory` has to cover exactly the heap, i.e. its end is the end of the last
/// block.
pub fn check(memory: &Memory<'_>, list: FreeList, verbose: bool) -> Result<HeapStats, Corruption> {
    let root = list.root();
    if verbose {
        trace!("heap of {} bytes, sentinel at {}", memory.len(), root.offset());
    }
    if memory.tag(root) != Tag::used(MIN_BLOCK_SIZE)
        || memory.footer_tag(root, MIN_BLOCK_SIZE) != Tag::used(MIN_BLOCK_SIZE)
    {
        return Err(Corruption::BadSentinel);
    }

    let mut stats = HeapStats {
        heap_size: memory.len(),
        ..HeapStats::default()
    };
    let first = root.offset() + MIN_BLOCK_SIZE;
    let mut offset = first;
    let mut previous_free = None;
    while offset < memory.len() {
        let block = Block::at(offset);
        let tag = check_block(memory, first, block)?;
        if verbose {
            trace!(
                "{offset}: {} bytes, {}",
                tag.size(),
                if tag.is_allocated() { "allocated" } else { "free" }
            );
        }

        if tag.is_free() {
            if previous_free.and_then(|size| merged_size(size, tag.size())).is_some() {
                return Err(Corruption::Uncoalesced { block: offset });
            }
            stats.free_blocks += 1;
            stats.free_bytes += tag.size();
            stats.largest_free = stats.largest_free.max(tag.size());
        }
        previous_free = tag.is_free().then_some(tag.size());
        stats.blocks += 1;
        offset += tag.size();
    }

    let mut listed = 0;
    let mut previous = root;
    for block in list.iter(memory) {
        listed += 1;
        if listed > stats.free_blocks {
            return Err(Corruption::Cycle);
        }

        let tag = check_block(memory, first, block)?;
        if tag.is_allocated() {
            return Err(Corruption::AllocatedInFreeList {
                block: block.offset(),
            });
        }
        if memory.back(block) != Some(previous) {
            return Err(Corruption::BrokenBackLink {
                block: block.offset(),
            });
        }
        previous = block;
    }
    if listed != stats.free_blocks {
        return Err(Corruption::LostBlocks {
            listed,
            free: stats.free_blocks,
        });
    }

    Ok(stats)
}

/// Validate the placement and the tags of a single block.
fn check_block(memory: &Memory<'_>, first: usize, block: Block) -> Result<Tag, Corruption> {
    let offset = block.offset();
    if offset < first || offset + MIN_BLOCK_SIZE > memory.len() {
        return Err(Corruption::OutOfBounds { block: offset });
    }
    if block.payload() % ALIGNMENT != 0 || offset % WORD != 0 {
        return Err(Corruption::Misaligned { block: offset });
    }

    let tag = memory.tag(block);
    let size = tag.size();
    if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
        return Err(Corruption::BadSize {
            block: offset,
            size,
        });
    }
    if offset + size > memory.len() {
        return Err(Corruption::OutOfBounds { block: offset });
    }
    if memory.footer_tag(block, size) != tag {
        return Err(Corruption::TagMismatch { block: offset });
    }
    Ok(tag)
}
