//! The explicit free list.
//!
//! All free blocks are threaded into one doubly-linked list, which is anchored
//! at the sentinel block. The sentinel is allocated and never handed out; its
//! forward link is the head of the list. The list order is unrelated to the
//! physical order of the blocks: blocks are always inserted at the head, so the
//! most recently freed (or merged) memory is found first.
use super::block::Block;
use super::memory::Memory;

/// Handle to the free list anchored at a sentinel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeList {
    root: Block,
}
impl FreeList {
    /// Refer to the free list anchored at the given sentinel.
    pub const fn new(root: Block) -> Self {
        Self { root }
    }

    /// The sentinel block anchoring the list.
    pub const fn root(self) -> Block {
        self.root
    }

    /// The first free block, if there is any.
    pub fn head(self, memory: &Memory<'_>) -> Option<Block> {
        memory.forward(self.root)
    }

    /// Insert a free block in front of all other blocks.
    pub fn insert_at_head(self, memory: &mut Memory<'_>, block: Block) {
        let head = memory.forward(self.root);
        memory.set_back(block, Some(self.root));
        memory.set_forward(block, head);
        if let Some(head) = head {
            memory.set_back(head, Some(block));
        }
        memory.set_forward(self.root, Some(block));
    }

    /// Remove a block from the list by connecting its neighbors.
    pub fn unlink(self, memory: &mut Memory<'_>, block: Block) {
        let back = memory.back(block);
        let forward = memory.forward(block);
        if let Some(back) = back {
            memory.set_forward(back, forward);
        }
        if let Some(forward) = forward {
            memory.set_back(forward, back);
        }
    }

    /// Let `new` take over the list position of `old`.
    ///
    /// This is used when the tail of a split block stays free: it inherits
    /// both links and its neighbors are retargeted to it. The links of `old`
    /// have to be intact when this is called.
    pub fn replace(self, memory: &mut Memory<'_>, old: Block, new: Block) {
        let back = memory.back(old);
        let forward = memory.forward(old);
        memory.set_back(new, back);
        memory.set_forward(new, forward);
        if let Some(back) = back {
            memory.set_forward(back, Some(new));
        }
        if let Some(forward) = forward {
            memory.set_back(forward, Some(new));
        }
    }

    /// Find the first block in list order, that can hold `size` bytes.
    pub fn first_fit(self, memory: &Memory<'_>, size: usize) -> Option<Block> {
        self.iter(memory).find(|&block| {
            let tag = memory.tag(block);
            !tag.is_allocated() && tag.size() >= size
        })
    }

    /// Iterate over the free blocks in list order.
    pub fn iter<'list, 'heap>(self, memory: &'list Memory<'heap>) -> FreeBlocks<'list, 'heap> {
        FreeBlocks {
            memory,
            next: self.head(memory),
        }
    }
}

/// Iterator over the members of a [`FreeList`].
pub struct FreeBlocks<'list, 'heap> {
    memory: &'list Memory<'heap>,
    next: Option<Block>,
}
impl Iterator for FreeBlocks<'_, '_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        self.next = self.memory.forward(block);
        Some(block)
    }
}

/// Write a fresh free block and put it at the head of the list.
#[cfg(test)]
pub(crate) fn push_free(memory: &mut Memory<'_>, list: FreeList, block: Block, size: usize) {
    memory.write_tags(block, super::block::Tag::free(size));
    list.insert_at_head(memory, block);
}
