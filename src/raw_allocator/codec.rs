//! Storage of free-list links in two 32-bit words.
//!
//! Every piece of metadata inside the heap is a 4-byte word, and a free block
//! is only guaranteed to be 4-byte aligned at its link fields. Therefore a
//! link (a heap offset) is split into a low and a high half, each of which is
//! stored in its own word. The null link is the pair `(0, 0)`, which can never
//! name a block, as offset 0 is the padding word in front of the sentinel.

/// Split a heap offset into its `(low, high)` halves.
pub const fn encode(offset: usize) -> (u32, u32) {
    let offset = offset as u64;
    (offset as u32, (offset >> 32) as u32)
}

/// Join the `(low, high)` halves of a heap offset.
pub const fn decode(low: u32, high: u32) -> usize {
    ((high as u64) << 32 | low as u64) as usize
}
