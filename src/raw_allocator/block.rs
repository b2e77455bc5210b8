//! The in-band block format.
//!
//! Every block starts with a header word and ends with a footer word, both
//! holding the same [`Tag`]. A free block additionally stores two links (the
//! back link and the forward link) directly after its header:
//! ```text
//! allocated: | tag | payload (size - 8 bytes) ............ | tag |
//! free:      | tag | back (lo, hi) | forward (lo, hi) | .. | tag |
//!            ^     ^
//!            |     `-- payload, 8-byte aligned
//!            `-- block offset, always 4 mod 8
//! ```

/// The width of a single metadata word (a header, a footer or a link half).
pub const WORD: usize = 4;

/// The alignment guaranteed for every payload.
pub const ALIGNMENT: usize = 8;

/// The combined size of header and footer.
pub const OVERHEAD: usize = 2 * WORD;

/// The smallest block able to hold the header, both links and the footer.
pub const MIN_BLOCK_SIZE: usize = 24;

/// The granularity of heap growth.
pub const CHUNK_SIZE: usize = 1 << 12;

/// The largest block size representable in a tag.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

const ALLOCATED: u32 = 0x1;

/// A boundary tag: the size of a block and whether it is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    size: usize,
    allocated: bool,
}
impl Tag {
    /// Create a tag for a free block of the given size.
    pub const fn free(size: usize) -> Self {
        Self {
            size,
            allocated: false,
        }
    }

    /// Create a tag for an allocated block of the given size.
    pub const fn used(size: usize) -> Self {
        Self {
            size,
            allocated: true,
        }
    }

    /// The size of the block in bytes, including all of its metadata.
    pub const fn size(self) -> usize {
        self.size
    }

    /// Whether the block is handed out to a caller.
    pub const fn is_allocated(self) -> bool {
        self.allocated
    }

    /// Whether the block is free. A zero-sized tag is not a block at all.
    pub const fn is_free(self) -> bool {
        !self.allocated && self.size != 0
    }

    /// Pack the tag into its in-memory representation.
    ///
    /// The size is a multiple of 8, so its low bits are available for the
    /// allocated flag.
    pub const fn pack(self) -> u32 {
        debug_assert!(self.size % ALIGNMENT == 0);
        debug_assert!(self.size <= MAX_BLOCK_SIZE);
        self.size as u32 | if self.allocated { ALLOCATED } else { 0 }
    }

    /// Read a tag from its in-memory representation.
    pub const fn unpack(raw: u32) -> Self {
        Self {
            size: (raw & !(ALIGNMENT as u32 - 1)) as usize,
            allocated: raw & ALLOCATED != 0,
        }
    }
}

/// The offset of a block, i.e. of its header word, from the low end of the
/// heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);
impl Block {
    /// Refer to the block whose header is at `offset`.
    pub const fn at(offset: usize) -> Self {
        Self(offset)
    }

    /// The block owning the payload at `payload`.
    pub const fn from_payload(payload: usize) -> Self {
        Self(payload - WORD)
    }

    /// The offset of the header word.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// The offset of the payload handed out to the caller.
    pub const fn payload(self) -> usize {
        self.0 + WORD
    }

    /// The offset of the footer word, given the block's size.
    pub const fn footer(self, size: usize) -> usize {
        self.0 + size - WORD
    }

    /// The offset of the low half of the back link.
    pub(crate) const fn back_link(self) -> usize {
        self.0 + WORD
    }

    /// The offset of the low half of the forward link.
    pub(crate) const fn forward_link(self) -> usize {
        self.0 + 3 * WORD
    }
}

/// Convert a requested payload size into the size of the block serving it.
///
/// Small requests get the minimum block, everything else is rounded up to the
/// next multiple of 8 after adding room for header and footer. Sizes whose
/// block would not fit into a tag yield `None`.
pub const fn block_size_for(request: usize) -> Option<usize> {
    if request <= MIN_BLOCK_SIZE - OVERHEAD {
        return Some(MIN_BLOCK_SIZE);
    }
    if request > MAX_BLOCK_SIZE - OVERHEAD {
        return None;
    }
    Some(ALIGNMENT * ((request + OVERHEAD + (ALIGNMENT - 1)) / ALIGNMENT))
}

/// The size of the block formed by merging two adjacent blocks, or `None` if
/// it would not fit into a tag.
pub const fn merged_size(first: usize, second: usize) -> Option<usize> {
    match first.checked_add(second) {
        Some(size) if size <= MAX_BLOCK_SIZE => Some(size),
        _ => None,
    }
}
