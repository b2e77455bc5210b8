use super::block::{Block, Tag, ALIGNMENT, WORD};
use super::codec;

use core::marker::PhantomData;
use core::ptr;

/// A typed cursor over the bytes of the heap region.
///
/// All metadata reads and writes go through this type, so that the offset
/// arithmetic for headers, footers and links lives in exactly one place. Every
/// access is bounds- and alignment-checked at runtime; a failing check means
/// that the heap metadata is corrupted, which the allocator cannot recover
/// from.
pub struct Memory<'heap> {
    base: *mut u8,
    len: usize,
    _heap: PhantomData<&'heap mut [u8]>,
}
impl<'heap> Memory<'heap> {
    /// Create a view over `len` bytes starting at `base`.
    ///
    /// # Safety
    /// The bytes `base..base + len` have to be valid for reads and writes for
    /// the lifetime `'heap` and must not be accessed by other means while the
    /// view is in use (the payloads of allocated blocks excluded). `base` must
    /// be aligned to 8.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        debug_assert!(base as usize % ALIGNMENT == 0);
        Self {
            base,
            len,
            _heap: PhantomData,
        }
    }

    /// The number of bytes covered by this view.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Translate an offset into an address, e.g. to hand out a payload.
    ///
    /// # Panics
    /// This function panics if the offset is outside of the view.
    pub fn address(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "offset {offset} outside of the heap");
        // SAFETY: the offset is in bounds of the region (see above).
        unsafe { self.base.add(offset) }
    }

    /// Translate an address back into an offset, if it lies inside the view.
    pub fn offset_of(&self, address: *const u8) -> Option<usize> {
        let offset = (address as usize).checked_sub(self.base as usize)?;
        (offset < self.len).then_some(offset)
    }

    /// Read the metadata word at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of 4 or the word
    /// would extend past the end of the view.
    #[allow(clippy::cast_ptr_alignment)] // alignment is asserted
    fn word(&self, offset: usize) -> u32 {
        assert!(offset % WORD == 0);
        assert!(offset + WORD <= self.len);

        // SAFETY: the word is in bounds (checked above) and aligned, since the
        // base is aligned to 8 and the offset is a multiple of 4. The caller of
        // `new()` guaranteed the memory to be readable.
        unsafe { self.base.add(offset).cast::<u32>().read() }
    }

    /// Write the metadata word at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of 4 or the word
    /// would extend past the end of the view.
    #[allow(clippy::cast_ptr_alignment)] // alignment is asserted
    fn set_word(&mut self, offset: usize, value: u32) {
        assert!(offset % WORD == 0);
        assert!(offset + WORD <= self.len);

        // SAFETY: same as `word()`
        unsafe { self.base.add(offset).cast::<u32>().write(value) }
    }

    /// Read the header tag of a block.
    pub fn tag(&self, block: Block) -> Tag {
        Tag::unpack(self.word(block.offset()))
    }

    /// Read the footer tag of a block of the given size.
    pub fn footer_tag(&self, block: Block, size: usize) -> Tag {
        Tag::unpack(self.word(block.footer(size)))
    }

    /// Read the footer tag of the block physically preceding `block`.
    pub fn preceding_tag(&self, block: Block) -> Tag {
        Tag::unpack(self.word(block.offset() - WORD))
    }

    /// Write both the header and the footer of a block.
    ///
    /// The footer is located using the size stored in the tag.
    pub fn write_tags(&mut self, block: Block, tag: Tag) {
        let raw = tag.pack();
        self.set_word(block.offset(), raw);
        self.set_word(block.footer(tag.size()), raw);
    }

    fn link(&self, offset: usize) -> Option<Block> {
        match codec::decode(self.word(offset), self.word(offset + WORD)) {
            0 => None,
            offset => Some(Block::at(offset)),
        }
    }

    fn set_link(&mut self, offset: usize, target: Option<Block>) {
        let (low, high) = codec::encode(target.map_or(0, Block::offset));
        self.set_word(offset, low);
        self.set_word(offset + WORD, high);
    }

    /// The free-list predecessor of a free block.
    pub fn back(&self, block: Block) -> Option<Block> {
        self.link(block.back_link())
    }

    /// Set the free-list predecessor of a free block.
    pub fn set_back(&mut self, block: Block, target: Option<Block>) {
        self.set_link(block.back_link(), target);
    }

    /// The free-list successor of a free block.
    pub fn forward(&self, block: Block) -> Option<Block> {
        self.link(block.forward_link())
    }

    /// Set the free-list successor of a free block.
    pub fn set_forward(&mut self, block: Block, target: Option<Block>) {
        self.set_link(block.forward_link(), target);
    }

    /// Copy `count` bytes between two non-overlapping ranges of the view.
    ///
    /// # Panics
    /// This function panics if either range is not inside the view or the
    /// ranges overlap.
    pub fn copy(&mut self, from: usize, to: usize, count: usize) {
        assert!(from + count <= self.len && to + count <= self.len);
        assert!(from + count <= to || to + count <= from, "ranges overlap");

        // SAFETY: both ranges are in bounds and disjoint (checked above).
        unsafe { ptr::copy_nonoverlapping(self.base.add(from), self.base.add(to), count) }
    }

    /// Overwrite `count` bytes starting at `offset` with zeros.
    ///
    /// # Panics
    /// This function panics if the range is not inside the view.
    pub fn zero(&mut self, offset: usize, count: usize) {
        assert!(offset + count <= self.len);

        // SAFETY: the range is in bounds (checked above).
        unsafe { ptr::write_bytes(self.base.add(offset), 0, count) }
    }
}
