//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific number of
//! bytes and hands out 8-byte aligned payloads. It does not know about
//! [`Layout`](core::alloc::Layout)s, locking or the global allocator interface:
//! it is the single-threaded core, that the [`Allocator`](crate::Allocator)
//! wraps.
mod block;
mod check;
mod coalesce;
mod codec;
mod free_list;
mod memory;

pub use block::{ALIGNMENT, CHUNK_SIZE, MIN_BLOCK_SIZE};
pub use check::{Corruption, HeapStats};

use crate::grower::HeapGrower;
use block::{block_size_for, Block, Tag, OVERHEAD, WORD};
use free_list::FreeList;
use memory::Memory;

use core::fmt;
use core::ptr::NonNull;
use log::trace;

/// The bytes requested from the grower on initialization: a padding word, so
/// that payloads end up 8-byte aligned, followed by the sentinel block.
pub const INIT_SIZE: usize = WORD + MIN_BLOCK_SIZE;

/// The sentinel block anchoring the free list.
const ROOT: Block = Block::at(WORD);

/// The heap grower could not supply more memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap grower is out of memory")
    }
}

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or a pointer not pointing to the payload of a block).
    AllocationNotFound,
}
impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFreeDetected => f.write_str("double free detected"),
            Self::AllocationNotFound => f.write_str("pointer is not an allocation of this heap"),
        }
    }
}

/// An explicit free-list allocator over the memory of a [`HeapGrower`].
///
/// The heap consists of a padding word, the sentinel block and an arbitrary
/// sequence of allocated and free blocks. The free blocks form a
/// doubly-linked list anchored at the sentinel; allocation takes the first
/// block of that list which is large enough, splitting off the unused tail if
/// it can form a block of its own. Freed blocks are merged with their free
/// physical neighbors right away.
///
/// The allocator is not thread-safe; callers sharing it have to serialize the
/// access (the [`Allocator`](crate::Allocator) uses a spin lock for that).
///
/// All bookkeeping is relative to the grower's low address, so the allocator
/// stays consistent when it is moved. The returned payloads do not move with
/// it, if the grower stores its memory inline: such an allocator must stay in
/// place while any payload is in use.
pub struct RawAllocator<G> {
    grower: G,
    /// The free list, present once the heap is initialized.
    list: Option<FreeList>,
    /// The number of bytes obtained from the grower.
    end: usize,
}
impl<G: HeapGrower> RawAllocator<G> {
    /// Create a new, uninitialized allocator drawing its memory from `grower`.
    ///
    /// No memory is requested until the heap is initialized, either explicitly
    /// via [`init()`](Self::init) or implicitly by the first allocation.
    pub const fn new(grower: G) -> Self {
        Self {
            grower,
            list: None,
            end: 0,
        }
    }

    /// Access the underlying heap grower.
    pub fn grower(&self) -> &G {
        &self.grower
    }

    /// Whether the heap is initialized.
    pub const fn is_initialized(&self) -> bool {
        self.list.is_some()
    }

    /// The offset of the last word of the heap.
    fn high(&self) -> usize {
        self.end - WORD
    }

    fn memory(&self) -> Memory<'_> {
        // SAFETY: the grower guarantees the first `end` bytes after `low()` to
        // be exclusively ours, writable and aligned to 8.
        unsafe { Memory::new(self.grower.low(), self.end) }
    }

    /// Set up the sentinel block and the first chunk of free memory.
    ///
    /// Calling this on an initialized heap does nothing. If the sentinel could
    /// be created, but not the first chunk, the heap is still usable: it is
    /// initialized with an empty free list and will try to grow again on the
    /// next allocation.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.is_initialized() {
            return Ok(());
        }

        self.grower.grow(INIT_SIZE).ok_or(OutOfMemory)?;
        self.end = INIT_SIZE;
        let mut memory = self.memory();
        memory.write_tags(ROOT, Tag::used(MIN_BLOCK_SIZE));
        memory.set_back(ROOT, None);
        memory.set_forward(ROOT, None);
        self.list = Some(FreeList::new(ROOT));
        trace!("initialized heap with sentinel at {:p}", self.grower.low());

        self.extend(CHUNK_SIZE / WORD).map(|_| ())
    }

    /// Allocate a new memory block for at least `size` bytes.
    ///
    /// The returned payload is aligned to 8. If `size` is zero or no memory is
    /// available (and the heap could not grow), `None` is returned.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if let Err(error) = self.init() {
            trace!("cannot allocate {size} bytes: {error}");
            return None;
        }
        let Some(block_size) = block_size_for(size) else {
            trace!("cannot allocate {size} bytes: request too large");
            return None;
        };
        let list = self.list?;

        let fit = list.first_fit(&self.memory(), block_size);
        let block = match fit {
            Some(block) => block,
            None => self
                .extend(block_size.max(CHUNK_SIZE) / WORD)
                .map_err(|error| trace!("cannot allocate {size} bytes: {error}"))
                .ok()?,
        };
        let mut memory = self.memory();
        place(&mut memory, list, block, block_size);
        trace!("allocated {block_size} bytes at {}", block.offset());
        NonNull::new(memory.address(block.payload()))
    }

    /// Free a block previously returned by this allocator.
    ///
    /// Freeing the null pointer or the payload of the sentinel block does
    /// nothing. The block is merged with free neighbors immediately.
    ///
    /// # Errors
    /// Pointers, that are obviously no allocation of this heap (outside of the
    /// heap, misaligned, inconsistent tags), are reported as
    /// [`FreeError::AllocationNotFound`], blocks that are already free as
    /// [`FreeError::DoubleFreeDetected`]. In both cases the heap is left as it
    /// is.
    ///
    /// # Safety
    /// `ptr` has to be null or a pointer returned by this allocator, that was
    /// not freed since. The checks above are best effort: a pointer into the
    /// middle of a payload might look like a valid block and corrupt the heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = match self.find_block(ptr)? {
            Some(block) => block,
            None => return Ok(()),
        };
        let Some(list) = self.list else {
            return Err(FreeError::AllocationNotFound);
        };

        let high = self.high();
        let mut memory = self.memory();
        let size = memory.tag(block).size();
        memory.write_tags(block, Tag::free(size));
        coalesce::coalesce(&mut memory, list, block, high);
        trace!("freed {size} bytes at {}", block.offset());
        Ok(())
    }

    /// Resolve a payload pointer to its allocated block.
    ///
    /// The payload of the sentinel yields `Ok(None)`.
    fn find_block(&self, ptr: *mut u8) -> Result<Option<Block>, FreeError> {
        if !self.is_initialized() {
            return Err(FreeError::AllocationNotFound);
        }
        let memory = self.memory();
        let payload = memory
            .offset_of(ptr)
            .ok_or(FreeError::AllocationNotFound)?;
        if payload == ROOT.payload() {
            return Ok(None);
        }
        if payload < INIT_SIZE + WORD || payload % ALIGNMENT != 0 {
            return Err(FreeError::AllocationNotFound);
        }

        let block = Block::from_payload(payload);
        let tag = memory.tag(block);
        if tag.size() < MIN_BLOCK_SIZE || block.offset() + tag.size() > memory.len() {
            return Err(FreeError::AllocationNotFound);
        }
        if memory.footer_tag(block, tag.size()) != tag {
            return Err(FreeError::AllocationNotFound);
        }
        if !tag.is_allocated() {
            return Err(FreeError::DoubleFreeDetected);
        }
        Ok(Some(block))
    }

    /// Resize an allocation, moving its contents to a new block.
    ///
    /// A `size` of zero frees `ptr` and returns `None`, a null `ptr` is simply
    /// allocated. Otherwise a new block is allocated, the first
    /// `min(size, old payload size)` bytes are copied over and the old block
    /// is freed. If the new allocation fails (or `ptr` is no allocation of this
    /// heap), `None` is returned and the original block is left untouched.
    ///
    /// # Safety
    /// The same as for [`free()`](Self::free).
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            if let Err(error) = self.free(ptr) {
                trace!("realloc to zero bytes of {ptr:p}: {error}");
            }
            return None;
        }
        if ptr.is_null() {
            return self.alloc(size);
        }

        let block = match self.find_block(ptr) {
            Ok(Some(block)) => block,
            Ok(None) | Err(_) => {
                trace!("cannot realloc {ptr:p}: not an allocation of this heap");
                return None;
            }
        };
        let old_payload = self.memory().tag(block).size() - OVERHEAD;

        let new = self.alloc(size)?;
        let mut memory = self.memory();
        let target = memory.offset_of(new.as_ptr())?;
        memory.copy(block.payload(), target, size.min(old_payload));
        if let Err(error) = self.free(ptr) {
            trace!("realloc could not free {ptr:p}: {error}");
        }
        Some(new)
    }

    /// Allocate a zero-filled array of `count` elements of `size` bytes.
    ///
    /// Returns `None` if the total size is zero, overflows or cannot be
    /// allocated.
    pub fn calloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(size) else {
            trace!("cannot allocate {count} elements of {size} bytes: overflow");
            return None;
        };
        let ptr = self.alloc(total)?;
        let mut memory = self.memory();
        let payload = memory.offset_of(ptr.as_ptr())?;
        let block_size = memory.tag(Block::from_payload(payload)).size();
        memory.zero(payload, block_size - OVERHEAD);
        Some(ptr)
    }

    /// Grow the heap by (at least) `words` words and return the resulting free
    /// block.
    ///
    /// The request is rounded up to an even number of words and to at least
    /// one chunk. The new space becomes one free block, that is merged with a
    /// free block at the old end of the heap.
    fn extend(&mut self, words: usize) -> Result<Block, OutOfMemory> {
        let list = self.list.ok_or(OutOfMemory)?;
        let bytes = ((words + (words & 1)) * WORD).max(CHUNK_SIZE);
        if bytes > block::MAX_BLOCK_SIZE {
            return Err(OutOfMemory);
        }

        let start = self.grower.grow(bytes).ok_or(OutOfMemory)?;
        debug_assert_eq!(
            start.as_ptr() as usize,
            self.grower.low() as usize + self.end,
            "heap grower returned non-contiguous memory"
        );
        let block = Block::at(self.end);
        self.end += bytes;
        trace!("extended heap by {bytes} bytes to {} bytes", self.end);

        let high = self.high();
        let mut memory = self.memory();
        memory.write_tags(block, Tag::free(bytes));
        let merged = coalesce::coalesce(&mut memory, list, block, high);

        #[cfg(debug_assertions)]
        if let Err(corruption) = check::check(&memory, list, false) {
            panic!("heap corrupted after growth: {corruption}");
        }
        Ok(merged)
    }

    /// Check the heap for consistency.
    ///
    /// Every block is visited in address order and validated (alignment, size,
    /// matching header and footer, no adjacent free blocks), afterwards the
    /// free list is walked and compared against the free blocks found. If
    /// `verbose` is set, every block is logged at the `trace` level.
    ///
    /// This only reads the heap, so consecutive calls yield the same result.
    /// An uninitialized heap is reported as empty.
    pub fn check_heap(&self, verbose: bool) -> Result<HeapStats, Corruption> {
        match self.list {
            Some(list) => check::check(&self.memory(), list, verbose),
            None => Ok(HeapStats::default()),
        }
    }
}

/// Allocate `size` bytes of the free block `block`.
///
/// If the remainder can form a block on its own, it is split off and takes
/// over the position of `block` in the free list. Otherwise the whole block is
/// allocated and removed from the list.
fn place(memory: &mut Memory<'_>, list: FreeList, block: Block, size: usize) {
    let available = memory.tag(block).size();
    debug_assert!(available >= size);

    if available - size >= MIN_BLOCK_SIZE {
        let rest = Block::at(block.offset() + size);
        memory.write_tags(rest, Tag::free(available - size));
        list.replace(memory, block, rest);
        memory.write_tags(block, Tag::used(size));
    } else {
        list.unlink(memory, block);
        memory.write_tags(block, Tag::used(available));
    }
}

#[cfg(test)]
mod tests {
    use super::{Block, FreeError, RawAllocator, Tag, CHUNK_SIZE, INIT_SIZE, ROOT};
    use crate::grower::{HeapGrower, Region};

    use std::vec::Vec;

    type Heap = RawAllocator<Region<16384>>;

    /// The block offsets of the free list, in list order.
    fn free_list(heap: &Heap) -> Vec<usize> {
        let memory = heap.memory();
        heap.list
            .unwrap()
            .iter(&memory)
            .map(Block::offset)
            .collect()
    }

    fn offset(heap: &Heap, ptr: core::ptr::NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - heap.grower().low() as usize
    }

    #[test]
    fn init_lays_out_sentinel_and_first_chunk() {
        let mut heap = Heap::new(Region::new());
        assert!(!heap.is_initialized());
        heap.init().unwrap();

        assert_eq!(heap.end, INIT_SIZE + CHUNK_SIZE);
        assert_eq!(heap.grower().len(), INIT_SIZE + CHUNK_SIZE);
        let memory = heap.memory();
        assert_eq!(memory.tag(ROOT), Tag::used(24));
        assert_eq!(memory.tag(Block::at(INIT_SIZE)), Tag::free(CHUNK_SIZE));
        drop(memory);
        assert_eq!(free_list(&heap), [INIT_SIZE]);

        heap.init().unwrap();
        assert_eq!(heap.end, INIT_SIZE + CHUNK_SIZE, "init is idempotent");
    }

    #[test]
    fn moved_heap_stays_consistent() {
        let mut heap = Heap::new(Region::new());
        let a = heap.alloc(100).unwrap();
        let a = offset(&heap, a);
        heap.alloc(100).unwrap();
        let before = heap.check_heap(false).unwrap();

        let mut moved = std::boxed::Box::new(heap);
        assert_eq!(moved.check_heap(false), Ok(before));
        assert_eq!(free_list(&moved), [252]);

        let a = unsafe { moved.grower().low().add(a) };
        assert_eq!(unsafe { moved.free(a) }, Ok(()));
        assert_eq!(free_list(&moved), [28, 252]);
        let again = moved.alloc(100).unwrap();
        assert_eq!(again.as_ptr(), a);
    }

    #[test]
    fn init_fails_without_memory() {
        let mut heap = RawAllocator::new(Region::<16>::new());
        assert!(heap.init().is_err());
        assert!(!heap.is_initialized());
        assert_eq!(heap.alloc(8), None);
    }

    #[test]
    fn init_without_first_chunk() {
        let mut heap = RawAllocator::new(Region::<{ INIT_SIZE + 100 }>::new());
        assert!(heap.init().is_err());
        assert!(heap.is_initialized());
        assert_eq!(heap.alloc(8), None);
        assert_eq!(heap.check_heap(false).unwrap().blocks, 0);
    }

    #[test]
    fn first_allocation_initializes() {
        let mut heap = Heap::new(Region::new());
        let ptr = heap.alloc(1).unwrap();
        assert!(heap.is_initialized());
        assert_eq!(offset(&heap, ptr), INIT_SIZE + 4);
    }

    #[test]
    fn split_keeps_list_position() {
        let mut heap = Heap::new(Region::new());
        let a = heap.alloc(100).unwrap();
        let _wall = heap.alloc(100).unwrap();
        let b = heap.alloc(100).unwrap();
        let _wall = heap.alloc(100).unwrap();
        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(b.as_ptr()).unwrap();
        }
        // list: b (112 bytes), a (112 bytes), tail
        assert_eq!(free_list(&heap), [252, 28, 476]);

        // 48 bytes fit into b, the rest of it stays at the head
        heap.alloc(40).unwrap();
        assert_eq!(free_list(&heap), [300, 28, 476]);
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn exact_fit_unlinks_the_head() {
        let mut heap = Heap::new(Region::new());
        let a = heap.alloc(100).unwrap();
        let _wall = heap.alloc(100).unwrap();
        unsafe { heap.free(a.as_ptr()).unwrap() };
        assert_eq!(free_list(&heap), [28, 252]);

        // 104 of the 112 bytes are needed, the rest is too small to split off
        let again = heap.alloc(96).unwrap();
        assert_eq!(again, a);
        assert_eq!(heap.memory().tag(Block::at(28)), Tag::used(112));
        assert_eq!(free_list(&heap), [252]);
        assert_eq!(heap.memory().back(Block::at(252)), Some(ROOT));
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn exact_fit_unlinks_from_the_middle() {
        let mut heap = Heap::new(Region::new());
        let a = heap.alloc(100).unwrap();
        let _wall = heap.alloc(100).unwrap();
        let b = heap.alloc(50).unwrap();
        let _wall = heap.alloc(100).unwrap();
        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(b.as_ptr()).unwrap();
        }
        let list = free_list(&heap);
        let [head, middle, tail] = list[..] else {
            panic!("expected three free blocks");
        };

        assert_eq!(heap.alloc(100), Some(a));
        assert_eq!(free_list(&heap), [head, tail]);
        assert_eq!(middle, 28);
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn growth_merges_with_free_tail() {
        let mut heap = Heap::new(Region::new());
        let ptr = heap.alloc(5000).unwrap();
        assert_eq!(offset(&heap, ptr), INIT_SIZE + 4);
        assert_eq!(heap.end, INIT_SIZE + CHUNK_SIZE + 5008);
        assert_eq!(free_list(&heap), [INIT_SIZE + 5008]);
        assert_eq!(heap.memory().tag(Block::at(INIT_SIZE + 5008)), Tag::free(CHUNK_SIZE));
    }

    #[test]
    fn growth_after_allocated_tail() {
        let mut heap = Heap::new(Region::new());
        heap.alloc(CHUNK_SIZE - 8).unwrap();
        assert!(free_list(&heap).is_empty());

        let ptr = heap.alloc(8).unwrap();
        assert_eq!(offset(&heap, ptr), INIT_SIZE + CHUNK_SIZE + 4);
        assert_eq!(heap.end, INIT_SIZE + 2 * CHUNK_SIZE);
        assert_eq!(free_list(&heap), [INIT_SIZE + CHUNK_SIZE + 24]);
    }

    #[test]
    fn out_of_memory_leaves_heap_unchanged() {
        let mut heap = Heap::new(Region::new());
        heap.alloc(100).unwrap();
        let before = heap.check_heap(false).unwrap();

        assert_eq!(heap.alloc(20000), None);
        assert_eq!(heap.check_heap(false).unwrap(), before);
        assert!(heap.alloc(100).is_some());
    }

    #[test]
    fn oversized_requests_fail() {
        let mut heap = Heap::new(Region::new());
        assert_eq!(heap.alloc(usize::MAX), None);
        assert_eq!(heap.alloc(usize::MAX - 7), None);
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn free_rejects_foreign_pointers() {
        let mut heap = Heap::new(Region::new());
        let ptr = heap.alloc(64).unwrap();
        let mut local = 0u64;
        unsafe {
            assert_eq!(
                heap.free(core::ptr::addr_of_mut!(local).cast()),
                Err(FreeError::AllocationNotFound)
            );
            assert_eq!(
                heap.free(ptr.as_ptr().add(4)),
                Err(FreeError::AllocationNotFound)
            );
            assert_eq!(
                heap.free(heap.grower().low()),
                Err(FreeError::AllocationNotFound)
            );
        }
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn free_before_init_is_rejected() {
        let mut heap = Heap::new(Region::new());
        let mut local = 0u64;
        unsafe {
            assert_eq!(heap.free(core::ptr::null_mut()), Ok(()));
            assert_eq!(
                heap.free(core::ptr::addr_of_mut!(local).cast()),
                Err(FreeError::AllocationNotFound)
            );
        }
    }

    #[test]
    fn double_free_is_detected() {
        let mut heap = Heap::new(Region::new());
        let a = heap.alloc(64).unwrap();
        let _b = heap.alloc(64).unwrap();
        unsafe {
            heap.free(a.as_ptr()).unwrap();
            assert_eq!(heap.free(a.as_ptr()), Err(FreeError::DoubleFreeDetected));
        }
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn sentinel_cannot_be_freed() {
        let mut heap = Heap::new(Region::new());
        heap.init().unwrap();
        let before = heap.check_heap(false).unwrap();
        let sentinel = unsafe { heap.grower().low().add(ROOT.payload()) };
        unsafe { heap.free(sentinel).unwrap() };
        assert_eq!(heap.memory().tag(ROOT), Tag::used(24));
        assert_eq!(heap.check_heap(false).unwrap(), before);
    }

    #[test]
    fn realloc_rejects_foreign_pointers() {
        let mut heap = Heap::new(Region::new());
        heap.init().unwrap();
        let mut local = 0u64;
        let ptr = core::ptr::addr_of_mut!(local).cast();
        assert_eq!(unsafe { heap.realloc(ptr, 16) }, None);
        assert!(heap.check_heap(false).is_ok());
    }

    #[test]
    fn calloc_overflow() {
        let mut heap = Heap::new(Region::new());
        assert_eq!(heap.calloc(usize::MAX, 2), None);
        assert_eq!(heap.calloc(0, 8), None);
    }
}
