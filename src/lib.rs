//! Explicit free-list allocator with boundary-tag coalescing
//!
//! This crate provides a drop-in dynamic memory allocator (`init`, `alloc`,
//! `free`, `realloc` and `calloc`) over a single contiguous, grow-only memory
//! region. All bookkeeping is stored inside the managed memory itself, there
//! are no auxiliary data structures. There are two entry points:
//! - [`RawAllocator`] is the single-threaded core, that draws its memory from
//!   any [`HeapGrower`] (e.g. a [`Region`]),
//! - [`Allocator`] wraps the core and a fixed-size [`Region`] behind a spin
//!   lock and implements [`core::alloc::GlobalAlloc`], so that it can serve as
//!   the global allocator of a `#![no_std]` program.
//!
//! # Usage
//! Just copy and paste the following code snipped into your binary crate and
//! potentially adjust the number of bytes of the heap (here 1M):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: tagalloc::Allocator<{ 1024 * 1024 }> = tagalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! The core can be used directly as well:
//! ```
//! use tagalloc::{RawAllocator, Region};
//!
//! let mut heap = RawAllocator::new(Region::<16384>::new());
//! heap.init().unwrap();
//! let p1 = heap.alloc(100).unwrap();
//! let _p2 = heap.alloc(100).unwrap();
//! unsafe { heap.free(p1.as_ptr()).unwrap() };
//! let p3 = heap.alloc(50).unwrap();
//! assert_eq!(p1, p3);
//! ```
//!
//! # Implementation
//! The heap is a sequence of blocks. Every block begins with a header word and
//! ends with a footer word (the boundary tags), both storing the size of the
//! block and whether it is allocated. Free blocks additionally store a back
//! and a forward link directly after the header, which thread them into the
//! free list. The lowest block is a permanently allocated sentinel, whose
//! forward link is the head of that list. The basic algorithm is as follows:
//! 1.  The heap is initialized: a padding word, the sentinel and one chunk of
//!     4096 bytes are requested from the grower. The chunk is a single free
//!     block and the only member of the free list.
//!     ```text
//!     pad | S | back | fwd | S | F4096 | back | fwd | .......... | F4096
//!           ^--- sentinel -----^ ^--- free block ---------------------^
//!     ```
//! 2.  100 bytes are allocated. The request is rounded up to a block of 112
//!     bytes (header, footer and payload, a multiple of 8). The free list is
//!     searched for the first block large enough (here the only one). As the
//!     remaining 3984 bytes can form a block of their own, the block is split:
//!     the low part is allocated, the high part takes over the position of
//!     the original block in the free list.
//!     ```text
//!     pad | sentinel | U112 | payload | U112 | F3984 | back | fwd | .. | F3984
//!     ```
//! 3.  Another 100 bytes are allocated, the same happens again.
//! 4.  The first allocation is freed. Its tags are marked as free and its
//!     physical neighbors are inspected: the footer in front of it belongs to
//!     the (allocated) sentinel, the header after it belongs to the (allocated)
//!     second block. Therefore it is simply inserted at the head of the free
//!     list, in front of the 3872-byte block at the end of the heap.
//! 5.  50 bytes are allocated (a block of 64 bytes). The first block of the
//!     free list is the one freed in step 4, so it is reused: the allocation
//!     returns the same address as in step 2 and the remaining 48 bytes stay
//!     in the free list.
//! 6.  If a block of both neighbors is free when it is freed, all three are
//!     merged into a single block starting at the lower neighbor. The same
//!     happens with only one free neighbor. Therefore there are never two
//!     adjacent free blocks.
//! 7.  If no free block is large enough, the heap grows by the size of the
//!     request (at least one chunk). The new space becomes a free block and is
//!     merged with a free block at the old end of the heap, if there is one.
//!     If the grower has no more memory, the allocation fails.
//!
//! The free list is kept in insertion order, not in address order. This makes
//! insertion a constant time operation and favors reuse of recently freed
//! memory, at the cost of more fragmentation in the long run.
#![cfg_attr(not(test), no_std)]

mod grower;
mod raw_allocator;

pub use grower::{HeapGrower, Region};
pub use raw_allocator::{
    Corruption, FreeError, HeapStats, OutOfMemory, RawAllocator, ALIGNMENT, CHUNK_SIZE,
    INIT_SIZE, MIN_BLOCK_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use log::{error, warn};

/// The smallest heap able to hold the sentinel and the first chunk.
pub const MIN_HEAP_SIZE: usize = INIT_SIZE + CHUNK_SIZE;

/// The memory allocator for `#![no_std]` programs.
///
/// This is a [`RawAllocator`] over a statically sized [`Region`] of `N` bytes,
/// guarded by a spin lock. Therefore the heap memory usage is limited to an
/// upper value, which is part of the static memory of the program.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The memory size of the heap is `65536` or 64K in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: tagalloc::Allocator<65536> = tagalloc::Allocator::new();
/// ```
///
/// All payloads are aligned to 8. Stricter alignments are served by
/// over-allocating and are therefore more expensive. The allocator logs
/// through the [`log`] facade. Failed requests and invalid deallocations are
/// reported at the `warn` and `error` level after the lock is released, so
/// the logger may allocate itself. Everything else is logged at the `trace`
/// level while the lock is held: a logger that allocates must not have the
/// `trace` level enabled for this crate, as that would re-enter the lock.
pub struct Allocator<const N: usize> {
    raw: spin::Mutex<RawAllocator<Region<N>>>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator. No memory is touched until the first
    /// allocation.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N`, is too
    /// small to hold the sentinel block and the first chunk of memory (see
    /// [`MIN_HEAP_SIZE`]).
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= MIN_HEAP_SIZE, "too small heap memory: minimum size is 4124");
        Self {
            raw: spin::Mutex::new(RawAllocator::new(Region::new())),
        }
    }

    /// Check the heap for consistency, see [`RawAllocator::check_heap()`].
    pub fn check_heap(&self, verbose: bool) -> Result<HeapStats, Corruption> {
        self.raw.lock().check_heap(verbose)
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return self.alloc_over_aligned(layout);
        }
        let result = self.raw.lock().alloc(layout.size());
        unlocked_result(result, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = if layout.align() > ALIGNMENT {
            // SAFETY: the pointer was returned by `alloc_over_aligned()`,
            // which stored the shift directly in front of it.
            let shift = ptr.sub(SHIFT_SIZE).cast::<usize>().read();
            ptr.sub(shift)
        } else {
            ptr
        };

        // allocators are not allowed to unwind, so misuse is only reported
        let result = self.raw.lock().free(ptr);
        if let Err(error) = result {
            error!("invalid deallocation of {ptr:p}: {error}");
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            let ptr = self.alloc_over_aligned(layout);
            if !ptr.is_null() {
                ptr::write_bytes(ptr, 0, layout.size());
            }
            return ptr;
        }
        let result = self.raw.lock().calloc(1, layout.size());
        unlocked_result(result, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            let result = self.raw.lock().realloc(ptr, new_size);
            return unlocked_result(result, new_size);
        }

        // SAFETY: the caller guarantees `new_size` to form a valid layout with
        // the original alignment.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc_over_aligned(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}
impl<const N: usize> Allocator<N> {
    /// Serve an alignment stricter than [`ALIGNMENT`].
    ///
    /// The block is over-allocated by the alignment, the returned pointer is
    /// the first suitably aligned address at least one word into the payload.
    /// The distance to the payload start is stored in the word in front of it,
    /// so that `dealloc()` can recover the payload.
    fn alloc_over_aligned(&self, layout: Layout) -> *mut u8 {
        let Some(total) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let result = self.raw.lock().alloc(total);
        let payload = unlocked_result(result, total);
        if payload.is_null() {
            return payload;
        }

        let address = payload as usize;
        let aligned = (address + SHIFT_SIZE + layout.align() - 1) & !(layout.align() - 1);
        let shift = aligned - address;
        // SAFETY: the payload is 8-aligned, so the shift is between 8 and the
        // alignment, which leaves `layout.size()` bytes after the aligned
        // pointer and room for the shift in front of it. The word in front is
        // 8-aligned.
        unsafe {
            let aligned = payload.add(shift);
            aligned.sub(SHIFT_SIZE).cast::<usize>().write(shift);
            aligned
        }
    }
}

/// The room reserved in front of an over-aligned pointer.
const SHIFT_SIZE: usize = ALIGNMENT;

/// Turn the result of the core into a raw pointer, reporting failures.
///
/// This must only be called after the lock is released: the logger might
/// allocate itself.
fn unlocked_result(result: Option<NonNull<u8>>, size: usize) -> *mut u8 {
    match result {
        Some(ptr) => ptr.as_ptr(),
        None => {
            warn!("cannot allocate {size} bytes");
            ptr::null_mut()
        }
    }
}
