//! The heap-growth primitive the allocator draws its memory from.
//!
//! The allocator never obtains memory any other way: it asks a
//! [`HeapGrower`] to extend one contiguous region at its high end and manages
//! everything inside that region itself. The crate ships a single
//! implementation, [`Region`], which hands out a fixed-capacity in-memory
//! buffer, much like `sbrk(2)` would extend the data segment of a process.
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

/// A source of raw memory extending a single, grow-only region.
///
/// The allocator re-derives every address from [`low()`](Self::low) on each
/// operation, so a grower may be moved between operations. Payloads handed
/// out before the move point into the old location, though: a grower storing
/// its memory inline (like [`Region`]) must not be moved while any of them is
/// still in use.
///
/// # Safety
/// Implementors must uphold the following, as the allocator relies on it for
/// every memory access it performs:
/// - the address returned by [`low()`](Self::low) is aligned to at least 8
///   bytes and changes only when the grower is moved, in which case the
///   contents of the region move along with it,
/// - the bytes `low()..=high()` are valid for reads and writes through the
///   pointer returned by `low()` and are not accessed by anyone but the
///   allocator (apart from the payloads the allocator hands out),
/// - a successful [`grow()`](Self::grow) returns the address directly after
///   the previous `high()`, extends the region by exactly the requested
///   number of bytes and fills them with zeros,
/// - an empty region reports `high() == low() - 1`.
pub unsafe trait HeapGrower {
    /// Extend the region by `bytes` bytes and return the start of the new
    /// space, or `None` if no more memory is available.
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// The lowest address of the region.
    fn low(&self) -> *mut u8;

    /// The address of the last byte of the region.
    fn high(&self) -> *mut u8;
}

/// A fixed-capacity region of `N` bytes.
///
/// The memory lives inline, so a `static` region ends up in `.bss` and costs
/// nothing until it is grown into. Growth beyond `N` bytes fails, which is
/// how an exhausted platform heap is modelled. Moving a region moves its
/// memory: pointers into it must not be used afterwards.
#[repr(C, align(8))]
pub struct Region<const N: usize> {
    memory: UnsafeCell<[MaybeUninit<u8>; N]>,
    brk: usize,
}
impl<const N: usize> Region<N> {
    /// Create a new, empty region.
    pub const fn new() -> Self {
        Self {
            memory: UnsafeCell::new([MaybeUninit::uninit(); N]),
            brk: 0,
        }
    }

    /// The number of bytes handed out so far.
    pub const fn len(&self) -> usize {
        self.brk
    }

    /// Whether nothing was handed out so far.
    pub const fn is_empty(&self) -> bool {
        self.brk == 0
    }

    /// The total capacity of the region.
    pub const fn capacity(&self) -> usize {
        N
    }
}
impl<const N: usize> Default for Region<N> {
    fn default() -> Self {
        Self::new()
    }
}
// SAFETY: the memory is obtained via `UnsafeCell::get()`, so writes through
// `low()` are permitted, the struct is aligned to 8 and the break only ever
// moves upwards. The memory is stored inline, so it only moves together with
// the region. New bytes are zeroed before they are handed out.
unsafe impl<const N: usize> HeapGrower for Region<N> {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if N - self.brk < bytes {
            return None;
        }

        // SAFETY: `brk + bytes <= N`, so both the start and the zeroed range
        // are inside of the memory array.
        let start = unsafe {
            let start = self.low().add(self.brk);
            ptr::write_bytes(start, 0, bytes);
            start
        };
        self.brk += bytes;
        NonNull::new(start)
    }

    fn low(&self) -> *mut u8 {
        self.memory.get().cast::<u8>()
    }

    fn high(&self) -> *mut u8 {
        self.low().wrapping_add(self.brk).wrapping_sub(1)
    }
}
