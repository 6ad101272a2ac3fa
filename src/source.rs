use core::ptr::NonNull;

use crate::{
    alignment::{align_down, align_up},
    ALIGNMENT,
};

/// The primitive an allocator grows its heap with, in the manner of `sbrk`.
///
/// # Safety
///
/// Implementors must hand out one contiguous region that only ever grows at
/// its end:
///
/// - a successful `grow(n)` returns the previous break, and the `n` bytes that
///   follow it must be valid for reads and writes, exclusively owned by the
///   caller and never moved;
/// - the first break must be aligned to [`ALIGNMENT`];
/// - `lower_bound` is the address of the first byte ever handed out and
///   `upper_bound` is the current break (one past the last valid byte).
pub unsafe trait HeapSource {
    /// Appends `increment` bytes to the heap. Returns the old break, or `None`
    /// if the memory is exhausted.
    fn grow(&mut self, increment: usize) -> Option<NonNull<u8>>;

    /// The lowest address of the heap.
    fn lower_bound(&self) -> usize;

    /// The current end of the heap, exclusive.
    fn upper_bound(&self) -> usize;
}

/// A heap source that bumps a break pointer through a fixed memory region
/// given to it up front.
#[derive(Debug)]
pub struct RegionSource {
    start_addr: usize,
    break_addr: usize,
    end_addr: usize,
}

impl RegionSource {
    /// Creates a region source without any memory, on which every `grow`
    /// fails.
    ///
    /// To give it memory, use the `init` method.
    pub const fn empty() -> Self {
        Self {
            start_addr: 0,
            break_addr: 0,
            end_addr: 0,
        }
    }

    /// Creates a region source for the given memory region.
    ///
    /// # Safety
    ///
    /// See [`RegionSource::init`].
    pub unsafe fn new(region_start_addr: usize, region_size: usize) -> Self {
        let mut source = Self::empty();
        source.init(region_start_addr, region_size);
        source
    }

    /// Checks if the source was already given a memory region.
    pub fn was_initialized(&self) -> bool {
        self.end_addr != 0
    }

    /// Gives the source the memory region it hands out.
    ///
    /// # Safety
    ///
    /// The provided memory region must be valid and non-null, must not be
    /// used by anything else, and must outlive every allocator that grows
    /// from this source.
    ///
    /// If the source was already initialized, or if the region is empty after
    /// aligning its start and end addresses, this function panics.
    pub unsafe fn init(&mut self, region_start_addr: usize, region_size: usize) {
        if self.was_initialized() {
            panic!("the heap region was already initialized");
        }

        let aligned_start_addr = align_up(region_start_addr, ALIGNMENT);
        let aligned_end_addr = align_down(region_start_addr + region_size, ALIGNMENT);
        if aligned_end_addr <= aligned_start_addr {
            panic!("heap region is empty after aligning its start and end addresses");
        }

        self.start_addr = aligned_start_addr;
        self.break_addr = aligned_start_addr;
        self.end_addr = aligned_end_addr;
    }

    /// The amount of bytes that can still be handed out.
    pub fn remaining(&self) -> usize {
        self.end_addr - self.break_addr
    }
}

unsafe impl HeapSource for RegionSource {
    fn grow(&mut self, increment: usize) -> Option<NonNull<u8>> {
        if increment > self.remaining() {
            return None;
        }

        let old_break = NonNull::new(self.break_addr as *mut u8)?;
        self.break_addr += increment;
        Some(old_break)
    }

    fn lower_bound(&self) -> usize {
        self.start_addr
    }

    fn upper_bound(&self) -> usize {
        self.break_addr
    }
}
