#![no_std]
#![cfg_attr(feature = "allocator", feature(allocator_api))]

//! A segregated free list allocator with boundary tags, to be used in
//! `no_std` environments on top of an `sbrk` like heap primitive.
//!
//! Every block starts with a header word holding its size and flags. Free
//! blocks also end with a footer mirroring the header, which lets a block find
//! its predecessor in constant time, so freed blocks are always merged with
//! their free neighbours. Free blocks are kept in 16 circular doubly linked
//! lists, one per size class, and allocations take the first block that fits,
//! starting from the size class of the request. When nothing fits, the heap is
//! grown by at least [`CHUNK_SIZE`] bytes.
//!
//! Every payload is aligned to [`ALIGNMENT`] bytes.
//!
//! ## Footer elision
//!
//! By default, allocated blocks don't carry a footer: each header instead
//! records whether the block before it is allocated, which is all that
//! merging needs to know about an allocated predecessor. This costs a single
//! word per allocation. The [`BaselineAllocator`] keeps footers on every block,
//! for a cost of two words per allocation, and serves as a reference.
//!
//! ## Usage
//!
//! Create a static allocator:
//!
//! ```ignore
//! use segfit::SpinLockedAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: SpinLockedAllocator = SpinLockedAllocator::empty();
//! ```
//!
//! Before using this allocator, you need to give it a memory region to grow
//! the heap into:
//!
//! ```ignore
//! pub fn init_heap() {
//!     unsafe {
//!         ALLOCATOR.init(heap_start, heap_size);
//!     }
//! }
//! ```
//!
//! Any other heap primitive can be used by implementing [`HeapSource`] for it
//! and creating the allocator with [`Allocator::new`].
//!
//! ## Features
//!
//! - **`spin`** (default): Provide a `SpinLockedAllocator` type that implements
//!   the `GlobalAlloc` trait by using a spinlock.
//! - **`allocator`**: Provides an implementation of the unstable `Allocator`
//!   trait for the `SpinLockedAllocator` type.
//! - **`debug-checks`**: Checks the whole heap before and after every
//!   operation, and panics if it is inconsistent. Always on in tests.

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
mod logging;

mod alignment;
mod bins;
mod blocks;
mod check;
mod source;
mod tag_word;

#[cfg(test)]
mod tests;

use core::ptr::{null_mut, NonNull};

use alignment::*;
use bins::SegregatedBins;
pub use bins::{size_class, size_class_range, BUCKETS_AMOUNT, SIZE_CLASS_UPPER_BOUNDS};
use blocks::*;
pub use check::{BlockInfo, HeapCheckError, HeapStats, HeapWalk};
pub use logging::{disable_logging, enable_logging};
pub use source::{HeapSource, RegionSource};
use static_assertions::const_assert;
use tag_word::TagWord;

/// The size of a header or footer.
pub const WORD_SIZE: usize = core::mem::size_of::<TagWord>();

/// The alignment of every payload, and the granularity of block sizes.
pub const ALIGNMENT: usize = 2 * WORD_SIZE;

/// The smallest block: a header, the two free list links and a footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;

/// The minimum amount of bytes the heap grows by.
pub const CHUNK_SIZE: usize = 1 << 12;

const_assert!(CHUNK_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::size_of::<FreeBlock>() + WORD_SIZE <= MIN_BLOCK_SIZE);

/// A segregated free list memory allocator that grows its heap from a
/// [`HeapSource`].
///
/// `ELIDE_ALLOCATED_FOOTERS` picks the footer policy, see the crate's top
/// level documentation.
///
/// The heap is initialized lazily, by the first call to `allocate`.
#[derive(Debug)]
pub struct Allocator<S, const ELIDE_ALLOCATED_FOOTERS: bool = true> {
    source: S,
    bins: SegregatedBins,
    /// Address of the first block header, or 0 before the heap is
    /// initialized.
    heap_start_addr: usize,
}

/// An allocator that keeps a footer on every block, allocated ones included.
pub type BaselineAllocator<S> = Allocator<S, false>;

impl<S, const ELIDE_ALLOCATED_FOOTERS: bool> Allocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// Creates an allocator that will grow its heap from the given source.
    /// No memory is taken from the source until the first allocation.
    pub const fn new(source: S) -> Self {
        Self {
            source,
            bins: SegregatedBins::new(),
            heap_start_addr: 0,
        }
    }

    /// Checks if the heap was already initialized by a call to `allocate`.
    pub fn was_initialized(&self) -> bool {
        self.heap_start_addr != 0
    }

    /// Returns the source this allocator grows its heap from.
    pub fn source(&self) -> &S {
        &self.source
    }

    #[cfg(feature = "spin")]
    pub(crate) fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: HeapSource, const ELIDE_ALLOCATED_FOOTERS: bool> Allocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// The bytes an allocated block spends on boundary tags.
    const OVERHEAD: usize = if ELIDE_ALLOCATED_FOOTERS {
        WORD_SIZE
    } else {
        2 * WORD_SIZE
    };

    /// The amount of bytes obtained from the heap source so far, sentinels
    /// included.
    pub fn heap_size(&self) -> usize {
        self.source.upper_bound() - self.source.lower_bound()
    }

    /// Returns the size of the block needed to serve a request of `size`
    /// bytes, or `None` if that size overflows.
    fn adjust_size(size: usize) -> Option<usize> {
        let size = checked_align_up(size.checked_add(Self::OVERHEAD)?, ALIGNMENT)?;
        Some(core::cmp::max(size, MIN_BLOCK_SIZE))
    }

    /// The amount of payload bytes in an allocated block of the given size.
    fn payload_size(block_size: usize) -> usize {
        block_size - Self::OVERHEAD
    }

    /// The value to store in a prev allocated flag. The flags are only
    /// maintained when footers are elided, and are always clear otherwise.
    const fn prev_allocated_flag(prev_allocated: bool) -> bool {
        ELIDE_ALLOCATED_FOOTERS && prev_allocated
    }

    /// Returns the amount of bytes the caller may use through a pointer
    /// returned by this allocator, which is at least the amount requested
    /// for it. Returns 0 for a null pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be null or currently allocated by this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        Self::payload_size(UsedBlock::from_payload_addr(ptr as usize).size())
    }

    /// Lays out the prologue and epilogue sentinels and grows the heap by
    /// [`CHUNK_SIZE`] bytes. Returns whether the heap is usable.
    fn init_heap(&mut self) -> bool {
        let start_addr = match self.source.grow(2 * WORD_SIZE) {
            Some(start) => start.as_ptr() as usize,
            None => {
                hwarn!("heap source has no room for the heap sentinels");
                return false;
            }
        };
        debug_assert!(is_aligned(start_addr, ALIGNMENT));

        // SAFETY: the source just handed us these 2 words.
        unsafe {
            // the prologue footer, then the epilogue header. the first block will take
            // the epilogue's place, which makes its payload aligned.
            Block::write_sentinel(start_addr, false);
            Block::write_sentinel(start_addr + WORD_SIZE, Self::prev_allocated_flag(true));
        }
        self.heap_start_addr = start_addr + WORD_SIZE;
        hdebug!("heap initialized at {:#x}", self.heap_start_addr);

        self.extend_heap(CHUNK_SIZE).is_some()
    }

    /// Grows the heap by at least `size` bytes. The new memory replaces the
    /// epilogue with a free block, which is merged with a free last block and
    /// linked into its bucket. Returns the resulting free block.
    fn extend_heap(&mut self, size: usize) -> Option<FreeBlockPtr> {
        let size = checked_align_up(size, ALIGNMENT)?;
        let epilogue_addr = self.source.upper_bound() - WORD_SIZE;

        // SAFETY: the heap always ends with the epilogue.
        let prev_allocated = unsafe { Block::at(epilogue_addr) }.is_prev_allocated();

        let old_break = match self.source.grow(size) {
            Some(old_break) => old_break.as_ptr() as usize,
            None => {
                hwarn!("heap source failed to grow by {} bytes", size);
                return None;
            }
        };

        // the new block starts at the old epilogue.
        let block_addr = old_break - WORD_SIZE;
        debug_assert_eq!(block_addr, epilogue_addr);

        // SAFETY: the old epilogue and the new memory after it now belong to no block.
        unsafe {
            let block = FreeBlock::create_new_without_linking(block_addr, size, prev_allocated);
            Block::write_sentinel(block_addr + size, false);
            hdebug!("heap grew by {} bytes to {:#x}", size, block_addr + size + WORD_SIZE);

            Some(self.coalesce(block))
        }
    }

    /// Returns the block right before the given one if it is free.
    ///
    /// # Safety
    ///
    /// `block` must be a block in the heap.
    unsafe fn prev_block_if_free(block: &Block) -> Option<FreeBlockPtr> {
        let prev_allocated = if ELIDE_ALLOCATED_FOOTERS {
            block.is_prev_allocated()
        } else {
            block.prev_footer().is_allocated()
        };
        if prev_allocated {
            return None;
        }

        // a free predecessor always has a footer.
        let prev_size = block.prev_footer().size();
        Some(FreeBlock::ptr_from_addr(block.addr() - prev_size))
    }

    /// Returns the block right after the given one if it is free. The epilogue
    /// counts as allocated.
    ///
    /// # Safety
    ///
    /// `block` must be a block in the heap.
    unsafe fn next_block_if_free(block: &Block) -> Option<FreeBlockPtr> {
        match Block::from_addr(block.end_addr()) {
            BlockRef::Free(next) => Some(next),
            BlockRef::Used => None,
        }
    }

    /// Tells the block after `block` whether its predecessor is allocated.
    ///
    /// # Safety
    ///
    /// `block` must be a block in the heap.
    unsafe fn update_next_block(block: &Block, allocated: bool) {
        if ELIDE_ALLOCATED_FOOTERS {
            Block::set_prev_allocated_for_block_with_addr(block.end_addr(), allocated);
        }
    }

    /// Merges a free block that isn't linked into any bucket with its free
    /// neighbours, and links the result into its bucket.
    ///
    /// # Safety
    ///
    /// `block` must be a free block in the heap that is not in any bucket.
    unsafe fn coalesce(&mut self, block: FreeBlockPtr) -> FreeBlockPtr {
        let header = &(*block.as_ptr()).header;
        let addr = header.addr();
        let size = header.size();

        // neighbours must leave their buckets before their sizes change.
        let merged = match (Self::prev_block_if_free(header), Self::next_block_if_free(header)) {
            (None, None) => block,
            (None, Some(next)) => {
                self.bins.remove(next);
                (*block.as_ptr()).set_size(size + next.as_ref().size());
                block
            }
            (Some(prev), None) => {
                self.bins.remove(prev);
                (*prev.as_ptr()).set_size(prev.as_ref().size() + size);
                prev
            }
            (Some(prev), Some(next)) => {
                self.bins.remove(prev);
                self.bins.remove(next);
                (*prev.as_ptr()).set_size(prev.as_ref().size() + size + next.as_ref().size());
                prev
            }
        };

        htrace!(
            "coalesced block at {:#x} into {} bytes at {:#x}",
            addr,
            merged.as_ref().size(),
            merged.as_ptr() as usize
        );

        self.bins.insert(merged);
        merged
    }

    /// Allocates `asize` bytes from the start of the given free block, and
    /// returns the remainder to the buckets if it can hold a block.
    ///
    /// # Safety
    ///
    /// `block` must be a free block in the heap, linked into its bucket, of at
    /// least `asize` bytes. `asize` must be an adjusted size.
    unsafe fn place(&mut self, block: FreeBlockPtr, asize: usize) -> NonNull<u8> {
        self.bins.remove(block);

        let free = &mut *block.as_ptr();
        let remainder_size = free.size() - asize;

        let used = if remainder_size >= MIN_BLOCK_SIZE {
            let addr = free.addr();
            let used = UsedBlock::create_new(addr, asize, free.header.is_prev_allocated());

            // the block after the remainder already knows that its predecessor is free.
            let remainder = FreeBlock::create_new_without_linking(
                addr + asize,
                remainder_size,
                Self::prev_allocated_flag(true),
            );
            self.bins.insert(remainder);
            htrace!("split {} free bytes off block at {:#x}", remainder_size, addr);

            used
        } else {
            let used = free.mark_as_used_without_updating_next_block();
            Self::update_next_block(&used.0, true);
            used
        };

        if !ELIDE_ALLOCATED_FOOTERS {
            used.0.write_footer();
        }

        NonNull::new_unchecked(used.payload_addr() as *mut u8)
    }

    /// Finds or makes room for a block of `asize` bytes and allocates it.
    fn allocate_block(&mut self, asize: usize) -> Option<NonNull<u8>> {
        // SAFETY: the buckets only ever hold free blocks of the heap.
        let block = match unsafe { self.bins.find_fit(asize) } {
            Some(block) => block,
            None => self.extend_heap(core::cmp::max(asize, CHUNK_SIZE))?,
        };

        // SAFETY: the block is free, linked, and large enough.
        Some(unsafe { self.place(block, asize) })
    }

    /// Allocates at least `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Returns null if `size` is 0, or if the heap can't grow enough to
    /// satisfy the request.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if !self.was_initialized() && !self.init_heap() {
            return null_mut();
        }
        self.assert_heap_consistent(line!());

        if size == 0 {
            return null_mut();
        }
        let asize = match Self::adjust_size(size) {
            Some(asize) => asize,
            None => {
                hwarn!("allocation size {} overflows", size);
                return null_mut();
            }
        };

        let ptr = match self.allocate_block(asize) {
            Some(ptr) => ptr.as_ptr(),
            None => null_mut(),
        };

        self.assert_heap_consistent(line!());
        ptr
    }

    /// Releases memory returned by this allocator. Releasing a null pointer
    /// does nothing.
    ///
    /// # Safety
    ///
    /// The pointer must be null or currently allocated by this allocator.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.assert_heap_consistent(line!());

        let used = UsedBlock::from_payload_addr(ptr as usize);
        debug_assert!(used.0.is_allocated(), "released a block that is already free");

        let block = used.mark_as_free_without_updating_next_block();
        Self::update_next_block(&(*block.as_ptr()).header, false);
        self.coalesce(block);

        self.assert_heap_consistent(line!());
    }

    /// Resizes memory returned by this allocator, moving it to a new block
    /// which keeps as many bytes of its contents as fit.
    ///
    /// A null `ptr` makes this an `allocate(size)`. A `size` of 0 releases
    /// `ptr` and returns null. If no new block can be allocated, returns null
    /// and leaves `ptr` untouched.
    ///
    /// # Safety
    ///
    /// The pointer must be null or currently allocated by this allocator.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.release(ptr);
            return null_mut();
        }
        if ptr.is_null() {
            return self.allocate(size);
        }

        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        let copy_size = core::cmp::min(size, self.usable_size(ptr));
        core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_size);
        self.release(ptr);

        new_ptr
    }

    /// Allocates zeroed memory for `count` elements of `size` bytes each.
    ///
    /// Returns null if the total size overflows, is 0, or can't be
    /// allocated.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let total_size = match count.checked_mul(size) {
            Some(total_size) => total_size,
            None => {
                hwarn!("zeroed allocation of {} * {} bytes overflows", count, size);
                return null_mut();
            }
        };

        let ptr = self.allocate(total_size);
        if !ptr.is_null() {
            // SAFETY: the block has at least `total_size` payload bytes.
            unsafe { ptr.write_bytes(0, total_size) };
        }
        ptr
    }

    #[cfg(any(test, feature = "debug-checks"))]
    fn assert_heap_consistent(&self, line: u32) {
        if let Err(err) = self.validate() {
            panic!("heap is inconsistent (caller line {}): {}", line, err);
        }
    }

    #[cfg(not(any(test, feature = "debug-checks")))]
    #[inline(always)]
    fn assert_heap_consistent(&self, _line: u32) {}
}

unsafe impl<S: Send, const ELIDE_ALLOCATED_FOOTERS: bool> Send
    for Allocator<S, ELIDE_ALLOCATED_FOOTERS>
{
}

/// A spin locked memory allocator that can be used as the global allocator.
#[cfg(feature = "spin")]
pub struct SpinLockedAllocator<S = RegionSource, const ELIDE_ALLOCATED_FOOTERS: bool = true>(
    spin::Mutex<Allocator<S, ELIDE_ALLOCATED_FOOTERS>>,
);

#[cfg(feature = "spin")]
impl<const ELIDE_ALLOCATED_FOOTERS: bool> SpinLockedAllocator<RegionSource, ELIDE_ALLOCATED_FOOTERS> {
    /// Creates an empty locked heap allocator without any heap memory region,
    /// which will always return null on allocation requests.
    ///
    /// To initialize this allocator, use the `init` method.
    pub const fn empty() -> Self {
        Self::new(RegionSource::empty())
    }

    /// Gives the allocator the memory region to grow its heap into.
    ///
    /// # Safety
    ///
    /// If the allocator was already initialized, this function will panic.
    ///
    /// The provided memory region must be valid and non-null, and must not be
    /// used by anything else.
    ///
    /// If after aligning the start and end addresses, the size of the region
    /// is 0, the function panics.
    pub unsafe fn init(&self, heap_start_addr: usize, heap_size: usize) {
        let mut allocator = self.0.lock();
        allocator.source_mut().init(heap_start_addr, heap_size);
    }

    /// Checks if the memory region was already given by calling `init`.
    pub fn was_initialized(&self) -> bool {
        let allocator = self.0.lock();
        allocator.source().was_initialized()
    }
}

#[cfg(feature = "spin")]
impl<S, const ELIDE_ALLOCATED_FOOTERS: bool> SpinLockedAllocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// Creates a locked allocator that grows its heap from the given source.
    pub const fn new(source: S) -> Self {
        Self(spin::Mutex::new(Allocator::new(source)))
    }

    /// Locks the allocator, for using it directly.
    pub fn lock(&self) -> spin::MutexGuard<'_, Allocator<S, ELIDE_ALLOCATED_FOOTERS>> {
        self.0.lock()
    }
}

#[cfg(feature = "spin")]
impl<S: HeapSource, const ELIDE_ALLOCATED_FOOTERS: bool> SpinLockedAllocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// Checks the heap, see [`Allocator::check_heap`].
    pub fn check_heap(&self, line: u32) -> bool {
        let allocator = self.0.lock();
        allocator.check_heap(line)
    }
}

#[cfg(feature = "spin")]
unsafe impl<S: HeapSource + Send, const ELIDE_ALLOCATED_FOOTERS: bool> core::alloc::GlobalAlloc
    for SpinLockedAllocator<S, ELIDE_ALLOCATED_FOOTERS>
{
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        let mut allocator = self.0.lock();
        allocator.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        let mut allocator = self.0.lock();
        allocator.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: core::alloc::Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        let mut allocator = self.0.lock();
        allocator.reallocate(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        let mut allocator = self.0.lock();
        allocator.zero_allocate(1, layout.size())
    }
}

#[cfg(feature = "allocator")]
impl<S: HeapSource, const ELIDE_ALLOCATED_FOOTERS: bool> SpinLockedAllocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// A well aligned dangling pointer, for zero sized allocations, which
    /// never reach the heap.
    fn dangling(layout: core::alloc::Layout) -> NonNull<[u8]> {
        // SAFETY: alignments are never 0.
        let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
        NonNull::slice_from_raw_parts(ptr, 0)
    }

    fn allocate_with(
        &self,
        layout: core::alloc::Layout,
        allocate: impl FnOnce(&mut Allocator<S, ELIDE_ALLOCATED_FOOTERS>, usize) -> *mut u8,
    ) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        if layout.align() > ALIGNMENT {
            return Err(core::alloc::AllocError);
        }
        if layout.size() == 0 {
            return Ok(Self::dangling(layout));
        }

        let mut allocator = self.0.lock();
        let ptr = NonNull::new(allocate(&mut *allocator, layout.size())).ok_or(core::alloc::AllocError)?;

        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: core::alloc::Layout,
        new_layout: core::alloc::Layout,
    ) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        if new_layout.align() > ALIGNMENT {
            return Err(core::alloc::AllocError);
        }
        if old_layout.size() == 0 {
            return self.allocate_with(new_layout, |allocator, size| allocator.allocate(size));
        }

        let mut allocator = self.0.lock();
        if new_layout.size() == 0 {
            allocator.release(ptr.as_ptr());
            return Ok(Self::dangling(new_layout));
        }

        let ptr = NonNull::new(allocator.reallocate(ptr.as_ptr(), new_layout.size()))
            .ok_or(core::alloc::AllocError)?;

        Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()))
    }
}

#[cfg(feature = "allocator")]
unsafe impl<S: HeapSource + Send, const ELIDE_ALLOCATED_FOOTERS: bool> core::alloc::Allocator
    for SpinLockedAllocator<S, ELIDE_ALLOCATED_FOOTERS>
{
    fn allocate(&self, layout: core::alloc::Layout) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        self.allocate_with(layout, |allocator, size| allocator.allocate(size))
    }

    fn allocate_zeroed(
        &self,
        layout: core::alloc::Layout,
    ) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        self.allocate_with(layout, |allocator, size| allocator.zero_allocate(1, size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: core::alloc::Layout) {
        if layout.size() != 0 {
            let mut allocator = self.0.lock();
            allocator.release(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: core::alloc::Layout,
        new_layout: core::alloc::Layout,
    ) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: core::alloc::Layout,
        new_layout: core::alloc::Layout,
    ) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }
}
