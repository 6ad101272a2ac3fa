/// Defines a test module per function, running the function once per footer
/// policy. The function's const parameter is `ELIDE_ALLOCATED_FOOTERS`.
macro_rules! test_both_policies {
    ($(fn $name:ident<const $elide:ident: bool>() $body:block)*) => {
        $(
            mod $name {
                use super::*;

                fn run<const $elide: bool>() $body

                #[test]
                fn elided_footers() {
                    run::<true>()
                }

                #[test]
                fn baseline() {
                    run::<false>()
                }
            }
        )*
    };
}

mod check_tests;

use core::alloc::Layout;
use std::vec::Vec;

use super::*;

/// The default size of the memory region leased to a test allocator.
const DEFAULT_MEM_SIZE: usize = 1 << 16;

/// A guard that leases a region of memory from the system allocator and
/// creates an allocator that grows into it. The region is freed when the
/// guard is dropped.
struct AllocatorInitGuard<const E: bool> {
    addr: usize,
    layout: Layout,
    allocator: Allocator<RegionSource, E>,
}

impl<const E: bool> AllocatorInitGuard<E> {
    /// Leases a region of `mem_size` bytes, aligned to the alignment of the
    /// heap allocator.
    fn new(mem_size: usize) -> Self {
        init_logger();

        let layout = Layout::from_size_align(mem_size, ALIGNMENT).unwrap();
        let addr = unsafe { std::alloc::alloc(layout) as usize };
        assert_ne!(addr, 0, "failed to lease memory for the test heap");

        let source = unsafe { RegionSource::new(addr, mem_size) };
        Self {
            addr,
            layout,
            allocator: Allocator::new(source),
        }
    }

    /// Leases a region of [`DEFAULT_MEM_SIZE`] bytes.
    fn with_default_size() -> Self {
        Self::new(DEFAULT_MEM_SIZE)
    }

    /// Returns the address of the leased memory region.
    fn addr(&self) -> usize {
        self.addr
    }

    /// The address of the first block header, right after the prologue.
    fn first_block_addr(&self) -> usize {
        self.addr + WORD_SIZE
    }

    /// Checks the heap, panicking with the broken invariant if there is one.
    fn stats(&self) -> HeapStats {
        match self.allocator.validate() {
            Ok(stats) => stats,
            Err(err) => panic!("heap is inconsistent: {}", err),
        }
    }

    /// Returns the heap block that holds the given payload.
    fn block_of(&self, ptr: *mut u8) -> BlockInfo {
        self.allocator
            .blocks()
            .find(|block| block.payload_addr() == ptr as usize)
            .unwrap_or_else(|| panic!("no block has its payload at {:?}", ptr))
    }

    fn allocate(&mut self, size: usize) -> *mut u8 {
        let ptr = self.allocator.allocate(size);
        assert!(!ptr.is_null(), "failed to allocate {} bytes", size);
        ptr
    }

    fn release(&mut self, ptr: *mut u8) {
        unsafe { self.allocator.release(ptr) }
    }
}

impl<const E: bool> Drop for AllocatorInitGuard<E> {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.addr as *mut u8, self.layout) }
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
    enable_logging();
}

/// The block size that serves a request of `size` bytes.
fn asize<const E: bool>(size: usize) -> usize {
    Allocator::<RegionSource, E>::adjust_size(size).unwrap()
}

/// The amount of payload bytes that fit in a block of the given size.
fn payload_size<const E: bool>(block_size: usize) -> usize {
    Allocator::<RegionSource, E>::payload_size(block_size)
}

/// Asserts that the heap is made of a single free block of the given size.
fn assert_only_1_free_block<const E: bool>(guard: &AllocatorInitGuard<E>, size: usize) {
    let stats = guard.stats();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, 1);

    let blocks: Vec<BlockInfo> = guard.allocator.blocks().collect();
    assert_eq!(
        blocks,
        vec![BlockInfo {
            addr: guard.first_block_addr(),
            size,
            allocated: false,
        }]
    );
}

/// Fills a payload with a byte pattern derived from `seed`.
fn fill(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) }
    }
}

/// Asserts that a payload still holds the pattern written by [`fill`].
fn assert_filled(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        let byte = unsafe { ptr.add(i).read() };
        assert_eq!(
            byte,
            seed.wrapping_add(i as u8),
            "byte {} of payload at {:?} was overwritten",
            i,
            ptr
        );
    }
}
