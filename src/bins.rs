use core::ops::RangeInclusive;

use static_assertions::const_assert;

use crate::{
    blocks::{FreeBlock, FreeBlockPtr},
    MIN_BLOCK_SIZE,
};

/// The amount of segregated free lists used by the allocator.
pub const BUCKETS_AMOUNT: usize = 16;

/// The inclusive upper size bound of every bucket but the last one, which
/// takes everything larger.
pub const SIZE_CLASS_UPPER_BOUNDS: [usize; BUCKETS_AMOUNT - 1] = [
    32, 64, 161, 200, 290, 350, 550, 760, 1100, 4140, 8240, 16433, 24033, 31033, 62033,
];

const fn size_class_bounds_are_ascending() -> bool {
    let mut i = 1;
    while i < SIZE_CLASS_UPPER_BOUNDS.len() {
        if SIZE_CLASS_UPPER_BOUNDS[i - 1] >= SIZE_CLASS_UPPER_BOUNDS[i] {
            return false;
        }
        i += 1;
    }
    true
}

// the buckets must partition `[MIN_BLOCK_SIZE, inf)` without gaps, which
// requires the first bucket to start at the smallest block and the bounds to
// only go up.
const_assert!(SIZE_CLASS_UPPER_BOUNDS[0] == MIN_BLOCK_SIZE);
const_assert!(size_class_bounds_are_ascending());

/// Returns the index of the bucket that holds blocks of the given size.
pub fn size_class(size: usize) -> usize {
    SIZE_CLASS_UPPER_BOUNDS
        .iter()
        .position(|&upper_bound| size <= upper_bound)
        .unwrap_or(BUCKETS_AMOUNT - 1)
}

/// Returns the range of block sizes that belong in the bucket with the given
/// index.
///
/// # Panics
///
/// Panics if `index` is not below [`BUCKETS_AMOUNT`].
pub fn size_class_range(index: usize) -> RangeInclusive<usize> {
    assert!(
        index < BUCKETS_AMOUNT,
        "bucket index {} is out of range, there are only {} buckets",
        index,
        BUCKETS_AMOUNT
    );

    let lower_bound = match index {
        0 => MIN_BLOCK_SIZE,
        _ => SIZE_CLASS_UPPER_BOUNDS[index - 1] + 1,
    };
    let upper_bound = SIZE_CLASS_UPPER_BOUNDS
        .get(index)
        .copied()
        .unwrap_or(usize::MAX);

    lower_bound..=upper_bound
}

/// The segregated free lists. Each bucket is a circular doubly linked list of
/// free blocks whose sizes fall in the bucket's size class.
#[derive(Debug)]
pub struct SegregatedBins {
    heads: [Option<FreeBlockPtr>; BUCKETS_AMOUNT],
}

impl SegregatedBins {
    /// Creates a new set of empty buckets.
    pub const fn new() -> Self {
        Self {
            heads: [None; BUCKETS_AMOUNT],
        }
    }

    /// Returns the head of the bucket with the given index, if it has any
    /// blocks.
    pub fn head(&self, bucket: usize) -> Option<FreeBlockPtr> {
        self.heads[bucket]
    }

    /// Inserts the given free block at the head of the bucket matching its
    /// current size.
    ///
    /// # Safety
    ///
    /// The block must be a valid free block that is not linked into any list.
    pub unsafe fn insert(&mut self, block: FreeBlockPtr) {
        let raw = block.as_ptr();
        let bucket = size_class((*raw).size());

        match self.heads[bucket] {
            Some(head) => {
                // link the block between the head's prev (the tail) and the head,
                // then make it the head.
                let tail = (*head.as_ptr()).prev;
                (*raw).next = head;
                (*raw).prev = tail;
                (*tail.as_ptr()).next = block;
                (*head.as_ptr()).prev = block;
            }
            None => {
                (*raw).next = block;
                (*raw).prev = block;
            }
        }

        self.heads[bucket] = Some(block);
    }

    /// Unlinks the given free block from its bucket.
    ///
    /// # Safety
    ///
    /// The block must be linked into the bucket matching its current size, so
    /// this must be called before the block's size is rewritten.
    pub unsafe fn remove(&mut self, block: FreeBlockPtr) {
        let raw = block.as_ptr();
        let bucket = size_class((*raw).size());
        let next = (*raw).next;
        let prev = (*raw).prev;

        if next == block {
            // the block was the only member of its bucket.
            debug_assert_eq!(self.heads[bucket], Some(block));
            self.heads[bucket] = None;
            return;
        }

        if self.heads[bucket] == Some(block) {
            self.heads[bucket] = Some(next);
        }

        // change `prev <-> block <-> next` into `prev <-> next`.
        (*prev.as_ptr()).next = next;
        (*next.as_ptr()).prev = prev;
    }

    /// Finds a free block of at least `size` bytes: starting from the
    /// bucket of `size`, returns the first large enough block of the first
    /// bucket that has one.
    ///
    /// # Safety
    ///
    /// The buckets must be consistent.
    pub unsafe fn find_fit(&self, size: usize) -> Option<FreeBlockPtr> {
        self.heads[size_class(size)..]
            .iter()
            .flatten()
            .find_map(|&head| Self::first_fit_in_bucket(head, size))
    }

    /// Walks a bucket starting at its head until a block of at least `size`
    /// bytes is found or the walk gets back to the head.
    unsafe fn first_fit_in_bucket(head: FreeBlockPtr, size: usize) -> Option<FreeBlockPtr> {
        let mut cur = head;
        loop {
            let block: &FreeBlock = cur.as_ref();
            if block.size() >= size {
                return Some(cur);
            }

            cur = block.next();
            if cur == head {
                return None;
            }
        }
    }
}

impl Default for SegregatedBins {
    fn default() -> Self {
        Self::new()
    }
}
