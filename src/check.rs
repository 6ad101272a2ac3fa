//! Heap consistency checking.
//!
//! The checker never mutates the heap. It walks the heap in address order and
//! every free list, and reports the first invariant it finds broken. Every
//! address is bounds checked before it is dereferenced, so a corrupted heap is
//! reported instead of followed.

use core::fmt;

use crate::{
    alignment::is_aligned,
    bins::{size_class_range, BUCKETS_AMOUNT},
    blocks::{Block, FreeBlockPtr},
    tag_word::TagWord,
    Allocator, HeapSource, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE,
};

/// A broken heap invariant, along with where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCheckError {
    /// The word before the first block is not an allocated zero sized sentinel.
    BadPrologue { found: u64 },
    /// The heap does not end with an allocated zero sized sentinel right
    /// before its upper bound.
    BadEpilogue { addr: usize },
    /// A block extends past the end of the heap.
    BlockOutOfBounds { addr: usize },
    /// A block's payload is not aligned to [`ALIGNMENT`].
    MisalignedBlock { addr: usize },
    /// A block's size is not a multiple of 16, or is smaller than the minimum.
    BadBlockSize { addr: usize, size: usize },
    /// A footer that should mirror its header doesn't.
    FooterMismatch { addr: usize },
    /// A block's prev allocated flag disagrees with its predecessor.
    StalePrevAllocatedFlag { addr: usize },
    /// Two free blocks are next to each other.
    AdjacentFreeBlocks { addr: usize },
    /// A free list link points outside of the heap.
    LinkOutOfBounds { bucket: usize, addr: usize },
    /// `next.prev` or `prev.next` of a free list member is not the member.
    BrokenLink { bucket: usize, addr: usize },
    /// A free list contains an allocated block.
    AllocatedBlockInFreeList { bucket: usize, addr: usize },
    /// A free block sits in a bucket that doesn't match its size.
    WrongBucket {
        bucket: usize,
        addr: usize,
        size: usize,
    },
    /// Walking a free list never gets back to its head.
    FreeListCycle { bucket: usize },
    /// The heap walk and the free lists disagree on how many free blocks
    /// there are.
    FreeCountMismatch { in_heap: usize, in_free_lists: usize },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadPrologue { found } => write!(f, "bad prologue word {:#x}", found),
            Self::BadEpilogue { addr } => write!(f, "bad epilogue at {:#x}", addr),
            Self::BlockOutOfBounds { addr } => {
                write!(f, "block at {:#x} extends past the heap", addr)
            }
            Self::MisalignedBlock { addr } => write!(f, "block at {:#x} is misaligned", addr),
            Self::BadBlockSize { addr, size } => {
                write!(f, "block at {:#x} has invalid size {}", addr, size)
            }
            Self::FooterMismatch { addr } => {
                write!(f, "footer of block at {:#x} doesn't match its header", addr)
            }
            Self::StalePrevAllocatedFlag { addr } => write!(
                f,
                "prev allocated flag of block at {:#x} doesn't match its predecessor",
                addr
            ),
            Self::AdjacentFreeBlocks { addr } => write!(
                f,
                "free block at {:#x} follows another free block",
                addr
            ),
            Self::LinkOutOfBounds { bucket, addr } => write!(
                f,
                "bucket {} links to {:#x}, outside of the heap",
                bucket, addr
            ),
            Self::BrokenLink { bucket, addr } => write!(
                f,
                "links around block at {:#x} in bucket {} are not symmetric",
                addr, bucket
            ),
            Self::AllocatedBlockInFreeList { bucket, addr } => write!(
                f,
                "allocated block at {:#x} is in bucket {}",
                addr, bucket
            ),
            Self::WrongBucket { bucket, addr, size } => write!(
                f,
                "block at {:#x} of size {} doesn't belong in bucket {}",
                addr, size, bucket
            ),
            Self::FreeListCycle { bucket } => {
                write!(f, "bucket {} never gets back to its head", bucket)
            }
            Self::FreeCountMismatch {
                in_heap,
                in_free_lists,
            } => write!(
                f,
                "{} free blocks in the heap but {} in the free lists",
                in_heap, in_free_lists
            ),
        }
    }
}

/// Totals gathered while checking the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the heap source, sentinels included.
    pub heap_size: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

/// A block as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: usize,
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Address of the first payload byte.
    pub fn payload_addr(&self) -> usize {
        self.addr + WORD_SIZE
    }

    /// Checks if the given address lies inside this block.
    pub fn contains(&self, addr: usize) -> bool {
        (self.addr..self.addr + self.size).contains(&addr)
    }
}

/// Iterates the blocks of a heap in address order, trusting their headers.
#[derive(Debug)]
pub struct HeapWalk<'a> {
    next_addr: usize,
    _heap: core::marker::PhantomData<&'a ()>,
}

impl Iterator for HeapWalk<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.next_addr == 0 {
            return None;
        }

        // SAFETY: the walk starts at the first block and only follows sizes,
        // which lead from one header to the next until the epilogue.
        let block = unsafe { Block::at(self.next_addr) };
        if block.size() == 0 {
            self.next_addr = 0;
            return None;
        }

        self.next_addr = block.end_addr();
        Some(BlockInfo {
            addr: block.addr(),
            size: block.size(),
            allocated: block.is_allocated(),
        })
    }
}

impl<S: HeapSource, const ELIDE_ALLOCATED_FOOTERS: bool> Allocator<S, ELIDE_ALLOCATED_FOOTERS> {
    /// Iterates over every block of the heap, in address order. Yields nothing
    /// before the heap is initialized.
    ///
    /// The walk trusts the block headers; use [`Allocator::validate`] on a heap
    /// that might be corrupted.
    pub fn blocks(&self) -> HeapWalk<'_> {
        HeapWalk {
            next_addr: self.heap_start_addr,
            _heap: core::marker::PhantomData,
        }
    }

    /// Checks every heap invariant and returns totals about the heap, or the
    /// first broken invariant.
    pub fn validate(&self) -> Result<HeapStats, HeapCheckError> {
        let mut stats = HeapStats::default();
        if !self.was_initialized() {
            return Ok(stats);
        }

        let upper_bound = self.source.upper_bound();
        stats.heap_size = upper_bound - self.source.lower_bound();

        self.check_bounds(upper_bound)?;
        self.check_blocks(upper_bound, &mut stats)?;
        let in_free_lists = self.check_free_lists(upper_bound)?;

        if in_free_lists != stats.free_blocks {
            return Err(HeapCheckError::FreeCountMismatch {
                in_heap: stats.free_blocks,
                in_free_lists,
            });
        }

        Ok(stats)
    }

    /// Checks the heap, logging the broken invariant along with the caller's
    /// line if there is one.
    pub fn check_heap(&self, line: u32) -> bool {
        match self.validate() {
            Ok(_) => true,
            Err(err) => {
                log::error!("heap check failed (caller line {}): {}", line, err);
                false
            }
        }
    }

    /// Checks the prologue and the epilogue.
    fn check_bounds(&self, upper_bound: usize) -> Result<(), HeapCheckError> {
        let prologue_addr = self.heap_start_addr - WORD_SIZE;
        let epilogue_addr = upper_bound - WORD_SIZE;
        if prologue_addr < self.source.lower_bound() || epilogue_addr < self.heap_start_addr {
            return Err(HeapCheckError::BadEpilogue {
                addr: epilogue_addr,
            });
        }

        let prologue = unsafe { *(prologue_addr as *const TagWord) };
        if prologue.size() != 0 || !prologue.is_allocated() {
            return Err(HeapCheckError::BadPrologue {
                found: prologue.raw(),
            });
        }

        let epilogue = unsafe { Block::at(epilogue_addr) };
        if epilogue.size() != 0 || !epilogue.is_allocated() {
            return Err(HeapCheckError::BadEpilogue {
                addr: epilogue_addr,
            });
        }

        Ok(())
    }

    /// Walks the heap in address order, checking every block and counting the
    /// free ones.
    fn check_blocks(&self, upper_bound: usize, stats: &mut HeapStats) -> Result<(), HeapCheckError> {
        let epilogue_addr = upper_bound - WORD_SIZE;
        let mut addr = self.heap_start_addr;
        let mut prev_allocated = true;

        loop {
            let block = unsafe { Block::at(addr) };
            if ELIDE_ALLOCATED_FOOTERS && block.is_prev_allocated() != prev_allocated {
                return Err(HeapCheckError::StalePrevAllocatedFlag { addr });
            }

            if block.size() == 0 {
                // only the epilogue is zero sized.
                if addr != epilogue_addr || !block.is_allocated() {
                    return Err(HeapCheckError::BadEpilogue { addr });
                }
                return Ok(());
            }

            let size = block.size();
            if size < MIN_BLOCK_SIZE || !is_aligned(size, ALIGNMENT) {
                return Err(HeapCheckError::BadBlockSize { addr, size });
            }
            if !is_aligned(block.payload_addr(), ALIGNMENT) {
                return Err(HeapCheckError::MisalignedBlock { addr });
            }
            if size > epilogue_addr - addr {
                return Err(HeapCheckError::BlockOutOfBounds { addr });
            }

            let has_footer = !block.is_allocated() || !ELIDE_ALLOCATED_FOOTERS;
            if has_footer && block.footer() != block.tag().mirrored_footer() {
                return Err(HeapCheckError::FooterMismatch { addr });
            }

            if block.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            } else {
                if !prev_allocated {
                    return Err(HeapCheckError::AdjacentFreeBlocks { addr });
                }
                stats.free_blocks += 1;
                stats.free_bytes += size;
            }

            prev_allocated = block.is_allocated();
            addr += size;
        }
    }

    /// Walks every free list, checking the members and their links. Returns the
    /// amount of blocks found in all the lists.
    fn check_free_lists(&self, upper_bound: usize) -> Result<usize, HeapCheckError> {
        // no list can hold more blocks than fit in the heap.
        let max_members = (upper_bound - self.heap_start_addr) / MIN_BLOCK_SIZE;
        let mut total = 0;

        for bucket in 0..BUCKETS_AMOUNT {
            let head = match self.bins.head(bucket) {
                Some(head) => head,
                None => continue,
            };
            let size_range = size_class_range(bucket);

            let mut cur = self.checked_link(bucket, head, upper_bound)?;
            let mut members = 0;
            loop {
                let addr = cur.as_ptr() as usize;
                let block = unsafe { cur.as_ref() };

                if block.header.is_allocated() {
                    return Err(HeapCheckError::AllocatedBlockInFreeList { bucket, addr });
                }
                if !size_range.contains(&block.size()) {
                    return Err(HeapCheckError::WrongBucket {
                        bucket,
                        addr,
                        size: block.size(),
                    });
                }

                let next = self.checked_link(bucket, block.next(), upper_bound)?;
                let prev = self.checked_link(bucket, block.prev(), upper_bound)?;
                if unsafe { next.as_ref().prev() != cur || prev.as_ref().next() != cur } {
                    return Err(HeapCheckError::BrokenLink { bucket, addr });
                }

                members += 1;
                if members > max_members {
                    return Err(HeapCheckError::FreeListCycle { bucket });
                }

                cur = next;
                if cur == head {
                    break;
                }
            }

            total += members;
        }

        Ok(total)
    }

    /// Makes sure a free list link points at a place in the heap where a
    /// whole free block could start.
    fn checked_link(
        &self,
        bucket: usize,
        link: FreeBlockPtr,
        upper_bound: usize,
    ) -> Result<FreeBlockPtr, HeapCheckError> {
        let addr = link.as_ptr() as usize;
        let in_heap = addr >= self.heap_start_addr
            && addr <= upper_bound.saturating_sub(WORD_SIZE + MIN_BLOCK_SIZE)
            && is_aligned(addr + WORD_SIZE, ALIGNMENT);

        if !in_heap {
            return Err(HeapCheckError::LinkOutOfBounds { bucket, addr });
        }

        Ok(link)
    }
}
