use core::ptr::NonNull;

use crate::{tag_word::TagWord, WORD_SIZE};

/// The header of a block in the heap.
///
/// Block addresses always point at the header word. The payload starts one
/// word later, and the next block starts right at `addr + size`, which always
/// exists thanks to the epilogue sentinel at the end of the heap.
#[repr(transparent)]
#[derive(Debug)]
pub struct Block(TagWord);

impl Block {
    /// Returns a [`BlockRef`] for the block whose header is at the given
    /// address, based on the block's allocation flag.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header.
    pub unsafe fn from_addr(addr: usize) -> BlockRef {
        if Self::at(addr).is_allocated() {
            BlockRef::Used
        } else {
            BlockRef::Free(FreeBlock::ptr_from_addr(addr))
        }
    }

    /// Returns a reference to the header at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header.
    pub unsafe fn at(addr: usize) -> &'static mut Block {
        &mut *(addr as *mut Block)
    }

    /// Writes a zero sized allocated sentinel at the given address.
    ///
    /// # Safety
    ///
    /// The address must be valid for writing a single word.
    pub unsafe fn write_sentinel(addr: usize, prev_allocated: bool) {
        *(addr as *mut TagWord) = TagWord::sentinel(prev_allocated);
    }

    /// Sets the prev allocated flag of the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header.
    pub unsafe fn set_prev_allocated_for_block_with_addr(addr: usize, prev_allocated: bool) {
        Self::at(addr).0.set_prev_allocated(prev_allocated)
    }

    pub fn tag(&self) -> TagWord {
        self.0
    }

    /// The size of the block, including its header and footer.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn is_allocated(&self) -> bool {
        self.0.is_allocated()
    }

    /// Is the block right before this one allocated? Only meaningful when
    /// allocated blocks have their footers elided.
    pub fn is_prev_allocated(&self) -> bool {
        self.0.is_prev_allocated()
    }

    /// The address where this block starts.
    pub fn addr(&self) -> usize {
        self as *const _ as usize
    }

    /// The address where the payload of this block starts.
    pub fn payload_addr(&self) -> usize {
        self.addr() + WORD_SIZE
    }

    /// The address where this block ends, which is also the address of the
    /// next block.
    pub fn end_addr(&self) -> usize {
        self.addr() + self.size()
    }

    fn footer_ptr(&self) -> *mut TagWord {
        (self.end_addr() - WORD_SIZE) as *mut TagWord
    }

    /// Reads the last word of this block. Only a real footer if the block is
    /// free or footers of allocated blocks are maintained.
    pub fn footer(&self) -> TagWord {
        unsafe { *self.footer_ptr() }
    }

    /// Writes a footer mirroring the current header.
    pub fn write_footer(&mut self) {
        let footer = self.0.mirrored_footer();
        unsafe { *self.footer_ptr() = footer }
    }

    /// Reads the word right before this block's header, which is the footer of
    /// the previous block (or the prologue for the first block).
    pub fn prev_footer(&self) -> TagWord {
        unsafe { *((self.addr() - WORD_SIZE) as *const TagWord) }
    }
}

/// An allocated block in the heap.
#[repr(transparent)]
pub struct UsedBlock(pub(crate) Block);

pub type UsedBlockRef = &'static mut UsedBlock;

impl UsedBlock {
    /// Returns a [`UsedBlockRef`] for the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid allocated block.
    pub unsafe fn from_addr(addr: usize) -> UsedBlockRef {
        &mut *(addr as *mut UsedBlock)
    }

    /// Returns the block that owns the given payload address.
    ///
    /// # Safety
    ///
    /// The address must have been returned by the allocator and must still be
    /// allocated.
    pub unsafe fn from_payload_addr(payload_addr: usize) -> UsedBlockRef {
        Self::from_addr(payload_addr - WORD_SIZE)
    }

    /// Writes the header of a new allocated block. The footer and the next
    /// block's prev allocated flag are left for the caller, since whether they
    /// exist depends on the footer policy.
    ///
    /// # Safety
    ///
    /// `addr..addr + size` must lie inside the heap and must not be used by any
    /// other block. `size` must be divisible by 16.
    pub unsafe fn create_new(addr: usize, size: usize, prev_allocated: bool) -> UsedBlockRef {
        *(addr as *mut Block) = Block(TagWord::pack(size, true, prev_allocated));
        Self::from_addr(addr)
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn payload_addr(&self) -> usize {
        self.0.payload_addr()
    }

    /// Marks this block as free and writes its footer, without linking it into
    /// a free list and without telling the next block.
    ///
    /// # Safety
    ///
    /// The caller must coalesce or link the returned block, and must update
    /// the next block's prev allocated flag if that flag is maintained.
    pub unsafe fn mark_as_free_without_updating_next_block(&mut self) -> FreeBlockPtr {
        self.0 .0.set_allocated(false);
        self.0.write_footer();
        FreeBlock::ptr_from_addr(self.0.addr())
    }
}

/// A free block in the heap. Its first payload words hold the links of the
/// circular free list it lives in.
#[repr(C)]
#[derive(Debug)]
pub struct FreeBlock {
    pub(crate) header: Block,
    pub(crate) next: FreeBlockPtr,
    pub(crate) prev: FreeBlockPtr,
}

pub type FreeBlockPtr = NonNull<FreeBlock>;

impl FreeBlock {
    /// # Safety
    ///
    /// The address must be non-null and point to a free block.
    pub unsafe fn ptr_from_addr(addr: usize) -> FreeBlockPtr {
        NonNull::new_unchecked(addr as *mut FreeBlock)
    }

    /// Creates a new free block at the given address by writing its header and
    /// footer. The links are left unset until the block is inserted into a
    /// free list.
    ///
    /// # Safety
    ///
    /// `addr..addr + size` must lie inside the heap and must not be used by any
    /// other block. `size` must be divisible by 16 and at least
    /// [`MIN_BLOCK_SIZE`](crate::MIN_BLOCK_SIZE).
    pub unsafe fn create_new_without_linking(
        addr: usize,
        size: usize,
        prev_allocated: bool,
    ) -> FreeBlockPtr {
        let block = Block::at(addr);
        block.0 = TagWord::pack(size, false, prev_allocated);
        block.write_footer();
        Self::ptr_from_addr(addr)
    }

    pub fn addr(&self) -> usize {
        self.header.addr()
    }

    pub fn size(&self) -> usize {
        self.header.size()
    }

    pub fn next(&self) -> FreeBlockPtr {
        self.next
    }

    pub fn prev(&self) -> FreeBlockPtr {
        self.prev
    }

    /// Sets the size of this free block and rewrites its footer at the new
    /// end.
    ///
    /// The block must not be linked into a free list while its size changes,
    /// since its bucket is derived from its size.
    pub fn set_size(&mut self, new_size: usize) {
        self.header.0.set_size(new_size);
        self.header.write_footer();
    }

    /// Marks this block as allocated, without writing a footer and without
    /// updating the next block.
    ///
    /// # Safety
    ///
    /// The block must already be unlinked from its free list.
    pub unsafe fn mark_as_used_without_updating_next_block(&mut self) -> UsedBlockRef {
        self.header.0.set_allocated(true);
        UsedBlock::from_addr(self.addr())
    }
}

/// A used block, or a reference to a free one.
pub enum BlockRef {
    Used,
    Free(FreeBlockPtr),
}
