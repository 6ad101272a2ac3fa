/// A boundary tag: a block size that is divisible by 16, which leaves the low
/// 4 bits free to store flags about the block.
///
/// Bit 0 is the allocated flag. Bit 1 records whether the block right before
/// this one in the heap is allocated; it is only maintained when allocated
/// blocks have their footers elided, and is always 0 in footers.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagWord(u64);

const ALLOCATED_BIT: u64 = 0b01;
const PREV_ALLOCATED_BIT: u64 = 0b10;
const FLAGS_MASK: u64 = 0b1111;

impl TagWord {
    /// Packs a size and the two flags into a tag word.
    ///
    /// The size must be divisible by 16.
    pub const fn pack(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        debug_assert!(size as u64 & FLAGS_MASK == 0);
        Self(size as u64 | allocated as u64 | ((prev_allocated as u64) << 1))
    }

    /// The tag of a zero sized, permanently allocated sentinel.
    pub const fn sentinel(prev_allocated: bool) -> Self {
        Self::pack(0, true, prev_allocated)
    }

    #[cfg(test)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The size stored in the tag.
    pub const fn size(self) -> usize {
        (self.0 & !FLAGS_MASK) as usize
    }

    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    pub const fn is_prev_allocated(self) -> bool {
        self.0 & PREV_ALLOCATED_BIT != 0
    }

    /// Returns the footer that mirrors this header: same size and allocation
    /// state, without the prev allocated side channel.
    pub const fn mirrored_footer(self) -> Self {
        Self(self.0 & !PREV_ALLOCATED_BIT)
    }

    /// Sets the size without touching the flags.
    ///
    /// Panics if the new size is not divisible by 16.
    pub fn set_size(&mut self, new_size: usize) {
        if new_size as u64 & FLAGS_MASK != 0 {
            panic!("the size stored in a tag word must be divisible by 16");
        }
        self.0 = new_size as u64 | (self.0 & FLAGS_MASK);
    }

    pub fn set_allocated(&mut self, allocated: bool) {
        self.0 = (self.0 & !ALLOCATED_BIT) | allocated as u64;
    }

    pub fn set_prev_allocated(&mut self, prev_allocated: bool) {
        self.0 = (self.0 & !PREV_ALLOCATED_BIT) | ((prev_allocated as u64) << 1);
    }
}
