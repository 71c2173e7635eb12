use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalFrame;
use kernel_vmem::FrameAlloc;
use log::error;

/// Bitmap allocator over a contiguous range of physical frames.
///
/// One bit per frame; a set bit means in use. Allocation scans for the
/// first clear bit, so frames are reused lowest-address first. The
/// allocator does no zeroing and never touches frame contents; that is the
/// caller's business.
///
/// # Invariants
/// - `in_use` always equals the number of set bits.
/// - Frames handed out are inside `[first, first + capacity)`.
pub struct BitmapFrameAlloc {
    /// First frame of the managed range.
    first: PhysicalFrame,
    /// One bit per frame, packed into words.
    bits: Vec<u64>,
    /// Frames in the managed range.
    capacity: u32,
    /// Currently allocated frames.
    in_use: u32,
}

const BITS_PER_WORD: u32 = u64::BITS;

impl BitmapFrameAlloc {
    /// Manage `capacity` frames starting at `first`, all initially free.
    #[must_use]
    pub fn new(first: PhysicalFrame, capacity: u32) -> Self {
        let words = capacity.div_ceil(BITS_PER_WORD) as usize;
        Self {
            first,
            bits: vec![0; words],
            capacity,
            in_use: 0,
        }
    }

    /// Frames currently allocated.
    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Frames in the managed range.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn index_of(&self, frame: PhysicalFrame) -> Option<u32> {
        let index = frame.number().checked_sub(self.first.number())?;
        (index < self.capacity).then_some(index)
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_page(&mut self) -> Option<PhysicalFrame> {
        for (word_index, word) in self.bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let index = word_index as u32 * BITS_PER_WORD + bit;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(PhysicalFrame::from_number(self.first.number() + index));
        }
        None
    }

    fn free_page(&mut self, frame: PhysicalFrame) {
        let Some(index) = self.index_of(frame) else {
            error!("free of frame {frame} outside the managed range");
            panic!("frame outside the managed range");
        };
        let word = &mut self.bits[(index / BITS_PER_WORD) as usize];
        let mask = 1u64 << (index % BITS_PER_WORD);
        assert!(*word & mask != 0, "double free of frame {frame}");
        *word &= !mask;
        self.in_use -= 1;
    }
}
