use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_vmem::PhysMapper;

/// Page-aligned backing storage for one frame.
#[repr(align(4096))]
struct FrameCell(UnsafeCell<[u8; PAGE_SIZE as usize]>);

impl FrameCell {
    const fn zeroed() -> Self {
        Self(UnsafeCell::new([0; PAGE_SIZE as usize]))
    }
}

/// A contiguous bank of physical frames with a direct-map style
/// [`PhysMapper`].
///
/// The bank owns the storage for `[base, base + nframes * PAGE_SIZE)` and
/// resolves a physical address to a pointer into it, exactly the way a
/// kernel direct map turns a physical address into a kernel virtual one.
/// Which frame may be touched when is governed entirely by the VM core's
/// ownership rules (one live entry per frame, entry lock held for content
/// changes); the bank itself hands out raw access.
pub struct FrameBank {
    base: PhysicalAddress,
    frames: Vec<FrameCell>,
}

// Safety: the bank is plain storage. Concurrent access to *distinct*
// frames is fine; access to one frame is serialized by the frame's owner.
unsafe impl Sync for FrameBank {}
unsafe impl Send for FrameBank {}

impl FrameBank {
    /// A bank of `nframes` zeroed frames whose first frame sits at the
    /// page-aligned physical address `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, nframes: u32) -> Self {
        assert!(base.is_page_aligned(), "bank base must be page-aligned");
        let mut frames = Vec::with_capacity(nframes as usize);
        frames.resize_with(nframes as usize, FrameCell::zeroed);
        Self { base, frames }
    }

    /// The first frame of the bank.
    #[must_use]
    pub fn first_frame(&self) -> PhysicalFrame {
        self.base.frame()
    }

    /// Frames in the bank.
    #[must_use]
    pub fn nframes(&self) -> u32 {
        self.frames.len() as u32
    }

    fn cell(&self, pa: PhysicalAddress) -> *mut u8 {
        let index = pa
            .as_u32()
            .checked_sub(self.base.as_u32())
            .map(|off| off / PAGE_SIZE)
            .expect("physical address below the bank");
        assert!(
            (index as usize) < self.frames.len(),
            "physical address beyond the bank"
        );
        self.frames[index as usize].0.get().cast::<u8>()
    }
}

impl PhysMapper for FrameBank {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.cell(pa);
        // Safety: the caller vouches for type, exclusivity, and lifetime
        // per the trait contract; in-page offsets stay within the frame.
        unsafe { &mut *ptr.add(pa.page_offset() as usize).cast::<T>() }
    }
}
