//! Reference-counted page-table entries.
//!
//! A [`Pte`] owns exactly one physical frame. Sharing a frame between
//! address spaces (the COW edge of fork) is expressed by several page-table
//! slots holding the *same* entry, never by two entries naming the same
//! frame. The handle type [`PteRef`] manages the entry's node memory; the
//! explicit `ref_count` inside carries the frame-ownership protocol and
//! always equals the number of slots holding the handle.
//!
//! Invariants, holding whenever no entry lock is taken:
//! - `ref_count >= 1` while the entry is reachable from any page table.
//! - `ref_count > 1` implies [`PageFlags::WRITABLE`] is clear, so stores
//!   trap and trigger the COW split.

use crate::{FrameAlloc, PhysMapper, VmError, copy_page, tlb::EntryLo, zero_page};
use alloc::sync::Arc;
use kernel_memory_addresses::PhysicalFrame;
use kernel_sync::SpinLock;

bitflags::bitflags! {
    /// Per-entry control bits.
    ///
    /// Kept separate from the frame address; the two are only combined into
    /// a hardware word at the TLB boundary.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The translation may be loaded into the TLB.
        const VALID = 1 << 0;

        /// Writes are permitted. Must be clear while the entry is shared.
        const WRITABLE = 1 << 1;
    }
}

/// Shared handle to a page-table entry.
pub type PteRef = Arc<Pte>;

/// Lock-guarded interior of a [`Pte`].
#[derive(Debug)]
struct PteState {
    /// The owned frame.
    frame: PhysicalFrame,
    /// Control bits for the frame.
    flags: PageFlags,
    /// Number of page-table slots referencing this entry.
    ref_count: u32,
}

/// A page-table entry: the owning handle for one mapped frame.
#[derive(Debug)]
pub struct Pte {
    /// Eligible for COW sharing across fork. Fixed at creation: set for
    /// text/data/heap/file pages, clear for stack pages, which fork copies
    /// eagerly.
    shared: bool,
    state: SpinLock<PteState>,
}

impl Pte {
    /// Allocate one zeroed frame and wrap it in a fresh entry with
    /// `ref_count == 1`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the frame allocator is exhausted.
    pub fn new<A: FrameAlloc, M: PhysMapper>(
        alloc: &mut A,
        mapper: &M,
        shared: bool,
        flags: PageFlags,
    ) -> Result<PteRef, VmError> {
        let frame = alloc.alloc_page().ok_or(VmError::OutOfMemory)?;
        zero_page(mapper, frame);

        Ok(Arc::new(Self {
            shared,
            state: SpinLock::new(PteState {
                frame,
                flags,
                ref_count: 1,
            }),
        }))
    }

    /// Whether fork shares this entry instead of copying it.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Snapshot of the owned frame.
    #[must_use]
    pub fn frame(&self) -> PhysicalFrame {
        self.state.lock().frame
    }

    /// Snapshot of the control bits.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        self.state.lock().flags
    }

    /// Snapshot of the share count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    /// Marshal frame and control bits into the hardware TLB data word.
    #[must_use]
    pub fn entry_lo(&self) -> EntryLo {
        let st = self.state.lock();
        EntryLo::for_frame(st.frame, st.flags)
    }

    /// Register one more page-table slot referencing this entry.
    ///
    /// This is the point at which the page becomes read-only in all
    /// sharers: the writable bit is dropped so the next store, from either
    /// side, traps into the COW split.
    pub fn inc_ref(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.ref_count >= 1);
        st.ref_count += 1;
        st.flags.remove(PageFlags::WRITABLE);
    }

    /// Drop one page-table slot's reference. When the last reference goes,
    /// the frame is zeroed and returned to the allocator.
    ///
    /// Returns `true` when the entry was destroyed. The caller must already
    /// have unlinked the entry from its slot.
    pub fn dec_ref<A: FrameAlloc, M: PhysMapper>(&self, alloc: &mut A, mapper: &M) -> bool {
        let mut st = self.state.lock();
        assert!(st.ref_count >= 1, "page entry reference underflow");
        if st.ref_count > 1 {
            st.ref_count -= 1;
            return false;
        }

        // Last reference: nothing else can observe the entry any more.
        st.ref_count = 0;
        st.flags = PageFlags::empty();
        zero_page(mapper, st.frame);
        alloc.free_page(st.frame);
        true
    }

    /// Produce a private duplicate: new entry, new frame, same bytes, same
    /// control bits. Used by fork for entries that are not COW-shareable.
    ///
    /// The replacement frame is allocated before the source lock is taken,
    /// so no lock is held across a blocking allocation.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when no frame is available.
    pub fn deep_copy<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
    ) -> Result<PteRef, VmError> {
        let new = Self::new(alloc, mapper, self.shared, PageFlags::empty())?;
        let new_frame = new.state.lock().frame;

        let src_flags = {
            let st = self.state.lock();
            copy_page(mapper, new_frame, st.frame);
            st.flags
        };

        new.state.lock().flags = src_flags;
        Ok(new)
    }

    /// Resolve a write-protection fault against this entry.
    ///
    /// With a single referent the entry itself is made writable again (fast
    /// path, no allocation). Otherwise a private duplicate is made, marked
    /// writable, and the source's share count is dropped; the caller swaps
    /// the duplicate into its slot.
    ///
    /// The duplicate is allocated with no lock held; if the other sharers
    /// disappear in that window, the fast path is taken after all and the
    /// speculative entry is released.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when no frame is available for the split.
    pub fn cow_copy<A: FrameAlloc, M: PhysMapper>(
        self: &Arc<Self>,
        alloc: &mut A,
        mapper: &M,
    ) -> Result<PteRef, VmError> {
        {
            let mut st = self.state.lock();
            debug_assert!(st.ref_count >= 1);
            if st.ref_count == 1 {
                st.flags.insert(PageFlags::WRITABLE);
                return Ok(Arc::clone(self));
            }
        }

        let new = Self::new(alloc, mapper, self.shared, PageFlags::empty())?;
        let new_frame = new.state.lock().frame;

        let new_flags = {
            let mut st = self.state.lock();
            if st.ref_count == 1 {
                // The other sharers vanished while we allocated.
                st.flags.insert(PageFlags::WRITABLE);
                drop(st);
                new.dec_ref(alloc, mapper);
                return Ok(Arc::clone(self));
            }

            copy_page(mapper, new_frame, st.frame);
            st.ref_count -= 1;
            assert!(st.ref_count >= 1);
            st.flags | PageFlags::WRITABLE
        };

        new.state.lock().flags = new_flags;
        Ok(new)
    }
}
