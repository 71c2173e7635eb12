//! Heap growth and file-backed mappings.
//!
//! The heap is an ordinary region whose top edge moves under `sbrk`; file
//! mappings are regions carved out of the gap between the heap and the
//! stack. Both keep the structural invariant that every mapped page lies
//! inside exactly one region, which is why shrinking the heap and removing
//! a mapping eagerly drop the translations they uncover.

use crate::address_space::AddressSpace;
use crate::region::{RegionKind, RegionPerms};
use crate::{FileTable, FrameAlloc, PhysMapper, VmError, frame_bytes};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};
use log::warn;

impl AddressSpace {
    /// Move the heap break by `amount` bytes and return the previous top.
    ///
    /// `sbrk(0)` reports the current top. Growth rounds the new top up to a
    /// page boundary, shrinking rounds down; translations above a lowered
    /// top are removed and their frames released.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the new top would fall below the heap
    /// base or reach the region directly above the heap.
    pub fn sbrk<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        amount: i32,
    ) -> Result<VirtualAddress, VmError> {
        let heap_base = self.heap_start().expect("heap not defined");
        let heap = self
            .regions()
            .find_by_vbase(heap_base)
            .expect("heap region missing");
        let old_top = heap.vtop();
        debug_assert!(old_top.is_page_aligned());

        if amount == 0 {
            return Ok(old_top);
        }

        let page_size = i64::from(PAGE_SIZE);
        let mut new_top = i64::from(old_top.as_u32()) + i64::from(amount);
        if amount > 0 {
            new_top = (new_top + page_size - 1) & !(page_size - 1);
        } else {
            new_top &= !(page_size - 1);
        }

        if new_top < i64::from(heap_base.as_u32()) {
            return Err(VmError::OutOfMemory);
        }
        let limit = self.regions().above_heap().vbase.base();
        if new_top >= i64::from(limit.as_u32()) {
            return Err(VmError::OutOfMemory);
        }
        let new_top = VirtualAddress::new(new_top as u32);

        // A lowered top uncovers pages that no longer belong to any
        // region; drop their translations now.
        if new_top < old_top {
            self.release_range(alloc, mapper, new_top.page(), old_top.page());
        }

        let heap = self
            .regions_mut()
            .find_by_vbase_mut(heap_base)
            .expect("heap region missing");
        heap.npages = (new_top.as_u32() - heap.vbase.as_u32()) / PAGE_SIZE;
        Ok(old_top)
    }

    /// Map `length` bytes of the open file `fd`, starting at byte
    /// `offset`, into the gap below the stack. Returns the chosen base.
    ///
    /// Pages fault in lazily; nothing is read here.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero length or an unaligned
    ///   offset.
    /// - [`VmError::BadDescriptor`] when `fd` is not open.
    /// - [`VmError::OutOfMemory`] when no gap fits.
    pub fn mmap<F: FileTable + ?Sized>(
        &mut self,
        files: &mut F,
        length: u32,
        prot: RegionPerms,
        fd: i32,
        offset: u64,
    ) -> Result<VirtualAddress, VmError> {
        if length == 0 || offset % u64::from(PAGE_SIZE) != 0 {
            return Err(VmError::InvalidArgument);
        }
        if files.get(fd).is_none() {
            return Err(VmError::BadDescriptor);
        }

        let npages = length.div_ceil(PAGE_SIZE);
        let vbase = self
            .regions_mut()
            .alloc_file_region(npages, prot, fd, offset)?;
        Ok(vbase.base())
    }

    /// Remove the file mapping based at `addr`.
    ///
    /// Resident pages of a writable mapping are written back through the
    /// descriptor first; then every translation in the range is removed and
    /// dereferenced, and the region is unlinked. A page whose entry is
    /// still shared with another address space (a forked sibling holds it)
    /// is not written back: the sibling keeps a live view of the frame, so
    /// this side only drops its reference.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] when `addr` is not the base of a FILE
    ///   region.
    /// - [`VmError::Io`] when a write-back fails; the mapping is removed
    ///   regardless.
    pub fn munmap<A, M, F>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        files: &mut F,
        addr: VirtualAddress,
    ) -> Result<(), VmError>
    where
        A: FrameAlloc,
        M: PhysMapper,
        F: FileTable + ?Sized,
    {
        let vbase = addr.page();
        let region = *self
            .regions()
            .find_by_vbase(vbase)
            .ok_or(VmError::InvalidArgument)?;
        let RegionKind::File { fd, offset } = region.kind else {
            return Err(VmError::InvalidArgument);
        };
        if addr != vbase.base() {
            return Err(VmError::InvalidArgument);
        }

        let write_back = region.perms.contains(RegionPerms::WRITE);
        let mut first_error = None;

        for index in 0..region.npages {
            let page = vbase.add_pages(index);
            let Some(pte) = self.page_table().remove_entry(page) else {
                continue;
            };

            if write_back {
                if pte.ref_count() > 1 {
                    // A forked sibling still maps the frame; it is not ours
                    // alone to read, and the sibling's copy survives.
                    warn!("page {page} still shared at munmap; skipping write-back");
                } else {
                    let file_offset = offset + u64::from(index) * u64::from(PAGE_SIZE);
                    match files.get(fd) {
                        Some(file) => {
                            // Safety: this slot held the last reference and
                            // it is already unlinked, so nothing else can
                            // reach the frame.
                            let bytes = unsafe { frame_bytes(mapper, pte.frame()) };
                            if let Err(e) = file.write_page(file_offset, bytes) {
                                warn!("write-back of page {page} failed: {e}");
                                first_error.get_or_insert(e);
                            }
                        }
                        None => {
                            warn!("descriptor {fd} closed before munmap; dropping page {page}");
                        }
                    }
                }
            }

            pte.dec_ref(alloc, mapper);
        }

        self.regions_mut()
            .remove_by_vbase(vbase)
            .expect("region vanished during munmap");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every translation in `[from, to)` and release the frames whose
    /// last reference lived here.
    fn release_range<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
        from: VirtualPage,
        to: VirtualPage,
    ) {
        let mut page = from;
        while page < to {
            if let Some(pte) = self.page_table().remove_entry(page) {
                pte.dec_ref(alloc, mapper);
            }
            page = page.add_pages(1);
        }
    }
}
