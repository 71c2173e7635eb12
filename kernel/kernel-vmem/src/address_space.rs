//! Per-process address spaces.
//!
//! An address space binds a [`RegionList`] to a [`PageTable`] and carries
//! the load-time state the fault handler consults. Lifecycle and layout
//! calls arrive from the process code (fork, exec, exit) and from the ELF
//! loader; translation state is touched only through the page table so the
//! fault handler can run against a shared borrow.

use crate::page_table::PageTable;
use crate::region::{Region, RegionKind, RegionList, RegionPerms};
use crate::tlb::{Tlb, tlb_flush};
use crate::{FrameAlloc, PhysMapper, VmError};
use kernel_info::memory::{INITIAL_HEAP_PAGES, STACK_PAGES, USERSTACK};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};
use kernel_sync::SplState;
use log::debug;

/// Virtual-memory context of one process.
#[derive(Debug)]
pub struct AddressSpace {
    regions: RegionList,
    page_table: PageTable,
    /// While set (segment loading), permission gates and the TLB loader
    /// treat every region as writable.
    force_readwrite: bool,
    /// Base of the heap region, cached by [`define_stack`](Self::define_stack).
    heap_start: Option<VirtualPage>,
    /// Base of the stack region, cached by [`define_stack`](Self::define_stack).
    stack_start: Option<VirtualPage>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// Empty address space: no regions, no translations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: RegionList::new(),
            page_table: PageTable::new(),
            force_readwrite: false,
            heap_start: None,
            stack_start: None,
        }
    }

    /// Duplicate this address space for fork.
    ///
    /// The region list is copied outright. Page-table entries are shared
    /// with a bumped reference count where the kind allows it and
    /// deep-copied otherwise; see [`PageTable::copy`].
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; the partial copy is fully unwound.
    pub fn copy<A: FrameAlloc, M: PhysMapper>(
        &self,
        alloc: &mut A,
        mapper: &M,
    ) -> Result<Self, VmError> {
        Ok(Self {
            regions: self.regions.clone(),
            page_table: self.page_table.copy(alloc, mapper)?,
            force_readwrite: self.force_readwrite,
            heap_start: self.heap_start,
            stack_start: self.stack_start,
        })
    }

    /// Tear the address space down: regions first, then the page table,
    /// which drops every translation and returns exclusively owned frames.
    pub fn destroy<A: FrameAlloc, M: PhysMapper>(self, alloc: &mut A, mapper: &M) {
        let Self {
            regions,
            page_table,
            ..
        } = self;
        drop(regions);
        page_table.destroy(alloc, mapper);
    }

    /// Make this address space current: flush the TLB. With no
    /// address-space identifiers every cached translation is stale.
    pub fn activate<T: Tlb>(&self, tlb: &mut T, spl: &SplState) {
        tlb_flush(tlb, spl);
    }

    /// Counterpart of [`activate`](Self::activate), called when the
    /// process is switched away; also a full flush.
    pub fn deactivate<T: Tlb>(&self, tlb: &mut T, spl: &SplState) {
        tlb_flush(tlb, spl);
    }

    /// Define a segment covering `[vaddr, vaddr + size)`.
    ///
    /// The base is aligned down and the size up to page granularity, the
    /// way ELF segments expect.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an empty range or one that
    /// intersects an existing region (malformed ELF input).
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: u32,
        perms: RegionPerms,
    ) -> Result<(), VmError> {
        let size = size
            .checked_add(vaddr.page_offset())
            .ok_or(VmError::InvalidArgument)?;
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let npages = size.div_ceil(PAGE_SIZE);

        let region = Region {
            vbase: vaddr.page(),
            npages,
            perms,
            kind: RegionKind::Unnamed,
        };
        if self.regions.intersects(&region) {
            return Err(VmError::InvalidArgument);
        }

        self.regions.insert(region);
        Ok(())
    }

    /// Begin loading segment contents: writes to read-only regions must
    /// succeed until [`complete_load`](Self::complete_load).
    pub fn prepare_load(&mut self) {
        assert!(!self.regions.is_empty());
        self.force_readwrite = true;
    }

    /// Loading finished; permissions are enforced again. Already-mapped
    /// TLB entries are discarded on the next activate.
    pub fn complete_load(&mut self) {
        assert!(!self.regions.is_empty());
        self.force_readwrite = false;
    }

    /// Define the stack and heap regions and return the initial user stack
    /// pointer.
    ///
    /// ELF images carry no stack segment (the stack starts empty and grows
    /// downward), so it is defined here: [`STACK_PAGES`] pages ending at
    /// [`USERSTACK`]. The heap gets [`INITIAL_HEAP_PAGES`] pages directly
    /// above the topmost segment. Afterwards the region list is sorted and
    /// must be free of overlaps.
    pub fn define_stack(&mut self) -> VirtualAddress {
        assert!(
            !self.regions.is_empty(),
            "stack defined before any segment"
        );
        debug_assert!(self.heap_start.is_none(), "stack defined twice");

        let top = self
            .regions
            .iter()
            .map(Region::vtop)
            .max()
            .expect("regions checked non-empty");
        let heap_base = VirtualPage::new_aligned(top);
        self.regions.insert(Region {
            vbase: heap_base,
            npages: INITIAL_HEAP_PAGES,
            perms: RegionPerms::READ | RegionPerms::WRITE,
            kind: RegionKind::Heap,
        });

        let stack_base = VirtualPage::new_aligned(VirtualAddress::new(
            USERSTACK - STACK_PAGES * PAGE_SIZE,
        ));
        self.regions.insert(Region {
            vbase: stack_base,
            npages: STACK_PAGES,
            perms: RegionPerms::READ | RegionPerms::WRITE,
            kind: RegionKind::Stack,
        });

        self.regions.sort_by_base();
        assert!(!self.regions.has_overlap(), "user regions overlap");

        self.heap_start = Some(heap_base);
        self.stack_start = Some(stack_base);
        debug!(
            "stack defined: heap at {heap_base}, stack at {stack_base}",
        );
        VirtualAddress::new(USERSTACK)
    }

    #[must_use]
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub(crate) fn regions_mut(&mut self) -> &mut RegionList {
        &mut self.regions
    }

    #[must_use]
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    #[must_use]
    pub fn force_readwrite(&self) -> bool {
        self.force_readwrite
    }

    /// Base of the heap region, once defined.
    #[must_use]
    pub fn heap_start(&self) -> Option<VirtualPage> {
        self.heap_start
    }

    /// Base of the stack region, once defined.
    #[must_use]
    pub fn stack_start(&self) -> Option<VirtualPage> {
        self.stack_start
    }
}
