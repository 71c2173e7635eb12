//! The page-fault handler.
//!
//! The trap layer delivers every TLB miss and write-protection trap here.
//! The handler validates the address against the faulting process's
//! regions, finds or creates the translation, and reloads the TLB. It runs
//! on the faulting thread's kernel stack; an error return makes the trap
//! layer kill the user process.

use crate::address_space::AddressSpace;
use crate::pte::{PageFlags, Pte, PteRef};
use crate::region::{Region, RegionKind, RegionPerms};
use crate::tlb::{Tlb, tlb_load};
use crate::{FileTable, FrameAlloc, PhysMapper, VmError, frame_bytes};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::SplState;
use log::trace;

/// Classified hardware fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultType {
    /// TLB miss on a load or instruction fetch.
    Read,
    /// TLB miss on a store.
    Write,
    /// Store through a resident entry whose dirty bit is clear.
    ReadOnly,
}

impl FaultType {
    /// Decode the trap layer's fault code.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for codes the hardware never raises.
    pub fn from_raw(code: u32) -> Result<Self, VmError> {
        match code {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

/// Everything the fault handler needs from the surrounding kernel, passed
/// explicitly: the collaborating services and the current process's address
/// space (if the fault happened in process context).
pub struct VmContext<'a, A, M, T, F>
where
    A: FrameAlloc,
    M: PhysMapper,
    T: Tlb,
    F: FileTable + ?Sized,
{
    pub alloc: &'a mut A,
    pub mapper: &'a M,
    pub tlb: &'a mut T,
    pub spl: &'a SplState,
    pub files: &'a mut F,
    pub current: Option<&'a AddressSpace>,
}

/// Resolve one hardware fault.
///
/// # Errors
/// - [`VmError::BadAddress`] outside every region, on a permission
///   violation, or without a current address space.
/// - [`VmError::OutOfMemory`] when no frame is available.
/// - [`VmError::BadDescriptor`] / [`VmError::Io`] for FILE-region paging.
pub fn vm_fault<A, M, T, F>(
    ctx: &mut VmContext<'_, A, M, T, F>,
    fault: FaultType,
    addr: VirtualAddress,
) -> Result<(), VmError>
where
    A: FrameAlloc,
    M: PhysMapper,
    T: Tlb,
    F: FileTable + ?Sized,
{
    let aspace = ctx.current.ok_or(VmError::BadAddress)?;
    let alloc = &mut *ctx.alloc;
    let mapper = ctx.mapper;
    let files = &mut *ctx.files;

    let region = aspace.regions().find(addr).ok_or(VmError::BadAddress)?;
    let force_readwrite = aspace.force_readwrite();

    match fault {
        FaultType::Read => {
            if !region.perms.contains(RegionPerms::READ) && !force_readwrite {
                return Err(VmError::BadAddress);
            }
        }
        FaultType::Write | FaultType::ReadOnly => {
            if !region.perms.contains(RegionPerms::WRITE) && !force_readwrite {
                return Err(VmError::BadAddress);
            }
        }
    }

    let page = addr.page();
    let page_table = aspace.page_table();

    let pte = match fault {
        FaultType::ReadOnly => {
            // A write-protection trap implies a resident entry: resolve the
            // COW split (or flip the writable bit back on) in place. A miss
            // here means the TLB held an entry this table never produced.
            page_table
                .cow_resolve(page, alloc, mapper)?
                .ok_or(VmError::BadAddress)?
        }
        FaultType::Read | FaultType::Write => {
            page_table.insert_with(page, || {
                trace!("lazy map of {page} for {fault:?} fault");
                fault_in_page(alloc, mapper, files, region, addr)
            })?
        }
    };

    tlb_load(ctx.tlb, ctx.spl, page, pte.entry_lo(), force_readwrite);
    Ok(())
}

/// Materialize the page behind a first-touch fault: a zeroed frame, filled
/// from the backing file when the region is file-backed.
fn fault_in_page<A, M, F>(
    alloc: &mut A,
    mapper: &M,
    files: &mut F,
    region: &Region,
    addr: VirtualAddress,
) -> Result<PteRef, VmError>
where
    A: FrameAlloc,
    M: PhysMapper,
    F: FileTable + ?Sized,
{
    // Stack pages stay private to their process; everything else is
    // eligible for COW sharing across fork.
    let shared = !matches!(region.kind, RegionKind::Stack);

    let mut flags = PageFlags::VALID;
    if region.perms.contains(RegionPerms::WRITE) {
        flags |= PageFlags::WRITABLE;
    }

    let pte = Pte::new(alloc, mapper, shared, flags)?;

    if let RegionKind::File { fd, offset } = region.kind {
        let page_index = addr.page().number() - region.vbase.number();
        let file_offset = offset + u64::from(page_index) * u64::from(PAGE_SIZE);

        let result = match files.get(fd) {
            // Safety: the entry is not yet installed anywhere; this is the
            // only reference to the frame.
            Some(file) => file.read_page(file_offset, unsafe {
                frame_bytes(mapper, pte.frame())
            }),
            None => Err(VmError::BadDescriptor),
        };
        if let Err(e) = result {
            pte.dec_ref(alloc, mapper);
            return Err(e);
        }
    }

    Ok(pte)
}
