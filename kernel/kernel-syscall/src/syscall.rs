use crate::Errno;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, FileTable, FrameAlloc, PhysMapper, RegionPerms};
use log::trace;

/// Memory-management syscall numbers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sysno {
    Sbrk = 17,
    Mmap = 90,
    Munmap = 91,
}

/// The four argument registers as the trap stub hands them over.
#[derive(Copy, Clone, Debug, Default)]
pub struct SyscallArgs {
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
}

const PROT_READ: u32 = 1 << 0;
const PROT_WRITE: u32 = 1 << 1;
const PROT_EXEC: u32 = 1 << 2;

fn decode_prot(prot: u32) -> Result<RegionPerms, Errno> {
    if prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
        return Err(Errno::Inval);
    }
    let mut perms = RegionPerms::empty();
    if prot & PROT_READ != 0 {
        perms |= RegionPerms::READ;
    }
    if prot & PROT_WRITE != 0 {
        perms |= RegionPerms::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        perms |= RegionPerms::EXEC;
    }
    Ok(perms)
}

/// `sbrk(amount)`: move the heap break; returns the previous break.
///
/// # Errors
/// `NoMem` when the break would leave the space available to the heap.
pub fn sys_sbrk<A: FrameAlloc, M: PhysMapper>(
    aspace: &mut AddressSpace,
    alloc: &mut A,
    mapper: &M,
    amount: i32,
) -> Result<u32, Errno> {
    let prev = aspace.sbrk(alloc, mapper, amount)?;
    Ok(prev.as_u32())
}

/// `mmap(length, prot, fd, offset)`: map a file below the stack; returns
/// the chosen base address.
///
/// # Errors
/// `Inval` for bad length/offset/prot, `BadF` for an unopened descriptor,
/// `NoMem` when no gap fits.
pub fn sys_mmap<F: FileTable + ?Sized>(
    aspace: &mut AddressSpace,
    files: &mut F,
    length: u32,
    prot: u32,
    fd: i32,
    offset: u64,
) -> Result<u32, Errno> {
    let perms = decode_prot(prot)?;
    let base = aspace.mmap(files, length, perms, fd, offset)?;
    Ok(base.as_u32())
}

/// `munmap(addr)`: remove the file mapping based at `addr`.
///
/// # Errors
/// `Inval` when `addr` is not the base of a file mapping, `Io` when the
/// final write-back fails.
pub fn sys_munmap<A, M, F>(
    aspace: &mut AddressSpace,
    alloc: &mut A,
    mapper: &M,
    files: &mut F,
    addr: u32,
) -> Result<u32, Errno>
where
    A: FrameAlloc,
    M: PhysMapper,
    F: FileTable + ?Sized,
{
    aspace.munmap(alloc, mapper, files, VirtualAddress::new(addr))?;
    Ok(0)
}

/// Dispatch one memory syscall and encode the result as the return word:
/// the value on success, `-errno` on failure, `-ENOSYS` for numbers this
/// dispatcher does not implement.
pub fn dispatch<A, M, F>(
    aspace: &mut AddressSpace,
    alloc: &mut A,
    mapper: &M,
    files: &mut F,
    sysno: u32,
    args: &SyscallArgs,
) -> i64
where
    A: FrameAlloc,
    M: PhysMapper,
    F: FileTable + ?Sized,
{
    trace!("syscall {sysno} ({args:?})");

    let result = match sysno {
        x if x == Sysno::Sbrk as u32 => sys_sbrk(aspace, alloc, mapper, args.arg0 as i32),
        x if x == Sysno::Mmap as u32 => sys_mmap(
            aspace,
            files,
            args.arg0,
            args.arg1,
            args.arg2 as i32,
            u64::from(args.arg3),
        ),
        x if x == Sysno::Munmap as u32 => sys_munmap(aspace, alloc, mapper, files, args.arg0),
        _ => Err(Errno::NoSys),
    };

    match result {
        Ok(value) => i64::from(value),
        Err(errno) => errno.as_return_word(),
    }
}
