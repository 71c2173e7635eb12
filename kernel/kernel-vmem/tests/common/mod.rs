//! Shared machine rig for the end-to-end VM tests: a software TLB, an
//! in-memory file table, and a shareable frame allocator, wired to the
//! `kernel-alloc` frame bank.

#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAlloc, FrameBank};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualPage};
use kernel_sync::{SpinLock, SplState};
use kernel_vmem::tlb::{EntryHi, EntryLo, NUM_TLB, Tlb};
use kernel_vmem::{BackingFile, FileTable, FrameAlloc, VmError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Software stand-in for the hardware TLB.
///
/// `write_random` replaces entries round-robin, which is how the random
/// register of the real part behaves for these purposes. Every operation
/// asserts that the caller raised the interrupt priority first.
pub struct SoftTlb {
    entries: Vec<(EntryHi, EntryLo)>,
    next_random: usize,
    spl: Arc<SplState>,
}

impl SoftTlb {
    pub fn new(spl: Arc<SplState>) -> Self {
        Self {
            entries: (0..NUM_TLB)
                .map(|i| (EntryHi::invalid_slot(i), EntryLo::invalid()))
                .collect(),
            next_random: 0,
            spl,
        }
    }

    /// The data word cached for `page`, if a valid entry matches.
    pub fn resident(&self, page: VirtualPage) -> Option<EntryLo> {
        let hi = EntryHi::for_page(page);
        self.entries
            .iter()
            .find(|(h, lo)| *h == hi && lo.valid())
            .map(|(_, lo)| *lo)
    }

    /// Number of valid entries.
    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|(_, lo)| lo.valid()).count()
    }
}

impl Tlb for SoftTlb {
    fn probe(&mut self, hi: EntryHi) -> Option<usize> {
        assert!(self.spl.is_high(), "TLB probed at low priority");
        self.entries.iter().position(|(h, _)| *h == hi)
    }

    fn write_indexed(&mut self, index: usize, hi: EntryHi, lo: EntryLo) {
        assert!(self.spl.is_high(), "TLB written at low priority");
        self.entries[index] = (hi, lo);
    }

    fn write_random(&mut self, hi: EntryHi, lo: EntryLo) {
        assert!(self.spl.is_high(), "TLB written at low priority");
        let index = self.next_random;
        self.next_random = (self.next_random + 1) % self.entries.len();
        self.entries[index] = (hi, lo);
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// An open file backed by a growable byte vector.
pub struct MemFile {
    bytes: Vec<u8>,
    /// When set, every transfer fails with `VmError::Io`.
    pub fail_io: bool,
}

impl MemFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fail_io: false,
        }
    }

    pub fn with_pattern(len: usize, f: impl Fn(usize) -> u8) -> Self {
        Self::new((0..len).map(f).collect())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl BackingFile for MemFile {
    fn read_page(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VmError> {
        if self.fail_io {
            return Err(VmError::Io);
        }
        let offset = offset as usize;
        buf.fill(0);
        if offset < self.bytes.len() {
            let n = buf.len().min(self.bytes.len() - offset);
            buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        }
        Ok(())
    }

    fn write_page(&mut self, offset: u64, buf: &[u8]) -> Result<(), VmError> {
        if self.fail_io {
            return Err(VmError::Io);
        }
        let offset = offset as usize;
        if self.bytes.len() < offset + buf.len() {
            self.bytes.resize(offset + buf.len(), 0);
        }
        self.bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Per-process descriptor table over [`MemFile`]s.
#[derive(Default)]
pub struct TestFiles {
    open: BTreeMap<i32, MemFile>,
}

impl TestFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, fd: i32, file: MemFile) {
        self.open.insert(fd, file);
    }

    pub fn close(&mut self, fd: i32) -> Option<MemFile> {
        self.open.remove(&fd)
    }

    pub fn file(&self, fd: i32) -> &MemFile {
        &self.open[&fd]
    }
}

impl FileTable for TestFiles {
    fn get(&mut self, fd: i32) -> Option<&mut dyn BackingFile> {
        self.open.get_mut(&fd).map(|f| f as &mut dyn BackingFile)
    }
}

/// A cloneable allocator handle, so sibling "processes" on different
/// threads can draw frames from one pool.
#[derive(Clone)]
pub struct SharedAlloc(Arc<SpinLock<BitmapFrameAlloc>>);

impl SharedAlloc {
    pub fn new(inner: BitmapFrameAlloc) -> Self {
        Self(Arc::new(SpinLock::new(inner)))
    }

    pub fn in_use(&self) -> u32 {
        self.0.lock().in_use()
    }
}

impl FrameAlloc for SharedAlloc {
    fn alloc_page(&mut self) -> Option<kernel_memory_addresses::PhysicalFrame> {
        self.0.lock().alloc_page()
    }

    fn free_page(&mut self, frame: kernel_memory_addresses::PhysicalFrame) {
        self.0.lock().free_page(frame)
    }
}

/// The assembled machine: frames, allocator, TLB, SPL state, files.
pub struct Machine {
    pub bank: Arc<FrameBank>,
    pub alloc: SharedAlloc,
    pub spl: Arc<SplState>,
    pub tlb: SoftTlb,
    pub files: TestFiles,
}

impl Machine {
    pub fn with_frames(nframes: u32) -> Self {
        let bank = Arc::new(FrameBank::new(PhysicalAddress::new(0), nframes));
        let alloc = SharedAlloc::new(BitmapFrameAlloc::new(bank.first_frame(), nframes));
        let spl = Arc::new(SplState::new());
        let tlb = SoftTlb::new(Arc::clone(&spl));
        Self {
            bank,
            alloc,
            spl,
            tlb,
            files: TestFiles::new(),
        }
    }
}

pub fn va(addr: u32) -> VirtualAddress {
    VirtualAddress::new(addr)
}

pub fn vp(addr: u32) -> VirtualPage {
    VirtualPage::containing(VirtualAddress::new(addr))
}

pub const PS: u32 = PAGE_SIZE;
