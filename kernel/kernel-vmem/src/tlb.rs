//! Hardware TLB words and the reload/flush routines.
//!
//! The machine translates through a software-reloaded TLB of [`NUM_TLB`]
//! entry pairs. Each entry pairs an [`EntryHi`] (the virtual page number)
//! with an [`EntryLo`] (the physical frame number plus control bits). The
//! frame number and control bits live in separate typed fields everywhere
//! else in this crate; they are marshalled into these words only here, at
//! the hardware boundary.
//!
//! Reloads and flushes run at raised interrupt priority so a fault taken
//! mid-sequence cannot re-enter the TLB.

use crate::pte::PageFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalFrame, VirtualPage};
use kernel_sync::SplState;

/// Number of entry pairs in the hardware TLB.
pub const NUM_TLB: usize = 64;

/// TLB key word: the virtual page the entry translates.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EntryHi {
    #[bits(12)]
    __: u16,

    /// Virtual page number (bits 31–12 of the address).
    #[bits(20)]
    pub vpn: u32,
}

impl EntryHi {
    /// Key for a user virtual page.
    #[must_use]
    pub const fn for_page(page: VirtualPage) -> Self {
        Self::new().with_vpn(page.number())
    }

    /// Key used to invalidate TLB slot `index`.
    ///
    /// Each slot gets a distinct kernel-space page number so the TLB never
    /// holds duplicate keys, which the hardware treats as a machine check.
    #[must_use]
    pub const fn invalid_slot(index: usize) -> Self {
        Self::new().with_vpn((0x8000_0000u32 >> 12) + index as u32)
    }

    /// The virtual page this key translates.
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing(kernel_memory_addresses::VirtualAddress::new(self.vpn() << 12))
    }
}

/// TLB data word: physical frame number plus control bits.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EntryLo {
    #[bits(8)]
    __: u8,

    /// Entry matches regardless of address-space id. Unused in this model.
    pub global: bool, // bit 8

    /// Translation is usable; a miss is raised when clear.
    pub valid: bool, // bit 9

    /// Writes are permitted. A store through an entry with this bit clear
    /// raises a write-protection fault, which is what makes COW work.
    pub dirty: bool, // bit 10

    /// Accesses bypass the cache. Unused in this model.
    pub nocache: bool, // bit 11

    /// Physical frame number (bits 31–12 of the frame address).
    #[bits(20)]
    pub pfn: u32,
}

impl EntryLo {
    /// Marshal a frame and its control bits into the hardware format.
    #[must_use]
    pub fn for_frame(frame: PhysicalFrame, flags: PageFlags) -> Self {
        Self::new()
            .with_pfn(frame.number())
            .with_valid(flags.contains(PageFlags::VALID))
            .with_dirty(flags.contains(PageFlags::WRITABLE))
    }

    /// The all-clear word used to invalidate a slot.
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new()
    }

    /// The frame this word maps.
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.pfn())
    }
}

/// The hardware TLB.
///
/// Implementations mirror the machine's probe/write/write-random interface.
/// All operations are called with the interrupt priority already raised;
/// implementations may `debug_assert!` on [`SplState::is_high`] if they keep
/// a reference to the priority state.
pub trait Tlb {
    /// Index of the entry matching `hi`, if any.
    fn probe(&mut self, hi: EntryHi) -> Option<usize>;

    /// Overwrite the entry at `index`.
    fn write_indexed(&mut self, index: usize, hi: EntryHi, lo: EntryLo);

    /// Overwrite an entry chosen by the hardware's random register.
    fn write_random(&mut self, hi: EntryHi, lo: EntryLo);

    /// Number of entry pairs ([`NUM_TLB`] on real hardware).
    fn entry_count(&self) -> usize;
}

/// Install one translation, overwriting an existing entry for the same page
/// if the TLB holds one.
///
/// When `force_readwrite` is set (segment loading in progress) the dirty bit
/// is OR-ed in so stores to read-only segments succeed. Probing before the
/// random write keeps at most one entry per page and guarantees per-fault
/// forward progress without an eviction policy.
pub fn tlb_load<T: Tlb>(
    tlb: &mut T,
    spl: &SplState,
    page: VirtualPage,
    mut lo: EntryLo,
    force_readwrite: bool,
) {
    let _spl = spl.raise();

    if force_readwrite {
        lo.set_dirty(true);
    }

    let hi = EntryHi::for_page(page);
    match tlb.probe(hi) {
        Some(index) => tlb.write_indexed(index, hi, lo),
        None => tlb.write_random(hi, lo),
    }
}

/// Invalidate every TLB entry.
///
/// Used on address-space switch; with no address-space identifiers the
/// whole translation cache must go.
pub fn tlb_flush<T: Tlb>(tlb: &mut T, spl: &SplState) {
    let _spl = spl.raise();

    for index in 0..tlb.entry_count() {
        tlb.write_indexed(index, EntryHi::invalid_slot(index), EntryLo::invalid());
    }
}
