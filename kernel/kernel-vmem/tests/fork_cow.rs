//! Fork, copy-on-write, and the cross-space reference-count invariants.

mod common;

use common::{Machine, PS, SoftTlb, va, vp};
use kernel_sync::SplState;
use kernel_vmem::pte::PageFlags;
use kernel_vmem::{
    AddressSpace, FaultType, Pte, PteRef, RegionPerms, VmContext, VmError, frame_bytes, vm_fault,
};
use std::collections::HashMap;
use std::sync::Arc;

fn fault(m: &mut Machine, aspace: &AddressSpace, ft: FaultType, addr: u32) -> Result<(), VmError> {
    let mut ctx = VmContext {
        alloc: &mut m.alloc,
        mapper: m.bank.as_ref(),
        tlb: &mut m.tlb,
        spl: m.spl.as_ref(),
        files: &mut m.files,
        current: Some(aspace),
    };
    vm_fault(&mut ctx, ft, va(addr))
}

fn rw() -> RegionPerms {
    RegionPerms::READ | RegionPerms::WRITE
}

/// Address space whose heap begins exactly at `0x1000_0000`.
fn aspace_with_heap_at_0x10000000() -> AddressSpace {
    let mut aspace = AddressSpace::new();
    aspace.define_region(va(0x0FFF_F000), PS, rw()).unwrap();
    aspace.define_stack();
    assert_eq!(aspace.heap_start().unwrap(), vp(0x1000_0000));
    aspace
}

/// Every live entry's share count must equal the number of slots holding
/// it across all given address spaces, every entry shared by more than one
/// slot must be read-only, and no two entries may own the same frame.
fn check_sharing_invariants(spaces: &[&AddressSpace]) {
    let mut slots_per_entry: HashMap<*const Pte, u32> = HashMap::new();
    let mut entries: HashMap<*const Pte, PteRef> = HashMap::new();

    for aspace in spaces {
        aspace.page_table().for_each_entry(|_, pte| {
            let key = PteRef::as_ptr(pte);
            *slots_per_entry.entry(key).or_insert(0) += 1;
            entries.entry(key).or_insert_with(|| PteRef::clone(pte));
        });
    }

    let mut frame_owner: HashMap<u32, *const Pte> = HashMap::new();
    for (key, pte) in &entries {
        let slots = slots_per_entry[key];
        assert_eq!(
            pte.ref_count(),
            slots,
            "share count disagrees with the number of slots"
        );
        if slots > 1 {
            assert!(
                !pte.flags().contains(PageFlags::WRITABLE),
                "shared entry left writable"
            );
        }
        let prev = frame_owner.insert(pte.frame().as_u32(), *key);
        assert!(prev.is_none(), "two live entries own one frame");
    }
}

#[test]
fn cow_fork_shares_then_splits_on_write() {
    let mut m = Machine::with_frames(16);
    let parent = aspace_with_heap_at_0x10000000();

    // Touch a heap page and write a marker through the frame.
    fault(&mut m, &parent, FaultType::Write, 0x1000_0000).unwrap();
    let parent_pte = parent.page_table().lookup(vp(0x1000_0000)).unwrap();
    unsafe {
        frame_bytes(m.bank.as_ref(), parent_pte.frame())[..2].copy_from_slice(&[0xDE, 0xAD]);
    }

    let child = parent.copy(&mut m.alloc, m.bank.as_ref()).unwrap();

    // The heap page is shared read-only by both spaces.
    assert_eq!(parent_pte.ref_count(), 2);
    assert!(!parent_pte.flags().contains(PageFlags::WRITABLE));
    let child_pte = child.page_table().lookup(vp(0x1000_0000)).unwrap();
    assert!(PteRef::ptr_eq(&parent_pte, &child_pte));
    check_sharing_invariants(&[&parent, &child]);

    // Parent stores again: write-protection fault, split, private copy.
    fault(&mut m, &parent, FaultType::ReadOnly, 0x1000_0000).unwrap();
    let split = parent.page_table().lookup(vp(0x1000_0000)).unwrap();
    assert!(!PteRef::ptr_eq(&split, &child_pte));
    assert_ne!(split.frame(), child_pte.frame());
    assert_eq!(split.ref_count(), 1);
    assert!(split.flags().contains(PageFlags::WRITABLE));
    assert_eq!(child_pte.ref_count(), 1);

    unsafe {
        frame_bytes(m.bank.as_ref(), split.frame())[..2].copy_from_slice(&[0xBE, 0xEF]);
    }

    // The split page carried the old bytes before the store; the child
    // still sees the original marker.
    let child_bytes = unsafe { frame_bytes(m.bank.as_ref(), child_pte.frame()) };
    assert_eq!(&child_bytes[..2], &[0xDE, 0xAD]);
    check_sharing_invariants(&[&parent, &child]);

    drop((parent_pte, child_pte, split));
    child.destroy(&mut m.alloc, m.bank.as_ref());
    parent.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}

#[test]
fn child_write_after_split_takes_the_fast_path() {
    let mut m = Machine::with_frames(16);
    let parent = aspace_with_heap_at_0x10000000();
    fault(&mut m, &parent, FaultType::Write, 0x1000_0000).unwrap();

    let child = parent.copy(&mut m.alloc, m.bank.as_ref()).unwrap();
    fault(&mut m, &parent, FaultType::ReadOnly, 0x1000_0000).unwrap();

    // The child is now sole owner; its store flips the bit in place.
    let before = child.page_table().lookup(vp(0x1000_0000)).unwrap();
    let frames_before = m.alloc.in_use();
    fault(&mut m, &child, FaultType::ReadOnly, 0x1000_0000).unwrap();
    let after = child.page_table().lookup(vp(0x1000_0000)).unwrap();

    assert!(PteRef::ptr_eq(&before, &after));
    assert!(after.flags().contains(PageFlags::WRITABLE));
    assert_eq!(m.alloc.in_use(), frames_before, "fast path must not allocate");

    drop((before, after));
    child.destroy(&mut m.alloc, m.bank.as_ref());
    parent.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}

#[test]
fn stack_pages_are_copied_eagerly_not_shared() {
    let mut m = Machine::with_frames(32);
    let parent = aspace_with_heap_at_0x10000000();
    let stack_page = parent.stack_start().unwrap();

    fault(&mut m, &parent, FaultType::Write, stack_page.as_u32()).unwrap();
    let parent_pte = parent.page_table().lookup(stack_page).unwrap();
    unsafe {
        frame_bytes(m.bank.as_ref(), parent_pte.frame())[0] = 0x11;
    }

    let child = parent.copy(&mut m.alloc, m.bank.as_ref()).unwrap();
    let child_pte = child.page_table().lookup(stack_page).unwrap();

    assert!(!PteRef::ptr_eq(&parent_pte, &child_pte));
    assert_ne!(parent_pte.frame(), child_pte.frame());
    assert_eq!(parent_pte.ref_count(), 1);
    assert_eq!(child_pte.ref_count(), 1);
    // The copy kept the writable bit: no fault needed for the next store.
    assert!(child_pte.flags().contains(PageFlags::WRITABLE));
    check_sharing_invariants(&[&parent, &child]);

    // Writes stay private in both directions.
    unsafe {
        frame_bytes(m.bank.as_ref(), parent_pte.frame())[0] = 0x22;
        assert_eq!(frame_bytes(m.bank.as_ref(), child_pte.frame())[0], 0x11);
    }

    drop((parent_pte, child_pte));
    child.destroy(&mut m.alloc, m.bank.as_ref());
    parent.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}

#[test]
fn failed_fork_unwinds_counts_and_frames() {
    // Room for the parent's two stack pages and one deep copy, not two.
    let mut m = Machine::with_frames(3);
    let parent = aspace_with_heap_at_0x10000000();
    let stack = parent.stack_start().unwrap();
    fault(&mut m, &parent, FaultType::Write, stack.as_u32()).unwrap();
    fault(&mut m, &parent, FaultType::Write, stack.add_pages(1).as_u32()).unwrap();
    assert_eq!(m.alloc.in_use(), 2);

    let err = parent.copy(&mut m.alloc, m.bank.as_ref()).unwrap_err();
    assert_eq!(err, VmError::OutOfMemory);

    // Fully unwound: no leaked frames, counts restored.
    assert_eq!(m.alloc.in_use(), 2);
    for page in [stack, stack.add_pages(1)] {
        let pte = parent.page_table().lookup(page).unwrap();
        assert_eq!(pte.ref_count(), 1);
    }
    check_sharing_invariants(&[&parent]);

    parent.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}

#[test]
fn concurrent_sibling_writes_split_exactly_once() {
    let mut m = Machine::with_frames(16);
    let parent = aspace_with_heap_at_0x10000000();
    fault(&mut m, &parent, FaultType::Write, 0x1000_0000).unwrap();
    let shared = parent.page_table().lookup(vp(0x1000_0000)).unwrap();
    unsafe {
        frame_bytes(m.bank.as_ref(), shared.frame())[..2].copy_from_slice(&[0xDE, 0xAD]);
    }
    drop(shared);

    let child = parent.copy(&mut m.alloc, m.bank.as_ref()).unwrap();
    let frames_before = m.alloc.in_use();

    // Both processes store to the shared page at once, each on its own
    // processor with its own TLB.
    std::thread::scope(|scope| {
        for aspace in [&parent, &child] {
            let mut alloc = m.alloc.clone();
            let bank = Arc::clone(&m.bank);
            scope.spawn(move || {
                let spl = Arc::new(SplState::new());
                let mut tlb = SoftTlb::new(Arc::clone(&spl));
                let mut files = common::TestFiles::new();
                let mut ctx = VmContext {
                    alloc: &mut alloc,
                    mapper: bank.as_ref(),
                    tlb: &mut tlb,
                    spl: spl.as_ref(),
                    files: &mut files,
                    current: Some(aspace),
                };
                vm_fault(&mut ctx, FaultType::ReadOnly, va(0x1000_0000)).unwrap();
            });
        }
    });

    // Exactly one split happened: one new frame, both sides private,
    // writable, and carrying the original bytes.
    assert_eq!(m.alloc.in_use(), frames_before + 1);
    let parent_pte = parent.page_table().lookup(vp(0x1000_0000)).unwrap();
    let child_pte = child.page_table().lookup(vp(0x1000_0000)).unwrap();
    assert!(!PteRef::ptr_eq(&parent_pte, &child_pte));
    assert_ne!(parent_pte.frame(), child_pte.frame());
    for pte in [&parent_pte, &child_pte] {
        assert_eq!(pte.ref_count(), 1);
        assert!(pte.flags().contains(PageFlags::WRITABLE));
        let bytes = unsafe { frame_bytes(m.bank.as_ref(), pte.frame()) };
        assert_eq!(&bytes[..2], &[0xDE, 0xAD]);
    }
    check_sharing_invariants(&[&parent, &child]);

    drop((parent_pte, child_pte));
    child.destroy(&mut m.alloc, m.bank.as_ref());
    parent.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}

#[test]
fn fork_of_a_forked_child_keeps_counts_consistent() {
    let mut m = Machine::with_frames(32);
    let gen0 = aspace_with_heap_at_0x10000000();
    fault(&mut m, &gen0, FaultType::Write, 0x1000_0000).unwrap();

    let gen1 = gen0.copy(&mut m.alloc, m.bank.as_ref()).unwrap();
    let gen2 = gen1.copy(&mut m.alloc, m.bank.as_ref()).unwrap();

    let pte = gen0.page_table().lookup(vp(0x1000_0000)).unwrap();
    assert_eq!(pte.ref_count(), 3);
    check_sharing_invariants(&[&gen0, &gen1, &gen2]);

    drop(pte);
    gen2.destroy(&mut m.alloc, m.bank.as_ref());
    gen1.destroy(&mut m.alloc, m.bank.as_ref());
    gen0.destroy(&mut m.alloc, m.bank.as_ref());
    assert_eq!(m.alloc.in_use(), 0);
}
