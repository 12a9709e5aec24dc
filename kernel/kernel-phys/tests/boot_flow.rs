//! End-to-end boot sequence over the ledger: detect, protect, allocate,
//! finalize.

use kernel_addr::PhysicalAddress;
use kernel_phys::{AllocRequest, Ledger, MemoryRange, RangeType, bootstrap};

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

#[test]
fn protect_then_allocate_lands_after_the_protected_span() {
    let mut ledger = Ledger::new();
    ledger.add_range(pa(0x1000), 0xff000, RangeType::Free);

    // The loader occupies the first two pages of usable memory.
    ledger.protect_range(pa(0x1000), 0x2000).unwrap();

    let stack = ledger
        .allocate(
            &AllocRequest::new(0x1000)
                .align(0x1000)
                .tagged(RangeType::Stack),
        )
        .unwrap();
    assert_eq!(stack, pa(0x3000));
}

#[test]
fn bootstrap_protects_the_loader_image() {
    let regions = [
        MemoryRange::new(pa(0x1000), 0x9f000, RangeType::Free),
        MemoryRange::new(pa(0x100000), 0x700000, RangeType::Free),
        MemoryRange::new(pa(0x800000), 0x10000, RangeType::Reclaimable),
    ];
    let mut ledger = bootstrap(regions, Some((pa(0x100000), 0x20000)));

    // Nothing may be handed out of the loader image.
    let addr = ledger
        .allocate(&AllocRequest::new(0x1000).at_or_above(0x100000))
        .unwrap();
    assert!(addr.as_u64() >= 0x120000);

    // After finalize the image span is free again and merges with its
    // neighbourhood.
    ledger.finalize();
    assert!(
        ledger
            .ranges_of(RangeType::Free)
            .any(|r| r.contains(pa(0x100000)))
    );
}

#[test]
fn module_and_stack_allocations_walk_up_memory() {
    let mut ledger = Ledger::new();
    ledger.add_range(pa(0x0), 0x100000, RangeType::Free);

    let modules = ledger
        .allocate(&AllocRequest::new(0x8000).align(0x1000).tagged(RangeType::Modules))
        .unwrap();
    let stack = ledger
        .allocate(&AllocRequest::new(0x4000).align(0x1000).tagged(RangeType::Stack))
        .unwrap();
    let high = ledger
        .allocate(&AllocRequest::new(0x1000).align(0x1000).prefer_high())
        .unwrap();

    assert_eq!(modules, pa(0x0));
    assert_eq!(stack, pa(0x8000));
    assert_eq!(high, pa(0xff000));
    assert_eq!(ledger.total_free(), 0x100000 - 0x8000 - 0x4000 - 0x1000);
}
