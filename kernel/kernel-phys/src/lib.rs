//! # Boot-Time Physical Memory Tracking and Allocation
//!
//! This crate owns the loader's picture of physical memory: an ordered list
//! of tagged, disjoint ranges (the [`Ledger`]) and the allocator that carves
//! allocations out of its `Free` ranges.
//!
//! ## Lifecycle
//!
//! 1. Platform startup code feeds every firmware-reported region into
//!    [`Ledger::add_range`] (or uses [`bootstrap`] to do so in one step),
//!    **before** the first allocation.
//! 2. [`Ledger::protect_range`] reserves memory the loader already occupies
//!    (its own image, firmware structures) as `Internal`.
//! 3. The loader and early kernel call [`Ledger::allocate`] for page tables,
//!    stacks, and module images.
//! 4. [`Ledger::finalize`] returns `Internal` ranges to `Free` just before
//!    the ledger is handed off to the kernel proper.
//!
//! All of this runs single-threaded during boot. The `&mut` receivers make
//! exclusive access a compile-time requirement; once the kernel goes
//! multi-core it must wrap the ledger in its own lock.
//!
//! ## Failure model
//!
//! Caller mistakes (zero-sized requests, bad alignment, protecting memory
//! that is not free) come back as typed errors. An overlap between firmware
//! regions of different types, or exhaustion without [`AllocFlags::CAN_FAIL`],
//! is unrecoverable and goes through `kernel_fatal`.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod allocate;
mod ledger;
mod range;

pub use crate::allocate::{AllocError, AllocFlags, AllocRequest};
pub use crate::ledger::{Ledger, ProtectError};
pub use crate::range::{MemoryRange, RangeType};

use kernel_addr::{PhysicalAddress, PhysicalSize};

/// Build the boot memory ledger from firmware-reported regions.
///
/// Mirrors the canonical init sequence: insert every detected region, then
/// protect the span occupied by the loader image itself so allocations never
/// land on top of running code. The initial map is logged for diagnosis.
///
/// # Panics
///
/// Fatal (via `kernel_fatal`) if the firmware regions overlap inconsistently
/// or the loader image does not lie in detected free memory.
pub fn bootstrap(
    regions: impl IntoIterator<Item = MemoryRange>,
    loader_image: Option<(PhysicalAddress, PhysicalSize)>,
) -> Ledger {
    let mut ledger = Ledger::new();
    for region in regions {
        ledger.add_range(region.start, region.size, region.ty);
    }

    if let Some((start, size)) = loader_image {
        if let Err(err) = ledger.protect_range(start, size) {
            kernel_fatal::fatal!("loader image at {start} (+{size:#x} bytes) not protectable: {err}");
        }
    }

    log::info!("memory: initial memory map:");
    ledger.dump();
    ledger
}
