//! Tagged physical memory ranges.

use core::fmt;
use kernel_addr::{PhysicalAddress, PhysicalSize};

/// Usage tag for a physical memory range.
///
/// `Free` memory is the allocator's feedstock; every other tag marks memory
/// as spoken for. `Internal` is special: it belongs to the loader itself and
/// flows back to `Free` when the ledger is finalized.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RangeType {
    /// Available for allocation.
    Free,
    /// Generic allocated memory.
    Allocated,
    /// In use now, reclaimable by the kernel once boot data is consumed.
    Reclaimable,
    /// Page table frames.
    PageTables,
    /// Stack memory.
    Stack,
    /// Loaded module images.
    Modules,
    /// Loader-internal; returned to `Free` by `Ledger::finalize`.
    Internal,
}

impl fmt::Display for RangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "Free",
            Self::Allocated => "Allocated",
            Self::Reclaimable => "Reclaimable",
            Self::PageTables => "Pagetables",
            Self::Stack => "Stack",
            Self::Modules => "Modules",
            Self::Internal => "Internal",
        })
    }
}

/// A contiguous, non-empty span of physical memory with a usage tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRange {
    /// First byte of the range.
    pub start: PhysicalAddress,
    /// Length in bytes; never zero inside a ledger.
    pub size: PhysicalSize,
    /// Usage tag.
    pub ty: RangeType,
}

impl MemoryRange {
    #[must_use]
    pub const fn new(start: PhysicalAddress, size: PhysicalSize, ty: RangeType) -> Self {
        Self { start, size, ty }
    }

    /// Last byte of the range (inclusive).
    ///
    /// Inclusive bounds sidestep overflow for ranges that touch the top of
    /// the address space.
    #[must_use]
    pub const fn last(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + (self.size - 1))
    }

    /// Whether this range shares at least one byte with `[start, last]`.
    #[must_use]
    pub const fn overlaps(&self, start: PhysicalAddress, last: PhysicalAddress) -> bool {
        self.start.as_u64() <= last.as_u64() && start.as_u64() <= self.last().as_u64()
    }

    /// Whether `addr` falls inside the range.
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() <= self.last().as_u64()
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Exclusive end reads better in logs; saturate at the top of memory.
        let end = self.start.as_u64().saturating_add(self.size);
        write!(f, "{:#018x}-{end:#018x}: {}", self.start.as_u64(), self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inclusive_last() {
        let r = MemoryRange::new(PhysicalAddress::new(0x1000), 0x1000, RangeType::Free);
        assert_eq!(r.last().as_u64(), 0x1fff);
        assert!(r.contains(PhysicalAddress::new(0x1fff)));
        assert!(!r.contains(PhysicalAddress::new(0x2000)));
    }

    #[test]
    fn overlap_is_inclusive() {
        let r = MemoryRange::new(PhysicalAddress::new(0x2000), 0x1000, RangeType::Free);
        assert!(r.overlaps(PhysicalAddress::new(0x2fff), PhysicalAddress::new(0x3fff)));
        assert!(!r.overlaps(PhysicalAddress::new(0x3000), PhysicalAddress::new(0x3fff)));
    }
}
