//! The ordered ledger of tagged physical memory ranges.

use alloc::vec::Vec;

use kernel_addr::{PhysicalAddress, PhysicalSize};

use crate::range::{MemoryRange, RangeType};

/// Why a `protect_range` call was rejected.
///
/// Rejection leaves the ledger untouched; a span is only retagged when it is
/// entirely backed by `Free` memory beforehand.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum ProtectError {
    /// The span has zero length.
    #[error("cannot protect an empty span")]
    Empty,
    /// Part of the span is not covered by any tracked range.
    #[error("span not backed by tracked memory at {0}")]
    Untracked(PhysicalAddress),
    /// Part of the span is covered by a non-`Free` range.
    #[error("span overlaps non-free memory at {0}")]
    NotFree(PhysicalAddress),
}

/// Ordered collection of disjoint, tagged physical memory ranges.
///
/// Invariants, upheld by every mutation:
/// - ranges are sorted ascending by start address,
/// - no two ranges overlap,
/// - no range is empty,
/// - adjacent ranges of equal type are coalesced into one.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    ranges: Vec<MemoryRange>,
}

impl Ledger {
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Add a firmware-reported range of physical memory.
    ///
    /// Contiguous neighbours of the same type are merged. Overlap with an
    /// existing range of the **same** type unions silently (firmware lists
    /// occasionally double-report a region). Overlap with a range of a
    /// *different* type means the firmware memory map contradicts itself,
    /// which nothing at this layer can repair.
    ///
    /// # Panics
    ///
    /// Fatal (via `kernel_fatal`) on a differently-typed overlap or a
    /// zero-sized range.
    pub fn add_range(&mut self, start: PhysicalAddress, size: PhysicalSize, ty: RangeType) {
        if size == 0 {
            kernel_fatal::fatal!("memory: empty range at {start} (type {ty})");
        }

        let range = MemoryRange::new(start, size, ty);
        if let Some(other) = self
            .ranges
            .iter()
            .find(|r| r.ty != ty && r.overlaps(range.start, range.last()))
        {
            kernel_fatal::fatal!("memory: range {range} overlaps {other}");
        }

        self.insert(range);
        log::debug!("memory: added range {range}");
    }

    /// Retag `[start, start + size)` as `Internal` so the allocator will not
    /// hand it out. Used for memory the loader already occupies; `finalize`
    /// returns it to `Free`.
    ///
    /// The whole span must be `Free` beforehand. A span that touches
    /// untracked memory or a differently-typed range is rejected without
    /// mutating the ledger.
    ///
    /// # Errors
    ///
    /// See [`ProtectError`].
    pub fn protect_range(
        &mut self,
        start: PhysicalAddress,
        size: PhysicalSize,
    ) -> Result<(), ProtectError> {
        if size == 0 {
            return Err(ProtectError::Empty);
        }
        let last = PhysicalAddress::new(start.as_u64() + (size - 1));

        // Walk the covering ranges in address order; `cursor` is the first
        // byte not yet proven to be free.
        let mut cursor = start;
        for r in self.ranges.iter().filter(|r| r.overlaps(start, last)) {
            if r.start.as_u64() > cursor.as_u64() {
                return Err(ProtectError::Untracked(cursor));
            }
            if r.ty != RangeType::Free {
                return Err(ProtectError::NotFree(cursor));
            }
            match r.last().checked_add(1) {
                Some(next) => cursor = next,
                None => break, // range reaches the top of the address space
            }
            if cursor.as_u64() > last.as_u64() {
                break;
            }
        }
        if cursor.as_u64() <= last.as_u64() {
            return Err(ProtectError::Untracked(cursor));
        }

        self.insert(MemoryRange::new(start, size, RangeType::Internal));
        log::debug!("memory: protected {start} (+{size:#x} bytes)");
        Ok(())
    }

    /// Iterate all ranges in ascending address order.
    ///
    /// The iterator borrows the current ledger state; re-querying after a
    /// mutation reflects that mutation.
    pub fn ranges(&self) -> impl DoubleEndedIterator<Item = &MemoryRange> {
        self.ranges.iter()
    }

    /// Iterate the ranges of one type, in ascending address order.
    pub fn ranges_of(&self, ty: RangeType) -> impl DoubleEndedIterator<Item = &MemoryRange> {
        self.ranges.iter().filter(move |r| r.ty == ty)
    }

    /// Total number of free bytes.
    #[must_use]
    pub fn total_free(&self) -> PhysicalSize {
        self.ranges_of(RangeType::Free).map(|r| r.size).sum()
    }

    /// Return every `Internal` range to `Free` and re-coalesce.
    ///
    /// Called once boot is complete and the loader's own memory can be
    /// reclaimed by whatever takes over the ledger.
    pub fn finalize(&mut self) {
        for r in &mut self.ranges {
            if r.ty == RangeType::Internal {
                r.ty = RangeType::Free;
            }
        }
        self.coalesce();

        log::info!("memory: final memory map:");
        self.dump();
    }

    /// Log the current map, one range per line.
    pub fn dump(&self) {
        for r in &self.ranges {
            log::debug!("memory: {r}");
        }
    }

    /// Insert `range`, overwriting whatever it overlaps.
    ///
    /// Overlapped ranges are trimmed to the parts outside `range`; the sort
    /// order and coalescing invariants are restored afterwards. Callers are
    /// responsible for deciding whether the overwrite is legitimate (the
    /// allocator deliberately carves out of `Free` ranges).
    pub(crate) fn insert(&mut self, range: MemoryRange) {
        debug_assert!(range.size > 0);
        let first = range.start;
        let last = range.last();

        let mut out = Vec::with_capacity(self.ranges.len() + 2);
        for r in self.ranges.drain(..) {
            if !r.overlaps(first, last) {
                out.push(r);
                continue;
            }
            if r.start.as_u64() < first.as_u64() {
                // Keep the head that precedes the new range.
                out.push(MemoryRange::new(
                    r.start,
                    first.as_u64() - r.start.as_u64(),
                    r.ty,
                ));
            }
            if r.last().as_u64() > last.as_u64() {
                // Keep the tail that follows the new range.
                let tail_start = PhysicalAddress::new(last.as_u64() + 1);
                out.push(MemoryRange::new(
                    tail_start,
                    r.last().as_u64() - last.as_u64(),
                    r.ty,
                ));
            }
        }
        out.push(range);
        out.sort_unstable_by_key(|r| r.start);
        self.ranges = out;
        self.coalesce();
    }

    /// Merge adjacent ranges of equal type. Requires sorted, disjoint input.
    fn coalesce(&mut self) {
        let mut merged: Vec<MemoryRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            if let Some(prev) = merged.last_mut() {
                let contiguous = prev
                    .start
                    .checked_add(prev.size)
                    .is_some_and(|end| end == r.start);
                if prev.ty == r.ty && contiguous {
                    prev.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.ranges = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn collect(ledger: &Ledger) -> Vec<(u64, u64, RangeType)> {
        ledger
            .ranges()
            .map(|r| (r.start.as_u64(), r.size, r.ty))
            .collect()
    }

    #[test]
    fn ranges_stay_sorted_and_disjoint() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x8000), 0x1000, RangeType::Free);
        ledger.add_range(pa(0x1000), 0x1000, RangeType::Free);
        ledger.add_range(pa(0x4000), 0x2000, RangeType::Reclaimable);

        let ranges: Vec<_> = ledger.ranges().copied().collect();
        for pair in ranges.windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!(pair[0].last().as_u64() < pair[1].start.as_u64());
        }
    }

    #[test]
    fn adjacent_same_type_ranges_merge() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x1000, RangeType::Free);
        ledger.add_range(pa(0x2000), 0x3000, RangeType::Free);
        assert_eq!(collect(&ledger), [(0x1000, 0x4000, RangeType::Free)]);
    }

    #[test]
    fn adjacent_different_type_ranges_do_not_merge() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x1000, RangeType::Free);
        ledger.add_range(pa(0x2000), 0x1000, RangeType::Reclaimable);
        assert_eq!(ledger.ranges().count(), 2);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn overlapping_different_types_is_fatal() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x2000, RangeType::Free);
        ledger.add_range(pa(0x2000), 0x2000, RangeType::Reclaimable);
    }

    #[test]
    fn overlapping_same_type_unions() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x2000, RangeType::Free);
        ledger.add_range(pa(0x2000), 0x2000, RangeType::Free);
        assert_eq!(collect(&ledger), [(0x1000, 0x3000, RangeType::Free)]);
    }

    #[test]
    fn protect_splits_and_retags() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0xff000, RangeType::Free);
        ledger.protect_range(pa(0x1000), 0x2000).unwrap();

        assert_eq!(
            collect(&ledger),
            [
                (0x1000, 0x2000, RangeType::Internal),
                (0x3000, 0xfd000, RangeType::Free),
            ]
        );
    }

    #[test]
    fn protect_inside_a_range_splits_three_ways() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x0), 0x10000, RangeType::Free);
        ledger.protect_range(pa(0x4000), 0x1000).unwrap();

        assert_eq!(
            collect(&ledger),
            [
                (0x0, 0x4000, RangeType::Free),
                (0x4000, 0x1000, RangeType::Internal),
                (0x5000, 0xb000, RangeType::Free),
            ]
        );
    }

    #[test]
    fn protect_rejects_untracked_memory() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x1000, RangeType::Free);

        let before = collect(&ledger);
        let err = ledger.protect_range(pa(0x1000), 0x2000).unwrap_err();
        assert_eq!(err, ProtectError::Untracked(pa(0x2000)));
        assert_eq!(collect(&ledger), before);
    }

    #[test]
    fn protect_rejects_mixed_types() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x1000, RangeType::Free);
        ledger.add_range(pa(0x2000), 0x1000, RangeType::Modules);

        let before = collect(&ledger);
        let err = ledger.protect_range(pa(0x1000), 0x2000).unwrap_err();
        assert_eq!(err, ProtectError::NotFree(pa(0x2000)));
        assert_eq!(collect(&ledger), before);
    }

    #[test]
    fn finalize_reclaims_internal_memory() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x4000, RangeType::Free);
        ledger.protect_range(pa(0x2000), 0x1000).unwrap();
        assert_eq!(ledger.ranges().count(), 3);

        ledger.finalize();
        assert_eq!(collect(&ledger), [(0x1000, 0x4000, RangeType::Free)]);
    }

    #[test]
    fn total_free_counts_only_free_bytes() {
        let mut ledger = Ledger::new();
        ledger.add_range(pa(0x1000), 0x4000, RangeType::Free);
        ledger.add_range(pa(0x8000), 0x1000, RangeType::Modules);
        assert_eq!(ledger.total_free(), 0x4000);
    }
}
