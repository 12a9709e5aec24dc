//! Page-table entry layouts.
//!
//! Entries are plain fixed-width integers with generated accessor methods;
//! no `#[repr(C)]` bit-fields, whose layout the compiler does not guarantee.

use bitfield_struct::bitfield;
use kernel_addr::PhysicalAddress;

/// One 64-bit page-table entry, the common superset of all four long-mode
/// levels.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | P    | entry is valid |
/// | 1     | RW   | writable |
/// | 2     | US   | user-mode accessible |
/// | 3     | PWT  | write-through caching |
/// | 4     | PCD  | caching disabled |
/// | 5     | A    | accessed (set by hardware) |
/// | 6     | D    | dirty (leaf only, set by hardware) |
/// | 7     | PS   | large-page leaf (L3/L2 only) |
/// | 8     | G    | global translation (leaf only) |
/// | 9-11  |      | available to the OS |
/// | 12-51 | addr | physical frame bits 51:12 |
/// | 52-62 |      | available to the OS |
/// | 63    | NX   | no-execute |
#[bitfield(u64)]
pub struct EntryBits {
    /// Present (P). Clear means a walk through this entry faults.
    pub present: bool,
    /// Writable (RW).
    pub writable: bool,
    /// User/supervisor (US); clear restricts to supervisor.
    pub user_access: bool,
    /// Page write-through (PWT).
    pub write_through: bool,
    /// Page cache disable (PCD).
    pub cache_disabled: bool,
    /// Accessed (A); hardware-set on first use.
    pub accessed: bool,
    /// Dirty (D); hardware-set on first write, leaf entries only.
    pub dirty: bool,
    /// Page size (PS); marks an L3/L2 entry as a large-page leaf.
    pub large_page: bool,
    /// Global (G); leaf survives CR3 reloads when CR4.PGE is set.
    pub global_translation: bool,
    /// OS-available low bits.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame number (address bits 51:12).
    #[bits(40)]
    frame: u64,
    /// OS-available high bits.
    #[bits(11)]
    pub os_available_high: u16,
    /// No-execute (NX); requires EFER.NXE.
    pub no_execute: bool,
}

impl EntryBits {
    /// The physical address this entry points at (table or leaf base).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Store a 4 KiB-aligned physical address.
    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    /// A present, writable, supervisor-only link to the next table level.
    #[inline]
    #[must_use]
    pub const fn table_link(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_address(pa)
    }

    /// A present, writable, supervisor-only leaf mapping.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large_page(large)
            .with_address(pa)
    }
}

/// One 32-bit legacy (non-PAE) entry, shared by the page directory and page
/// tables. A directory entry with `large_page` set maps a 4 MiB page.
#[bitfield(u32)]
pub struct LegacyEntryBits {
    /// Present (P).
    pub present: bool,
    /// Writable (RW).
    pub writable: bool,
    /// User/supervisor (US).
    pub user_access: bool,
    /// Page write-through (PWT).
    pub write_through: bool,
    /// Page cache disable (PCD).
    pub cache_disabled: bool,
    /// Accessed (A).
    pub accessed: bool,
    /// Dirty (D); leaf entries only.
    pub dirty: bool,
    /// Page size (PS); marks a directory entry as a 4 MiB leaf.
    pub large_page: bool,
    /// Global (G).
    pub global_translation: bool,
    /// OS-available bits.
    #[bits(3)]
    pub os_available: u8,
    /// Physical frame number (address bits 31:12).
    #[bits(20)]
    frame: u32,
}

impl LegacyEntryBits {
    /// The physical address this entry points at.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame() as u64) << 12)
    }

    /// Store a 4 KiB-aligned physical address below 4 GiB.
    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame((pa.as_u64() >> 12) as u32)
    }

    /// A present, writable, supervisor-only link to a page table.
    #[inline]
    #[must_use]
    pub const fn table_link(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_address(pa)
    }

    /// A present, writable, supervisor-only leaf mapping.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large_page(large)
            .with_address(pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_the_frame_field() {
        let pa = PhysicalAddress::new(0x0000_0012_3456_7000);
        let e = EntryBits::table_link(pa);
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.large_page());
        assert_eq!(e.address(), pa);
    }

    #[test]
    fn leaf_sets_the_page_size_bit() {
        let pa = PhysicalAddress::new(0x0020_0000);
        let e = EntryBits::leaf(pa, true);
        assert!(e.large_page());
        assert_eq!(e.address(), pa);
        assert!(!EntryBits::leaf(pa, false).large_page());
    }

    #[test]
    fn legacy_entry_keeps_low_32_bits() {
        let pa = PhysicalAddress::new(0xfff0_0000);
        let e = LegacyEntryBits::leaf(pa, false);
        assert!(e.present());
        assert_eq!(e.address(), pa);
    }
}
