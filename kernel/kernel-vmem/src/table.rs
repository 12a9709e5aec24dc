//! Page-table frame wrappers.

use crate::entry::{EntryBits, LegacyEntryBits};

/// Entries per long-mode table level.
pub const ENTRY_COUNT: usize = 512;

/// Entries per legacy (non-PAE) table level.
pub const LEGACY_ENTRY_COUNT: usize = 1024;

// Every table level occupies exactly one 4 KiB frame.
const _: () = assert!(size_of::<PageTable>() == 4096);
const _: () = assert!(size_of::<LegacyTable>() == 4096);
const _: () = assert!(align_of::<PageTable>() == 4096);
const _: () = assert!(align_of::<LegacyTable>() == 4096);

/// A 4 KiB frame holding 512 long-mode entries (any of the four levels).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [EntryBits; ENTRY_COUNT],
}

impl PageTable {
    /// Clear every entry (all not-present).
    pub fn zero(&mut self) {
        self.entries = [EntryBits::new(); ENTRY_COUNT];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> EntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: EntryBits) {
        self.entries[index] = entry;
    }
}

/// A 4 KiB frame holding 1024 legacy 32-bit entries (directory or table).
#[repr(C, align(4096))]
pub struct LegacyTable {
    entries: [LegacyEntryBits; LEGACY_ENTRY_COUNT],
}

impl LegacyTable {
    /// Clear every entry (all not-present).
    pub fn zero(&mut self) {
        self.entries = [LegacyEntryBits::new(); LEGACY_ENTRY_COUNT];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> LegacyEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: LegacyEntryBits) {
        self.entries[index] = entry;
    }
}
