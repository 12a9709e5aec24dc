//! MMU context creation and mapping.

use kernel_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualSize};
use kernel_phys::{AllocRequest, Ledger, RangeType};

use crate::entry::{EntryBits, LegacyEntryBits};
use crate::invalidate::InvalidationQueue;
use crate::table::{LegacyTable, PageTable};
use crate::{LARGE_PAGE_SIZE_32, LARGE_PAGE_SIZE_64, PhysMapper};

#[cfg(target_arch = "x86_64")]
use crate::invalidate::FlushScope;

/// Addressing mode the context translates for.
///
/// The mode is fixed at creation and selects the table format: four levels
/// of 64-bit entries for [`Bits64`](Self::Bits64), two levels of 32-bit
/// entries (non-PAE) for [`Bits32`](Self::Bits32).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetMode {
    /// Legacy 32-bit paging, two levels, 4 MiB large pages.
    Bits32,
    /// Long-mode 64-bit paging, four levels, 2 MiB large pages.
    Bits64,
}

/// Why a mapping request was rejected.
///
/// These are caller logic errors; the span is at most partially mapped when
/// one is returned (tiling stops at the offending page).
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    /// Virtual address, physical address, and size must all be multiples of
    /// the page size.
    #[error("mapping {virt} -> {phys} (+{size:#x}) is not page-aligned")]
    InvalidAlignment {
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: VirtualSize,
    },
    /// The page is already mapped to a different physical address. Remapping
    /// requires tearing the old translation down first; it never happens
    /// implicitly.
    #[error("{virt} is already mapped to a different physical address")]
    AlreadyMapped { virt: VirtualAddress },
    /// The span does not fit the addressable range of the context's mode.
    #[error("mapping {virt} -> {phys} (+{size:#x}) exceeds the addressable range")]
    OutOfRange {
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: VirtualSize,
    },
}

/// One address space under construction: the physical root of its page-table
/// tree, the addressing mode, the ledger tag for table frames, and the
/// pending TLB invalidation set.
pub struct MmuContext {
    root: PhysicalAddress,
    mode: TargetMode,
    table_type: RangeType,
    invalidations: InvalidationQueue,
}

impl MmuContext {
    /// Create a context with a freshly allocated, zeroed root table.
    ///
    /// Table frames (the root and every intermediate level allocated later)
    /// come from `ledger`, tagged `table_type`. Running out of physical
    /// memory for page tables is a fatal boot error.
    pub fn create<M: PhysMapper>(
        ledger: &mut Ledger,
        mapper: &M,
        mode: TargetMode,
        table_type: RangeType,
    ) -> Self {
        let root = allocate_table(ledger, mapper, table_type);
        log::debug!("mmu: created {mode:?} context with root {root}");
        Self {
            root,
            mode,
            table_type,
            invalidations: InvalidationQueue::new(),
        }
    }

    /// Physical address of the root table (the future CR3 value).
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn mode(&self) -> TargetMode {
        self.mode
    }

    /// The pending TLB invalidation set.
    ///
    /// Consumers that flush on another CPU, or defer flushing to context
    /// activation, read the scope here and then call
    /// [`clear_invalidations`](Self::clear_invalidations).
    #[must_use]
    pub const fn invalidations(&self) -> &InvalidationQueue {
        &self.invalidations
    }

    /// Forget the pending invalidation set after it has been applied.
    pub const fn clear_invalidations(&mut self) {
        self.invalidations.clear();
    }

    /// Map `[virt, virt + size)` linearly onto `[phys, phys + size)`.
    ///
    /// Missing intermediate tables are allocated from `ledger` on demand.
    /// The span is tiled with large pages where virtual and physical
    /// addresses share large-page alignment, small pages elsewhere.
    /// Mappings are supervisor read/write.
    ///
    /// Re-mapping a page to the physical address it already translates to is
    /// a no-op; to a different address it is an error, and the walk stops at
    /// the offending page.
    ///
    /// Every leaf written is queued for TLB invalidation; callers mutating
    /// the active address space follow up with [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// See [`MapError`].
    pub fn map<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: VirtualSize,
    ) -> Result<(), MapError> {
        if !virt.is_aligned_to(PAGE_SIZE) || !phys.is_aligned_to(PAGE_SIZE) || size % PAGE_SIZE != 0
        {
            return Err(MapError::InvalidAlignment { virt, phys, size });
        }
        if size == 0 {
            return Ok(());
        }

        let limit = match self.mode {
            TargetMode::Bits32 => 1 << 32,
            TargetMode::Bits64 => u64::MAX,
        };
        let in_range = |addr: u64| {
            addr < limit && addr.checked_add(size).is_some_and(|end| end <= limit)
        };
        if !in_range(virt.as_u64()) || !in_range(phys.as_u64()) {
            return Err(MapError::OutOfRange { virt, phys, size });
        }

        match self.mode {
            TargetMode::Bits64 => self.map64(ledger, mapper, virt.as_u64(), phys.as_u64(), size),
            TargetMode::Bits32 => self.map32(ledger, mapper, virt.as_u64(), phys.as_u64(), size),
        }
    }

    /// Translate `virt` through the context's tables, if mapped.
    ///
    /// Handles large-page leaves by folding the in-page offset back in.
    #[must_use]
    pub fn translate<M: PhysMapper>(
        &self,
        mapper: &M,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let va = virt.as_u64();
        match self.mode {
            TargetMode::Bits64 => {
                let l4 = table_mut(mapper, self.root);
                let e4 = l4.get(l4_index(va));
                if !e4.present() {
                    return None;
                }
                let l3 = table_mut(mapper, e4.address());
                let e3 = l3.get(l3_index(va));
                if !e3.present() {
                    return None;
                }
                if e3.large_page() {
                    return Some(PhysicalAddress::new(
                        e3.address().as_u64() + (va & (0x4000_0000 - 1)),
                    ));
                }
                let l2 = table_mut(mapper, e3.address());
                let e2 = l2.get(l2_index(va));
                if !e2.present() {
                    return None;
                }
                if e2.large_page() {
                    return Some(PhysicalAddress::new(
                        e2.address().as_u64() + (va % LARGE_PAGE_SIZE_64),
                    ));
                }
                let l1 = table_mut(mapper, e2.address());
                let e1 = l1.get(l1_index(va));
                if !e1.present() {
                    return None;
                }
                Some(PhysicalAddress::new(
                    e1.address().as_u64() + (va % PAGE_SIZE),
                ))
            }
            TargetMode::Bits32 => {
                if va >= 1 << 32 {
                    return None;
                }
                let dir = legacy_mut(mapper, self.root);
                let de = dir.get(legacy_dir_index(va));
                if !de.present() {
                    return None;
                }
                if de.large_page() {
                    return Some(PhysicalAddress::new(
                        de.address().as_u64() + (va % LARGE_PAGE_SIZE_32),
                    ));
                }
                let pt = legacy_mut(mapper, de.address());
                let pe = pt.get(legacy_table_index(va));
                if !pe.present() {
                    return None;
                }
                Some(PhysicalAddress::new(
                    pe.address().as_u64() + (va % PAGE_SIZE),
                ))
            }
        }
    }

    /// Apply the pending invalidation set to this CPU's TLB.
    ///
    /// Either invalidates the recorded pages individually or, past the queue
    /// bound, reloads CR3 for a full flush.
    ///
    /// # Safety
    ///
    /// Must run at CPL0 with this context active; reloading CR3 with a
    /// foreign root would switch address spaces mid-function.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn flush(&mut self) {
        match self.invalidations.scope() {
            FlushScope::None => {}
            FlushScope::Pages(pages) => {
                for page in pages {
                    // SAFETY: `invlpg` only drops a TLB entry; the caller
                    // guarantees CPL0.
                    unsafe {
                        core::arch::asm!(
                            "invlpg [{}]",
                            in(reg) page.as_u64(),
                            options(nostack, preserves_flags),
                        );
                    }
                }
            }
            FlushScope::All => {
                // SAFETY: re-writing the current CR3 flushes all non-global
                // entries without changing the address space.
                unsafe {
                    let cr3: u64;
                    core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
                    core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
                }
            }
        }
        self.invalidations.clear();
    }

    /// Load CR3 with this context's root, making it the active address
    /// space. The reload discards non-global TLB entries, so the pending
    /// invalidation set is satisfied as a side effect.
    ///
    /// # Safety
    ///
    /// Must run at CPL0. The tables must map the currently executing code
    /// and stack, and the CPU paging mode (CR0/CR4/EFER) must match the
    /// context's [`TargetMode`].
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&mut self) {
        // SAFETY: deferred to the caller per the function contract.
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root.as_u64(),
                options(nostack, preserves_flags),
            );
        }
        self.invalidations.clear();
    }

    fn map64<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: u64,
        phys: u64,
        size: u64,
    ) -> Result<(), MapError> {
        let mut offset = 0;

        // Large pages only work when both addresses sit at the same offset
        // from a large-page boundary.
        if virt % LARGE_PAGE_SIZE_64 == phys % LARGE_PAGE_SIZE_64 {
            while offset < size && (virt + offset) % LARGE_PAGE_SIZE_64 != 0 {
                self.map_small64(ledger, mapper, virt + offset, phys + offset)?;
                offset += PAGE_SIZE;
            }
            while size - offset >= LARGE_PAGE_SIZE_64 {
                self.map_large64(ledger, mapper, virt + offset, phys + offset)?;
                offset += LARGE_PAGE_SIZE_64;
            }
        }

        while offset < size {
            self.map_small64(ledger, mapper, virt + offset, phys + offset)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn map_small64<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: u64,
        phys: u64,
    ) -> Result<(), MapError> {
        let l4 = table_mut(mapper, self.root);
        let l3_pa = descend(ledger, mapper, self.table_type, l4, l4_index(virt));
        let l3 = table_mut(mapper, l3_pa);
        let l2_pa = descend(ledger, mapper, self.table_type, l3, l3_index(virt));
        let l2 = table_mut(mapper, l2_pa);

        let e2 = l2.get(l2_index(virt));
        let l1_pa = if e2.present() {
            if e2.large_page() {
                // A 2 MiB leaf already covers this page.
                let covered = e2.address().as_u64() + (virt % LARGE_PAGE_SIZE_64);
                if covered == phys {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped {
                    virt: VirtualAddress::new(virt),
                });
            }
            e2.address()
        } else {
            let pa = allocate_table(ledger, mapper, self.table_type);
            l2.set(l2_index(virt), EntryBits::table_link(pa));
            pa
        };

        let l1 = table_mut(mapper, l1_pa);
        let index = l1_index(virt);
        let e1 = l1.get(index);
        if e1.present() {
            if e1.address().as_u64() == phys {
                return Ok(());
            }
            return Err(MapError::AlreadyMapped {
                virt: VirtualAddress::new(virt),
            });
        }
        l1.set(index, EntryBits::leaf(PhysicalAddress::new(phys), false));
        self.invalidations.push(VirtualAddress::new(virt));
        Ok(())
    }

    fn map_large64<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: u64,
        phys: u64,
    ) -> Result<(), MapError> {
        let l4 = table_mut(mapper, self.root);
        let l3_pa = descend(ledger, mapper, self.table_type, l4, l4_index(virt));
        let l3 = table_mut(mapper, l3_pa);
        let l2_pa = descend(ledger, mapper, self.table_type, l3, l3_index(virt));
        let l2 = table_mut(mapper, l2_pa);

        let index = l2_index(virt);
        let e2 = l2.get(index);
        if e2.present() {
            if e2.large_page() {
                if e2.address().as_u64() == phys {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped {
                    virt: VirtualAddress::new(virt),
                });
            }
            // A small-page table already covers this window; respect its
            // entries and fill the span page by page instead.
            for i in 0..(LARGE_PAGE_SIZE_64 / PAGE_SIZE) {
                self.map_small64(ledger, mapper, virt + i * PAGE_SIZE, phys + i * PAGE_SIZE)?;
            }
            return Ok(());
        }

        l2.set(index, EntryBits::leaf(PhysicalAddress::new(phys), true));
        self.invalidations.push(VirtualAddress::new(virt));
        Ok(())
    }

    fn map32<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: u64,
        phys: u64,
        size: u64,
    ) -> Result<(), MapError> {
        let mut offset = 0;

        if virt % LARGE_PAGE_SIZE_32 == phys % LARGE_PAGE_SIZE_32 {
            while offset < size && (virt + offset) % LARGE_PAGE_SIZE_32 != 0 {
                self.map_small32(ledger, mapper, virt + offset, phys + offset)?;
                offset += PAGE_SIZE;
            }
            while size - offset >= LARGE_PAGE_SIZE_32 {
                self.map_large32(mapper, virt + offset, phys + offset)?;
                offset += LARGE_PAGE_SIZE_32;
            }
        }

        while offset < size {
            self.map_small32(ledger, mapper, virt + offset, phys + offset)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn map_small32<M: PhysMapper>(
        &mut self,
        ledger: &mut Ledger,
        mapper: &M,
        virt: u64,
        phys: u64,
    ) -> Result<(), MapError> {
        let dir = legacy_mut(mapper, self.root);
        let de = dir.get(legacy_dir_index(virt));
        let pt_pa = if de.present() {
            if de.large_page() {
                let covered = de.address().as_u64() + (virt % LARGE_PAGE_SIZE_32);
                if covered == phys {
                    return Ok(());
                }
                return Err(MapError::AlreadyMapped {
                    virt: VirtualAddress::new(virt),
                });
            }
            de.address()
        } else {
            let pa = allocate_table(ledger, mapper, self.table_type);
            dir.set(legacy_dir_index(virt), LegacyEntryBits::table_link(pa));
            pa
        };

        let pt = legacy_mut(mapper, pt_pa);
        let index = legacy_table_index(virt);
        let pe = pt.get(index);
        if pe.present() {
            if pe.address().as_u64() == phys {
                return Ok(());
            }
            return Err(MapError::AlreadyMapped {
                virt: VirtualAddress::new(virt),
            });
        }
        pt.set(index, LegacyEntryBits::leaf(PhysicalAddress::new(phys), false));
        self.invalidations.push(VirtualAddress::new(virt));
        Ok(())
    }

    fn map_large32<M: PhysMapper>(
        &mut self,
        mapper: &M,
        virt: u64,
        phys: u64,
    ) -> Result<(), MapError> {
        let dir = legacy_mut(mapper, self.root);
        let index = legacy_dir_index(virt);
        let de = dir.get(index);
        if de.present() {
            if de.large_page() && de.address().as_u64() == phys {
                return Ok(());
            }
            if de.large_page() {
                return Err(MapError::AlreadyMapped {
                    virt: VirtualAddress::new(virt),
                });
            }
            // An existing page table covers this window; the caller's span
            // is filled through it instead.
            return self.fill_large32_small(mapper, de.address(), virt, phys);
        }

        dir.set(index, LegacyEntryBits::leaf(PhysicalAddress::new(phys), true));
        self.invalidations.push(VirtualAddress::new(virt));
        Ok(())
    }

    /// Map a 4 MiB window through an existing legacy page table, honouring
    /// whatever entries are already there.
    fn fill_large32_small<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pt_pa: PhysicalAddress,
        virt: u64,
        phys: u64,
    ) -> Result<(), MapError> {
        let pt = legacy_mut(mapper, pt_pa);
        for i in 0..(LARGE_PAGE_SIZE_32 / PAGE_SIZE) {
            let va = virt + i * PAGE_SIZE;
            let pa = phys + i * PAGE_SIZE;
            let index = legacy_table_index(va);
            let pe = pt.get(index);
            if pe.present() {
                if pe.address().as_u64() == pa {
                    continue;
                }
                return Err(MapError::AlreadyMapped {
                    virt: VirtualAddress::new(va),
                });
            }
            pt.set(index, LegacyEntryBits::leaf(PhysicalAddress::new(pa), false));
            self.invalidations.push(VirtualAddress::new(va));
        }
        Ok(())
    }
}

#[inline]
const fn l4_index(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}

#[inline]
const fn l3_index(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}

#[inline]
const fn l2_index(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}

#[inline]
const fn l1_index(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

#[inline]
const fn legacy_dir_index(va: u64) -> usize {
    ((va >> 22) & 0x3ff) as usize
}

#[inline]
const fn legacy_table_index(va: u64) -> usize {
    ((va >> 12) & 0x3ff) as usize
}

/// Read the entry at `index`, allocating and linking the next level if it is
/// missing. Returns the child table's physical address.
fn descend<M: PhysMapper>(
    ledger: &mut Ledger,
    mapper: &M,
    table_type: RangeType,
    table: &mut PageTable,
    index: usize,
) -> PhysicalAddress {
    let entry = table.get(index);
    if entry.present() {
        debug_assert!(
            !entry.large_page(),
            "intermediate entry is a huge-page leaf"
        );
        return entry.address();
    }
    let pa = allocate_table(ledger, mapper, table_type);
    table.set(index, EntryBits::table_link(pa));
    pa
}

/// Allocate one zeroed 4 KiB table frame from the ledger.
///
/// Uses the must-succeed allocator path: a boot that cannot allocate page
/// tables cannot continue.
fn allocate_table<M: PhysMapper>(
    ledger: &mut Ledger,
    mapper: &M,
    table_type: RangeType,
) -> PhysicalAddress {
    let request = AllocRequest::new(PAGE_SIZE).align(PAGE_SIZE).tagged(table_type);
    let pa = match ledger.allocate(&request) {
        Ok(pa) => pa,
        Err(err) => kernel_fatal::fatal!("mmu: page-table allocation failed: {err}"),
    };

    let bytes: &mut u8 = {
        // SAFETY: the frame was just carved out of free memory and the
        // mapper contract makes it reachable and writable.
        unsafe { mapper.phys_to_mut::<u8>(pa) }
    };
    // SAFETY: `bytes` points at the start of a whole, exclusively owned
    // 4 KiB frame.
    unsafe { core::ptr::write_bytes(core::ptr::from_mut(bytes), 0, PAGE_SIZE as usize) };
    pa
}

/// Borrow a long-mode table living at `pa`.
fn table_mut<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: `pa` was produced by `allocate_table` (zeroed, 4 KiB aligned)
    // or read back from an entry this context wrote; both are valid tables.
    unsafe { mapper.phys_to_mut(pa) }
}

/// Borrow a legacy table living at `pa`.
fn legacy_mut<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut LegacyTable {
    // SAFETY: as for `table_mut`; legacy tables share the frame layout.
    unsafe { mapper.phys_to_mut(pa) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlushScope;

    /// Simulated physical memory: contiguous 4 KiB frames starting at
    /// physical address zero, so a physical address is an offset into the
    /// buffer.
    struct TestRam {
        frames: Vec<Frame4K>,
    }

    #[repr(align(4096))]
    struct Frame4K([u8; 4096]);

    impl TestRam {
        fn new(frame_count: usize) -> Self {
            let mut frames = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                frames.push(Frame4K([0; 4096]));
            }
            Self { frames }
        }

        /// A ledger covering exactly this RAM, all free.
        fn ledger(&self) -> Ledger {
            let mut ledger = Ledger::new();
            ledger.add_range(
                PhysicalAddress::zero(),
                self.frames.len() as u64 * PAGE_SIZE,
                RangeType::Free,
            );
            ledger
        }
    }

    impl PhysMapper for TestRam {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let index = (pa.as_u64() >> 12) as usize;
            let offset = (pa.as_u64() & 0xfff) as usize;
            let base = core::ptr::from_ref(&self.frames[index]).cast_mut().cast::<u8>();
            // SAFETY: frames are 4 KiB aligned and owned by the test; the
            // caller promises `T` matches the bytes.
            unsafe { &mut *base.add(offset).cast::<T>() }
        }
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn table_bytes(ledger: &Ledger) -> u64 {
        ledger
            .ranges_of(RangeType::PageTables)
            .map(|r| r.size)
            .sum()
    }

    #[test]
    fn map_one_small_page_builds_the_chain() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        let virt = va(0xffff_8000_0000_0000);
        let phys = pa(0x0030_0000);
        ctx.map(&mut ledger, &ram, virt, phys, PAGE_SIZE).unwrap();

        // Root plus three intermediate levels.
        assert_eq!(table_bytes(&ledger), 4 * PAGE_SIZE);

        // Walk the tables by hand and check the leaf.
        let l4 = table_mut(&ram, ctx.root());
        let e4 = l4.get(l4_index(virt.as_u64()));
        assert!(e4.present() && e4.writable());
        let l3 = table_mut(&ram, e4.address());
        let e3 = l3.get(l3_index(virt.as_u64()));
        assert!(e3.present() && !e3.large_page());
        let l2 = table_mut(&ram, e3.address());
        let e2 = l2.get(l2_index(virt.as_u64()));
        assert!(e2.present() && !e2.large_page());
        let l1 = table_mut(&ram, e2.address());
        let e1 = l1.get(l1_index(virt.as_u64()));
        assert!(e1.present() && e1.writable() && !e1.large_page());
        assert_eq!(e1.address(), phys);

        assert_eq!(ctx.translate(&ram, virt), Some(phys));
        assert_eq!(ctx.translate(&ram, virt + 0x123), Some(phys + 0x123));
        assert_eq!(ctx.translate(&ram, va(0xffff_8000_0000_1000)), None);
    }

    #[test]
    fn remapping_the_same_page_is_idempotent() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        let virt = va(0x0000_7fff_f000_0000);
        ctx.map(&mut ledger, &ram, virt, pa(0x0040_0000), PAGE_SIZE).unwrap();
        let tables_before = table_bytes(&ledger);
        ctx.clear_invalidations();

        ctx.map(&mut ledger, &ram, virt, pa(0x0040_0000), PAGE_SIZE).unwrap();
        assert_eq!(table_bytes(&ledger), tables_before, "no duplicate tables");
        assert!(
            ctx.invalidations().is_empty(),
            "an untouched translation queues no invalidation"
        );
    }

    #[test]
    fn remapping_to_a_different_address_is_rejected() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        let virt = va(0x0000_7fff_f000_0000);
        ctx.map(&mut ledger, &ram, virt, pa(0x0040_0000), PAGE_SIZE).unwrap();
        assert_eq!(
            ctx.map(&mut ledger, &ram, virt, pa(0x0050_0000), PAGE_SIZE),
            Err(MapError::AlreadyMapped { virt })
        );
    }

    #[test]
    fn misaligned_arguments_are_rejected() {
        let ram = TestRam::new(16);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        for (v, p, s) in [
            (0x123, 0x1000, PAGE_SIZE),
            (0x1000, 0x123, PAGE_SIZE),
            (0x1000, 0x1000, 0x42),
        ] {
            assert!(matches!(
                ctx.map(&mut ledger, &ram, va(v), pa(p), s),
                Err(MapError::InvalidAlignment { .. })
            ));
        }
    }

    #[test]
    fn aligned_spans_use_large_pages() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        let virt = va(0x0000_0000_4000_0000);
        let phys = pa(0x0000_0000_0800_0000);
        ctx.map(&mut ledger, &ram, virt, phys, LARGE_PAGE_SIZE_64).unwrap();

        // Root, L3, L2; no L1 for a large leaf.
        assert_eq!(table_bytes(&ledger), 3 * PAGE_SIZE);

        let l4 = table_mut(&ram, ctx.root());
        let l3 = table_mut(&ram, l4.get(l4_index(virt.as_u64())).address());
        let e2 = table_mut(&ram, l3.get(l3_index(virt.as_u64())).address())
            .get(l2_index(virt.as_u64()));
        assert!(e2.present() && e2.large_page());
        assert_eq!(e2.address(), phys);

        assert_eq!(
            ctx.translate(&ram, virt + 0x12345),
            Some(phys + 0x12345)
        );
    }

    #[test]
    fn mismatched_large_offsets_fall_back_to_small_pages() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        // Virtual is 2 MiB aligned, physical is off by one page.
        let virt = va(0x0000_0000_4000_0000);
        let phys = pa(0x0000_0000_0800_1000);
        ctx.map(&mut ledger, &ram, virt, phys, LARGE_PAGE_SIZE_64).unwrap();

        // Small pages force a full chain down to L1.
        assert_eq!(table_bytes(&ledger), 4 * PAGE_SIZE);
        assert_eq!(ctx.translate(&ram, virt + 0x5000), Some(phys + 0x5000));
    }

    #[test]
    fn large_map_over_existing_small_table_respects_entries() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        let base = va(0x0000_0000_4000_0000);
        let phys = pa(0x0000_0000_0800_0000);

        // One small page first, consistent with the later large span.
        ctx.map(&mut ledger, &ram, base, phys, PAGE_SIZE).unwrap();
        let tables_before = table_bytes(&ledger);

        // The large span keeps the existing page table and fills it.
        ctx.map(&mut ledger, &ram, base, phys, LARGE_PAGE_SIZE_64).unwrap();
        assert_eq!(table_bytes(&ledger), tables_before);
        assert_eq!(
            ctx.translate(&ram, base + (LARGE_PAGE_SIZE_64 - PAGE_SIZE)),
            Some(phys + (LARGE_PAGE_SIZE_64 - PAGE_SIZE))
        );

        // An inconsistent large span over the same window is rejected.
        assert!(matches!(
            ctx.map(&mut ledger, &ram, base, pa(0x0100_0000), LARGE_PAGE_SIZE_64),
            Err(MapError::AlreadyMapped { .. })
        ));
    }

    #[test]
    fn legacy_mode_maps_and_translates() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits32, RangeType::PageTables);

        let virt = va(0x00c0_0000);
        let phys = pa(0x0080_0000);
        ctx.map(&mut ledger, &ram, virt, phys, 2 * PAGE_SIZE).unwrap();

        // Directory plus one page table.
        assert_eq!(table_bytes(&ledger), 2 * PAGE_SIZE);
        assert_eq!(ctx.translate(&ram, virt + PAGE_SIZE), Some(phys + PAGE_SIZE));
        assert_eq!(ctx.translate(&ram, virt + 2 * PAGE_SIZE), None);
    }

    #[test]
    fn legacy_mode_uses_4m_large_pages() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits32, RangeType::PageTables);

        let virt = va(0x0040_0000);
        let phys = pa(0x0080_0000);
        ctx.map(&mut ledger, &ram, virt, phys, LARGE_PAGE_SIZE_32).unwrap();

        // Just the directory; the 4 MiB leaf lives in it directly.
        assert_eq!(table_bytes(&ledger), PAGE_SIZE);
        assert_eq!(ctx.translate(&ram, virt + 0x1234), Some(phys + 0x1234));
    }

    #[test]
    fn legacy_mode_rejects_spans_beyond_4g() {
        let ram = TestRam::new(16);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits32, RangeType::PageTables);

        assert!(matches!(
            ctx.map(&mut ledger, &ram, va(0xffff_f000), pa(0x1000), 2 * PAGE_SIZE),
            Err(MapError::OutOfRange { .. })
        ));
        assert!(matches!(
            ctx.map(&mut ledger, &ram, va(0x1000), pa(0x1_0000_0000), PAGE_SIZE),
            Err(MapError::OutOfRange { .. })
        ));
    }

    #[test]
    fn mapping_queues_invalidations_until_overflow() {
        let ram = TestRam::new(64);
        let mut ledger = ram.ledger();
        let mut ctx = MmuContext::create(&mut ledger, &ram, TargetMode::Bits64, RangeType::PageTables);

        // 64 pages: individually recorded.
        ctx.map(&mut ledger, &ram, va(0x40_0000), pa(0x80_0000), 64 * PAGE_SIZE)
            .unwrap();
        match ctx.invalidations().scope() {
            FlushScope::Pages(pages) => assert_eq!(pages.len(), 64),
            other => panic!("expected recorded pages, got {other:?}"),
        }

        // Another 128 pages blow the bound: whole-TLB flush.
        ctx.map(
            &mut ledger,
            &ram,
            va(0x100_0000),
            pa(0x200_0000),
            128 * PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(ctx.invalidations().scope(), FlushScope::All);

        ctx.clear_invalidations();
        assert!(ctx.invalidations().is_empty());
    }
}
