//! Carving allocations out of the ledger's free ranges.

use kernel_addr::{PhysicalAddress, PhysicalSize, align_down};

use crate::ledger::Ledger;
use crate::range::{MemoryRange, RangeType};

bitflags::bitflags! {
    /// Behaviour flags for [`Ledger::allocate`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// The allocation may legitimately fail; the caller handles
        /// [`AllocError::OutOfMemory`]. Without this flag, exhaustion is a
        /// fatal boot error.
        const CAN_FAIL = 1 << 0;
        /// Pick the highest satisfying address instead of the lowest.
        const PREFER_HIGH = 1 << 1;
    }
}

/// A physical allocation request.
///
/// Built fluently and handed to [`Ledger::allocate`]:
///
/// ```rust
/// # use kernel_phys::{AllocRequest, RangeType};
/// let request = AllocRequest::new(0x4000)
///     .align(0x1000)
///     .below(0x1_0000_0000)
///     .tagged(RangeType::Stack)
///     .can_fail();
/// ```
#[derive(Copy, Clone, Debug)]
pub struct AllocRequest {
    size: PhysicalSize,
    align: u64,
    min_address: u64,
    max_address: u64,
    ty: RangeType,
    flags: AllocFlags,
}

impl AllocRequest {
    /// A request for `size` bytes, byte-aligned, anywhere in physical
    /// memory, tagged `Allocated`.
    #[must_use]
    pub const fn new(size: PhysicalSize) -> Self {
        Self {
            size,
            align: 1,
            min_address: 0,
            max_address: 0,
            ty: RangeType::Allocated,
            flags: AllocFlags::empty(),
        }
    }

    /// Require the start address to be a multiple of `align` (a power of
    /// two).
    #[must_use]
    pub const fn align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    /// Lowest acceptable start address.
    #[must_use]
    pub const fn at_or_above(mut self, min_address: u64) -> Self {
        self.min_address = min_address;
        self
    }

    /// Exclusive upper bound for the end of the allocation. Zero means no
    /// upper bound.
    #[must_use]
    pub const fn below(mut self, max_address: u64) -> Self {
        self.max_address = max_address;
        self
    }

    /// Tag the allocated range with `ty` in the ledger.
    #[must_use]
    pub const fn tagged(mut self, ty: RangeType) -> Self {
        self.ty = ty;
        self
    }

    /// Allow the allocation to fail instead of halting the system.
    #[must_use]
    pub const fn can_fail(mut self) -> Self {
        self.flags = self.flags.union(AllocFlags::CAN_FAIL);
        self
    }

    /// Prefer the highest satisfying address.
    #[must_use]
    pub const fn prefer_high(mut self) -> Self {
        self.flags = self.flags.union(AllocFlags::PREFER_HIGH);
        self
    }

    /// Last byte the allocation may occupy (inclusive).
    const fn last_allowed(&self) -> u64 {
        if self.max_address == 0 {
            u64::MAX
        } else {
            self.max_address - 1
        }
    }
}

/// Why an allocation was rejected.
///
/// `OutOfMemory` is only ever returned when the request carries
/// [`AllocFlags::CAN_FAIL`]; the other variants are caller logic errors and
/// are always returned.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    /// No free range satisfies the size/alignment/window constraints.
    #[error("no free range satisfies the request")]
    OutOfMemory,
    /// The request asked for zero bytes.
    #[error("zero-sized allocation")]
    InvalidSize,
    /// The requested alignment is not a power of two.
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
}

impl Ledger {
    /// Allocate a span of physical memory satisfying `request`.
    ///
    /// Free ranges are scanned in ascending address order (descending under
    /// [`AllocFlags::PREFER_HIGH`]); the first range that can hold `size`
    /// bytes at the requested alignment inside the address window wins. The
    /// chosen span is retagged with the request's type, splitting the free
    /// range around it, and its start address is returned.
    ///
    /// On failure the ledger is left unmodified.
    ///
    /// # Errors
    ///
    /// See [`AllocError`].
    ///
    /// # Panics
    ///
    /// Exhaustion without [`AllocFlags::CAN_FAIL`] is a fatal boot error:
    /// the system cannot continue with an unmet critical memory requirement.
    pub fn allocate(&mut self, request: &AllocRequest) -> Result<PhysicalAddress, AllocError> {
        if request.size == 0 {
            return Err(AllocError::InvalidSize);
        }
        if !request.align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(request.align));
        }
        debug_assert!(
            request.ty != RangeType::Free,
            "allocations must carry a non-free tag"
        );

        let found = if request.flags.contains(AllocFlags::PREFER_HIGH) {
            self.ranges()
                .rev()
                .find_map(|r| suitable_start(r, request))
        } else {
            self.ranges().find_map(|r| suitable_start(r, request))
        };

        let Some(start) = found else {
            if request.flags.contains(AllocFlags::CAN_FAIL) {
                return Err(AllocError::OutOfMemory);
            }
            kernel_fatal::fatal!(
                "memory: unable to allocate {:#x} bytes (align {:#x}, window {:#x}..{:#x}, type {})",
                request.size,
                request.align,
                request.min_address,
                request.last_allowed(),
                request.ty,
            );
        };

        let range = MemoryRange::new(start, request.size, request.ty);
        self.insert(range);
        log::debug!(
            "memory: allocated {range} (align {:#x}, flags {:#x})",
            request.align,
            request.flags.bits(),
        );
        Ok(start)
    }
}

/// The start address `request` would get from `range`, if any.
fn suitable_start(range: &MemoryRange, request: &AllocRequest) -> Option<PhysicalAddress> {
    if range.ty != RangeType::Free {
        return None;
    }

    // Clip the free range against the requested address window. Inclusive
    // bounds keep the arithmetic overflow-free up to the top of memory.
    let lo = range.start.as_u64().max(request.min_address);
    let hi = range.last().as_u64().min(request.last_allowed());
    if hi < lo || hi - lo < request.size - 1 {
        return None;
    }

    let start = if request.flags.contains(AllocFlags::PREFER_HIGH) {
        // Highest aligned start that still fits below `hi`.
        let start = align_down(hi - (request.size - 1), request.align);
        if start < lo {
            return None;
        }
        start
    } else {
        // Lowest aligned start inside the window; alignment may push the
        // allocation past what fits.
        let start = lo.checked_add(request.align - 1)? & !(request.align - 1);
        if start > hi || hi - start < request.size - 1 {
            return None;
        }
        start
    };
    Some(PhysicalAddress::new(start))
}
