//! # Physical and Virtual Address Types
//!
//! Zero-cost newtypes over `u64` that keep physical and virtual addresses
//! apart at compile time, plus the alignment helpers the memory-management
//! crates share.
//!
//! Nothing here knows about page tables or memory maps; those live in
//! `kernel-phys` and `kernel-vmem`. This crate only provides the vocabulary:
//!
//! - [`PhysicalAddress`] / [`VirtualAddress`] with hex formatting and
//!   checked arithmetic,
//! - [`PhysicalSize`] / [`VirtualSize`] aliases for byte counts,
//! - [`PAGE_SIZE`] and the [`align_up`] / [`align_down`] const helpers.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// Base hardware page granularity (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// A byte count in physical memory.
pub type PhysicalSize = u64;

/// A byte count in a virtual address space.
pub type VirtualSize = u64;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; the bit trick is meaningless
/// otherwise.
///
/// ```rust
/// # use kernel_addr::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two. `x + (a - 1)` must not overflow;
/// callers align sizes and addresses well below `u64::MAX`.
///
/// ```rust
/// # use kernel_addr::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// A **physical** memory address (machine bus address).
///
/// Carries no alignment guarantee by itself; code that needs page-aligned
/// values checks with [`is_aligned_to`](Self::is_aligned_to).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address (loader or kernel address space).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

macro_rules! address_impl {
    ($name:ident) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Whether the address is a multiple of `a` (`a` a power of two).
            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, a: u64) -> bool {
                debug_assert!(a.is_power_of_two());
                self.0 & (a - 1) == 0
            }

            /// Round down to the nearest multiple of `a`.
            #[inline]
            #[must_use]
            pub const fn align_down(self, a: u64) -> Self {
                Self(align_down(self.0, a))
            }

            /// Round up to the nearest multiple of `a`.
            #[inline]
            #[must_use]
            pub const fn align_up(self, a: u64) -> Self {
                Self(align_up(self.0, a))
            }

            /// Offset by `bytes`, or `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, bytes: u64) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#018x})"), self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(addr: $name) -> Self {
                addr.as_u64()
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0.checked_add(rhs).expect("address overflow"))
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                *self = *self + rhs;
            }
        }
    };
}

address_impl!(PhysicalAddress);
address_impl!(VirtualAddress);
