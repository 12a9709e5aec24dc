//! # Trap Frames and Exception Dispatch
//!
//! The lowest-level contract between the CPU and the kernel: how register
//! state is captured at a trap, how the trap reaches a handler, and what the
//! handler may do with the captured state.
//!
//! ## Life of a trap
//!
//! ```text
//! normal execution
//!   -> trap entry stub captures an InterruptFrame (assembly, fixed ABI)
//!   -> DispatchTable::dispatch finds the registered handler
//!   -> handler inspects, and may mutate, the frame
//!   -> Disposition::Resume: the stub restores the frame verbatim
//!      Disposition::Fatal:  the frame is dumped and the system halts
//! ```
//!
//! A handler that wants to retry a faulting instruction simply leaves the
//! saved program counter alone; one that wants to skip or redirect rewrites
//! it before resuming. The dispatcher itself never touches the frame, so a
//! handler that does not modify it resumes execution exactly where it
//! stopped, every register intact.
//!
//! The entry and return stubs are architecture assembly and live outside
//! this crate; the frame layouts here are the ABI they are written against,
//! pinned down with compile-time layout assertions.
//!
//! ## Memory-access exceptions
//!
//! Page faults and aborts carry hardware-specific status words. Each
//! architecture module decodes them into a [`MemoryFault`]: what kind of
//! violation, what kind of access, at which address. The registered handler
//! receives the raw frame and performs the decode with the status the stub
//! captured, then decides between resuming (after fixing the cause, e.g. by
//! mapping the page) and escalating.
//!
//! ## Concurrency
//!
//! Dispatch runs on whichever CPU took the trap, with traps masked by the
//! gate configuration. Tables are built once during boot and registered
//! before traps are enabled; mutation afterwards requires external
//! serialization.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod amd64;
pub mod arm;

use core::fmt;

use kernel_addr::VirtualAddress;

/// What the trap-return path should do after a handler ran.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Restore the (possibly modified) frame and continue execution.
    Resume,
    /// The condition is unrecoverable; dump the frame and halt.
    Fatal,
}

/// The kind of access that caused a memory fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Decoded reason for a memory-access exception.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryFaultKind {
    /// No translation exists for the address.
    Unmapped,
    /// A translation exists but forbids the access.
    AccessViolation,
    /// The access was incorrectly aligned.
    Alignment,
}

/// A decoded memory-access exception, handed to fault handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryFault {
    pub kind: MemoryFaultKind,
    pub access: AccessKind,
    /// The faulting (virtual) address.
    pub address: VirtualAddress,
}

impl fmt::Display for MemoryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MemoryFaultKind::Unmapped => "unmapped",
            MemoryFaultKind::AccessViolation => "access violation",
            MemoryFaultKind::Alignment => "misaligned",
        };
        let access = match self.access {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Execute => "execute",
        };
        write!(f, "{kind} on {access} at {}", self.address)
    }
}
