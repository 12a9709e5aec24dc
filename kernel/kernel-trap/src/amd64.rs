//! AMD64 interrupt frames and dispatch.

use bitfield_struct::bitfield;
use kernel_addr::VirtualAddress;

use crate::{AccessKind, Disposition, MemoryFault, MemoryFaultKind};

/// Interrupt frame field offsets, shared with the assembly entry stubs.
pub mod offset {
    pub const R15: usize = 0x00;
    pub const R14: usize = 0x08;
    pub const R13: usize = 0x10;
    pub const R12: usize = 0x18;
    pub const R11: usize = 0x20;
    pub const R10: usize = 0x28;
    pub const R9: usize = 0x30;
    pub const R8: usize = 0x38;
    pub const BP: usize = 0x40;
    pub const SI: usize = 0x48;
    pub const DI: usize = 0x50;
    pub const DX: usize = 0x58;
    pub const CX: usize = 0x60;
    pub const BX: usize = 0x68;
    pub const AX: usize = 0x70;
    pub const NUM: usize = 0x78;
    pub const ERR_CODE: usize = 0x80;
    pub const IP: usize = 0x88;
    pub const CS: usize = 0x90;
    pub const FLAGS: usize = 0x98;
    pub const SP: usize = 0xa0;
    pub const SS: usize = 0xa8;
}

/// Register state captured by the trap entry stub.
///
/// The stub pushes the general-purpose registers on top of the vector
/// number, error code, and the hardware-pushed IRET block, then passes a
/// pointer to the result. Field order is therefore a fixed ABI; the layout
/// assertions below pin every offset.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub bp: u64,
    pub si: u64,
    pub di: u64,
    pub dx: u64,
    pub cx: u64,
    pub bx: u64,
    pub ax: u64,
    /// Interrupt vector number, pushed by the per-vector stub.
    pub num: u64,
    /// Error code, or zero for vectors without one.
    pub err_code: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<InterruptFrame>() == 0xb0);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, r15) == offset::R15);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, r8) == offset::R8);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, bp) == offset::BP);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, ax) == offset::AX);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, num) == offset::NUM);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, err_code) == offset::ERR_CODE);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, ip) == offset::IP);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, cs) == offset::CS);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, flags) == offset::FLAGS);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, sp) == offset::SP);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, ss) == offset::SS);

impl InterruptFrame {
    /// Whether the trap interrupted user-mode code (CS RPL != 0).
    #[must_use]
    pub const fn from_user_mode(&self) -> bool {
        self.cs & 3 != 0
    }

    /// Log every captured register at `error!`.
    pub fn dump(&self) {
        log::error!(
            "RAX: {:#018x}  RBX: {:#018x}  RCX: {:#018x}  RDX: {:#018x}",
            self.ax,
            self.bx,
            self.cx,
            self.dx
        );
        log::error!(
            "RSI: {:#018x}  RDI: {:#018x}  RBP: {:#018x}  RSP: {:#018x}",
            self.si,
            self.di,
            self.bp,
            self.sp
        );
        log::error!(
            "R8:  {:#018x}  R9:  {:#018x}  R10: {:#018x}  R11: {:#018x}",
            self.r8,
            self.r9,
            self.r10,
            self.r11
        );
        log::error!(
            "R12: {:#018x}  R13: {:#018x}  R14: {:#018x}  R15: {:#018x}",
            self.r12,
            self.r13,
            self.r14,
            self.r15
        );
        log::error!(
            "RIP: {:#018x}  CS:  {:#06x}  SS: {:#06x}  RFLAGS: {:#x}",
            self.ip,
            self.cs,
            self.ss,
            self.flags
        );
        log::error!("vector: {}  error code: {:#x}", self.num, self.err_code);
    }
}

/// Number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;

/// CPU exception vectors (0..32). 32..48 are remapped hardware IRQs.
pub mod vector {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const DEBUG: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BREAKPOINT: u8 = 3;
    pub const OVERFLOW: u8 = 4;
    pub const BOUND_RANGE: u8 = 5;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DEVICE_NOT_AVAILABLE: u8 = 7;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const INVALID_TSS: u8 = 10;
    pub const SEGMENT_NOT_PRESENT: u8 = 11;
    pub const STACK_FAULT: u8 = 12;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
    pub const FPU_ERROR: u8 = 16;
    pub const ALIGNMENT_CHECK: u8 = 17;
    pub const MACHINE_CHECK: u8 = 18;
    pub const SIMD_ERROR: u8 = 19;
    pub const IRQ_BASE: u8 = 32;
}

/// Human-readable names for the CPU exceptions.
static EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Error",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Name for a vector number, for diagnostics.
#[must_use]
pub fn vector_name(num: u64) -> &'static str {
    match num {
        0..32 => EXCEPTION_NAMES[num as usize],
        32..48 => "Hardware Interrupt",
        _ => "Unassigned Interrupt",
    }
}

/// The page-fault error code pushed by the CPU.
#[bitfield(u64)]
pub struct PageFaultCode {
    /// Clear: no translation was present. Set: a protection check failed.
    pub protection_violation: bool,
    /// The faulting access was a write.
    pub write: bool,
    /// The fault happened in user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure. Always fatal: the page
    /// tables themselves are corrupt.
    pub reserved_bit: bool,
    /// The faulting access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(59)]
    __: u64,
}

impl MemoryFault {
    /// Decode a page fault from its error code and the faulting address
    /// (CR2, captured by the entry path).
    #[must_use]
    pub const fn from_page_fault(code: PageFaultCode, address: VirtualAddress) -> Self {
        let access = if code.instruction_fetch() {
            AccessKind::Execute
        } else if code.write() {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        let kind = if code.protection_violation() {
            MemoryFaultKind::AccessViolation
        } else {
            MemoryFaultKind::Unmapped
        };
        Self {
            kind,
            access,
            address,
        }
    }
}

/// Read the faulting address of the most recent page fault.
///
/// # Safety
///
/// Only meaningful on the CPU that took the fault, before another page fault
/// can occur (i.e. early in the handler, traps still masked).
#[cfg(target_arch = "x86_64")]
#[must_use]
pub unsafe fn read_fault_address() -> VirtualAddress {
    let cr2: u64;
    // SAFETY: reading CR2 has no side effects; requires CPL0, which trap
    // handlers run at.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    VirtualAddress::new(cr2)
}

/// An interrupt handling routine.
pub type Handler = fn(&mut InterruptFrame) -> Disposition;

/// Maps every interrupt vector to exactly one handler.
///
/// Starts out with every slot pointing at the default handler, which treats
/// the trap as unrecoverable. Boot code registers real handlers for the
/// vectors it supports before enabling traps.
pub struct DispatchTable {
    handlers: [Handler; VECTOR_COUNT],
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: [unhandled; VECTOR_COUNT],
        }
    }

    /// Register `handler` for `vector`, replacing the previous one.
    pub const fn register(&mut self, vector: u8, handler: Handler) {
        self.handlers[vector as usize] = handler;
    }

    /// Dispatch a captured frame to the registered handler.
    ///
    /// Returns normally when the handler resumes; the caller (the entry
    /// stub) then restores the frame. Never returns when the handler
    /// escalates: the frame is dumped and the system halts.
    pub fn dispatch(&self, frame: &mut InterruptFrame) {
        let Some(&handler) = self.handlers.get(frame.num as usize) else {
            frame.dump();
            kernel_fatal::fatal!("interrupt vector {} out of range", frame.num);
        };

        match handler(frame) {
            Disposition::Resume => {}
            Disposition::Fatal => {
                frame.dump();
                kernel_fatal::fatal!(
                    "unhandled {}-mode exception {} ({})",
                    if frame.from_user_mode() { "user" } else { "kernel" },
                    frame.num,
                    vector_name(frame.num),
                );
            }
        }
    }
}

/// Default handler: every unregistered trap is unrecoverable.
fn unhandled(_frame: &mut InterruptFrame) -> Disposition {
    Disposition::Fatal
}
