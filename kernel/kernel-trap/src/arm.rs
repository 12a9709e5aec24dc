//! ARM (AArch32) interrupt frames and dispatch.

use kernel_addr::VirtualAddress;

use crate::{AccessKind, Disposition, MemoryFault, MemoryFaultKind};

/// Interrupt frame field offsets, shared with the exception vector stubs.
pub mod offset {
    pub const SP: usize = 0x00;
    pub const LR: usize = 0x04;
    pub const R0: usize = 0x08;
    pub const R12: usize = 0x38;
    pub const PC: usize = 0x3c;
    pub const SPSR: usize = 0x40;
}

/// Register state captured by the exception vector stubs.
///
/// The stubs store the banked SP/LR of the interrupted mode first, then
/// r0..r12, the return PC, and the saved program status register. Field
/// order is a fixed ABI with that assembly.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterruptFrame {
    /// SP (r13) of the interrupted mode.
    pub sp: u32,
    /// LR (r14) of the interrupted mode.
    pub lr: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    /// PC (r15) the exception returns to.
    pub pc: u32,
    /// Saved Program Status Register of the interrupted mode.
    pub spsr: u32,
}

const _: () = assert!(size_of::<InterruptFrame>() == 0x44);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, sp) == offset::SP);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, lr) == offset::LR);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, r0) == offset::R0);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, r12) == offset::R12);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, pc) == offset::PC);
const _: () = assert!(core::mem::offset_of!(InterruptFrame, spsr) == offset::SPSR);

impl InterruptFrame {
    /// Log every captured register at `error!`.
    pub fn dump(&self) {
        log::error!(
            "R0:   {:#010x}  R1: {:#010x}  R2:  {:#010x}  R3:  {:#010x}",
            self.r0,
            self.r1,
            self.r2,
            self.r3
        );
        log::error!(
            "R4:   {:#010x}  R5: {:#010x}  R6:  {:#010x}  R7:  {:#010x}",
            self.r4,
            self.r5,
            self.r6,
            self.r7
        );
        log::error!(
            "R8:   {:#010x}  R9: {:#010x}  R10: {:#010x}  R11: {:#010x}",
            self.r8,
            self.r9,
            self.r10,
            self.r11
        );
        log::error!(
            "R12:  {:#010x}  SP: {:#010x}  LR:  {:#010x}  PC:  {:#010x}",
            self.r12,
            self.sp,
            self.lr,
            self.pc
        );
        log::error!("SPSR: {:#010x}", self.spsr);
    }
}

/// The architectural exception vector table slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Vector {
    Reset = 0,
    Undefined = 1,
    Syscall = 2,
    PrefetchAbort = 3,
    DataAbort = 4,
    Reserved = 5,
    Irq = 6,
    Fiq = 7,
}

/// Number of exception vectors.
pub const VECTOR_COUNT: usize = 8;

impl Vector {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::Undefined => "Undefined Instruction",
            Self::Syscall => "Supervisor Call",
            Self::PrefetchAbort => "Prefetch Abort",
            Self::DataAbort => "Data Abort",
            Self::Reserved => "Reserved",
            Self::Irq => "IRQ",
            Self::Fiq => "FIQ",
        }
    }
}

/// Decoded ARMv7 short-descriptor fault status (DFSR/IFSR).
pub struct FaultStatus;

impl FaultStatus {
    /// Map the FS field of a fault status register onto a fault kind.
    ///
    /// Returns `None` for encodings with no memory-management meaning
    /// (external aborts, debug events); handlers treat those as fatal.
    #[must_use]
    pub const fn decode(fsr: u32) -> Option<MemoryFaultKind> {
        // FS is split across bits [3:0] and bit 10.
        let fs = (fsr & 0xf) | ((fsr >> 6) & 0x10);
        match fs {
            0b0_0001 => Some(MemoryFaultKind::Alignment),
            // Translation faults: no descriptor for the address.
            0b0_0101 | 0b0_0111 => Some(MemoryFaultKind::Unmapped),
            // Access flag, domain, and permission faults: a descriptor
            // exists but forbids the access.
            0b0_0011 | 0b0_0110 | 0b0_1001 | 0b0_1011 | 0b0_1101 | 0b0_1111 => {
                Some(MemoryFaultKind::AccessViolation)
            }
            _ => None,
        }
    }
}

impl MemoryFault {
    /// Decode a data abort from DFSR/DFAR (captured by the entry path).
    #[must_use]
    pub const fn from_data_abort(dfsr: u32, dfar: u32) -> Option<Self> {
        let Some(kind) = FaultStatus::decode(dfsr) else {
            return None;
        };
        // DFSR.WnR (bit 11) distinguishes writes from reads.
        let access = if dfsr & (1 << 11) != 0 {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        Some(Self {
            kind,
            access,
            address: VirtualAddress::new(dfar as u64),
        })
    }

    /// Decode a prefetch abort from IFSR/IFAR (captured by the entry path).
    #[must_use]
    pub const fn from_prefetch_abort(ifsr: u32, ifar: u32) -> Option<Self> {
        let Some(kind) = FaultStatus::decode(ifsr) else {
            return None;
        };
        Some(Self {
            kind,
            access: AccessKind::Execute,
            address: VirtualAddress::new(ifar as u64),
        })
    }
}

/// Read the data fault status and address registers.
///
/// # Safety
///
/// Only meaningful inside a data abort handler, before another abort can
/// occur.
#[cfg(target_arch = "arm")]
#[must_use]
pub unsafe fn read_data_fault() -> (u32, u32) {
    let (dfsr, dfar): (u32, u32);
    // SAFETY: CP15 fault status reads have no side effects.
    unsafe {
        core::arch::asm!("mrc p15, 0, {}, c5, c0, 0", out(reg) dfsr, options(nomem, nostack));
        core::arch::asm!("mrc p15, 0, {}, c6, c0, 0", out(reg) dfar, options(nomem, nostack));
    }
    (dfsr, dfar)
}

/// Read the instruction fault status and address registers.
///
/// # Safety
///
/// Only meaningful inside a prefetch abort handler.
#[cfg(target_arch = "arm")]
#[must_use]
pub unsafe fn read_prefetch_fault() -> (u32, u32) {
    let (ifsr, ifar): (u32, u32);
    // SAFETY: CP15 fault status reads have no side effects.
    unsafe {
        core::arch::asm!("mrc p15, 0, {}, c5, c0, 1", out(reg) ifsr, options(nomem, nostack));
        core::arch::asm!("mrc p15, 0, {}, c6, c0, 2", out(reg) ifar, options(nomem, nostack));
    }
    (ifsr, ifar)
}

/// An exception handling routine.
pub type Handler = fn(&mut InterruptFrame) -> Disposition;

/// Maps every exception vector to exactly one handler.
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
    pub const fn register(&mut self, vector: Vector, handler: Handler) {
        self.handlers[vector as usize] = handler;
    }

    /// Dispatch a captured frame to the handler registered for `vector`.
    ///
    /// Returns normally when the handler resumes; never returns when it
    /// escalates.
    pub fn dispatch(&self, vector: Vector, frame: &mut InterruptFrame) {
        match self.handlers[vector as usize](frame) {
            Disposition::Resume => {}
            Disposition::Fatal => {
                frame.dump();
                kernel_fatal::fatal!("unhandled {} exception", vector.name());
            }
        }
    }
}

/// Default handler: every unregistered exception is unrecoverable.
fn unhandled(_frame: &mut InterruptFrame) -> Disposition {
    Disposition::Fatal
}
