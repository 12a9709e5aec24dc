//! # Unrecoverable Boot Error Reporting
//!
//! The memory core treats some conditions as unrecoverable: an inconsistent
//! firmware memory map, or exhaustion of a resource the boot cannot proceed
//! without. Those paths end here.
//!
//! [`report`] (usually via the [`fatal!`] macro) emits the diagnostic through
//! the `log` facade and then hands control to the installed [`FatalHandler`],
//! which must not return. The embedding loader or kernel installs a handler
//! at boot entry with [`set_handler`]; a typical implementation prints to the
//! boot console and halts or reboots the machine.
//!
//! Until a handler is installed, [`report`] panics with the same message.
//! That is also the behaviour host tests rely on (`#[should_panic]`).
//!
//! ## Ordering
//!
//! Install the handler before the first ledger or MMU call. Handlers are
//! installed once; a second [`set_handler`] call replaces the first, which is
//! only meaningful for tests.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A diverging handler invoked with the formatted diagnostic.
pub type FatalHandler = fn(args: &fmt::Arguments<'_>) -> !;

/// Installed handler, or null for the panicking default.
///
/// Function pointers are stored through a cast; `AtomicPtr` gives the install
/// a release/acquire pair without needing a lock this early in boot.
static HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the system-wide fatal handler.
pub fn set_handler(handler: FatalHandler) {
    HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Report an unrecoverable error and stop.
///
/// Logs the diagnostic at `error!` first so it reaches any attached logging
/// sink even when the handler can only halt.
pub fn report(args: &fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {args}");

    let raw = HANDLER.load(Ordering::Acquire);
    if raw.is_null() {
        panic!("{args}");
    }

    // SAFETY: the pointer was stored from a `FatalHandler` in `set_handler`
    // and fn pointer layout is stable for the duration of the program.
    let handler: FatalHandler = unsafe { core::mem::transmute(raw) };
    handler(args)
}

/// Report an unrecoverable error with `format_args!` syntax and stop.
///
/// ```should_panic
/// kernel_fatal::fatal!("you do not have enough memory available");
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::report(&core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "out of luck: 42")]
    fn default_handler_panics_with_message() {
        fatal!("out of luck: {}", 42);
    }
}
