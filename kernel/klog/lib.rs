//! Ion-OS kernel logging (`klog`).
//!
//! Lightweight, runtime-filtered logging macros shared by every kernel
//! sub-crate. The filter is a single atomic load on the hot path.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics (replaces `println!`) |
//! | [`klog!`] | Active | Yes | Operational logging with a level filter |
//! | [`klog_always!`] | Active | Console-gated | Boot banners, status messages |
//!
//! # Fail-closed default
//!
//! All output is suppressed until the boot path calls [`set_level`]. Besides
//! keeping pre-console boot silent, this means code paths exercised on a host
//! (unit tests) never reach the console hardware.

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Severity level for [`klog!`] messages, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Gate for [`klog_always!`]; set once the console is usable.
static CONSOLE_READY: AtomicBool = AtomicBool::new(false);

/// Set the minimum emitted level and open the [`klog_always!`] gate.
///
/// Called once during early boot, after the console drivers are initialised.
#[inline]
pub fn set_level(min: Level) {
    LOG_MIN_LEVEL.store(min as u8, Ordering::Release);
    CONSOLE_READY.store(true, Ordering::Release);
}

/// Suppress all [`klog!`] output. Does not affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _console_ready() -> bool {
    CONSOLE_READY.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: core::fmt::Arguments) {
    drivers::vga_buffer::_print(args);
}

/// Console-gated kernel output (boot banners, status messages).
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_console_ready() {
            $crate::_klog_print(format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_console_ready() {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Debug-only kernel print, fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered kernel logging.
///
/// `Debug` and `Trace` are additionally compiled out of release builds, so
/// they cost nothing in production even when the filter would allow them.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "AP {} failed to start", cpu);
/// klog!(Info, "SMP: {} CPUs online", count);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_silent() {
        assert!(!enabled(Level::Error));
        assert!(!_console_ready());
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Warn < Level::Error);
    }
}
