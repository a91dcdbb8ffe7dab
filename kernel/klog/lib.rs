//! Hypervisor logging.
//!
//! Leaf crate shared by the mm and mem-access code. Output goes through a
//! sink installed once by the platform layer (serial, debug port, or a test
//! capture buffer); until then everything is dropped.
//!
//! | Macro | Filtered by profile | Release build |
//! |-------|---------------------|---------------|
//! | [`klog!`] | level threshold | `Debug`/`Trace` compiled out |
//! | [`klog_always!`] | off in `Secure` | kept |
//! | [`klog_force!`] | never | kept; used right before a fatal panic |
//!
//! Profiles:
//!
//! - `Secure`: nothing
//! - `Balanced`: `Warn` and `Error`
//! - `Performance`: everything
//!
//! Guest frame numbers may be logged at any level. Machine frame numbers
//! belong in `Debug`/`Trace` only.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Once;

/// Message severity, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    /// Is this level present in the current build at all?
    #[inline(always)]
    pub const fn compiled_in(self) -> bool {
        cfg!(debug_assertions) || (self as u8) >= Level::Info as u8
    }
}

/// Hardening profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    Secure = 0,
    Balanced = 1,
    Performance = 2,
}

const THRESHOLD_OFF: u8 = u8::MAX;

/// Lowest level emitted. Starts closed until a profile is chosen.
static THRESHOLD: AtomicU8 = AtomicU8::new(THRESHOLD_OFF);
/// Gate for [`klog_always!`]; also closed at boot.
static STATUS_ENABLED: AtomicBool = AtomicBool::new(false);
static SINK: Once<fn(fmt::Arguments)> = Once::new();

/// Apply `profile` to all macros. May be called again later.
pub fn set_profile(profile: KlogProfile) {
    let threshold = match profile {
        KlogProfile::Secure => THRESHOLD_OFF,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    THRESHOLD.store(threshold, Ordering::Release);
    STATUS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Silence [`klog!`]. Status and forced output are unaffected.
pub fn disable() {
    THRESHOLD.store(THRESHOLD_OFF, Ordering::Release);
}

/// Install the output sink. Returns `false` if one was already installed.
pub fn set_sink(sink: fn(fmt::Arguments)) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

/// Would [`klog!`] at `level` produce output right now?
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level.compiled_in() && level as u8 >= THRESHOLD.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _status_enabled() -> bool {
    STATUS_ENABLED.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _emit(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(format_args!("{}\n", args));
    }
}

/// Leveled message: `klog!(Warn, "d{}: ...", id)`.
#[macro_export]
macro_rules! klog {
    ($level:ident, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::$level) {
            $crate::_emit(format_args!($($arg)+));
        }
    }};
}

/// Status message, suppressed only by the `Secure` profile.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_status_enabled() {
            $crate::_emit(format_args!($($arg)+));
        }
    }};
}

/// Unfiltered message for diagnostics that precede a panic.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_emit(format_args!($($arg)+));
    }};
}
