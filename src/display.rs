//! Notification-level globals and display macros.
//!
//! All diagnostic output is written to stderr, gated by a crate-wide atomic
//! level; results requested by the user (e.g. the cluster map) go to stdout
//! unconditionally via [`displayout!`].
//!
//! Levels: 0 = silent, 1 = errors only, 2 = results + warnings (default),
//! 3 = progress, 4+ = verbose.

use std::sync::atomic::{AtomicI32, Ordering};

/// Global notification level.
pub static DISPLAY_LEVEL: AtomicI32 = AtomicI32::new(2);

/// Returns the current notification level.
#[inline]
pub fn display_level() -> i32 {
    DISPLAY_LEVEL.load(Ordering::Relaxed)
}

/// Sets the notification level.
#[inline]
pub fn set_display_level(level: i32) {
    DISPLAY_LEVEL.store(level, Ordering::Relaxed);
}

/// Print to stdout unconditionally.
#[macro_export]
macro_rules! displayout {
    ($($arg:tt)*) => { print!($($arg)*) };
}

/// Print to stderr unconditionally.
#[macro_export]
macro_rules! display {
    ($($arg:tt)*) => { eprint!($($arg)*) };
}

/// Conditionally print to stderr at or above `level`.
#[macro_export]
macro_rules! displaylevel {
    ($level:expr, $($arg:tt)*) => {
        if $crate::display::display_level() >= $level {
            eprint!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        let prev = display_level();
        set_display_level(4);
        assert_eq!(display_level(), 4);
        set_display_level(prev);
    }
}
