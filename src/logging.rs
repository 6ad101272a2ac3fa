use core::sync::atomic::{AtomicBool, Ordering};

/// Whether the allocator emits its internal log records. Off by default, since
/// a logger that allocates would otherwise recurse into the allocator.
pub(crate) static HEAP_LOG: AtomicBool = AtomicBool::new(false);

/// Enables the allocator's internal log records.
pub fn enable_logging() {
    HEAP_LOG.store(true, Ordering::Relaxed);
}

/// Disables the allocator's internal log records.
pub fn disable_logging() {
    HEAP_LOG.store(false, Ordering::Relaxed);
}

pub(crate) fn should_log() -> bool {
    HEAP_LOG.load(Ordering::Relaxed)
}

macro_rules! hwarn {
    ($($arg:tt)*) => {
        if $crate::logging::should_log() {
            log::warn!($($arg)*);
        }
    };
}

macro_rules! hdebug {
    ($($arg:tt)*) => {
        if $crate::logging::should_log() {
            log::debug!($($arg)*);
        }
    };
}

macro_rules! htrace {
    ($($arg:tt)*) => {
        if $crate::logging::should_log() {
            log::trace!($($arg)*);
        }
    };
}
