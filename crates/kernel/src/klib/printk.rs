// Kernel logging macros
//
// The serial console and ring buffer live with the platform layer; this
// crate logs through the `log` facade and keeps the printk-style macro
// names the rest of the kernel uses.

/// Critical errors that prevent an operation from completing.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { ::log::error!($($arg)*) };
}

/// Warning conditions that should be addressed.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}

/// Informational messages about normal operation.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { ::log::info!($($arg)*) };
}

/// Debugging information, compiled out of release kernels by the `log`
/// level features.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}
