//! Thin platform syscall layer.
//!
//! Everything `unsafe` that talks to the kernel lives here, wrapped in
//! small `sys_*` functions returning `io::Result` or a best-effort value.
//! The filters and the aggregator stay free of raw `libc` calls.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::*;

/// Builds an `io::Error` from a raw error number.
#[cfg(not(unix))]
pub(crate) fn errno(code: std::ffi::c_int) -> std::io::Error {
    std::io::Error::from_raw_os_error(code)
}
