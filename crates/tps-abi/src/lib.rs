// All extern "C" entry points take raw pointers from C callers; each checks
// for null and bounds before touching memory.
#![allow(clippy::missing_safety_doc)]
//! # tps-abi
//!
//! C boundary for thread-private storage.
//!
//! Every entry point operates on one process-wide [`TpsDomain`] built on first
//! use from the environment (`TPS_FAULT_REPORTING`, `TPS_MAX_PAGES`). Calls
//! return `0` on success and `-1` on failure with `errno` set from
//! [`TpsError::errno`].
//!
//! ```text
//! C caller -> tps_* entry (this crate) -> TpsDomain (tps-core) -> 0 / -1 + errno
//! ```
//!
//! Release builds export unmangled symbols; debug builds keep Rust names so
//! the crate links into test binaries without clashing with anything.

use std::sync::OnceLock;

use tps_core::{TpsConfig, TpsDomain, TpsError};

pub mod tps_abi;

pub use tps_core::TPS_SIZE;

static DOMAIN: OnceLock<TpsDomain> = OnceLock::new();

/// The process-wide domain behind the C entry points.
pub fn global_domain() -> &'static TpsDomain {
    DOMAIN.get_or_init(|| TpsDomain::with_config(TpsConfig::from_env()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: returns this thread's errno slot.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: returns this thread's errno slot.
    unsafe { libc::__error() }
}

#[inline]
pub(crate) unsafe fn set_abi_errno(val: libc::c_int) {
    let p = unsafe { errno_location() };
    unsafe { *p = val };
}

/// Collapse a domain result to the C convention.
pub(crate) fn status(result: Result<(), TpsError>) -> libc::c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            // SAFETY: writes only the calling thread's errno.
            unsafe { set_abi_errno(err.errno()) };
            -1
        }
    }
}
