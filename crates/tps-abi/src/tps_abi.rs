//! `tps_*` entry points.

use std::ffi::{c_char, c_int};

use tps_core::{TPS_SIZE, Tid};

use crate::{global_domain, status};

/// Initialize thread-private storage. Non-zero `segv` installs the fault
/// reporter for `SIGSEGV`/`SIGBUS`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_init(segv: c_int) -> c_int {
    status(global_domain().init(segv != 0))
}

/// Give the calling thread a fresh zero-filled page.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_create() -> c_int {
    status(global_domain().create())
}

/// Drop the calling thread's page binding.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_destroy() -> c_int {
    status(global_domain().destroy())
}

/// Copy `length` bytes at `offset` of the caller's page into `buffer`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_read(offset: usize, length: usize, buffer: *mut c_char) -> c_int {
    let buffer = if buffer.is_null() {
        None
    } else {
        // Spans past TPS_SIZE are rejected before use; never claim more.
        // SAFETY: the caller guarantees `buffer` holds `length` bytes.
        Some(unsafe { std::slice::from_raw_parts_mut(buffer.cast::<u8>(), length.min(TPS_SIZE)) })
    };
    status(global_domain().read_with(offset, length, buffer))
}

/// Copy `length` bytes of `buffer` into the caller's page at `offset`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_write(offset: usize, length: usize, buffer: *const c_char) -> c_int {
    let buffer = if buffer.is_null() {
        None
    } else {
        // SAFETY: the caller guarantees `buffer` holds `length` bytes.
        Some(unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), length.min(TPS_SIZE)) })
    };
    status(global_domain().write_with(offset, length, buffer))
}

/// Share the page of thread `tid` with the calling thread.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn tps_clone(tid: libc::pthread_t) -> c_int {
    status(global_domain().clone_from_thread(Tid(tid as usize as u64)))
}
