//! C ABI surface.
//!
//! `kqueue()` and `kevent()` with the BSD signatures, over a global
//! descriptor registry. The returned descriptor is the kqueue's own
//! (pollable) descriptor; because the library cannot observe a plain
//! `close(2)` on it, `kqueue_close()` is the counterpart that tears the
//! emulation state down. A descriptor closed behind the registry's back
//! is detected on the next call and reported as `EBADF`.
//!
//! Errors surface as `-1` with `errno` set, per the platform convention.

use crate::event::KEvent;
use crate::kqueue::KqueueInner;

use libc::{c_int, timespec};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Registry of live kqueues keyed by their public descriptor.
///
/// This is the kqueue-level lock of the hierarchy: taken only for
/// create, lookup and destroy, never while a filter lock is held.
static REGISTRY: OnceLock<Mutex<HashMap<RawFd, Arc<KqueueInner>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<RawFd, Arc<KqueueInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn set_errno(code: c_int) {
    unsafe {
        *libc::__errno_location() = code;
    }
}

fn fail(err: std::io::Error) -> c_int {
    set_errno(err.raw_os_error().unwrap_or(libc::EINVAL));
    -1
}

/// Looks a kqueue up, evicting registrations whose descriptor was closed
/// behind our back.
fn lookup(kq: c_int) -> Option<Arc<KqueueInner>> {
    let mut map = registry().lock().unwrap();
    let inner = map.get(&kq)?.clone();
    if !crate::sys::sys_fd_valid(kq) {
        log::debug!("kqueue descriptor {kq} was closed externally, evicting");
        map.remove(&kq);
        inner.shut_down();
        return None;
    }
    Some(inner)
}

/// Creates a kqueue and returns its descriptor, or -1.
#[no_mangle]
pub extern "C" fn kqueue() -> c_int {
    match KqueueInner::new() {
        Ok(inner) => {
            let fd = inner.agg.as_raw_fd();
            registry().lock().unwrap().insert(fd, Arc::new(inner));
            fd
        }
        Err(err) => fail(err),
    }
}

/// Applies a change list and retrieves pending events.
///
/// Returns the number of events placed in `eventlist`, 0 on timeout, or
/// -1 with `errno` set.
///
/// # Safety
///
/// `changelist` must point to `nchanges` readable events, `eventlist` to
/// `nevents` writable slots, and `timeout` to a valid timespec or null.
#[no_mangle]
pub unsafe extern "C" fn kevent(
    kq: c_int,
    changelist: *const KEvent,
    nchanges: c_int,
    eventlist: *mut KEvent,
    nevents: c_int,
    timeout: *const timespec,
) -> c_int {
    if nchanges < 0 || nevents < 0 {
        set_errno(libc::EINVAL);
        return -1;
    }
    if (changelist.is_null() && nchanges > 0) || (eventlist.is_null() && nevents > 0) {
        set_errno(libc::EFAULT);
        return -1;
    }

    let Some(inner) = lookup(kq) else {
        set_errno(libc::EBADF);
        return -1;
    };

    let timeout = if timeout.is_null() {
        None
    } else {
        let ts = unsafe { *timeout };
        if ts.tv_sec < 0 || ts.tv_nsec < 0 || ts.tv_nsec >= 1_000_000_000 {
            set_errno(libc::EINVAL);
            return -1;
        }
        Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    };

    let changes = if nchanges == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(changelist, nchanges as usize) }
    };
    let events = if nevents == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(eventlist, nevents as usize) }
    };

    match crate::dispatch::kevent(&inner, changes, events, timeout) {
        Ok(n) => n as c_int,
        Err(err) => fail(err),
    }
}

/// Tears down a kqueue created with [`kqueue`].
///
/// Releases every knote in every filter, closes the descriptor, and
/// unblocks any thread waiting on it. Returns 0, or -1 with `EBADF` for
/// an unknown descriptor.
#[no_mangle]
pub extern "C" fn kqueue_close(kq: c_int) -> c_int {
    let removed = registry().lock().unwrap().remove(&kq);
    match removed {
        Some(inner) => {
            inner.shut_down();
            0
        }
        None => {
            set_errno(libc::EBADF);
            -1
        }
    }
}
