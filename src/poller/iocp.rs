//! Windows I/O completion port aggregator.
//!
//! A parallel, independent realization of the aggregation contract: one
//! completion port per kqueue, readiness reported as completion packets
//! whose key carries the token. Only a subset of the filters is backed on
//! this path (the rest are registered as not-implemented), so the
//! aggregator here deals in posted packets rather than descriptor
//! registrations.

use crate::poller::common::{Source, Wake};
use crate::utils::Slab;

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

/// Reserved completion key for the cross-thread wake packet.
const WAKE_KEY: usize = usize::MAX;

/// Per-kqueue completion port.
pub(crate) struct Aggregator {
    iocp: HANDLE,
    tokens: Mutex<Slab<Source>>,
}

unsafe impl Send for Aggregator {}
unsafe impl Sync for Aggregator {}

impl Aggregator {
    pub(crate) fn new() -> io::Result<Self> {
        let iocp = unsafe {
            CreateIoCompletionPort(
                windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
                std::ptr::null_mut(),
                0,
                0,
            )
        };
        if iocp.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            iocp,
            tokens: Mutex::new(Slab::with_capacity(16)),
        })
    }

    /// Interrupts a blocked wait; the wake key never maps to a knote.
    pub(crate) fn wake(&self) {
        unsafe {
            PostQueuedCompletionStatus(self.iocp, 0, WAKE_KEY, std::ptr::null_mut());
        }
    }

    /// Allocates a token for a packet-posting source.
    ///
    /// The descriptor argument of the Unix path has no counterpart here;
    /// readiness arrives only through [`post`](Self::post).
    pub(crate) fn register_posted(&self, source: Source) -> usize {
        self.tokens.lock().unwrap().insert(source)
    }

    pub(crate) fn deregister_posted(&self, token: usize) {
        self.tokens.lock().unwrap().remove(token);
    }

    /// Queues a readiness packet for `token`.
    pub(crate) fn post(&self, token: usize) {
        unsafe {
            PostQueuedCompletionStatus(self.iocp, 0, token, std::ptr::null_mut());
        }
    }

    /// Blocks until one packet, wake, or timeout; fills `wakes`.
    ///
    /// Returns `true` when the explicit wake packet was consumed.
    pub(crate) fn wait(&self, wakes: &mut Vec<Wake>, timeout: Option<Duration>) -> io::Result<bool> {
        wakes.clear();

        let timeout_ms = match timeout {
            None => INFINITE,
            Some(t) => t.as_millis().min(u32::MAX as u128 - 1) as u32,
        };

        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(self.iocp, &mut bytes, &mut key, &mut overlapped, timeout_ms)
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(false);
            }
            return Err(err);
        }

        if key == WAKE_KEY {
            return Ok(true);
        }

        let tokens = self.tokens.lock().unwrap();
        if let Some(source) = tokens.get(key) {
            wakes.push(Wake {
                source: *source,
                readable: true,
                writable: false,
                hup: false,
                error: false,
            });
        } else {
            log::debug!("stale completion key {key}, discarding");
        }

        Ok(false)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.iocp);
        }
    }
}
