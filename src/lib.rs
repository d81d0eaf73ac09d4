//! # kqport
//!
//! **kqport** re-implements the BSD `kqueue`/`kevent` event-notification
//! API on operating systems that lack it natively. Programs written
//! against the BSD event model register interest in heterogeneous
//! sources (readable and writable descriptors, signals, timers, vnode
//! changes, user-triggered events, process exit) through one handle and
//! retrieve ready events with a single blocking call.
//!
//! On Linux the runtime maps every filter onto the native descriptor
//! types (`epoll` as the aggregation fabric, plus `signalfd`, `timerfd`,
//! `inotify`, `eventfd` and pidfds); a secondary Windows path realizes
//! the same contracts over an I/O completion port with a reduced filter
//! set.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kqport::{EventFlags, KEvent, Kqueue, EVFILT_TIMER};
//! use std::time::Duration;
//!
//! let kq = Kqueue::new()?;
//!
//! // A 50 ms repeating timer under ident 7.
//! let add = KEvent::new(7, EVFILT_TIMER, EventFlags::ADD, 0, 50, 0);
//! kq.kevent(&[add], &mut [], None)?;
//!
//! let mut events = [KEvent::default(); 8];
//! let n = kq.kevent(&[], &mut events, Some(Duration::from_secs(1)))?;
//! assert_eq!(events[..n][0].ident, 7);
//! ```
//!
//! ## Surfaces
//!
//! - The safe Rust API: [`Kqueue`], [`KEvent`], [`EventFlags`] and the
//!   `EVFILT_*`/`NOTE_*` constants, all carrying the BSD numeric values.
//! - A C ABI shim (`kqueue()`, `kevent()`, `kqueue_close()`) for linking
//!   as a static or shared library, on Linux.
//!
//! Threads may add, modify and wait on the same kqueue concurrently;
//! waits block without holding locks and honor monotonic timeouts.

mod dispatch;
mod event;
mod filter;
mod init;
mod knote;
mod kqueue;
mod poller;
mod sys;
mod utils;

#[cfg(target_os = "linux")]
pub mod capi;

pub use event::{
    EventFlags, KEvent, EVFILT_PROC, EVFILT_READ, EVFILT_SIGNAL, EVFILT_TIMER, EVFILT_USER,
    EVFILT_VNODE, EVFILT_WRITE, NOTE_ABSTIME, NOTE_ATTRIB, NOTE_DELETE, NOTE_EXEC, NOTE_EXIT,
    NOTE_EXTEND, NOTE_FFAND, NOTE_FFCOPY, NOTE_FFCTRLMASK, NOTE_FFLAGSMASK, NOTE_FFNOP,
    NOTE_FFOR, NOTE_FORK, NOTE_LINK, NOTE_MSECONDS, NOTE_NSECONDS, NOTE_RENAME, NOTE_REVOKE,
    NOTE_SECONDS, NOTE_TRIGGER, NOTE_USECONDS, NOTE_WRITE,
};
pub use kqueue::Kqueue;
