//! The BSD event shape and its constants.
//!
//! A [`KEvent`] is the unit of communication in both directions: callers
//! submit change events describing registrations, and the kqueue hands back
//! delivery events describing readiness. The layout is field-compatible with
//! the BSD `struct kevent` on LP64 targets, with `udata` widened to `usize`
//! so the type stays `Send` (the C shim casts to and from `void *`).

use std::ffi::c_int;

use bitflags::bitflags;

/// Filter tag for readable descriptors.
pub const EVFILT_READ: i16 = -1;
/// Filter tag for writable descriptors.
pub const EVFILT_WRITE: i16 = -2;
/// Filter tag for vnode (filesystem) changes.
pub const EVFILT_VNODE: i16 = -4;
/// Filter tag for process state changes.
pub const EVFILT_PROC: i16 = -5;
/// Filter tag for POSIX signals.
pub const EVFILT_SIGNAL: i16 = -6;
/// Filter tag for timers.
pub const EVFILT_TIMER: i16 = -7;
/// Filter tag for user-triggered events.
pub const EVFILT_USER: i16 = -10;

/// Number of slots in the filter table.
///
/// Filters are negative tags; slot `i` serves the filter `-(i + 1)`, the
/// same `~filter` indexing BSD kernels use. Tags without an implementation
/// (for example `-3`, the AIO filter) hold a not-implemented entry.
pub(crate) const FILTER_SLOTS: usize = 10;

/// Maps a filter tag to its slot in the filter table.
///
/// Returns `None` for tags outside the table, which callers surface as
/// `EINVAL`.
pub(crate) fn filter_slot(filter: i16) -> Option<usize> {
    if (-(FILTER_SLOTS as i16)..=-1).contains(&filter) {
        Some((-filter - 1) as usize)
    } else {
        None
    }
}

bitflags! {
    /// Action and behavior bits of a [`KEvent`], matching the BSD values.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct EventFlags: u16 {
        /// Register the event, or modify it if already present.
        const ADD = 0x0001;

        /// Remove the event from the kqueue.
        const DELETE = 0x0002;

        /// Allow the event to be delivered.
        const ENABLE = 0x0004;

        /// Keep the registration but suppress delivery.
        const DISABLE = 0x0008;

        /// Delete the registration after the first delivery.
        const ONESHOT = 0x0010;

        /// Edge-triggered: reset the reported state after delivery.
        const CLEAR = 0x0020;

        /// Acknowledge the change with an `ERROR` event carrying `data = 0`.
        const RECEIPT = 0x0040;

        /// Disable (but keep) the registration after each delivery.
        const DISPATCH = 0x0080;

        /// The change failed; `data` holds the error number.
        const ERROR = 0x4000;

        /// End-of-file or peer hang-up on the source.
        const EOF = 0x8000;

        // Tolerate unknown bits instead of truncating them.
        const _ = !0;
    }
}

impl EventFlags {
    /// The subset recorded on a knote and echoed in delivered events.
    pub(crate) fn behavior(self) -> EventFlags {
        self & (EventFlags::ONESHOT | EventFlags::CLEAR | EventFlags::DISPATCH)
    }
}

// Timer fflags: expiry units and absolute mode.
pub const NOTE_SECONDS: u32 = 0x0000_0001;
pub const NOTE_MSECONDS: u32 = 0x0000_0002;
pub const NOTE_USECONDS: u32 = 0x0000_0004;
pub const NOTE_NSECONDS: u32 = 0x0000_0008;
pub const NOTE_ABSTIME: u32 = 0x0000_0010;

// Vnode fflags.
pub const NOTE_DELETE: u32 = 0x0000_0001;
pub const NOTE_WRITE: u32 = 0x0000_0002;
pub const NOTE_EXTEND: u32 = 0x0000_0004;
pub const NOTE_ATTRIB: u32 = 0x0000_0008;
pub const NOTE_LINK: u32 = 0x0000_0010;
pub const NOTE_RENAME: u32 = 0x0000_0020;
pub const NOTE_REVOKE: u32 = 0x0000_0040;

// User fflags: the value-combine protocol plus the trigger bit.
pub const NOTE_FFNOP: u32 = 0x0000_0000;
pub const NOTE_FFAND: u32 = 0x4000_0000;
pub const NOTE_FFOR: u32 = 0x8000_0000;
pub const NOTE_FFCOPY: u32 = 0xc000_0000;
pub const NOTE_FFCTRLMASK: u32 = 0xc000_0000;
pub const NOTE_FFLAGSMASK: u32 = 0x00ff_ffff;
pub const NOTE_TRIGGER: u32 = 0x0100_0000;

// Proc fflags.
pub const NOTE_EXIT: u32 = 0x8000_0000;
pub const NOTE_FORK: u32 = 0x4000_0000;
pub const NOTE_EXEC: u32 = 0x2000_0000;

/// One event, in either direction.
///
/// Submitted as a change it describes a registration action; returned from
/// a wait it describes one unit of readiness. `udata` is opaque and echoed
/// back unchanged.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KEvent {
    /// Source identifier: a file descriptor, signal number, timer id, or
    /// any value the user filter chooses.
    pub ident: usize,

    /// Filter tag selecting the event class.
    pub filter: i16,

    /// Action and behavior bits, see [`EventFlags`].
    pub flags: u16,

    /// Filter-specific flags.
    pub fflags: u32,

    /// Filter-specific payload: bytes available, expiration count,
    /// delivery count, or an error number on `ERROR` events.
    pub data: isize,

    /// Opaque user value echoed back unchanged.
    pub udata: usize,
}

impl KEvent {
    /// Builds an event, the `EV_SET` equivalent.
    pub fn new(
        ident: usize,
        filter: i16,
        flags: EventFlags,
        fflags: u32,
        data: isize,
        udata: usize,
    ) -> Self {
        Self {
            ident,
            filter,
            flags: flags.bits(),
            fflags,
            data,
            udata,
        }
    }

    /// The flags field as a typed value.
    pub fn event_flags(&self) -> EventFlags {
        EventFlags::from_bits_retain(self.flags)
    }

    /// Builds the acknowledgement event for a processed change.
    ///
    /// Emitted for changes carrying `RECEIPT`, and for failed changes when
    /// the caller supplied room in the event list. `data` is `0` on success
    /// and the error number on failure.
    pub(crate) fn receipt(change: &KEvent, error: c_int) -> Self {
        Self {
            ident: change.ident,
            filter: change.filter,
            flags: EventFlags::ERROR.bits(),
            fflags: 0,
            data: error as isize,
            udata: change.udata,
        }
    }
}
