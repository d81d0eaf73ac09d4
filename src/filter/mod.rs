//! Filter modules, one per event class.
//!
//! Every filter owns its knote store and the OS-specific readiness
//! primitive for its class, and translates between the BSD event shape and
//! that primitive. Filters live in a fixed table on the kqueue, indexed by
//! `~filter` exactly as BSD kernels index theirs; tags without an
//! implementation hold a [`NotImplemented`] entry that fails changes with
//! `EINVAL`.

use crate::event::KEvent;
use crate::poller::common::Wake;
use crate::poller::Aggregator;

use std::io;
use std::sync::Mutex;

#[cfg(unix)]
mod proc;
#[cfg(unix)]
mod rw;
#[cfg(unix)]
mod signal;
#[cfg(unix)]
mod timer;
mod user;
#[cfg(unix)]
mod vnode;

/// The capability set every filter implements.
///
/// `apply` and `copyout` are the two halves of the contract: interpret a
/// change event against the knote store, and translate one unit of native
/// readiness back into a BSD event. `disable` and `delete` exist so the
/// dispatcher can honor `DISPATCH` and `ONESHOT` after a delivery while
/// still holding the filter lock.
pub(crate) trait EventFilter: Send {
    /// Interprets one change event: ADD, DELETE, ENABLE, DISABLE, and the
    /// behavior bits stored for later copyouts.
    fn apply(&mut self, agg: &Aggregator, change: &KEvent) -> io::Result<()>;

    /// Translates a wake-up into zero or more delivery events.
    ///
    /// Stale or disarmed sources are suppressed silently; a spurious wake
    /// is not an error.
    fn copyout(&mut self, agg: &Aggregator, wake: &Wake, sink: &mut EventSink<'_>)
        -> io::Result<()>;

    /// Disables a knote after an `EV_DISPATCH` delivery.
    fn disable(&mut self, agg: &Aggregator, ident: u64);

    /// Deletes a knote after an `EV_ONESHOT` delivery.
    fn delete(&mut self, agg: &Aggregator, ident: u64);

    /// Releases every knote and every OS resource this filter holds.
    fn teardown(&mut self, agg: &Aggregator);
}

/// Output cursor over the caller's event list.
///
/// Receipt events written during the change phase occupy the leading
/// slots; copyout appends behind them and stops when the list is full.
pub(crate) struct EventSink<'a> {
    slots: &'a mut [KEvent],
    len: usize,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(slots: &'a mut [KEvent]) -> Self {
        Self { slots, len: 0 }
    }

    /// Appends one event; returns `false` when the list is full.
    pub(crate) fn push(&mut self, event: KEvent) -> bool {
        if self.len == self.slots.len() {
            return false;
        }
        self.slots[self.len] = event;
        self.len += 1;
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// True when the caller supplied no event list at all.
    pub(crate) fn slots_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The events appended since `start`, for post-delivery processing.
    pub(crate) fn since(&self, start: usize) -> &[KEvent] {
        &self.slots[start..self.len]
    }
}

/// Table entry for filter tags the platform does not back.
pub(crate) struct NotImplemented;

impl EventFilter for NotImplemented {
    fn apply(&mut self, _agg: &Aggregator, change: &KEvent) -> io::Result<()> {
        log::debug!("change on unimplemented filter {}", change.filter);
        Err(crate::sys::errno(libc::EINVAL))
    }

    fn copyout(
        &mut self,
        _agg: &Aggregator,
        _wake: &Wake,
        _sink: &mut EventSink<'_>,
    ) -> io::Result<()> {
        Ok(())
    }

    fn disable(&mut self, _agg: &Aggregator, _ident: u64) {}

    fn delete(&mut self, _agg: &Aggregator, _ident: u64) {}

    fn teardown(&mut self, _agg: &Aggregator) {}
}

/// Builds the filter table for one kqueue.
///
/// Slot `i` serves filter `-(i + 1)`. On Linux every filter of the public
/// surface is backed; on Windows only the user filter is, the others
/// mirroring the original port's not-implemented entries.
pub(crate) fn filter_table() -> Box<[Mutex<Box<dyn EventFilter>>]> {
    (1..=crate::event::FILTER_SLOTS as i16)
        .map(|tag| Mutex::new(make_filter(-tag)))
        .collect()
}

#[cfg(unix)]
fn make_filter(tag: i16) -> Box<dyn EventFilter> {
    use crate::event::*;
    match tag {
        EVFILT_READ | EVFILT_WRITE => Box::new(rw::RwFilter::new(tag)),
        EVFILT_VNODE => Box::new(vnode::VnodeFilter::new()),
        EVFILT_PROC => Box::new(proc::ProcFilter::new()),
        EVFILT_SIGNAL => Box::new(signal::SignalFilter::new()),
        EVFILT_TIMER => Box::new(timer::TimerFilter::new()),
        EVFILT_USER => Box::new(user::UserFilter::new()),
        _ => Box::new(NotImplemented),
    }
}

#[cfg(not(unix))]
fn make_filter(tag: i16) -> Box<dyn EventFilter> {
    match tag {
        crate::event::EVFILT_USER => Box::new(user::UserFilter::new()),
        _ => Box::new(NotImplemented),
    }
}
