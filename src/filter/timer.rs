//! Timer filter backed by one `timerfd` per knote.
//!
//! `data` in the change carries the expiry in the unit selected by
//! `fflags` (milliseconds when no unit bit is set). Relative timers run on
//! the monotonic clock and repeat with the same period; `NOTE_ABSTIME`
//! selects a single expiry at an absolute wall-clock time. The delivered
//! `data` is the number of expirations since the previous delivery, as
//! read from the timerfd.

use crate::event::{
    EventFlags, KEvent, NOTE_ABSTIME, NOTE_MSECONDS, NOTE_NSECONDS, NOTE_SECONDS, NOTE_USECONDS,
};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Interest, Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

pub(crate) struct TimerFilter {
    notes: KnoteStore,
}

impl TimerFilter {
    pub(crate) fn new() -> Self {
        Self {
            notes: KnoteStore::new(),
        }
    }

    fn release(&self, agg: &Aggregator, knote: &Arc<Knote>) {
        let mut state = knote.lock();
        if let (Some(token), Some(fd)) =
            (state.token.take(), state.backing.fd().map(|f| f.as_raw_fd()))
        {
            agg.deregister(fd, token);
        }
        state.backing = Backing::None;
    }
}

/// Converts the submitted expiry into a `timespec`.
///
/// Negative values and unit products that overflow the nanosecond range
/// fail with `EINVAL`, as does an unknown unit combination.
fn expiry_timespec(data: isize, fflags: u32) -> io::Result<libc::timespec> {
    if data < 0 {
        return Err(sys::errno(libc::EINVAL));
    }
    let value = data as u64;

    let unit_bits = fflags & (NOTE_SECONDS | NOTE_MSECONDS | NOTE_USECONDS | NOTE_NSECONDS);
    let nanos: u64 = match unit_bits {
        NOTE_SECONDS => value.checked_mul(1_000_000_000),
        0 | NOTE_MSECONDS => value.checked_mul(1_000_000),
        NOTE_USECONDS => value.checked_mul(1_000),
        NOTE_NSECONDS => Some(value),
        _ => return Err(sys::errno(libc::EINVAL)),
    }
    .ok_or_else(|| sys::errno(libc::EINVAL))?;

    Ok(libc::timespec {
        tv_sec: (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    })
}

/// Arms a timerfd for the knote's current expiry settings.
fn arm_timerfd(fd: std::os::fd::RawFd, data: isize, fflags: u32) -> io::Result<()> {
    let absolute = fflags & NOTE_ABSTIME != 0;
    let mut value = expiry_timespec(data, fflags)?;

    // A zero it_value would disarm the timerfd; the nearest expressible
    // expiry is one nanosecond.
    if value.tv_sec == 0 && value.tv_nsec == 0 {
        value.tv_nsec = 1;
    }

    let interval = if absolute {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }
    } else {
        value
    };

    sys::sys_timerfd_arm(fd, value, interval, absolute)
}

impl EventFilter for TimerFilter {
    fn apply(&mut self, agg: &Aggregator, change: &KEvent) -> io::Result<()> {
        let flags = change.event_flags();
        let ident = change.ident as u64;

        if flags.contains(EventFlags::DELETE) {
            let knote = self
                .notes
                .remove(ident)
                .ok_or_else(|| sys::errno(libc::ENOENT))?;
            self.release(agg, &knote);
            return Ok(());
        }

        if flags.contains(EventFlags::ADD) {
            if let Some(knote) = self.notes.get(ident) {
                // Re-ADD restarts the timer with the new settings.
                let mut state = knote.lock();
                state.flags = flags.behavior();
                state.udata = change.udata;
                state.fflags = change.fflags;
                state.delivered = false;
                state.enabled = !flags.contains(EventFlags::DISABLE);
                if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                    arm_timerfd(fd, change.data, change.fflags)?;
                }
                return Ok(());
            }

            let absolute = change.fflags & NOTE_ABSTIME != 0;
            let clock = if absolute {
                libc::CLOCK_REALTIME
            } else {
                libc::CLOCK_MONOTONIC
            };
            // Validate the expiry before allocating the descriptor.
            expiry_timespec(change.data, change.fflags)?;

            let timerfd = sys::sys_timerfd(clock)?;
            let fd = timerfd.as_raw_fd();
            arm_timerfd(fd, change.data, change.fflags)?;

            let knote = Knote::new(crate::event::EVFILT_TIMER, change, Backing::Fd(timerfd));
            self.notes.insert(knote.clone())?;

            let mut state = knote.lock();
            if state.enabled {
                match agg.register(
                    fd,
                    Source::Knote {
                        filter: crate::event::EVFILT_TIMER,
                        ident,
                    },
                    Interest::read(false),
                ) {
                    Ok(token) => state.token = Some(token),
                    Err(err) => {
                        drop(state);
                        self.notes.remove(ident);
                        return Err(err);
                    }
                }
            }
            return Ok(());
        }

        let knote = self
            .notes
            .get(ident)
            .ok_or_else(|| sys::errno(libc::ENOENT))?;
        let mut state = knote.lock();
        if flags.contains(EventFlags::DISABLE) {
            state.enabled = false;
        } else if flags.contains(EventFlags::ENABLE) {
            state.enabled = true;
        }
        Ok(())
    }

    fn copyout(
        &mut self,
        _agg: &Aggregator,
        wake: &Wake,
        sink: &mut EventSink<'_>,
    ) -> io::Result<()> {
        let Source::Knote { ident, .. } = wake.source else {
            return Ok(());
        };
        let Some(knote) = self.notes.get(ident) else {
            return Ok(());
        };

        let mut state = knote.lock();
        let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) else {
            return Ok(());
        };

        // Consume the expiry unconditionally; a disabled knote must not
        // leave the timerfd readable or the wait would spin on it.
        let expirations = sys::sys_timerfd_expirations(fd);
        if expirations == 0 || !state.enabled || state.delivered {
            return Ok(());
        }

        let mut event = knote.delivery(&state);
        event.data = expirations.min(isize::MAX as u64) as isize;

        if state.flags.contains(EventFlags::ONESHOT) {
            state.delivered = true;
        }
        sink.push(event);
        Ok(())
    }

    fn disable(&mut self, _agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.get(ident) {
            knote.lock().enabled = false;
        }
    }

    fn delete(&mut self, agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.remove(ident) {
            self.release(agg, &knote);
        }
    }

    fn teardown(&mut self, agg: &Aggregator) {
        for knote in self.notes.drain() {
            self.release(agg, &knote);
        }
    }
}
