//! User-triggered events.
//!
//! A user knote has no external readiness source: it fires when a change
//! event on the same ident carries `NOTE_TRIGGER`. On Linux each knote
//! owns an `eventfd` registered in the outer epoll so a trigger wakes a
//! blocked wait; on Windows a trigger posts a completion packet instead.
//!
//! The low 24 bits of `fflags` are user payload, combined on every change
//! according to the control bits: `NOTE_FFAND` intersects, `NOTE_FFOR`
//! unions, `NOTE_FFCOPY` replaces, `NOTE_FFNOP` leaves the stored value
//! alone.

use crate::event::{
    EventFlags, KEvent, EVFILT_USER, NOTE_FFAND, NOTE_FFCOPY, NOTE_FFCTRLMASK, NOTE_FFLAGSMASK,
    NOTE_FFOR, NOTE_TRIGGER,
};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::io;
use std::sync::Arc;

#[cfg(unix)]
use crate::poller::common::Interest;
#[cfg(unix)]
use std::os::fd::AsRawFd;

pub(crate) struct UserFilter {
    notes: KnoteStore,
}

impl UserFilter {
    pub(crate) fn new() -> Self {
        Self {
            notes: KnoteStore::new(),
        }
    }

    fn release(&self, agg: &Aggregator, knote: &Arc<Knote>) {
        let mut state = knote.lock();
        if let Some(token) = state.token.take() {
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                agg.deregister(fd, token);
            }
            #[cfg(not(unix))]
            agg.deregister_posted(token);
        }
        state.backing = Backing::None;
    }

    /// Applies the fflags combine protocol and fires the trigger.
    fn combine(&self, agg: &Aggregator, knote: &Arc<Knote>, fflags: u32) {
        let mut state = knote.lock();

        let payload = fflags & NOTE_FFLAGSMASK;
        match fflags & NOTE_FFCTRLMASK {
            NOTE_FFAND => state.fflags &= payload,
            NOTE_FFOR => state.fflags |= payload,
            NOTE_FFCOPY => state.fflags = payload,
            _ => {}
        }

        if fflags & NOTE_TRIGGER != 0 {
            state.pending = 1;
            state.delivered = false;
            self.assert_ready(agg, &state);
        }
    }

    /// Makes the aggregator observe this knote as ready.
    fn assert_ready(&self, _agg: &Aggregator, state: &crate::knote::KnoteState) {
        #[cfg(unix)]
        if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
            sys::sys_eventfd_signal(fd);
        }
        #[cfg(not(unix))]
        if let Some(token) = state.token {
            _agg.post(token);
        }
    }
}

impl EventFilter for UserFilter {
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

        if flags.contains(EventFlags::ADD) && self.notes.get(ident).is_none() {
            #[cfg(unix)]
            let eventfd = sys::sys_eventfd()?;
            #[cfg(unix)]
            let fd = eventfd.as_raw_fd();
            #[cfg(unix)]
            let backing = Backing::Fd(eventfd);
            #[cfg(not(unix))]
            let backing = Backing::None;

            let knote = Knote::new(EVFILT_USER, change, backing);
            // Creation stores the payload bits raw; the combine protocol
            // applies to later changes only.
            knote.lock().fflags = change.fflags & NOTE_FFLAGSMASK;
            self.notes.insert(knote.clone())?;

            let source = Source::Knote {
                filter: EVFILT_USER,
                ident,
            };
            let mut state = knote.lock();
            #[cfg(unix)]
            {
                match agg.register(fd, source, Interest::read(false)) {
                    Ok(token) => state.token = Some(token),
                    Err(err) => {
                        drop(state);
                        self.notes.remove(ident);
                        return Err(err);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                state.token = Some(agg.register_posted(source));
            }

            if change.fflags & NOTE_TRIGGER != 0 {
                state.pending = 1;
                self.assert_ready(agg, &state);
            }
            return Ok(());
        }

        let knote = self
            .notes
            .get(ident)
            .ok_or_else(|| sys::errno(libc::ENOENT))?;

        {
            let mut state = knote.lock();
            if flags.contains(EventFlags::ADD) {
                state.flags = flags.behavior();
                state.udata = change.udata;
            }
            if flags.contains(EventFlags::DISABLE) {
                state.enabled = false;
            } else if flags.contains(EventFlags::ENABLE) {
                state.enabled = true;
                if state.pending != 0 {
                    // Re-assert readiness consumed while disabled.
                    self.assert_ready(agg, &state);
                }
            }
        }

        self.combine(agg, &knote, change.fflags);
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
        if state.pending == 0 {
            // Trigger raced with a delete-and-readd, or the eventfd was
            // already consumed.
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                sys::sys_eventfd_drain(fd);
            }
            return Ok(());
        }
        if !state.enabled || state.delivered {
            // Consume the readiness so a disabled knote cannot spin the
            // wait; the pending bit survives for a later ENABLE.
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                sys::sys_eventfd_drain(fd);
            }
            return Ok(());
        }

        let mut event = knote.delivery(&state);
        event.fflags = state.fflags & NOTE_FFLAGSMASK;

        if state.flags.contains(EventFlags::CLEAR) {
            state.pending = 0;
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                sys::sys_eventfd_drain(fd);
            }
        }
        // Without CLEAR the knote stays triggered: the eventfd is left
        // readable so the next wait reports it again.

        if state.flags.contains(EventFlags::ONESHOT) {
            state.delivered = true;
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                sys::sys_eventfd_drain(fd);
            }
        }
        sink.push(event);
        Ok(())
    }

    fn disable(&mut self, _agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.get(ident) {
            let mut state = knote.lock();
            state.enabled = false;
            // Consume readiness so the dispatch-disabled knote rests.
            #[cfg(unix)]
            if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                sys::sys_eventfd_drain(fd);
            }
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
