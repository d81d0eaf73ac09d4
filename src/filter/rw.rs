//! Read and write filters for file descriptors.
//!
//! One instance serves one direction; the kqueue carries a read instance
//! and a write instance. Each knote is backed by a `dup` of the user's
//! descriptor registered in the outer epoll, which gives `(READ, fd)` and
//! `(WRITE, fd)` distinct epoll identities while observing the same open
//! file description.
//!
//! Level-triggered by default; `EV_CLEAR` selects edge-triggered
//! registration. Peer hang-up comes from the hang-up readiness bits, with
//! the zero-byte peek (validated once at startup) as the fallback.

use crate::event::{EventFlags, KEvent, EVFILT_READ};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Interest, Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

pub(crate) struct RwFilter {
    filter: i16,
    notes: KnoteStore,
}

impl RwFilter {
    pub(crate) fn new(filter: i16) -> Self {
        Self {
            filter,
            notes: KnoteStore::new(),
        }
    }

    fn interest(&self, edge: bool) -> Interest {
        if self.filter == EVFILT_READ {
            Interest::read(edge)
        } else {
            Interest::write(edge)
        }
    }

    /// Registers the backing descriptor with the aggregator.
    fn arm(&self, agg: &Aggregator, knote: &Arc<Knote>) -> io::Result<()> {
        let mut state = knote.lock();
        if state.token.is_some() {
            return Ok(());
        }
        let fd = state
            .backing
            .fd()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| sys::errno(libc::EBADF))?;
        let edge = state.flags.contains(EventFlags::CLEAR);
        let token = agg.register(
            fd,
            Source::Knote {
                filter: self.filter,
                ident: knote.ident,
            },
            self.interest(edge),
        )?;
        state.token = Some(token);
        Ok(())
    }

    /// Withdraws the backing descriptor from the aggregator.
    fn disarm(&self, agg: &Aggregator, knote: &Arc<Knote>) {
        let mut state = knote.lock();
        if let (Some(token), Some(fd)) = (state.token.take(), state.backing.fd().map(|f| f.as_raw_fd())) {
            agg.deregister(fd, token);
        }
    }

    /// Disarms and releases the backing resource.
    fn release(&self, agg: &Aggregator, knote: &Arc<Knote>) {
        self.disarm(agg, knote);
        knote.lock().backing = Backing::None;
    }
}

impl EventFilter for RwFilter {
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
                // Re-ADD merges with the existing registration.
                {
                    let mut state = knote.lock();
                    state.flags = flags.behavior();
                    state.fflags = change.fflags;
                    state.udata = change.udata;
                    state.delivered = false;
                }
                if flags.contains(EventFlags::DISABLE) {
                    knote.lock().enabled = false;
                    self.disarm(agg, &knote);
                } else {
                    knote.lock().enabled = true;
                    self.arm(agg, &knote)?;
                }
                return Ok(());
            }

            if change.ident > i32::MAX as usize {
                return Err(sys::errno(libc::EBADF));
            }
            let dup = sys::sys_dup_cloexec(change.ident as RawFd)?;
            let knote = Knote::new(self.filter, change, Backing::Fd(dup));
            self.notes.insert(knote.clone())?;
            if knote.lock().enabled {
                if let Err(err) = self.arm(agg, &knote) {
                    self.notes.remove(ident);
                    self.release(agg, &knote);
                    return Err(err);
                }
            }
            return Ok(());
        }

        let knote = self
            .notes
            .get(ident)
            .ok_or_else(|| sys::errno(libc::ENOENT))?;
        if flags.contains(EventFlags::DISABLE) {
            knote.lock().enabled = false;
            self.disarm(agg, &knote);
        } else if flags.contains(EventFlags::ENABLE) {
            knote.lock().enabled = true;
            self.arm(agg, &knote)?;
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
            log::debug!("wake for vanished knote ({}, {ident}), discarding", self.filter);
            return Ok(());
        };

        let mut state = knote.lock();
        if !state.enabled || state.delivered {
            return Ok(());
        }
        let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) else {
            return Ok(());
        };

        let mut event = knote.delivery(&state);
        if self.filter == EVFILT_READ {
            let mut eof = wake.hup || wake.error;
            if !eof && wake.readable && crate::init::platform_caps().peek_detects_close {
                eof = sys::sys_peek_eof(fd);
            }
            if !wake.readable && !eof {
                return Ok(());
            }
            event.data = sys::sys_readable_bytes(fd);
            if eof {
                event.flags |= EventFlags::EOF.bits();
            }
        } else {
            let hup = wake.hup || wake.error;
            if !wake.writable && !hup {
                return Ok(());
            }
            event.data = sys::sys_send_space(fd);
            if hup {
                event.flags |= EventFlags::EOF.bits();
            }
        }

        if state.flags.contains(EventFlags::ONESHOT) {
            state.delivered = true;
        }
        sink.push(event);
        Ok(())
    }

    fn disable(&mut self, agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.get(ident) {
            knote.lock().enabled = false;
            self.disarm(agg, &knote);
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
