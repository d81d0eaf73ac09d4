//! Process filter, best effort.
//!
//! Supports `NOTE_EXIT` through a per-knote pidfd, which polls readable
//! once the process is gone. The exit status is recovered without reaping
//! so the caller's own child bookkeeping is undisturbed. The richer BSD
//! sub-notes (fork tracking, exec) have no portable counterpart here and
//! are rejected as unsupported.

use crate::event::{EventFlags, KEvent, EVFILT_PROC, NOTE_EXIT};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Interest, Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

pub(crate) struct ProcFilter {
    notes: KnoteStore,
}

impl ProcFilter {
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

impl EventFilter for ProcFilter {
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
            if change.fflags & !NOTE_EXIT != 0 || change.fflags == 0 {
                return Err(sys::errno(libc::EINVAL));
            }
            if let Some(knote) = self.notes.get(ident) {
                let mut state = knote.lock();
                state.flags = flags.behavior();
                state.udata = change.udata;
                state.enabled = !flags.contains(EventFlags::DISABLE);
                return Ok(());
            }

            if change.ident > u32::MAX as usize {
                return Err(sys::errno(libc::ESRCH));
            }
            let pidfd = sys::sys_pidfd_open(change.ident as u32)?;
            let fd = pidfd.as_raw_fd();
            let knote = Knote::new(EVFILT_PROC, change, Backing::Fd(pidfd));
            self.notes.insert(knote.clone())?;

            let mut state = knote.lock();
            if state.enabled {
                match agg.register(
                    fd,
                    Source::Knote {
                        filter: EVFILT_PROC,
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
        if flags.contains(EventFlags::DISABLE) {
            self.disable(agg, ident);
        } else if flags.contains(EventFlags::ENABLE) {
            let mut state = knote.lock();
            state.enabled = true;
            if state.token.is_none() {
                if let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) {
                    state.token = Some(agg.register(
                        fd,
                        Source::Knote {
                            filter: EVFILT_PROC,
                            ident,
                        },
                        Interest::read(false),
                    )?);
                }
            }
        }
        Ok(())
    }

    fn copyout(
        &mut self,
        agg: &Aggregator,
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
        if !state.enabled || state.delivered {
            return Ok(());
        }
        let Some(fd) = state.backing.fd().map(|f| f.as_raw_fd()) else {
            return Ok(());
        };

        let mut event = knote.delivery(&state);
        event.fflags = NOTE_EXIT;
        event.data = sys::sys_pidfd_exit_status(fd).unwrap_or(0) as isize;

        // A pidfd stays readable forever once the process is gone; the
        // exit is delivered once and the knote parks disabled.
        state.enabled = false;
        if let Some(token) = state.token.take() {
            agg.deregister(fd, token);
        }
        if state.flags.contains(EventFlags::ONESHOT) {
            state.delivered = true;
        }
        sink.push(event);
        Ok(())
    }

    fn disable(&mut self, agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.get(ident) {
            let mut state = knote.lock();
            state.enabled = false;
            if let (Some(token), Some(fd)) =
                (state.token.take(), state.backing.fd().map(|f| f.as_raw_fd()))
            {
                agg.deregister(fd, token);
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
