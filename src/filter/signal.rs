//! Signal filter backed by one shared `signalfd`.
//!
//! All signal knotes of a kqueue read from a single `signalfd` whose mask
//! is rebuilt whenever the subscribed set changes. Each subscribed signal
//! is blocked in the registering thread for as long as its knote lives,
//! because `signalfd` only observes signals normal delivery cannot claim.
//!
//! Deliveries are coalesced per knote: a level-triggered knote reports the
//! cumulative delivery count, an `EV_CLEAR` knote reports the count since
//! its previous delivery and resets.

use crate::event::{EventFlags, KEvent, EVFILT_SIGNAL};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Interest, Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

pub(crate) struct SignalFilter {
    notes: KnoteStore,

    /// Shared signalfd, created with the first knote and closed with the
    /// last.
    sfd: Option<OwnedFd>,

    /// Aggregator token of the shared descriptor.
    token: Option<usize>,

    /// Subscribed signal numbers, the source of the signalfd mask.
    signos: Vec<i32>,
}

impl SignalFilter {
    pub(crate) fn new() -> Self {
        Self {
            notes: KnoteStore::new(),
            sfd: None,
            token: None,
            signos: Vec::new(),
        }
    }

    /// Rebuilds the signalfd mask from the subscribed set, creating or
    /// retiring the descriptor at the edges.
    fn sync_mask(&mut self, agg: &Aggregator) -> io::Result<()> {
        if self.signos.is_empty() {
            if let Some(sfd) = self.sfd.take() {
                if let Some(token) = self.token.take() {
                    agg.deregister(sfd.as_raw_fd(), token);
                }
            }
            return Ok(());
        }

        let mask = sys::sys_sigset(&self.signos);
        match &self.sfd {
            Some(sfd) => sys::sys_signalfd_update(sfd.as_raw_fd(), &mask),
            None => {
                let sfd = sys::sys_signalfd(&mask)?;
                let token = agg.register(
                    sfd.as_raw_fd(),
                    Source::Filter {
                        filter: EVFILT_SIGNAL,
                    },
                    Interest::read(false),
                )?;
                self.sfd = Some(sfd);
                self.token = Some(token);
                Ok(())
            }
        }
    }
}

impl EventFilter for SignalFilter {
    fn apply(&mut self, agg: &Aggregator, change: &KEvent) -> io::Result<()> {
        let flags = change.event_flags();
        let ident = change.ident as u64;
        let signo = change.ident as i32;

        if flags.contains(EventFlags::DELETE) {
            self.notes
                .remove(ident)
                .ok_or_else(|| sys::errno(libc::ENOENT))?;
            self.signos.retain(|&s| s != signo);
            self.sync_mask(agg)?;
            let _ = sys::sys_sigmask(false, signo);
            return Ok(());
        }

        if flags.contains(EventFlags::ADD) {
            if change.ident == 0 || change.ident > libc::SIGRTMAX() as usize {
                return Err(sys::errno(libc::EINVAL));
            }

            if let Some(knote) = self.notes.get(ident) {
                let mut state = knote.lock();
                state.flags = flags.behavior();
                state.udata = change.udata;
                if flags.contains(EventFlags::DISABLE) {
                    state.enabled = false;
                } else {
                    state.enabled = true;
                }
                return Ok(());
            }

            let knote = Knote::new(EVFILT_SIGNAL, change, Backing::Signal);
            self.notes.insert(knote)?;
            self.signos.push(signo);
            sys::sys_sigmask(true, signo)?;
            if let Err(err) = self.sync_mask(agg) {
                self.notes.remove(ident);
                self.signos.retain(|&s| s != signo);
                let _ = sys::sys_sigmask(false, signo);
                return Err(err);
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
        if !matches!(wake.source, Source::Filter { .. }) {
            return Ok(());
        }
        let Some(sfd) = self.sfd.as_ref().map(|f| f.as_raw_fd()) else {
            return Ok(());
        };

        // Drain the shared descriptor first, crediting each delivery to
        // its knote; the kernel reports them in delivery order.
        let mut fired: Vec<u64> = Vec::new();
        while let Some(signo) = sys::sys_signalfd_next(sfd) {
            let ident = signo as u64;
            let Some(knote) = self.notes.get(ident) else {
                log::debug!("signal {signo} delivered without a knote, discarding");
                continue;
            };
            let mut state = knote.lock();
            state.counter += 1;
            state.pending = 1;
            if !fired.contains(&ident) {
                fired.push(ident);
            }
        }

        for ident in fired {
            let Some(knote) = self.notes.get(ident) else {
                continue;
            };
            let mut state = knote.lock();
            if !state.enabled || state.delivered || state.pending == 0 {
                continue;
            }

            let mut event = knote.delivery(&state);
            event.data = state.counter.min(isize::MAX as u64) as isize;
            state.pending = 0;
            if state.flags.contains(EventFlags::CLEAR) {
                state.counter = 0;
            }
            if state.flags.contains(EventFlags::ONESHOT) {
                state.delivered = true;
            }

            if !sink.push(event) {
                // List full; the counts survive for the next wait.
                state.pending = 1;
                break;
            }
        }
        Ok(())
    }

    fn disable(&mut self, _agg: &Aggregator, ident: u64) {
        if let Some(knote) = self.notes.get(ident) {
            knote.lock().enabled = false;
        }
    }

    fn delete(&mut self, agg: &Aggregator, ident: u64) {
        if self.notes.remove(ident).is_some() {
            self.signos.retain(|&s| s != ident as i32);
            let _ = self.sync_mask(agg);
            let _ = sys::sys_sigmask(false, ident as i32);
        }
    }

    fn teardown(&mut self, agg: &Aggregator) {
        for knote in self.notes.drain() {
            let _ = sys::sys_sigmask(false, knote.ident as i32);
        }
        self.signos.clear();
        let _ = self.sync_mask(agg);
    }
}
