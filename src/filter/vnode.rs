//! Vnode filter backed by one shared `inotify` instance.
//!
//! The ident of a vnode knote is an open descriptor of the watched file;
//! the watch itself is added by path, recovered through `/proc/self/fd`.
//! Native masks translate to the supported subset of the BSD vnode notes.
//! Watches on a vanished inode are dropped by the kernel; the knote
//! reports `NOTE_DELETE` exactly once and disables itself.

use crate::event::{
    EventFlags, KEvent, EVFILT_VNODE, NOTE_ATTRIB, NOTE_DELETE, NOTE_EXTEND, NOTE_LINK,
    NOTE_RENAME, NOTE_REVOKE, NOTE_WRITE,
};
use crate::filter::{EventFilter, EventSink};
use crate::knote::{Backing, Knote, KnoteStore};
use crate::poller::common::{Interest, Source, Wake};
use crate::poller::Aggregator;
use crate::sys;

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub(crate) struct VnodeFilter {
    notes: KnoteStore,

    /// Shared inotify instance, created with the first knote.
    ifd: Option<OwnedFd>,

    /// Aggregator token of the shared descriptor.
    token: Option<usize>,

    /// Watch descriptor to knote ident.
    watches: HashMap<i32, u64>,
}

/// Translates subscribed vnode notes into an inotify mask.
///
/// Deletion is always watched so the vanish-once contract holds even for
/// knotes that did not subscribe to it.
fn inotify_mask(fflags: u32) -> u32 {
    let mut mask = libc::IN_DELETE_SELF;
    if fflags & (NOTE_WRITE | NOTE_EXTEND) != 0 {
        mask |= libc::IN_MODIFY;
    }
    if fflags & (NOTE_ATTRIB | NOTE_LINK) != 0 {
        mask |= libc::IN_ATTRIB;
    }
    if fflags & NOTE_RENAME != 0 {
        mask |= libc::IN_MOVE_SELF;
    }
    if fflags & NOTE_REVOKE != 0 {
        mask |= libc::IN_UNMOUNT;
    }
    mask
}

/// Translates one native mask back into vnode notes.
fn vnode_notes(mask: u32) -> u32 {
    let mut notes = 0;
    if mask & libc::IN_MODIFY != 0 {
        notes |= NOTE_WRITE | NOTE_EXTEND;
    }
    if mask & libc::IN_ATTRIB != 0 {
        notes |= NOTE_ATTRIB | NOTE_LINK;
    }
    if mask & libc::IN_MOVE_SELF != 0 {
        notes |= NOTE_RENAME;
    }
    if mask & (libc::IN_DELETE_SELF | libc::IN_IGNORED) != 0 {
        notes |= NOTE_DELETE;
    }
    if mask & libc::IN_UNMOUNT != 0 {
        notes |= NOTE_REVOKE;
    }
    notes
}

impl VnodeFilter {
    pub(crate) fn new() -> Self {
        Self {
            notes: KnoteStore::new(),
            ifd: None,
            token: None,
            watches: HashMap::new(),
        }
    }

    fn ensure_inotify(&mut self, agg: &Aggregator) -> io::Result<RawFd> {
        if let Some(ifd) = &self.ifd {
            return Ok(ifd.as_raw_fd());
        }
        let ifd = sys::sys_inotify()?;
        let token = agg.register(
            ifd.as_raw_fd(),
            Source::Filter {
                filter: EVFILT_VNODE,
            },
            Interest::read(false),
        )?;
        let raw = ifd.as_raw_fd();
        self.ifd = Some(ifd);
        self.token = Some(token);
        Ok(raw)
    }

    /// Removes the watch behind a knote and retires the shared instance
    /// when the last knote goes.
    fn release(&mut self, agg: &Aggregator, knote: &std::sync::Arc<Knote>) {
        let mut state = knote.lock();
        if let Backing::Watch(wd) = mem::replace(&mut state.backing, Backing::None) {
            self.watches.remove(&wd);
            if let Some(ifd) = &self.ifd {
                sys::sys_inotify_unwatch(ifd.as_raw_fd(), wd);
            }
        }
        drop(state);

        if self.notes.is_empty() {
            if let (Some(ifd), Some(token)) = (self.ifd.take(), self.token.take()) {
                agg.deregister(ifd.as_raw_fd(), token);
            }
        }
    }
}

impl EventFilter for VnodeFilter {
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
                let mut state = knote.lock();
                state.flags = flags.behavior();
                state.udata = change.udata;
                state.fflags = change.fflags;
                state.enabled = !flags.contains(EventFlags::DISABLE);
                return Ok(());
            }

            if change.ident > i32::MAX as usize {
                return Err(sys::errno(libc::EBADF));
            }
            let path = sys::sys_fd_path(change.ident as RawFd)?;
            let ifd = self.ensure_inotify(agg)?;
            let wd = sys::sys_inotify_watch(ifd, &path, inotify_mask(change.fflags))?;

            let knote = Knote::new(EVFILT_VNODE, change, Backing::Watch(wd));
            if let Err(err) = self.notes.insert(knote) {
                sys::sys_inotify_unwatch(ifd, wd);
                return Err(err);
            }
            self.watches.insert(wd, ident);
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
        let Some(ifd) = self.ifd.as_ref().map(|f| f.as_raw_fd()) else {
            return Ok(());
        };

        // Drain the instance, crediting translated notes to their knotes
        // in report order.
        let mut fired: Vec<u64> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sys::sys_inotify_read(ifd, &mut buf);
            if n == 0 {
                break;
            }

            let mut offset = 0;
            while offset + mem::size_of::<libc::inotify_event>() <= n {
                let record: libc::inotify_event = unsafe {
                    std::ptr::read_unaligned(buf.as_ptr().add(offset) as *const _)
                };
                offset += mem::size_of::<libc::inotify_event>() + record.len as usize;

                let Some(&ident) = self.watches.get(&record.wd) else {
                    continue;
                };
                let Some(knote) = self.notes.get(ident) else {
                    continue;
                };
                let mut state = knote.lock();
                state.pending |= vnode_notes(record.mask);
                if record.mask & (libc::IN_DELETE_SELF | libc::IN_IGNORED | libc::IN_UNMOUNT) != 0 {
                    // The kernel already dropped the watch.
                    if let Backing::Watch(wd) = state.backing {
                        self.watches.remove(&wd);
                        state.backing = Backing::None;
                    }
                }
                if !fired.contains(&ident) {
                    fired.push(ident);
                }
            }
        }

        for ident in fired {
            let Some(knote) = self.notes.get(ident) else {
                continue;
            };
            let mut state = knote.lock();
            if !state.enabled || state.delivered {
                state.pending = 0;
                continue;
            }

            // Report subscribed notes, plus deletion and revocation which
            // are always observable.
            let reported = state.pending & (state.fflags | NOTE_DELETE | NOTE_REVOKE);
            state.pending = 0;
            if reported == 0 {
                continue;
            }

            let mut event = knote.delivery(&state);
            event.fflags = reported;

            if reported & NOTE_DELETE != 0 {
                // Vanished inode: deliver once, then leave the knote
                // disabled until the caller deletes it.
                state.enabled = false;
            }
            if state.flags.contains(EventFlags::ONESHOT) {
                state.delivered = true;
            }
            if !sink.push(event) {
                state.pending = reported;
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
