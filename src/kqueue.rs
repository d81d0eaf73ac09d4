//! The kqueue handle.
//!
//! A [`Kqueue`] owns the aggregator and the filter table and enforces the
//! concurrency rules: filters lock independently, the table itself is
//! immutable after creation, and the wait blocks with no lock held. The
//! handle is cheaply cloneable across threads; the last clone tears every
//! filter down before the aggregator primitive goes.

use crate::dispatch;
use crate::event::KEvent;
use crate::filter::{self, EventFilter};
use crate::poller::Aggregator;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// Shared kqueue state.
pub(crate) struct KqueueInner {
    pub(crate) agg: Aggregator,
    pub(crate) filters: Box<[Mutex<Box<dyn EventFilter>>]>,
    live: AtomicBool,
}

impl KqueueInner {
    pub(crate) fn new() -> io::Result<Self> {
        // First creation validates the platform techniques the filters
        // rely on.
        crate::init::platform_caps();

        Ok(Self {
            agg: Aggregator::new()?,
            filters: filter::filter_table(),
            live: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Marks the kqueue dead and kicks any blocked waiter.
    pub(crate) fn shut_down(&self) {
        self.live.store(false, Ordering::Release);
        self.agg.wake();
    }
}

impl Drop for KqueueInner {
    fn drop(&mut self) {
        // Every knote in every filter goes before the aggregator
        // primitive; the OwnedFd drops inside teardown are the resource
        // releases.
        for slot in self.filters.iter() {
            slot.lock().unwrap().teardown(&self.agg);
        }
    }
}

/// An event-notification handle in the BSD kqueue model.
///
/// Register interest with change events and retrieve readiness with
/// [`kevent`](Self::kevent). Handles may be cloned and used from many
/// threads concurrently.
///
/// ```rust,ignore
/// use kqport::{EventFlags, KEvent, Kqueue, EVFILT_USER, NOTE_TRIGGER};
///
/// let kq = Kqueue::new()?;
/// let add = KEvent::new(1, EVFILT_USER, EventFlags::ADD, 0, 0, 0);
/// kq.kevent(&[add], &mut [], None)?;
///
/// let trigger = KEvent::new(1, EVFILT_USER, EventFlags::empty(), NOTE_TRIGGER, 0, 0);
/// let mut events = [KEvent::default(); 4];
/// let n = kq.kevent(&[trigger], &mut events, None)?;
/// assert_eq!(n, 1);
/// ```
#[derive(Clone)]
pub struct Kqueue {
    inner: Arc<KqueueInner>,
}

impl Kqueue {
    /// Creates an empty kqueue.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(KqueueInner::new()?),
        })
    }

    /// Applies `changes`, then waits up to `timeout` for readiness and
    /// fills `events`; returns the number of events written.
    ///
    /// `None` blocks indefinitely, `Some(Duration::ZERO)` polls. A return
    /// of 0 with a timeout means the timeout elapsed.
    pub fn kevent(
        &self,
        changes: &[KEvent],
        events: &mut [KEvent],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if !self.inner.is_live() {
            return Err(crate::sys::errno(libc::EBADF));
        }
        dispatch::kevent(&self.inner, changes, events, timeout)
    }

    /// Interrupts one blocked [`kevent`](Self::kevent) wait on this
    /// kqueue from another thread. The interrupted call observes either
    /// ready events or an empty timeout-style return; nothing is lost.
    pub fn interrupt(&self) {
        self.inner.agg.wake();
    }

}

#[cfg(unix)]
impl AsRawFd for Kqueue {
    /// The kqueue's own descriptor.
    ///
    /// It polls readable while events are pending, so a kqueue can be
    /// registered inside another event loop (including another kqueue).
    fn as_raw_fd(&self) -> RawFd {
        self.inner.agg.as_raw_fd()
    }
}
