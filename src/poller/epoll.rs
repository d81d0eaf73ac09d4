//! Linux `epoll`-based aggregator.
//!
//! The outer epoll instance is the kqueue's own readiness primitive: every
//! filter registers its inner descriptors here, and one `epoll_wait` call
//! observes the union of all armed knotes. The epoll descriptor doubles as
//! the public kqueue descriptor, so a kqueue is itself pollable (readable
//! whenever events are pending) and can be registered in another event
//! loop.
//!
//! Responsibilities:
//! - Register inner descriptors with read/write interests
//! - Block waiting for readiness with the caller's timeout
//! - Resolve readiness tokens back to `(filter, ident)` sources
//! - Wake a blocked wait when another thread asks for attention

use crate::poller::common::{Interest, Source, Wake};
use crate::utils::Slab;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

/// Reserved token for the cross-thread wake descriptor.
///
/// Slab tokens are small indices, so `u64::MAX` can never collide with a
/// knote registration.
const WAKE_TOKEN: u64 = u64::MAX;

/// Size of the stack-local readiness batch per wait.
const WAIT_BATCH: usize = 64;

/// Per-kqueue epoll aggregator.
///
/// Owns the epoll instance, the wake `eventfd`, and the token slab. All
/// methods take `&self`; the slab is the only mutable state and carries its
/// own lock, so multiple threads may register and wait concurrently.
pub(crate) struct Aggregator {
    epoll: OwnedFd,
    waker: OwnedFd,
    tokens: Mutex<Slab<Source>>,
}

impl Aggregator {
    /// Creates the epoll instance and wires up the wake descriptor.
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let waker = crate::sys::sys_eventfd()?;

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let rc = unsafe {
            epoll_ctl(
                epoll.as_raw_fd(),
                EPOLL_CTL_ADD,
                waker.as_raw_fd(),
                &mut event,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            waker,
            tokens: Mutex::new(Slab::with_capacity(WAIT_BATCH)),
        })
    }

    /// The outer descriptor, which is also the public kqueue descriptor.
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Interrupts a blocked [`wait`](Self::wait) from another thread.
    ///
    /// The wake descriptor never maps to a knote, so an interrupted wait
    /// reports no events.
    pub(crate) fn wake(&self) {
        crate::sys::sys_eventfd_signal(self.waker.as_raw_fd());
    }

    /// Registers an inner descriptor and returns its readiness token.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        source: Source,
        interest: Interest,
    ) -> io::Result<usize> {
        let token = self.tokens.lock().unwrap().insert(source);

        let mut event = epoll_event {
            events: event_bits(interest),
            u64: token as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            self.tokens.lock().unwrap().remove(token);
            return Err(err);
        }

        Ok(token)
    }

    /// Updates the interests of an already registered descriptor.
    pub(crate) fn update(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: event_bits(interest),
            u64: token as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_MOD, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Removes an inner descriptor and frees its token.
    ///
    /// The kernel may have dropped the registration already (the backing
    /// descriptor closed underneath us), so the control call is best
    /// effort; freeing the token is what makes later reports stale.
    pub(crate) fn deregister(&self, fd: RawFd, token: usize) {
        unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            );
        }
        self.tokens.lock().unwrap().remove(token);
    }

    /// Blocks until readiness, wake, or timeout; fills `wakes`.
    ///
    /// Returns `true` when the explicit wake descriptor fired. An empty
    /// `wakes` otherwise means the timeout elapsed, an unrelated signal
    /// interrupted the sleep, or every reported token was stale; the
    /// caller owns the remaining-timeout bookkeeping.
    pub(crate) fn wait(&self, wakes: &mut Vec<Wake>, timeout: Option<Duration>) -> io::Result<bool> {
        wakes.clear();

        // Scratch lives on the waiting thread's stack; nothing outlives
        // the call.
        let mut batch: [epoll_event; WAIT_BATCH] = unsafe { std::mem::zeroed() };

        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                batch.as_mut_ptr(),
                WAIT_BATCH as i32,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        let mut woken = false;
        let tokens = self.tokens.lock().unwrap();
        for ev in &batch[..n as usize] {
            if ev.u64 == WAKE_TOKEN {
                crate::sys::sys_eventfd_drain(self.waker.as_raw_fd());
                woken = true;
                continue;
            }

            let token = ev.u64;
            let Some(source) = tokens.get(token as usize) else {
                log::debug!("stale readiness token {}, discarding", token);
                continue;
            };

            wakes.push(Wake {
                source: *source,
                readable: ev.events & (EPOLLIN as u32) != 0,
                writable: ev.events & (EPOLLOUT as u32) != 0,
                hup: ev.events & ((EPOLLHUP | EPOLLRDHUP) as u32) != 0,
                error: ev.events & (EPOLLERR as u32) != 0,
            });
        }

        Ok(woken)
    }
}

fn event_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.read {
        bits |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.write {
        bits |= EPOLLOUT;
    }
    if interest.edge {
        bits |= EPOLLET;
    }
    bits as u32
}

/// Converts the caller's timeout to epoll milliseconds.
///
/// Sub-millisecond remainders round up so a nearly-elapsed deadline cannot
/// busy-loop at zero.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if t.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_interrupts_without_reporting_events() {
        let agg = Aggregator::new().expect("aggregator");
        agg.wake();

        let mut wakes = Vec::new();
        agg.wait(&mut wakes, Some(Duration::from_secs(1)))
            .expect("wait");
        assert!(wakes.is_empty(), "wake must not surface as an event");
    }

    #[test]
    fn timeout_returns_empty() {
        let agg = Aggregator::new().expect("aggregator");
        let mut wakes = Vec::new();
        agg.wait(&mut wakes, Some(Duration::from_millis(10)))
            .expect("wait");
        assert!(wakes.is_empty());
    }

    #[test]
    fn registered_descriptor_reports_through_its_token() {
        let agg = Aggregator::new().expect("aggregator");
        let (a, b) = crate::sys::sys_socketpair().expect("socketpair");

        let source = Source::Knote {
            filter: crate::event::EVFILT_READ,
            ident: crate::sys::raw(&a) as u64,
        };
        let token = agg
            .register(crate::sys::raw(&a), source, Interest::read(false))
            .expect("register");

        use std::io::Write;
        let mut peer = std::fs::File::from(b);
        peer.write_all(b"x").expect("write");

        let mut wakes = Vec::new();
        agg.wait(&mut wakes, Some(Duration::from_secs(1)))
            .expect("wait");
        assert_eq!(wakes.len(), 1);
        assert_eq!(wakes[0].source, source);
        assert!(wakes[0].readable);

        agg.deregister(crate::sys::raw(&a), token);
    }
}
