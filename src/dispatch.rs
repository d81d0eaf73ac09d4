//! The `kevent` entry point: change, wait, and copyout phases.
//!
//! A single call applies the change list in order, optionally blocks on
//! the aggregator, and translates native readiness into the caller's
//! event list. The three phases run back to back on the calling thread;
//! no lock is held across the blocking wait.

use crate::event::{filter_slot, EventFlags, KEvent};
use crate::filter::EventSink;
use crate::kqueue::KqueueInner;
use crate::poller::common::Wake;
use crate::sys;

use std::io;
use std::time::{Duration, Instant};

/// Applies `changes`, waits up to `timeout`, and fills `events`.
///
/// Returns the number of events written. Receipt and error events from
/// the change phase occupy their natural positions ahead of any readiness
/// events; a change that fails without room for an error event aborts the
/// call with the residual changes unapplied.
pub(crate) fn kevent(
    kq: &KqueueInner,
    changes: &[KEvent],
    events: &mut [KEvent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut sink = EventSink::new(events);

    // Change phase: strictly in submission order. Each change routes to
    // its filter under that filter's lock.
    for change in changes {
        let flags = change.event_flags();
        let result = match filter_slot(change.filter) {
            Some(slot) => {
                let mut filter = kq.filters[slot].lock().unwrap();
                filter.apply(&kq.agg, change)
            }
            None => Err(sys::errno(libc::EINVAL)),
        };

        match result {
            Ok(()) => {
                if flags.contains(EventFlags::RECEIPT) {
                    if !sink.push(KEvent::receipt(change, 0)) {
                        return Err(sys::errno(libc::EINVAL));
                    }
                }
            }
            Err(err) => {
                let code = err.raw_os_error().unwrap_or(libc::EINVAL);
                log::debug!(
                    "change ({}, {}) failed: {err}",
                    change.filter,
                    change.ident
                );
                // With receipt semantics or room in the event list the
                // failure is reported in-band and processing continues;
                // otherwise it aborts the call here, leaving the residual
                // changes unapplied.
                let in_band = flags.contains(EventFlags::RECEIPT) || !sink.slots_empty();
                if !in_band || !sink.push(KEvent::receipt(change, code)) {
                    return Err(err);
                }
            }
        }
    }

    // Wait phase: skipped when the caller asked for no events, when the
    // list is already full, or when the change phase produced receipt or
    // error events (those are returned promptly, as the BSD call does).
    if sink.len() > 0 || sink.is_full() || sink.slots_empty() {
        return Ok(sink.len());
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut wakes: Vec<Wake> = Vec::new();

    loop {
        if !kq.is_live() {
            return Err(sys::errno(libc::EBADF));
        }

        let remaining =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        let woken = kq.agg.wait(&mut wakes, remaining)?;

        if wakes.is_empty() {
            if woken {
                // A caller-initiated interruption ends the wait; an
                // unrelated signal would have resumed it instead.
                if !kq.is_live() {
                    return Err(sys::errno(libc::EBADF));
                }
                return Ok(sink.len());
            }
            // Timeout or only stale tokens; resume with the remaining
            // time if the clock allows.
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(sink.len()),
                _ => continue,
            }
        }

        // Copyout phase: translate each wake under its filter's lock and
        // honor the post-delivery flags while still holding it.
        for wake in &wakes {
            if sink.is_full() {
                break;
            }
            let Some(slot) = filter_slot(wake.source.filter()) else {
                continue;
            };

            let mut filter = kq.filters[slot].lock().unwrap();
            let before = sink.len();
            filter.copyout(&kq.agg, wake, &mut sink)?;

            let produced: Vec<KEvent> = sink.since(before).to_vec();
            for event in produced {
                let flags = EventFlags::from_bits_retain(event.flags);
                if flags.contains(EventFlags::DISPATCH) {
                    filter.disable(&kq.agg, event.ident as u64);
                }
                if flags.contains(EventFlags::ONESHOT) {
                    filter.delete(&kq.agg, event.ident as u64);
                }
            }
        }

        if sink.len() > 0 {
            return Ok(sink.len());
        }

        // All wakes suppressed: re-enter the wait if the clock allows.
        match deadline {
            Some(deadline) if Instant::now() >= deadline => return Ok(0),
            _ => continue,
        }
    }
}
