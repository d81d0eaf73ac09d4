//! User-triggered events: the trigger, the fflags combine protocol, and
//! the delivery-behavior flags.

use kqport::{
    EventFlags, KEvent, Kqueue, EVFILT_USER, NOTE_FFAND, NOTE_FFCOPY, NOTE_FFLAGSMASK, NOTE_FFOR,
    NOTE_TRIGGER,
};
use std::time::Duration;

fn trigger(ident: usize) -> KEvent {
    KEvent::new(ident, EVFILT_USER, EventFlags::empty(), NOTE_TRIGGER, 0, 0)
}

/// Register, trigger, collect, and observe that a cleared knote stays
/// quiet until triggered again.
#[test]
fn trigger_fires_once_with_clear() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(
        42,
        EVFILT_USER,
        EventFlags::ADD | EventFlags::CLEAR,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add user knote");

    kq.kevent(&[trigger(42)], &mut [], None).expect("trigger");

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, 42);
    assert_eq!(events[0].filter, EVFILT_USER);

    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .expect("second wait");
    assert_eq!(n, 0, "a cleared trigger must not redeliver");
}

/// Without CLEAR the triggered state is level: every wait reports it.
#[test]
fn triggered_state_is_level_without_clear() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(7, EVFILT_USER, EventFlags::ADD, 0, 0, 0);
    kq.kevent(&[add], &mut [], None).expect("add user knote");
    kq.kevent(&[trigger(7)], &mut [], None).expect("trigger");

    let mut events = [KEvent::default(); 1];
    for _ in 0..2 {
        let n = kq
            .kevent(&[], &mut events, Some(Duration::from_secs(1)))
            .expect("wait");
        assert_eq!(n, 1, "an uncleared trigger keeps reporting");
    }
}

#[test]
fn fflags_combine_protocol() {
    let kq = Kqueue::new().expect("kqueue");

    // Creation stores the payload bits raw.
    let add = KEvent::new(1, EVFILT_USER, EventFlags::ADD | EventFlags::CLEAR, 0x3, 0, 0);
    kq.kevent(&[add], &mut [], None).expect("add");

    // FFOR unions into the stored value.
    let or = KEvent::new(
        1,
        EVFILT_USER,
        EventFlags::empty(),
        NOTE_FFOR | 0x4 | NOTE_TRIGGER,
        0,
        0,
    );
    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[or], &mut events, Some(Duration::from_secs(1)))
        .expect("or-trigger");
    assert_eq!(n, 1);
    assert_eq!(events[0].fflags & NOTE_FFLAGSMASK, 0x7);

    // FFAND intersects.
    let and = KEvent::new(
        1,
        EVFILT_USER,
        EventFlags::empty(),
        NOTE_FFAND | 0x5 | NOTE_TRIGGER,
        0,
        0,
    );
    let n = kq
        .kevent(&[and], &mut events, Some(Duration::from_secs(1)))
        .expect("and-trigger");
    assert_eq!(n, 1);
    assert_eq!(events[0].fflags & NOTE_FFLAGSMASK, 0x5);

    // FFCOPY replaces.
    let copy = KEvent::new(
        1,
        EVFILT_USER,
        EventFlags::empty(),
        NOTE_FFCOPY | 0x40 | NOTE_TRIGGER,
        0,
        0,
    );
    let n = kq
        .kevent(&[copy], &mut events, Some(Duration::from_secs(1)))
        .expect("copy-trigger");
    assert_eq!(n, 1);
    assert_eq!(events[0].fflags & NOTE_FFLAGSMASK, 0x40);
}

/// A oneshot user knote delivers once across the kqueue lifetime.
#[test]
fn oneshot_delivers_at_most_once() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(
        3,
        EVFILT_USER,
        EventFlags::ADD | EventFlags::ONESHOT,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add");
    kq.kevent(&[trigger(3)], &mut [], None).expect("trigger");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);

    // The knote deleted itself; a re-trigger has nothing to hit.
    let err = kq
        .kevent(&[trigger(3)], &mut [], None)
        .expect_err("oneshot knote must be gone after delivery");
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

/// DISPATCH disables after each delivery until explicitly re-enabled.
#[test]
fn dispatch_disables_until_reenabled() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(
        8,
        EVFILT_USER,
        EventFlags::ADD | EventFlags::DISPATCH,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add");
    kq.kevent(&[trigger(8)], &mut [], None).expect("trigger");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("first wait");
    assert_eq!(n, 1);

    kq.kevent(&[trigger(8)], &mut [], None).expect("re-trigger");
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .expect("disabled wait");
    assert_eq!(n, 0, "dispatch left the knote disabled");

    let enable = KEvent::new(8, EVFILT_USER, EventFlags::ENABLE, 0, 0, 0);
    let n = kq
        .kevent(&[enable], &mut events, Some(Duration::from_secs(1)))
        .expect("enabled wait");
    assert_eq!(n, 1, "re-enabling delivers the pending trigger");
}
