//! Timer filter: accuracy, expiration counting, units, oneshot.

use kqport::{EventFlags, KEvent, Kqueue, EVFILT_TIMER, NOTE_SECONDS, NOTE_USECONDS};
use std::time::{Duration, Instant};

/// A oneshot timer fires once no earlier than its period, then is gone.
#[test]
fn oneshot_timer_fires_once_then_disappears() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(
        7,
        EVFILT_TIMER,
        EventFlags::ADD | EventFlags::ONESHOT,
        0,
        50,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add timer");

    let start = Instant::now();
    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(2)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, 7);
    assert!(events[0].data >= 1, "at least one expiration is reported");
    assert!(
        start.elapsed() >= Duration::from_millis(50),
        "a timer must not fire early"
    );

    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(200)))
        .expect("second wait");
    assert_eq!(n, 0, "a oneshot timer never fires twice");

    let delete = KEvent::new(7, EVFILT_TIMER, EventFlags::DELETE, 0, 0, 0);
    let err = kq
        .kevent(&[delete], &mut [], None)
        .expect_err("the oneshot knote deleted itself");
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

/// A periodic timer coalesces missed periods into the expiration count.
#[test]
fn periodic_timer_reports_expiration_count() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(1, EVFILT_TIMER, EventFlags::ADD, 0, 10, 0);
    kq.kevent(&[add], &mut [], None).expect("add timer");

    // Sleep through several periods before collecting.
    std::thread::sleep(Duration::from_millis(55));

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    assert!(
        events[0].data >= 3,
        "missed periods coalesce into data (got {})",
        events[0].data
    );
}

#[test]
fn units_select_the_period_scale() {
    let kq = Kqueue::new().expect("kqueue");

    // 20000 microseconds.
    let add = KEvent::new(2, EVFILT_TIMER, EventFlags::ADD, NOTE_USECONDS, 20_000, 0);
    kq.kevent(&[add], &mut [], None).expect("add");

    let start = Instant::now();
    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(20) && elapsed < Duration::from_millis(500),
        "a 20 ms period in microsecond units, elapsed {elapsed:?}"
    );

    // A one-second timer must not fire within a short poll window.
    let add = KEvent::new(3, EVFILT_TIMER, EventFlags::ADD, NOTE_SECONDS, 1, 0);
    kq.kevent(&[add], &mut [], None).expect("add seconds timer");
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(50)))
        .expect("poll");
    // The microsecond timer keeps firing; only the seconds timer must
    // stay quiet.
    for event in &events[..n] {
        assert_ne!(event.ident, 3, "a 1 s timer cannot fire in 50 ms");
    }
}

#[test]
fn negative_period_is_rejected() {
    let kq = Kqueue::new().expect("kqueue");

    let add = KEvent::new(4, EVFILT_TIMER, EventFlags::ADD, 0, -5, 0);
    let err = kq
        .kevent(&[add], &mut [], None)
        .expect_err("negative period must fail");
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

/// Re-adding a timer restarts it with the new period.
#[test]
fn re_add_restarts_the_timer() {
    let kq = Kqueue::new().expect("kqueue");

    let slow = KEvent::new(5, EVFILT_TIMER, EventFlags::ADD, NOTE_SECONDS, 30, 0);
    kq.kevent(&[slow], &mut [], None).expect("add slow timer");

    let fast = KEvent::new(5, EVFILT_TIMER, EventFlags::ADD, 0, 20, 0);
    kq.kevent(&[fast], &mut [], None).expect("re-add fast");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1, "the restarted timer fires on the new period");
    assert_eq!(events[0].ident, 5);
}
