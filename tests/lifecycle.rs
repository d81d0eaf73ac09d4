//! Resource lifecycle closure, kept as the only test in this binary so
//! concurrent tests cannot perturb the process descriptor counts.

use kqport::{EventFlags, KEvent, Kqueue, EVFILT_TIMER};

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("proc fd dir")
        .count()
}

/// The backing OS resource of a knote is open exactly while the knote
/// exists, and closing the kqueue releases everything.
#[test]
fn resources_track_knote_lifetime() {
    let _ = env_logger::builder().is_test(true).try_init();

    let before_kqueue = open_fd_count();

    let kq = Kqueue::new().expect("kqueue");
    let with_kqueue = open_fd_count();
    assert!(
        with_kqueue > before_kqueue,
        "a kqueue must hold at least its own descriptors"
    );

    // ADD allocates the backing timerfd.
    let add = KEvent::new(7, EVFILT_TIMER, EventFlags::ADD, 0, 10_000, 0);
    kq.kevent(&[add], &mut [], None).expect("add timer");
    assert_eq!(
        open_fd_count(),
        with_kqueue + 1,
        "an armed timer knote owns one descriptor"
    );

    // DISABLE keeps the registration and its resource.
    let disable = KEvent::new(7, EVFILT_TIMER, EventFlags::DISABLE, 0, 0, 0);
    kq.kevent(&[disable], &mut [], None).expect("disable timer");
    assert_eq!(
        open_fd_count(),
        with_kqueue + 1,
        "disable must not release the resource"
    );

    let enable = KEvent::new(7, EVFILT_TIMER, EventFlags::ENABLE, 0, 0, 0);
    kq.kevent(&[enable], &mut [], None).expect("enable timer");

    // DELETE releases the resource.
    let delete = KEvent::new(7, EVFILT_TIMER, EventFlags::DELETE, 0, 0, 0);
    kq.kevent(&[delete], &mut [], None).expect("delete timer");
    assert_eq!(
        open_fd_count(),
        with_kqueue,
        "delete must release the backing descriptor"
    );

    // A second delete has nothing to find.
    let err = kq
        .kevent(&[delete], &mut [], None)
        .expect_err("double delete must fail");
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    // Closing the kqueue releases every remaining knote resource.
    kq.kevent(
        &[
            KEvent::new(1, EVFILT_TIMER, EventFlags::ADD, 0, 10_000, 0),
            KEvent::new(2, EVFILT_TIMER, EventFlags::ADD, 0, 10_000, 0),
        ],
        &mut [],
        None,
    )
    .expect("add two timers");
    drop(kq);
    assert_eq!(
        open_fd_count(),
        before_kqueue,
        "kqueue close must release every descriptor it created"
    );
}
