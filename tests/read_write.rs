//! Read and write filters over a local socket pair.

use kqport::{EventFlags, KEvent, Kqueue, EVFILT_READ, EVFILT_WRITE};
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

fn socket_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn readable_event_reports_byte_count() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, peer) = socket_pair();

    let add = KEvent::new(
        local.as_raw_fd() as usize,
        EVFILT_READ,
        EventFlags::ADD,
        0,
        0,
        0xfeed,
    );
    kq.kevent(&[add], &mut [], None).expect("add read knote");

    let mut peer = std::fs::File::from(peer);
    peer.write_all(b"hello").expect("write");

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].ident, local.as_raw_fd() as usize);
    assert_eq!(events[0].filter, EVFILT_READ);
    assert_eq!(events[0].data, 5, "data carries the bytes available");
    assert_eq!(events[0].udata, 0xfeed, "udata is echoed unchanged");
    assert!(!events[0].event_flags().contains(EventFlags::EOF));
}

/// Closing the far end of a registered socket yields one read event with
/// EOF set and no bytes pending.
#[test]
fn peer_close_delivers_eof() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, peer) = socket_pair();

    let add = KEvent::new(
        local.as_raw_fd() as usize,
        EVFILT_READ,
        EventFlags::ADD,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add read knote");

    drop(peer);

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].filter, EVFILT_READ);
    assert!(
        events[0].event_flags().contains(EventFlags::EOF),
        "peer close must surface as EOF"
    );
    assert_eq!(events[0].data, 0, "no bytes remain to be read");
}

#[test]
fn level_triggered_read_reports_until_consumed() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, peer) = socket_pair();

    let add = KEvent::new(
        local.as_raw_fd() as usize,
        EVFILT_READ,
        EventFlags::ADD,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add read knote");

    let mut peer = std::fs::File::from(peer);
    peer.write_all(b"x").expect("write");

    let mut events = [KEvent::default(); 1];
    for _ in 0..2 {
        let n = kq
            .kevent(&[], &mut events, Some(Duration::from_secs(1)))
            .expect("wait");
        assert_eq!(n, 1, "unconsumed data keeps reporting");
    }
}

#[test]
fn edge_triggered_read_reports_once() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, peer) = socket_pair();

    let add = KEvent::new(
        local.as_raw_fd() as usize,
        EVFILT_READ,
        EventFlags::ADD | EventFlags::CLEAR,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add read knote");

    let mut peer = std::fs::File::from(peer);
    peer.write_all(b"x").expect("write");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);

    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .expect("second wait");
    assert_eq!(n, 0, "without a new transition the edge stays quiet");
}

#[test]
fn write_filter_reports_sendable_socket() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, _peer) = socket_pair();

    let add = KEvent::new(
        local.as_raw_fd() as usize,
        EVFILT_WRITE,
        EventFlags::ADD,
        0,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add write knote");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].filter, EVFILT_WRITE);
    assert!(events[0].data > 0, "an idle socket has send buffer room");
}

#[test]
fn disabled_knote_stays_quiet_until_enabled() {
    let kq = Kqueue::new().expect("kqueue");
    let (local, peer) = socket_pair();
    let ident = local.as_raw_fd() as usize;

    let add = KEvent::new(ident, EVFILT_READ, EventFlags::ADD, 0, 0, 0);
    kq.kevent(&[add], &mut [], None).expect("add read knote");

    let mut peer = std::fs::File::from(peer);
    peer.write_all(b"x").expect("write");

    let disable = KEvent::new(ident, EVFILT_READ, EventFlags::DISABLE, 0, 0, 0);
    kq.kevent(&[disable], &mut [], None).expect("disable");

    let mut events = [KEvent::default(); 1];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .expect("wait disabled");
    assert_eq!(n, 0, "a disabled knote is never delivered");

    let enable = KEvent::new(ident, EVFILT_READ, EventFlags::ENABLE, 0, 0, 0);
    kq.kevent(&[enable], &mut [], None).expect("enable");
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(1)))
        .expect("wait enabled");
    assert_eq!(n, 1, "enabling resumes delivery of the pending level");
}

#[test]
fn bad_descriptor_is_rejected_on_add() {
    let kq = Kqueue::new().expect("kqueue");
    let add = KEvent::new(1_000_000, EVFILT_READ, EventFlags::ADD, 0, 0, 0);
    let err = kq
        .kevent(&[add], &mut [], None)
        .expect_err("registering a closed fd must fail");
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}
