//! Vnode filter over a scratch file.

use kqport::{
    EventFlags, KEvent, Kqueue, EVFILT_VNODE, NOTE_ATTRIB, NOTE_DELETE, NOTE_WRITE,
};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn scratch_path(tag: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift")
        .as_nanos();
    std::env::temp_dir().join(format!("kqport-{tag}-{}-{unique}", std::process::id()))
}

#[test]
fn write_to_watched_file_reports_note_write() {
    let path = scratch_path("write");
    let mut file = std::fs::File::create(&path).expect("create scratch file");

    let kq = Kqueue::new().expect("kqueue");
    let add = KEvent::new(
        file.as_raw_fd() as usize,
        EVFILT_VNODE,
        EventFlags::ADD | EventFlags::CLEAR,
        NOTE_WRITE | NOTE_ATTRIB,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add vnode knote");

    file.write_all(b"payload").expect("write");

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(2)))
        .expect("wait");
    assert_eq!(n, 1);
    assert_eq!(events[0].filter, EVFILT_VNODE);
    assert!(
        events[0].fflags & NOTE_WRITE != 0,
        "a write must surface as NOTE_WRITE, got {:#x}",
        events[0].fflags
    );

    let _ = std::fs::remove_file(&path);
}

/// A vanished inode yields NOTE_DELETE exactly once, after which the
/// knote is disabled.
#[test]
fn unlink_reports_note_delete_once() {
    let path = scratch_path("unlink");
    let file = std::fs::File::create(&path).expect("create scratch file");

    let kq = Kqueue::new().expect("kqueue");
    let add = KEvent::new(
        file.as_raw_fd() as usize,
        EVFILT_VNODE,
        EventFlags::ADD,
        NOTE_DELETE,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add vnode knote");

    std::fs::remove_file(&path).expect("unlink");

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_secs(2)))
        .expect("wait");
    assert_eq!(n, 1);
    assert!(
        events[0].fflags & NOTE_DELETE != 0,
        "unlink must surface as NOTE_DELETE"
    );

    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(100)))
        .expect("second wait");
    assert_eq!(n, 0, "the deletion is reported exactly once");
}

#[test]
fn unsubscribed_notes_are_filtered_out() {
    let path = scratch_path("filtered");
    let mut file = std::fs::File::create(&path).expect("create scratch file");

    let kq = Kqueue::new().expect("kqueue");
    // Subscribe to attribute changes only.
    let add = KEvent::new(
        file.as_raw_fd() as usize,
        EVFILT_VNODE,
        EventFlags::ADD,
        NOTE_ATTRIB,
        0,
        0,
    );
    kq.kevent(&[add], &mut [], None).expect("add vnode knote");

    file.write_all(b"ignored").expect("write");

    let mut events = [KEvent::default(); 4];
    let n = kq
        .kevent(&[], &mut events, Some(Duration::from_millis(200)))
        .expect("wait");
    assert_eq!(n, 0, "writes are invisible to an attrib-only knote");

    let _ = std::fs::remove_file(&path);
}
