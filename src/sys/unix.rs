use libc::{
    c_int, c_void, itimerspec, signalfd_siginfo, sigset_t, timespec, FIONREAD, F_DUPFD_CLOEXEC,
    F_GETFD, MSG_DONTWAIT, MSG_PEEK, POLLHUP, POLLIN, SFD_CLOEXEC, SFD_NONBLOCK, SIG_BLOCK,
    SIG_UNBLOCK, TFD_CLOEXEC, TFD_NONBLOCK, TFD_TIMER_ABSTIME, TIOCOUTQ, WEXITED, WNOHANG,
    WNOWAIT,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

/// `waitid` id type selecting a pidfd. Not exported by every libc version.
const P_PIDFD: libc::idtype_t = 3;

/// Builds an `io::Error` from a raw error number.
pub(crate) fn errno(code: c_int) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn cvt_fd(fd: c_int) -> io::Result<OwnedFd> {
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Duplicates a descriptor with `FD_CLOEXEC` set.
///
/// The duplicate shares the open file description, so readiness observed
/// through it mirrors the original exactly.
pub(crate) fn sys_dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::fcntl(fd, F_DUPFD_CLOEXEC, 0) })
}

/// Returns `true` if `fd` refers to an open descriptor.
pub(crate) fn sys_fd_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, F_GETFD) >= 0 }
}

/// Creates a non-blocking `eventfd` with a zero counter.
pub(crate) fn sys_eventfd() -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })
}

/// Makes an `eventfd` readable.
pub(crate) fn sys_eventfd_signal(fd: RawFd) {
    let buf: u64 = 1;
    unsafe {
        libc::write(fd, &buf as *const _ as *const c_void, 8);
    }
}

/// Resets an `eventfd`, returning the counter it held (0 if it was clear).
pub(crate) fn sys_eventfd_drain(fd: RawFd) -> u64 {
    let mut buf = 0u64;
    let n = unsafe { libc::read(fd, &mut buf as *mut _ as *mut c_void, 8) };
    if n == 8 { buf } else { 0 }
}

/// Creates a non-blocking `timerfd` on the given clock.
pub(crate) fn sys_timerfd(clock: libc::clockid_t) -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::timerfd_create(clock, TFD_NONBLOCK | TFD_CLOEXEC) })
}

/// Arms a `timerfd` with an initial expiry and repeat interval.
pub(crate) fn sys_timerfd_arm(
    fd: RawFd,
    value: timespec,
    interval: timespec,
    absolute: bool,
) -> io::Result<()> {
    let spec = itimerspec {
        it_interval: interval,
        it_value: value,
    };
    let flags = if absolute { TFD_TIMER_ABSTIME } else { 0 };

    cvt(unsafe { libc::timerfd_settime(fd, flags, &spec, std::ptr::null_mut()) })?;
    Ok(())
}

/// Reads the expiration count from a `timerfd`.
///
/// Returns 0 when the timer has not fired, which callers treat as a
/// spurious wake.
pub(crate) fn sys_timerfd_expirations(fd: RawFd) -> u64 {
    let mut count = 0u64;
    let n = unsafe { libc::read(fd, &mut count as *mut _ as *mut c_void, 8) };
    if n == 8 { count } else { 0 }
}

/// Builds a signal set from a list of signal numbers.
pub(crate) fn sys_sigset(signos: &[i32]) -> sigset_t {
    unsafe {
        let mut set = mem::zeroed::<sigset_t>();
        libc::sigemptyset(&mut set);
        for &signo in signos {
            libc::sigaddset(&mut set, signo);
        }
        set
    }
}

/// Blocks or unblocks one signal in the calling thread.
///
/// `signalfd` only observes signals that normal delivery cannot claim, so
/// every subscribed signal must be blocked for as long as its knote lives.
pub(crate) fn sys_sigmask(block: bool, signo: i32) -> io::Result<()> {
    let set = sys_sigset(&[signo]);
    let how = if block { SIG_BLOCK } else { SIG_UNBLOCK };

    let rc = unsafe { libc::pthread_sigmask(how, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(errno(rc));
    }
    Ok(())
}

/// Creates a non-blocking `signalfd` for `mask`.
pub(crate) fn sys_signalfd(mask: &sigset_t) -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::signalfd(-1, mask, SFD_NONBLOCK | SFD_CLOEXEC) })
}

/// Replaces the mask of an existing `signalfd`.
pub(crate) fn sys_signalfd_update(fd: RawFd, mask: &sigset_t) -> io::Result<()> {
    cvt(unsafe { libc::signalfd(fd, mask, SFD_NONBLOCK | SFD_CLOEXEC) })?;
    Ok(())
}

/// Reads one pending delivery from a `signalfd`.
///
/// Returns the signal number, or `None` once the queue is drained.
pub(crate) fn sys_signalfd_next(fd: RawFd) -> Option<u32> {
    let mut info: signalfd_siginfo = unsafe { mem::zeroed() };
    let want = mem::size_of::<signalfd_siginfo>();
    let n = unsafe { libc::read(fd, &mut info as *mut _ as *mut c_void, want) };
    if n == want as isize {
        Some(info.ssi_signo)
    } else {
        None
    }
}

/// Creates a non-blocking `inotify` instance.
pub(crate) fn sys_inotify() -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) })
}

/// Adds a watch for `path` and returns the watch descriptor.
pub(crate) fn sys_inotify_watch(fd: RawFd, path: &std::path::Path, mask: u32) -> io::Result<i32> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| errno(libc::EINVAL))?;
    cvt(unsafe { libc::inotify_add_watch(fd, c_path.as_ptr(), mask) })
}

/// Removes an inotify watch.
///
/// `EINVAL` is expected when the kernel already dropped the watch (for
/// example after the inode vanished) and is not reported.
pub(crate) fn sys_inotify_unwatch(fd: RawFd, wd: i32) {
    unsafe {
        libc::inotify_rm_watch(fd, wd);
    }
}

/// Fills `buf` with raw inotify records; returns the byte count.
pub(crate) fn sys_inotify_read(fd: RawFd, buf: &mut [u8]) -> usize {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n > 0 { n as usize } else { 0 }
}

/// Opens a pidfd for `pid`.
///
/// The pidfd polls readable once the process exits, which is the readiness
/// primitive behind process-exit knotes.
pub(crate) fn sys_pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    cvt_fd(unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) as c_int })
}

/// Fetches the wait status of an exited process behind a pidfd.
///
/// Uses `WNOWAIT` so the caller's own reaping is undisturbed. Returns
/// `None` when the status is unavailable (process not yet exited, or not a
/// child of this process).
pub(crate) fn sys_pidfd_exit_status(fd: RawFd) -> Option<i32> {
    unsafe {
        let mut info: libc::siginfo_t = mem::zeroed();
        let rc = libc::waitid(
            P_PIDFD,
            fd as libc::id_t,
            &mut info,
            WEXITED | WNOHANG | WNOWAIT,
        );
        if rc != 0 || info.si_signo != libc::SIGCHLD {
            return None;
        }
        Some(info.si_status())
    }
}

/// Number of bytes waiting in the receive queue of `fd`.
pub(crate) fn sys_readable_bytes(fd: RawFd) -> isize {
    let mut n: c_int = 0;
    let rc = unsafe { libc::ioctl(fd, FIONREAD, &mut n) };
    if rc == 0 { n as isize } else { 0 }
}

/// Free space in the send buffer of a socket, best effort.
pub(crate) fn sys_send_space(fd: RawFd) -> isize {
    unsafe {
        let mut sndbuf: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        let rc = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut sndbuf as *mut _ as *mut c_void,
            &mut len,
        );
        if rc != 0 {
            return 0;
        }

        let mut queued: c_int = 0;
        if libc::ioctl(fd, TIOCOUTQ, &mut queued) != 0 {
            queued = 0;
        }

        (sndbuf as isize - queued as isize).max(0)
    }
}

/// Returns `true` if a zero-length `MSG_PEEK` reports a closed peer.
///
/// A closed stream socket reads as "readable with zero bytes"; the peek
/// distinguishes that from readable-with-data without consuming anything.
pub(crate) fn sys_peek_eof(fd: RawFd) -> bool {
    let mut buf = [0u8; 1];
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            MSG_PEEK | MSG_DONTWAIT,
        )
    };
    if n == 0 {
        return true;
    }
    if n < 0 {
        // A reset connection counts as gone; EAGAIN, ENOTSOCK and friends
        // do not.
        return io::Error::last_os_error().raw_os_error() == Some(libc::ECONNRESET);
    }
    false
}

/// Creates a connected `AF_UNIX` stream pair.
pub(crate) fn sys_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    cvt(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Polls one descriptor for readability or hang-up.
pub(crate) fn sys_poll_readable(fd: RawFd, timeout_ms: c_int) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: POLLIN | POLLHUP,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}

/// Recovers the filesystem path behind an open descriptor.
pub(crate) fn sys_fd_path(fd: RawFd) -> io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
}

/// Convenience for passing an `OwnedFd` to the raw helpers above.
pub(crate) fn raw(fd: &OwnedFd) -> RawFd {
    fd.as_raw_fd()
}
