/*
 * backend/mod.rs
 *
 * The abstract I/O backend contract. Three concrete implementations
 * (epoll, kqueue, pselect) satisfy the same trait; which one compiles in
 * is chosen by Cargo feature + target OS, not by runtime polymorphism —
 * there is exactly one `Backend` impl linked into any given binary.
 */

#[cfg(all(feature = "backend-epoll", target_os = "linux"))]
pub mod epoll;
#[cfg(all(
    feature = "backend-kqueue",
    any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd")
))]
pub mod kqueue;
#[cfg(feature = "backend-pselect")]
pub mod pselect;

use crate::error::{Error, Result};
use crate::priority_queue::Handle;
use crate::time::{Clock, Timespec};
use crate::watcher::WatchFlags;
use std::os::fd::RawFd;

/// A `pipe(2)` pair used to interrupt a thread blocked in the kernel
/// wait: the mutator writes one byte, the backend has the read end
/// registered for readability, and discards whatever arrives.
pub(crate) struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid 2-element out-array for pipe(2).
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::from_errno());
        }
        // SAFETY: both fds were just returned by pipe(2) and are open.
        unsafe {
            let read_flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, read_flags | libc::O_NONBLOCK);
            let write_flags = libc::fcntl(fds[1], libc::F_GETFL);
            libc::fcntl(fds[1], libc::F_SETFL, write_flags | libc::O_NONBLOCK);
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Wake a blocked poller. Safe to call from any thread; EAGAIN (pipe
    /// buffer already has a pending wake byte) is not an error.
    pub fn wake(&self) -> Result<()> {
        let byte = 1u8;
        // SAFETY: write_fd is open for the lifetime of self; byte is a
        // valid 1-byte buffer.
        let rc = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const _, 1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(Error::Backend(err));
        }
        Ok(())
    }

    /// Drain every pending wake byte after `pull_events` reports the
    /// self-pipe readable.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is a valid 64-byte buffer for the duration of the call.
            let rc = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        // SAFETY: both fds were opened by this struct and are closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Which side of a bidi watcher an operation or event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Secondary,
}

/// One kernel-reported event, normalized across backends.
pub enum BackendEvent {
    Fd { handle: Handle, side: Side, flags: WatchFlags },
    Signal { handle: Handle, signo: i32, code: i32, pid: libc::pid_t },
    ChildExit { pid: libc::pid_t, status: i32 },
    /// A clock's kernel timer fired; the dispatch layer consults the
    /// timer queue for that clock to work out which watcher(s) expired.
    TimerExpired { clock: Clock },
    /// The self-pipe (or platform equivalent) used to interrupt a blocked
    /// poller so a mutator can acquire the attention lock.
    Woken,
}

/// The abstract contract every backend (epoll, kqueue, pselect) satisfies.
/// All methods are called with the attention lock held by the caller.
pub trait Backend {
    /// Register a wake-up source the attention lock can write to in
    /// order to interrupt a blocked `pull_events(true)` call.
    fn wake_fd(&self) -> RawFd;

    fn interrupt(&self) -> Result<()>;

    /// Returns `false` iff this descriptor kind can't be watched natively
    /// and `may_emulate` was set (caller should synthesize readiness by
    /// re-queueing); otherwise registers and returns `true`, or errors.
    fn add_fd_watch(
        &mut self,
        fd: RawFd,
        handle: Handle,
        flags: WatchFlags,
        enabled: bool,
        may_emulate: bool,
    ) -> Result<bool>;

    /// Returns the side(s), if any, that must be emulated: empty flags on
    /// full native success.
    fn add_bidi_fd_watch(
        &mut self,
        fd: RawFd,
        primary: Handle,
        secondary: Handle,
        flags: WatchFlags,
        may_emulate: bool,
    ) -> Result<WatchFlags>;

    fn enable_fd_watch(&mut self, fd: RawFd, side: Side, flags: WatchFlags) -> Result<()>;
    fn disable_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()>;
    fn remove_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()>;
    fn remove_bidi_fd_watch(&mut self, fd: RawFd) -> Result<()>;

    /// Caller must have already blocked `signo` in the process signal mask.
    fn add_signal_watch(&mut self, signo: i32, handle: Handle) -> Result<()>;
    fn rearm_signal_watch(&mut self, signo: i32) -> Result<()>;
    fn remove_signal_watch(&mut self, signo: i32) -> Result<()>;

    fn add_child_watch(&mut self, pid: libc::pid_t, handle: Handle) -> Result<()>;
    fn remove_child_watch(&mut self, pid: libc::pid_t) -> Result<()>;

    /// Arm (or disarm, if `deadline` is `None`) the single kernel timer
    /// for `clock` to fire at its nearest absolute deadline.
    fn set_timer_deadline(&mut self, clock: Clock, deadline: Option<Timespec>) -> Result<()>;

    /// Drain ready kernel events into `out`. If `wait`, blocks until at
    /// least one arrives (or the wake source fires); otherwise returns
    /// immediately if none are pending.
    fn pull_events(&mut self, wait: bool, out: &mut Vec<BackendEvent>) -> Result<()>;

    fn has_separate_rw_fd_watches() -> bool
    where
        Self: Sized;
    fn supports_childwatch_reservation() -> bool
    where
        Self: Sized;
}

/// Picks the default backend for the current platform. Each concrete
/// backend module also exposes its type directly for callers that want
/// to pin a specific one (mostly tests).
#[cfg(all(feature = "backend-epoll", target_os = "linux"))]
pub type DefaultBackend = epoll::EpollBackend;

#[cfg(all(
    feature = "backend-kqueue",
    any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"),
    not(all(feature = "backend-epoll", target_os = "linux"))
))]
pub type DefaultBackend = kqueue::KqueueBackend;

#[cfg(all(
    feature = "backend-pselect",
    not(all(feature = "backend-epoll", target_os = "linux")),
    not(all(
        feature = "backend-kqueue",
        any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd")
    ))
))]
pub type DefaultBackend = pselect::PselectBackend;
