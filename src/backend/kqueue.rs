/*
 * backend/kqueue.rs
 *
 * macOS/BSD backend. kqueue watches read and write independently
 * (`has_separate_rw_fd_watches() == true`) so a bidi watcher is two
 * filters on one descriptor rather than one combined registration.
 *
 * Two wrinkles the reference implementation calls out are carried over
 * verbatim:
 *
 * - Disabling or deleting a filter in response to a batch does not by
 *   itself stop the kernel from reporting further pending data on a
 *   level-triggered fd before the next `kevent` call returns, so every
 *   reported event is immediately re-submitted with `EV_DISABLE` to
 *   simulate `EV_DISPATCH` (not universally available on these kernels).
 * - `EVFILT_SIGNAL` only counts delivery attempts and clears the count
 *   on read; a signal that was queued more than once since the last
 *   poll can be silently under-reported. `sigtimedwait` is therefore
 *   polled with a zero timeout before every `kevent` call to drain
 *   anything the filter's counter already dropped.
 *
 * There is no kqueue primitive for "the process exited and I waitpid'd
 * it before now", so child exits ride the same `EVFILT_PROC`/`NOTE_EXIT`
 * filter the reference implementation uses and `supports_childwatch_reservation`
 * is true. Timers use `EVFILT_TIMER` with `NOTE_NSECONDS`, which is a
 * relative (not absolute) deadline, so `set_timer_deadline` recomputes the
 * delay from `now` on every call.
 */

use super::{Backend, BackendEvent, Side, SelfPipe};
use crate::error::{Error, Result};
use crate::priority_queue::Handle;
use crate::signal::try_sigtimedwait;
use crate::time::{Clock, Timespec};
use crate::watcher::WatchFlags;
use std::collections::HashMap;
use std::os::fd::RawFd;

/// Fixed `EVFILT_TIMER` identifiers, one per clock; kqueue timers aren't
/// keyed by anything else meaningful to us.
const MONOTONIC_TIMER_IDENT: usize = 0;
const REALTIME_TIMER_IDENT: usize = 1;

struct FdEntry {
    primary: Handle,
    secondary: Option<Handle>,
}

pub struct KqueueBackend {
    kqfd: RawFd,
    wake: SelfPipe,
    sigmask: libc::sigset_t,
    signal_handles: HashMap<i32, Handle>,
    fds: HashMap<RawFd, FdEntry>,
    children: HashMap<libc::pid_t, Handle>,
}

fn new_kevent(ident: usize, filter: i16, flags: u16, fflags: u32, data: isize, udata: *mut libc::c_void) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data,
        udata,
    }
}

fn submit(kqfd: RawFd, changes: &mut [libc::kevent]) -> Result<()> {
    // SAFETY: changes is a valid slice of initialized kevent structs; no
    // output buffer is requested so nothing is written back.
    let rc = unsafe {
        libc::kevent(
            kqfd,
            changes.as_mut_ptr(),
            changes.len() as i32,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        )
    };
    if rc == -1 {
        return Err(Error::from_errno());
    }
    Ok(())
}

impl KqueueBackend {
    pub fn new() -> Result<Self> {
        // SAFETY: kqueue() takes no arguments.
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            return Err(Error::from_errno());
        }
        let wake = SelfPipe::new()?;
        let mut add_wake = [new_kevent(
            wake.read_fd() as usize,
            libc::EVFILT_READ,
            libc::EV_ADD as u16,
            0,
            0,
            std::ptr::null_mut(),
        )];
        submit(kqfd, &mut add_wake)?;

        let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: sigmask is freshly zeroed and owned by this call.
        unsafe {
            libc::sigemptyset(&mut sigmask);
        }

        log::trace!("new: kqfd={kqfd}");

        Ok(Self {
            kqfd,
            wake,
            sigmask,
            signal_handles: HashMap::new(),
            fds: HashMap::new(),
            children: HashMap::new(),
        })
    }

    fn timer_ident(clock: Clock) -> usize {
        match clock {
            Clock::Monotonic => MONOTONIC_TIMER_IDENT,
            Clock::Realtime => REALTIME_TIMER_IDENT,
        }
    }

    /// Drain any signal the `EVFILT_SIGNAL` delivery counter already
    /// dropped, per the reference implementation's `pull_signals`.
    fn pull_signals(&mut self, out: &mut Vec<BackendEvent>) -> Result<()> {
        for &signo in self.signal_handles.keys().cloned().collect::<Vec<_>>().iter() {
            while let Some(info) = try_sigtimedwait(signo)? {
                if let Some(&handle) = self.signal_handles.get(&signo) {
                    out.push(BackendEvent::Signal {
                        handle,
                        signo: info.signo,
                        code: info.code,
                        pid: info.pid,
                    });
                }
            }
        }
        Ok(())
    }

    fn reap_child(&mut self, pid: libc::pid_t, out: &mut Vec<BackendEvent>) {
        let mut status = 0;
        // SAFETY: status is a valid out-parameter; pid was just reported
        // exited by EVFILT_PROC/NOTE_EXIT so it is reapable without blocking.
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            if self.children.remove(&pid).is_some() {
                out.push(BackendEvent::ChildExit { pid, status });
            }
        }
    }
}

impl Backend for KqueueBackend {
    fn wake_fd(&self) -> RawFd {
        self.wake.write_fd()
    }

    fn interrupt(&self) -> Result<()> {
        self.wake.wake()
    }

    fn add_fd_watch(
        &mut self,
        fd: RawFd,
        handle: Handle,
        flags: WatchFlags,
        enabled: bool,
        may_emulate: bool,
    ) -> Result<bool> {
        let filter = if flags.contains(WatchFlags::IN) {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        let ev_flags = libc::EV_ADD as u16 | if enabled { 0 } else { libc::EV_DISABLE as u16 };
        let mut changes = [new_kevent(fd as usize, filter, ev_flags, 0, 0, std::ptr::null_mut())];
        if submit(self.kqfd, &mut changes).is_err() {
            if filter == libc::EVFILT_WRITE && may_emulate {
                return Ok(false);
            }
            return Err(Error::from_errno());
        }
        self.fds.insert(
            fd,
            FdEntry {
                primary: handle,
                secondary: None,
            },
        );
        Ok(true)
    }

    fn add_bidi_fd_watch(
        &mut self,
        fd: RawFd,
        primary: Handle,
        secondary: Handle,
        flags: WatchFlags,
        may_emulate: bool,
    ) -> Result<WatchFlags> {
        let rflags = libc::EV_ADD as u16 | if flags.contains(WatchFlags::IN) { 0 } else { libc::EV_DISABLE as u16 };
        let mut read_change = [new_kevent(fd as usize, libc::EVFILT_READ, rflags, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut read_change)?;

        let wflags = libc::EV_ADD as u16 | if flags.contains(WatchFlags::OUT) { 0 } else { libc::EV_DISABLE as u16 };
        let mut write_change = [new_kevent(fd as usize, libc::EVFILT_WRITE, wflags, 0, 0, std::ptr::null_mut())];
        let write_result = submit(self.kqfd, &mut write_change);

        self.fds.insert(
            fd,
            FdEntry {
                primary,
                secondary: Some(secondary),
            },
        );

        if let Err(err) = write_result {
            if may_emulate {
                return Ok(WatchFlags::OUT);
            }
            let mut remove_read = [new_kevent(fd as usize, libc::EVFILT_READ, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut())];
            let _ = submit(self.kqfd, &mut remove_read);
            self.fds.remove(&fd);
            return Err(err);
        }
        Ok(WatchFlags::NONE)
    }

    fn enable_fd_watch(&mut self, fd: RawFd, side: Side, _flags: WatchFlags) -> Result<()> {
        let filter = match side {
            Side::Primary => libc::EVFILT_READ,
            Side::Secondary => libc::EVFILT_WRITE,
        };
        let mut change = [new_kevent(fd as usize, filter, libc::EV_ENABLE as u16, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut change)
    }

    fn disable_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()> {
        let filter = match side {
            Side::Primary => libc::EVFILT_READ,
            Side::Secondary => libc::EVFILT_WRITE,
        };
        let mut change = [new_kevent(fd as usize, filter, libc::EV_DISABLE as u16, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut change)
    }

    fn remove_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()> {
        let filter = match side {
            Side::Primary => libc::EVFILT_READ,
            Side::Secondary => libc::EVFILT_WRITE,
        };
        let mut change = [new_kevent(fd as usize, filter, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut())];
        let result = submit(self.kqfd, &mut change);
        if matches!(side, Side::Primary) {
            self.fds.remove(&fd);
        } else if let Some(entry) = self.fds.get_mut(&fd) {
            entry.secondary = None;
        }
        result
    }

    fn remove_bidi_fd_watch(&mut self, fd: RawFd) -> Result<()> {
        let mut changes = [
            new_kevent(fd as usize, libc::EVFILT_READ, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut()),
            new_kevent(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut()),
        ];
        self.fds.remove(&fd);
        submit(self.kqfd, &mut changes)
    }

    fn add_signal_watch(&mut self, signo: i32, handle: Handle) -> Result<()> {
        // SAFETY: sigmask is owned by self.
        unsafe {
            libc::sigaddset(&mut self.sigmask, signo);
        }
        self.signal_handles.insert(signo, handle);
        let mut change = [new_kevent(signo as usize, libc::EVFILT_SIGNAL, libc::EV_ADD as u16, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut change)
    }

    fn rearm_signal_watch(&mut self, signo: i32) -> Result<()> {
        // SAFETY: sigmask is owned by self.
        unsafe {
            libc::sigaddset(&mut self.sigmask, signo);
        }
        let mut change = [new_kevent(signo as usize, libc::EVFILT_SIGNAL, libc::EV_ENABLE as u16, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut change)
    }

    fn remove_signal_watch(&mut self, signo: i32) -> Result<()> {
        // SAFETY: sigmask is owned by self.
        unsafe {
            libc::sigdelset(&mut self.sigmask, signo);
        }
        self.signal_handles.remove(&signo);
        let mut change = [new_kevent(signo as usize, libc::EVFILT_SIGNAL, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut())];
        submit(self.kqfd, &mut change)
    }

    fn add_child_watch(&mut self, pid: libc::pid_t, handle: Handle) -> Result<()> {
        self.children.insert(pid, handle);
        let mut change = [new_kevent(
            pid as usize,
            libc::EVFILT_PROC,
            libc::EV_ADD as u16 | libc::EV_ONESHOT as u16,
            libc::NOTE_EXIT,
            0,
            std::ptr::null_mut(),
        )];
        submit(self.kqfd, &mut change)
    }

    fn remove_child_watch(&mut self, pid: libc::pid_t) -> Result<()> {
        self.children.remove(&pid);
        // The EVFILT_PROC watch is EV_ONESHOT and clears itself once the
        // process exits; removing ahead of that is a best-effort no-op if
        // it already fired.
        let mut change = [new_kevent(pid as usize, libc::EVFILT_PROC, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut())];
        let _ = submit(self.kqfd, &mut change);
        Ok(())
    }

    fn set_timer_deadline(&mut self, clock: Clock, deadline: Option<Timespec>) -> Result<()> {
        let ident = Self::timer_ident(clock);
        let Some(deadline) = deadline else {
            let mut change = [new_kevent(ident, libc::EVFILT_TIMER, libc::EV_DELETE as u16, 0, 0, std::ptr::null_mut())];
            let _ = submit(self.kqfd, &mut change);
            return Ok(());
        };
        let now = clock.now();
        let remaining = deadline.saturating_sub(now);
        let nsec = remaining.sec.saturating_mul(1_000_000_000).saturating_add(remaining.nsec);
        let nsec = nsec.max(1);
        let mut change = [new_kevent(
            ident,
            libc::EVFILT_TIMER,
            libc::EV_ADD as u16 | libc::EV_ONESHOT as u16,
            libc::NOTE_NSECONDS,
            nsec as isize,
            std::ptr::null_mut(),
        )];
        submit(self.kqfd, &mut change)
    }

    fn pull_events(&mut self, wait: bool, out: &mut Vec<BackendEvent>) -> Result<()> {
        self.pull_signals(out)?;

        let mut events: [libc::kevent; 16] = unsafe { std::mem::zeroed() };
        let zero_timeout = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let timeout_ptr = if wait { std::ptr::null() } else { &zero_timeout as *const _ };
        // SAFETY: events is a valid out-array of the declared length.
        let n = unsafe {
            libc::kevent(self.kqfd, std::ptr::null(), 0, events.as_mut_ptr(), events.len() as i32, timeout_ptr)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::Backend(err));
        }

        let mut dispatched: Vec<libc::kevent> = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            let ident = ev.ident;
            match ev.filter {
                libc::EVFILT_READ if ident as RawFd == self.wake.read_fd() => {
                    self.wake.drain();
                    out.push(BackendEvent::Woken);
                    continue;
                }
                libc::EVFILT_READ => {
                    if let Some(entry) = self.fds.get(&(ident as RawFd)) {
                        out.push(BackendEvent::Fd {
                            handle: entry.primary,
                            side: Side::Primary,
                            flags: WatchFlags::IN,
                        });
                    }
                }
                libc::EVFILT_WRITE => {
                    if let Some(entry) = self.fds.get(&(ident as RawFd)) {
                        let handle = entry.secondary.unwrap_or(entry.primary);
                        out.push(BackendEvent::Fd {
                            handle,
                            side: if entry.secondary.is_some() { Side::Secondary } else { Side::Primary },
                            flags: WatchFlags::OUT,
                        });
                    }
                }
                libc::EVFILT_PROC => {
                    self.reap_child(ident as libc::pid_t, out);
                }
                libc::EVFILT_TIMER => {
                    let clock = if ident == MONOTONIC_TIMER_IDENT { Clock::Monotonic } else { Clock::Realtime };
                    out.push(BackendEvent::TimerExpired { clock });
                }
                libc::EVFILT_SIGNAL => {
                    // Counter-based delivery; `pull_signals` already drains
                    // the authoritative siginfo via sigtimedwait, this just
                    // tells us the filter fired at all.
                }
                _ => {}
            }

            if matches!(ev.filter, libc::EVFILT_READ | libc::EVFILT_WRITE) {
                dispatched.push(new_kevent(ident as usize, ev.filter, libc::EV_DISABLE as u16, 0, 0, std::ptr::null_mut()));
            }
        }

        if !dispatched.is_empty() {
            // Simulate EV_DISPATCH: disable every filter we just reported so
            // a level-triggered fd doesn't spin the next non-blocking poll.
            let _ = submit(self.kqfd, &mut dispatched);
        }
        Ok(())
    }

    fn has_separate_rw_fd_watches() -> bool {
        true
    }

    fn supports_childwatch_reservation() -> bool {
        true
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // SAFETY: kqfd was opened by this struct and is closed exactly once.
        unsafe {
            libc::close(self.kqfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_backend_opens_a_kqueue_fd() {
        let backend = KqueueBackend::new().expect("kqueue available on this platform");
        assert!(backend.kqfd >= 0);
    }

    #[test]
    fn wake_then_poll_reports_woken() {
        let mut backend = KqueueBackend::new().expect("kqueue available on this platform");
        backend.interrupt().unwrap();
        let mut out = Vec::new();
        backend.pull_events(false, &mut out).unwrap();
        assert!(out.iter().any(|e| matches!(e, BackendEvent::Woken)));
    }
}
