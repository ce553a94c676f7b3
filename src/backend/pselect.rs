/*
 * backend/pselect.rs
 *
 * Portable fallback backend: two `fd_set`s plus `pselect(2)`, used on any
 * POSIX target the other two backends don't cover. Ported from the
 * reference `select_events` class, with its `sigmask`/timer TODOs
 * resolved rather than left as placeholders:
 *
 * - pselect has no equivalent of a kernel timer, so unlike epoll/kqueue
 *   this backend tracks the next deadline per clock itself and turns it
 *   into pselect's relative timeout; a `Woken`/timeout-only return with
 *   no fd activity is checked against both clocks to decide which fired.
 * - the signal mask pselect swaps in for the call's duration is the
 *   process mask with every watched signal *unblocked*, so a pending
 *   signal interrupts the wait with EINTR; the authoritative siginfo is
 *   still collected by `sigtimedwait`, same as the reference's
 *   `pull_signal`, since pselect itself can't hand back siginfo.
 */

use super::{Backend, BackendEvent, Side, SelfPipe};
use crate::error::{Error, Result};
use crate::priority_queue::Handle;
use crate::signal::try_sigtimedwait;
use crate::time::{Clock, Timespec};
use crate::watcher::WatchFlags;
use std::collections::HashMap;
use std::os::fd::RawFd;

struct FdSet(libc::fd_set);

impl FdSet {
    fn empty() -> Self {
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        // SAFETY: set is freshly zeroed and owned by this call.
        unsafe {
            libc::FD_ZERO(&mut set);
        }
        FdSet(set)
    }

    fn set(&mut self, fd: RawFd) {
        // SAFETY: self.0 is a valid fd_set owned by self.
        unsafe {
            libc::FD_SET(fd, &mut self.0);
        }
    }

    fn clear(&mut self, fd: RawFd) {
        // SAFETY: self.0 is a valid fd_set owned by self.
        unsafe {
            libc::FD_CLR(fd, &mut self.0);
        }
    }

    fn is_set(&self, fd: RawFd) -> bool {
        // SAFETY: self.0 is a valid fd_set owned by self.
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

pub struct PselectBackend {
    wake: SelfPipe,
    read_set: FdSet,
    write_set: FdSet,
    max_fd: RawFd,
    read_handles: HashMap<RawFd, Handle>,
    write_handles: HashMap<RawFd, Handle>,
    signal_handles: HashMap<i32, Handle>,
    timer_deadlines: HashMap<Clock, Timespec>,
    children: HashMap<libc::pid_t, Handle>,
}

impl PselectBackend {
    pub fn new() -> Result<Self> {
        let wake = SelfPipe::new()?;
        let mut read_set = FdSet::empty();
        read_set.set(wake.read_fd());
        log::trace!("new: wake_fd={}", wake.read_fd());
        Ok(Self {
            max_fd: wake.read_fd(),
            wake,
            read_set,
            write_set: FdSet::empty(),
            read_handles: HashMap::new(),
            write_handles: HashMap::new(),
            signal_handles: HashMap::new(),
            timer_deadlines: HashMap::new(),
            children: HashMap::new(),
        })
    }

    fn recompute_max_fd(&mut self) {
        self.max_fd = self
            .read_handles
            .keys()
            .chain(self.write_handles.keys())
            .copied()
            .chain(std::iter::once(self.wake.read_fd()))
            .max()
            .unwrap_or(self.wake.read_fd());
    }

    /// Mask to hand `pselect` for the call's duration: the current
    /// process mask with every watched signal unblocked, so a pending
    /// one interrupts the wait via EINTR.
    fn wait_sigmask(&self) -> Result<libc::sigset_t> {
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: mask is an out-parameter for pthread_sigmask; passing a
        // null `set` leaves the process mask unchanged and only reads it.
        let rc = unsafe { libc::pthread_sigmask(0, std::ptr::null(), &mut mask) };
        if rc != 0 {
            return Err(Error::Backend(std::io::Error::from_raw_os_error(rc)));
        }
        for &signo in self.signal_handles.keys() {
            // SAFETY: mask is owned locally.
            unsafe {
                libc::sigdelset(&mut mask, signo);
            }
        }
        Ok(mask)
    }

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
                if signo == libc::SIGCHLD {
                    self.reap_children(out);
                }
            }
        }
        Ok(())
    }

    fn reap_children(&mut self, out: &mut Vec<BackendEvent>) {
        loop {
            let mut status = 0;
            // SAFETY: status is a valid out-parameter; -1 reaps any child.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if self.children.remove(&pid).is_some() {
                out.push(BackendEvent::ChildExit { pid, status });
            }
        }
    }

    /// Shortest remaining time to any armed clock deadline, or `None` if
    /// no timer is armed.
    fn next_timeout(&self) -> Option<Timespec> {
        self.timer_deadlines
            .iter()
            .map(|(&clock, &deadline)| deadline.saturating_sub(clock.now()))
            .min()
    }
}

impl Backend for PselectBackend {
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
        _may_emulate: bool,
    ) -> Result<bool> {
        if flags.contains(WatchFlags::IN) {
            self.read_handles.insert(fd, handle);
            if enabled {
                self.read_set.set(fd);
            }
        } else {
            self.write_handles.insert(fd, handle);
            if enabled {
                self.write_set.set(fd);
            }
        }
        self.max_fd = self.max_fd.max(fd);
        Ok(true)
    }

    fn add_bidi_fd_watch(
        &mut self,
        fd: RawFd,
        primary: Handle,
        secondary: Handle,
        flags: WatchFlags,
        _may_emulate: bool,
    ) -> Result<WatchFlags> {
        self.read_handles.insert(fd, primary);
        self.write_handles.insert(fd, secondary);
        if flags.contains(WatchFlags::IN) {
            self.read_set.set(fd);
        }
        if flags.contains(WatchFlags::OUT) {
            self.write_set.set(fd);
        }
        self.max_fd = self.max_fd.max(fd);
        Ok(WatchFlags::NONE)
    }

    fn enable_fd_watch(&mut self, fd: RawFd, side: Side, _flags: WatchFlags) -> Result<()> {
        match side {
            Side::Primary => self.read_set.set(fd),
            Side::Secondary => self.write_set.set(fd),
        }
        Ok(())
    }

    fn disable_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()> {
        match side {
            Side::Primary => self.read_set.clear(fd),
            Side::Secondary => self.write_set.clear(fd),
        }
        Ok(())
    }

    fn remove_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()> {
        match side {
            Side::Primary => {
                self.read_set.clear(fd);
                self.read_handles.remove(&fd);
            }
            Side::Secondary => {
                self.write_set.clear(fd);
                self.write_handles.remove(&fd);
            }
        }
        self.recompute_max_fd();
        Ok(())
    }

    fn remove_bidi_fd_watch(&mut self, fd: RawFd) -> Result<()> {
        self.read_set.clear(fd);
        self.write_set.clear(fd);
        self.read_handles.remove(&fd);
        self.write_handles.remove(&fd);
        self.recompute_max_fd();
        Ok(())
    }

    fn add_signal_watch(&mut self, signo: i32, handle: Handle) -> Result<()> {
        self.signal_handles.insert(signo, handle);
        Ok(())
    }

    fn rearm_signal_watch(&mut self, _signo: i32) -> Result<()> {
        Ok(())
    }

    fn remove_signal_watch(&mut self, signo: i32) -> Result<()> {
        self.signal_handles.remove(&signo);
        Ok(())
    }

    fn add_child_watch(&mut self, pid: libc::pid_t, handle: Handle) -> Result<()> {
        self.children.insert(pid, handle);
        Ok(())
    }

    fn remove_child_watch(&mut self, pid: libc::pid_t) -> Result<()> {
        self.children.remove(&pid);
        Ok(())
    }

    fn set_timer_deadline(&mut self, clock: Clock, deadline: Option<Timespec>) -> Result<()> {
        match deadline {
            Some(d) => {
                self.timer_deadlines.insert(clock, d);
            }
            None => {
                self.timer_deadlines.remove(&clock);
            }
        }
        Ok(())
    }

    fn pull_events(&mut self, wait: bool, out: &mut Vec<BackendEvent>) -> Result<()> {
        self.pull_signals(out)?;

        let mut read_copy = FdSet(self.read_set.0);
        let mut write_copy = FdSet(self.write_set.0);
        let mut err_copy = FdSet::empty();

        let timeout = if !wait {
            Some(Timespec::ZERO)
        } else {
            self.next_timeout()
        };
        let ts_storage = timeout.map(Timespec::to_libc);
        let ts_ptr = ts_storage
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        let sigmask = self.wait_sigmask()?;
        // SAFETY: all fd_set pointers are valid, max_fd+1 bounds them, and
        // sigmask/timeout are valid for the duration of the call.
        let r = unsafe {
            libc::pselect(
                self.max_fd + 1,
                &mut read_copy.0,
                &mut write_copy.0,
                &mut err_copy.0,
                ts_ptr,
                &sigmask,
            )
        };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                self.pull_signals(out)?;
                return Ok(());
            }
            return Err(Error::Backend(err));
        }

        if read_copy.is_set(self.wake.read_fd()) {
            self.wake.drain();
            out.push(BackendEvent::Woken);
        }

        for (&fd, &handle) in self.read_handles.iter() {
            if read_copy.is_set(fd) {
                out.push(BackendEvent::Fd {
                    handle,
                    side: Side::Primary,
                    flags: WatchFlags::IN,
                });
            }
        }
        for (&fd, &handle) in self.write_handles.iter() {
            if write_copy.is_set(fd) {
                out.push(BackendEvent::Fd {
                    handle,
                    side: Side::Secondary,
                    flags: WatchFlags::OUT,
                });
            }
        }

        for (&clock, &deadline) in self.timer_deadlines.iter() {
            if clock.now() >= deadline {
                out.push(BackendEvent::TimerExpired { clock });
            }
        }

        self.pull_signals(out)?;
        Ok(())
    }

    fn has_separate_rw_fd_watches() -> bool {
        true
    }

    fn supports_childwatch_reservation() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_poll_reports_woken() {
        let mut backend = PselectBackend::new().expect("pselect is always available");
        backend.interrupt().unwrap();
        let mut out = Vec::new();
        backend.pull_events(false, &mut out).unwrap();
        assert!(out.iter().any(|e| matches!(e, BackendEvent::Woken)));
    }

    #[test]
    fn next_timeout_picks_the_sooner_clock() {
        let mut backend = PselectBackend::new().expect("pselect is always available");
        let now = Clock::Monotonic.now();
        backend
            .set_timer_deadline(Clock::Monotonic, Some(now.add(Timespec::new(5, 0))))
            .unwrap();
        backend
            .set_timer_deadline(Clock::Realtime, Some(Clock::Realtime.now().add(Timespec::new(1, 0))))
            .unwrap();
        let remaining = backend.next_timeout().unwrap();
        assert!(remaining <= Timespec::new(1, 0));
    }
}
