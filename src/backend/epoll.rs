/*
 * backend/epoll.rs
 *
 * Linux backend. One epoll set holds: the user's watched fds, a single
 * `signalfd` multiplexing every watched signal, two `timerfd`s (one per
 * clock), and the self-pipe wake source. `EPOLLONESHOT` is used when the
 * caller asked for one-shot or when the dispatch layer needs to disable
 * a watch between events; disabling is otherwise a MOD with an empty
 * event mask. Child reaping has no native epoll primitive, so SIGCHLD is
 * watched through the signalfd and `waitpid(WNOHANG)` is run in a loop
 * on every delivery, matched against the registered-child map.
 */

use super::{Backend, BackendEvent, Side, SelfPipe};
use crate::error::{Error, Result};
use crate::priority_queue::Handle;
use crate::time::{Clock, Timespec};
use crate::watcher::WatchFlags;
use std::collections::HashMap;
use std::os::fd::RawFd;

struct FdEntry {
    primary: Handle,
    secondary: Option<Handle>,
    watch_flags: WatchFlags,
}

pub struct EpollBackend {
    epoll_fd: RawFd,
    wake: SelfPipe,
    signal_fd: RawFd,
    signal_mask: libc::sigset_t,
    signal_handles: HashMap<i32, Handle>,
    timer_fds: HashMap<Clock, RawFd>,
    fds: HashMap<RawFd, FdEntry>,
    children: HashMap<libc::pid_t, Handle>,
}

fn epoll_ctl_raw(epoll_fd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    // SAFETY: ev is a valid, exclusively-owned epoll_event for the duration of the call.
    let rc = unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut ev) };
    if rc != 0 {
        return Err(Error::from_errno());
    }
    Ok(())
}

fn watch_flags_to_epoll(flags: WatchFlags) -> u32 {
    let mut bits = 0u32;
    if flags.contains(WatchFlags::IN) {
        bits |= libc::EPOLLIN as u32;
    }
    if flags.contains(WatchFlags::OUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    if flags.contains(WatchFlags::ONE_SHOT) {
        bits |= libc::EPOLLONESHOT as u32;
    }
    bits
}

impl EpollBackend {
    pub fn new() -> Result<Self> {
        // SAFETY: no arguments to validate.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::from_errno());
        }
        let wake = SelfPipe::new()?;
        epoll_ctl_raw(epoll_fd, libc::EPOLL_CTL_ADD, wake.read_fd(), libc::EPOLLIN as u32)?;

        // SAFETY: mask is freshly zeroed and owned by this call.
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
        }
        // SAFETY: mask is a valid, empty sigset; -1 requests a fresh signalfd.
        let signal_fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if signal_fd < 0 {
            return Err(Error::from_errno());
        }
        epoll_ctl_raw(epoll_fd, libc::EPOLL_CTL_ADD, signal_fd, libc::EPOLLIN as u32)?;

        let mut timer_fds = HashMap::new();
        for clock in [Clock::Monotonic, Clock::Realtime] {
            let clockid = match clock {
                Clock::Monotonic => libc::CLOCK_MONOTONIC,
                Clock::Realtime => libc::CLOCK_REALTIME,
            };
            // SAFETY: clockid is a valid clock identifier and flags are 0.
            let tfd = unsafe { libc::timerfd_create(clockid, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
            if tfd < 0 {
                return Err(Error::from_errno());
            }
            epoll_ctl_raw(epoll_fd, libc::EPOLL_CTL_ADD, tfd, libc::EPOLLIN as u32)?;
            timer_fds.insert(clock, tfd);
        }

        log::trace!("new: epoll_fd={epoll_fd}, signal_fd={signal_fd}");

        Ok(Self {
            epoll_fd,
            wake,
            signal_fd,
            signal_mask: mask,
            signal_handles: HashMap::new(),
            timer_fds,
            fds: HashMap::new(),
            children: HashMap::new(),
        })
    }

    fn reap_children(&mut self, out: &mut Vec<BackendEvent>) {
        loop {
            let mut status = 0;
            // SAFETY: status is a valid out-parameter; -1 reaps any child of this process.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if self.children.remove(&pid).is_some() {
                out.push(BackendEvent::ChildExit { pid, status });
            }
        }
    }
}

impl Backend for EpollBackend {
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
        let events = if enabled { watch_flags_to_epoll(flags) } else { 0 };
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, events)?;
        self.fds.insert(
            fd,
            FdEntry {
                primary: handle,
                secondary: None,
                watch_flags: flags,
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
        _may_emulate: bool,
    ) -> Result<WatchFlags> {
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, watch_flags_to_epoll(flags))?;
        self.fds.insert(
            fd,
            FdEntry {
                primary,
                secondary: Some(secondary),
                watch_flags: flags,
            },
        );
        Ok(WatchFlags::NONE)
    }

    fn enable_fd_watch(&mut self, fd: RawFd, _side: Side, flags: WatchFlags) -> Result<()> {
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.watch_flags = entry.watch_flags.union(flags);
        }
        let events = self.fds.get(&fd).map(|e| watch_flags_to_epoll(e.watch_flags)).unwrap_or(0);
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, events)
    }

    fn disable_fd_watch(&mut self, fd: RawFd, side: Side) -> Result<()> {
        if let Some(entry) = self.fds.get_mut(&fd) {
            let bit = match side {
                Side::Primary => WatchFlags::IN,
                Side::Secondary => WatchFlags::OUT,
            };
            entry.watch_flags = entry.watch_flags.difference(bit);
        }
        let events = self.fds.get(&fd).map(|e| watch_flags_to_epoll(e.watch_flags)).unwrap_or(0);
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, events)
    }

    fn remove_fd_watch(&mut self, fd: RawFd, _side: Side) -> Result<()> {
        self.fds.remove(&fd);
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn remove_bidi_fd_watch(&mut self, fd: RawFd) -> Result<()> {
        self.fds.remove(&fd);
        epoll_ctl_raw(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn add_signal_watch(&mut self, signo: i32, handle: Handle) -> Result<()> {
        // SAFETY: signal_mask is owned by self and valid for the duration of the call.
        unsafe {
            libc::sigaddset(&mut self.signal_mask, signo);
        }
        let rc = unsafe { libc::signalfd(self.signal_fd, &self.signal_mask, 0) };
        if rc < 0 {
            return Err(Error::from_errno());
        }
        self.signal_handles.insert(signo, handle);
        Ok(())
    }

    fn rearm_signal_watch(&mut self, _signo: i32) -> Result<()> {
        Ok(())
    }

    fn remove_signal_watch(&mut self, signo: i32) -> Result<()> {
        // SAFETY: signal_mask is owned by self.
        unsafe {
            libc::sigdelset(&mut self.signal_mask, signo);
        }
        let rc = unsafe { libc::signalfd(self.signal_fd, &self.signal_mask, 0) };
        if rc < 0 {
            return Err(Error::from_errno());
        }
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
        let tfd = *self.timer_fds.get(&clock).expect("timerfd created for every clock in new()");
        let itimerspec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: deadline.unwrap_or(Timespec::ZERO).to_libc(),
        };
        // SAFETY: itimerspec is fully initialized; TFD_TIMER_ABSTIME is valid for timerfd_settime.
        let rc = unsafe {
            libc::timerfd_settime(tfd, libc::TFD_TIMER_ABSTIME, &itimerspec, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(Error::from_errno());
        }
        Ok(())
    }

    fn pull_events(&mut self, wait: bool, out: &mut Vec<BackendEvent>) -> Result<()> {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let timeout_ms = if wait { -1 } else { 0 };
        // SAFETY: events is a valid out-array of the declared length.
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::Backend(err));
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == self.wake.read_fd() {
                self.wake.drain();
                out.push(BackendEvent::Woken);
            } else if fd == self.signal_fd {
                loop {
                    let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
                    // SAFETY: info is sized exactly for one signalfd_siginfo record.
                    let n = unsafe {
                        libc::read(
                            self.signal_fd,
                            &mut info as *mut _ as *mut _,
                            std::mem::size_of::<libc::signalfd_siginfo>(),
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                    let signo = info.ssi_signo as i32;
                    if signo == libc::SIGCHLD {
                        self.reap_children(out);
                    }
                    if let Some(&handle) = self.signal_handles.get(&signo) {
                        out.push(BackendEvent::Signal {
                            handle,
                            signo,
                            code: info.ssi_code,
                            pid: info.ssi_pid as libc::pid_t,
                        });
                    }
                }
            } else if let Some((&clock, _)) = self.timer_fds.iter().find(|(_, &v)| v == fd) {
                let mut buf = [0u8; 8];
                // SAFETY: buf is sized for the 8-byte expiry counter timerfd read returns.
                unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len());
                }
                out.push(BackendEvent::TimerExpired { clock });
            } else if let Some(entry) = self.fds.get(&fd) {
                let bits = ev.events;
                if bits & (libc::EPOLLIN as u32) != 0 {
                    out.push(BackendEvent::Fd {
                        handle: entry.primary,
                        side: Side::Primary,
                        flags: WatchFlags::IN,
                    });
                }
                if bits & (libc::EPOLLOUT as u32) != 0 {
                    let handle = entry.secondary.unwrap_or(entry.primary);
                    out.push(BackendEvent::Fd {
                        handle,
                        side: if entry.secondary.is_some() { Side::Secondary } else { Side::Primary },
                        flags: WatchFlags::OUT,
                    });
                }
            }
        }
        Ok(())
    }

    fn has_separate_rw_fd_watches() -> bool {
        false
    }

    fn supports_childwatch_reservation() -> bool {
        false
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        for &tfd in self.timer_fds.values() {
            // SAFETY: tfd was opened by this struct and is closed exactly once.
            unsafe {
                libc::close(tfd);
            }
        }
        // SAFETY: signal_fd and epoll_fd were opened by this struct and are closed exactly once.
        unsafe {
            libc::close(self.signal_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_backend_has_independent_timer_fds() {
        let backend = EpollBackend::new().expect("epoll backend available in CI containers");
        assert_ne!(
            backend.timer_fds[&Clock::Monotonic],
            backend.timer_fds[&Clock::Realtime]
        );
    }

    #[test]
    fn wake_then_drain_is_idempotent() {
        let backend = EpollBackend::new().expect("epoll backend available in CI containers");
        backend.wake.wake().unwrap();
        backend.wake.wake().unwrap();
        backend.wake.drain();
    }
}
