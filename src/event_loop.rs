/*
 * event_loop.rs
 *
 * Wires the dispatch arena, the per-clock timer queues, and a concrete
 * backend together behind the attention lock. Mirrors the reference
 * `EventLoop`/`EventDispatch` split: this module owns backend-side
 * registration and the run loop; `dispatch::EventDispatch` owns watcher
 * storage and re-arm bookkeeping.
 *
 * Every public method that mutates backend or watcher state acquires the
 * attention lock for mutation first; `run`/`run_n`/`poll` acquire it for
 * a poll instead, so a steady stream of pollers can never starve a
 * thread that is trying to register or remove a watch. Before queuing for
 * the attention lock, every mutator writes a byte to the backend's wake
 * fd directly (bypassing the state mutex a sleeping poller holds) so a
 * poller blocked in the kernel wait is nudged awake instead of stalling
 * the mutator for an unbounded time.
 */

use crate::backend::{self, Backend, BackendEvent, Side};
use crate::dispatch::{self, BackendAction, EventDispatch};
use crate::error::{Error, Result};
use crate::priority_queue::Handle;
use crate::sync::{AttentionLock, RawLock, RawMutex};
use crate::time::{Clock, Timespec};
use crate::timer::{self, TimerQueue};
use crate::watcher::{
    BidiFdHandler, ChildHandler, FdHandler, HandlerBox, Payload, Rearm, SignalHandler,
    TimerHandler, WatchFlags, WatchKind,
};
use std::collections::HashMap;
use std::os::fd::RawFd;

/// Lowest and highest dispatch priority a watcher may be registered at.
/// `DEFAULT_PRIORITY` (50) sits at the midpoint so callers that never touch
/// priority land in the middle of the supported range either way.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 0..=99;

fn validate_priority(priority: i32) -> Result<()> {
    if PRIORITY_RANGE.contains(&priority) {
        Ok(())
    } else {
        Err(Error::InvalidPriority(priority))
    }
}

pub(crate) struct LoopState<B: Backend> {
    dispatch: EventDispatch,
    monotonic: TimerQueue,
    realtime: TimerQueue,
    backend: B,
    children: HashMap<libc::pid_t, Handle>,
    signals: HashMap<i32, Handle>,
}

impl<B: Backend> LoopState<B> {
    fn timers_mut(&mut self, clock: Clock) -> &mut TimerQueue {
        match clock {
            Clock::Monotonic => &mut self.monotonic,
            Clock::Realtime => &mut self.realtime,
        }
    }

    /// Re-arm the kernel timer for `clock` to the new earliest deadline
    /// (or disarm it if the queue for that clock is now empty).
    fn sync_kernel_timer(&mut self, clock: Clock) -> Result<()> {
        let deadline = self.timers_mut(clock).root_deadline();
        self.backend.set_timer_deadline(clock, deadline)
    }

    fn fd_of(&self, handle: Handle) -> RawFd {
        match &self.dispatch.state(handle).payload {
            Payload::Fd(fd) => fd.fd,
            Payload::SecondaryFd { .. } => {
                let primary = self
                    .dispatch
                    .state(handle)
                    .bidi_primary
                    .expect("secondary fd watcher always carries its primary's handle");
                match &self.dispatch.state(primary).payload {
                    Payload::Fd(fd) => fd.fd,
                    _ => unreachable!("bidi_primary always points at an Fd payload"),
                }
            }
            _ => unreachable!("fd_of called on a non-fd watcher"),
        }
    }

    fn watch_flags_of(&self, handle: Handle) -> WatchFlags {
        match &self.dispatch.state(handle).payload {
            Payload::Fd(fd) => fd.watch_flags,
            Payload::SecondaryFd { .. } => WatchFlags::OUT,
            _ => unreachable!("watch_flags_of called on a non-fd watcher"),
        }
    }

    fn signo_of(&self, handle: Handle) -> i32 {
        match &self.dispatch.state(handle).payload {
            Payload::Signal(sig) => sig.signo,
            _ => unreachable!("signo_of called on a non-signal watcher"),
        }
    }

    fn pid_of(&self, handle: Handle) -> libc::pid_t {
        match &self.dispatch.state(handle).payload {
            Payload::Child(child) => child.pid,
            _ => unreachable!("pid_of called on a non-child watcher"),
        }
    }

    /// Carry out one decision made by `EventDispatch::process_events`
    /// (or an immediate `deregister`). For `Remove`, tears the watcher
    /// down from the backend, fires `watch_removed`, and deallocates its
    /// arena slot - the only point at which a watcher's storage actually
    /// goes away.
    fn apply_action(&mut self, action: BackendAction) -> Result<()> {
        match action {
            BackendAction::None => Ok(()),
            BackendAction::EnableFd { handle, secondary } => {
                let fd = self.fd_of(handle);
                let flags = self.watch_flags_of(handle);
                let side = if secondary { Side::Secondary } else { Side::Primary };
                self.backend.enable_fd_watch(fd, side, flags)
            }
            BackendAction::DisableFd { handle, secondary } => {
                let fd = self.fd_of(handle);
                let side = if secondary { Side::Secondary } else { Side::Primary };
                self.backend.disable_fd_watch(fd, side)
            }
            BackendAction::RearmSignal { handle } => {
                let signo = self.signo_of(handle);
                self.backend.rearm_signal_watch(signo)
            }
            BackendAction::DisableSignal { .. } => {
                // Nothing to tell the backend: dispatch.rs already flipped
                // SignalPayload::enabled so drained-but-disabled events are
                // dropped instead of re-queued.
                Ok(())
            }
            BackendAction::RemoveTimer { handle } => self.remove_timer_watch(handle),
            BackendAction::Requeue { handle } => {
                let flags = self.watch_flags_of(handle);
                self.dispatch.receive_fd_event(handle, flags);
                Ok(())
            }
            BackendAction::Remove { handle, .. } => self.remove_watch(handle),
        }
    }

    /// Tear down one watcher. For a bidi primary, tears down both halves
    /// as a unit and fires `watch_removed` exactly once, matching the
    /// composite-ownership contract.
    fn remove_watch(&mut self, handle: Handle) -> Result<()> {
        let kind = self.dispatch.state(handle).kind;
        match kind {
            WatchKind::Fd => {
                if let Some(secondary) = self.dispatch.state(handle).bidi_secondary {
                    // The other half may still be sitting in the current
                    // dispatch batch, awaiting its own begin_dispatch. If so,
                    // defer: whichever half finishes dispatching last is the
                    // one that actually tears the composite down.
                    if self.dispatch.state(secondary).active {
                        self.dispatch.state_mut(handle).deleteme = true;
                        self.dispatch.state_mut(secondary).deleteme = true;
                        return Ok(());
                    }
                    let fd = self.fd_of(handle);
                    self.backend.remove_bidi_fd_watch(fd)?;
                    self.dispatch.state_mut(handle).handler.notify_removed();
                    self.dispatch.deallocate(secondary);
                    self.dispatch.deallocate(handle);
                    log::trace!("watcher {handle:?} (bidi) torn down");
                    return Ok(());
                }
                let fd = self.fd_of(handle);
                self.backend.remove_fd_watch(fd, Side::Primary)?;
            }
            WatchKind::SecondaryFd => {
                let primary = self
                    .dispatch
                    .state(handle)
                    .bidi_primary
                    .expect("secondary fd watcher always carries its primary's handle");
                // The primary already asked for removal and deferred to us
                // because we were still in flight; now that we're finishing,
                // perform the actual composite teardown from this side.
                if self.dispatch.state(primary).deleteme && !self.dispatch.state(primary).active {
                    let fd = self.fd_of(handle);
                    self.backend.remove_bidi_fd_watch(fd)?;
                    self.dispatch.state_mut(primary).handler.notify_removed();
                    self.dispatch.deallocate(handle);
                    self.dispatch.deallocate(primary);
                    log::trace!("watcher {primary:?} (bidi) torn down");
                    return Ok(());
                }
                let fd = self.fd_of(handle);
                self.backend.remove_fd_watch(fd, Side::Secondary)?;
            }
            WatchKind::Signal => {
                let signo = self.signo_of(handle);
                self.backend.remove_signal_watch(signo)?;
                self.signals.remove(&signo);
            }
            WatchKind::Child => {
                let pid = self.pid_of(handle);
                self.backend.remove_child_watch(pid)?;
                self.children.remove(&pid);
            }
            WatchKind::Timer => {
                self.remove_timer_watch(handle)?;
            }
        }
        self.dispatch.state_mut(handle).handler.notify_removed();
        self.dispatch.deallocate(handle);
        log::trace!("watcher {handle:?} torn down");
        Ok(())
    }

    fn remove_timer_watch(&mut self, handle: Handle) -> Result<()> {
        let (clock, queue_handle) = match &self.dispatch.state(handle).payload {
            Payload::Timer(timer) => (timer.clock, timer.queue_handle),
            _ => unreachable!("remove_timer_watch on a non-timer watcher"),
        };
        if let Some(qh) = queue_handle {
            self.timers_mut(clock).remove(qh);
        }
        self.sync_kernel_timer(clock)
    }
}

/// The asynchronous event-notification core: one backend, one dispatch
/// arena, two timer queues (monotonic and realtime), serialized through
/// the attention lock. `B` defaults to whichever concrete backend this
/// platform/feature combination selects; pin a specific one (mostly
/// useful in tests) with [`EventLoop::with_backend`].
///
/// `L` is the mutex type guarding the loop's internal state, bounded by
/// [`RawLock`]. It defaults to [`RawMutex`], which supports concurrent
/// registration and multiple runner threads; [`SingleThreaded`] collapses
/// this to [`crate::sync::NullLock`] for callers who only ever touch one
/// `EventLoop` from one thread and want to shed the locking overhead.
pub struct EventLoop<B: Backend = backend::DefaultBackend, L: RawLock<LoopState<B>> = RawMutex<LoopState<B>>> {
    state: L,
    attention: AttentionLock,
    wake_fd: RawFd,
}

/// An `EventLoop` specialized on [`crate::sync::NullLock`], for callers who
/// guarantee only one thread ever touches this loop. See
/// [`EventLoop::new_single_threaded`]/[`EventLoop::with_backend_single_threaded`].
pub type SingleThreaded<B = backend::DefaultBackend> = EventLoop<B, crate::sync::NullLock<LoopState<B>>>;

impl<B: Backend, L: RawLock<LoopState<B>>> EventLoop<B, L> {
    pub fn with_backend(backend: B) -> Self {
        let wake_fd = backend.wake_fd();
        Self {
            state: L::new(LoopState {
                dispatch: EventDispatch::new(),
                monotonic: TimerQueue::new(),
                realtime: TimerQueue::new(),
                backend,
                children: HashMap::new(),
                signals: HashMap::new(),
            }),
            attention: AttentionLock::new(),
            wake_fd,
        }
    }

    /// Wake a poller that may be blocked in the kernel wait, without
    /// touching the state mutex it holds for the duration of that wait.
    fn nudge(&self) {
        let byte = 1u8;
        // SAFETY: wake_fd is the write end of the backend's self-pipe,
        // open for the lifetime of the backend; byte is a valid 1-byte
        // buffer. A lost/merged write here just means one fewer spurious
        // wakeup; pull_events tolerates that.
        unsafe {
            libc::write(self.wake_fd, &byte as *const u8 as *const _, 1);
        }
    }

    fn acquire_for_mutation(&self) -> crate::sync::AttentionGuard<'_> {
        self.nudge();
        self.attention.acquire_for_mutation()
    }

    /// Register a plain (single-direction) fd watcher. If the descriptor's
    /// type can't be watched natively and `may_emulate` is set, the
    /// watcher is registered anyway and treated as perpetually ready
    /// (re-queued after every dispatch) instead of failing.
    pub fn register_fd(
        &self,
        fd: RawFd,
        flags: WatchFlags,
        priority: i32,
        enabled: bool,
        may_emulate: bool,
        handler: Box<dyn FdHandler + Send>,
    ) -> Result<Handle> {
        validate_priority(priority)?;
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            let handle = s.dispatch.register(
                WatchKind::Fd,
                dispatch::new_fd_payload(fd, flags),
                HandlerBox::Fd(handler),
            )?;
            s.dispatch.state_mut(handle).priority = priority;
            match s.backend.add_fd_watch(fd, handle, flags, enabled, may_emulate) {
                Ok(true) => Ok(handle),
                Ok(false) => {
                    s.dispatch.state_mut(handle).emulate_fd = true;
                    if enabled {
                        s.dispatch.receive_fd_event(handle, flags);
                    }
                    Ok(handle)
                }
                Err(err) => {
                    log::warn!("add_fd_watch failed for fd {fd}: {err}");
                    s.dispatch.deallocate(handle);
                    Err(err)
                }
            }
        })
    }

    /// Register a bidirectional fd watcher: one allocation at this API
    /// surface, backed internally by a primary (read) and secondary
    /// (write) dispatch slot sharing one descriptor. Returns the primary
    /// handle, which also identifies the composite for deregistration,
    /// [`EventLoop::set_out_watch_enabled`], and [`EventLoop::set_watches`].
    pub fn register_bidi_fd(
        &self,
        fd: RawFd,
        flags: WatchFlags,
        priority: i32,
        may_emulate: bool,
        handler: Box<dyn BidiFdHandler + Send>,
    ) -> Result<Handle> {
        validate_priority(priority)?;
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            let primary = s.dispatch.register(
                WatchKind::Fd,
                dispatch::new_fd_payload(fd, flags),
                HandlerBox::BidiFd(handler),
            )?;
            let secondary = match s.dispatch.register(
                WatchKind::SecondaryFd,
                Payload::SecondaryFd { event_flags: WatchFlags::NONE },
                HandlerBox::None,
            ) {
                Ok(secondary) => secondary,
                Err(err) => {
                    s.dispatch.deallocate(primary);
                    return Err(err);
                }
            };
            s.dispatch.state_mut(primary).priority = priority;
            s.dispatch.state_mut(secondary).priority = priority;
            s.dispatch.state_mut(secondary).bidi_primary = Some(primary);
            s.dispatch.state_mut(primary).bidi_secondary = Some(secondary);

            match s.backend.add_bidi_fd_watch(fd, primary, secondary, flags, may_emulate) {
                Ok(emulate) => {
                    if emulate.contains(WatchFlags::OUT) {
                        s.dispatch.state_mut(secondary).emulate_fd = true;
                    }
                    if emulate.contains(WatchFlags::IN) {
                        s.dispatch.state_mut(primary).emulate_fd = true;
                    }
                    Ok(primary)
                }
                Err(err) => {
                    s.dispatch.deallocate(secondary);
                    s.dispatch.deallocate(primary);
                    Err(err)
                }
            }
        })
    }

    /// Enable or disable the secondary (write) half of a bidi watcher
    /// without touching the primary.
    pub fn set_out_watch_enabled(&self, primary: Handle, enabled: bool) -> Result<()> {
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            if s.dispatch.state(primary).bidi_secondary.is_none() {
                return Err(Error::NotRegistered);
            }
            let fd = s.fd_of(primary);
            if enabled {
                s.backend.enable_fd_watch(fd, Side::Secondary, WatchFlags::OUT)
            } else {
                s.backend.disable_fd_watch(fd, Side::Secondary)
            }
        })
    }

    /// Set the secondary half's watch mask directly (enabling whichever
    /// of IN/OUT is present in `mask`, disabling the other); the primary
    /// side is unaffected.
    pub fn set_watches(&self, primary: Handle, mask: WatchFlags) -> Result<()> {
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            if s.dispatch.state(primary).bidi_secondary.is_none() {
                return Err(Error::NotRegistered);
            }
            let fd = s.fd_of(primary);
            if mask.contains(WatchFlags::OUT) {
                s.backend.enable_fd_watch(fd, Side::Secondary, WatchFlags::OUT)
            } else {
                s.backend.disable_fd_watch(fd, Side::Secondary)
            }
        })
    }

    /// Register a signal watcher. The caller must have already blocked
    /// `signo` in the process signal mask and must not unblock it while
    /// the watcher is registered.
    pub fn register_signal(
        &self,
        signo: i32,
        priority: i32,
        handler: Box<dyn SignalHandler + Send>,
    ) -> Result<Handle> {
        validate_priority(priority)?;
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            if s.signals.contains_key(&signo) {
                return Err(Error::AlreadyRegistered);
            }
            let handle = s.dispatch.register(
                WatchKind::Signal,
                dispatch::new_signal_payload(signo),
                HandlerBox::Signal(handler),
            )?;
            s.dispatch.state_mut(handle).priority = priority;
            match s.backend.add_signal_watch(signo, handle) {
                Ok(()) => {
                    s.signals.insert(signo, handle);
                    Ok(handle)
                }
                Err(err) => {
                    s.dispatch.deallocate(handle);
                    Err(err)
                }
            }
        })
    }

    /// Register a child-exit watcher for `pid`.
    pub fn register_child(
        &self,
        pid: libc::pid_t,
        priority: i32,
        handler: Box<dyn ChildHandler + Send>,
    ) -> Result<Handle> {
        validate_priority(priority)?;
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            if s.children.contains_key(&pid) {
                return Err(Error::AlreadyRegistered);
            }
            let handle = s.dispatch.register(
                WatchKind::Child,
                dispatch::new_child_payload(pid),
                HandlerBox::Child(handler),
            )?;
            s.dispatch.state_mut(handle).priority = priority;
            match s.backend.add_child_watch(pid, handle) {
                Ok(()) => {
                    s.children.insert(pid, handle);
                    Ok(handle)
                }
                Err(err) => {
                    s.dispatch.deallocate(handle);
                    Err(err)
                }
            }
        })
    }

    /// Register a timer watcher against `clock`, initially disarmed.
    /// Call [`EventLoop::set_timer`] to arm it.
    pub fn register_timer(
        &self,
        clock: Clock,
        priority: i32,
        handler: Box<dyn TimerHandler + Send>,
    ) -> Result<Handle> {
        validate_priority(priority)?;
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            let handle = s.dispatch.register(
                WatchKind::Timer,
                dispatch::new_timer_payload(clock),
                HandlerBox::Timer(handler),
            )?;
            s.dispatch.state_mut(handle).priority = priority;
            Ok(handle)
        })
    }

    /// Arm (or rearm) a timer watcher at an absolute `deadline`, with
    /// `interval` (zero for one-shot) applied on every subsequent expiry.
    pub fn set_timer(&self, handle: Handle, deadline: Timespec, interval: Timespec) -> Result<()> {
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            let clock = match &mut s.dispatch.state_mut(handle).payload {
                Payload::Timer(timer) => {
                    timer.interval = interval;
                    timer.enabled = true;
                    timer.clock
                }
                _ => return Err(Error::UnsupportedDescriptor),
            };
            let queue_handle = match &s.dispatch.state(handle).payload {
                Payload::Timer(timer) => timer.queue_handle,
                _ => unreachable!("payload kind cannot change after registration"),
            };
            let queue_handle = match queue_handle {
                Some(qh) => qh,
                None => {
                    let qh = s.timers_mut(clock).allocate(handle)?;
                    if let Payload::Timer(timer) = &mut s.dispatch.state_mut(handle).payload {
                        timer.queue_handle = Some(qh);
                    }
                    qh
                }
            };
            s.timers_mut(clock).set_timer(queue_handle, deadline);
            s.sync_kernel_timer(clock)
        })
    }

    /// Deregister any watcher (for a bidi fd, pass the primary handle).
    /// Returns immediately; if the watcher was mid-dispatch, the actual
    /// backend removal and `watch_removed` callback happen once the
    /// in-flight batch finishes (see [`EventLoop::run`]/[`EventLoop::poll`]).
    pub fn deregister(&self, handle: Handle) -> Result<()> {
        let _guard = self.acquire_for_mutation();
        self.state.with(|s| {
            if s.dispatch.issue_delete(handle) {
                s.remove_watch(handle)
            } else {
                Ok(())
            }
        })
    }

    /// One non-blocking pass: dispatch whatever is already ready, then
    /// pull (without waiting) whatever the backend has pending, and
    /// dispatch that too. Never suspends on user code.
    pub fn poll(&self) -> Result<bool> {
        Ok(self.run_iteration(false)? > 0)
    }

    /// Run until `max_dispatches` watchers have been dispatched (each
    /// call to a handler counts once), blocking between batches as
    /// needed.
    pub fn run_n(&self, max_dispatches: usize) -> Result<()> {
        let mut dispatched = 0;
        while dispatched < max_dispatches {
            dispatched += self.run_iteration(true)? as usize;
        }
        Ok(())
    }

    /// Run forever, alternating between dispatching ready watchers and
    /// blocking in the backend's kernel wait.
    pub fn run(&self) -> Result<()> {
        loop {
            self.run_iteration(true)?;
        }
    }

    /// One full reference-style `processEvents`-then-maybe-`pull_events`
    /// cycle. Returns the number of watchers dispatched.
    fn run_iteration(&self, wait: bool) -> Result<u32> {
        let dispatched = self.process_ready()?;
        if dispatched > 0 {
            return Ok(dispatched);
        }

        let guard = self.attention.acquire_for_poll();
        let events = self.state.with(|s| -> Result<Vec<BackendEvent>> {
            let mut events = Vec::new();
            s.backend.pull_events(wait, &mut events)?;
            Ok(events)
        })?;
        drop(guard);

        if events.is_empty() {
            return Ok(0);
        }

        let _guard = self.acquire_for_mutation();
        self.state.with(|s| -> Result<()> {
            for event in events {
                Self::feed_event(s, event)?;
            }
            Ok(())
        })?;

        self.process_ready()
    }

    fn feed_event(s: &mut LoopState<B>, event: BackendEvent) -> Result<()> {
        match event {
            BackendEvent::Woken => {}
            BackendEvent::Fd { handle, flags, .. } => {
                s.dispatch.receive_fd_event(handle, flags);
            }
            BackendEvent::Signal { handle, signo, code, pid } => {
                s.dispatch
                    .receive_signal(handle, crate::watcher::SigInfo { signo, code, pid });
            }
            BackendEvent::ChildExit { pid, status } => {
                if let Some(&handle) = s.children.get(&pid) {
                    s.dispatch.receive_child_stat(handle, status);
                }
            }
            BackendEvent::TimerExpired { clock } => {
                let now = clock.now();
                let expired = {
                    let dispatch = &s.dispatch;
                    let timers = match clock {
                        Clock::Monotonic => &mut s.monotonic,
                        Clock::Realtime => &mut s.realtime,
                    };
                    timer::drain_expired(timers, now, |watcher| {
                        match &dispatch.state(watcher).payload {
                            Payload::Timer(timer) => timer.interval,
                            _ => unreachable!("timer queue only ever holds timer watchers"),
                        }
                    })?
                };
                for expiry in expired {
                    s.dispatch
                        .receive_timer_expiry(expiry.watcher, expiry.expiry_count_delta);
                }
                s.sync_kernel_timer(clock)?;
            }
        }
        Ok(())
    }

    /// Dispatch every watcher currently in the ready queue. Each handler
    /// call happens with neither the attention lock nor the state mutex
    /// held, so a handler is free to call back into `register_*`,
    /// `deregister`, `set_timer`, and friends on this same `EventLoop` from
    /// the same thread without deadlocking on a lock it already holds.
    fn process_ready(&self) -> Result<u32> {
        let batch = {
            let _guard = self.acquire_for_mutation();
            self.state.with(|s| s.dispatch.take_ready_batch())
        };
        if batch.is_empty() {
            return Ok(0);
        }

        for handle in &batch {
            let handle = *handle;
            let begun = {
                let _guard = self.acquire_for_mutation();
                self.state.with(|s| s.dispatch.begin_dispatch(handle))
            };
            let action = match begun {
                None => {
                    let _guard = self.acquire_for_mutation();
                    self.state.with(|s| s.dispatch.removed_before_dispatch(handle))
                }
                Some((mut handler, input)) => {
                    let decision = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        dispatch::invoke_handler(&mut handler, input)
                    }))
                    .unwrap_or_else(|_| {
                        log::error!("{}", Error::CallbackPanicked);
                        Rearm::Remove
                    });
                    let _guard = self.acquire_for_mutation();
                    self.state
                        .with(|s| s.dispatch.finish_dispatch(handle, handler, decision))
                }
            };
            let _guard = self.acquire_for_mutation();
            self.state.with(|s| s.apply_action(action))?;
        }
        Ok(batch.len() as u32)
    }
}

impl EventLoop<backend::DefaultBackend> {
    /// Build an event loop on the platform/feature-selected default backend,
    /// synchronized with a real mutex for use across threads.
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(backend::DefaultBackend::new()?))
    }
}

impl SingleThreaded<backend::DefaultBackend> {
    /// Build an event loop on the default backend with all internal
    /// synchronization collapsed to a no-op, for a caller that guarantees
    /// only one thread will ever touch it.
    pub fn new_single_threaded() -> Result<Self> {
        Ok(Self::with_backend(backend::DefaultBackend::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timespec;
    use crate::watcher::{Rearm as R, SigInfo};
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingFd {
        calls: Arc<AtomicU32>,
        rearm: Rearm,
    }

    impl FdHandler for CountingFd {
        fn on_ready(&mut self, _fd: RawFd, _flags: WatchFlags) -> Rearm {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rearm
        }
    }

    struct CountingTimer {
        calls: Arc<AtomicU32>,
    }

    impl TimerHandler for CountingTimer {
        fn on_expiry(&mut self, _count: u32) -> Rearm {
            self.calls.fetch_add(1, Ordering::SeqCst);
            R::Disarm
        }
    }

    struct NoopSignal;
    impl SignalHandler for NoopSignal {
        fn on_signal(&mut self, _info: SigInfo) -> Rearm {
            R::Rearm
        }
    }

    #[test]
    fn poll_drains_a_self_pipe_wake_without_dispatching_anything() {
        let event_loop: EventLoop<backend::DefaultBackend> =
            EventLoop::new().expect("backend available in test environment");
        event_loop.state.with(|s| s.backend.interrupt()).unwrap();
        let dispatched = event_loop.poll().unwrap();
        assert!(!dispatched);
    }

    #[test]
    fn registering_a_pipe_fd_and_writing_to_it_dispatches_once() {
        let event_loop: EventLoop<backend::DefaultBackend> = EventLoop::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let calls = Arc::new(AtomicU32::new(0));
        event_loop
            .register_fd(
                fds[0],
                WatchFlags::IN,
                50,
                true,
                false,
                Box::new(CountingFd { calls: Arc::clone(&calls), rearm: R::Disarm }),
            )
            .unwrap();
        unsafe {
            libc::write(fds[1], b"x".as_ptr() as *const _, 1);
        }
        event_loop.run_n(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn one_shot_timer_dispatches_exactly_once() {
        let event_loop: EventLoop<backend::DefaultBackend> = EventLoop::new().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let handle = event_loop
            .register_timer(Clock::Monotonic, 50, Box::new(CountingTimer { calls: Arc::clone(&calls) }))
            .unwrap();
        let deadline = Clock::Monotonic.now().add(Timespec::new(0, 1_000_000));
        event_loop.set_timer(handle, deadline, Timespec::ZERO).unwrap();
        event_loop.run_n(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_before_dispatch_is_silent() {
        let event_loop: EventLoop<backend::DefaultBackend> = EventLoop::new().unwrap();
        let handle = event_loop
            .register_signal(libc::SIGUSR2, 50, Box::new(NoopSignal))
            .unwrap();
        event_loop.deregister(handle).unwrap();
    }

    #[test]
    fn single_threaded_specialization_dispatches_without_a_real_mutex() {
        let event_loop: SingleThreaded = SingleThreaded::new_single_threaded().unwrap();
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let calls = Arc::new(AtomicU32::new(0));
        event_loop
            .register_fd(
                fds[0],
                WatchFlags::IN,
                50,
                true,
                false,
                Box::new(CountingFd { calls: Arc::clone(&calls), rearm: R::Disarm }),
            )
            .unwrap();
        unsafe {
            libc::write(fds[1], b"x".as_ptr() as *const _, 1);
        }
        event_loop.run_n(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn registering_with_an_out_of_range_priority_is_rejected() {
        let event_loop: EventLoop<backend::DefaultBackend> = EventLoop::new().unwrap();
        let err = event_loop
            .register_signal(libc::SIGUSR2, 1000, Box::new(NoopSignal))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPriority(1000)));
    }

    #[test]
    fn registering_the_same_signal_twice_is_rejected() {
        let event_loop: EventLoop<backend::DefaultBackend> = EventLoop::new().unwrap();
        let _handle = event_loop
            .register_signal(libc::SIGUSR2, 50, Box::new(NoopSignal))
            .unwrap();
        let err = event_loop
            .register_signal(libc::SIGUSR2, 50, Box::new(NoopSignal))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered));
    }
}
