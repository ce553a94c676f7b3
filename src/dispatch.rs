/*
 * dispatch.rs
 *
 * Owns watcher storage and the ready queue, and applies re-arm decisions.
 * Mirrors the reference `event_dispatch` class: the caller holds the
 * attention lock and state mutex while calling these methods, except
 * around the handler call itself (between `begin_dispatch` and
 * `finish_dispatch`), which runs with neither held so a handler can
 * reenter the event loop from the same thread.
 *
 * The ready queue and the watcher arena are the same data structure: a
 * watcher's arena handle IS its ready-queue handle, exactly mirroring the
 * reference design where `base_watcher::heap_handle` indexes the very
 * heap used to hold ready events. A watcher that is registered but idle
 * is simply an allocated-but-not-queued node.
 */

use crate::priority_queue::{Handle, PriorityQueue};
use crate::watcher::{
    ChildPayload, FdPayload, HandlerBox, Payload, Rearm, SigInfo, SignalPayload, TimerPayload,
    WatchFlags, WatchKind, WatcherState,
};

pub(crate) struct EventDispatch {
    arena: PriorityQueue<WatcherState, i32>,
}

/// What to do with backend state after a dispatched watcher's handler
/// returns, decided by `finish_dispatch` and carried out by the caller
/// (which owns the concrete backend).
pub(crate) enum BackendAction {
    EnableFd { handle: Handle, secondary: bool },
    DisableFd { handle: Handle, secondary: bool },
    RearmSignal { handle: Handle },
    DisableSignal { handle: Handle },
    RemoveTimer { handle: Handle },
    Remove { handle: Handle, secondary: bool },
    /// Re-queue an emulated watcher immediately (it's "always ready").
    Requeue { handle: Handle },
    None,
}

impl EventDispatch {
    pub fn new() -> Self {
        Self {
            arena: PriorityQueue::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: WatchKind,
        payload: Payload,
        handler: HandlerBox,
    ) -> crate::error::Result<Handle> {
        self.arena
            .allocate(WatcherState::new(kind, payload, handler))
            .map_err(|_| crate::error::Error::QueueExhausted)
    }

    pub fn deallocate(&mut self, handle: Handle) {
        self.arena.deallocate(handle);
    }

    pub fn state(&self, handle: Handle) -> &WatcherState {
        self.arena.value(handle)
    }

    pub fn state_mut(&mut self, handle: Handle) -> &mut WatcherState {
        self.arena.value_mut(handle)
    }

    pub fn is_queued(&self, handle: Handle) -> bool {
        self.arena.is_queued(handle)
    }

    fn enqueue(&mut self, handle: Handle) {
        if !self.arena.is_queued(handle) {
            let priority = self.arena.value(handle).priority;
            self.arena.insert(handle, priority);
        }
    }

    /// A readiness event arrived on `handle`'s descriptor. Accumulates the
    /// reported bits and queues the watcher for dispatch unless it is
    /// pending deletion. Returns `true` if it was queued.
    pub fn receive_fd_event(&mut self, handle: Handle, flags: WatchFlags) -> bool {
        let state = self.arena.value_mut(handle);
        if state.deleteme {
            return false;
        }
        match &mut state.payload {
            Payload::Fd(fd) => fd.event_flags = fd.event_flags.union(flags),
            Payload::SecondaryFd { event_flags } => *event_flags = event_flags.union(flags),
            _ => unreachable!("receive_fd_event on a non-fd watcher"),
        }
        state.active = true;
        self.enqueue(handle);
        true
    }

    /// A signal was delivered. Copies the siginfo into the watcher before
    /// queuing it. Returns `true` to request the backend mask the signal
    /// until it is re-armed.
    pub fn receive_signal(&mut self, handle: Handle, info: SigInfo) -> bool {
        let state = self.arena.value_mut(handle);
        if state.deleteme {
            return false;
        }
        match &mut state.payload {
            Payload::Signal(sig) if !sig.enabled => return false,
            Payload::Signal(sig) => sig.siginfo = info,
            _ => unreachable!("receive_signal on a non-signal watcher"),
        }
        state.active = true;
        self.enqueue(handle);
        true
    }

    /// A watched child process changed state (it exited, per `waitpid`).
    pub fn receive_child_stat(&mut self, handle: Handle, status: i32) -> bool {
        let state = self.arena.value_mut(handle);
        if state.deleteme {
            return false;
        }
        match &mut state.payload {
            Payload::Child(child) => {
                child.terminated = true;
                child.status = status;
            }
            _ => unreachable!("receive_child_stat on a non-child watcher"),
        }
        state.active = true;
        self.enqueue(handle);
        true
    }

    /// The kernel timer for `handle`'s clock fired and its deadline has
    /// passed. Caller has already computed the new `expiry_count`.
    pub fn receive_timer_expiry(&mut self, handle: Handle, expiry_count: u32) {
        let state = self.arena.value_mut(handle);
        if state.deleteme {
            return;
        }
        match &mut state.payload {
            Payload::Timer(timer) => timer.expiry_count = expiry_count,
            _ => unreachable!("receive_timer_expiry on a non-timer watcher"),
        }
        state.active = true;
        self.enqueue(handle);
    }

    /// Deregistration entry point. If the watcher is mid-dispatch, defers
    /// actual removal (by setting `deleteme`) until dispatch completes;
    /// otherwise requests immediate backend removal. Returns `true` if
    /// removal happened synchronously (caller must still invoke
    /// `watch_removed` and deallocate).
    pub fn issue_delete(&mut self, handle: Handle) -> bool {
        let state = self.arena.value_mut(handle);
        if state.active {
            state.deleteme = true;
            false
        } else {
            true
        }
    }

    /// Splice the entire ready queue out as a batch, in priority order.
    /// The caller dispatches each survivor with [`EventDispatch::begin_dispatch`]
    /// / [`EventDispatch::finish_dispatch`] around the actual handler call,
    /// with no lock held while the handler runs — which is what lets a
    /// handler call back into registration or deregistration on the same
    /// thread without deadlocking on a lock it already holds.
    pub fn take_ready_batch(&mut self) -> Vec<Handle> {
        let mut batch = Vec::new();
        while !self.arena.empty() {
            let handle = self.arena.get_root().expect("non-empty queue has a root");
            batch.push(handle);
            self.arena.pull_root();
        }
        batch
    }

    /// Begin dispatching `handle`. Returns `None` if it was already marked
    /// for deletion before its turn came up (the caller should treat this
    /// as an immediate `Remove`, with no handler call at all). Otherwise
    /// marks the watcher active, swaps its handler out for `HandlerBox::None`
    /// so the arena slot stays valid while the handler runs, and returns
    /// the handler plus a snapshot of whatever it needs to see.
    pub fn begin_dispatch(&mut self, handle: Handle) -> Option<(HandlerBox, DispatchInput)> {
        let state = self.arena.value_mut(handle);
        if state.deleteme {
            return None;
        }
        state.active = true;
        let input = DispatchInput::from_payload(&mut state.payload);
        let handler = std::mem::replace(&mut state.handler, HandlerBox::None);
        Some((handler, input))
    }

    /// Complete a dispatch begun with [`EventDispatch::begin_dispatch`]:
    /// puts the handler back, clears `active`, folds in any deregistration
    /// requested while the handler was running unlocked, and turns the
    /// resulting decision into the backend action the caller must apply.
    pub fn finish_dispatch(&mut self, handle: Handle, handler: HandlerBox, decision: Rearm) -> BackendAction {
        let state = self.arena.value_mut(handle);
        state.handler = handler;
        state.active = false;
        let decision = if state.deleteme { Rearm::Remove } else { decision };

        let secondary = matches!(state.kind, WatchKind::SecondaryFd);
        let emulated = state.emulate_fd;
        if let Payload::Signal(sig) = &mut state.payload {
            sig.enabled = matches!(decision, Rearm::Rearm);
        }
        match state.kind {
            WatchKind::Signal => match decision {
                Rearm::Rearm => BackendAction::RearmSignal { handle },
                Rearm::Disarm | Rearm::Noop => BackendAction::DisableSignal { handle },
                Rearm::Remove => BackendAction::Remove { handle, secondary: false },
            },
            WatchKind::Timer => match decision {
                Rearm::Remove => BackendAction::RemoveTimer { handle },
                _ => BackendAction::None,
            },
            _ => match decision {
                Rearm::Rearm if emulated => BackendAction::Requeue { handle },
                Rearm::Rearm => BackendAction::EnableFd { handle, secondary },
                Rearm::Disarm => BackendAction::DisableFd { handle, secondary },
                Rearm::Noop => BackendAction::None,
                Rearm::Remove => BackendAction::Remove { handle, secondary },
            },
        }
    }

    /// Backend action for a handle that turned out to be `deleteme` before
    /// `begin_dispatch` could even start it.
    pub fn removed_before_dispatch(&self, handle: Handle) -> BackendAction {
        BackendAction::Remove {
            handle,
            secondary: matches!(self.arena.value(handle).kind, WatchKind::SecondaryFd),
        }
    }
}

/// Whatever a handler needs to see to run, snapshotted out of a watcher's
/// payload so the handler can be called with no lock held.
pub(crate) enum DispatchInput {
    Fd { fd: std::os::fd::RawFd, flags: WatchFlags },
    SecondaryNoop,
    Signal(SigInfo),
    Child { pid: libc::pid_t, status: i32 },
    Timer { expiry_count: u32 },
}

impl DispatchInput {
    fn from_payload(payload: &mut Payload) -> Self {
        match payload {
            Payload::Fd(fd) => {
                let flags = fd.event_flags;
                fd.event_flags = WatchFlags::NONE;
                DispatchInput::Fd { fd: fd.fd, flags }
            }
            Payload::SecondaryFd { event_flags } => {
                *event_flags = WatchFlags::NONE;
                DispatchInput::SecondaryNoop
            }
            Payload::Signal(sig) => DispatchInput::Signal(sig.siginfo),
            Payload::Child(child) => DispatchInput::Child { pid: child.pid, status: child.status },
            Payload::Timer(timer) => {
                let count = timer.expiry_count;
                timer.expiry_count = 0;
                DispatchInput::Timer { expiry_count: count }
            }
        }
    }
}

/// Call the handler matching `input`, with no dispatch-internal lock held.
pub(crate) fn invoke_handler(handler: &mut HandlerBox, input: DispatchInput) -> Rearm {
    match (handler, input) {
        (HandlerBox::Fd(h), DispatchInput::Fd { fd, flags }) => h.on_ready(fd, flags),
        (HandlerBox::BidiFd(h), DispatchInput::Fd { fd, flags }) => {
            if flags.contains(WatchFlags::IN) {
                h.on_readable(fd)
            } else {
                h.on_writable(fd)
            }
        }
        (HandlerBox::None, _) => Rearm::Noop,
        (HandlerBox::Signal(h), DispatchInput::Signal(info)) => h.on_signal(info),
        (HandlerBox::Child(h), DispatchInput::Child { pid, status }) => h.on_child_exit(pid, status),
        (HandlerBox::Timer(h), DispatchInput::Timer { expiry_count }) => h.on_expiry(expiry_count),
        _ => unreachable!("handler/payload kind mismatch"),
    }
}

impl Default for EventDispatch {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn new_fd_payload(fd: std::os::fd::RawFd, watch_flags: WatchFlags) -> Payload {
    Payload::Fd(FdPayload {
        fd,
        watch_flags,
        event_flags: WatchFlags::NONE,
    })
}

pub(crate) fn new_signal_payload(signo: i32) -> Payload {
    Payload::Signal(SignalPayload {
        signo,
        siginfo: SigInfo::default(),
        enabled: true,
    })
}

pub(crate) fn new_child_payload(pid: libc::pid_t) -> Payload {
    Payload::Child(ChildPayload {
        pid,
        terminated: false,
        status: 0,
    })
}

pub(crate) fn new_timer_payload(clock: crate::time::Clock) -> Payload {
    Payload::Timer(TimerPayload {
        clock,
        interval: crate::time::Timespec::ZERO,
        expiry_count: 0,
        enabled: true,
        queue_handle: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::Rearm as R;

    /// Drive a full batch through the dispatch primitives the way the
    /// event loop does, but synchronously and without any lock to worry
    /// about, so tests can assert on ordering and actions directly.
    fn dispatch_batch(dispatch: &mut EventDispatch) -> Vec<(Handle, BackendAction)> {
        let mut results = Vec::new();
        for handle in dispatch.take_ready_batch() {
            match dispatch.begin_dispatch(handle) {
                None => results.push((handle, dispatch.removed_before_dispatch(handle))),
                Some((mut handler, input)) => {
                    let decision = invoke_handler(&mut handler, input);
                    let action = dispatch.finish_dispatch(handle, handler, decision);
                    results.push((handle, action));
                }
            }
        }
        results
    }

    #[test]
    fn fd_event_queues_and_dispatches_in_priority_order() {
        let mut dispatch = EventDispatch::new();
        let low_prio = dispatch
            .register(WatchKind::Fd, new_fd_payload(0, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        let high_prio = dispatch
            .register(WatchKind::Fd, new_fd_payload(1, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        dispatch.state_mut(high_prio).priority = 10;
        dispatch.state_mut(low_prio).priority = 90;

        dispatch.receive_fd_event(low_prio, WatchFlags::IN);
        dispatch.receive_fd_event(high_prio, WatchFlags::IN);

        let order: Vec<Handle> = dispatch_batch(&mut dispatch).into_iter().map(|(h, _)| h).collect();
        assert_eq!(order, vec![high_prio, low_prio]);
    }

    #[test]
    fn rearm_on_a_plain_fd_watcher_requests_enable() {
        let mut dispatch = EventDispatch::new();
        let a = dispatch
            .register(WatchKind::Fd, new_fd_payload(0, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        dispatch.receive_fd_event(a, WatchFlags::IN);
        let (handler, input) = dispatch.begin_dispatch(a).unwrap();
        assert!(matches!(input, DispatchInput::Fd { .. }));
        let action = dispatch.finish_dispatch(a, handler, R::Rearm);
        assert!(matches!(action, BackendAction::EnableFd { handle, secondary: false } if handle == a));
    }

    #[test]
    fn issue_delete_before_dispatch_is_immediate() {
        let mut dispatch = EventDispatch::new();
        let a = dispatch
            .register(WatchKind::Fd, new_fd_payload(0, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        assert!(dispatch.issue_delete(a));
    }

    #[test]
    fn issue_delete_during_active_dispatch_is_deferred() {
        let mut dispatch = EventDispatch::new();
        let a = dispatch
            .register(WatchKind::Fd, new_fd_payload(0, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        dispatch.state_mut(a).active = true;
        assert!(!dispatch.issue_delete(a));
        assert!(dispatch.state(a).deleteme);
    }

    #[test]
    fn deleteme_set_after_begin_dispatch_turns_into_remove() {
        let mut dispatch = EventDispatch::new();
        let a = dispatch
            .register(WatchKind::Fd, new_fd_payload(0, WatchFlags::IN), HandlerBox::None)
            .unwrap();
        dispatch.receive_fd_event(a, WatchFlags::IN);
        let (handler, _input) = dispatch.begin_dispatch(a).unwrap();
        // Simulate a reentrant deregister() landing while the handler is
        // "running" (unlocked, from the event loop's point of view).
        assert!(!dispatch.issue_delete(a));
        let action = dispatch.finish_dispatch(a, handler, R::Rearm);
        assert!(matches!(action, BackendAction::Remove { handle, .. } if handle == a));
    }
}
