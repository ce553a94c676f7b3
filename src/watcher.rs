/*
 * watcher.rs
 *
 * Watcher bases. The reference implementation gets polymorphism from a
 * `base_watcher` class hierarchy plus a `void *` userdata pointer the
 * kernel hands back; callbacks downcast based on a `watch_type_t` tag.
 * We keep the tag but replace the downcast with a closed enum of
 * payloads, so there is no unsafe pointer juggling at dispatch time.
 */

use crate::priority_queue::Handle;
use crate::time::{Clock, Timespec};
use std::os::fd::RawFd;

/// What a watcher does after its handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Re-enable the backend filter so the watcher fires again.
    Rearm,
    /// Leave the watcher registered but disabled.
    Disarm,
    /// Do nothing to backend state; caller manages it explicitly.
    Noop,
    /// Deregister the watcher and invoke `watch_removed`.
    Remove,
}

/// Default dispatch priority; lower values dispatch earlier.
pub const DEFAULT_PRIORITY: i32 = 50;

/// A descriptor can be watched for readability, writability, or both. A
/// bidi fd watcher's two halves always report and dispatch independently;
/// there is no flag to opt out of that (see [`crate::EventLoop::register_bidi_fd`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchFlags(u8);

impl WatchFlags {
    pub const IN: WatchFlags = WatchFlags(1 << 0);
    pub const OUT: WatchFlags = WatchFlags(1 << 1);
    pub const ONE_SHOT: WatchFlags = WatchFlags(1 << 2);
    pub const NONE: WatchFlags = WatchFlags(0);

    #[must_use]
    pub const fn contains(self, other: WatchFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: WatchFlags) -> WatchFlags {
        WatchFlags(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: WatchFlags) -> WatchFlags {
        WatchFlags(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: WatchFlags) -> WatchFlags {
        WatchFlags(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for WatchFlags {
    type Output = WatchFlags;
    fn bitor(self, rhs: WatchFlags) -> WatchFlags {
        self.union(rhs)
    }
}

/// Tag identifying which payload a watcher carries. Mirrors the source's
/// `watch_type_t`, minus the `void*` downcast it was used to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Signal,
    Fd,
    SecondaryFd,
    Child,
    Timer,
}

/// Captured siginfo snapshot, written just before a signal watcher dispatches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub pid: libc::pid_t,
}

pub(crate) struct FdPayload {
    pub fd: RawFd,
    pub watch_flags: WatchFlags,
    pub event_flags: WatchFlags,
}

pub(crate) struct SignalPayload {
    pub signo: i32,
    pub siginfo: SigInfo,
    /// `false` after a DISARM decision: the backend event for this signal is
    /// still drained (so a drain-style backend doesn't spin) but dropped
    /// instead of being queued for dispatch, until a REARM decision flips
    /// this back.
    pub enabled: bool,
}

pub(crate) struct ChildPayload {
    pub pid: libc::pid_t,
    pub terminated: bool,
    pub status: i32,
}

pub(crate) struct TimerPayload {
    pub clock: Clock,
    pub interval: Timespec,
    pub expiry_count: u32,
    pub enabled: bool,
    /// Handle into the per-clock timer priority queue, assigned at registration.
    pub queue_handle: Option<Handle>,
}

pub(crate) enum Payload {
    Fd(FdPayload),
    /// The secondary (write) half of a bidi fd watcher shares its
    /// primary's descriptor and flags; only its own `event_flags` and
    /// ready-queue linkage are independent.
    SecondaryFd { event_flags: WatchFlags },
    Signal(SignalPayload),
    Child(ChildPayload),
    Timer(TimerPayload),
}

/// Boxed user callback, tagged the same way as the payload it goes with.
pub(crate) enum HandlerBox {
    Fd(Box<dyn FdHandler + Send>),
    BidiFd(Box<dyn BidiFdHandler + Send>),
    Signal(Box<dyn SignalHandler + Send>),
    Child(Box<dyn ChildHandler + Send>),
    Timer(Box<dyn TimerHandler + Send>),
    /// The secondary half of a bidi watcher dispatches through the
    /// primary's `BidiFdHandler::on_writable`; it carries no handler of
    /// its own.
    None,
}

impl HandlerBox {
    pub(crate) fn notify_removed(&mut self) {
        match self {
            HandlerBox::Fd(h) => h.watch_removed(),
            HandlerBox::BidiFd(h) => h.watch_removed(),
            HandlerBox::Signal(h) => h.watch_removed(),
            HandlerBox::Child(h) => h.watch_removed(),
            HandlerBox::Timer(h) => h.watch_removed(),
            HandlerBox::None => {}
        }
    }
}

/// Shared watcher state, corresponding to `base_watcher`. One instance
/// backs every registered watcher, reached through the dispatch layer's
/// arena (itself the same priority queue used for the ready list, exactly
/// as the handle a watcher carries is a handle into that ready queue).
pub(crate) struct WatcherState {
    pub kind: WatchKind,
    pub active: bool,
    pub deleteme: bool,
    pub emulate_fd: bool,
    pub emulate_enabled: bool,
    pub priority: i32,
    pub payload: Payload,
    pub handler: HandlerBox,
    /// For a bidi watcher's secondary slot, the arena handle of its primary.
    pub bidi_primary: Option<Handle>,
    /// For a bidi watcher's primary slot, the arena handle of its secondary.
    /// The two are always torn down together, from the primary's side.
    pub bidi_secondary: Option<Handle>,
}

impl WatcherState {
    pub fn new(kind: WatchKind, payload: Payload, handler: HandlerBox) -> Self {
        Self {
            kind,
            active: false,
            deleteme: false,
            emulate_fd: false,
            emulate_enabled: false,
            priority: DEFAULT_PRIORITY,
            payload,
            handler,
            bidi_primary: None,
            bidi_secondary: None,
        }
    }
}

/// User-facing callback contract for a plain fd watcher.
pub trait FdHandler {
    fn on_ready(&mut self, fd: RawFd, flags: WatchFlags) -> Rearm;

    /// Called exactly once, strictly after any in-flight dispatch returns,
    /// once the watcher has been fully deregistered from both the backend
    /// and the dispatch arena. The default does nothing.
    fn watch_removed(&mut self) {}
}

/// Bidi fd watchers get independent callbacks for the read and write halves.
pub trait BidiFdHandler {
    fn on_readable(&mut self, fd: RawFd) -> Rearm;
    fn on_writable(&mut self, fd: RawFd) -> Rearm;

    /// Called once, after both the primary and secondary watches have been
    /// torn down.
    fn watch_removed(&mut self) {}
}

pub trait SignalHandler {
    fn on_signal(&mut self, info: SigInfo) -> Rearm;
    fn watch_removed(&mut self) {}
}

pub trait ChildHandler {
    fn on_child_exit(&mut self, pid: libc::pid_t, status: i32) -> Rearm;
    fn watch_removed(&mut self) {}
}

pub trait TimerHandler {
    /// `expiry_count` is the number of period boundaries (for a periodic
    /// timer) or always 1 (for a one-shot) accumulated since the last
    /// dispatch.
    fn on_expiry(&mut self, expiry_count: u32) -> Rearm;
    fn watch_removed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_flags_union_and_contains() {
        let f = WatchFlags::IN | WatchFlags::ONE_SHOT;
        assert!(f.contains(WatchFlags::IN));
        assert!(f.contains(WatchFlags::ONE_SHOT));
        assert!(!f.contains(WatchFlags::OUT));
    }

    #[test]
    fn watch_flags_difference() {
        let f = WatchFlags::IN | WatchFlags::OUT;
        assert_eq!(f.difference(WatchFlags::OUT), WatchFlags::IN);
    }
}
