/*
 * timer.rs
 *
 * One stable priority queue per clock (monotonic, realtime), keyed by
 * absolute deadline. The dispatch arena's handle for a timer watcher is
 * the *value* stored in this queue; `TimerPayload::queue_handle` is the
 * watcher's handle *into* this queue, so the two can find each other in
 * O(1) both ways.
 */

use crate::priority_queue::{Handle as ArenaHandle, Handle as QueueHandle, PriorityQueue};
use crate::time::{divide_timespec, Clock, Timespec};

pub(crate) struct TimerQueue {
    queue: PriorityQueue<ArenaHandle, Timespec>,
}

/// What happened to one timer watcher while draining expired deadlines.
pub(crate) struct TimerExpiry {
    pub watcher: ArenaHandle,
    pub expiry_count_delta: u32,
    /// `None` means the timer was one-shot and has been pulled from the
    /// queue entirely; `Some(new_deadline)` means it was re-armed in place.
    pub rearmed_at: Option<Timespec>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
        }
    }

    pub fn allocate(&mut self, watcher: ArenaHandle) -> crate::error::Result<QueueHandle> {
        self.queue
            .allocate(watcher)
            .map_err(|_| crate::error::Error::QueueExhausted)
    }

    pub fn deallocate(&mut self, handle: QueueHandle) {
        self.queue.deallocate(handle);
    }

    pub fn is_queued(&self, handle: QueueHandle) -> bool {
        self.queue.is_queued(handle)
    }

    /// Implements `set_timer`: if already queued at a different deadline,
    /// reprioritize; otherwise insert. Returns true iff the kernel timer
    /// for this clock must be re-armed (this timer became, or remains,
    /// the new earliest deadline).
    pub fn set_timer(&mut self, handle: QueueHandle, deadline: Timespec) -> bool {
        if self.queue.is_queued(handle) {
            self.queue.set_priority(handle, deadline)
        } else {
            self.queue.insert(handle, deadline)
        }
    }

    pub fn remove(&mut self, handle: QueueHandle) {
        if self.queue.is_queued(handle) {
            self.queue.remove(handle);
        }
    }

    pub fn root_deadline(&self) -> Option<Timespec> {
        self.queue.get_root_priority().copied()
    }

    pub fn empty(&self) -> bool {
        self.queue.empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every deadline at or before `now`, one entry at a time. Caller
/// supplies `interval_of`/`enabled_of` (read the watcher's current
/// interval/enabled state from the dispatch arena) since this type does
/// not itself own watcher payloads. Returns the list of watchers that
/// expired, in root-pull order, alongside their deadline update.
///
/// For a periodic timer (`interval != 0`), the new deadline is computed
/// as `deadline + (overrun + 1) * interval` using `divide_timespec` to
/// get the overrun count without risking 64-bit overflow on a huge
/// elapsed/interval ratio; for a one-shot, the watcher is pulled from the
/// queue for good.
pub(crate) fn drain_expired(
    queue: &mut TimerQueue,
    now: Timespec,
    mut interval_of: impl FnMut(ArenaHandle) -> Timespec,
) -> crate::error::Result<Vec<TimerExpiry>> {
    let mut expired = Vec::new();
    while let Some(deadline) = queue.root_deadline() {
        if deadline > now {
            break;
        }
        let handle = queue
            .queue
            .get_root()
            .expect("root_deadline returned Some without a root");
        let watcher = *queue.queue.value(handle);
        let interval = interval_of(watcher);

        if interval.is_zero() {
            queue.queue.pull_root();
            expired.push(TimerExpiry {
                watcher,
                expiry_count_delta: 1,
                rearmed_at: None,
            });
        } else {
            let elapsed = now.saturating_sub(deadline);
            let (overrun, _rem) = divide_timespec(elapsed, interval);
            let periods = overrun + 1;
            let mut new_deadline = deadline;
            for _ in 0..periods {
                new_deadline = new_deadline
                    .checked_add(interval)
                    .ok_or(crate::error::Error::TimerOverflow)?;
            }
            queue.queue.set_priority(handle, new_deadline);
            expired.push(TimerExpiry {
                watcher,
                expiry_count_delta: periods as u32,
                rearmed_at: Some(new_deadline),
            });
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_arena_handle(queue: &mut PriorityQueue<(), i32>) -> ArenaHandle {
        let h = queue.allocate(()).unwrap();
        queue.insert(h, 0);
        h
    }

    #[test]
    fn one_shot_timer_expires_once() {
        let mut arena: PriorityQueue<(), i32> = PriorityQueue::new();
        let watcher = dummy_arena_handle(&mut arena);

        let mut timers = TimerQueue::new();
        let qh = timers.allocate(watcher).unwrap();
        timers.set_timer(qh, Timespec::new(1, 0));

        let expired = drain_expired(&mut timers, Timespec::new(1, 0), |_| Timespec::ZERO).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].expiry_count_delta, 1);
        assert!(expired[0].rearmed_at.is_none());
        assert!(timers.empty());
    }

    #[test]
    fn periodic_timer_reports_overrun() {
        let mut arena: PriorityQueue<(), i32> = PriorityQueue::new();
        let watcher = dummy_arena_handle(&mut arena);

        let mut timers = TimerQueue::new();
        let qh = timers.allocate(watcher).unwrap();
        // Deadline at 1s, 1s interval; observed at t=3.5s => 3 full periods.
        timers.set_timer(qh, Timespec::new(1, 0));

        let expired = drain_expired(&mut timers, Timespec::new(3, 500_000_000), |_| {
            Timespec::new(1, 0)
        })
        .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].expiry_count_delta, 3);
        assert_eq!(expired[0].rearmed_at, Some(Timespec::new(4, 0)));
    }

    #[test]
    fn stable_ordering_across_equal_deadlines() {
        let mut arena: PriorityQueue<(), i32> = PriorityQueue::new();
        let mut timers = TimerQueue::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            let watcher = dummy_arena_handle(&mut arena);
            let qh = timers.allocate(watcher).unwrap();
            timers.set_timer(qh, Timespec::new(1, i));
            handles.push(watcher);
        }
        for (i, &expected) in handles.iter().enumerate() {
            let deadline = Timespec::new(1, i as i64);
            let expired = drain_expired(&mut timers, deadline, |_| Timespec::ZERO).unwrap();
            assert_eq!(expired.len(), 1);
            assert_eq!(expired[0].watcher, expected);
        }
    }
}
