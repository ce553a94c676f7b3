/*
 * sync.rs
 *
 * Two things live here:
 *
 *  - AtomicOnce<T>: lazy one-time initialization without pulling in a
 *    full std::sync::OnceLock dependency chain for the handful of
 *    process-wide capability probes backends need (is sigtimedwait
 *    available, etc).
 *
 *  - The two-queue attention/poll-wait lock. Only the thread at the head
 *    of the attention queue may mutate backend state or block in the
 *    kernel. Poll-only waiters queue separately so a steady stream of
 *    pollers can never starve a thread that wants to register or remove
 *    a watch: poll-waiters migrate onto the attention queue only once it
 *    has fully drained.
 */

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// A cell that can be written to only once, thread-safe.
pub struct AtomicOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: AtomicOnce is Sync because:
// 1. The state field uses atomic operations with proper ordering
// 2. The UnsafeCell is only written when state transitions UNINIT -> INITIALIZING
//    (protected by compare_exchange, only one thread can win)
// 3. The UnsafeCell is only read when state == INITIALIZED, after the writer
//    has stored with Release ordering and reader loads with Acquire
unsafe impl<T: Send + Sync> Sync for AtomicOnce<T> {}
// SAFETY: T: Send makes the contained value safe to drop on another thread.
unsafe impl<T: Send> Send for AtomicOnce<T> {}

impl<T> AtomicOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            // SAFETY: Acquire load synchronizes with the Release store below;
            // the value is immutable once INITIALIZED.
            unsafe { (*self.value.get()).as_ref() }
        } else {
            None
        }
    }

    #[inline]
    pub fn get_or_init<F>(&self, f: F) -> &T
    where
        F: FnOnce() -> T,
    {
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            #[allow(clippy::multiple_unsafe_ops_per_block)]
            // SAFETY: state is INITIALIZED, so value is Some and immutable.
            return unsafe { (*self.value.get()).as_ref().unwrap_unchecked() };
        }
        self.init_slow(f)
    }

    #[cold]
    fn init_slow<F>(&self, f: F) -> &T
    where
        F: FnOnce() -> T,
    {
        match self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let value = f();
                // SAFETY: we hold the INITIALIZING lock exclusively.
                unsafe {
                    *self.value.get() = Some(value);
                }
                self.state.store(INITIALIZED, Ordering::Release);
            }
            Err(INITIALIZING) => {
                while self.state.load(Ordering::Acquire) == INITIALIZING {
                    std::hint::spin_loop();
                }
            }
            Err(_) => {}
        }
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        // SAFETY: state is now INITIALIZED (set by us, or observed via the spin loop).
        unsafe {
            (*self.value.get()).as_ref().unwrap_unchecked()
        }
    }
}

impl<T> Default for AtomicOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw mutual-exclusion primitive the event loop is generic over.
///
/// `NullLock` collapses to a no-op for single-threaded callers; `RawMutex`
/// wraps a real `std::sync::Mutex` for multi-threaded ones. Both guard a
/// value of type `T` with a closure-based `with`, matching the way the
/// dispatch layer only ever needs scoped access, never a held guard that
/// crosses an await point.
pub trait RawLock<T> {
    fn new(value: T) -> Self;
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// Single-threaded lock: no atomics, no blocking, just a cell.
pub struct NullLock<T>(UnsafeCell<T>);

// SAFETY: NullLock is only sound when the surrounding event loop guarantees
// single-threaded access (the NullLock-specialized loop never hands a
// reference to another thread); this matches the contract documented on
// `event_loop::EventLoop`.
unsafe impl<T> Sync for NullLock<T> {}

impl<T> RawLock<T> for NullLock<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        // SAFETY: single-threaded by contract; no concurrent access is possible.
        f(unsafe { &mut *self.0.get() })
    }
}

/// Multi-threaded lock over a real `std::sync::Mutex`.
pub struct RawMutex<T>(Mutex<T>);

impl<T> RawLock<T> for RawMutex<T> {
    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard)
    }
}

type WaiterId = u64;

#[derive(Default)]
struct WaitQueues {
    attention: VecDeque<WaiterId>,
    poll_wait: VecDeque<WaiterId>,
}

/// The two-queue attention/poll-wait lock described for the event loop:
/// only the waiter at the head of the attention queue may mutate backend
/// state or call into the kernel wait. Poll-only waiters queue up
/// separately and migrate onto the attention queue only once it has
/// completely drained, so a steady stream of pollers cannot starve a
/// thread that wants to register or remove a watch.
pub struct AttentionLock {
    queues: Mutex<WaitQueues>,
    cv: Condvar,
    next_id: AtomicU64,
}

/// Held by the thread currently at the head of the attention queue.
/// Dropping it releases the lock and wakes the next waiter, if any.
pub struct AttentionGuard<'a> {
    lock: &'a AttentionLock,
    id: WaiterId,
}

impl AttentionLock {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(WaitQueues::default()),
            cv: Condvar::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn acquire(&self, want_poll: bool) -> AttentionGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        if want_poll && !queues.attention.is_empty() {
            queues.poll_wait.push_back(id);
        } else {
            queues.attention.push_back(id);
        }
        while queues.attention.front() != Some(&id) {
            queues = self.cv.wait(queues).unwrap_or_else(|p| p.into_inner());
        }
        drop(queues);
        AttentionGuard { lock: self, id }
    }

    /// Acquire the attention lock for mutating backend state (registering
    /// or removing a watch). Mutators always queue directly on the
    /// attention queue.
    pub fn acquire_for_mutation(&self) -> AttentionGuard<'_> {
        self.acquire(false)
    }

    /// Acquire the attention lock for a kernel wait. If a mutator is
    /// already queued, this thread waits behind it instead of cutting in
    /// line ahead of pending mutations.
    pub fn acquire_for_poll(&self) -> AttentionGuard<'_> {
        self.acquire(true)
    }

    fn release(&self, id: WaiterId) {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        debug_assert_eq!(queues.attention.front(), Some(&id));
        queues.attention.pop_front();
        if queues.attention.is_empty() {
            if let Some(next) = queues.poll_wait.pop_front() {
                queues.attention.push_back(next);
            }
        }
        drop(queues);
        self.cv.notify_all();
    }
}

impl Default for AttentionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AttentionGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_or_init_runs_once() {
        let cell: AtomicOnce<i32> = AtomicOnce::new();
        let value = cell.get_or_init(|| 42);
        assert_eq!(*value, 42);
        let value2 = cell.get_or_init(|| panic!("should not run twice"));
        assert_eq!(*value2, 42);
    }

    #[test]
    fn get_uninit_is_none() {
        let cell: AtomicOnce<i32> = AtomicOnce::new();
        assert!(cell.get().is_none());
    }

    #[test]
    fn attention_lock_serializes_holders() {
        let lock = Arc::new(AttentionLock::new());
        let counter = Arc::new(Mutex::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let _guard = lock.acquire_for_mutation();
                let mut c = counter.lock().unwrap();
                *c += 1;
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[test]
    fn mutator_is_not_starved_by_pollers() {
        let lock = Arc::new(AttentionLock::new());
        // Grab the attention queue first so the poller has to queue behind it.
        let holder = lock.acquire_for_mutation();
        let lock2 = Arc::clone(&lock);
        let poller = thread::spawn(move || {
            let _g = lock2.acquire_for_poll();
        });
        // Give the poller a moment to enqueue on poll_wait.
        thread::sleep(std::time::Duration::from_millis(20));
        drop(holder);
        poller.join().unwrap();
    }
}
