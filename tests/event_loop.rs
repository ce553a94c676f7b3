//! Scenario-level coverage for `EventLoop`, matching the seed scenarios
//! and invariants the watcher/dispatch/timer unit tests don't reach
//! because they need a live backend: fd readiness, timer overrun under
//! real elapsed time, reentrant deregistration, and cross-thread wakeup.

use dasynq::time::{Clock, Timespec};
use dasynq::watcher::{BidiFdHandler, ChildHandler, FdHandler, Rearm, SignalHandler, TimerHandler, WatchFlags};
use dasynq::{EventLoop, Handle};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = [0u8];
    let n = unsafe { libc::write(fd, byte.as_ptr() as *const _, 1) };
    assert_eq!(n, 1);
}

fn read_byte(fd: RawFd) {
    let mut byte = [0u8];
    unsafe { libc::read(fd, byte.as_mut_ptr() as *mut _, 1) };
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair() failed: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

struct CountingFd {
    calls: Arc<AtomicU32>,
    rearm: Rearm,
}

impl FdHandler for CountingFd {
    fn on_ready(&mut self, fd: RawFd, _flags: WatchFlags) -> Rearm {
        read_byte(fd);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rearm
    }
}

/// Two fd watches, distinct triggers: trigger one at a time and confirm
/// only the triggered watcher fires, and that a watcher's own `Remove`
/// decision stops it from firing again even if its fd is written to later.
#[test]
fn two_fd_watchers_fire_only_on_their_own_trigger() {
    let event_loop: EventLoop = EventLoop::new().unwrap();
    let (r0, w0) = pipe();
    let (r1, w1) = pipe();
    let calls0 = Arc::new(AtomicU32::new(0));
    let calls1 = Arc::new(AtomicU32::new(0));

    event_loop
        .register_fd(r0, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&calls0), rearm: Rearm::Remove }))
        .unwrap();
    event_loop
        .register_fd(r1, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&calls1), rearm: Rearm::Rearm }))
        .unwrap();

    write_byte(w0);
    event_loop.run_n(1).unwrap();
    assert_eq!(calls0.load(Ordering::SeqCst), 1);
    assert_eq!(calls1.load(Ordering::SeqCst), 0);

    // watcher 0 returned Remove, so writing to it again must not fire it;
    // only watcher 1 (still armed) should dispatch.
    write_byte(w0);
    write_byte(w1);
    event_loop.run_n(1).unwrap();
    assert_eq!(calls0.load(Ordering::SeqCst), 1);
    assert_eq!(calls1.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(r1);
        libc::close(w0);
        libc::close(w1);
    }
}

/// REARM vs DISARM: across two trigger rounds, a REARM watcher fires every
/// round while a DISARM watcher fires only on the round it disarms.
#[test]
fn rearm_watcher_keeps_firing_disarm_watcher_stops() {
    let event_loop: EventLoop = EventLoop::new().unwrap();
    let (ra, wa) = pipe();
    let (rb, wb) = pipe();
    let calls_a = Arc::new(AtomicU32::new(0));
    let calls_b = Arc::new(AtomicU32::new(0));

    event_loop
        .register_fd(ra, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&calls_a), rearm: Rearm::Rearm }))
        .unwrap();
    event_loop
        .register_fd(rb, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&calls_b), rearm: Rearm::Disarm }))
        .unwrap();

    write_byte(wa);
    write_byte(wb);
    event_loop.run_n(2).unwrap();
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);

    // Second round: B is disarmed, so writing to it must not make it
    // dispatch again; A fires again.
    write_byte(wa);
    write_byte(wb);
    event_loop.run_n(1).unwrap();
    assert_eq!(calls_a.load(Ordering::SeqCst), 2);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(ra);
        libc::close(rb);
        libc::close(wa);
        libc::close(wb);
    }
}

/// Timer dispatch order follows deadline order regardless of the order
/// timers were armed in.
#[test]
fn timers_dispatch_in_deadline_order_regardless_of_arming_order() {
    const N: i64 = 20;

    for reversed in [false, true] {
        let event_loop: EventLoop = EventLoop::new().unwrap();
        let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let base = Clock::Monotonic.now().add(Timespec::new(0, 30_000_000));

        let mut indices: Vec<i64> = (0..N).collect();
        if reversed {
            indices.reverse();
        }

        for i in indices {
            struct OrderTimer {
                order: Arc<Mutex<Vec<i64>>>,
                index: i64,
            }
            impl TimerHandler for OrderTimer {
                fn on_expiry(&mut self, _count: u32) -> Rearm {
                    self.order.lock().unwrap().push(self.index);
                    Rearm::Remove
                }
            }

            let handle = event_loop
                .register_timer(Clock::Monotonic, 50, Box::new(OrderTimer { order: Arc::clone(&order), index: i }))
                .unwrap();
            let deadline = base.add(Timespec::new(0, i));
            event_loop.set_timer(handle, deadline, Timespec::ZERO).unwrap();
        }

        event_loop.run_n(N as usize).unwrap();
        let observed = order.lock().unwrap().clone();
        let expected: Vec<i64> = (0..N).collect();
        assert_eq!(observed, expected, "reversed={reversed}");
    }
}

/// A periodic timer observed well after several of its own periods have
/// elapsed reports the accumulated overrun in a single dispatch.
#[test]
fn periodic_timer_reports_accumulated_overrun() {
    let event_loop: EventLoop = EventLoop::new().unwrap();
    let expiry_counts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    struct OverrunTimer {
        counts: Arc<Mutex<Vec<u32>>>,
    }
    impl TimerHandler for OverrunTimer {
        fn on_expiry(&mut self, count: u32) -> Rearm {
            self.counts.lock().unwrap().push(count);
            Rearm::Remove
        }
    }

    let interval = Timespec::new(0, 100_000_000); // 100ms
    let handle = event_loop
        .register_timer(Clock::Monotonic, 50, Box::new(OverrunTimer { counts: Arc::clone(&expiry_counts) }))
        .unwrap();
    let deadline = Clock::Monotonic.now().add(interval);
    event_loop.set_timer(handle, deadline, interval).unwrap();

    // By the time we poll, 2.5 interval-lengths have elapsed past the
    // first deadline: the first deadline itself plus two more full
    // periods have passed, so expiry_count should read 3 (floor(2.5) + 1).
    thread::sleep(Duration::from_millis(350));
    assert!(event_loop.poll().unwrap());

    let counts = expiry_counts.lock().unwrap();
    assert_eq!(counts.as_slice(), &[3]);
}

/// Deregistering a sibling watcher from inside a handler, where the
/// sibling is in the same ready batch, must prevent the sibling from
/// dispatching and must fire its `watch_removed` before `poll` returns.
#[test]
fn deregister_of_batch_sibling_from_within_a_handler() {
    let event_loop: Arc<EventLoop> = Arc::new(EventLoop::new().unwrap());
    let (ra, wa) = pipe();
    let (rb, wb) = pipe();

    let b_ran = Arc::new(AtomicBool::new(false));
    let b_removed = Arc::new(AtomicBool::new(false));

    struct BHandler {
        ran: Arc<AtomicBool>,
        removed: Arc<AtomicBool>,
    }
    impl FdHandler for BHandler {
        fn on_ready(&mut self, _fd: RawFd, _flags: WatchFlags) -> Rearm {
            self.ran.store(true, Ordering::SeqCst);
            Rearm::Disarm
        }
        fn watch_removed(&mut self) {
            self.removed.store(true, Ordering::SeqCst);
        }
    }

    let b_handle = event_loop
        .register_fd(rb, WatchFlags::IN, 90, true, false, Box::new(BHandler { ran: Arc::clone(&b_ran), removed: Arc::clone(&b_removed) }))
        .unwrap();

    struct AHandler {
        event_loop: Arc<EventLoop>,
        victim: Handle,
        ran: Arc<AtomicBool>,
    }
    impl FdHandler for AHandler {
        fn on_ready(&mut self, fd: RawFd, _flags: WatchFlags) -> Rearm {
            read_byte(fd);
            self.ran.store(true, Ordering::SeqCst);
            self.event_loop.deregister(self.victim).unwrap();
            Rearm::Disarm
        }
    }

    let a_ran = Arc::new(AtomicBool::new(false));
    event_loop
        .register_fd(
            ra,
            WatchFlags::IN,
            10, // lower value dispatches first
            true,
            false,
            Box::new(AHandler { event_loop: Arc::clone(&event_loop), victim: b_handle, ran: Arc::clone(&a_ran) }),
        )
        .unwrap();

    write_byte(wa);
    write_byte(wb);
    assert!(event_loop.poll().unwrap());

    assert!(a_ran.load(Ordering::SeqCst));
    assert!(!b_ran.load(Ordering::SeqCst), "B must not have dispatched");
    assert!(b_removed.load(Ordering::SeqCst), "B's watch_removed must fire before poll() returns");

    unsafe {
        libc::close(wa);
        libc::close(wb);
    }
}

/// A thread blocked in `run_n` must not stall a concurrent registration of
/// an already-readable fd on another thread; the register call returns
/// promptly and the blocked thread picks up the new watcher.
#[test]
fn registering_while_another_thread_blocks_in_run_wakes_it_promptly() {
    let event_loop: Arc<EventLoop> = Arc::new(EventLoop::new().unwrap());
    let dispatched = Arc::new(AtomicU32::new(0));

    let runner = {
        let event_loop = Arc::clone(&event_loop);
        thread::spawn(move || {
            event_loop.run_n(1).unwrap();
        })
    };

    // Give the runner thread time to enter the blocking kernel wait with
    // nothing registered yet.
    thread::sleep(Duration::from_millis(50));

    let (r, w) = pipe();
    write_byte(w);
    let register_started = std::time::Instant::now();
    event_loop
        .register_fd(r, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&dispatched), rearm: Rearm::Disarm }))
        .unwrap();
    let register_elapsed = register_started.elapsed();
    assert!(register_elapsed < Duration::from_millis(500), "register_fd took {register_elapsed:?}, the blocked poller was not woken promptly");

    runner.join().unwrap();
    assert_eq!(dispatched.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

/// `add_watch` then immediate `deregister`, with no trigger in between,
/// yields zero dispatches and no panics on teardown.
#[test]
fn register_then_immediate_deregister_dispatches_nothing() {
    let event_loop: EventLoop = EventLoop::new().unwrap();
    let (r, w) = pipe();
    let calls = Arc::new(AtomicU32::new(0));
    let handle = event_loop
        .register_fd(r, WatchFlags::IN, 50, true, false, Box::new(CountingFd { calls: Arc::clone(&calls), rearm: Rearm::Rearm }))
        .unwrap();
    event_loop.deregister(handle).unwrap();

    write_byte(w);
    event_loop.poll().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

struct EchoBidi {
    readable: Arc<AtomicU32>,
    writable: Arc<AtomicU32>,
}

impl BidiFdHandler for EchoBidi {
    fn on_readable(&mut self, fd: RawFd) -> Rearm {
        read_byte(fd);
        self.readable.fetch_add(1, Ordering::SeqCst);
        Rearm::Rearm
    }

    fn on_writable(&mut self, _fd: RawFd) -> Rearm {
        self.writable.fetch_add(1, Ordering::SeqCst);
        Rearm::Disarm
    }
}

/// A bidi fd watcher's two halves dispatch independently: enabling the
/// write side fires `on_writable` without disturbing the read side.
#[test]
fn bidi_fd_watcher_halves_dispatch_independently() {
    let event_loop: EventLoop = EventLoop::new().unwrap();
    let (a, b) = socketpair();
    let readable = Arc::new(AtomicU32::new(0));
    let writable = Arc::new(AtomicU32::new(0));

    let primary = event_loop
        .register_bidi_fd(
            a,
            WatchFlags::IN,
            50,
            false,
            Box::new(EchoBidi { readable: Arc::clone(&readable), writable: Arc::clone(&writable) }),
        )
        .unwrap();

    // A freshly connected stream socket is immediately writable.
    event_loop.set_out_watch_enabled(primary, true).unwrap();
    event_loop.run_n(1).unwrap();
    assert_eq!(writable.load(Ordering::SeqCst), 1);
    assert_eq!(readable.load(Ordering::SeqCst), 0);

    write_byte(b);
    event_loop.run_n(1).unwrap();
    assert_eq!(readable.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

struct NoopChild;
impl ChildHandler for NoopChild {
    fn on_child_exit(&mut self, _pid: libc::pid_t, _status: i32) -> Rearm {
        Rearm::Remove
    }
}

struct NoopSignal;
impl SignalHandler for NoopSignal {
    fn on_signal(&mut self, _info: dasynq::watcher::SigInfo) -> Rearm {
        Rearm::Rearm
    }
}

/// Registering and immediately deregistering a signal or child watcher
/// (the two kinds with no descriptor to write to in a test) must not
/// panic and must leave no trace in the dispatch arena.
#[test]
fn signal_and_child_watchers_round_trip_register_deregister() {
    let event_loop: EventLoop = EventLoop::new().unwrap();

    let signal_handle = event_loop.register_signal(libc::SIGUSR2, 50, Box::new(NoopSignal)).unwrap();
    event_loop.deregister(signal_handle).unwrap();

    let child_handle = event_loop.register_child(std::process::id() as libc::pid_t, 50, Box::new(NoopChild)).unwrap();
    event_loop.deregister(child_handle).unwrap();
}
