/*
 * lib.rs
 *
 * Exists mostly for testing. Integration tests need our types, doc tests
 * need a lib.
 */

//! # dasynq
//!
//! A cross-platform asynchronous event-notification core: fd, bidi-fd,
//! signal, child-process and timer watchers dispatched through one of
//! three backends (Linux epoll, kqueue on macOS/BSD, or a portable
//! pselect fallback), chosen at compile time by target OS and Cargo
//! feature.
//!
//! ## Quick start
//!
//! ```rust
//! use dasynq::event_loop::EventLoop;
//! use dasynq::time::{Clock, Timespec};
//! use dasynq::watcher::{Rearm, TimerHandler};
//!
//! struct PrintOnce;
//! impl TimerHandler for PrintOnce {
//!     fn on_expiry(&mut self, _count: u32) -> Rearm {
//!         Rearm::Remove
//!     }
//! }
//!
//! let event_loop = EventLoop::new().expect("a backend is available on this platform");
//! let handle = event_loop
//!     .register_timer(Clock::Monotonic, 50, Box::new(PrintOnce))
//!     .unwrap();
//! event_loop
//!     .set_timer(handle, Clock::Monotonic.now().add(Timespec::new(0, 1)), Timespec::ZERO)
//!     .unwrap();
//! event_loop.run_n(1).unwrap();
//! ```

pub mod backend;
mod dispatch;
pub mod error;
pub mod event_loop;
pub mod priority_queue;
pub mod signal;
pub mod sync;
pub mod time;
mod timer;
pub mod watcher;

pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use priority_queue::Handle;
pub use signal::{parse_signal, signal_name, Signal};
pub use time::{Clock, Timespec};
pub use watcher::{
    BidiFdHandler, ChildHandler, FdHandler, Rearm, SigInfo, SignalHandler, TimerHandler,
    WatchFlags,
};
