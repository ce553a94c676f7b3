/*
 * error.rs
 *
 * Every fallible operation in this crate bottoms out in raw libc calls
 * (epoll_ctl, kevent, pselect, sigtimedwait, waitpid...). We keep the
 * originating errno on every variant so callers can match on it if they
 * need platform-specific recovery (EMFILE vs ENOMEM, say).
 */

use std::io;

/// Everything that can go wrong registering or polling for events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend syscall failed: {0}")]
    Backend(#[source] io::Error),

    #[error("descriptor kind is not supported by this backend")]
    UnsupportedDescriptor,

    #[error("no more slots available in the priority queue")]
    QueueExhausted,

    #[error("watcher is already registered with this event loop")]
    AlreadyRegistered,

    #[error("watcher is not registered with this event loop")]
    NotRegistered,

    #[error("invalid signal number: {0}")]
    InvalidSignal(i32),

    #[error("invalid priority: {0} (must be within supported range)")]
    InvalidPriority(i32),

    #[error("timer deadline arithmetic overflowed")]
    TimerOverflow,

    #[error("a watcher callback panicked")]
    CallbackPanicked,
}

impl Error {
    /// Wrap the last OS error (`errno`) as a backend failure.
    pub fn from_errno() -> Self {
        Self::Backend(io::Error::last_os_error())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Backend(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_carries_source() {
        let err = Error::Backend(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.to_string().contains("backend syscall failed"));
    }

    #[test]
    fn invalid_signal_display() {
        let err = Error::InvalidSignal(999);
        assert_eq!(err.to_string(), "invalid signal number: 999");
    }
}
