/*
 * signal.rs
 *
 * Signal number parsing, kept from the upstream CLI's signal table —
 * still the most convenient way for a test or caller to turn "TERM" into
 * a number — plus `try_sigtimedwait`, the non-blocking drain every
 * backend's `pull_signals` uses to recover counts `EVFILT_SIGNAL`/signalfd
 * already dropped.
 */

use crate::error::{Error, Result};
use crate::watcher::SigInfo;

/* POSIX signals as i32 values from libc. Copy/PartialEq for easy comparison. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    SIGHUP = libc::SIGHUP,
    SIGINT = libc::SIGINT,
    SIGQUIT = libc::SIGQUIT,
    SIGILL = libc::SIGILL,
    SIGTRAP = libc::SIGTRAP,
    SIGABRT = libc::SIGABRT,
    SIGBUS = libc::SIGBUS,
    SIGFPE = libc::SIGFPE,
    SIGKILL = libc::SIGKILL,
    SIGSTOP = libc::SIGSTOP,
    SIGUSR1 = libc::SIGUSR1,
    SIGSEGV = libc::SIGSEGV,
    SIGUSR2 = libc::SIGUSR2,
    SIGPIPE = libc::SIGPIPE,
    SIGALRM = libc::SIGALRM,
    SIGTERM = libc::SIGTERM,
    SIGCHLD = libc::SIGCHLD,
    SIGCONT = libc::SIGCONT,
    SIGTSTP = libc::SIGTSTP,
    SIGTTIN = libc::SIGTTIN,
    SIGTTOU = libc::SIGTTOU,
    SIGURG = libc::SIGURG,
    SIGXCPU = libc::SIGXCPU,
    SIGXFSZ = libc::SIGXFSZ,
    SIGVTALRM = libc::SIGVTALRM,
    SIGPROF = libc::SIGPROF,
    SIGWINCH = libc::SIGWINCH,
    SIGIO = libc::SIGIO,
    SIGSYS = libc::SIGSYS,
}

impl Signal {
    pub fn try_from_raw(num: i32) -> Option<Self> {
        match num {
            libc::SIGHUP => Some(Self::SIGHUP),
            libc::SIGINT => Some(Self::SIGINT),
            libc::SIGQUIT => Some(Self::SIGQUIT),
            libc::SIGILL => Some(Self::SIGILL),
            libc::SIGTRAP => Some(Self::SIGTRAP),
            libc::SIGABRT => Some(Self::SIGABRT),
            libc::SIGBUS => Some(Self::SIGBUS),
            libc::SIGFPE => Some(Self::SIGFPE),
            libc::SIGKILL => Some(Self::SIGKILL),
            libc::SIGSTOP => Some(Self::SIGSTOP),
            libc::SIGUSR1 => Some(Self::SIGUSR1),
            libc::SIGSEGV => Some(Self::SIGSEGV),
            libc::SIGUSR2 => Some(Self::SIGUSR2),
            libc::SIGPIPE => Some(Self::SIGPIPE),
            libc::SIGALRM => Some(Self::SIGALRM),
            libc::SIGTERM => Some(Self::SIGTERM),
            libc::SIGCHLD => Some(Self::SIGCHLD),
            libc::SIGCONT => Some(Self::SIGCONT),
            libc::SIGTSTP => Some(Self::SIGTSTP),
            libc::SIGTTIN => Some(Self::SIGTTIN),
            libc::SIGTTOU => Some(Self::SIGTTOU),
            libc::SIGURG => Some(Self::SIGURG),
            libc::SIGXCPU => Some(Self::SIGXCPU),
            libc::SIGXFSZ => Some(Self::SIGXFSZ),
            libc::SIGVTALRM => Some(Self::SIGVTALRM),
            libc::SIGPROF => Some(Self::SIGPROF),
            libc::SIGWINCH => Some(Self::SIGWINCH),
            libc::SIGIO => Some(Self::SIGIO),
            libc::SIGSYS => Some(Self::SIGSYS),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Parse "TERM", "SIGKILL", "9", "hup" - all the ways to specify a signal.
pub fn parse_signal(input: &str) -> Result<Signal> {
    let input = input.trim();

    if let Ok(num) = input.parse::<i32>() {
        return Signal::try_from_raw(num).ok_or(Error::InvalidSignal(num));
    }

    let name = input
        .strip_prefix("SIG")
        .or_else(|| input.strip_prefix("sig"))
        .or_else(|| input.strip_prefix("Sig"))
        .unwrap_or(input);

    if name.eq_ignore_ascii_case("TERM") {
        Ok(Signal::SIGTERM)
    } else if name.eq_ignore_ascii_case("KILL") {
        Ok(Signal::SIGKILL)
    } else if name.eq_ignore_ascii_case("INT") {
        Ok(Signal::SIGINT)
    } else if name.eq_ignore_ascii_case("HUP") {
        Ok(Signal::SIGHUP)
    } else if name.eq_ignore_ascii_case("QUIT") {
        Ok(Signal::SIGQUIT)
    } else if name.eq_ignore_ascii_case("ABRT") || name.eq_ignore_ascii_case("IOT") {
        Ok(Signal::SIGABRT)
    } else if name.eq_ignore_ascii_case("USR1") {
        Ok(Signal::SIGUSR1)
    } else if name.eq_ignore_ascii_case("USR2") {
        Ok(Signal::SIGUSR2)
    } else if name.eq_ignore_ascii_case("ALRM") {
        Ok(Signal::SIGALRM)
    } else if name.eq_ignore_ascii_case("CONT") {
        Ok(Signal::SIGCONT)
    } else if name.eq_ignore_ascii_case("STOP") {
        Ok(Signal::SIGSTOP)
    } else if name.eq_ignore_ascii_case("TSTP") {
        Ok(Signal::SIGTSTP)
    } else if name.eq_ignore_ascii_case("PIPE") {
        Ok(Signal::SIGPIPE)
    } else if name.eq_ignore_ascii_case("CHLD") {
        Ok(Signal::SIGCHLD)
    } else if name.eq_ignore_ascii_case("SEGV") {
        Ok(Signal::SIGSEGV)
    } else if name.eq_ignore_ascii_case("BUS") {
        Ok(Signal::SIGBUS)
    } else if name.eq_ignore_ascii_case("FPE") {
        Ok(Signal::SIGFPE)
    } else if name.eq_ignore_ascii_case("ILL") {
        Ok(Signal::SIGILL)
    } else if name.eq_ignore_ascii_case("TRAP") {
        Ok(Signal::SIGTRAP)
    } else if name.eq_ignore_ascii_case("TTIN") {
        Ok(Signal::SIGTTIN)
    } else if name.eq_ignore_ascii_case("TTOU") {
        Ok(Signal::SIGTTOU)
    } else if name.eq_ignore_ascii_case("URG") {
        Ok(Signal::SIGURG)
    } else if name.eq_ignore_ascii_case("XCPU") {
        Ok(Signal::SIGXCPU)
    } else if name.eq_ignore_ascii_case("XFSZ") {
        Ok(Signal::SIGXFSZ)
    } else if name.eq_ignore_ascii_case("VTALRM") {
        Ok(Signal::SIGVTALRM)
    } else if name.eq_ignore_ascii_case("PROF") {
        Ok(Signal::SIGPROF)
    } else if name.eq_ignore_ascii_case("WINCH") {
        Ok(Signal::SIGWINCH)
    } else if name.eq_ignore_ascii_case("IO") {
        Ok(Signal::SIGIO)
    } else if name.eq_ignore_ascii_case("SYS") {
        Ok(Signal::SIGSYS)
    } else {
        input
            .parse::<i32>()
            .ok()
            .and_then(Signal::try_from_raw)
            .map(Ok)
            .unwrap_or_else(|| Err(Error::InvalidSignal(-1)))
    }
}

#[must_use]
#[inline]
pub const fn signal_number(signal: Signal) -> i32 {
    signal.as_raw()
}

#[must_use]
pub const fn signal_name(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGHUP => "SIGHUP",
        Signal::SIGINT => "SIGINT",
        Signal::SIGQUIT => "SIGQUIT",
        Signal::SIGILL => "SIGILL",
        Signal::SIGTRAP => "SIGTRAP",
        Signal::SIGABRT => "SIGABRT",
        Signal::SIGBUS => "SIGBUS",
        Signal::SIGFPE => "SIGFPE",
        Signal::SIGKILL => "SIGKILL",
        Signal::SIGSTOP => "SIGSTOP",
        Signal::SIGUSR1 => "SIGUSR1",
        Signal::SIGSEGV => "SIGSEGV",
        Signal::SIGUSR2 => "SIGUSR2",
        Signal::SIGPIPE => "SIGPIPE",
        Signal::SIGALRM => "SIGALRM",
        Signal::SIGTERM => "SIGTERM",
        Signal::SIGCHLD => "SIGCHLD",
        Signal::SIGCONT => "SIGCONT",
        Signal::SIGTSTP => "SIGTSTP",
        Signal::SIGTTIN => "SIGTTIN",
        Signal::SIGTTOU => "SIGTTOU",
        Signal::SIGURG => "SIGURG",
        Signal::SIGXCPU => "SIGXCPU",
        Signal::SIGXFSZ => "SIGXFSZ",
        Signal::SIGVTALRM => "SIGVTALRM",
        Signal::SIGPROF => "SIGPROF",
        Signal::SIGWINCH => "SIGWINCH",
        Signal::SIGIO => "SIGIO",
        Signal::SIGSYS => "SIGSYS",
    }
}

/// Drain one pending instance of `signo` with `sigtimedwait`, non-blocking
/// (zero timeout). Returns `Ok(None)` if nothing was pending.
pub fn try_sigtimedwait(signo: i32) -> Result<Option<SigInfo>> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: set is freshly zeroed and owned by this call.
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signo);
    }
    let zero_timeout = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    // SAFETY: set/info/zero_timeout are all valid for the duration of the call.
    let rc = unsafe { libc::sigtimedwait(&set, &mut info, &zero_timeout) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
            _ => Err(Error::Backend(err)),
        };
    }
    Ok(Some(SigInfo {
        signo: rc,
        code: info.si_code,
        pid: unsafe { info.si_pid() },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_name() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("HUP").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_with_sig_prefix() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigterm").unwrap(), Signal::SIGTERM);
    }

    #[test]
    fn test_parse_by_number() {
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_invalid_name() {
        assert!(parse_signal("INVALID").is_err());
        assert!(parse_signal("SIGFOO").is_err());
    }

    #[test]
    fn test_invalid_number() {
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn test_signal_number_and_name() {
        assert_eq!(signal_number(Signal::SIGTERM), 15);
        assert_eq!(signal_name(Signal::SIGTERM), "SIGTERM");
    }
}
