/*
 * time.rs
 *
 * Absolute-deadline arithmetic shared by the timer subsystem and the
 * backends (kqueue EVFILT_TIMER deadlines, pselect's relative-timeout
 * computation, epoll's timerfd arming).
 *
 * `divide_timespec` is ported from the reference shift-and-subtract
 * algorithm: double the denominator until it's >= the numerator, then
 * halve it back down, subtracting wherever it fits. Avoids 64-bit
 * overflow that a naive `num.as_nanos() / den.as_nanos()` could hit for
 * very long overrun periods.
 */

use std::time::Duration;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Which clock a timer or deadline is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clock {
    Monotonic,
    Realtime,
}

impl Clock {
    fn as_libc(self) -> libc::clockid_t {
        match self {
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::Realtime => libc::CLOCK_REALTIME,
        }
    }

    /// Current time on this clock.
    pub fn now(self) -> Timespec {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, exclusively-borrowed out-parameter; clock_gettime
        // only writes into it and does not retain the pointer.
        let rc = unsafe { libc::clock_gettime(self.as_libc(), &mut ts) };
        debug_assert_eq!(rc, 0, "clock_gettime failed: {}", std::io::Error::last_os_error());
        Timespec::from_libc(ts)
    }
}

/// An absolute point in time or a duration, seconds + nanoseconds, matching
/// the layout backends exchange with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub fn from_libc(ts: libc::timespec) -> Self {
        Self {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        }
    }

    pub fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as _,
            tv_nsec: self.nsec as _,
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: i64::from(d.subsec_nanos()),
        }
    }

    #[must_use]
    pub fn add(self, other: Timespec) -> Timespec {
        let mut sec = self.sec + other.sec;
        let mut nsec = self.nsec + other.nsec;
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec += 1;
        }
        Timespec { sec, nsec }
    }

    /// Like `add`, but reports `None` instead of wrapping on overflow.
    #[must_use]
    pub fn checked_add(self, other: Timespec) -> Option<Timespec> {
        let mut sec = self.sec.checked_add(other.sec)?;
        let mut nsec = self.nsec + other.nsec;
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec = sec.checked_add(1)?;
        }
        Some(Timespec { sec, nsec })
    }

    /// `self - other`, saturating at zero if `other > self`.
    #[must_use]
    pub fn saturating_sub(self, other: Timespec) -> Timespec {
        if self < other {
            return Timespec::ZERO;
        }
        let mut sec = self.sec - other.sec;
        let mut nsec = self.nsec - other.nsec;
        if nsec < 0 {
            nsec += NSEC_PER_SEC;
            sec -= 1;
        }
        Timespec { sec, nsec }
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

/// Integer-divide `num` by `den`, writing the remainder, and return the
/// (truncated) quotient. Ported from the reference timer base's
/// shift-and-subtract long division so that very large ratios (a timer
/// whose interval is much shorter than the elapsed overrun) never need a
/// single multiplication or division wide enough to overflow 64 bits.
#[must_use]
pub fn divide_timespec(num: Timespec, den: Timespec) -> (i64, Timespec) {
    if num.sec < den.sec {
        return (0, num);
    }

    if num.sec == den.sec {
        if num.nsec < den.nsec {
            return (0, num);
        }
        if num.sec == 0 {
            return (num.nsec / den.nsec, Timespec::new(0, num.nsec % den.nsec));
        }
        // num.sec == den.sec and both are >= 1: result can only be 1.
        return (1, Timespec::new(0, num.nsec - den.nsec));
    }

    // num.sec >= 1 and num.sec > den.sec here.
    let mut r_sec = num.sec;
    let mut r_nsec = num.nsec;
    let mut d_sec = den.sec;
    let mut d_nsec = den.nsec;

    r_sec -= d_sec;
    if r_nsec >= d_nsec {
        r_nsec -= d_nsec;
    } else {
        r_nsec += NSEC_PER_SEC - d_nsec;
        r_sec -= 1;
    }

    // Common case: one expiry, no overrun.
    if r_sec < d_sec || (r_sec == d_sec && r_nsec < d_nsec) {
        return (1, Timespec::new(r_sec, r_nsec));
    }

    let mut nval: i64 = 1;
    let mut rval: i64 = 1; // we already subtracted 1*den above

    // Double the denominator until it's >= the remainder.
    while d_sec < r_sec {
        d_sec *= 2;
        d_nsec *= 2;
        if d_nsec >= NSEC_PER_SEC {
            d_nsec -= NSEC_PER_SEC;
            d_sec += 1;
        }
        nval *= 2;
    }

    while nval > 0 {
        if d_sec < r_sec || (d_sec == r_sec && d_nsec <= r_nsec) {
            r_sec -= d_sec;
            if d_nsec > r_nsec {
                r_nsec += NSEC_PER_SEC;
                r_sec -= 1;
            }
            r_nsec -= d_nsec;
            rval += nval;
        }

        let low = d_sec & 1;
        d_nsec /= 2;
        if low != 0 {
            d_nsec += NSEC_PER_SEC / 2;
        }
        d_sec /= 2;
        nval /= 2;
    }

    (rval, Timespec::new(r_sec, r_nsec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carries_nanoseconds() {
        let a = Timespec::new(1, 900_000_000);
        let b = Timespec::new(0, 200_000_000);
        assert_eq!(a.add(b), Timespec::new(2, 100_000_000));
    }

    #[test]
    fn checked_add_overflows_on_sec_overflow() {
        let a = Timespec::new(i64::MAX, 0);
        let b = Timespec::new(1, 0);
        assert_eq!(a.checked_add(b), None);
    }

    #[test]
    fn checked_add_overflows_when_carry_pushes_sec_past_max() {
        let a = Timespec::new(i64::MAX, 900_000_000);
        let b = Timespec::new(0, 200_000_000);
        assert_eq!(a.checked_add(b), None);
    }

    #[test]
    fn saturating_sub_clamps_to_zero() {
        let a = Timespec::new(1, 0);
        let b = Timespec::new(2, 0);
        assert_eq!(a.saturating_sub(b), Timespec::ZERO);
    }

    #[test]
    fn saturating_sub_borrows() {
        let a = Timespec::new(2, 100);
        let b = Timespec::new(1, 200);
        assert_eq!(a.saturating_sub(b), Timespec::new(0, 999_999_900));
    }

    #[test]
    fn divide_timespec_trivial_remainder() {
        let num = Timespec::new(0, 500);
        let den = Timespec::new(1, 0);
        let (q, r) = divide_timespec(num, den);
        assert_eq!(q, 0);
        assert_eq!(r, num);
    }

    #[test]
    fn divide_timespec_single_expiry() {
        // 3.5s elapsed against a 2s interval starting fresh: one full period,
        // 1.5s remainder.
        let num = Timespec::new(3, 500_000_000);
        let den = Timespec::new(2, 0);
        let (q, r) = divide_timespec(num, den);
        assert_eq!(q, 1);
        assert_eq!(r, Timespec::new(1, 500_000_000));
    }

    #[test]
    fn divide_timespec_matches_naive_division_for_modest_ratios() {
        // num = 3.5s elapsed since a 1s-interval timer's first deadline,
        // so the handler should observe 3 full periods elapsed (overrun
        // convention: q periods have fully elapsed by `num`).
        let num = Timespec::new(3, 500_000_000);
        let den = Timespec::new(1, 0);
        let (q, r) = divide_timespec(num, den);
        assert_eq!(q, 3);
        assert_eq!(r, Timespec::new(0, 500_000_000));
    }

    #[test]
    fn divide_timespec_large_ratio_no_overflow() {
        // A huge numerator against a tiny denominator exercises the
        // doubling/halving loop many times.
        let num = Timespec::new(1_000_000, 0);
        let den = Timespec::new(0, 1_000);
        let (q, r) = divide_timespec(num, den);
        // identity check: num == q*den + r, 0 <= r < den
        let reconstructed_nsec = (q as i128) * 1_000i128 + r.nsec as i128;
        assert_eq!(reconstructed_nsec, num.sec as i128 * NSEC_PER_SEC as i128);
        assert!(r < den);
    }

    #[test]
    fn divide_timespec_identity_property() {
        // n == q*d + r with 0 <= r < d, for a spread of representative values.
        let cases = [
            (Timespec::new(10, 0), Timespec::new(3, 0)),
            (Timespec::new(0, 999_999_999), Timespec::new(0, 1)),
            (Timespec::new(100, 500_000_000), Timespec::new(7, 250_000_000)),
            (Timespec::new(5, 0), Timespec::new(5, 0)),
        ];
        for (num, den) in cases {
            let (q, r) = divide_timespec(num, den);
            assert!(r < den || den.is_zero() && r.is_zero());
            let lhs = (num.sec as i128) * NSEC_PER_SEC as i128 + num.nsec as i128;
            let d = (den.sec as i128) * NSEC_PER_SEC as i128 + den.nsec as i128;
            let rem = (r.sec as i128) * NSEC_PER_SEC as i128 + r.nsec as i128;
            assert_eq!(lhs, q as i128 * d + rem);
        }
    }
}
