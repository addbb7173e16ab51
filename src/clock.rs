//! Monotonic time for the loop.
//!
//! The loop keeps a snapped monotonic instant (`loop_time`) refreshed once
//! per step and on EINTR, so that all timers fired in one step observe the
//! same notion of "now". This module provides the snap plus the conversions
//! the kernel wait needs (timespec for kqueue, ceiled milliseconds for
//! epoll).

use std::time::{Duration, Instant};

/// Snaps the monotonic clock.
#[inline]
#[must_use]
pub(crate) fn snap() -> Instant {
    Instant::now()
}

/// Converts a wait duration to a `timespec` for `kevent`.
#[allow(dead_code)] // used by the kqueue backend only
#[must_use]
pub(crate) fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
    }
}

/// Converts a wait duration to whole milliseconds for `epoll_wait`,
/// rounding up so the wait never returns before a timer deadline.
#[allow(dead_code)] // used by the epoll backend only
#[must_use]
pub(crate) fn duration_to_ms_ceil(d: Duration) -> i32 {
    let ms = d.as_millis();
    let ms = if d.subsec_nanos() % 1_000_000 != 0 {
        ms + 1
    } else {
        ms
    };
    ms.min(i32::MAX as u128) as i32
}

/// Remaining wait until `deadline`, floored at zero.
#[inline]
#[must_use]
pub(crate) fn wait_until(now: Instant, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_splits_seconds_and_nanos() {
        let spec = duration_to_timespec(Duration::new(3, 250_000_000));
        assert_eq!(spec.tv_sec, 3);
        assert_eq!(spec.tv_nsec, 250_000_000);
    }

    #[test]
    fn ms_rounds_up() {
        assert_eq!(duration_to_ms_ceil(Duration::from_micros(1)), 1);
        assert_eq!(duration_to_ms_ceil(Duration::from_millis(5)), 5);
        assert_eq!(duration_to_ms_ceil(Duration::from_micros(5_500)), 6);
        assert_eq!(duration_to_ms_ceil(Duration::ZERO), 0);
    }

    #[test]
    fn wait_until_floors_at_zero() {
        let now = snap();
        let past = now - Duration::from_millis(10);
        assert_eq!(wait_until(now, past), Duration::ZERO);
        let future = now + Duration::from_millis(10);
        assert!(wait_until(now, future) > Duration::ZERO);
    }
}
