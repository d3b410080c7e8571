use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time abstraction shared by the control loop, caches and timers.
///
/// - now(): monotonic Instant used for windows, staleness and timers
/// - unix_seconds(): wall-clock seconds since the Unix epoch, used for
///   history keys, episode close times and hour-of-day
/// - sleep(): pauses the caller (implementations may simulate)
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    fn unix_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Wall-clock time rounded to the nearest whole second.
    fn unix_rounded_seconds(&self) -> i64 {
        self.unix_seconds().round() as i64
    }

    /// Milliseconds elapsed since `epoch`, saturating at 0 on underflow.
    fn ms_since(&self, epoch: Instant) -> u64 {
        let dur = self.now().saturating_duration_since(epoch);
        dur.as_millis() as u64
    }
}

/// Default, real-time clock backed by std::time.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, d: Duration) {
        (**self).sleep(d)
    }

    fn unix_seconds(&self) -> f64 {
        (**self).unix_seconds()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_clock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Deterministic test clock whose time can be advanced manually.
    ///
    /// now() = origin + offset
    /// unix_seconds() = unix_origin + offset
    /// sleep(d) advances internal time by d without actually sleeping.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        unix_origin: f64,
        offset: Arc<Mutex<Duration>>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self::at_unix(1_600_000_000.0)
        }

        /// Clock whose wall time starts at `unix_origin` seconds.
        pub fn at_unix(unix_origin: f64) -> Self {
            Self {
                origin: Instant::now(),
                unix_origin,
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        /// Advance the clock by the given duration.
        pub fn advance(&self, d: Duration) {
            if let Ok(mut off) = self.offset.lock() {
                *off = off.saturating_add(d);
            }
        }

        /// Advance the clock by fractional seconds.
        pub fn advance_secs(&self, secs: f64) {
            self.advance(Duration::from_secs_f64(secs));
        }

        /// Set the absolute offset relative to origin.
        pub fn set_offset(&self, d: Duration) {
            if let Ok(mut off) = self.offset.lock() {
                *off = d;
            }
        }

        /// Set the absolute offset in fractional seconds.
        pub fn set_secs(&self, secs: f64) {
            self.set_offset(Duration::from_secs_f64(secs));
        }

        fn offset(&self) -> Duration {
            self.offset.lock().map(|g| *g).unwrap_or(Duration::ZERO)
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + self.offset()
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }

        fn unix_seconds(&self) -> f64 {
            self.unix_origin + self.offset().as_secs_f64()
        }
    }

}
