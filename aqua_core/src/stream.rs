//! Synchronous stream combinators used by the control loop.
//!
//! Each combinator is driven explicitly with the current instant, so the
//! same code runs under the real clock and under a manually advanced one.
use aqua_traits::RandomSource;
use std::time::{Duration, Instant};

/// Latest value of a stream that falls back to "unknown" once it goes quiet.
#[derive(Debug, Clone)]
pub struct Latest<T> {
    value: Option<(T, Instant)>,
    stale_after: Duration,
}

impl<T> Latest<T> {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            value: None,
            stale_after,
        }
    }

    pub fn set(&mut self, value: T, now: Instant) {
        self.value = Some((value, now));
    }

    /// Drop the current value; `get` reports unknown until the next `set`.
    pub fn reset(&mut self) {
        self.value = None;
    }

    /// Value if one arrived within the stale timeout.
    pub fn get(&self, now: Instant) -> Option<&T> {
        match &self.value {
            Some((v, at)) if now.saturating_duration_since(*at) <= self.stale_after => Some(v),
            _ => None,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.get(now).is_none()
    }
}

impl<T: Copy> Latest<T> {
    pub fn get_copied(&self, now: Instant) -> Option<T> {
        self.get(now).copied()
    }
}

/// Passes a value only when it differs from the previously seen one.
#[derive(Debug, Clone)]
pub struct DistinctUntilChanged<T> {
    last: Option<T>,
    skip_first: bool,
}

impl<T: PartialEq + Clone> DistinctUntilChanged<T> {
    pub fn new() -> Self {
        Self {
            last: None,
            skip_first: false,
        }
    }

    /// Swallow the very first value (initial replay) but remember it.
    pub fn skipping_initial() -> Self {
        Self {
            last: None,
            skip_first: true,
        }
    }

    pub fn push(&mut self, value: T) -> Option<T> {
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        let first = self.last.is_none();
        self.last = Some(value.clone());
        if first && self.skip_first {
            self.skip_first = false;
            return None;
        }
        Some(value)
    }
}

impl<T: PartialEq + Clone> Default for DistinctUntilChanged<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality of the actuated state, ignoring bookkeeping such as reasons.
pub trait SameState {
    fn same_state(&self, other: &Self) -> bool;
}

impl SameState for bool {
    fn same_state(&self, other: &Self) -> bool {
        self == other
    }
}

/// Lets repeated states through at once but holds a state flip for a
/// randomized delay, then emits the newest value offered meanwhile.
#[derive(Debug, Clone)]
pub struct AsymmetricThrottle<T> {
    min_delay: Duration,
    max_delay: Duration,
    emitted: Option<T>,
    pending: Option<(T, Instant)>,
}

impl<T: SameState + Clone> AsymmetricThrottle<T> {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            emitted: None,
            pending: None,
        }
    }

    /// Offer a value. Returns it immediately when it keeps the emitted state.
    pub fn offer(&mut self, value: T, now: Instant, rng: &mut dyn RandomSource) -> Option<T> {
        let keeps_state = self
            .emitted
            .as_ref()
            .is_none_or(|last| last.same_state(&value));
        if keeps_state {
            self.pending = None;
            self.emitted = Some(value.clone());
            return Some(value);
        }
        match &mut self.pending {
            Some((held, _)) => *held = value,
            None => {
                let delay = rng.uniform(self.min_delay.as_secs_f64(), self.max_delay.as_secs_f64());
                self.pending = Some((value, now + Duration::from_secs_f64(delay)));
            }
        }
        None
    }

    /// Emit the held flip once its delay has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let due = self.pending.as_ref().is_some_and(|(_, at)| now >= *at);
        if !due {
            return None;
        }
        let (value, _) = self.pending.take()?;
        self.emitted = Some(value.clone());
        Some(value)
    }

    pub fn pending_until(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, at)| *at)
    }

    pub fn last_emitted(&self) -> Option<&T> {
        self.emitted.as_ref()
    }
}

/// Fixed-interval timer polled from the loop.
///
/// Fires on the first poll, then once per period. After a stall it fires
/// once and re-arms from the current instant instead of bursting.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next_due: Option<Instant>,
    enabled: bool,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
            enabled: true,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn due(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_due {
            Some(at) if now < at => false,
            Some(at) => {
                let next = at + self.period;
                self.next_due = Some(if next <= now { now + self.period } else { next });
                true
            }
            None => {
                self.next_due = Some(now + self.period);
                true
            }
        }
    }

    /// Stop firing for good.
    pub fn cancel(&mut self) {
        self.enabled = false;
    }
}
