//! Time-windowed running mean with lazy refresh.
//!
//! Samples are appended as they arrive. The window is refiltered (expired
//! samples dropped, sum recomputed from scratch) only when a new sample was
//! added or when the last refilter is older than [`REFRESH_INTERVAL`]. Between
//! refreshes reads return the cached result, so readers never pay for a scan
//! and the running sum never drifts from repeated subtraction.
use aqua_traits::Clock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum age of a cached result before a read forces a refilter.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(300);

pub struct AveragingWindow {
    span: Duration,
    min_samples: f64,
    samples: VecDeque<(Instant, f64)>,
    sum: f64,
    dirty: bool,
    last_refresh: Option<Instant>,
    result: Option<f64>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl core::fmt::Debug for AveragingWindow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AveragingWindow")
            .field("span", &self.span)
            .field("min_samples", &self.min_samples)
            .field("len", &self.samples.len())
            .field("result", &self.result)
            .finish()
    }
}

impl AveragingWindow {
    /// `span_secs` window length, `frequency_hz` expected sample rate and
    /// `min_percent` share of `span × frequency` required before a mean is reported.
    pub fn new(
        span_secs: f64,
        frequency_hz: f64,
        min_percent: f64,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            span: Duration::from_secs_f64(span_secs.max(0.0)),
            min_samples: span_secs * frequency_hz * min_percent / 100.0,
            samples: VecDeque::new(),
            sum: 0.0,
            dirty: false,
            last_refresh: None,
            result: None,
            clock,
        }
    }

    /// Minimum number of retained samples for a finite mean.
    pub fn min_samples(&self) -> f64 {
        self.min_samples
    }

    pub fn add(&mut self, value: f64) {
        let now = self.clock.now();
        self.samples.push_back((now, value));
        self.dirty = true;
    }

    /// Mean of samples younger than the span, or `None` when too few qualify.
    pub fn get(&mut self) -> Option<f64> {
        let now = self.clock.now();
        let stale = self
            .last_refresh
            .is_none_or(|t| now.saturating_duration_since(t) > REFRESH_INTERVAL);
        if self.dirty || stale {
            self.refresh(now);
        }
        self.result
    }

    /// Number of samples retained by the most recent refresh.
    pub fn count(&mut self) -> usize {
        self.get();
        self.samples.len()
    }

    /// Drop every sample and cached result.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.dirty = false;
        self.last_refresh = None;
        self.result = None;
    }

    fn refresh(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) < self.span {
                break;
            }
            self.samples.pop_front();
        }
        self.sum = self.samples.iter().map(|&(_, v)| v).sum();
        let n = self.samples.len();
        self.result = if n > 0 && n as f64 >= self.min_samples {
            Some(self.sum / n as f64)
        } else {
            None
        };
        self.dirty = false;
        self.last_refresh = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_traits::TestClock;

    #[test]
    fn result_is_cached_between_refreshes() {
        let clock = TestClock::new();
        let mut w = AveragingWindow::new(1.0, 2.0, 50.0, Arc::new(clock.clone()));
        w.add(4.0);
        assert_eq!(w.get(), Some(4.0));
        clock.set_secs(0.9);
        assert_eq!(w.get(), Some(4.0));
        // The sample is past the span but the last refresh is only 0.2 s old.
        clock.set_secs(1.1);
        assert_eq!(w.get(), Some(4.0));
        clock.set_secs(1.25);
        assert_eq!(w.get(), None);
    }

    #[test]
    fn clear_forgets_everything() {
        let clock = TestClock::new();
        let mut w = AveragingWindow::new(10.0, 1.0, 10.0, Arc::new(clock));
        w.add(1.0);
        w.add(3.0);
        assert_eq!(w.get(), Some(2.0));
        w.clear();
        assert_eq!(w.count(), 0);
        assert_eq!(w.get(), None);
    }
}
