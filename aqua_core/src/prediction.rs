//! Prediction orchestrator: owns the trailing history, turns valve
//! transitions into dataset episodes and feeds the predictor worker.
use crate::dataset::{self, DatasetKind, DatasetStore, SplitPolicy};
use crate::episode::{self, Co2ClosingState, EpisodeOrigin, HistoryMaps};
use crate::error::DatasetError;
use crate::predictor::{FeatureWindow, PredictorWorker, WorkerRequest};
use aqua_traits::RandomSource;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    /// How far back a missing second may be filled from.
    pub lookback_s: i64,
    /// Episodes whose trough was not observed within this age are dropped.
    pub episode_max_age_s: i64,
    pub split: SplitPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lookback_s: 3,
            episode_max_age_s: 7 * 60 * 60,
            split: SplitPolicy::default(),
        }
    }
}

/// Published trough prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinPhPrediction {
    pub predicted_min_ph: f64,
    pub latency: Duration,
    /// Republished value while the valve stays closed.
    pub valve_already_closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub total: usize,
    pub training: usize,
    pub validation: usize,
}

pub struct PredictionOrchestrator<S: DatasetStore> {
    cfg: OrchestratorConfig,
    history: HistoryMaps,
    store: S,
    rng: Box<dyn RandomSource + Send>,
    worker: Option<PredictorWorker>,
    valve_open: Option<bool>,
    opened_at: Option<i64>,
    pending: Option<Co2ClosingState>,
    min_ph600_since_close: Option<f64>,
    last_prediction: Option<MinPhPrediction>,
}

impl<S: DatasetStore> PredictionOrchestrator<S> {
    /// Rebalances the stored split once before returning.
    pub fn new(
        cfg: OrchestratorConfig,
        store: S,
        rng: Box<dyn RandomSource + Send>,
        worker: Option<PredictorWorker>,
    ) -> Result<Self, DatasetError> {
        let mut this = Self {
            cfg,
            history: HistoryMaps::new(),
            store,
            rng,
            worker,
            valve_open: None,
            opened_at: None,
            pending: None,
            min_ph600_since_close: None,
            last_prediction: None,
        };
        this.maintain()?;
        Ok(this)
    }

    pub fn history(&self) -> &HistoryMaps {
        &self.history
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn pending_episode(&self) -> Option<&Co2ClosingState> {
        self.pending.as_ref()
    }

    pub fn min_ph600_since_close(&self) -> Option<f64> {
        self.min_ph600_since_close
    }

    pub fn last_prediction(&self) -> Option<MinPhPrediction> {
        self.last_prediction
    }

    pub fn record_ph(&mut self, t: i64, ph600: Option<f64>, ph60: Option<f64>) {
        if let Some(v) = ph600 {
            self.history.record_ph600(t, v);
            if self.valve_open == Some(false) && self.pending.is_some() {
                let min = self.min_ph600_since_close.map_or(v, |m| m.min(v));
                self.min_ph600_since_close = Some(min);
            }
        }
        if let Some(v) = ph60 {
            self.history.record_ph60(t, v);
        }
    }

    pub fn record_temperature(&mut self, t: i64, celsius: f64) {
        self.history.record_temperature(t, celsius);
    }

    pub fn record_daylight(&mut self, t: i64, on: bool) {
        self.history.record_daylight(t, on);
    }

    /// Valve feedback at unix second `t`. Closing captures a new episode,
    /// opening finalizes the pending one.
    pub fn on_valve_state(&mut self, t: i64, open: bool) -> Result<(), DatasetError> {
        self.history.record_valve(t, open);
        let previous = self.valve_open.replace(open);
        match (previous, open) {
            (Some(false), true) => {
                self.opened_at = Some(t);
                self.finalize_pending(t)?;
            }
            (None, true) => self.opened_at = Some(t),
            (Some(true), false) => {
                let opened_for = self.opened_at.map_or(0, |o| t - o);
                self.opened_at = None;
                self.capture_closing(t, opened_for);
            }
            _ => {}
        }
        Ok(())
    }

    fn capture_closing(&mut self, t: i64, opened_for: i64) {
        self.min_ph600_since_close = None;
        match episode::capture(
            &self.history,
            t,
            opened_for,
            EpisodeOrigin::ThisInstance,
            self.cfg.lookback_s,
        ) {
            Ok(ep) => {
                tracing::info!(close_time = t, opened_for, "closing episode captured");
                self.pending = Some(ep);
            }
            Err(e) => {
                tracing::info!(close_time = t, error = %e, "closing episode not captured");
                self.pending = None;
            }
        }
    }

    fn finalize_pending(&mut self, t: i64) -> Result<(), DatasetError> {
        let Some(mut ep) = self.pending.take() else {
            return Ok(());
        };
        let min = self.min_ph600_since_close.take();
        let age_s = ep.age_at(t);
        if age_s > self.cfg.episode_max_age_s {
            tracing::warn!(close_time = ep.close_time, age_s, "stale episode discarded");
            return Ok(());
        }
        let Some(min) = min else {
            tracing::warn!(close_time = ep.close_time, "episode without trough discarded");
            return Ok(());
        };
        ep.finalize(min);
        let validation =
            dataset::insert_assigned(&mut self.store, &ep, self.cfg.split, self.rng.as_mut())?;
        tracing::info!(
            close_time = ep.close_time,
            min_offset = ep.min_ph600_offset_after_close,
            validation,
            "closing episode stored"
        );
        self.maintain()
    }

    /// Keep the validation split within tolerance.
    pub fn maintain(&mut self) -> Result<(), DatasetError> {
        dataset::rebalance(&mut self.store, self.cfg.split, self.rng.as_mut())?;
        Ok(())
    }

    /// One prediction tick. While open, a request for the episode in progress
    /// goes to the worker. While closed, the last prediction is returned again
    /// tagged as already closed.
    pub fn prediction_tick(&mut self, t: i64, now: Instant) -> Option<MinPhPrediction> {
        match self.valve_open {
            Some(true) => {
                let opened_at = self.opened_at?;
                let ep = episode::capture(
                    &self.history,
                    t,
                    t - opened_at,
                    EpisodeOrigin::ThisInstance,
                    self.cfg.lookback_s,
                )
                .ok()?;
                let window = match FeatureWindow::from_episode(&ep) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::debug!(error = %e, "no prediction window");
                        return None;
                    }
                };
                if let Some(worker) = &self.worker
                    && !worker.request(WorkerRequest {
                        window,
                        requested_at: now,
                    })
                {
                    tracing::warn!("predictor worker busy or gone");
                }
                None
            }
            _ => self.last_prediction.map(|p| MinPhPrediction {
                latency: Duration::ZERO,
                valve_already_closed: true,
                ..p
            }),
        }
    }

    /// Collect worker responses. Each one replaces the last prediction,
    /// whatever request it answers. Latency is measured on the caller's
    /// clock up to `now`.
    pub fn drain_predictions(&mut self, now: Instant) -> Vec<MinPhPrediction> {
        let Some(worker) = &self.worker else {
            return Vec::new();
        };
        let out: Vec<MinPhPrediction> = worker
            .drain()
            .into_iter()
            .map(|r| MinPhPrediction {
                predicted_min_ph: r.predicted_min_ph,
                latency: now.saturating_duration_since(r.requested_at),
                valve_already_closed: false,
            })
            .collect();
        if let Some(last) = out.last() {
            self.last_prediction = Some(*last);
        }
        out
    }

    /// Drop all history inside the nightly maintenance window. Returns true
    /// when a cleanup happened.
    pub fn cleanup_if_night(&mut self, local_hour: f64) -> bool {
        // Whole hours 1 and 2 only.
        let hour = local_hour.floor();
        if hour > 0.0 && hour < 3.0 {
            let entries = self.history.len();
            self.history.clear();
            tracing::info!(entries, "history maps cleared");
            return true;
        }
        false
    }

    pub fn dataset_stats(&self) -> Result<DatasetStats, DatasetError> {
        Ok(DatasetStats {
            total: self.store.count(DatasetKind::Any)?,
            training: self.store.count(DatasetKind::Training)?,
            validation: self.store.count(DatasetKind::Validation)?,
        })
    }

    /// Stop the worker thread.
    pub fn dispose(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
    }
}
