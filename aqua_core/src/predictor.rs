//! Trough prediction: feature extraction from episodes, a linear model that
//! can be trained from the dataset, and a worker thread that runs it off the
//! control loop.
use crate::dataset::DatasetRow;
use crate::episode::{Co2ClosingState, EpisodeError, WINDOW_LEN};
use crate::error::Result;
use crate::util::utc_minutes_of_day;
use crossbeam_channel as xch;
use eyre::{WrapErr, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Four trailing windows plus pH at close, time of day and open duration.
pub const FEATURE_COUNT: usize = 4 * WINDOW_LEN + 3;

const OPEN_SCALE_SECS: f64 = 2.0 * 60.0 * 60.0;

pub fn scale_ph(ph: f64) -> f64 {
    ((ph - 6.0) / 2.0).clamp(0.0, 1.0)
}

pub fn scale_ph_offset(diff: f64) -> f64 {
    ((diff + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub fn descale_ph_offset(scaled: f64) -> f64 {
    scaled * 2.0 - 1.0
}

pub fn scale_temperature(t: f64) -> f64 {
    ((t - 10.0) / 30.0).clamp(0.0, 1.0)
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Model input for one episode.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    pub ph600_at_close: f64,
    pub xs: Vec<f64>,
}

impl FeatureWindow {
    /// Scale an episode into model inputs. Rejects episodes whose shape or
    /// values are outside what the model was trained on.
    pub fn from_episode(ep: &Co2ClosingState) -> std::result::Result<Self, EpisodeError> {
        let lens = [
            ("ph60", ep.ph60_offsets.len()),
            ("temperature", ep.temperatures.len()),
            ("daylight", ep.daylight.len()),
            ("valve", ep.valve_open.len()),
        ];
        if let Some((series, len)) = lens.into_iter().find(|(_, l)| *l != WINDOW_LEN) {
            return Err(EpisodeError::WindowLength { series, len });
        }
        if !(4.0..=8.0).contains(&ep.ph600_at_close) {
            return Err(EpisodeError::Implausible {
                series: "ph600",
                t: ep.close_time,
                value: ep.ph600_at_close,
            });
        }
        if let Some(bad) = ep
            .ph60_offsets
            .iter()
            .find(|d| !(-4.0..=4.0).contains(*d))
        {
            return Err(EpisodeError::Implausible {
                series: "ph60 offset",
                t: ep.close_time,
                value: *bad,
            });
        }

        let mut xs = Vec::with_capacity(FEATURE_COUNT);
        xs.extend(ep.ph60_offsets.iter().map(|d| scale_ph_offset(*d)));
        xs.extend(ep.temperatures.iter().map(|t| scale_temperature(*t)));
        xs.extend(ep.daylight.iter().map(|b| flag(*b)));
        xs.extend(ep.valve_open.iter().map(|b| flag(*b)));
        xs.push(scale_ph(ep.ph600_at_close));
        xs.push(utc_minutes_of_day(ep.close_time) / 1440.0);
        xs.push((ep.opened_seconds_ago as f64 / OPEN_SCALE_SECS).min(1.0));
        Ok(Self {
            ph600_at_close: ep.ph600_at_close,
            xs,
        })
    }

    /// Convert a raw model output back to an absolute pH.
    pub fn decode(&self, out: f64) -> f64 {
        self.ph600_at_close + descale_ph_offset(out)
    }
}

/// Training label of a finalized episode.
pub fn label(ep: &Co2ClosingState) -> std::result::Result<f64, EpisodeError> {
    let d = ep.min_ph600_offset_after_close;
    if !(-4.0..=4.0).contains(&d) {
        return Err(EpisodeError::Implausible {
            series: "trough offset",
            t: ep.close_time,
            value: d,
        });
    }
    Ok(scale_ph_offset(d))
}

/// Anything that turns a feature window into a predicted trough pH.
pub trait Predictor {
    fn predict(&self, window: &FeatureWindow) -> Result<f64>;
}

impl<F> Predictor for F
where
    F: Fn(&FeatureWindow) -> Result<f64>,
{
    fn predict(&self, window: &FeatureWindow) -> Result<f64> {
        self(window)
    }
}

/// Single-layer model, persisted as `{ "weights": [...], "bias": b }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearPredictor {
    /// All-zero weights with a bias that predicts "no change".
    pub fn neutral() -> Self {
        Self {
            weights: vec![0.0; FEATURE_COUNT],
            bias: 0.5,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("reading model from {}", path.display()))?;
        let model: Self = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("parsing model {}", path.display()))?;
        if model.weights.len() != FEATURE_COUNT {
            bail!(
                "model {} has {} weights, expected {FEATURE_COUNT}",
                path.display(),
                model.weights.len()
            );
        }
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::atomic::write_json_atomic(path, self)
            .wrap_err_with(|| format!("writing model to {}", path.display()))
    }

    /// Raw scaled output.
    pub fn output(&self, xs: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(xs)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias
    }
}

impl Predictor for LinearPredictor {
    fn predict(&self, window: &FeatureWindow) -> Result<f64> {
        if window.xs.len() != self.weights.len() {
            bail!(
                "feature window has {} inputs, model expects {}",
                window.xs.len(),
                self.weights.len()
            );
        }
        Ok(window.decode(self.output(&window.xs)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Full-batch gradient step. Diverges above roughly `1 / FEATURE_COUNT`.
    pub learning_rate: f64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 2000,
            learning_rate: 0.002,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub model: LinearPredictor,
    pub training_rows: usize,
    pub skipped_rows: usize,
    pub training_mse: f64,
    pub validation_mse: Option<f64>,
}

fn samples(rows: &[Co2ClosingState]) -> (Vec<(Vec<f64>, f64)>, usize) {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for ep in rows {
        match FeatureWindow::from_episode(ep).and_then(|w| Ok((w.xs, label(ep)?))) {
            Ok(s) => out.push(s),
            Err(e) => {
                tracing::debug!(close_time = ep.close_time, error = %e, "episode skipped");
                skipped += 1;
            }
        }
    }
    (out, skipped)
}

/// One exported training pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledWindow {
    pub close_time: i64,
    pub validation: bool,
    pub xs: Vec<f64>,
    pub y: f64,
}

/// Feature/label pairs for every usable row, plus the number skipped.
pub fn labeled_windows(rows: &[DatasetRow]) -> (Vec<LabeledWindow>, usize) {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let pair = FeatureWindow::from_episode(&row.episode)
            .and_then(|w| Ok((w, label(&row.episode)?)));
        match pair {
            Ok((w, y)) => out.push(LabeledWindow {
                close_time: row.close_time,
                validation: row.validation,
                xs: w.xs,
                y,
            }),
            Err(_) => skipped += 1,
        }
    }
    (out, skipped)
}

fn mse(model: &LinearPredictor, data: &[(Vec<f64>, f64)]) -> f64 {
    let n = data.len() as f64;
    data.iter()
        .map(|(xs, y)| (model.output(xs) - y).powi(2))
        .sum::<f64>()
        / n
}

/// Fit a [`LinearPredictor`] by full-batch gradient descent on mean squared error.
pub fn train_linear(
    training: &[Co2ClosingState],
    validation: &[Co2ClosingState],
    opts: TrainOptions,
) -> Result<TrainReport> {
    let (train, skipped_train) = samples(training);
    let (valid, _) = samples(validation);
    if train.is_empty() {
        bail!("no usable training rows ({skipped_train} skipped)");
    }

    let mut model = LinearPredictor::neutral();
    let n = train.len() as f64;
    let mut grad = vec![0.0; FEATURE_COUNT];
    for epoch in 0..opts.epochs {
        grad.iter_mut().for_each(|g| *g = 0.0);
        let mut grad_b = 0.0;
        for (xs, y) in &train {
            let err = model.output(xs) - y;
            for (g, x) in grad.iter_mut().zip(xs) {
                *g += err * x;
            }
            grad_b += err;
        }
        let step = 2.0 * opts.learning_rate / n;
        for (w, g) in model.weights.iter_mut().zip(&grad) {
            *w -= step * g;
        }
        model.bias -= step * grad_b;
        if epoch % 500 == 0 {
            tracing::debug!(epoch, loss = mse(&model, &train), "training");
        }
    }

    let training_mse = mse(&model, &train);
    let validation_mse = (!valid.is_empty()).then(|| mse(&model, &valid));
    tracing::info!(
        rows = train.len(),
        skipped = skipped_train,
        training_mse,
        ?validation_mse,
        "linear predictor trained"
    );
    Ok(TrainReport {
        model,
        training_rows: train.len(),
        skipped_rows: skipped_train,
        training_mse,
        validation_mse,
    })
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub window: FeatureWindow,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerResponse {
    pub predicted_min_ph: f64,
    /// Echo of the request's instant on the caller's clock.
    pub requested_at: Instant,
}

/// Runs a [`Predictor`] on its own thread. Requests and responses carry no
/// correlation id; the caller treats every response as the newest prediction.
pub struct PredictorWorker {
    tx: Option<xch::Sender<WorkerRequest>>,
    rx: xch::Receiver<WorkerResponse>,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl PredictorWorker {
    pub fn spawn<P: Predictor + Send + 'static>(predictor: P) -> Self {
        let (req_tx, req_rx) = xch::bounded::<WorkerRequest>(4);
        let (resp_tx, resp_rx) = xch::unbounded::<WorkerResponse>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let join_handle = std::thread::spawn(move || {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }
                let req = match req_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(req) => req,
                    Err(xch::RecvTimeoutError::Timeout) => continue,
                    Err(xch::RecvTimeoutError::Disconnected) => break,
                };
                match predictor.predict(&req.window) {
                    Ok(predicted_min_ph) => {
                        let resp = WorkerResponse {
                            predicted_min_ph,
                            requested_at: req.requested_at,
                        };
                        if resp_tx.send(resp).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "prediction failed"),
                }
            }
            tracing::trace!("predictor worker exiting");
        });

        Self {
            tx: Some(req_tx),
            rx: resp_rx,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Queue a request. Returns false when the queue is full or the worker is gone.
    pub fn request(&self, req: WorkerRequest) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(req).is_ok(),
            None => false,
        }
    }

    /// Responses received since the last call, in arrival order.
    pub fn drain(&self) -> Vec<WorkerResponse> {
        self.rx.try_iter().collect()
    }

    /// Block until one response arrives or `timeout` passes.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerResponse> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.tx = None;
        if let Some(handle) = self.join_handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("predictor worker panicked");
        }
    }
}

impl Drop for PredictorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeOrigin;

    fn episode() -> Co2ClosingState {
        Co2ClosingState {
            origin: EpisodeOrigin::ThisInstance,
            close_time: 1_700_000_000,
            opened_seconds_ago: 3600,
            ph600_at_close: 7.0,
            ph60_offsets: vec![0.2; WINDOW_LEN],
            temperatures: vec![25.0; WINDOW_LEN],
            daylight: vec![true; WINDOW_LEN],
            valve_open: vec![false; WINDOW_LEN],
            min_ph600_offset_after_close: -0.2,
        }
    }

    #[test]
    fn features_are_scaled() {
        let w = FeatureWindow::from_episode(&episode()).unwrap();
        assert_eq!(w.xs.len(), FEATURE_COUNT);
        assert!((w.xs[0] - 0.6).abs() < 1e-12);
        assert!((w.xs[WINDOW_LEN] - 0.5).abs() < 1e-12);
        assert_eq!(w.xs[2 * WINDOW_LEN], 1.0);
        assert_eq!(w.xs[3 * WINDOW_LEN], 0.0);
        assert!((w.xs[4 * WINDOW_LEN] - 0.5).abs() < 1e-12);
        assert!((w.xs[FEATURE_COUNT - 1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn short_window_is_rejected() {
        let mut ep = episode();
        ep.temperatures.pop();
        assert_eq!(
            FeatureWindow::from_episode(&ep),
            Err(EpisodeError::WindowLength {
                series: "temperature",
                len: WINDOW_LEN - 1
            })
        );
    }

    #[test]
    fn neutral_model_predicts_ph_at_close() {
        let w = FeatureWindow::from_episode(&episode()).unwrap();
        let p = LinearPredictor::neutral().predict(&w).unwrap();
        assert!((p - 7.0).abs() < 1e-12);
    }

    #[test]
    fn scaling_clamps() {
        assert_eq!(scale_ph(5.0), 0.0);
        assert_eq!(scale_ph(9.0), 1.0);
        assert_eq!(scale_ph_offset(-3.0), 0.0);
        assert_eq!(scale_temperature(45.0), 1.0);
        assert!((descale_ph_offset(scale_ph_offset(-0.3)) + 0.3).abs() < 1e-12);
    }

    #[test]
    fn worker_answers_and_stops() {
        let mut worker = PredictorWorker::spawn(|w: &FeatureWindow| -> Result<f64> {
            Ok(w.ph600_at_close - 0.1)
        });
        let window = FeatureWindow::from_episode(&episode()).unwrap();
        assert!(worker.request(WorkerRequest {
            window,
            requested_at: Instant::now(),
        }));
        let resp = worker.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!((resp.predicted_min_ph - 6.9).abs() < 1e-12);
        worker.stop();
        worker.stop();
    }
}
