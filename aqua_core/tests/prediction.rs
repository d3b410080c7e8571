//! Prediction orchestrator: episode capture on valve transitions, dataset
//! handoff and worker round trips.
use aqua_core::dataset::{DatasetKind, DatasetStore, MemoryDatasetStore};
use aqua_core::episode::WINDOW_LEN;
use aqua_core::error::Result;
use aqua_core::prediction::{OrchestratorConfig, PredictionOrchestrator};
use aqua_core::predictor::{FeatureWindow, PredictorWorker};
use aqua_traits::SequenceRandom;
use std::time::{Duration, Instant};

const T0: i64 = 1_700_000_000;

fn orchestrator(worker: Option<PredictorWorker>) -> PredictionOrchestrator<MemoryDatasetStore> {
    PredictionOrchestrator::new(
        OrchestratorConfig::default(),
        MemoryDatasetStore::new(),
        Box::new(SequenceRandom::constant(0.5)),
        worker,
    )
    .unwrap()
}

/// Feed one second of readings with the valve in `open` state.
fn feed(o: &mut PredictionOrchestrator<MemoryDatasetStore>, t: i64, ph600: f64, open: bool) {
    o.record_ph(t, Some(ph600), Some(ph600 + 0.02));
    o.record_temperature(t, 25.0);
    o.record_daylight(t, true);
    o.on_valve_state(t, open).unwrap();
}

#[test]
fn close_then_open_stores_finalized_episode() {
    let mut o = orchestrator(None);
    for t in T0..=T0 + 1000 {
        feed(&mut o, t, 7.2, true);
    }
    let close = T0 + 1001;
    feed(&mut o, close, 7.2, false);
    let pending = o.pending_episode().unwrap();
    assert_eq!(pending.close_time, close);
    assert_eq!(pending.opened_seconds_ago, 1001);
    assert_eq!(pending.ph60_offsets.len(), WINDOW_LEN);

    for (i, ph) in [7.15, 7.05, 7.1].into_iter().enumerate() {
        feed(&mut o, close + 1 + i as i64, ph, false);
    }
    assert_eq!(o.min_ph600_since_close(), Some(7.05));

    feed(&mut o, close + 600, 7.1, true);
    assert!(o.pending_episode().is_none());
    let rows = o.store().find(DatasetKind::Any).unwrap();
    assert_eq!(rows.len(), 1);
    assert!((rows[0].min_ph600_offset_after_close + 0.15).abs() < 1e-9);
    assert_eq!(o.dataset_stats().unwrap().training, 1);
}

#[test]
fn stale_episode_is_discarded() {
    let mut o = orchestrator(None);
    for t in T0..=T0 + 1000 {
        feed(&mut o, t, 7.2, true);
    }
    feed(&mut o, T0 + 1001, 7.2, false);
    feed(&mut o, T0 + 1002, 7.0, false);
    feed(&mut o, T0 + 1001 + 7 * 3600 + 1, 7.0, true);
    assert_eq!(o.store().count(DatasetKind::Any).unwrap(), 0);
}

#[test]
fn episode_without_trough_is_discarded() {
    let mut o = orchestrator(None);
    for t in T0..=T0 + 1000 {
        feed(&mut o, t, 7.2, true);
    }
    feed(&mut o, T0 + 1001, 7.2, false);
    o.on_valve_state(T0 + 1010, true).unwrap();
    assert_eq!(o.store().count(DatasetKind::Any).unwrap(), 0);
}

#[test]
fn short_history_captures_nothing() {
    let mut o = orchestrator(None);
    for t in T0..=T0 + 100 {
        feed(&mut o, t, 7.2, true);
    }
    feed(&mut o, T0 + 101, 7.2, false);
    assert!(o.pending_episode().is_none());
}

#[test]
fn predictions_flow_while_open_and_repeat_while_closed() {
    let worker = PredictorWorker::spawn(|w: &FeatureWindow| -> Result<f64> {
        Ok(w.ph600_at_close - 0.25)
    });
    let mut o = orchestrator(Some(worker));
    for t in T0..=T0 + 1000 {
        feed(&mut o, t, 7.2, true);
    }
    let now = Instant::now();
    assert_eq!(o.prediction_tick(T0 + 1000, now), None);

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got = Vec::new();
    while got.is_empty() && Instant::now() < deadline {
        got = o.drain_predictions(now + Duration::from_millis(1500));
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(got.len(), 1);
    assert!((got[0].predicted_min_ph - 6.95).abs() < 1e-9);
    assert!(!got[0].valve_already_closed);
    assert_eq!(got[0].latency, Duration::from_millis(1500));

    feed(&mut o, T0 + 1001, 7.2, false);
    let again = o.prediction_tick(T0 + 1002, now).unwrap();
    assert!(again.valve_already_closed);
    assert_eq!(again.predicted_min_ph, got[0].predicted_min_ph);
    o.dispose();
}

#[test]
fn nothing_to_republish_before_first_prediction() {
    let mut o = orchestrator(None);
    feed(&mut o, T0, 7.2, false);
    assert_eq!(o.prediction_tick(T0, Instant::now()), None);
}

#[test]
fn history_is_cleared_only_at_night() {
    let mut o = orchestrator(None);
    feed(&mut o, T0, 7.2, true);
    assert!(!o.cleanup_if_night(0.0));
    assert!(!o.cleanup_if_night(0.75));
    assert!(!o.cleanup_if_night(3.0));
    assert!(!o.cleanup_if_night(14.0));
    assert!(!o.history().is_empty());
    assert!(o.cleanup_if_night(1.5));
    assert!(o.history().is_empty());
}
