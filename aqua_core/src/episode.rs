//! Closing episodes: the trailing sensor history captured when the CO2 valve
//! closes, plus the trough pH observed until it opens again.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Number of slots in each trailing window.
pub const WINDOW_LEN: usize = 60;
/// Spacing between two window slots, in seconds.
pub const WINDOW_STEP_SECS: i64 = 15;

pub const PLAUSIBLE_PH: RangeInclusive<f64> = 5.0..=9.0;
pub const PLAUSIBLE_TEMPERATURE: RangeInclusive<f64> = 10.0..=40.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EpisodeError {
    #[error("no {series} sample near t={t}")]
    Missing { series: &'static str, t: i64 },
    #[error("implausible {series} {value} at t={t}")]
    Implausible {
        series: &'static str,
        t: i64,
        value: f64,
    },
    #[error("{series} window holds {len} slots")]
    WindowLength { series: &'static str, len: usize },
    #[error("episode closed at {close_time} is {age_s}s old")]
    Stale { close_time: i64, age_s: i64 },
}

/// Where a dataset row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EpisodeOrigin {
    ThisInstance,
    OtherInstance,
}

impl From<EpisodeOrigin> for u8 {
    fn from(o: EpisodeOrigin) -> u8 {
        match o {
            EpisodeOrigin::ThisInstance => 0,
            EpisodeOrigin::OtherInstance => 1,
        }
    }
}

impl TryFrom<u8> for EpisodeOrigin {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(EpisodeOrigin::ThisInstance),
            1 => Ok(EpisodeOrigin::OtherInstance),
            other => Err(format!("unknown episode origin {other}")),
        }
    }
}

/// One valve close/open cycle. Windows are ordered oldest first; the last
/// slot is the close time itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Co2ClosingState {
    pub origin: EpisodeOrigin,
    /// Unix seconds. Unique key in the dataset.
    pub close_time: i64,
    pub opened_seconds_ago: i64,
    pub ph600_at_close: f64,
    #[serde(rename = "ph60Offset15sInterval")]
    pub ph60_offsets: Vec<f64>,
    #[serde(rename = "temperature15sInterval")]
    pub temperatures: Vec<f64>,
    #[serde(rename = "dayLightOn15sInterval")]
    pub daylight: Vec<bool>,
    #[serde(rename = "co2ValveOpen15sInterval")]
    pub valve_open: Vec<bool>,
    pub min_ph600_offset_after_close: f64,
}

impl Co2ClosingState {
    /// Attach the observed trough.
    pub fn finalize(&mut self, min_ph600: f64) {
        self.min_ph600_offset_after_close = min_ph600 - self.ph600_at_close;
    }

    pub fn age_at(&self, now_unix: i64) -> i64 {
        now_unix - self.close_time
    }
}

/// Trailing per-second history, keyed by rounded unix seconds.
#[derive(Debug, Default, Clone)]
pub struct HistoryMaps {
    ph600: BTreeMap<i64, f64>,
    ph60: BTreeMap<i64, f64>,
    temperature: BTreeMap<i64, f64>,
    valve_open: BTreeMap<i64, bool>,
    daylight: BTreeMap<i64, bool>,
}

fn nearest<T: Copy>(map: &BTreeMap<i64, T>, t: i64, lookback: i64) -> Option<T> {
    map.range(t - lookback..=t).next_back().map(|(_, v)| *v)
}

impl HistoryMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ph600(&mut self, t: i64, v: f64) {
        self.ph600.insert(t, v);
    }
    pub fn record_ph60(&mut self, t: i64, v: f64) {
        self.ph60.insert(t, v);
    }
    pub fn record_temperature(&mut self, t: i64, v: f64) {
        self.temperature.insert(t, v);
    }
    pub fn record_valve(&mut self, t: i64, open: bool) {
        self.valve_open.insert(t, open);
    }
    pub fn record_daylight(&mut self, t: i64, on: bool) {
        self.daylight.insert(t, on);
    }

    pub fn ph600_at(&self, t: i64, lookback: i64) -> Option<f64> {
        nearest(&self.ph600, t, lookback)
    }
    pub fn ph60_at(&self, t: i64, lookback: i64) -> Option<f64> {
        nearest(&self.ph60, t, lookback)
    }
    pub fn temperature_at(&self, t: i64, lookback: i64) -> Option<f64> {
        nearest(&self.temperature, t, lookback)
    }
    pub fn valve_at(&self, t: i64, lookback: i64) -> Option<bool> {
        nearest(&self.valve_open, t, lookback)
    }
    pub fn daylight_at(&self, t: i64, lookback: i64) -> Option<bool> {
        nearest(&self.daylight, t, lookback)
    }

    /// Total entries across all series.
    pub fn len(&self) -> usize {
        self.ph600.len()
            + self.ph60.len()
            + self.temperature.len()
            + self.valve_open.len()
            + self.daylight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.ph600.clear();
        self.ph60.clear();
        self.temperature.clear();
        self.valve_open.clear();
        self.daylight.clear();
    }
}

/// Build an episode ending at `close_time` from history. The trough is not
/// known yet; call [`Co2ClosingState::finalize`] once it is.
pub fn capture(
    history: &HistoryMaps,
    close_time: i64,
    opened_seconds_ago: i64,
    origin: EpisodeOrigin,
    lookback: i64,
) -> Result<Co2ClosingState, EpisodeError> {
    let ph600_at_close = history
        .ph600_at(close_time, lookback)
        .ok_or(EpisodeError::Missing {
            series: "ph600",
            t: close_time,
        })?;
    if !PLAUSIBLE_PH.contains(&ph600_at_close) {
        return Err(EpisodeError::Implausible {
            series: "ph600",
            t: close_time,
            value: ph600_at_close,
        });
    }

    let mut ph60_offsets = Vec::with_capacity(WINDOW_LEN);
    let mut temperatures = Vec::with_capacity(WINDOW_LEN);
    let mut daylight = Vec::with_capacity(WINDOW_LEN);
    let mut valve_open = Vec::with_capacity(WINDOW_LEN);

    // Walk backwards from the close time, then flip to oldest-first.
    for slot in 0..WINDOW_LEN as i64 {
        let t = close_time - WINDOW_STEP_SECS * slot;
        let ph60 = history
            .ph60_at(t, lookback)
            .ok_or(EpisodeError::Missing { series: "ph60", t })?;
        if !PLAUSIBLE_PH.contains(&ph60) {
            return Err(EpisodeError::Implausible {
                series: "ph60",
                t,
                value: ph60,
            });
        }
        let temp = history
            .temperature_at(t, lookback)
            .ok_or(EpisodeError::Missing {
                series: "temperature",
                t,
            })?;
        if !PLAUSIBLE_TEMPERATURE.contains(&temp) {
            return Err(EpisodeError::Implausible {
                series: "temperature",
                t,
                value: temp,
            });
        }
        let day = history.daylight_at(t, lookback).ok_or(EpisodeError::Missing {
            series: "daylight",
            t,
        })?;
        let valve = history.valve_at(t, lookback).ok_or(EpisodeError::Missing {
            series: "valve",
            t,
        })?;

        ph60_offsets.push(ph60 - ph600_at_close);
        temperatures.push(temp);
        daylight.push(day);
        valve_open.push(valve);
    }
    ph60_offsets.reverse();
    temperatures.reverse();
    daylight.reverse();
    valve_open.reverse();

    Ok(Co2ClosingState {
        origin,
        close_time,
        opened_seconds_ago,
        ph600_at_close,
        ph60_offsets,
        temperatures,
        daylight,
        valve_open,
        min_ph600_offset_after_close: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOSE: i64 = 1_700_000_000;

    fn filled(from: i64, to: i64) -> HistoryMaps {
        let mut h = HistoryMaps::new();
        for t in from..=to {
            h.record_ph600(t, 7.0);
            h.record_ph60(t, 7.0 - (to - t) as f64 * 0.0001);
            h.record_temperature(t, 24.5);
            h.record_daylight(t, true);
            h.record_valve(t, t > to - 120);
        }
        h
    }

    #[test]
    fn window_is_oldest_first_and_ends_at_close() {
        let h = filled(CLOSE - 900, CLOSE);
        let ep = capture(&h, CLOSE, 120, EpisodeOrigin::ThisInstance, 3).unwrap();
        assert_eq!(ep.ph60_offsets.len(), WINDOW_LEN);
        assert_eq!(ep.valve_open.len(), WINDOW_LEN);
        assert!(ep.ph60_offsets[WINDOW_LEN - 1].abs() < 1e-12);
        assert!(ep.ph60_offsets[0] < ep.ph60_offsets[WINDOW_LEN - 1]);
        assert!(!ep.valve_open[0]);
        assert!(ep.valve_open[WINDOW_LEN - 1]);
    }

    #[test]
    fn lookback_bridges_small_gaps_only() {
        let mut h = filled(CLOSE - 900, CLOSE);
        h.ph600.remove(&CLOSE);
        assert!(capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 3).is_ok());
        for t in CLOSE - 3..CLOSE {
            h.ph600.remove(&t);
        }
        assert_eq!(
            capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 3),
            Err(EpisodeError::Missing {
                series: "ph600",
                t: CLOSE
            })
        );
    }

    #[test]
    fn implausible_temperature_rejects() {
        let mut h = filled(CLOSE - 900, CLOSE);
        h.record_temperature(CLOSE - 30, 41.0);
        let err = capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 0).unwrap_err();
        assert!(matches!(
            err,
            EpisodeError::Implausible {
                series: "temperature",
                ..
            }
        ));
    }

    #[test]
    fn implausible_ph600_rejects() {
        let mut h = filled(CLOSE - 900, CLOSE);
        h.record_ph600(CLOSE, 12.0);
        assert_eq!(
            capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 3),
            Err(EpisodeError::Implausible {
                series: "ph600",
                t: CLOSE,
                value: 12.0
            })
        );
    }

    #[test]
    fn short_history_rejects() {
        let h = filled(CLOSE - 600, CLOSE);
        assert!(matches!(
            capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 3),
            Err(EpisodeError::Missing { series: "ph60", .. })
        ));
    }

    #[test]
    fn origin_serializes_as_number() {
        assert_eq!(
            serde_json::to_string(&EpisodeOrigin::OtherInstance).unwrap(),
            "1"
        );
        assert!(serde_json::from_str::<EpisodeOrigin>("7").is_err());
    }

    #[test]
    fn finalize_stores_offset() {
        let h = filled(CLOSE - 900, CLOSE);
        let mut ep = capture(&h, CLOSE, 0, EpisodeOrigin::ThisInstance, 3).unwrap();
        ep.finalize(6.85);
        assert!((ep.min_ph600_offset_after_close + 0.15).abs() < 1e-9);
    }
}
