//! `From` implementations bridging `aqua_config` sections to `aqua_core` types.

use crate::controller::{DaySchedule, PhControllerConfig};
use crate::dataset::SplitPolicy;
use crate::gateway::GatewayTiming;
use crate::prediction::OrchestratorConfig;
use crate::runtime::RuntimeTiming;
use crate::sensors::{PhCalibration, PhSensorCfg, TemperatureSensorCfg};
use chrono::FixedOffset;
use std::time::Duration;

// ── pH ───────────────────────────────────────────────────────────────────────

impl From<&aqua_config::PhCfg> for PhSensorCfg {
    fn from(c: &aqua_config::PhCfg) -> Self {
        Self {
            calibration: PhCalibration {
                ph1: c.ph1,
                v1: c.v1,
                ph2: c.ph2,
                v2: c.v2,
            },
            kh: c.kh,
            sample_hz: c.sample_hz,
            short_window_s: c.short_window_s,
            long_window_s: c.long_window_s,
            min_percent: c.min_percent,
            min_voltage: c.min_voltage,
            max_voltage: c.max_voltage,
            adc_reference_v: c.adc_reference_v,
            adc_max: c.adc_max,
        }
    }
}

// ── Temperature ──────────────────────────────────────────────────────────────

impl From<&aqua_config::TemperatureCfg> for TemperatureSensorCfg {
    fn from(c: &aqua_config::TemperatureCfg) -> Self {
        Self {
            window_s: c.window_s,
            sample_hz: c.sample_hz,
            min_percent: c.min_percent,
            max_updated_ago_ds: c.max_updated_ago_ds,
            min_c: c.min_c,
            max_c: c.max_c,
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

impl From<&aqua_config::DayScheduleCfg> for DaySchedule {
    fn from(c: &aqua_config::DayScheduleCfg) -> Self {
        Self {
            prepare_hour: c.prepare_hour,
            start_hour: c.start_hour,
            end_hour: c.end_hour,
        }
    }
}

impl From<&aqua_config::ControllerCfg> for PhControllerConfig {
    fn from(c: &aqua_config::ControllerCfg) -> Self {
        Self {
            ph_turn_on_off_margin: c.ph_turn_on_off_margin,
            min_safe_ph600: c.min_safe_ph600,
            min_safe_ph60: c.min_safe_ph60,
            day_start_ph: c.day_start_ph,
            day_end_ph: c.day_end_ph,
            normal_day: (&c.normal_day).into(),
            alternate_day: (&c.alternate_day).into(),
            alternative_day: c.alternative_day,
            max_open: Duration::from_secs(c.max_open_s),
            min_exploration: Duration::from_secs(c.min_exploration_s),
            trust_prediction_after: Duration::from_millis(c.trust_prediction_after_ms),
            prediction_jump_fraction: c.prediction_jump_fraction,
            throttle_min: Duration::from_millis(c.throttle_min_ms),
            throttle_max: Duration::from_millis(c.throttle_max_ms),
        }
    }
}

// ── Prediction ───────────────────────────────────────────────────────────────

impl From<&aqua_config::PredictionCfg> for OrchestratorConfig {
    fn from(c: &aqua_config::PredictionCfg) -> Self {
        Self {
            lookback_s: c.lookback_s,
            episode_max_age_s: c.episode_max_age_s,
            split: SplitPolicy {
                training_fraction: c.training_fraction,
                tolerance: c.rebalance_tolerance,
            },
        }
    }
}

// ── Timing ───────────────────────────────────────────────────────────────────

impl From<&aqua_config::DeviceCfg> for GatewayTiming {
    fn from(c: &aqua_config::DeviceCfg) -> Self {
        Self {
            reopen_interval: Duration::from_millis(c.reopen_ms),
            ..Self::default()
        }
    }
}

impl From<&aqua_config::Config> for RuntimeTiming {
    fn from(c: &aqua_config::Config) -> Self {
        Self {
            write_back: Duration::from_millis(c.device.write_back_ms),
            clock_sync: Duration::from_millis(c.device.clock_sync_ms),
            decision: Duration::from_millis(c.controller.decision_tick_ms),
            prediction: Duration::from_millis(c.prediction.tick_ms),
            stats: Duration::from_millis(c.prediction.stats_ms),
            cleanup_check: Duration::from_millis(c.prediction.cleanup_check_ms),
            stale_after: Duration::from_millis(c.device.stale_after_ms),
            ..Self::default()
        }
    }
}

/// Configured fixed offset for hour-of-day, if any.
pub fn utc_offset(c: &aqua_config::ClockCfg) -> Option<FixedOffset> {
    c.utc_offset_minutes
        .and_then(|m| FixedOffset::east_opt(m.saturating_mul(60)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_to_default_core_types() {
        let cfg = aqua_config::Config::default();
        let ctl = PhControllerConfig::from(&cfg.controller);
        let def = PhControllerConfig::default();
        assert_eq!(ctl.normal_day, def.normal_day);
        assert_eq!(ctl.alternate_day, def.alternate_day);
        assert_eq!(ctl.max_open, def.max_open);
        assert_eq!(ctl.throttle_max, def.throttle_max);

        let ph = PhSensorCfg::from(&cfg.ph);
        assert_eq!(ph.calibration, PhCalibration::default());

        let timing = RuntimeTiming::from(&cfg);
        assert_eq!(timing.decision, Duration::from_secs(10));
        assert_eq!(timing.write_back, Duration::from_millis(100));
    }

    #[test]
    fn offset_in_minutes() {
        let c = aqua_config::ClockCfg {
            utc_offset_minutes: Some(90),
        };
        assert_eq!(utc_offset(&c).map(|o| o.local_minus_utc()), Some(5400));
        assert_eq!(utc_offset(&aqua_config::ClockCfg::default()), None);
    }
}
