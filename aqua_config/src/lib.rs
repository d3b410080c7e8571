#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::neg_cmp_op_on_partial_ord
)]
//! Configuration schema for the aquarium controller.
//!
//! - `Config` and its sections are deserialized from TOML; every section
//!   falls back to field defaults, so an empty file is a valid config.
//! - `Config::validate` rejects values the controller cannot work with.
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable overriding `device.port`.
pub const PORT_ENV: &str = "AQUA_PORT";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceCfg {
    pub port: String,
    pub baud: u32,
    /// Delay between reopen attempts while the serial link is down.
    pub reopen_ms: u64,
    /// Command write-back interval.
    pub write_back_ms: u64,
    pub clock_sync_ms: u64,
    /// Sensor values older than this are treated as unknown.
    pub stale_after_ms: u64,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 9600,
            reopen_ms: 1000,
            write_back_ms: 100,
            clock_sync_ms: 3000,
            stale_after_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PhCfg {
    /// Two-point probe calibration: `ph1` reads `v1` volts, `ph2` reads `v2`.
    pub ph1: f64,
    pub v1: f64,
    pub ph2: f64,
    pub v2: f64,
    /// Carbonate hardness used for the pH based CO2 estimate.
    pub kh: f64,
    pub sample_hz: f64,
    pub short_window_s: f64,
    pub long_window_s: f64,
    pub min_percent: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub adc_reference_v: f64,
    pub adc_max: f64,
}

impl Default for PhCfg {
    fn default() -> Self {
        Self {
            ph1: 4.01,
            v1: 3.109_889_539_510_251,
            ph2: 6.86,
            v2: 2.589_970_313_037_218_5,
            kh: 4.0,
            sample_hz: 7.0,
            short_window_s: 60.0,
            long_window_s: 600.0,
            min_percent: 80.0,
            min_voltage: 1.0,
            max_voltage: 4.0,
            adc_reference_v: 5.0,
            adc_max: 1024.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemperatureCfg {
    pub window_s: f64,
    pub sample_hz: f64,
    pub min_percent: f64,
    pub max_updated_ago_ds: u8,
    pub min_c: f64,
    pub max_c: f64,
}

impl Default for TemperatureCfg {
    fn default() -> Self {
        Self {
            window_s: 15.0,
            sample_hz: 1.0,
            min_percent: 70.0,
            max_updated_ago_ds: 200,
            min_c: 0.0,
            max_c: 50.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Co2SensorCfg {
    pub window_s: f64,
    pub sample_hz: f64,
    pub min_percent: f64,
}

impl Default for Co2SensorCfg {
    fn default() -> Self {
        Self {
            window_s: 300.0,
            sample_hz: 1.0,
            min_percent: 70.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct DayScheduleCfg {
    pub prepare_hour: f64,
    pub start_hour: f64,
    pub end_hour: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerCfg {
    pub ph_turn_on_off_margin: f64,
    pub min_safe_ph600: f64,
    pub min_safe_ph60: f64,
    pub day_start_ph: f64,
    pub day_end_ph: f64,
    pub normal_day: DayScheduleCfg,
    pub alternate_day: DayScheduleCfg,
    /// Use the alternate day schedule.
    pub alternative_day: bool,
    pub max_open_s: u64,
    pub min_exploration_s: u64,
    pub trust_prediction_after_ms: u64,
    pub prediction_jump_fraction: f64,
    pub decision_tick_ms: u64,
    pub throttle_min_ms: u64,
    pub throttle_max_ms: u64,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            ph_turn_on_off_margin: 0.1,
            min_safe_ph600: 6.8,
            min_safe_ph60: 6.6,
            day_start_ph: 6.8,
            day_end_ph: 7.2,
            normal_day: DayScheduleCfg {
                prepare_hour: 8.0,
                start_hour: 10.0,
                end_hour: 21.0,
            },
            alternate_day: DayScheduleCfg {
                prepare_hour: 8.0,
                start_hour: 10.0,
                end_hour: 18.0,
            },
            alternative_day: false,
            max_open_s: 900,
            min_exploration_s: 1,
            trust_prediction_after_ms: 2000,
            prediction_jump_fraction: 0.4,
            decision_tick_ms: 10_000,
            throttle_min_ms: 3000,
            throttle_max_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictionCfg {
    /// Share of new episodes assigned to training.
    pub training_fraction: f64,
    pub rebalance_tolerance: usize,
    pub episode_max_age_s: i64,
    pub lookback_s: i64,
    pub tick_ms: u64,
    pub stats_ms: u64,
    pub cleanup_check_ms: u64,
    /// JSON weights of the linear predictor; predictions are off when absent.
    pub model: Option<PathBuf>,
}

impl Default for PredictionCfg {
    fn default() -> Self {
        Self {
            training_fraction: 0.9,
            rebalance_tolerance: 20,
            episode_max_age_s: 7 * 60 * 60,
            lookback_s: 3,
            tick_ms: 1000,
            stats_ms: 5000,
            cleanup_check_ms: 600_000,
            model: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatasetCfg {
    pub dir: PathBuf,
    pub file: String,
}

impl Default for DatasetCfg {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("var/db"),
            file: "co2-closing-states.json".into(),
        }
    }
}

impl DatasetCfg {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(default)]
pub struct ClockCfg {
    /// Fixed offset used for hour-of-day; the host time zone when absent.
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(default)]
pub struct RandomCfg {
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub device: DeviceCfg,
    pub ph: PhCfg,
    pub temperature: TemperatureCfg,
    pub co2_sensor: Co2SensorCfg,
    pub controller: ControllerCfg,
    pub prediction: PredictionCfg,
    pub dataset: DatasetCfg,
    pub logging: Logging,
    pub clock: ClockCfg,
    pub random: RandomCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and apply environment overrides.
pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("reading config {}: {e}", path.display()))?;
    let mut cfg =
        load_toml(&text).map_err(|e| eyre::eyre!("parsing config {}: {e}", path.display()))?;
    cfg.apply_env(|k| std::env::var(k).ok());
    Ok(cfg)
}

fn check_window(section: &str, window_s: f64, hz: f64, pct: f64) -> eyre::Result<()> {
    if !(window_s > 0.0) {
        eyre::bail!("{section}.window_s must be > 0");
    }
    if !(hz > 0.0) {
        eyre::bail!("{section}.sample_hz must be > 0");
    }
    if !(pct > 0.0 && pct <= 100.0) {
        eyre::bail!("{section}.min_percent must be in (0, 100]");
    }
    Ok(())
}

fn check_schedule(name: &str, s: &DayScheduleCfg) -> eyre::Result<()> {
    let ordered = s.prepare_hour > 0.0
        && s.prepare_hour < s.start_hour
        && s.start_hour < s.end_hour
        && s.end_hour <= 24.0;
    if !ordered {
        eyre::bail!(
            "controller.{name} must satisfy 0 < prepare_hour < start_hour < end_hour <= 24"
        );
    }
    Ok(())
}

impl Config {
    /// Apply overrides from the environment. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(PORT_ENV).filter(|p| !p.trim().is_empty()) {
            self.device.port = port;
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // device
        if self.device.port.trim().is_empty() {
            eyre::bail!("device.port must not be empty");
        }
        if self.device.baud == 0 {
            eyre::bail!("device.baud must be > 0");
        }
        for (name, v) in [
            ("reopen_ms", self.device.reopen_ms),
            ("write_back_ms", self.device.write_back_ms),
            ("clock_sync_ms", self.device.clock_sync_ms),
            ("stale_after_ms", self.device.stale_after_ms),
        ] {
            if v == 0 {
                eyre::bail!("device.{name} must be >= 1");
            }
        }

        // ph
        let ph = &self.ph;
        if (ph.ph1 - ph.ph2).abs() < f64::EPSILON {
            eyre::bail!("ph.ph1 and ph.ph2 must differ");
        }
        if (ph.v1 - ph.v2).abs() < f64::EPSILON {
            eyre::bail!("ph.v1 and ph.v2 must differ");
        }
        if !(ph.kh > 0.0) {
            eyre::bail!("ph.kh must be > 0");
        }
        check_window("ph", ph.short_window_s, ph.sample_hz, ph.min_percent)?;
        if !(ph.long_window_s >= ph.short_window_s) {
            eyre::bail!("ph.long_window_s must be >= ph.short_window_s");
        }
        if !(ph.min_voltage < ph.max_voltage) {
            eyre::bail!("ph.min_voltage must be < ph.max_voltage");
        }
        if !(ph.adc_reference_v > 0.0 && ph.adc_max > 0.0) {
            eyre::bail!("ph.adc_reference_v and ph.adc_max must be > 0");
        }

        // sensors
        let t = &self.temperature;
        check_window("temperature", t.window_s, t.sample_hz, t.min_percent)?;
        if !(t.min_c < t.max_c) {
            eyre::bail!("temperature.min_c must be < temperature.max_c");
        }
        let c = &self.co2_sensor;
        check_window("co2_sensor", c.window_s, c.sample_hz, c.min_percent)?;

        // controller
        let ctl = &self.controller;
        if !(ctl.ph_turn_on_off_margin > 0.0) {
            eyre::bail!("controller.ph_turn_on_off_margin must be > 0");
        }
        if !(ctl.min_safe_ph600 > 0.0 && ctl.min_safe_ph60 > 0.0) {
            eyre::bail!("controller.min_safe_ph600 and min_safe_ph60 must be > 0");
        }
        if (ctl.day_start_ph - ctl.day_end_ph).abs() < f64::EPSILON {
            eyre::bail!("controller.day_start_ph must differ from day_end_ph");
        }
        check_schedule("normal_day", &ctl.normal_day)?;
        check_schedule("alternate_day", &ctl.alternate_day)?;
        if ctl.max_open_s == 0 {
            eyre::bail!("controller.max_open_s must be >= 1");
        }
        if ctl.min_exploration_s > ctl.max_open_s {
            eyre::bail!("controller.min_exploration_s must be <= controller.max_open_s");
        }
        if !(ctl.prediction_jump_fraction > 0.0 && ctl.prediction_jump_fraction <= 1.0) {
            eyre::bail!("controller.prediction_jump_fraction must be in (0.0, 1.0]");
        }
        if ctl.decision_tick_ms == 0 {
            eyre::bail!("controller.decision_tick_ms must be >= 1");
        }
        if ctl.throttle_min_ms > ctl.throttle_max_ms {
            eyre::bail!("controller.throttle_min_ms must be <= controller.throttle_max_ms");
        }

        // prediction
        let p = &self.prediction;
        if !(p.training_fraction > 0.0 && p.training_fraction <= 1.0) {
            eyre::bail!("prediction.training_fraction must be in (0.0, 1.0]");
        }
        if p.episode_max_age_s <= 0 {
            eyre::bail!("prediction.episode_max_age_s must be >= 1");
        }
        if p.lookback_s < 0 {
            eyre::bail!("prediction.lookback_s must be >= 0");
        }
        for (name, v) in [
            ("tick_ms", p.tick_ms),
            ("stats_ms", p.stats_ms),
            ("cleanup_check_ms", p.cleanup_check_ms),
        ] {
            if v == 0 {
                eyre::bail!("prediction.{name} must be >= 1");
            }
        }

        // dataset
        if self.dataset.file.trim().is_empty() {
            eyre::bail!("dataset.file must not be empty");
        }

        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly");
        }
        if let Some(m) = self.clock.utc_offset_minutes
            && !(-18 * 60..=18 * 60).contains(&m)
        {
            eyre::bail!("clock.utc_offset_minutes must be within +-1080");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default_and_valid() {
        let cfg = load_toml("").unwrap();
        assert_eq!(cfg.device.port, "/dev/ttyUSB0");
        assert_eq!(cfg.controller.normal_day.end_hour, 21.0);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_port() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| (k == PORT_ENV).then(|| "/dev/ttyAMA0".to_string()));
        assert_eq!(cfg.device.port, "/dev/ttyAMA0");
        cfg.apply_env(|_| Some("  ".into()));
        assert_eq!(cfg.device.port, "/dev/ttyAMA0");
    }
}
