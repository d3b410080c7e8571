//! Turn raw telemetry into averaged sensor readings.
use crate::averaging::AveragingWindow;
use crate::protocol::{Co2State, PhAdcState, TemperatureSensorState};
use crate::util::round_to;
use aqua_traits::Clock;
use serde::Serialize;
use std::sync::Arc;

/// Two-point probe calibration: voltage `v1` reads `ph1`, `v2` reads `ph2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhCalibration {
    pub ph1: f64,
    pub v1: f64,
    pub ph2: f64,
    pub v2: f64,
}

impl Default for PhCalibration {
    fn default() -> Self {
        Self {
            ph1: 4.01,
            v1: 3.109889539510251,
            ph2: 6.86,
            v2: 2.5899703130372185,
        }
    }
}

impl PhCalibration {
    /// Slope and intercept of `ph = a·v + b` through both calibration points.
    pub fn solve(&self) -> (f64, f64) {
        let dv = self.v1 - self.v2;
        let a = (self.ph1 - self.ph2) / dv;
        let b = (self.ph2 * self.v1 - self.ph1 * self.v2) / dv;
        (a, b)
    }
}

#[derive(Debug, Clone)]
pub struct PhSensorCfg {
    pub calibration: PhCalibration,
    /// Carbonate hardness used for the pH-derived CO2 estimate.
    pub kh: f64,
    pub sample_hz: f64,
    pub short_window_s: f64,
    pub long_window_s: f64,
    pub min_percent: f64,
    /// Accepted voltages are `min_voltage <= v < max_voltage`.
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub adc_reference_v: f64,
    pub adc_max: f64,
}

impl Default for PhSensorCfg {
    fn default() -> Self {
        Self {
            calibration: PhCalibration::default(),
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

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhReading {
    pub voltage: f64,
    pub ph60: Option<f64>,
    pub ph600: Option<f64>,
    pub samples60: usize,
    pub samples600: usize,
    /// Dissolved CO2 (mg/l) implied by pH600 and carbonate hardness.
    pub ph_based_co2: Option<f64>,
}

/// `3 · kh · 10^(7 − ph)`
pub fn co2_from_ph(kh: f64, ph: f64) -> f64 {
    3.0 * kh * 10f64.powf(7.0 - ph)
}

pub struct PhSensor {
    cfg: PhSensorCfg,
    a: f64,
    b: f64,
    short: AveragingWindow,
    long: AveragingWindow,
}

impl PhSensor {
    pub fn new(cfg: PhSensorCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let (a, b) = cfg.calibration.solve();
        let short = AveragingWindow::new(
            cfg.short_window_s,
            cfg.sample_hz,
            cfg.min_percent,
            clock.clone(),
        );
        let long = AveragingWindow::new(cfg.long_window_s, cfg.sample_hz, cfg.min_percent, clock);
        Self {
            cfg,
            a,
            b,
            short,
            long,
        }
    }

    pub fn ph_from_voltage(&self, v: f64) -> f64 {
        self.a * v + self.b
    }

    /// Mean ADC voltage of one frame, if the device took any samples.
    pub fn adc_voltage(&self, adc: &PhAdcState) -> Option<f64> {
        if adc.adc_samples == 0 {
            return None;
        }
        let mean = f64::from(adc.adc_accum) / f64::from(adc.adc_samples);
        Some(mean * self.cfg.adc_reference_v / self.cfg.adc_max)
    }

    /// Feed one frame. Returns a reading when the voltage was plausible.
    pub fn on_frame(&mut self, adc: &PhAdcState) -> Option<PhReading> {
        let v = self.adc_voltage(adc)?;
        if !(v >= self.cfg.min_voltage && v < self.cfg.max_voltage) {
            tracing::trace!(voltage = v, "ph voltage out of range");
            return None;
        }
        self.short.add(v);
        self.long.add(v);
        let ph60 = self.short.get().map(|mv| round_to(self.ph_from_voltage(mv), 3));
        let ph600 = self.long.get().map(|mv| round_to(self.ph_from_voltage(mv), 3));
        Some(PhReading {
            voltage: v,
            ph60,
            ph600,
            samples60: self.short.count(),
            samples600: self.long.count(),
            ph_based_co2: ph600.map(|ph| co2_from_ph(self.cfg.kh, ph)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TemperatureSensorCfg {
    pub window_s: f64,
    pub sample_hz: f64,
    pub min_percent: f64,
    /// Readings older than this on the device are ignored (deciseconds).
    pub max_updated_ago_ds: u8,
    /// Accepted range, exclusive on both ends.
    pub min_c: f64,
    pub max_c: f64,
}

impl Default for TemperatureSensorCfg {
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

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub value: Option<f64>,
    pub samples: usize,
    pub last_raw_c: f64,
}

/// One DS18B20 probe. Only fresh conversions (new update id) are sampled.
pub struct TemperatureSensor {
    cfg: TemperatureSensorCfg,
    window: AveragingWindow,
    last_update_id: Option<u8>,
}

impl TemperatureSensor {
    pub fn new(cfg: TemperatureSensorCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let window = AveragingWindow::new(cfg.window_s, cfg.sample_hz, cfg.min_percent, clock);
        Self {
            cfg,
            window,
            last_update_id: None,
        }
    }

    pub fn on_frame(&mut self, state: &TemperatureSensorState) -> Option<TemperatureReading> {
        if self.last_update_id == Some(state.update_id) {
            return None;
        }
        let c = state.celsius();
        if state.updated_ago_ds >= self.cfg.max_updated_ago_ds
            || c <= self.cfg.min_c
            || c >= self.cfg.max_c
        {
            return None;
        }
        self.last_update_id = Some(state.update_id);
        self.window.add(c);
        Some(TemperatureReading {
            value: self.window.get(),
            samples: self.window.count(),
            last_raw_c: c,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Co2Reading {
    pub ppm: Option<f64>,
    pub samples: usize,
}

/// Averaged CO2 concentration from the gas sensor.
pub struct Co2Sensor {
    window: AveragingWindow,
    last_update_id: Option<u8>,
}

impl Co2Sensor {
    pub fn new(
        window_s: f64,
        sample_hz: f64,
        min_percent: f64,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            window: AveragingWindow::new(window_s, sample_hz, min_percent, clock),
            last_update_id: None,
        }
    }

    pub fn on_frame(&mut self, state: &Co2State) -> Option<Co2Reading> {
        if self.last_update_id == Some(state.update_id) || state.concentration == 0 {
            return None;
        }
        self.last_update_id = Some(state.update_id);
        self.window.add(f64::from(state.concentration));
        Some(Co2Reading {
            ppm: self.window.get(),
            samples: self.window.count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_traits::TestClock;

    #[test]
    fn calibration_points_map_exactly() {
        let cal = PhCalibration::default();
        let (a, b) = cal.solve();
        assert!((a * cal.v1 + b - cal.ph1).abs() < 1e-9);
        assert!((a * cal.v2 + b - cal.ph2).abs() < 1e-9);
    }

    #[test]
    fn co2_estimate_from_ph() {
        assert!((co2_from_ph(4.0, 7.0) - 12.0).abs() < 1e-9);
        assert!((co2_from_ph(4.0, 6.0) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn ph_sensor_reports_once_window_fills() {
        let clock = TestClock::new();
        let cfg = PhSensorCfg {
            short_window_s: 1.0,
            long_window_s: 2.0,
            sample_hz: 2.0,
            min_percent: 50.0,
            ..Default::default()
        };
        let mut s = PhSensor::new(cfg, Arc::new(clock.clone()));
        // 2.6 V average: 532.48 counts per sample.
        let adc = PhAdcState {
            adc_accum: 53_248,
            adc_samples: 100,
        };
        let r = s.on_frame(&adc).unwrap();
        assert!((r.voltage - 2.6).abs() < 1e-9);
        assert_eq!(r.samples60, 1);
        assert!(r.ph60.is_some());
        assert_eq!(r.ph600, None);
        clock.advance_secs(0.5);
        let r = s.on_frame(&adc).unwrap();
        let expected = round_to(s.ph_from_voltage(2.6), 3);
        assert_eq!(r.ph600, Some(expected));
        assert!(r.ph_based_co2.is_some());
    }

    #[test]
    fn ph_sensor_rejects_implausible_voltage() {
        let mut s = PhSensor::new(PhSensorCfg::default(), Arc::new(TestClock::new()));
        let none = PhAdcState::default();
        assert_eq!(s.on_frame(&none), None);
        // 4.0 V is outside the half-open range.
        let high = PhAdcState {
            adc_accum: 8192,
            adc_samples: 10,
        };
        assert_eq!(s.on_frame(&high), None);
    }

    #[test]
    fn temperature_samples_only_new_conversions() {
        let clock = TestClock::new();
        let cfg = TemperatureSensorCfg {
            min_percent: 1.0,
            ..Default::default()
        };
        let mut s = TemperatureSensor::new(cfg, Arc::new(clock));
        let mut st = TemperatureSensorState {
            temperature_x16: 25 * 16,
            update_id: 1,
            updated_ago_ds: 3,
            ..Default::default()
        };
        assert_eq!(s.on_frame(&st).unwrap().value, Some(25.0));
        assert_eq!(s.on_frame(&st), None);
        st.update_id = 2;
        st.temperature_x16 = 26 * 16;
        assert_eq!(s.on_frame(&st).unwrap().value, Some(25.5));
        st.update_id = 3;
        st.updated_ago_ds = 250;
        assert_eq!(s.on_frame(&st), None);
        st.updated_ago_ds = 1;
        st.temperature_x16 = 0;
        assert_eq!(s.on_frame(&st), None);
    }
}
