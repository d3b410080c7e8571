//! In-process stand-in for the tank microcontroller.
//!
//! Emits status lines at the firmware's cadence and reacts to host commands
//! the way the firmware does: `G` drives the valve, `F` and `L` hold a force
//! for ten device minutes, `A`/`B`/`C` set the device clock. A first-order
//! tank model turns valve time into pH drift so the controller has something
//! to regulate.
use std::sync::Arc;
use std::time::{Duration, Instant};

use aqua_core::protocol::{
    Command, CommandParser, LightForce, PROTOCOL_VERSION, TelemetryFrame, encode_status,
};
use aqua_core::sensors::PhSensorCfg;
use aqua_traits::{Clock, DeviceLink, LinkError};

use crate::error::HwError;

const DS_PER_DAY: u32 = 24 * 60 * 60 * 10;
const FORCE_HOLD_DS: u32 = 10 * 60 * 10;

#[derive(Debug, Clone)]
pub struct SimulatorCfg {
    /// Calibration used to turn the modelled pH back into ADC counts.
    pub ph: PhSensorCfg,
    pub frame_interval: Duration,
    pub start_ph: f64,
    /// pH the tank relaxes to with the valve closed.
    pub equilibrium_ph: f64,
    /// pH drop per second with the valve open.
    pub co2_rate: f64,
    /// Fraction of the gap to equilibrium recovered per second.
    pub degas_rate: f64,
    pub tank_c: f64,
    pub case_c: f64,
    pub co2_ppm: u16,
    pub day_hours: (f64, f64),
}

impl Default for SimulatorCfg {
    fn default() -> Self {
        Self {
            ph: PhSensorCfg::default(),
            frame_interval: Duration::from_millis(100),
            start_ph: 7.2,
            equilibrium_ph: 7.4,
            co2_rate: 0.0006,
            degas_rate: 0.0008,
            tank_c: 25.0,
            case_c: 31.0,
            co2_ppm: 420,
            day_hours: (8.0, 21.0),
        }
    }
}

/// Device-side state, visible to tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    pub ph: f64,
    pub clock_ds: u32,
    pub clock_corrections: u32,
    pub uptime_ds: u32,
    pub required_open: bool,
    pub valve_open: bool,
    pub force_off_ds: u32,
    pub light: LightForce,
    pub light_force_ds: u32,
    pub light_forces: u8,
    pub frames: u32,
}

pub struct SimulatedDevice {
    cfg: SimulatorCfg,
    clock: Arc<dyn Clock + Send + Sync>,
    open: bool,
    parser: CommandParser,
    pending_clock: [Option<u8>; 2],
    last_frame_at: Option<Instant>,
    state: DeviceState,
}

impl SimulatedDevice {
    pub fn new(cfg: SimulatorCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let state = DeviceState {
            ph: cfg.start_ph,
            ..DeviceState::default()
        };
        Self {
            cfg,
            clock,
            open: false,
            parser: CommandParser::new(),
            pending_clock: [None; 2],
            last_frame_at: None,
            state,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    fn apply(&mut self, cmd: Command) {
        tracing::trace!(?cmd, "simulator command");
        match cmd {
            Command::ForceCo2Off => self.state.force_off_ds = FORCE_HOLD_DS,
            Command::RequiredCo2Valve(open) => self.state.required_open = open,
            Command::Light(force) => {
                self.state.light = force;
                self.state.light_force_ds = match force {
                    LightForce::NotForced => 0,
                    _ => FORCE_HOLD_DS,
                };
                self.state.light_forces = self.state.light_forces.wrapping_add(1);
            }
            Command::Clock0(b) => self.pending_clock[0] = Some(b),
            Command::Clock1(b) => self.pending_clock[1] = Some(b),
            Command::Clock2(b) => {
                if let [Some(b0), Some(b1)] = self.pending_clock {
                    let ds = u32::from_le_bytes([b0, b1, b, 0]);
                    if ds < DS_PER_DAY && ds != self.state.clock_ds {
                        self.state.clock_ds = ds;
                        self.state.clock_corrections += 1;
                    }
                }
                self.pending_clock = [None; 2];
            }
        }
    }

    fn is_day(&self) -> bool {
        match self.state.light {
            LightForce::Day if self.state.light_force_ds > 0 => true,
            LightForce::Night if self.state.light_force_ds > 0 => false,
            _ => {
                let hour = f64::from(self.state.clock_ds) / 36_000.0;
                hour >= self.cfg.day_hours.0 && hour < self.cfg.day_hours.1
            }
        }
    }

    /// Advance the device and tank model by one frame interval.
    fn tick(&mut self) {
        let dt = self.cfg.frame_interval.as_secs_f64();
        let ds = (dt * 10.0).round() as u32;
        let s = &mut self.state;
        s.uptime_ds = s.uptime_ds.wrapping_add(ds);
        s.clock_ds = (s.clock_ds + ds) % DS_PER_DAY;
        s.force_off_ds = s.force_off_ds.saturating_sub(ds);
        s.light_force_ds = s.light_force_ds.saturating_sub(ds);
        s.valve_open = s.required_open && s.force_off_ds == 0;
        if s.valve_open {
            s.ph -= self.cfg.co2_rate * dt;
        } else {
            s.ph += (self.cfg.equilibrium_ph - s.ph) * self.cfg.degas_rate * dt;
        }
        s.frames = s.frames.wrapping_add(1);
    }

    fn frame(&self) -> TelemetryFrame {
        let s = &self.state;
        let p = &self.cfg.ph;
        let (a, b) = p.calibration.solve();
        let volts = (s.ph - b) / a;
        let counts = volts * p.adc_max / p.adc_reference_v;
        let samples: u16 = 50;

        let mut f = TelemetryFrame {
            version: PROTOCOL_VERSION,
            ..TelemetryFrame::default()
        };
        f.diagnostics.uptime_ds = s.uptime_ds;
        f.diagnostics.main_loop_iterations = s.frames.wrapping_mul(1000);
        f.diagnostics.clock_corrections = s.clock_corrections;
        f.diagnostics.clock_ds_since_midnight = s.clock_ds;

        // Probes and the gas sensor refresh about once per second.
        let second = (s.uptime_ds / 10) as u8;
        f.aquarium_temperature.temperature_x16 = (self.cfg.tank_c * 16.0).round() as u16;
        f.aquarium_temperature.update_id = second;
        f.case_temperature.temperature_x16 = (self.cfg.case_c * 16.0).round() as u16;
        f.case_temperature.update_id = second;
        f.co2.concentration = self.cfg.co2_ppm;
        f.co2.raw_concentration = self.cfg.co2_ppm;
        f.co2.clamped_concentration = self.cfg.co2_ppm;
        f.co2.update_id = second;
        f.co2.valve_open = s.valve_open;
        f.co2.required_open = s.required_open;
        f.co2.force_off = s.force_off_ds > 0;
        f.co2.calculated_day = self.is_day();

        let day = self.is_day();
        f.light.day_on = day;
        f.light.night_on = !day;
        f.light.day_forced = s.light == LightForce::Day && s.light_force_ds > 0;
        f.light.night_forced = s.light == LightForce::Night && s.light_force_ds > 0;
        f.light.forces = s.light_forces;

        f.ph.adc_accum = (counts * f64::from(samples)).round().max(0.0) as u32;
        f.ph.adc_samples = samples;
        f
    }

    /// Emit every frame that became due since the last read.
    fn emit_due(&mut self, buf: &mut Vec<u8>) -> usize {
        let now = self.clock.now();
        let interval = self.cfg.frame_interval;
        let mut at = *self.last_frame_at.get_or_insert(now);
        let mut written = 0;
        while now.saturating_duration_since(at) >= interval {
            at += interval;
            self.tick();
            let line = encode_status(&self.frame());
            buf.extend_from_slice(line.as_bytes());
            written += line.len();
        }
        self.last_frame_at = Some(at);
        written
    }
}

impl DeviceLink for SimulatedDevice {
    fn open(&mut self) -> Result<(), LinkError> {
        self.open = true;
        self.last_frame_at = None;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_into(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<usize, LinkError> {
        if !self.open {
            return Err(HwError::NotOpen.into());
        }
        let n = self.emit_due(buf);
        if n > 0 || timeout.is_zero() {
            return Ok(n);
        }
        self.clock.sleep(timeout);
        Ok(self.emit_due(buf))
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(HwError::NotOpen.into());
        }
        for cmd in self.parser.feed(bytes) {
            self.apply(cmd);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}
