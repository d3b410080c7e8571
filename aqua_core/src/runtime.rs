//! Cooperative control loop.
//!
//! Everything runs on the thread that calls [`AquaRuntime::step`]: gateway
//! reads, sensor updates, timers and decisions never overlap, so none of the
//! state below is locked. Only the predictor runs elsewhere.
use crate::controller::{Co2Controller, Co2Decision, PhControlRange};
use crate::conversions::utc_offset;
use crate::dataset::DatasetStore;
use crate::error::Result;
use crate::gateway::{DeviceGateway, GatewayStats, GatewayTiming};
use crate::prediction::{MinPhPrediction, PredictionOrchestrator};
use crate::predictor::PredictorWorker;
use crate::protocol::{LightForce, TelemetryFrame};
use crate::sensors::{Co2Sensor, PhReading, PhSensor, TemperatureSensor};
use crate::stream::{DistinctUntilChanged, Latest, Ticker};
use crate::util::{deciseconds_since_midnight, local_hour};
use aqua_traits::{Clock, DeviceLink, SmallRandom};
use chrono::FixedOffset;
use eyre::WrapErr;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RuntimeTiming {
    pub write_back: Duration,
    pub clock_sync: Duration,
    pub decision: Duration,
    pub prediction: Duration,
    pub stats: Duration,
    pub cleanup_check: Duration,
    pub stale_after: Duration,
    /// Sleep between two steps in [`AquaRuntime::run`].
    pub idle: Duration,
}

impl Default for RuntimeTiming {
    fn default() -> Self {
        Self {
            write_back: Duration::from_millis(100),
            clock_sync: Duration::from_secs(3),
            decision: Duration::from_secs(10),
            prediction: Duration::from_secs(1),
            stats: Duration::from_secs(5),
            cleanup_check: Duration::from_secs(600),
            stale_after: Duration::from_secs(5),
            idle: Duration::from_millis(10),
        }
    }
}

/// Sensor processors fed from telemetry.
pub struct Sensors {
    pub ph: PhSensor,
    pub aquarium_temperature: TemperatureSensor,
    pub case_temperature: TemperatureSensor,
    pub co2: Co2Sensor,
}

/// Point-in-time view of the loop for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub ph: Option<PhReading>,
    pub aquarium_temperature: Option<f64>,
    pub case_temperature: Option<f64>,
    pub co2_ppm: Option<f64>,
    pub valve_open: Option<bool>,
    pub daylight_on: Option<bool>,
    pub decision: Option<Co2Decision>,
    pub prediction: Option<MinPhPrediction>,
    pub control_range: Option<PhControlRange>,
    pub gateway: GatewayStats,
}

pub struct AquaRuntime<L: DeviceLink, S: DatasetStore> {
    clock: Arc<dyn Clock + Send + Sync>,
    utc_offset: Option<FixedOffset>,
    gateway: DeviceGateway<L>,
    sensors: Sensors,
    controller: Co2Controller,
    orchestrator: PredictionOrchestrator<S>,

    ph: Latest<PhReading>,
    aquarium_temperature: Latest<f64>,
    case_temperature: Latest<f64>,
    co2_ppm: Latest<f64>,
    valve_open: Latest<bool>,
    daylight_on: Latest<bool>,
    ph600_changes: DistinctUntilChanged<Option<f64>>,
    last_frame: Option<TelemetryFrame>,
    prediction: Option<MinPhPrediction>,

    write_back: Ticker,
    clock_sync: Ticker,
    decision: Ticker,
    prediction_tick: Ticker,
    stats: Ticker,
    cleanup: Ticker,
    idle: Duration,
    disposed: bool,
}

impl<L: DeviceLink, S: DatasetStore> AquaRuntime<L, S> {
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        timing: RuntimeTiming,
        utc_offset: Option<FixedOffset>,
        gateway: DeviceGateway<L>,
        sensors: Sensors,
        controller: Co2Controller,
        orchestrator: PredictionOrchestrator<S>,
    ) -> Self {
        let stale = timing.stale_after;
        Self {
            clock,
            utc_offset,
            gateway,
            sensors,
            controller,
            orchestrator,
            ph: Latest::new(stale),
            aquarium_temperature: Latest::new(stale),
            case_temperature: Latest::new(stale),
            co2_ppm: Latest::new(stale),
            valve_open: Latest::new(stale),
            daylight_on: Latest::new(stale),
            ph600_changes: DistinctUntilChanged::skipping_initial(),
            last_frame: None,
            prediction: None,
            write_back: Ticker::new(timing.write_back),
            clock_sync: Ticker::new(timing.clock_sync),
            decision: Ticker::new(timing.decision),
            prediction_tick: Ticker::new(timing.prediction),
            stats: Ticker::new(timing.stats),
            cleanup: Ticker::new(timing.cleanup_check),
            idle: timing.idle,
            disposed: false,
        }
    }

    pub fn gateway(&self) -> &DeviceGateway<L> {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut DeviceGateway<L> {
        &mut self.gateway
    }

    pub fn controller(&self) -> &Co2Controller {
        &self.controller
    }

    pub fn orchestrator(&self) -> &PredictionOrchestrator<S> {
        &self.orchestrator
    }

    pub fn last_frame(&self) -> Option<&TelemetryFrame> {
        self.last_frame.as_ref()
    }

    pub fn local_hour(&self) -> f64 {
        local_hour(self.clock.unix_seconds(), self.utc_offset)
    }

    /// Manual light override, written with the next command refresh.
    pub fn force_light(&mut self, force: LightForce) {
        self.gateway.force_light(force);
    }

    pub fn force_co2_off(&mut self, forced: bool) {
        self.gateway.force_co2_off(forced);
    }

    pub fn ph_control_range(&self) -> Option<PhControlRange> {
        self.controller.ph_control_range(self.local_hour())
    }

    pub fn snapshot(&self, now: Instant) -> RuntimeSnapshot {
        RuntimeSnapshot {
            ph: self.ph.get_copied(now),
            aquarium_temperature: self.aquarium_temperature.get_copied(now),
            case_temperature: self.case_temperature.get_copied(now),
            co2_ppm: self.co2_ppm.get_copied(now),
            valve_open: self.valve_open.get_copied(now),
            daylight_on: self.daylight_on.get_copied(now),
            decision: self.controller.last_emitted(),
            prediction: self.prediction,
            control_range: self.ph_control_range(),
            gateway: self.gateway.stats(),
        }
    }

    /// One pass of the loop at monotonic instant `now`.
    pub fn step(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        let unix = self.clock.unix_seconds();
        let t = unix.round() as i64;
        let hour = local_hour(unix, self.utc_offset);

        for frame in self.gateway.poll(now) {
            self.on_frame(frame, now, t);
        }

        self.controller
            .on_valve_state(self.valve_open.get_copied(now), now);
        for p in self.orchestrator.drain_predictions(now) {
            self.controller.on_prediction(p.predicted_min_ph);
            self.prediction = Some(p);
        }

        let reading = self.ph.get_copied(now);
        let ph600 = reading.and_then(|r| r.ph600);
        let ph60 = reading.and_then(|r| r.ph60);
        let ph600_changed = self.ph600_changes.push(ph600).is_some();
        if self.decision.due(now) || ph600_changed {
            if let Some(d) = self.controller.evaluate(now, hour, ph600, ph60) {
                self.apply(d);
            }
        }
        if let Some(d) = self.controller.poll(now) {
            self.apply(d);
        }

        if self.prediction_tick.due(now)
            && let Some(p) = self.orchestrator.prediction_tick(t, now)
        {
            self.prediction = Some(p);
        }
        if self.write_back.due(now) {
            self.gateway.flush_commands(now);
        }
        if self.clock_sync.due(now) {
            self.gateway
                .sync_clock(now, deciseconds_since_midnight(unix, self.utc_offset));
        }
        if self.stats.due(now) {
            self.log_stats(now);
        }
        if self.cleanup.due(now) {
            self.orchestrator.cleanup_if_night(hour);
            if let Err(e) = self.orchestrator.maintain() {
                tracing::warn!(error = %e, "dataset maintenance failed");
            }
        }
    }

    fn apply(&mut self, d: Co2Decision) {
        self.gateway.set_required_co2_valve_state(d.required);
    }

    fn on_frame(&mut self, frame: TelemetryFrame, now: Instant, t: i64) {
        if let Some(r) = self.sensors.ph.on_frame(&frame.ph) {
            self.ph.set(r, now);
            self.orchestrator.record_ph(t, r.ph600, r.ph60);
        }
        if let Some(v) = self
            .sensors
            .aquarium_temperature
            .on_frame(&frame.aquarium_temperature)
            .and_then(|r| r.value)
        {
            self.aquarium_temperature.set(v, now);
        }
        if let Some(v) = self.aquarium_temperature.get_copied(now) {
            self.orchestrator.record_temperature(t, v);
        }
        if let Some(v) = self
            .sensors
            .case_temperature
            .on_frame(&frame.case_temperature)
            .and_then(|r| r.value)
        {
            self.case_temperature.set(v, now);
        }
        if let Some(ppm) = self.sensors.co2.on_frame(&frame.co2).and_then(|r| r.ppm) {
            self.co2_ppm.set(ppm, now);
        }

        self.valve_open.set(frame.co2.valve_open, now);
        self.daylight_on.set(frame.light.day_on, now);
        self.orchestrator.record_daylight(t, frame.light.day_on);
        if let Err(e) = self.orchestrator.on_valve_state(t, frame.co2.valve_open) {
            tracing::warn!(error = %e, "episode could not be stored");
        }
        self.last_frame = Some(frame);
    }

    fn log_stats(&self, now: Instant) {
        let s = self.snapshot(now);
        let dataset = self.orchestrator.dataset_stats().unwrap_or_default();
        tracing::info!(
            ph600 = ?s.ph.and_then(|r| r.ph600),
            ph60 = ?s.ph.and_then(|r| r.ph60),
            temperature = ?s.aquarium_temperature,
            valve_open = ?s.valve_open,
            required = ?s.decision.map(|d| d.required),
            predicted_min_ph = ?s.prediction.map(|p| p.predicted_min_ph),
            frames = s.gateway.frames_received,
            crc_errors = s.gateway.crc_errors,
            dataset_total = dataset.total,
            dataset_training = dataset.training,
            dataset_validation = dataset.validation,
            "status"
        );
    }

    /// Step until `shutdown` is set, then dispose.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        tracing::info!("control loop started");
        while !shutdown.load(Ordering::Relaxed) {
            let now = self.clock.now();
            self.step(now);
            self.clock.sleep(self.idle);
        }
        self.dispose();
    }

    /// Cancel timers, close the link and stop the predictor. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for t in [
            &mut self.write_back,
            &mut self.clock_sync,
            &mut self.decision,
            &mut self.prediction_tick,
            &mut self.stats,
            &mut self.cleanup,
        ] {
            t.cancel();
        }
        self.gateway.close();
        self.orchestrator.dispose();
        tracing::info!("control loop stopped");
    }
}

/// Wire a runtime from configuration. Randomness is seeded from
/// `[random] seed` when set.
pub fn build_runtime<L: DeviceLink, S: DatasetStore>(
    cfg: &aqua_config::Config,
    clock: Arc<dyn Clock + Send + Sync>,
    link: L,
    store: S,
    worker: Option<PredictorWorker>,
) -> Result<AquaRuntime<L, S>> {
    let seed = cfg.random.seed;
    let controller = Co2Controller::new(
        (&cfg.controller).into(),
        Box::new(SmallRandom::from_seed_opt(seed)),
    );
    let orchestrator = PredictionOrchestrator::new(
        (&cfg.prediction).into(),
        store,
        Box::new(SmallRandom::from_seed_opt(seed.map(|s| s.wrapping_add(1)))),
        worker,
    )
    .wrap_err("opening prediction dataset")?;
    let t = &cfg.temperature;
    let c = &cfg.co2_sensor;
    let sensors = Sensors {
        ph: PhSensor::new((&cfg.ph).into(), Arc::clone(&clock)),
        aquarium_temperature: TemperatureSensor::new(t.into(), Arc::clone(&clock)),
        case_temperature: TemperatureSensor::new(t.into(), Arc::clone(&clock)),
        co2: Co2Sensor::new(c.window_s, c.sample_hz, c.min_percent, Arc::clone(&clock)),
    };
    let gateway = DeviceGateway::new(link, GatewayTiming::from(&cfg.device));
    Ok(AquaRuntime::new(
        clock,
        RuntimeTiming::from(cfg),
        utc_offset(&cfg.clock),
        gateway,
        sensors,
        controller,
        orchestrator,
    ))
}

impl<L: DeviceLink, S: DatasetStore> Drop for AquaRuntime<L, S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
