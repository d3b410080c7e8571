//! CO2 valve controller: time-of-day target curve plus a hysteresis and
//! safety state machine whose output is throttled asymmetrically.
use crate::stream::{AsymmetricThrottle, SameState};
use aqua_traits::RandomSource;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Control points of one day type, in fractional local hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaySchedule {
    pub prepare_hour: f64,
    pub start_hour: f64,
    pub end_hour: f64,
}

#[derive(Debug, Clone)]
pub struct PhControllerConfig {
    /// Gap between the turn-off target and the turn-on target.
    pub ph_turn_on_off_margin: f64,
    pub min_safe_ph600: f64,
    pub min_safe_ph60: f64,
    pub day_start_ph: f64,
    pub day_end_ph: f64,
    pub normal_day: DaySchedule,
    pub alternate_day: DaySchedule,
    pub alternative_day: bool,
    /// Hard cap on one opening.
    pub max_open: Duration,
    /// Lower bound of the per-opening exploration limit; the upper bound is `max_open`.
    pub min_exploration: Duration,
    /// Predictions are ignored during the first moments of an opening.
    pub trust_prediction_after: Duration,
    /// A prediction moving by more than this share of the margin closes the valve.
    pub prediction_jump_fraction: f64,
    pub throttle_min: Duration,
    pub throttle_max: Duration,
}

impl Default for PhControllerConfig {
    fn default() -> Self {
        Self {
            ph_turn_on_off_margin: 0.1,
            min_safe_ph600: 6.8,
            min_safe_ph60: 6.6,
            day_start_ph: 6.8,
            day_end_ph: 7.2,
            normal_day: DaySchedule {
                prepare_hour: 8.0,
                start_hour: 10.0,
                end_hour: 21.0,
            },
            alternate_day: DaySchedule {
                prepare_hour: 8.0,
                start_hour: 10.0,
                end_hour: 18.0,
            },
            alternative_day: false,
            max_open: Duration::from_secs(15 * 60),
            min_exploration: Duration::from_secs(1),
            trust_prediction_after: Duration::from_secs(2),
            prediction_jump_fraction: 0.4,
            throttle_min: Duration::from_secs(3),
            throttle_max: Duration::from_secs(5),
        }
    }
}

/// Coefficients of the two arcs of the target curve:
/// `a·e^(100/t) + b` from prepare to start, `c·e^(t/2) + d` from start to end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinPhEquationParams {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl MinPhEquationParams {
    /// Fit both arcs through `(prepare, end_ph)`, `(start, start_ph)` and `(end, end_ph)`.
    pub fn fit(schedule: &DaySchedule, day_start_ph: f64, day_end_ph: f64) -> Self {
        let (t1, t2, t3) = (
            schedule.prepare_hour,
            schedule.start_hour,
            schedule.end_hour,
        );
        let (ph1, ph2, ph3) = (day_end_ph, day_start_ph, day_end_ph);
        let arc1 = |t: f64| (100.0 / t).exp();
        let arc2 = |t: f64| (t / 2.0).exp();
        let a = (ph1 - ph2) / (arc1(t1) - arc1(t2));
        let b = ph1 - a * arc1(t1);
        let c = (ph2 - ph3) / (arc2(t2) - arc2(t3));
        let d = ph2 - c * arc2(t2);
        Self { a, b, c, d }
    }
}

/// Time-of-day minimum acceptable pH for one day type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetCurve {
    pub schedule: DaySchedule,
    pub params: MinPhEquationParams,
}

impl TargetCurve {
    pub fn new(schedule: DaySchedule, day_start_ph: f64, day_end_ph: f64) -> Self {
        Self {
            schedule,
            params: MinPhEquationParams::fit(&schedule, day_start_ph, day_end_ph),
        }
    }

    /// Undefined outside `[prepare_hour, end_hour]`.
    pub fn target_min_ph(&self, hour: f64) -> Option<f64> {
        let s = &self.schedule;
        if !hour.is_finite() || hour < s.prepare_hour || hour > s.end_hour {
            return None;
        }
        let p = &self.params;
        if hour < s.start_hour {
            Some(p.a * (100.0 / hour).exp() + p.b)
        } else {
            Some(p.c * (hour / 2.0).exp() + p.d)
        }
    }
}

/// pH band the controller is currently steering within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhControlRange {
    pub ph_to_turn_off: f64,
    pub ph_to_turn_on: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    MissingPh600,
    MissingPh60,
    MissingValveState,
    NoTargetForHour,
    MaxOpenTimeReached,
    ExplorationLimitReached,
    Ph600BelowSafeMinimum,
    Ph60BelowSafeMinimum,
    PredictedTroughBelowTarget,
    PredictionJumped,
    Ph600AboveTarget,
    Ph600ReachedTarget,
    Ph600AboveTurnOn,
    Ph600BelowTurnOn,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::MissingPh600 => "no ph600 value",
            DecisionReason::MissingPh60 => "no ph60 value",
            DecisionReason::MissingValveState => "valve state unknown",
            DecisionReason::NoTargetForHour => "no target ph at this hour",
            DecisionReason::MaxOpenTimeReached => "valve open for the maximum time",
            DecisionReason::ExplorationLimitReached => "exploration limit reached",
            DecisionReason::Ph600BelowSafeMinimum => "ph600 at or below safe minimum",
            DecisionReason::Ph60BelowSafeMinimum => "ph60 at or below safe minimum",
            DecisionReason::PredictedTroughBelowTarget => "predicted trough at or below target",
            DecisionReason::PredictionJumped => "prediction changed too much",
            DecisionReason::Ph600AboveTarget => "ph600 above target",
            DecisionReason::Ph600ReachedTarget => "ph600 reached target",
            DecisionReason::Ph600AboveTurnOn => "ph600 above turn-on level",
            DecisionReason::Ph600BelowTurnOn => "ph600 below turn-on level",
        };
        f.write_str(s)
    }
}

/// Whether CO2 is required, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Co2Decision {
    pub required: bool,
    pub reason: DecisionReason,
}

impl Co2Decision {
    fn open(reason: DecisionReason) -> Self {
        Self {
            required: true,
            reason,
        }
    }

    fn closed(reason: DecisionReason) -> Self {
        Self {
            required: false,
            reason,
        }
    }
}

impl SameState for Co2Decision {
    fn same_state(&self, other: &Self) -> bool {
        self.required == other.required
    }
}

/// Latest trough prediction and the one before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionInput {
    pub predicted_min_ph: f64,
    pub previous_min_ph: Option<f64>,
}

/// Everything one evaluation looks at. `None` means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DecisionInputs {
    pub ph600: Option<f64>,
    pub ph60: Option<f64>,
    pub valve_open: Option<bool>,
    pub hour: f64,
    pub open_for: Option<Duration>,
    pub prediction: Option<PredictionInput>,
}

/// Pure decision rule. `exploration_limit` is the randomized cap drawn for the
/// current opening.
pub fn decide(
    cfg: &PhControllerConfig,
    curve: &TargetCurve,
    inputs: &DecisionInputs,
    exploration_limit: Duration,
) -> Co2Decision {
    use DecisionReason::*;

    let Some(ph600) = inputs.ph600 else {
        return Co2Decision::closed(MissingPh600);
    };
    let Some(ph60) = inputs.ph60 else {
        return Co2Decision::closed(MissingPh60);
    };
    let Some(valve_open) = inputs.valve_open else {
        return Co2Decision::closed(MissingValveState);
    };
    let Some(target) = curve.target_min_ph(inputs.hour) else {
        return Co2Decision::closed(NoTargetForHour);
    };
    let margin = cfg.ph_turn_on_off_margin;

    if !valve_open {
        return if ph600 >= target + margin {
            Co2Decision::open(Ph600AboveTurnOn)
        } else {
            Co2Decision::closed(Ph600BelowTurnOn)
        };
    }

    let open_for = inputs.open_for.unwrap_or_default();
    if open_for > cfg.max_open {
        return Co2Decision::closed(MaxOpenTimeReached);
    }
    if open_for > exploration_limit {
        return Co2Decision::closed(ExplorationLimitReached);
    }
    if ph600 <= cfg.min_safe_ph600 {
        return Co2Decision::closed(Ph600BelowSafeMinimum);
    }
    if ph60 <= cfg.min_safe_ph60 {
        return Co2Decision::closed(Ph60BelowSafeMinimum);
    }
    if open_for > cfg.trust_prediction_after
        && let Some(p) = inputs.prediction
    {
        if p.predicted_min_ph <= target {
            return Co2Decision::closed(PredictedTroughBelowTarget);
        }
        if let Some(prev) = p.previous_min_ph
            && (p.predicted_min_ph - prev).abs() > cfg.prediction_jump_fraction * margin
        {
            return Co2Decision::closed(PredictionJumped);
        }
    }
    if ph600 > target {
        Co2Decision::open(Ph600AboveTarget)
    } else {
        Co2Decision::closed(Ph600ReachedTarget)
    }
}

/// Stateful controller: tracks valve openings, draws exploration limits,
/// keeps the prediction pair and throttles emitted decisions.
pub struct Co2Controller {
    cfg: PhControllerConfig,
    normal: TargetCurve,
    alternate: TargetCurve,
    rng: Box<dyn RandomSource + Send>,
    valve_open: Option<bool>,
    /// Last reported valve state; survives stale gaps in telemetry.
    known_open: bool,
    opened_at: Option<Instant>,
    exploration_limit: Duration,
    prediction: Option<f64>,
    previous_prediction: Option<f64>,
    throttle: AsymmetricThrottle<Co2Decision>,
    last_evaluated: Option<Co2Decision>,
}

impl core::fmt::Debug for Co2Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Co2Controller")
            .field("valve_open", &self.valve_open)
            .field("exploration_limit", &self.exploration_limit)
            .field("prediction", &self.prediction)
            .field("last_evaluated", &self.last_evaluated)
            .finish()
    }
}

impl Co2Controller {
    pub fn new(cfg: PhControllerConfig, rng: Box<dyn RandomSource + Send>) -> Self {
        let normal = TargetCurve::new(cfg.normal_day, cfg.day_start_ph, cfg.day_end_ph);
        let alternate = TargetCurve::new(cfg.alternate_day, cfg.day_start_ph, cfg.day_end_ph);
        let throttle = AsymmetricThrottle::new(cfg.throttle_min, cfg.throttle_max);
        let exploration_limit = cfg.max_open;
        Self {
            cfg,
            normal,
            alternate,
            rng,
            valve_open: None,
            known_open: false,
            opened_at: None,
            exploration_limit,
            prediction: None,
            previous_prediction: None,
            throttle,
            last_evaluated: None,
        }
    }

    pub fn config(&self) -> &PhControllerConfig {
        &self.cfg
    }

    /// Curve of the active day type.
    pub fn curve(&self) -> &TargetCurve {
        if self.cfg.alternative_day {
            &self.alternate
        } else {
            &self.normal
        }
    }

    pub fn exploration_limit(&self) -> Duration {
        self.exploration_limit
    }

    pub fn last_evaluated(&self) -> Option<Co2Decision> {
        self.last_evaluated
    }

    pub fn last_emitted(&self) -> Option<Co2Decision> {
        self.throttle.last_emitted().copied()
    }

    /// Valve feedback from the device. An opening starts the open timer,
    /// draws a fresh exploration limit and forgets old predictions. Unknown
    /// state (stale telemetry) keeps the running opening; only a reported
    /// close ends it.
    pub fn on_valve_state(&mut self, open: Option<bool>, now: Instant) {
        let was_open = self.known_open;
        match open {
            Some(true) if !was_open => {
                self.opened_at = Some(now);
                let lo = self.cfg.min_exploration.as_secs_f64();
                let hi = self.cfg.max_open.as_secs_f64();
                self.exploration_limit = Duration::from_secs_f64(self.rng.uniform(lo, hi));
                self.prediction = None;
                self.previous_prediction = None;
                tracing::info!(
                    exploration_s = self.exploration_limit.as_secs_f64(),
                    "co2 valve opened"
                );
            }
            Some(false) if was_open => {
                self.opened_at = None;
                tracing::info!("co2 valve closed");
            }
            _ => {}
        }
        if let Some(open) = open {
            self.known_open = open;
        }
        self.valve_open = open;
    }

    /// Fresh trough prediction while the valve is open.
    pub fn on_prediction(&mut self, predicted_min_ph: f64) {
        self.previous_prediction = self.prediction;
        self.prediction = Some(predicted_min_ph);
    }

    pub fn open_for(&self, now: Instant) -> Option<Duration> {
        self.opened_at.map(|t| now.saturating_duration_since(t))
    }

    /// Evaluate and pass the decision through the throttle.
    pub fn evaluate(
        &mut self,
        now: Instant,
        hour: f64,
        ph600: Option<f64>,
        ph60: Option<f64>,
    ) -> Option<Co2Decision> {
        let inputs = DecisionInputs {
            ph600,
            ph60,
            valve_open: self.valve_open,
            hour,
            open_for: self.open_for(now),
            prediction: self.prediction.map(|p| PredictionInput {
                predicted_min_ph: p,
                previous_min_ph: self.previous_prediction,
            }),
        };
        let decision = decide(&self.cfg, self.curve(), &inputs, self.exploration_limit);
        if self.last_evaluated != Some(decision) {
            tracing::info!(
                required = decision.required,
                reason = %decision.reason,
                ph600,
                ph60,
                hour,
                "co2 decision"
            );
        }
        self.last_evaluated = Some(decision);
        self.throttle.offer(decision, now, self.rng.as_mut())
    }

    /// Release a held state flip once its delay expired.
    pub fn poll(&mut self, now: Instant) -> Option<Co2Decision> {
        self.throttle.poll(now)
    }

    pub fn ph_control_range(&self, hour: f64) -> Option<PhControlRange> {
        self.curve()
            .target_min_ph(hour)
            .map(|target| PhControlRange {
                ph_to_turn_off: target,
                ph_to_turn_on: target + self.cfg.ph_turn_on_off_margin,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_for_logs() {
        assert_eq!(
            DecisionReason::Ph600BelowSafeMinimum.to_string(),
            "ph600 at or below safe minimum"
        );
    }

    #[test]
    fn control_range_follows_the_curve() {
        let ctl = Co2Controller::new(
            PhControllerConfig::default(),
            Box::new(aqua_traits::SequenceRandom::constant(0.5)),
        );
        let r = ctl.ph_control_range(10.0).unwrap();
        assert!((r.ph_to_turn_off - 6.8).abs() < 1e-9);
        assert!((r.ph_to_turn_on - 6.9).abs() < 1e-9);
        assert_eq!(ctl.ph_control_range(23.0), None);
    }
}
