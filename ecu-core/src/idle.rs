//! Idle speed control.
//!
//! The target throttle opening follows a coolant temperature slope, raised
//! by a post-start idle throttle (PSIT) that decays to zero after the engine
//! starts. The actuator then chases the target according to its type.

use libm::fabsf;

use crate::config::Parameters1;
use crate::fuel::limit;

/// Integral gain of the type 2 actuator, relative to the overall gain.
const TYPE2_KI: f32 = 0.15;
/// Derivative gain of the type 2 actuator, relative to the overall gain.
const TYPE2_KD: f32 = 0.9;
/// Cycles the idle switch must be closed before the loop acts.
const TYPE2_SETTLE_CYCLES: u32 = 8;
/// Demands below this are treated as zero.
const TYPE2_DEADBAND: f32 = 5.0;

/// Fitted idle actuator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdleActuatorKind {
    /// No actuator; output always zero.
    None,
    /// Motor-driven throttle stop on a PWM channel, with an idle switch.
    PwmMotor,
}

impl IdleActuatorKind {
    #[must_use]
    pub const fn from_config(value: i32) -> Self {
        match value {
            2 => IdleActuatorKind::PwmMotor,
            _ => IdleActuatorKind::None,
        }
    }
}

/// Idle loop state, rebuilt on a full reset.
#[derive(Clone, Debug)]
pub struct IdleController {
    kind: IdleActuatorKind,
    gradient: f32,
    offset: f32,
    psit: f32,
    psit_step: f32,
    target_adjust: f32,
    error_sum: f32,
    error_prev: f32,
    settle: u32,
    demand: f32,
}

impl IdleController {
    /// `period_ms` is the interval between [`Self::target_tps`] calls.
    #[must_use]
    pub fn new(p1: &Parameters1, actuator_type: i32, period_ms: f32) -> Self {
        let gradient = (p1.tps_fast_idle_value - p1.tps_normal_idle_value)
            / (p1.tps_fast_idle_temp - p1.tps_normal_idle_temp);
        Self {
            kind: IdleActuatorKind::from_config(actuator_type),
            gradient,
            offset: p1.tps_normal_idle_value - gradient * p1.tps_normal_idle_temp,
            psit: p1.psit_start_value,
            psit_step: p1.psit_start_value * period_ms / (1000.0 * p1.psit_decay_time),
            target_adjust: 0.0,
            error_sum: 0.0,
            error_prev: 0.0,
            settle: 0,
            demand: 0.0,
        }
    }

    /// Host-requested offset added to the temperature-derived target.
    pub fn set_target_adjust(&mut self, adjust: f32) {
        self.target_adjust = adjust;
    }

    #[must_use]
    pub const fn target_adjust(&self) -> f32 {
        self.target_adjust
    }

    #[must_use]
    pub const fn kind(&self) -> IdleActuatorKind {
        self.kind
    }

    /// Target throttle opening, percent. Steps the PSIT decay.
    pub fn target_tps(&mut self, p1: &Parameters1, rpm: f32, engine_temp: f32) -> f32 {
        if rpm > p1.cranking_threshold {
            if self.psit > 0.0 {
                self.psit -= self.psit_step;
            }
        } else {
            self.psit = p1.psit_start_value;
        }
        let slope = limit(
            self.gradient * engine_temp + self.offset,
            p1.tps_normal_idle_value,
            p1.tps_fast_idle_value,
        ) + self.target_adjust;
        slope.max(self.psit)
    }

    /// Runs the actuator. Returns the duty cycle to apply, or `None` when the
    /// output should be left as it is.
    pub fn actuate(
        &mut self,
        p1: &Parameters1,
        tps: f32,
        target_tps: f32,
        idle_switch_on: bool,
    ) -> Option<f32> {
        match self.kind {
            IdleActuatorKind::None => {
                self.demand = 0.0;
                None
            }
            IdleActuatorKind::PwmMotor => {
                if !idle_switch_on {
                    self.settle = 0;
                    return None;
                }
                if self.settle < TYPE2_SETTLE_CYCLES {
                    self.settle += 1;
                    return None;
                }
                let pid = self.pid(p1.idle_actuator_gain, tps, target_tps);
                let mut demand = limit(pid, 0.0, 100.0);
                if fabsf(demand) < TYPE2_DEADBAND {
                    demand = 0.0;
                }
                self.demand = demand;
                Some(demand)
            }
        }
    }

    /// Last commanded actuator demand.
    #[must_use]
    pub const fn demand(&self) -> f32 {
        self.demand
    }

    #[must_use]
    pub const fn psit(&self) -> f32 {
        self.psit
    }

    fn pid(&mut self, gain: f32, tps: f32, target_tps: f32) -> f32 {
        let error = target_tps - tps;
        self.error_sum += error;
        let error_dot = error - self.error_prev;
        self.error_prev = error;
        gain * (error + TYPE2_KI * self.error_sum + TYPE2_KD * error_dot)
    }
}
