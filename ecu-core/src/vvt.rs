//! Variable valve timing: a straight PWM-vs-RPM line between two points.

use crate::config::Parameters1;
use crate::fuel::range;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VvtController {
    gradient: f32,
    offset: f32,
    pwm1: f32,
    pwm2: f32,
}

impl VvtController {
    #[must_use]
    pub fn new(p1: &Parameters1) -> Self {
        let gradient = (p1.vvt_pwm2 - p1.vvt_pwm1) / (p1.vvt_rpm2 - p1.vvt_rpm1);
        Self {
            gradient,
            offset: p1.vvt_pwm2 - gradient * p1.vvt_rpm2,
            pwm1: p1.vvt_pwm1,
            pwm2: p1.vvt_pwm2,
        }
    }

    /// Duty cycle, percent, held between the two configured points.
    #[must_use]
    pub fn duty(&self, rpm: f32) -> f32 {
        range(self.gradient * rpm + self.offset, self.pwm2, self.pwm1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;

    #[test]
    fn duty_ramps_between_points_and_holds_outside() {
        let vvt = VvtController::new(&defaults::PAGE.p1);
        assert!(vvt.duty(500.0).abs() < 1e-4);
        assert!((vvt.duty(2500.0) - 50.0).abs() < 1e-3);
        assert!((vvt.duty(6000.0) - 100.0).abs() < 1e-4);
    }

    #[test]
    fn falling_slope_is_also_clamped() {
        let mut p1 = defaults::PAGE.p1;
        p1.vvt_pwm1 = 80.0;
        p1.vvt_pwm2 = 20.0;
        let vvt = VvtController::new(&p1);
        assert!((vvt.duty(0.0) - 80.0).abs() < 1e-4);
        assert!((vvt.duty(9000.0) - 20.0).abs() < 1e-4);
    }
}
