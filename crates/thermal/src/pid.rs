//! A PID (Proportional-Integral-Derivative) controller.

use num_traits::Float;

/// The three controller gains.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PidGains<F: Float> {
    pub kp: F,
    pub ki: F,
    pub kd: F,
}

/// A PID controller with output limits and integral windup clamping.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pid<F: Float> {
    gains: PidGains<F>,
    /// The target value for the controlled process.
    pub setpoint: F,
    output_min: F,
    output_max: F,
    integral: F,
    previous_error: Option<F>,
}

impl<F: Float> Pid<F> {
    pub fn new(gains: PidGains<F>, output_min: F, output_max: F) -> Self {
        Self {
            gains,
            setpoint: F::zero(),
            output_min,
            output_max,
            integral: F::zero(),
            previous_error: None,
        }
    }

    /// Feed a measurement taken `dt` seconds after the previous one and get
    /// the actuator output, clamped to the configured limits.
    pub fn update(&mut self, measured: F, dt: F) -> F {
        let error = self.setpoint - measured;

        let p = self.gains.kp * error;

        // Integrate, clamping so a long heat-up cannot wind the term past
        // what the output limit can ever express.
        self.integral = self.integral + error * dt;
        if self.gains.ki > F::zero() {
            let limit = self.output_max / self.gains.ki;
            self.integral = self.integral.max(-limit).min(limit);
        }
        let i = self.gains.ki * self.integral;

        // No derivative kick on the very first sample.
        let d = match self.previous_error {
            Some(previous) if dt > F::zero() => self.gains.kd * (error - previous) / dt,
            _ => F::zero(),
        };
        self.previous_error = Some(error);

        (p + i + d).max(self.output_min).min(self.output_max)
    }

    /// Forget accumulated state (e.g. when the target changes drastically).
    pub fn reset(&mut self) {
        self.integral = F::zero();
        self.previous_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Pid<f64> {
        Pid::new(
            PidGains {
                kp: 0.05,
                ki: 0.005,
                kd: 0.01,
            },
            0.0,
            1.0,
        )
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = controller();
        pid.setpoint = 1000.0;
        assert_eq!(pid.update(0.0, 1.0), 1.0);
        pid.setpoint = -1000.0;
        assert_eq!(pid.update(0.0, 1.0), 0.0);
    }

    #[test]
    fn integral_does_not_wind_up() {
        let mut pid = controller();
        pid.setpoint = 200.0;
        // A long stretch far below target.
        for _ in 0..10_000 {
            pid.update(20.0, 1.0);
        }
        // Once at target, the wound integral must not hold the output at
        // maximum forever; a modest overshoot drives it back down.
        let output = pid.update(215.0, 1.0);
        assert!(output < 1.0);
    }

    #[test]
    fn converges_on_a_simple_plant() {
        let mut pid = Pid::new(
            PidGains {
                kp: 0.08,
                ki: 0.01,
                kd: 0.02,
            },
            0.0,
            1.0,
        );
        pid.setpoint = 200.0;
        // Toy hotend: duty heats, losses pull toward ambient.
        let mut temp: f64 = 20.0;
        for _ in 0..3_000 {
            let duty = pid.update(temp, 1.0);
            temp += duty * 2.0 - (temp - 20.0) * 0.008;
        }
        assert!(
            (temp - 200.0).abs() < 5.0,
            "plant settled at {temp} instead of 200"
        );
    }
}
