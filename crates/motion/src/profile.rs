//! Acceleration profiles.
//!
//! Axis iterators plan every move at a constant Cartesian velocity `vmax`; a
//! profile then remaps each pulse's time so the realized velocity ramps up to
//! `vmax` and back down without ever exceeding it. The remap must be
//! monotone, with `transform(0) = 0`.

/// A move's acceleration shaping. Loaded with the move's duration and peak
/// velocity by [`begin`](AccelProfile::begin), then applied per pulse.
#[derive(Debug, Clone)]
pub enum AccelProfile {
    /// Identity: pulses fire at their constant-velocity times.
    None,
    /// Constant-acceleration ramps at each end of the move.
    Constant(ConstantAcceleration),
}

impl AccelProfile {
    pub fn constant(accel: f64) -> Self {
        AccelProfile::Constant(ConstantAcceleration::new(accel))
    }

    /// Prepare for a move of `duration` seconds at peak velocity `vmax`.
    /// Homing moves pass `duration = f64::INFINITY`.
    pub fn begin(&mut self, duration: f64, vmax: f64) {
        match self {
            AccelProfile::None => {}
            AccelProfile::Constant(profile) => profile.begin(duration, vmax),
        }
    }

    /// Remap a pulse time from the constant-velocity timeline.
    pub fn transform(&self, time: f64) -> f64 {
        match self {
            AccelProfile::None => time,
            AccelProfile::Constant(profile) => profile.transform(time),
        }
    }
}

/// Constant-acceleration time remap.
///
/// For duration `D`, peak velocity `V` and acceleration `a`:
///
/// ```text
/// t < V/2a:       t' = sqrt(2V t / a)                 (accelerating)
/// t < D - V/2a:   t' = t + V/2a                        (cruise)
/// otherwise:      t' = D + V/a - sqrt(2V (D - t) / a)  (decelerating)
/// ```
///
/// With an infinite duration (homing) the cruise phase never ends. The two
/// ramps together stretch the move by exactly `V/a`.
#[derive(Debug, Clone)]
pub struct ConstantAcceleration {
    accel: f64,
    duration: f64,
    /// End of the accelerating ramp, clamped for moves too short to reach V.
    t_accel: f64,
    /// Start of the decelerating ramp; infinite while homing.
    t_decel: f64,
    /// `D + V/a`, the transformed end of the move.
    t_end: f64,
    twice_vmax_over_a: f64,
}

impl ConstantAcceleration {
    pub fn new(accel: f64) -> Self {
        Self {
            accel,
            duration: 0.0,
            t_accel: 0.0,
            t_decel: 0.0,
            t_end: 0.0,
            twice_vmax_over_a: 0.0,
        }
    }

    pub fn begin(&mut self, duration: f64, vmax: f64) {
        let half_ramp = vmax / (2.0 * self.accel);
        self.duration = duration;
        self.t_decel = if duration.is_finite() {
            duration - half_ramp
        } else {
            f64::INFINITY
        };
        // Short moves cannot fully accelerate before they must decelerate.
        self.t_accel = half_ramp.min(self.t_decel);
        self.t_end = duration + vmax / self.accel;
        self.twice_vmax_over_a = 2.0 * vmax / self.accel;
    }

    pub fn transform(&self, time: f64) -> f64 {
        if time < self.t_accel {
            (self.twice_vmax_over_a * time).sqrt()
        } else if time < self.t_decel {
            // The cruise offset equals the accel-ramp end for full-speed moves.
            time + self.t_accel
        } else {
            // The final step of a move can land an ulp past the duration;
            // clamp so the square root stays real.
            let remaining = (self.duration - time).max(0.0);
            self.t_end - (self.twice_vmax_over_a * remaining).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn none_is_identity() {
        let profile = AccelProfile::None;
        assert_eq!(profile.transform(0.42), 0.42);
    }

    #[test]
    fn transform_zero_is_zero() {
        let mut profile = AccelProfile::constant(100.0);
        profile.begin(1.0, 10.0);
        assert_eq!(profile.transform(0.0), 0.0);
    }

    #[test]
    fn full_move_endpoints_and_phases() {
        // 10 mm at 10 mm/s, a = 100 mm/s²: ramps are 0.05 s each side.
        let mut profile = AccelProfile::constant(100.0);
        profile.begin(1.0, 10.0);
        // Accel phase ends at V/2a = 0.05 mapped to V/a = 0.1.
        assert_approx_eq!(f64, profile.transform(0.05), 0.1, epsilon = 1e-9);
        // Cruise is a pure shift by V/2a.
        assert_approx_eq!(f64, profile.transform(0.5), 0.55, epsilon = 1e-9);
        // The ramps stretch the move by exactly V/a.
        assert_approx_eq!(f64, profile.transform(1.0), 1.1, epsilon = 1e-9);
    }

    #[test]
    fn transform_is_monotone() {
        let mut profile = AccelProfile::constant(100.0);
        profile.begin(0.1, 10.0);
        let mut last = 0.0;
        for i in 1..=100 {
            let t = profile.transform(i as f64 * 0.001);
            assert!(t > last, "transform not monotone at step {i}");
            last = t;
        }
    }

    #[test]
    fn infinite_duration_never_decelerates() {
        let mut profile = AccelProfile::constant(50.0);
        profile.begin(f64::INFINITY, 5.0);
        // Past the accel ramp everything is cruise, forever.
        let t1 = profile.transform(100.0);
        let t2 = profile.transform(1_000.0);
        assert_approx_eq!(f64, t2 - t1, 900.0, epsilon = 1e-6);
        assert!(t2.is_finite());
    }

    #[test]
    fn short_move_clamps_accel_ramp() {
        // 1 mm at vmax 10 mm/s with a = 100 mm/s² is a pure triangle:
        // the accel phase is cut off at D - V/2a = 0.05 s.
        let mut profile = AccelProfile::constant(100.0);
        profile.begin(0.1, 10.0);
        // Midpoint of the source timeline maps to the triangle's apex.
        assert_approx_eq!(f64, profile.transform(0.05), 0.1, epsilon = 1e-9);
        // Symmetric about the apex.
        for i in 1..50 {
            let dt = i as f64 * 0.001;
            let before = profile.transform(0.05 - dt);
            let after = profile.transform(0.05 + dt);
            assert_approx_eq!(f64, 0.1 - before, after - 0.1, epsilon = 1e-9);
        }
    }
}
