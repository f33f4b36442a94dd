//! Per-axis step-time iterators.
//!
//! One [`AxisStepper`] is active per mechanical axis per move. It answers a
//! single question, repeatedly: at what relative time (seconds from the start
//! of the move) does this axis's step count next change, and in which
//! direction? Times from one iterator are strictly increasing; times across
//! iterators race and are merged by the planner.
//!
//! A NaN time is the termination sentinel: this axis does not step again
//! during the current move.

use crate::kinematics::{CoordMap, TOWER_OFFSETS};
use crate::{MechPosition, Xyze, EXTRUDER_AXIS};

/// Direction of a single step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepDirection {
    Backward,
    Forward,
}

impl StepDirection {
    pub fn from_sign(value: f64) -> Self {
        if value < 0.0 {
            StepDirection::Backward
        } else {
            StepDirection::Forward
        }
    }

    pub fn signed(self) -> i32 {
        match self {
            StepDirection::Backward => -1,
            StepDirection::Forward => 1,
        }
    }
}

/// A queryable limit switch. Homing moves step until it reads triggered.
pub trait Endstop {
    fn is_triggered(&self) -> bool;
}

/// Velocities below this (mm/s, squared where noted) are treated as "axis
/// does not move": the delta quadratic degenerates and the linear period
/// overflows.
const MIN_VELOCITY_SQ: f64 = 1e-12;

#[derive(Debug, Clone)]
enum Kind {
    /// Axis does not step during this move.
    Inert,
    /// Constant step rate (Cartesian axis or extruder). Times are computed
    /// as `count * period` rather than accumulated, so they do not drift
    /// over million-step moves.
    Linear { time_per_step: f64, count: u64 },
    /// Delta carriage following the sphere-intersection constraint.
    Delta(DeltaSolver),
    /// Constant rate until the endstop trips.
    Homing { time_per_step: f64, count: u64 },
}

/// Step-time iterator for one mechanical axis.
#[derive(Debug, Clone)]
pub struct AxisStepper {
    axis: usize,
    time: f64,
    direction: StepDirection,
    kind: Kind,
}

impl AxisStepper {
    /// An axis that never steps.
    pub fn inert(axis: usize) -> Self {
        Self {
            axis,
            time: f64::NAN,
            direction: StepDirection::Forward,
            kind: Kind::Inert,
        }
    }

    /// Constant-rate iterator for a Cartesian axis or the extruder.
    /// `velocity` is signed mm/s along the axis.
    pub fn linear(axis: usize, velocity: f64, steps_per_mm: f64) -> Self {
        if velocity * velocity < MIN_VELOCITY_SQ || !velocity.is_finite() {
            return Self::inert(axis);
        }
        let time_per_step = 1.0 / (velocity.abs() * steps_per_mm);
        Self {
            axis,
            time: time_per_step,
            direction: StepDirection::from_sign(velocity),
            kind: Kind::Linear {
                time_per_step,
                count: 1,
            },
        }
    }

    /// Quadratic-solving iterator for one delta carriage.
    ///
    /// `start` is the Cartesian position at move start, `mech` the mechanical
    /// position snapshot, `(vx, vy, vz)` the Cartesian velocity.
    pub fn delta(
        axis: usize,
        map: &CoordMap,
        start: &Xyze,
        mech: &MechPosition,
        vx: f64,
        vy: f64,
        vz: f64,
    ) -> Self {
        debug_assert!(axis < EXTRUDER_AXIS, "delta solving applies to carriages only");
        let v2 = vx * vx + vy * vy + vz * vz;
        if v2 < MIN_VELOCITY_SQ {
            return Self::inert(axis);
        }
        let (rod_length, steps_per_mm, radius) = match map {
            CoordMap::LinearDelta { params, .. } => {
                (params.rod_length, params.steps_per_mm, params.radius)
            }
            CoordMap::Cartesian { .. } => unreachable!("delta stepper on cartesian map"),
        };
        let (sin_w, cos_w) = TOWER_OFFSETS[axis];
        let solver = DeltaSolver::new(
            radius * sin_w,
            radius * cos_w,
            rod_length,
            mech[axis] as f64 / steps_per_mm,
            1.0 / steps_per_mm,
            start,
            vx,
            vy,
            vz,
        );
        let mut stepper = Self {
            axis,
            time: 0.0,
            direction: StepDirection::Forward,
            kind: Kind::Delta(solver),
        };
        stepper.advance(false);
        stepper
    }

    /// Homing iterator: constant forward rate, terminated by the endstop.
    ///
    /// `endstop_state` is the endstop reading at move start; `None` means the
    /// axis has no endstop. Axes without an endstop, or already sitting on
    /// their endstop, terminate immediately.
    pub fn homing(axis: usize, v_home: f64, steps_per_mm: f64, endstop_state: Option<bool>) -> Self {
        match endstop_state {
            Some(false) if v_home > 0.0 => {
                let time_per_step = 1.0 / (v_home * steps_per_mm);
                Self {
                    axis,
                    time: time_per_step,
                    direction: StepDirection::Forward,
                    kind: Kind::Homing {
                        time_per_step,
                        count: 1,
                    },
                }
            }
            _ => Self::inert(axis),
        }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Relative time of the pending step; NaN once exhausted.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn direction(&self) -> StepDirection {
        self.direction
    }

    pub fn is_exhausted(&self) -> bool {
        self.time.is_nan()
    }

    /// Consume the pending step and compute the next one.
    ///
    /// `endstop_triggered` is only consulted by homing iterators; it reflects
    /// the endstop state at the moment the pending step was emitted.
    pub fn advance(&mut self, endstop_triggered: bool) {
        match &mut self.kind {
            Kind::Inert => self.time = f64::NAN,
            Kind::Linear {
                time_per_step,
                count,
            } => {
                *count += 1;
                self.time = *count as f64 * *time_per_step;
            }
            Kind::Homing {
                time_per_step,
                count,
            } => {
                if endstop_triggered {
                    self.time = f64::NAN;
                } else {
                    *count += 1;
                    self.time = *count as f64 * *time_per_step;
                }
            }
            Kind::Delta(solver) => {
                let (time, direction) = solver.next_step(self.time);
                self.time = time;
                if let Some(direction) = direction {
                    self.direction = direction;
                }
            }
        }
    }
}

/// Precomputed quadratic coefficients for one delta carriage's step times.
///
/// With `x(t) = x0 + vx t` (similarly y, z), solving the sphere constraint
/// for the instant the carriage height reaches `m0 + s` reduces to
/// `t = term1(s) ± sqrt(root(s))` where everything constant in `s` is cached
/// here. `term1` is `-b/2a` and `root` is the discriminant over `4a²` of the
/// underlying `a t² + b t + c = 0`.
#[derive(Debug, Clone)]
struct DeltaSolver {
    s_total: i64,
    mm_per_step: f64,
    inv_v2: f64,
    vz_over_v2: f64,
    almost_term1: f64,
    almost_root: f64,
    root_v2s: f64,
}

impl DeltaSolver {
    #[allow(clippy::too_many_arguments)]
    fn new(
        tower_x: f64,
        tower_y: f64,
        rod_length: f64,
        m0: f64,
        mm_per_step: f64,
        start: &Xyze,
        vx: f64,
        vy: f64,
        vz: f64,
    ) -> Self {
        let inv_v2 = 1.0 / (vx * vx + vy * vy + vz * vz);
        let dx = start.x - tower_x;
        let dy = start.y - tower_y;
        let dz = m0 - start.z;
        Self {
            s_total: 0,
            mm_per_step,
            inv_v2,
            vz_over_v2: vz * inv_v2,
            almost_term1: inv_v2 * (-vx * dx - vy * dy + vz * dz),
            almost_root: -inv_v2 * (dx * dx + dy * dy + dz * dz - rod_length * rod_length),
            root_v2s: 2.0 * dz,
        }
    }

    /// Earliest time strictly after `after` at which the carriage height
    /// crosses `m0 + s` (s in mm). NaN if it never does.
    fn crossing(&self, s: f64, after: f64) -> f64 {
        let term1 = self.almost_term1 + self.vz_over_v2 * s;
        let root_param = term1 * term1 + self.almost_root - self.inv_v2 * s * (self.root_v2s + s);
        if root_param < 0.0 {
            return f64::NAN;
        }
        let root = root_param.sqrt();
        let t1 = term1 - root;
        let t2 = term1 + root;
        if root > term1 {
            // t1 is negative; only the later root can be in our future.
            if t2 > after {
                t2
            } else {
                f64::NAN
            }
        } else if t1 > after {
            t1
        } else if t2 > after {
            t2
        } else {
            f64::NAN
        }
    }

    /// Pick the sooner of the forward and backward crossings. A carriage can
    /// reverse mid-move, so both directions are real candidates; earliest
    /// time wins.
    fn next_step(&mut self, after: f64) -> (f64, Option<StepDirection>) {
        let backward = self.crossing((self.s_total - 1) as f64 * self.mm_per_step, after);
        let forward = self.crossing((self.s_total + 1) as f64 * self.mm_per_step, after);
        let take_forward = if backward.is_nan() || backward < after {
            true
        } else if forward.is_nan() || forward < after {
            false
        } else {
            forward <= backward
        };
        if take_forward {
            if forward > after {
                self.s_total += 1;
                (forward, Some(StepDirection::Forward))
            } else {
                (f64::NAN, None)
            }
        } else if backward > after {
            self.s_total -= 1;
            (backward, Some(StepDirection::Backward))
        } else {
            (f64::NAN, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::DeltaParams;

    fn delta_map() -> CoordMap {
        CoordMap::linear_delta(DeltaParams {
            radius: 100.0,
            rod_length: 200.0,
            home_height: 250.0,
            build_radius: 85.0,
            steps_per_mm: 100.0,
            steps_per_mm_e: 500.0,
            min_z: -2.0,
        })
    }

    #[test]
    fn linear_steps_at_uniform_rate() {
        let mut stepper = AxisStepper::linear(0, 10.0, 100.0);
        // 10 mm/s * 100 steps/mm = 1000 steps/s.
        let mut expected = 0.001;
        for _ in 0..5 {
            assert!((stepper.time() - expected).abs() < 1e-12);
            assert_eq!(stepper.direction(), StepDirection::Forward);
            stepper.advance(false);
            expected += 0.001;
        }
    }

    #[test]
    fn linear_negative_velocity_steps_backward() {
        let stepper = AxisStepper::linear(1, -4.0, 50.0);
        assert_eq!(stepper.direction(), StepDirection::Backward);
        assert!((stepper.time() - 1.0 / 200.0).abs() < 1e-12);
    }

    #[test]
    fn zero_velocity_axis_is_inert() {
        let stepper = AxisStepper::linear(2, 0.0, 100.0);
        assert!(stepper.is_exhausted());
    }

    #[test]
    fn homing_without_endstop_terminates_immediately() {
        let stepper = AxisStepper::homing(0, 1.0, 100.0, None);
        assert!(stepper.is_exhausted());
    }

    #[test]
    fn homing_on_already_triggered_endstop_emits_nothing() {
        let stepper = AxisStepper::homing(0, 1.0, 100.0, Some(true));
        assert!(stepper.is_exhausted());
    }

    #[test]
    fn homing_stops_when_endstop_trips() {
        let mut stepper = AxisStepper::homing(0, 1.0, 100.0, Some(false));
        let mut steps = 0;
        while !stepper.is_exhausted() {
            steps += 1;
            stepper.advance(steps == 5);
        }
        assert_eq!(steps, 5);
    }

    #[test]
    fn delta_times_are_strictly_increasing() {
        let map = delta_map();
        let start = Xyze::new(30.0, 10.0, 50.0, 0.0);
        let mech = map.mechanical_from_xyze(&start);
        // Move with an x/y component so carriage rates vary along the path.
        let mut stepper = AxisStepper::delta(0, &map, &start, &mech, -20.0, 12.0, 4.0);
        let mut last = 0.0;
        for _ in 0..500 {
            let t = stepper.time();
            if t.is_nan() {
                break;
            }
            assert!(t > last, "step time {t} did not advance past {last}");
            last = t;
            stepper.advance(false);
        }
        assert!(last > 0.0);
    }

    #[test]
    fn delta_carriage_tracks_sphere_constraint() {
        let map = delta_map();
        let start = Xyze::new(30.0, 10.0, 50.0, 0.0);
        let mech = map.mechanical_from_xyze(&start);
        let (vx, vy, vz) = (-25.0, 15.0, 5.0);
        let mut stepper = AxisStepper::delta(1, &map, &start, &mech, vx, vy, vz);
        let mut offset = 0i32;
        for _ in 0..200 {
            let t = stepper.time();
            if t.is_nan() {
                break;
            }
            offset += stepper.direction().signed();
            // Recompute the exact carriage height at the step time and check
            // it matches the accumulated step count.
            let pos = Xyze::new(start.x + vx * t, start.y + vy * t, start.z + vz * t, 0.0);
            let exact = map.mechanical_from_xyze(&pos);
            assert!(
                (exact[1] - (mech[1] + offset)).abs() <= 1,
                "carriage drifted: exact {} vs stepped {}",
                exact[1],
                mech[1] + offset
            );
            stepper.advance(false);
        }
        assert!(offset != 0);
    }
}
