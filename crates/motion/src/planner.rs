//! The motion planner: one move at a time, merged into an event stream.
//!
//! `move_to`/`home_endstops` load one iterator per mechanical axis, then
//! repeated `next_step()` calls merge the iterators into a stream of
//! [`OutputEvent`]s with non-decreasing absolute times. The planner is the
//! sole mutator of the mechanical position; everyone else reads a snapshot.

use sched::{EventTime, Level, OutputEvent, PinId};
use tracing::{debug, trace};

use crate::error::PlannerError;
use crate::kinematics::CoordMap;
use crate::profile::AccelProfile;
use crate::stepper::{AxisStepper, Endstop, StepDirection};
use crate::{MechPosition, Xyze, AXIS_COUNT, EXTRUDER_AXIS};

/// How one axis's steps appear on the wire: a single step pin whose written
/// level encodes the direction (high = forward unless inverted).
#[derive(Debug, Copy, Clone)]
pub struct AxisPinMap {
    pub step_pin: PinId,
    pub inverted: bool,
}

impl AxisPinMap {
    pub fn new(step_pin: PinId) -> Self {
        Self {
            step_pin,
            inverted: false,
        }
    }

    fn level_for(&self, direction: StepDirection) -> Level {
        if (direction == StepDirection::Forward) != self.inverted {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum MotionType {
    Idle,
    Move,
    Home,
}

/// Below this distance (mm) a requested move is treated as zero-length.
const MIN_MOVE_DISTANCE: f64 = 1e-9;

/// Relative slack applied when testing a step time against the move duration,
/// absorbing the ulp-level error in the final step of a move.
const DURATION_SLACK: f64 = 1.0 + 1e-9;

/// Plans one move at a time and merges its axis iterators into a
/// time-ordered event stream.
pub struct MotionPlanner<E: Endstop> {
    coord_map: CoordMap,
    pins: [AxisPinMap; AXIS_COUNT],
    endstops: [Option<E>; AXIS_COUNT],
    accel: AccelProfile,
    position: MechPosition,
    steppers: [AxisStepper; AXIS_COUNT],
    base_time: EventTime,
    duration: f64,
    motion: MotionType,
}

impl<E: Endstop> MotionPlanner<E> {
    pub fn new(
        coord_map: CoordMap,
        pins: [AxisPinMap; AXIS_COUNT],
        endstops: [Option<E>; AXIS_COUNT],
        accel: AccelProfile,
    ) -> Self {
        Self {
            coord_map,
            pins,
            endstops,
            accel,
            position: [0; AXIS_COUNT],
            steppers: [
                AxisStepper::inert(0),
                AxisStepper::inert(1),
                AxisStepper::inert(2),
                AxisStepper::inert(3),
            ],
            base_time: EventTime::default(),
            duration: f64::NAN,
            motion: MotionType::Idle,
        }
    }

    /// True iff the current plan is exhausted and a new move may be loaded.
    pub fn ready_for_next_move(&self) -> bool {
        self.motion == MotionType::Idle
    }

    /// Snapshot of the mechanical position.
    pub fn mechanical_position(&self) -> MechPosition {
        self.position
    }

    /// Current Cartesian position via forward kinematics.
    pub fn position(&self) -> Xyze {
        self.coord_map.xyze_from_mechanical(&self.position)
    }

    pub fn coord_map(&self) -> &CoordMap {
        &self.coord_map
    }

    /// Overwrite the logical position without moving (G92). Only valid
    /// between moves.
    pub fn set_position(&mut self, pos: Xyze) -> Result<(), PlannerError> {
        if self.motion != MotionType::Idle {
            return Err(PlannerError::Busy);
        }
        self.position = self.coord_map.mechanical_from_xyze(&pos);
        Ok(())
    }

    /// Plan a linear move to `target` (already bounded by the caller).
    ///
    /// The Cartesian velocity is `max_vel_xyz`; if the extrusion velocity
    /// that implies falls outside `[min_vel_e, max_vel_e]` in magnitude, the
    /// whole move's duration is rescaled until it is in range.
    pub fn move_to(
        &mut self,
        base_time: EventTime,
        target: Xyze,
        max_vel_xyz: f64,
        min_vel_e: f64,
        max_vel_e: f64,
    ) -> Result<(), PlannerError> {
        if self.motion != MotionType::Idle {
            return Err(PlannerError::Busy);
        }
        for v in [max_vel_xyz, min_vel_e, max_vel_e] {
            if !v.is_finite() || v <= 0.0 {
                return Err(PlannerError::BadVelocity(v));
            }
        }

        let current = self.coord_map.xyze_from_mechanical(&self.position);
        let target = self.coord_map.apply_leveling(target);
        let dist = current.xyz_distance(&target);
        let delta_e = target.e - current.e;
        if dist < MIN_MOVE_DISTANCE && delta_e.abs() < MIN_MOVE_DISTANCE {
            trace!("zero-length move ignored");
            return Ok(());
        }

        let mut vmax = max_vel_xyz;
        let mut duration = dist / vmax;
        let mut vel_e = if duration > 0.0 {
            delta_e / duration
        } else {
            f64::INFINITY * delta_e.signum()
        };
        if delta_e.abs() >= MIN_MOVE_DISTANCE {
            let clamped = vel_e.abs().clamp(min_vel_e, max_vel_e) * delta_e.signum();
            if clamped != vel_e {
                // Extrusion rate out of range: stretch (or shrink) the whole
                // move so the extruder runs at the clamped rate.
                vel_e = clamped;
                duration = delta_e / vel_e;
                vmax = dist / duration;
            }
        } else {
            vel_e = 0.0;
        }

        let (vx, vy, vz) = (
            (target.x - current.x) / duration,
            (target.y - current.y) / duration,
            (target.z - current.z) / duration,
        );
        debug!(
            ?current,
            ?target,
            duration,
            vx,
            vy,
            vz,
            vel_e,
            "planning move"
        );

        match &self.coord_map {
            CoordMap::Cartesian { params, .. } => {
                let velocities = [vx, vy, vz, vel_e];
                for axis in 0..AXIS_COUNT {
                    self.steppers[axis] =
                        AxisStepper::linear(axis, velocities[axis], params.steps_per_mm[axis]);
                }
            }
            CoordMap::LinearDelta { params, .. } => {
                for axis in 0..EXTRUDER_AXIS {
                    self.steppers[axis] = AxisStepper::delta(
                        axis,
                        &self.coord_map,
                        &current,
                        &self.position,
                        vx,
                        vy,
                        vz,
                    );
                }
                self.steppers[EXTRUDER_AXIS] =
                    AxisStepper::linear(EXTRUDER_AXIS, vel_e, params.steps_per_mm_e);
            }
        }

        self.base_time = base_time;
        self.duration = duration;
        self.motion = MotionType::Move;
        self.accel.begin(duration, vmax);
        Ok(())
    }

    /// Plan a homing move: every axis with an endstop steps forward at
    /// `v_home` until its endstop trips. Infinite nominal duration.
    pub fn home_endstops(&mut self, base_time: EventTime, v_home: f64) -> Result<(), PlannerError> {
        if self.motion != MotionType::Idle {
            return Err(PlannerError::Busy);
        }
        if !v_home.is_finite() || v_home <= 0.0 {
            return Err(PlannerError::BadVelocity(v_home));
        }
        for axis in 0..AXIS_COUNT {
            let state = self.endstops[axis].as_ref().map(|e| e.is_triggered());
            self.steppers[axis] =
                AxisStepper::homing(axis, v_home, self.coord_map.steps_per_mm(axis), state);
        }
        debug!(v_home, "planning homing move");
        self.base_time = base_time;
        self.duration = f64::INFINITY;
        self.motion = MotionType::Home;
        self.accel.begin(f64::INFINITY, v_home);
        Ok(())
    }

    /// Produce the next step event of the current plan, or `None` when the
    /// plan is exhausted (after which `ready_for_next_move()` is true).
    ///
    /// Selection: the iterator with the smallest positive pending time wins;
    /// on an exact tie the lowest axis index does. An iterator proposes one
    /// direction at a time, so index order fully fixes the tie-break.
    pub fn next_step(&mut self) -> Option<OutputEvent> {
        if self.motion == MotionType::Idle {
            return None;
        }

        let mut selected: Option<usize> = None;
        for (axis, stepper) in self.steppers.iter().enumerate() {
            let t = stepper.time();
            // NaN and non-positive times are both terminal; comparisons with
            // NaN are false, so `t > 0.0` filters both.
            if !(t > 0.0) {
                continue;
            }
            if selected.map_or(true, |best| t < self.steppers[best].time()) {
                selected = Some(axis);
            }
        }

        let axis = match selected {
            Some(axis) if self.steppers[axis].time() <= self.duration * DURATION_SLACK => axis,
            _ => {
                if self.motion == MotionType::Home {
                    self.position = self.coord_map.home_position(&self.position);
                }
                debug!(position = ?self.position, "move complete");
                self.motion = MotionType::Idle;
                return None;
            }
        };

        let direction = self.steppers[axis].direction();
        let transformed = self.accel.transform(self.steppers[axis].time());
        let event = OutputEvent::new(
            self.pins[axis].step_pin,
            self.pins[axis].level_for(direction),
            self.base_time.offset_secs(transformed),
        );
        self.position[axis] += direction.signed();

        let triggered = if self.motion == MotionType::Home {
            self.endstops[axis]
                .as_ref()
                .map(|e| e.is_triggered())
                .unwrap_or(false)
        } else {
            false
        };
        self.steppers[axis].advance(triggered);
        Some(event)
    }
}
