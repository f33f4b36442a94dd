//! # Motion Control Crate
//!
//! Turns requested Cartesian moves into a time-ordered stream of per-axis
//! step events:
//!
//! - [`kinematics::CoordMap`]: maps between Cartesian `(x, y, z, e)` and the
//!   machine's mechanical step counts (Cartesian or linear-delta geometry).
//! - [`stepper::AxisStepper`]: for one mechanical axis, yields the strictly
//!   increasing relative times at which that axis fires its next pulse.
//! - [`profile::AccelProfile`]: remaps pulse times so the move obeys an
//!   acceleration bound.
//! - [`planner::MotionPlanner`]: drives all axis iterators in lock-step and
//!   merges them into [`sched::OutputEvent`]s.
//!
//! The planner plans one move at a time; chaining is the caller's job.

pub mod error;
pub mod kinematics;
pub mod planner;
pub mod profile;
pub mod stepper;

pub use error::PlannerError;
pub use kinematics::{CartesianParams, CoordMap, DeltaParams, Matrix3};
pub use planner::{AxisPinMap, MotionPlanner};
pub use profile::AccelProfile;
pub use stepper::{AxisStepper, Endstop, StepDirection};

/// Number of mechanical axes: three motion actuators plus the extruder.
pub const AXIS_COUNT: usize = 4;

/// Index of the extruder within the mechanical axis array.
pub const EXTRUDER_AXIS: usize = 3;

/// Integer step counts, one per mechanical actuator. For a Cartesian machine
/// these are the X/Y/Z/E motors; for a linear-delta they are the A/B/C
/// carriages plus E.
pub type MechPosition = [i32; AXIS_COUNT];

/// A point in Cartesian space (mm), plus cumulative extruded length (mm).
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Xyze {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Xyze {
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }

    /// Euclidean distance to `other`, ignoring the extruder component.
    pub fn xyz_distance(&self, other: &Xyze) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}
