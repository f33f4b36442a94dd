//! Error types for the motion planning crate.

use thiserror::Error;

/// Errors surfaced by [`crate::planner::MotionPlanner`].
#[derive(Debug, Error, PartialEq, Clone, Copy)]
pub enum PlannerError {
    /// A move was requested before the previous one was exhausted. The caller
    /// should drain `next_step()` and retry.
    #[error("previous move is not exhausted yet")]
    Busy,

    /// A velocity constraint was zero, negative or non-finite.
    #[error("velocity {0} must be positive and finite")]
    BadVelocity(f64),
}
