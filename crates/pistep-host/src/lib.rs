//! Library surface of the host process: configuration, G-code parsing,
//! machine assembly and the command dispatch loop. The `pistep` binary is a
//! thin CLI wrapper around these.

pub mod config;
pub mod gcode;
pub mod machine;
pub mod state;
