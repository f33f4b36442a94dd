//! # Thermal Control Crate
//!
//! Everything between a bare GPIO pin and a held hotend temperature:
//!
//! - [`rc_thermistor::RcThermistor`]: temperature sensing with no ADC; time
//!   a capacitor's discharge through the thermistor and invert the RC curve.
//! - [`filter::LowPassFilter`]: smooths the noisy discharge-time readings.
//! - [`pid::Pid`]: windup-clamped PID from filtered temperature to duty.
//! - [`control::TempControl`]: the read/regulate state machine tying the
//!   pieces together, producing heater PWM duty updates.

pub mod control;
pub mod filter;
pub mod pid;
pub mod rc_thermistor;

pub use control::{SensePin, TempControl, TempUpdate};
pub use filter::LowPassFilter;
pub use pid::{Pid, PidGains};
pub use rc_thermistor::{RcThermistor, RcThermistorParams};

/// Absolute zero offset for Celsius/Kelvin conversion.
pub const KELVIN_OFFSET: f64 = 273.15;
