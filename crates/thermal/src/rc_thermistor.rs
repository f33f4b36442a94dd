//! ADC-less thermistor reading via capacitor discharge timing.
//!
//! The host SoC has no analog inputs. Instead: charge a capacitor through
//! the sense pin, release the pin to an input, and time how long the pin
//! keeps reading high while the capacitor discharges through the thermistor.
//! The discharge curve gives the thermistor's resistance, and the beta
//! equation gives the temperature.

use tracing::trace;

use crate::KELVIN_OFFSET;

/// Circuit and thermistor constants. The fixed resistor should be at least
/// a few hundred ohms to limit pin current, but not so large that hot (low)
/// thermistor resistances become unmeasurable.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RcThermistorParams {
    /// Fixed resistance between the pin and the capacitor, in ohms.
    pub fixed_resistance: f64,
    /// Capacitance, in farads.
    pub capacitance: f64,
    /// Supply voltage.
    pub supply_voltage: f64,
    /// Voltage at which the pin flips from reading high to low.
    pub toggle_voltage: f64,
    /// Reference temperature for `r0`, in Celsius (usually 25).
    pub t0_celsius: f64,
    /// Thermistor resistance at `t0_celsius`, in ohms.
    pub r0: f64,
    /// Thermistor beta constant.
    pub beta: f64,
}

/// Converts discharge durations to temperatures.
#[derive(Debug, Clone)]
pub struct RcThermistor {
    params: RcThermistorParams,
    min_resistance: f64,
    max_resistance: f64,
}

impl RcThermistor {
    pub fn new(params: RcThermistorParams) -> Self {
        let max_resistance = params.r0 * 2.0;
        Self {
            params,
            min_resistance: 0.0,
            max_resistance,
        }
    }

    /// Discharge time predicted for a given thermistor resistance:
    /// `t = C * Rt * ln(Rt * Vcc / ((Ra + Rt) * Va))`.
    fn discharge_time_for(&self, resistance: f64) -> f64 {
        let p = &self.params;
        p.capacitance
            * resistance
            * (resistance * p.supply_voltage
                / ((p.fixed_resistance + resistance) * p.toggle_voltage))
                .ln()
    }

    /// Estimate the thermistor resistance from a measured discharge time.
    ///
    /// The time equation has no closed-form inverse in `Rt`; the predicted
    /// time is monotone in the resistance over the usable range, so a
    /// bisection to 2-ohm precision is enough.
    pub fn resistance_from_discharge_time(&self, seconds: f64) -> f64 {
        let mut lower = self.min_resistance;
        let mut upper = self.max_resistance;
        while upper - lower > 2.0 {
            let mid = 0.5 * (upper + lower);
            if self.discharge_time_for(mid) < seconds {
                lower = mid;
            } else {
                upper = mid;
            }
        }
        0.5 * (upper + lower)
    }

    /// Beta-equation temperature (Celsius) for a thermistor resistance.
    pub fn temperature_from_resistance(&self, resistance: f64) -> f64 {
        let p = &self.params;
        let t0_kelvin = p.t0_celsius + KELVIN_OFFSET;
        let kelvin = 1.0 / (1.0 / t0_kelvin + (resistance / p.r0).ln() / p.beta);
        kelvin - KELVIN_OFFSET
    }

    /// Full conversion: measured discharge duration to Celsius.
    pub fn temperature_from_discharge_time(&self, seconds: f64) -> f64 {
        let resistance = self.resistance_from_discharge_time(seconds);
        let celsius = self.temperature_from_resistance(resistance);
        trace!(seconds, resistance, celsius, "thermistor conversion");
        celsius
    }
}
