//! Printer configuration loader.
//!
//! Parses the INI-style `printer.cfg` into strongly-typed sections. Geometry
//! and electrical constants live here; everything dynamic lives in the state
//! loop.

use anyhow::{bail, Context, Result};
use configparser::ini::Ini;
use motion::Matrix3;
use std::path::Path;

/// Which kinematic model the `[printer]` section selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicsKind {
    Cartesian,
    LinearDelta,
}

/// The `[printer]` section.
#[derive(Debug, Clone)]
pub struct PrinterSection {
    pub kinematics: KinematicsKind,
    /// mm/s cap for Cartesian motion.
    pub max_velocity: f64,
    /// Extrusion velocity clamp, mm/s of filament.
    pub min_extrude_velocity: f64,
    pub max_extrude_velocity: f64,
    /// mm/s used for G28.
    pub home_velocity: f64,
    /// mm/s²; zero disables acceleration shaping.
    pub acceleration: f64,
    /// SoC peripheral base; 0x20000000 for BCM2835, 0x3F000000 for later Pis.
    pub peripheral_base: u32,
    pub dma_channel: usize,
    pub running_in_vm: bool,
}

/// One `[stepper_*]` or `[extruder]` section.
#[derive(Debug, Clone)]
pub struct StepperSection {
    pub steps_per_mm: f64,
    pub step_pin: u32,
    pub inverted: bool,
    pub endstop_pin: Option<u32>,
    pub endstop_active_low: bool,
    pub enable_pin: Option<u32>,
    pub enable_active_low: bool,
}

/// The `[delta]` geometry section (linear-delta machines only).
#[derive(Debug, Clone)]
pub struct DeltaSection {
    pub radius: f64,
    pub rod_length: f64,
    pub home_height: f64,
    pub build_radius: f64,
    pub min_z: f64,
}

/// A `[heater_*]` section: output pin, RC sense circuit and PID gains.
#[derive(Debug, Clone)]
pub struct HeaterSection {
    pub heater_pin: u32,
    pub sense_pin: u32,
    /// Ideal PWM period in seconds; heaters want slow switching.
    pub pwm_period: f64,
    pub fixed_resistance: f64,
    pub capacitance: f64,
    pub supply_voltage: f64,
    pub toggle_voltage: f64,
    pub t0_celsius: f64,
    pub r0: f64,
    pub beta: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub filter_rc: f64,
}

/// The `[fan]` section.
#[derive(Debug, Clone)]
pub struct FanSection {
    pub pin: u32,
    pub pwm_period: f64,
}

/// The whole parsed configuration.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub printer: PrinterSection,
    /// X/Y/Z for Cartesian, A/B/C carriages for delta.
    pub steppers: [StepperSection; 3],
    pub extruder: StepperSection,
    pub delta: Option<DeltaSection>,
    pub hotend: Option<HeaterSection>,
    pub fan: Option<FanSection>,
    pub leveling: Option<Matrix3>,
}

impl PrinterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("failed to load configuration file {path:?}"))?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let kinematics = match get_str(ini, "printer", "kinematics")?.as_str() {
            "cartesian" => KinematicsKind::Cartesian,
            "linear_delta" => KinematicsKind::LinearDelta,
            other => bail!("[printer] kinematics '{other}' is not supported"),
        };

        let printer = PrinterSection {
            kinematics,
            max_velocity: get_float(ini, "printer", "max_velocity")?,
            min_extrude_velocity: get_float_or(ini, "printer", "min_extrude_velocity", 0.1)?,
            max_extrude_velocity: get_float_or(ini, "printer", "max_extrude_velocity", 30.0)?,
            home_velocity: get_float_or(ini, "printer", "home_velocity", 10.0)?,
            acceleration: get_float_or(ini, "printer", "acceleration", 0.0)?,
            peripheral_base: parse_base(&get_str_or(
                ini,
                "printer",
                "peripheral_base",
                "0x20000000",
            )?)?,
            dma_channel: get_float_or(ini, "printer", "dma_channel", 5.0)? as usize,
            running_in_vm: get_bool_or(ini, "printer", "running_in_vm", false)?,
        };

        let axis_sections: [&str; 3] = match kinematics {
            KinematicsKind::Cartesian => ["stepper_x", "stepper_y", "stepper_z"],
            KinematicsKind::LinearDelta => ["stepper_a", "stepper_b", "stepper_c"],
        };
        let steppers = [
            load_stepper(ini, axis_sections[0])?,
            load_stepper(ini, axis_sections[1])?,
            load_stepper(ini, axis_sections[2])?,
        ];
        let extruder = load_stepper(ini, "extruder")?;

        let delta = match kinematics {
            KinematicsKind::LinearDelta => Some(DeltaSection {
                radius: get_float(ini, "delta", "radius")?,
                rod_length: get_float(ini, "delta", "rod_length")?,
                home_height: get_float(ini, "delta", "home_height")?,
                build_radius: get_float(ini, "delta", "build_radius")?,
                min_z: get_float_or(ini, "delta", "min_z", -2.0)?,
            }),
            KinematicsKind::Cartesian => None,
        };

        let hotend = if has_section(ini, "heater_hotend") {
            Some(load_heater(ini, "heater_hotend")?)
        } else {
            None
        };

        let fan = if has_section(ini, "fan") {
            Some(FanSection {
                pin: get_pin(ini, "fan", "pin")?,
                pwm_period: get_float_or(ini, "fan", "pwm_period", 0.01)?,
            })
        } else {
            None
        };

        let leveling = if has_section(ini, "leveling") {
            Some(load_leveling(ini)?)
        } else {
            None
        };

        Ok(Self {
            printer,
            steppers,
            extruder,
            delta,
            hotend,
            fan,
            leveling,
        })
    }
}

fn has_section(ini: &Ini, section: &str) -> bool {
    ini.sections().iter().any(|s| s == section)
}

fn get_str(ini: &Ini, section: &str, key: &str) -> Result<String> {
    ini.get(section, key)
        .with_context(|| format!("[{section}] {key} not found"))
}

fn get_str_or(ini: &Ini, section: &str, key: &str, default: &str) -> Result<String> {
    Ok(ini.get(section, key).unwrap_or_else(|| default.to_string()))
}

fn get_float(ini: &Ini, section: &str, key: &str) -> Result<f64> {
    ini.getfloat(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key} is not a number"))?
        .with_context(|| format!("[{section}] {key} not found"))
}

fn get_float_or(ini: &Ini, section: &str, key: &str, default: f64) -> Result<f64> {
    Ok(ini
        .getfloat(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key} is not a number"))?
        .unwrap_or(default))
}

fn get_bool_or(ini: &Ini, section: &str, key: &str, default: bool) -> Result<bool> {
    Ok(ini
        .getbool(section, key)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("[{section}] {key} is not a boolean"))?
        .unwrap_or(default))
}

fn get_pin(ini: &Ini, section: &str, key: &str) -> Result<u32> {
    let value = get_float(ini, section, key)?;
    if value < 0.0 || value > 53.0 || value.fract() != 0.0 {
        bail!("[{section}] {key} = {value} is not a BCM pin number");
    }
    Ok(value as u32)
}

fn get_pin_opt(ini: &Ini, section: &str, key: &str) -> Result<Option<u32>> {
    if ini.get(section, key).is_none() {
        return Ok(None);
    }
    get_pin(ini, section, key).map(Some)
}

fn parse_base(text: &str) -> Result<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16)
        .with_context(|| format!("peripheral_base '{text}' is not a hex address"))
}

fn load_stepper(ini: &Ini, section: &str) -> Result<StepperSection> {
    Ok(StepperSection {
        steps_per_mm: get_float(ini, section, "steps_per_mm")?,
        step_pin: get_pin(ini, section, "step_pin")?,
        inverted: get_bool_or(ini, section, "inverted", false)?,
        endstop_pin: get_pin_opt(ini, section, "endstop_pin")?,
        endstop_active_low: get_bool_or(ini, section, "endstop_active_low", false)?,
        enable_pin: get_pin_opt(ini, section, "enable_pin")?,
        enable_active_low: get_bool_or(ini, section, "enable_active_low", true)?,
    })
}

fn load_heater(ini: &Ini, section: &str) -> Result<HeaterSection> {
    Ok(HeaterSection {
        heater_pin: get_pin(ini, section, "heater_pin")?,
        sense_pin: get_pin(ini, section, "sense_pin")?,
        pwm_period: get_float_or(ini, section, "pwm_period", 0.1)?,
        fixed_resistance: get_float(ini, section, "r_ohms")?,
        capacitance: get_float(ini, section, "c_farads")?,
        supply_voltage: get_float_or(ini, section, "vcc", 3.3)?,
        toggle_voltage: get_float_or(ini, section, "v_toggle", 1.27)?,
        t0_celsius: get_float_or(ini, section, "t0", 25.0)?,
        r0: get_float(ini, section, "r0")?,
        beta: get_float(ini, section, "beta")?,
        kp: get_float(ini, section, "kp")?,
        ki: get_float(ini, section, "ki")?,
        kd: get_float(ini, section, "kd")?,
        filter_rc: get_float_or(ini, section, "filter_rc", 2.0)?,
    })
}

fn load_leveling(ini: &Ini) -> Result<Matrix3> {
    let mut rows = [[0.0f64; 3]; 3];
    for (index, key) in ["row0", "row1", "row2"].iter().enumerate() {
        let text = get_str(ini, "leveling", key)?;
        let values: Vec<f64> = text
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("[leveling] {key} must be three comma-separated numbers"))?;
        if values.len() != 3 {
            bail!("[leveling] {key} must have exactly three entries");
        }
        rows[index].copy_from_slice(&values);
    }
    Ok(Matrix3(rows))
}
