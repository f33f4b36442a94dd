//! Machine assembly: turn a parsed configuration into live components:
//! coordinate map, planner, scheduler back-end, endstops, heater and fan.

use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use motion::kinematics::{CartesianParams, CoordMap, DeltaParams};
use motion::planner::{AxisPinMap, MotionPlanner};
use motion::profile::AccelProfile;
use motion::stepper::Endstop;
use rpi_dma::mem::DevMem;
use rpi_dma::{DmaScheduler, DmaSchedulerConfig, Gpio, RpiPin};
use sched::{EventRecorder, HardwareScheduler, IdleInterval, Level, OutputEvent, PinId};
use thermal::{LowPassFilter, Pid, PidGains, RcThermistor, RcThermistorParams, TempControl};
use tracing::{info, warn};

use crate::config::{HeaterSection, KinematicsKind, PrinterConfig};

/// An endstop as wired on this machine.
pub enum MachineEndstop {
    Gpio(RpiPin),
}

impl Endstop for MachineEndstop {
    fn is_triggered(&self) -> bool {
        match self {
            MachineEndstop::Gpio(pin) => pin.is_triggered(),
        }
    }
}

/// The configured scheduler back-end.
pub enum SchedulerBackend {
    Dma(Box<DmaScheduler>),
    /// Dry runs capture the event stream instead of touching hardware.
    Recorder(EventRecorder),
}

impl HardwareScheduler for SchedulerBackend {
    fn queue(&mut self, event: OutputEvent) {
        match self {
            SchedulerBackend::Dma(inner) => inner.queue(event),
            SchedulerBackend::Recorder(inner) => inner.queue(event),
        }
    }

    fn queue_pwm(&mut self, pin: PinId, duty: f64, ideal_period: f64) {
        match self {
            SchedulerBackend::Dma(inner) => inner.queue_pwm(pin, duty, ideal_period),
            SchedulerBackend::Recorder(inner) => inner.queue_pwm(pin, duty, ideal_period),
        }
    }

    fn on_idle_cpu(&mut self, interval: IdleInterval) -> bool {
        match self {
            SchedulerBackend::Dma(inner) => inner.on_idle_cpu(interval),
            SchedulerBackend::Recorder(inner) => inner.on_idle_cpu(interval),
        }
    }
}

/// The RC-thermistor sense pin: output-high to charge the capacitor, input
/// to time its discharge.
pub struct HeaterSensePin {
    gpio: Rc<Gpio>,
    pin: PinId,
}

impl thermal::SensePin for HeaterSensePin {
    fn charge(&mut self) {
        self.gpio.set_output(self.pin);
        self.gpio.write(self.pin, Level::High);
    }

    fn release(&mut self) {
        self.gpio.set_input(self.pin);
    }

    fn is_high(&mut self) -> bool {
        self.gpio.read(self.pin).is_high()
    }
}

/// Velocity/acceleration limits from the `[printer]` section.
#[derive(Debug, Clone)]
pub struct MotionLimits {
    pub max_velocity: f64,
    pub min_extrude_velocity: f64,
    pub max_extrude_velocity: f64,
    pub home_velocity: f64,
}

/// Everything the command loop drives.
pub struct Machine {
    pub planner: MotionPlanner<MachineEndstop>,
    pub scheduler: SchedulerBackend,
    pub hotend: Option<TempControl<HeaterSensePin>>,
    pub hotend_pin: Option<(PinId, f64)>,
    pub fan: Option<(PinId, f64)>,
    /// Stepper enable pins and their active-low flags, for M17/M84.
    pub enable_pins: Vec<(PinId, bool)>,
    pub limits: MotionLimits,
}

impl Machine {
    pub fn build(config: &PrinterConfig, dry_run: bool) -> Result<Machine> {
        let coord_map = build_coord_map(config)?;
        let pins = [
            axis_pins(&config.steppers[0]),
            axis_pins(&config.steppers[1]),
            axis_pins(&config.steppers[2]),
            axis_pins(&config.extruder),
        ];
        let accel = if config.printer.acceleration > 0.0 {
            AccelProfile::constant(config.printer.acceleration)
        } else {
            AccelProfile::None
        };
        let limits = MotionLimits {
            max_velocity: config.printer.max_velocity,
            min_extrude_velocity: config.printer.min_extrude_velocity,
            max_extrude_velocity: config.printer.max_extrude_velocity,
            home_velocity: config.printer.home_velocity,
        };
        let enable_pins: Vec<(PinId, bool)> = config
            .steppers
            .iter()
            .chain(std::iter::once(&config.extruder))
            .filter_map(|s| s.enable_pin.map(|pin| (PinId(pin), s.enable_active_low)))
            .collect();

        if dry_run {
            info!("dry run: events recorded, endstops and heaters disabled");
            if config.hotend.is_some() {
                warn!("dry run ignores the configured hotend");
            }
            let planner = MotionPlanner::new(coord_map, pins, [None, None, None, None], accel);
            return Ok(Machine {
                planner,
                scheduler: SchedulerBackend::Recorder(EventRecorder::new()),
                hotend: None,
                hotend_pin: None,
                fan: config.fan.as_ref().map(|f| (PinId(f.pin), f.pwm_period)),
                enable_pins,
                limits,
            });
        }

        let devmem = DevMem::open().context("bringing up /dev/mem access")?;
        let gpio = Rc::new(
            Gpio::new(&devmem, config.printer.peripheral_base).context("mapping gpio block")?,
        );

        // Output pins all idle low; enable pins idle deasserted.
        let mut defaults: Vec<(PinId, Level)> = Vec::new();
        for section in config.steppers.iter().chain(std::iter::once(&config.extruder)) {
            let pin = PinId(section.step_pin);
            gpio.set_output(pin);
            gpio.write(pin, Level::Low);
            defaults.push((pin, Level::Low));
        }
        for &(pin, active_low) in &enable_pins {
            let idle = if active_low { Level::High } else { Level::Low };
            gpio.set_output(pin);
            gpio.write(pin, idle);
            defaults.push((pin, idle));
        }
        if let Some(fan) = &config.fan {
            let pin = PinId(fan.pin);
            gpio.set_output(pin);
            gpio.write(pin, Level::Low);
            defaults.push((pin, Level::Low));
        }
        if let Some(heater) = &config.hotend {
            let pin = PinId(heater.heater_pin);
            gpio.set_output(pin);
            gpio.write(pin, Level::Low);
            defaults.push((pin, Level::Low));
        }

        let mut endstops: [Option<MachineEndstop>; 4] = [None, None, None, None];
        for (axis, section) in config.steppers.iter().enumerate() {
            if let Some(pin) = section.endstop_pin {
                endstops[axis] = Some(MachineEndstop::Gpio(RpiPin::input(
                    gpio.clone(),
                    PinId(pin),
                    section.endstop_active_low,
                )));
            }
        }

        let hotend = config
            .hotend
            .as_ref()
            .map(|section| build_hotend(section, gpio.clone()));

        let scheduler = DmaScheduler::new(
            devmem,
            gpio,
            DmaSchedulerConfig {
                peripheral_base: config.printer.peripheral_base,
                dma_channel: config.printer.dma_channel,
                running_in_vm: config.printer.running_in_vm,
                default_pin_states: defaults,
            },
        )
        .context("starting the dma scheduler")?;

        let planner = MotionPlanner::new(coord_map, pins, endstops, accel);
        Ok(Machine {
            planner,
            scheduler: SchedulerBackend::Dma(Box::new(scheduler)),
            hotend,
            hotend_pin: config
                .hotend
                .as_ref()
                .map(|h| (PinId(h.heater_pin), h.pwm_period)),
            fan: config.fan.as_ref().map(|f| (PinId(f.pin), f.pwm_period)),
            enable_pins,
            limits,
        })
    }
}

fn axis_pins(section: &crate::config::StepperSection) -> AxisPinMap {
    AxisPinMap {
        step_pin: PinId(section.step_pin),
        inverted: section.inverted,
    }
}

fn build_coord_map(config: &PrinterConfig) -> Result<CoordMap> {
    let map = match config.printer.kinematics {
        KinematicsKind::Cartesian => CoordMap::cartesian(CartesianParams {
            steps_per_mm: [
                config.steppers[0].steps_per_mm,
                config.steppers[1].steps_per_mm,
                config.steppers[2].steps_per_mm,
                config.extruder.steps_per_mm,
            ],
        }),
        KinematicsKind::LinearDelta => {
            let delta = config
                .delta
                .as_ref()
                .context("[delta] section required for linear_delta kinematics")?;
            let carriage_spm = config.steppers[0].steps_per_mm;
            if config.steppers.iter().any(|s| s.steps_per_mm != carriage_spm) {
                bail!("delta carriages must share one steps_per_mm");
            }
            CoordMap::linear_delta(DeltaParams {
                radius: delta.radius,
                rod_length: delta.rod_length,
                home_height: delta.home_height,
                build_radius: delta.build_radius,
                steps_per_mm: carriage_spm,
                steps_per_mm_e: config.extruder.steps_per_mm,
                min_z: delta.min_z,
            })
        }
    };
    Ok(match config.leveling {
        Some(matrix) => map.with_leveling(matrix),
        None => map,
    })
}

fn build_hotend(section: &HeaterSection, gpio: Rc<Gpio>) -> TempControl<HeaterSensePin> {
    let thermistor = RcThermistor::new(RcThermistorParams {
        fixed_resistance: section.fixed_resistance,
        capacitance: section.capacitance,
        supply_voltage: section.supply_voltage,
        toggle_voltage: section.toggle_voltage,
        t0_celsius: section.t0_celsius,
        r0: section.r0,
        beta: section.beta,
    });
    let pid = Pid::new(
        PidGains {
            kp: section.kp,
            ki: section.ki,
            kd: section.kd,
        },
        0.0,
        1.0,
    );
    let sense = HeaterSensePin {
        gpio,
        pin: PinId(section.sense_pin),
    };
    TempControl::new(
        thermistor,
        pid,
        LowPassFilter::new(section.filter_rc),
        sense,
        Duration::from_millis(250),
        Duration::from_millis(600),
    )
}
