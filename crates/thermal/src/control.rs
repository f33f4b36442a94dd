//! The heater regulation state machine.
//!
//! Alternates between charging the sense capacitor, timing its discharge
//! through the thermistor, and feeding the resulting temperature through the
//! low-pass filter and PID to produce a heater duty cycle. Designed to be
//! polled from the control loop's idle hook; it never blocks.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::filter::LowPassFilter;
use crate::pid::Pid;
use crate::rc_thermistor::RcThermistor;

/// The thermistor sense pin, from the machine's GPIO layer.
pub trait SensePin {
    /// Drive high, charging the capacitor between reads.
    fn charge(&mut self);
    /// Switch to input, starting the timed discharge.
    fn release(&mut self);
    /// Is the capacitor still above the input threshold?
    fn is_high(&mut self) -> bool;
}

/// Result of one service poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempUpdate {
    /// Nothing new; `wants_more` asks for another poll soon (a discharge is
    /// being timed).
    Idle { wants_more: bool },
    /// A fresh reading produced a new heater duty in `[0, 1]`.
    Duty(f64),
}

/// PID-regulated heater fed by an RC thermistor.
pub struct TempControl<P: SensePin> {
    thermistor: RcThermistor,
    pid: Pid<f64>,
    filter: LowPassFilter<f64>,
    pin: P,
    target: Option<f64>,
    last_temp: Option<f64>,
    read_started: Option<Instant>,
    next_read: Instant,
    last_duty_update: Option<Instant>,
    read_interval: Duration,
    max_read: Duration,
}

impl<P: SensePin> TempControl<P> {
    pub fn new(
        thermistor: RcThermistor,
        pid: Pid<f64>,
        filter: LowPassFilter<f64>,
        mut pin: P,
        read_interval: Duration,
        max_read: Duration,
    ) -> Self {
        // Start charging immediately so the first read has a full capacitor.
        pin.charge();
        Self {
            thermistor,
            pid,
            filter,
            pin,
            target: None,
            last_temp: None,
            read_started: None,
            next_read: Instant::now() + read_interval,
            last_duty_update: None,
            read_interval,
            max_read,
        }
    }

    /// `None` turns the heater off.
    pub fn set_target(&mut self, celsius: Option<f64>) {
        debug!(?celsius, "heater target changed");
        self.target = celsius;
        if let Some(target) = celsius {
            self.pid.setpoint = target;
        }
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Most recent filtered temperature, if any read has completed.
    pub fn measured_temperature(&self) -> Option<f64> {
        self.last_temp
    }

    /// How long the in-flight read has been running, for freeze detection.
    pub fn time_since_start_read(&self, now: Instant) -> Option<Duration> {
        self.read_started.map(|started| now - started)
    }

    /// Poll the read state machine. Call from the idle hook.
    pub fn service(&mut self, now: Instant) -> TempUpdate {
        match self.read_started {
            Some(started) => {
                if !self.pin.is_high() {
                    // Discharge complete: convert, filter, regulate.
                    let seconds = (now - started).as_secs_f64();
                    self.read_started = None;
                    self.pin.charge();
                    let raw = self.thermistor.temperature_from_discharge_time(seconds);
                    let dt = self
                        .last_duty_update
                        .map(|last| (now - last).as_secs_f64())
                        .unwrap_or_else(|| self.read_interval.as_secs_f64());
                    self.last_duty_update = Some(now);
                    let temp = self.filter.feed(raw, dt);
                    self.last_temp = Some(temp);
                    let duty = match self.target {
                        Some(_) => self.pid.update(temp, dt).clamp(0.0, 1.0),
                        None => 0.0,
                    };
                    TempUpdate::Duty(duty)
                } else if now - started > self.max_read {
                    // Never fatal: drop the sample and retry next interval.
                    warn!("thermistor read timed out; sample dropped");
                    self.read_started = None;
                    self.pin.charge();
                    TempUpdate::Idle { wants_more: false }
                } else {
                    TempUpdate::Idle { wants_more: true }
                }
            }
            None => {
                if now >= self.next_read {
                    self.next_read = now + self.read_interval;
                    self.pin.release();
                    self.read_started = Some(now);
                    TempUpdate::Idle { wants_more: true }
                } else {
                    TempUpdate::Idle { wants_more: false }
                }
            }
        }
    }
}
