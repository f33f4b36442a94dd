//! The command dispatch loop.
//!
//! Single-threaded and cooperative: commands are pulled from a channel,
//! each move is planned and drained into the scheduler synchronously, and
//! housekeeping (cursor resync, heater regulation) runs from the idle hook.
//! The only blocking point in the whole loop is the scheduler's own
//! backpressure sleep inside `queue()`.

use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError};
use motion::Xyze;
use sched::{EventClock, EventTime, HardwareScheduler, IdleInterval};
use thermal::TempUpdate;
use tracing::{debug, info, warn};

use crate::gcode::{parse_line, GcodeCommand};
use crate::machine::Machine;

/// Gap between "now" and the first event of a freshly planned move, giving
/// the producer loop headroom before the scheduler's window opens.
const SCHEDULE_LEAD_USEC: u64 = 50_000;

/// How often to service the idle hook while draining a long move.
const DRAIN_IDLE_STRIDE: u64 = 64;

/// Dynamic printer state plus the machine it drives.
pub struct MachineState {
    pub machine: Machine,
    /// G90/G91.
    absolute: bool,
    /// G20/G21 scale to millimeters.
    unit_scale: f64,
    /// Current feedrate, mm/s.
    feedrate: f64,
    /// Logical position (bounded target of the last move).
    logical: Xyze,
    /// End time of the most recently planned event stream.
    stream_end: EventTime,
}

impl MachineState {
    pub fn new(machine: Machine) -> Self {
        let logical = machine.planner.position();
        Self {
            machine,
            absolute: true,
            unit_scale: 1.0,
            feedrate: 20.0,
            logical,
            stream_end: EventTime::default(),
        }
    }

    /// Run until the line source disconnects.
    pub fn run(&mut self, lines: Receiver<String>, mut reply: impl FnMut(&str)) -> Result<()> {
        info!("command loop running");
        loop {
            match lines.try_recv() {
                Ok(line) => {
                    let text = self.execute_line(&line);
                    reply(&text);
                }
                Err(TryRecvError::Empty) => {
                    if !self.service_idle(IdleInterval::Wide) {
                        std::thread::sleep(Duration::from_micros(500));
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        info!("command loop finished");
        Ok(())
    }

    fn execute_line(&mut self, line: &str) -> String {
        let command = match parse_line(line) {
            Ok(Some(command)) => command,
            Ok(None) => return String::new(),
            Err(err) => {
                warn!(line, %err, "rejected g-code line");
                return format!("error: {err}");
            }
        };
        match self.execute(&command) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(line, %err, "command failed");
                format!("error: {err}")
            }
        }
    }

    fn execute(&mut self, command: &GcodeCommand) -> Result<String> {
        let reply = match (command.letter, command.number) {
            ('G', 0) | ('G', 1) => {
                self.linear_move(command)?;
                "ok".to_string()
            }
            ('G', 20) => {
                self.unit_scale = 25.4;
                "ok".to_string()
            }
            ('G', 21) => {
                self.unit_scale = 1.0;
                "ok".to_string()
            }
            ('G', 28) => {
                self.home()?;
                "ok".to_string()
            }
            ('G', 90) => {
                self.absolute = true;
                "ok".to_string()
            }
            ('G', 91) => {
                self.absolute = false;
                "ok".to_string()
            }
            ('G', 92) => {
                self.set_logical_position(command)?;
                "ok".to_string()
            }
            ('M', 17) => {
                self.set_axes_locked(true);
                "ok".to_string()
            }
            ('M', 18) | ('M', 84) => {
                self.set_axes_locked(false);
                "ok".to_string()
            }
            ('M', 104) | ('M', 109) => {
                let target = command.value('S').filter(|&s| s > 0.0);
                match &mut self.machine.hotend {
                    Some(hotend) => hotend.set_target(target),
                    None => warn!("no hotend configured; temperature command ignored"),
                }
                if command.number == 109 {
                    // Wait-for-temperature is not implemented; regulation
                    // continues in the background either way.
                    warn!("M109 treated as M104 (no wait)");
                }
                "ok".to_string()
            }
            ('M', 105) => self.report_temperatures(),
            ('M', 106) => {
                let duty = (command.value('S').unwrap_or(255.0) / 255.0).clamp(0.0, 1.0);
                self.set_fan(duty);
                "ok".to_string()
            }
            ('M', 107) => {
                self.set_fan(0.0);
                "ok".to_string()
            }
            (letter, number) => {
                warn!(command = format!("{letter}{number}"), "unsupported command ignored");
                "ok".to_string()
            }
        };
        Ok(reply)
    }

    /// G0/G1: compute the target, bound it, plan and drain the move.
    fn linear_move(&mut self, command: &GcodeCommand) -> Result<()> {
        if let Some(feed) = command.value('F') {
            // F is units per minute.
            self.feedrate = feed * self.unit_scale / 60.0;
        }
        let start = self.logical;
        let mut target = start;
        for (coordinate, letter) in [
            (&mut target.x, 'X'),
            (&mut target.y, 'Y'),
            (&mut target.z, 'Z'),
            (&mut target.e, 'E'),
        ] {
            if let Some(value) = command.value(letter) {
                let scaled = value * self.unit_scale;
                *coordinate = if self.absolute {
                    scaled
                } else {
                    *coordinate + scaled
                };
            }
        }
        let bounded = self.machine.planner.coord_map().bound(target);
        if bounded != target {
            debug!(?target, ?bounded, "target clamped to workspace");
        }
        self.logical = bounded;

        let vmax = self
            .feedrate
            .min(self.machine.limits.max_velocity)
            .max(1e-3);
        let base = self.next_base_time();
        self.machine.planner.move_to(
            base,
            bounded,
            vmax,
            self.machine.limits.min_extrude_velocity,
            self.machine.limits.max_extrude_velocity,
        )?;
        self.drain_planner();
        Ok(())
    }

    fn home(&mut self) -> Result<()> {
        let base = self.next_base_time();
        let v_home = self.machine.limits.home_velocity;
        self.machine.planner.home_endstops(base, v_home)?;
        self.drain_planner();
        self.logical = self.machine.planner.position();
        info!(position = ?self.logical, "homed");
        Ok(())
    }

    fn set_logical_position(&mut self, command: &GcodeCommand) -> Result<()> {
        let mut position = self.logical;
        let mut any = false;
        for (coordinate, letter) in [
            (&mut position.x, 'X'),
            (&mut position.y, 'Y'),
            (&mut position.z, 'Z'),
            (&mut position.e, 'E'),
        ] {
            if let Some(value) = command.value(letter) {
                *coordinate = value * self.unit_scale;
                any = true;
            }
        }
        if !any {
            position = Xyze::default();
        }
        self.machine.planner.set_position(position)?;
        self.logical = position;
        Ok(())
    }

    fn set_axes_locked(&mut self, locked: bool) {
        if self.machine.enable_pins.is_empty() {
            debug!("no enable pins configured; lock state unchanged");
            return;
        }
        for &(pin, active_low) in &self.machine.enable_pins {
            // A steady level, expressed as a ring pattern.
            let duty = if locked != active_low { 1.0 } else { 0.0 };
            self.machine.scheduler.queue_pwm(pin, duty, 0.0);
        }
        info!(locked, "axis drivers");
    }

    fn set_fan(&mut self, duty: f64) {
        match self.machine.fan {
            Some((pin, period)) => self.machine.scheduler.queue_pwm(pin, duty, period),
            None => warn!("no fan configured; fan command ignored"),
        }
    }

    /// M105: `ok T:<hotend> /<target> B:<bed> /<target>`. No heated bed is
    /// modeled, so the B channel always reports zeros.
    fn report_temperatures(&mut self) -> String {
        let (measured, target) = match &self.machine.hotend {
            Some(hotend) => (
                hotend.measured_temperature().unwrap_or(0.0),
                hotend.target().unwrap_or(0.0),
            ),
            None => (0.0, 0.0),
        };
        format!("ok T:{measured:.1} /{target:.1} B:0.0 /0.0")
    }

    /// Base time for the next plan: just past the end of the previous event
    /// stream, but never closer to now than the scheduling lead.
    fn next_base_time(&self) -> EventTime {
        let lead = EventClock::now().add_micros(SCHEDULE_LEAD_USEC);
        self.stream_end.max(lead)
    }

    /// Pump every event of the current plan into the scheduler, servicing
    /// housekeeping between batches.
    fn drain_planner(&mut self) {
        let mut drained = 0u64;
        while let Some(event) = self.machine.planner.next_step() {
            self.stream_end = self.stream_end.max(event.time);
            self.machine.scheduler.queue(event);
            drained += 1;
            if drained % DRAIN_IDLE_STRIDE == 0 {
                self.service_idle(IdleInterval::Short);
            }
        }
        debug!(events = drained, "move drained");
    }

    /// One housekeeping pass; returns true if more polling is wanted soon.
    fn service_idle(&mut self, interval: IdleInterval) -> bool {
        let mut wants_more = self.machine.scheduler.on_idle_cpu(interval);
        if let Some(hotend) = &mut self.machine.hotend {
            match hotend.service(Instant::now()) {
                TempUpdate::Duty(duty) => {
                    if let Some((pin, period)) = self.machine.hotend_pin {
                        self.machine.scheduler.queue_pwm(pin, duty, period);
                    }
                }
                TempUpdate::Idle { wants_more: more } => wants_more |= more,
            }
        }
        wants_more
    }
}
