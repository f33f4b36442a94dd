//! Fallback schedulers: a blocking synchronous back-end for platforms with
//! no DMA pacing, and an in-memory recorder for tests and dry runs.

use tracing::debug;

use crate::clock::EventClock;
use crate::{HardwareScheduler, IdleInterval, Level, OutputEvent, PinId};

/// Something that can set a pin level right now.
pub trait DigitalWrite {
    fn digital_write(&mut self, pin: PinId, level: Level);
}

impl<F: FnMut(PinId, Level)> DigitalWrite for F {
    fn digital_write(&mut self, pin: PinId, level: Level) {
        self(pin, level)
    }
}

/// Degenerate scheduler: sleeps until each event's target time and performs
/// the write directly. Timing accuracy is whatever the OS scheduler grants;
/// it exists so the planner runs unmodified on machines without the DMA
/// back-end, not to meet the microsecond contract.
pub struct SyncScheduler<W> {
    writer: W,
}

impl<W: DigitalWrite> SyncScheduler<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: DigitalWrite> HardwareScheduler for SyncScheduler<W> {
    fn queue(&mut self, event: OutputEvent) {
        EventClock::sleep_until(event.time);
        self.writer.digital_write(event.pin, event.level);
    }

    fn queue_pwm(&mut self, pin: PinId, duty: f64, ideal_period: f64) {
        // No frame ring to modulate; approximate with a threshold.
        debug!(pin = pin.0, duty, ideal_period, "sync backend thresholds pwm");
        let level = if duty >= 0.5 { Level::High } else { Level::Low };
        self.writer.digital_write(pin, level);
    }

    fn on_idle_cpu(&mut self, _interval: IdleInterval) -> bool {
        false
    }
}

/// Captures everything queued at it, in order. Used by dry-run mode and by
/// integration tests to assert on the exact event stream a move produces.
#[derive(Debug, Default)]
pub struct EventRecorder {
    pub events: Vec<OutputEvent>,
    pub pwm: Vec<(PinId, f64, f64)>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for one pin, in queue order.
    pub fn events_for(&self, pin: PinId) -> Vec<OutputEvent> {
        self.events.iter().copied().filter(|e| e.pin == pin).collect()
    }
}

impl HardwareScheduler for EventRecorder {
    fn queue(&mut self, event: OutputEvent) {
        self.events.push(event);
    }

    fn queue_pwm(&mut self, pin: PinId, duty: f64, ideal_period: f64) {
        self.pwm.push((pin, duty, ideal_period));
    }

    fn on_idle_cpu(&mut self, _interval: IdleInterval) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventTime;

    #[test]
    fn sync_scheduler_writes_at_event_time() {
        let mut writes = Vec::new();
        {
            let mut sched = SyncScheduler::new(|pin, level| writes.push((pin, level)));
            let target = EventClock::now().add_micros(500);
            sched.queue(OutputEvent::new(PinId(4), Level::High, target));
            assert!(EventClock::now() >= target);
        }
        assert_eq!(writes, vec![(PinId(4), Level::High)]);
    }

    #[test]
    fn recorder_filters_by_pin() {
        let mut rec = EventRecorder::new();
        rec.queue(OutputEvent::new(PinId(1), Level::High, EventTime::from_micros(10)));
        rec.queue(OutputEvent::new(PinId(2), Level::Low, EventTime::from_micros(20)));
        rec.queue(OutputEvent::new(PinId(1), Level::Low, EventTime::from_micros(30)));
        assert_eq!(rec.events_for(PinId(1)).len(), 2);
        assert_eq!(rec.events_for(PinId(2)).len(), 1);
    }
}
