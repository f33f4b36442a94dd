//! Monotonic event clock.
//!
//! All event timestamps are microseconds on `CLOCK_MONOTONIC_RAW`. The raw
//! clock is deliberate: NTP slewing the timeline under a microsecond-paced
//! DMA ring would show up as phantom drift in the cursor resync.

use std::time::Duration;

/// An absolute instant on the event timeline, in microseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventTime(u64);

impl EventTime {
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Offset by a (possibly negative, possibly fractional) number of
    /// seconds, saturating at zero.
    pub fn offset_secs(self, secs: f64) -> Self {
        let delta = (secs * 1e6).round() as i64;
        Self(self.0.saturating_add_signed(delta))
    }

    pub fn add_micros(self, micros: u64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    pub fn saturating_sub_micros(self, micros: u64) -> Self {
        Self(self.0.saturating_sub(micros))
    }

    /// Signed distance from `earlier` to `self`, in microseconds.
    pub fn micros_since(self, earlier: EventTime) -> i64 {
        self.0 as i64 - earlier.0 as i64
    }
}

/// Reads the monotonic raw clock as [`EventTime`].
pub struct EventClock;

impl EventClock {
    pub fn now() -> EventTime {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC_RAW cannot fail with a valid timespec pointer.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        EventTime::from_micros(ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000)
    }

    /// Sleep until `target` has arrived on the event timeline. Returns
    /// immediately if the target is already in the past.
    pub fn sleep_until(target: EventTime) {
        loop {
            let now = Self::now();
            if now >= target {
                return;
            }
            let remaining = target.micros_since(now) as u64;
            // Sleep in one shot; the loop re-checks in case of early wakeup.
            std::thread::sleep(Duration::from_micros(remaining));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = EventClock::now();
        let b = EventClock::now();
        assert!(b >= a);
    }

    #[test]
    fn offset_secs_rounds_and_saturates() {
        let t = EventTime::from_micros(1_000);
        assert_eq!(t.offset_secs(0.0015).as_micros(), 2_500);
        assert_eq!(t.offset_secs(-1.0).as_micros(), 0);
    }

    #[test]
    fn micros_since_is_signed() {
        let a = EventTime::from_micros(5);
        let b = EventTime::from_micros(9);
        assert_eq!(b.micros_since(a), 4);
        assert_eq!(a.micros_since(b), -4);
    }

    #[test]
    fn sleep_until_reaches_target() {
        let target = EventClock::now().add_micros(2_000);
        EventClock::sleep_until(target);
        assert!(EventClock::now() >= target);
    }
}
