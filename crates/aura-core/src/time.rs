//! Time primitives for the AURA mixer
//!
//! All mixer bookkeeping uses microsecond timestamps relative to a process
//! epoch. A `Clock` owns the epoch; tests construct one and step derived
//! timestamps manually instead of sleeping.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// Microseconds since the mixer clock epoch.
///
/// Zero doubles as the "never" sentinel in per-peer broadcast tables: a
/// zeroed entry forces an identity resync on the next matching tick.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const NEVER: Timestamp = Timestamp(0);

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[inline]
    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Microseconds elapsed from `earlier` to `self`, saturating at zero.
    #[inline]
    pub fn micros_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_micros() as u64))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_micros(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Process clock with a fixed epoch.
///
/// Cheap to clone; all clones share the epoch, so timestamps from any clone
/// are mutually comparable.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Current time relative to the epoch.
    ///
    /// Offset by one microsecond so that `now()` can never collide with the
    /// `Timestamp::NEVER` sentinel, even on the very first call.
    #[inline]
    pub fn now(&self) -> Timestamp {
        Timestamp(self.epoch.elapsed().as_micros() as u64 + 1)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_now_is_never_the_sentinel() {
        let clock = Clock::new();
        assert!(!clock.now().is_never());
    }

    #[test]
    fn test_micros_since_saturates() {
        let early = Timestamp::from_micros(100);
        let late = Timestamp::from_micros(250);
        assert_eq!(late.micros_since(early), 150);
        assert_eq!(early.micros_since(late), 0);
    }

    #[test]
    fn test_clones_share_epoch() {
        let clock = Clock::new();
        let copy = clock;
        assert!(copy.now().micros_since(clock.now()) < 1_000_000);
    }
}
