//! Frame clock
//!
//! Drives the broadcast loop at a fixed target rate. Under sustained
//! overload the deadline is clamped to now, so the loop runs as fast as it
//! can but the schedule never falls into the past.

use std::time::{Duration, Instant};

/// Fixed-rate frame driver.
pub struct FrameTimer {
    interval: Duration,
    timestamp: Instant,
}

impl FrameTimer {
    pub fn new(rate_hz: u32) -> Self {
        FrameTimer {
            interval: Duration::from_micros(1_000_000 / rate_hz as u64),
            timestamp: Instant::now(),
        }
    }

    /// Advance one frame: measure how long the last frame took, move the
    /// deadline forward, and sleep out the residual. Returns the last
    /// frame's duration for the throttle controller.
    pub fn time_frame(&mut self) -> Duration {
        let next_timestamp = self.timestamp + self.interval;
        let now = Instant::now();

        let duration = now.duration_since(self.timestamp);

        // never schedule in the past
        self.timestamp = next_timestamp.max(now);

        std::thread::sleep(self.timestamp - now);

        duration
    }

    /// Start instant of the current frame.
    pub fn frame_start(&self) -> Instant {
        self.timestamp
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration_measured() {
        let mut timer = FrameTimer::new(100);
        timer.time_frame();
        std::thread::sleep(Duration::from_millis(5));
        let duration = timer.time_frame();
        assert!(duration >= Duration::from_millis(5));
    }

    #[test]
    fn test_deadline_advances_by_interval_when_idle() {
        let mut timer = FrameTimer::new(200);
        let first = timer.frame_start();
        timer.time_frame();
        let second = timer.frame_start();
        assert!(second >= first + timer.interval());
    }

    #[test]
    fn test_overloaded_frame_does_not_schedule_in_past() {
        let mut timer = FrameTimer::new(100);
        timer.time_frame();
        // simulate a frame far over budget
        std::thread::sleep(Duration::from_millis(30));
        timer.time_frame();
        assert!(timer.frame_start() <= Instant::now());
    }
}
