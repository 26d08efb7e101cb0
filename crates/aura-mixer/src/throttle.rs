//! Throttling controller
//!
//! A modified proportional-integral controller over the trailing ratio of
//! mix time to frame time. The throttle and backoff thresholds differ on
//! purpose: the deadband keeps the controller from oscillating and lets
//! throttling find a steady state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::debug;

use aura_core::BROADCAST_RATE_HZ;

const FRAME_TIME_US: f32 = 1_000_000.0 / BROADCAST_RATE_HZ as f32;

const TARGET: f32 = 0.9;
// on a regular machine with 100 avatars this is the largest value where
// overthrottling can be recovered without oscillation afterwards
const BACKOFF_TARGET: f32 = 0.44;

// the mixer is known to struggle at about 150 streams, so shed 2/150 of
// the streams per step (throttling is linear)
const STRUGGLES_AT: f32 = 150.0;
const THROTTLE_RATE: f32 = 2.0 / STRUGGLES_AT;
const BACKOFF_RATE: f32 = THROTTLE_RATE / 4.0;

// recovery is bounded so large swings in user count stay tolerable
const RECOVERY_TIME_SECS: f32 = 180.0;

/// Frames between controller evaluations; also the trailing window length.
pub const TRAILING_FRAMES: u64 = (100.0 * RECOVERY_TIME_SECS * BACKOFF_RATE) as u64;

/// Closed-loop stream-shedding controller.
///
/// The ratio is published through an atomic so the broadcast workers can
/// read it without synchronizing with the loop thread.
pub struct ThrottleController {
    trailing_mix_ratio: AtomicU32,
    throttling_ratio: AtomicU32,
}

impl ThrottleController {
    pub fn new() -> Self {
        ThrottleController {
            trailing_mix_ratio: AtomicU32::new(0f32.to_bits()),
            throttling_ratio: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Feed one frame's duration into the controller.
    pub fn update(&self, duration: Duration, frame: u64) {
        let mix_ratio = duration.as_micros() as f32 / FRAME_TIME_US;

        // weight recent frames into the trailing ratio
        let current_frame_ratio = 1.0 / TRAILING_FRAMES as f32;
        let previous_frames_ratio = 1.0 - current_frame_ratio;
        let trailing =
            previous_frames_ratio * self.trailing_mix_ratio() + current_frame_ratio * mix_ratio;
        self.trailing_mix_ratio
            .store(trailing.to_bits(), Ordering::Relaxed);

        if frame % TRAILING_FRAMES != 0 {
            return;
        }

        let mut ratio = self.ratio();
        if trailing > TARGET {
            let proportional_term = 1.0 + ((trailing - TARGET) / 0.1).floor();
            ratio = (ratio + THROTTLE_RATE * proportional_term).min(1.0);
            self.throttling_ratio
                .store(ratio.to_bits(), Ordering::Relaxed);
            debug!(
                trailing_mix_ratio = trailing,
                throttling_ratio = ratio,
                "mixer is struggling - throttling streams"
            );
        } else if ratio > 0.0 && trailing <= BACKOFF_TARGET {
            let proportional_term = 1.0 + ((TARGET - trailing) / 0.2).floor();
            ratio = (ratio - BACKOFF_RATE * proportional_term).max(0.0);
            self.throttling_ratio
                .store(ratio.to_bits(), Ordering::Relaxed);
            debug!(
                trailing_mix_ratio = trailing,
                throttling_ratio = ratio,
                "mixer is recovering - easing throttle"
            );
        }
    }

    /// Fraction of candidate streams to shed this tick, in [0, 1].
    pub fn ratio(&self) -> f32 {
        f32::from_bits(self.throttling_ratio.load(Ordering::Relaxed))
    }

    pub fn trailing_mix_ratio(&self) -> f32 {
        f32::from_bits(self.trailing_mix_ratio.load(Ordering::Relaxed))
    }
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overloaded_frame() -> Duration {
        // 2x the frame budget
        Duration::from_micros((2.0 * FRAME_TIME_US) as u64)
    }

    fn idle_frame() -> Duration {
        Duration::from_micros((0.1 * FRAME_TIME_US) as u64)
    }

    #[test]
    fn test_starts_unthrottled() {
        let controller = ThrottleController::new();
        assert_eq!(controller.ratio(), 0.0);
    }

    #[test]
    fn test_sustained_overload_raises_ratio_until_one() {
        let controller = ThrottleController::new();
        let mut frame = 1;
        for _ in 0..400 * TRAILING_FRAMES {
            controller.update(overloaded_frame(), frame);
            frame += 1;
            let ratio = controller.ratio();
            assert!((0.0..=1.0).contains(&ratio));
        }
        assert_eq!(controller.ratio(), 1.0);
    }

    #[test]
    fn test_ratio_changes_only_on_evaluation_frames() {
        let controller = ThrottleController::new();
        // saturate the trailing ratio without hitting an evaluation frame
        for frame in 1..TRAILING_FRAMES {
            controller.update(overloaded_frame(), frame);
        }
        assert_eq!(controller.ratio(), 0.0);
        controller.update(overloaded_frame(), TRAILING_FRAMES);
        assert!(controller.ratio() > 0.0);
    }

    #[test]
    fn test_recovery_in_deadband_holds_ratio() {
        let controller = ThrottleController::new();
        let mut frame = 1;
        for _ in 0..10 * TRAILING_FRAMES {
            controller.update(overloaded_frame(), frame);
            frame += 1;
        }
        let throttled = controller.ratio();
        assert!(throttled > 0.0);

        // a mix ratio between the two thresholds must not move the ratio
        let deadband_frame = Duration::from_micros((0.7 * FRAME_TIME_US) as u64);
        for _ in 0..10 * TRAILING_FRAMES {
            controller.update(deadband_frame, frame);
            frame += 1;
        }
        assert_eq!(controller.ratio(), throttled);
    }

    #[test]
    fn test_idle_frames_recover_to_zero() {
        let controller = ThrottleController::new();
        let mut frame = 1;
        for _ in 0..10 * TRAILING_FRAMES {
            controller.update(overloaded_frame(), frame);
            frame += 1;
        }
        assert!(controller.ratio() > 0.0);

        for _ in 0..2000 * TRAILING_FRAMES {
            controller.update(idle_frame(), frame);
            frame += 1;
            if controller.ratio() == 0.0 {
                return;
            }
        }
        panic!("throttle never recovered");
    }
}
