//! Priority sorting
//!
//! Candidates are ranked for each recipient by a weighted combination of
//! apparent angular size, centeredness in the recipient's view, and
//! staleness. The weights are process-wide and runtime-adjustable through
//! the admin-gated AdjustAvatarSorting packet.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;

use aura_core::Timestamp;

use crate::{CandidateSnapshot, ViewFrustum};

/// Default weight for apparent angular size.
pub const DEFAULT_WEIGHT_SIZE: f32 = 1.0;
/// Default weight for view centeredness.
pub const DEFAULT_WEIGHT_CENTER: f32 = 0.25;
/// Default weight for seconds since the candidate's last update.
pub const DEFAULT_WEIGHT_AGE: f32 = 1.0;

/// Process-wide sort weights.
///
/// Stored as f32 bit patterns in atomics: the admin packet handler writes
/// from the receive thread while broadcast workers read every tick.
pub struct SortWeights {
    size: AtomicU32,
    center: AtomicU32,
    age: AtomicU32,
}

impl SortWeights {
    pub fn new() -> Self {
        SortWeights {
            size: AtomicU32::new(DEFAULT_WEIGHT_SIZE.to_bits()),
            center: AtomicU32::new(DEFAULT_WEIGHT_CENTER.to_bits()),
            age: AtomicU32::new(DEFAULT_WEIGHT_AGE.to_bits()),
        }
    }

    pub fn load(&self) -> (f32, f32, f32) {
        (
            f32::from_bits(self.size.load(Ordering::Relaxed)),
            f32::from_bits(self.center.load(Ordering::Relaxed)),
            f32::from_bits(self.age.load(Ordering::Relaxed)),
        )
    }

    pub fn store(&self, size: f32, center: f32, age: f32) {
        self.size.store(size.to_bits(), Ordering::Relaxed);
        self.center.store(center.to_bits(), Ordering::Relaxed);
        self.age.store(age.to_bits(), Ordering::Relaxed);
    }
}

impl Default for SortWeights {
    fn default() -> Self {
        Self::new()
    }
}

/// Score one candidate from one recipient's point of view.
pub fn priority_score(
    recipient_position: Vec3,
    recipient_view: Option<&ViewFrustum>,
    candidate: &CandidateSnapshot,
    now: Timestamp,
    weights: (f32, f32, f32),
) -> f32 {
    let (w_size, w_center, w_age) = weights;

    let offset = candidate.position - recipient_position;
    let distance = offset.length().max(0.01);

    // apparent angular size of the candidate's bounding sphere
    let angular_size = (candidate.bounding_radius / distance).atan();

    // centeredness in the recipient's view; neutral without a view
    let centerness = match recipient_view {
        Some(view) => {
            let toward = (candidate.position - view.origin).normalize_or_zero();
            let aligned = toward.dot(view.direction.normalize_or_zero());
            (aligned + 1.0) * 0.5
        }
        None => 0.5,
    };

    let age_secs = now.micros_since(candidate.last_updated) as f32 / 1_000_000.0;

    w_size * angular_size + w_center * centerness + w_age * age_secs
}

/// Sort candidates by descending priority, then apply the throttle by
/// keeping only the highest-priority prefix. Ties break on node id so the
/// selection is stable across ticks.
pub fn sort_and_throttle(
    mut scored: Vec<(f32, CandidateSnapshot)>,
    throttling_ratio: f32,
) -> Vec<(f32, CandidateSnapshot)> {
    scored.sort_unstable_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.node_id.cmp(&b.1.node_id))
    });

    let keep = ((1.0 - throttling_ratio.clamp(0.0, 1.0)) * scored.len() as f32).round() as usize;
    scored.truncate(keep);
    scored
}
