//! Avatar data blob
//!
//! Incoming AvatarData payloads replace the stored blob wholesale. The
//! first 16 bytes are the sort prefix the mixer actually reads:
//! - Bytes 0..12: world position (3 x f32 LE)
//! - Bytes 12..16: bounding radius (f32 LE)
//! Everything past the prefix (joint poses, flags) is opaque and forwarded
//! byte-for-byte.

use aura_core::{AuraError, AuraResult, Timestamp};
use aura_wire::ByteReader;
use glam::Vec3;

/// Size of the sort-relevant prefix of an avatar payload.
pub const SORT_PREFIX_SIZE: usize = 16;

/// Stored avatar state for one node.
#[derive(Clone, Debug, Default)]
pub struct AvatarBlob {
    bytes: Vec<u8>,
    world_position: Vec3,
    bounding_radius: f32,
    last_updated: Timestamp,
}

impl AvatarBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole payload. Fails without touching stored state if
    /// the sort prefix is short.
    pub fn apply(&mut self, payload: &[u8], now: Timestamp) -> AuraResult<()> {
        if payload.len() < SORT_PREFIX_SIZE {
            return Err(AuraError::BufferTooShort {
                expected: SORT_PREFIX_SIZE,
                actual: payload.len(),
            });
        }
        let mut reader = ByteReader::new(payload);
        let x = reader.read_f32()?;
        let y = reader.read_f32()?;
        let z = reader.read_f32()?;
        let radius = reader.read_f32()?;
        if !(x.is_finite() && y.is_finite() && z.is_finite() && radius.is_finite()) {
            return Err(AuraError::MalformedPacket("non-finite avatar transform"));
        }

        self.bytes = payload.to_vec();
        self.world_position = Vec3::new(x, y, z);
        self.bounding_radius = radius.max(0.0);
        self.last_updated = now;
        Ok(())
    }

    /// Has this node sent any avatar data yet?
    #[inline]
    pub fn has_data(&self) -> bool {
        !self.bytes.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn world_position(&self) -> Vec3 {
        self.world_position
    }

    #[inline]
    pub fn bounding_radius(&self) -> f32 {
        self.bounding_radius
    }

    #[inline]
    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    /// Seconds since the payload was last replaced.
    pub fn age_secs(&self, now: Timestamp) -> f32 {
        now.micros_since(self.last_updated) as f32 / 1_000_000.0
    }

    /// Clamp the bounding radius into the domain's allowed range.
    pub fn clamp_bounding_radius(&mut self, min: f32, max: f32) {
        self.bounding_radius = self.bounding_radius.clamp(min, max);
    }
}

/// Build a payload with the given transform prefix and opaque tail.
/// Test and shadow-node helper; clients normally produce these bytes.
pub fn encode_payload(position: Vec3, radius: f32, opaque: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SORT_PREFIX_SIZE + opaque.len());
    bytes.extend_from_slice(&position.x.to_le_bytes());
    bytes.extend_from_slice(&position.y.to_le_bytes());
    bytes.extend_from_slice(&position.z.to_le_bytes());
    bytes.extend_from_slice(&radius.to_le_bytes());
    bytes.extend_from_slice(opaque);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_parses_sort_prefix() {
        let mut blob = AvatarBlob::new();
        let payload = encode_payload(Vec3::new(1.0, 2.0, 3.0), 0.5, b"joints");
        blob.apply(&payload, Timestamp::from_micros(10)).unwrap();

        assert_eq!(blob.world_position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(blob.bounding_radius(), 0.5);
        assert_eq!(blob.bytes(), &payload[..]);
        assert!(blob.has_data());
    }

    #[test]
    fn test_short_payload_leaves_state_untouched() {
        let mut blob = AvatarBlob::new();
        let good = encode_payload(Vec3::ONE, 1.0, &[]);
        blob.apply(&good, Timestamp::from_micros(5)).unwrap();

        assert!(blob.apply(&[0u8; 4], Timestamp::from_micros(6)).is_err());
        assert_eq!(blob.world_position(), Vec3::ONE);
        assert_eq!(blob.last_updated(), Timestamp::from_micros(5));
    }

    #[test]
    fn test_negative_radius_clamped() {
        let mut blob = AvatarBlob::new();
        let payload = encode_payload(Vec3::ZERO, -2.0, &[]);
        blob.apply(&payload, Timestamp::from_micros(1)).unwrap();
        assert_eq!(blob.bounding_radius(), 0.0);
    }

    #[test]
    fn test_age_tracks_updates() {
        let mut blob = AvatarBlob::new();
        let payload = encode_payload(Vec3::ZERO, 1.0, &[]);
        blob.apply(&payload, Timestamp::from_micros(1_000_000)).unwrap();
        assert!((blob.age_secs(Timestamp::from_micros(3_000_000)) - 2.0).abs() < 1e-6);
    }
}
