//! Trait streams
//!
//! Traits are named reliable sub-streams attached to an avatar, each with
//! its own sequence number. A SetAvatarTraits payload carries one or more
//! entries of `[kind u8][version u64][len u16][bytes]`; merging keeps the
//! highest version per trait.

use std::collections::HashMap;

use aura_core::{AuraError, AuraResult};
use aura_wire::ByteReader;

/// Trait stream kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TraitKind {
    SkeletonModel = 0,
    SkeletonData = 1,
    Grab = 2,
}

impl TraitKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(TraitKind::SkeletonModel),
            1 => Some(TraitKind::SkeletonData),
            2 => Some(TraitKind::Grab),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One versioned trait instance.
#[derive(Clone, Debug, PartialEq)]
pub struct TraitInstance {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// All trait streams currently held for one avatar.
#[derive(Clone, Debug, Default)]
pub struct TraitMap {
    entries: HashMap<TraitKind, TraitInstance>,
}

impl TraitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a SetAvatarTraits payload. Entries with an unknown trait kind
    /// fail the whole payload (the sender is speaking a newer dialect);
    /// entries with a stale version are skipped. Returns how many traits
    /// actually advanced.
    pub fn merge_payload(&mut self, payload: &[u8]) -> AuraResult<usize> {
        let mut reader = ByteReader::new(payload);
        let mut changed = 0;

        while !reader.is_empty() {
            let kind_byte = reader.read_u8()?;
            let kind =
                TraitKind::from_byte(kind_byte).ok_or(AuraError::UnknownTraitKind(kind_byte))?;
            let version = reader.read_u64()?;
            let bytes = reader.read_prefixed_bytes()?.to_vec();

            let entry = self.entries.entry(kind);
            match entry {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if version > slot.get().version {
                        slot.insert(TraitInstance { version, bytes });
                        changed += 1;
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(TraitInstance { version, bytes });
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }

    pub fn get(&self, kind: TraitKind) -> Option<&TraitInstance> {
        self.entries.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Traits whose version is newer than what `sent` records.
    pub fn newer_than<'a>(&'a self, sent: &TraitVersions) -> Vec<(TraitKind, &'a TraitInstance)> {
        let mut fresh: Vec<_> = self
            .entries
            .iter()
            .filter(|(kind, instance)| sent.version_of(**kind) < instance.version)
            .map(|(kind, instance)| (*kind, instance))
            .collect();
        fresh.sort_by_key(|(kind, _)| kind.to_byte());
        fresh
    }

    /// Encode the given traits as wire entries (the same layout
    /// SetAvatarTraits uses, reused inside BulkAvatarTraits items).
    pub fn encode_entries(traits: &[(TraitKind, &TraitInstance)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (kind, instance) in traits {
            buf.push(kind.to_byte());
            buf.extend_from_slice(&instance.version.to_le_bytes());
            buf.extend_from_slice(&(instance.bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&instance.bytes);
        }
        buf
    }
}

/// Per-peer record of trait versions already sent.
#[derive(Clone, Debug, Default)]
pub struct TraitVersions {
    versions: HashMap<TraitKind, u64>,
}

impl TraitVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_of(&self, kind: TraitKind) -> u64 {
        self.versions.get(&kind).copied().unwrap_or(0)
    }

    pub fn record(&mut self, kind: TraitKind, version: u64) {
        let slot = self.versions.entry(kind).or_insert(0);
        if version > *slot {
            *slot = version;
        }
    }

    /// Forget everything sent - forces a full trait resync to this peer.
    pub fn reset(&mut self) {
        self.versions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: TraitKind, version: u64, bytes: &[u8]) -> Vec<u8> {
        let instance = TraitInstance {
            version,
            bytes: bytes.to_vec(),
        };
        TraitMap::encode_entries(&[(kind, &instance)])
    }

    #[test]
    fn test_merge_keeps_highest_version() {
        let mut map = TraitMap::new();
        assert_eq!(map.merge_payload(&entry(TraitKind::Grab, 3, b"abc")).unwrap(), 1);
        assert_eq!(map.merge_payload(&entry(TraitKind::Grab, 2, b"old")).unwrap(), 0);
        assert_eq!(map.get(TraitKind::Grab).unwrap().bytes, b"abc");
        assert_eq!(map.merge_payload(&entry(TraitKind::Grab, 4, b"new")).unwrap(), 1);
        assert_eq!(map.get(TraitKind::Grab).unwrap().version, 4);
    }

    #[test]
    fn test_unknown_trait_kind_rejected() {
        let mut map = TraitMap::new();
        let mut payload = entry(TraitKind::Grab, 1, b"x");
        payload[0] = 0x7F;
        assert!(matches!(
            map.merge_payload(&payload),
            Err(AuraError::UnknownTraitKind(0x7F))
        ));
    }

    #[test]
    fn test_newer_than_diffs_sent_state() {
        let mut map = TraitMap::new();
        map.merge_payload(&entry(TraitKind::SkeletonModel, 2, b"m")).unwrap();
        map.merge_payload(&entry(TraitKind::Grab, 5, b"g")).unwrap();

        let mut sent = TraitVersions::new();
        sent.record(TraitKind::SkeletonModel, 2);

        let fresh = map.newer_than(&sent);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, TraitKind::Grab);

        sent.record(TraitKind::Grab, 5);
        assert!(map.newer_than(&sent).is_empty());
    }

    #[test]
    fn test_reset_forces_full_resync() {
        let mut map = TraitMap::new();
        map.merge_payload(&entry(TraitKind::Grab, 1, b"g")).unwrap();

        let mut sent = TraitVersions::new();
        sent.record(TraitKind::Grab, 1);
        assert!(map.newer_than(&sent).is_empty());

        sent.reset();
        assert_eq!(map.newer_than(&sent).len(), 1);
    }

    #[test]
    fn test_record_never_regresses() {
        let mut sent = TraitVersions::new();
        sent.record(TraitKind::Grab, 9);
        sent.record(TraitKind::Grab, 4);
        assert_eq!(sent.version_of(TraitKind::Grab), 9);
    }
}
