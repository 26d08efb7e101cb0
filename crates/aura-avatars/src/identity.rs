//! Identity payload
//!
//! Slow-changing avatar metadata, carried in reliable list packets:
//! - Bytes 0..16: subject avatar UUID
//! - u64 sequence
//! - display name, session display name, skeleton URL (u16-prefixed UTF-8)
//! - attachment bytes (u16-prefixed, opaque)

use aura_core::{AuraResult, NodeId, Timestamp};
use aura_wire::ByteReader;

/// Decoded identity bytes for one avatar.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdentityPayload {
    pub avatar: NodeId,
    pub sequence: u64,
    pub display_name: String,
    pub session_display_name: String,
    pub skeleton_url: String,
    pub attachments: Vec<u8>,
}

impl IdentityPayload {
    pub fn decode(buf: &[u8]) -> AuraResult<Self> {
        let mut reader = ByteReader::new(buf);
        Ok(IdentityPayload {
            avatar: reader.read_node_id()?,
            sequence: reader.read_u64()?,
            display_name: reader.read_prefixed_string()?,
            session_display_name: reader.read_prefixed_string()?,
            skeleton_url: reader.read_prefixed_string()?,
            attachments: reader.read_prefixed_bytes()?.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            16 + 8
                + 6
                + self.display_name.len()
                + self.session_display_name.len()
                + self.skeleton_url.len()
                + 2
                + self.attachments.len(),
        );
        buf.extend_from_slice(&self.avatar.to_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        for s in [
            &self.display_name,
            &self.session_display_name,
            &self.skeleton_url,
        ] {
            buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        buf.extend_from_slice(&(self.attachments.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.attachments);
        buf
    }

    /// Content equality, ignoring sequence and the mixer-assigned session
    /// name. Used to make re-applied identical identity bytes a no-op.
    pub fn same_content(&self, other: &IdentityPayload) -> bool {
        self.display_name == other.display_name
            && self.skeleton_url == other.skeleton_url
            && self.attachments == other.attachments
    }
}

/// Mixer-side identity state for one node.
#[derive(Clone, Debug, Default)]
pub struct IdentityState {
    payload: IdentityPayload,
    received_first: bool,
    last_changed: Timestamp,
}

/// Outcome of applying incoming identity bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityApplied {
    pub changed: bool,
    pub display_name_changed: bool,
}

impl IdentityState {
    /// Apply identity bytes received from the owning client.
    ///
    /// Byte-identical content is a no-op; changed content adopts the new
    /// fields and advances the sequence exactly once, to the max of the
    /// sender's sequence and our own successor. The sequence never
    /// decreases.
    pub fn apply(&mut self, incoming: &IdentityPayload, now: Timestamp) -> IdentityApplied {
        if self.received_first && self.payload.same_content(incoming) {
            return IdentityApplied {
                changed: false,
                display_name_changed: false,
            };
        }

        let display_name_changed =
            !self.received_first || self.payload.display_name != incoming.display_name;

        let next_seq = self.payload.sequence.saturating_add(1).max(incoming.sequence);
        let session = self.payload.session_display_name.clone();
        self.payload = incoming.clone();
        self.payload.sequence = next_seq;
        // the session name is mixer-assigned; the client cannot overwrite it
        self.payload.session_display_name = session;
        self.received_first = true;
        self.last_changed = now;

        IdentityApplied {
            changed: true,
            display_name_changed,
        }
    }

    /// Has the owning client ever sent identity bytes?
    #[inline]
    pub fn received_first(&self) -> bool {
        self.received_first
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.payload.sequence
    }

    /// Advance the sequence after a mixer-side change (rename).
    pub fn push_sequence(&mut self) {
        self.payload.sequence = self.payload.sequence.saturating_add(1);
    }

    #[inline]
    pub fn payload(&self) -> &IdentityPayload {
        &self.payload
    }

    pub fn display_name(&self) -> &str {
        &self.payload.display_name
    }

    pub fn session_display_name(&self) -> &str {
        &self.payload.session_display_name
    }

    pub fn set_session_display_name(&mut self, name: String) {
        self.payload.session_display_name = name;
    }

    pub fn skeleton_url(&self) -> &str {
        &self.payload.skeleton_url
    }

    /// Swap the skeleton URL for the domain replacement (whitelist miss).
    pub fn replace_skeleton_url(&mut self, url: String) {
        self.payload.skeleton_url = url;
    }

    /// Wire bytes for this node's identity, with the subject id stamped in.
    pub fn encode_for(&self, subject: NodeId) -> Vec<u8> {
        let mut payload = self.payload.clone();
        payload.avatar = subject;
        payload.encode()
    }
}
