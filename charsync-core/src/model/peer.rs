use serde::{Deserialize, Serialize};

/// Pairing state between this client and one remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRelationship {
    pub peer_id: String,
    /// Paused by us
    pub is_paused: bool,
    pub is_paused_by_peer: bool,
    /// Both sides have added each other
    pub is_synced: bool,
}

impl PeerRelationship {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            is_paused: false,
            is_paused_by_peer: false,
            is_synced: false,
        }
    }

    /// Synced and paused by neither side
    pub fn is_active(&self) -> bool {
        self.is_synced && !self.is_paused && !self.is_paused_by_peer
    }

    pub fn same_flags(&self, other: &PeerRelationship) -> bool {
        self.is_paused == other.is_paused
            && self.is_paused_by_peer == other.is_paused_by_peer
            && self.is_synced == other.is_synced
    }
}
