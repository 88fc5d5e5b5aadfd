use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

/// Progress of one hash moving in one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTicket {
    pub content_hash: String,
    pub total_bytes: u64,
    transferred_bytes: u64,
    pub direction: Direction,
}

impl TransferTicket {
    pub fn new(content_hash: impl Into<String>, total_bytes: u64, direction: Direction) -> Self {
        Self {
            content_hash: content_hash.into(),
            total_bytes,
            transferred_bytes: 0,
            direction,
        }
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    /// Count `bytes` more as transferred, never passing `total_bytes`
    pub fn advance(&mut self, bytes: u64) -> u64 {
        self.transferred_bytes = self
            .transferred_bytes
            .saturating_add(bytes)
            .min(self.total_bytes);
        self.transferred_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes == self.total_bytes
    }
}
