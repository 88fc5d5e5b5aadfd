use parking_lot::Mutex;
use std::collections::HashMap;

use crate::model::{Direction, TransferTicket};

/// Live tickets for one direction, keyed by content hash
pub struct TicketBoard {
    direction: Direction,
    tickets: Mutex<HashMap<String, TransferTicket>>,
}

impl TicketBoard {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            tickets: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, hash: &str, total_bytes: u64) {
        self.tickets.lock().insert(
            hash.to_string(),
            TransferTicket::new(hash, total_bytes, self.direction),
        );
    }

    /// Returns the new transferred count, or `None` if the ticket is gone
    pub fn advance(&self, hash: &str, bytes: u64) -> Option<u64> {
        self.tickets
            .lock()
            .get_mut(hash)
            .map(|ticket| ticket.advance(bytes))
    }

    pub fn remove(&self, hash: &str) {
        self.tickets.lock().remove(hash);
    }

    pub fn clear(&self) {
        self.tickets.lock().clear();
    }

    pub fn get(&self, hash: &str) -> Option<TransferTicket> {
        self.tickets.lock().get(hash).cloned()
    }

    pub fn snapshot(&self) -> Vec<TransferTicket> {
        let mut tickets: Vec<_> = self.tickets.lock().values().cloned().collect();
        tickets.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        tickets
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}
