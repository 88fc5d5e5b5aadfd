//! Character customization sync engine
//!
//! Publishes the local player's appearance to paired peers through a
//! coordination service and fetches the content their snapshots reference.

pub mod client;
pub mod config;
pub mod detector;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pairing;
pub mod remote;
pub mod session;
pub mod store;
pub mod transfer;

pub use client::{ClientEvents, PeerData, SyncClient};
pub use config::Config;
pub use detector::{ChangeDetector, CycleOutcome, SnapshotSource};
pub use errors::{SyncError, SyncResult};
pub use logging::{init_logging, LogLevel};
pub use model::{CharacterData, CharacterSnapshot, PeerRelationship};
pub use pairing::{PairingNotification, PairingTracker};
pub use session::{SessionEvent, SessionManager, SessionState};
pub use transfer::TransferEngine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = SessionState::Disconnected;
    }
}
