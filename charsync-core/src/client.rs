//! SyncClient: one object owning the whole engine
//!
//! Wires the content store, session, transfer engine, pairing tracker and
//! change detector together and routes session notifications between them.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::detector::{ChangeDetector, SnapshotSource};
use crate::errors::SyncResult;
use crate::model::CharacterSnapshot;
use crate::pairing::{PairingNotification, PairingTracker};
use crate::remote::{Connector, TcpConnector};
use crate::session::{SessionEvent, SessionManager, Subscription};
use crate::store::{Blake3Hasher, ContentHasher, ContentStore};
use crate::transfer::{DownloadReport, TransferEngine};

/// Character data a paired peer pushed to us
#[derive(Debug, Clone, PartialEq)]
pub struct PeerData {
    pub sender_id: String,
    pub snapshot: CharacterSnapshot,
}

/// Receivers handed to the application
pub struct ClientEvents {
    pub peer_data: mpsc::UnboundedReceiver<PeerData>,
    pub pairing: mpsc::UnboundedReceiver<PairingNotification>,
}

pub struct SyncClient {
    session: SessionManager,
    engine: TransferEngine,
    pairing: PairingTracker,
    detector: ChangeDetector,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Client over TCP using the configured service endpoint
    pub fn connect_tcp(
        config: &Config,
        source: Arc<dyn SnapshotSource>,
    ) -> SyncResult<(Self, ClientEvents)> {
        let connector = Arc::new(TcpConnector::new(config.session.rpc_timeout));
        Self::with_connector(config, connector, source, Arc::new(Blake3Hasher))
    }

    /// Must be called from within a tokio runtime
    pub fn with_connector(
        config: &Config,
        connector: Arc<dyn Connector>,
        source: Arc<dyn SnapshotSource>,
        hasher: Arc<dyn ContentHasher>,
    ) -> SyncResult<(Self, ClientEvents)> {
        config.validate()?;

        let store = Arc::new(ContentStore::open(&config.transfer.cache_dir)?);
        let session = SessionManager::new(
            connector,
            config.server.endpoint(),
            config.session.clone(),
        );
        let engine = TransferEngine::new(session.clone(), store, config.transfer.clone());
        let (pairing, pairing_rx) = PairingTracker::new();
        let detector = ChangeDetector::new(
            session.clone(),
            engine.clone(),
            source,
            hasher,
            config.detector.clone(),
        );

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(
            session.subscribe(),
            pairing.clone(),
            detector.clone(),
            peer_tx,
        ));

        let client = Self {
            session,
            engine,
            pairing,
            detector,
            pump: Mutex::new(Some(pump)),
        };
        let events = ClientEvents {
            peer_data: peer_rx,
            pairing: pairing_rx,
        };
        Ok((client, events))
    }

    pub async fn connect(&self) -> SyncResult<()> {
        self.session.connect().await
    }

    /// Local state changed; publish if nothing is in flight
    pub fn notify_changed(&self) -> bool {
        self.detector.notify_changed()
    }

    /// Fetch every asset of `snapshot` missing from the local store
    pub async fn download_for(&self, snapshot: &CharacterSnapshot) -> SyncResult<DownloadReport> {
        self.engine.download(&snapshot.content_assets()).await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn pairing(&self) -> &PairingTracker {
        &self.pairing
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub async fn shutdown(&self) {
        self.detector.shutdown().await;
        self.engine.cancel_upload();
        self.session.shutdown().await;

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
    }
}

async fn pump_events(
    mut events: Subscription,
    pairing: PairingTracker,
    detector: ChangeDetector,
    peer_data: mpsc::UnboundedSender<PeerData>,
) {
    while let Some(event) = events.recv().await {
        pairing.handle_event(&event);

        match event {
            SessionEvent::Connected { session_id, .. } => {
                debug!(session_id = %session_id, "New session, forgetting last push");
                detector.reset();
            }
            SessionEvent::PeerDataReceived {
                sender_id,
                snapshot,
            } => {
                if !snapshot.is_consistent() {
                    warn!(sender = %sender_id, "Dropping snapshot with mismatched fingerprint");
                    continue;
                }
                let _ = peer_data.send(PeerData {
                    sender_id,
                    snapshot,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CharacterData;
    use crate::remote::MemoryRemote;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl SnapshotSource for EmptySource {
        async fn build(&self) -> SyncResult<CharacterData> {
            Ok(CharacterData::new())
        }

        async fn visible_peers(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_connect_loads_pairing_and_shutdown_stops() {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        remote.add_user("BOB");
        remote.pair("ALICE", "BOB");

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.set_secret(secret);
        config.transfer.cache_dir = dir.path().to_path_buf();

        let (client, _events) = SyncClient::with_connector(
            &config,
            Arc::new(remote.clone()),
            Arc::new(EmptySource),
            Arc::new(Blake3Hasher),
        )
        .unwrap();

        client.connect().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while client.pairing().get("BOB").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(client.pairing().get("BOB").unwrap().is_active());

        client.shutdown().await;
        assert!(!client.session().is_connected());
        assert!(!client.notify_changed());
    }
}
