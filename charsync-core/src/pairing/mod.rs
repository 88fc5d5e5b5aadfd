//! Known peers and their pause/sync/online state
//!
//! The tracker is fed from session notifications. It keeps one
//! [`PeerRelationship`] per peer the service reported in the last peer list
//! and reconciles relationship updates into `Paired`/`Unpaired` notifications.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::PeerRelationship;
use crate::session::{SessionEvent, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingNotification {
    Paired(String),
    Unpaired(String),
}

#[derive(Default)]
struct Peers {
    relationships: BTreeMap<String, PeerRelationship>,
    online: BTreeSet<String>,
}

#[derive(Clone)]
pub struct PairingTracker {
    peers: Arc<Mutex<Peers>>,
    notify: mpsc::UnboundedSender<PairingNotification>,
}

impl PairingTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PairingNotification>) {
        let (notify, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: Arc::new(Mutex::new(Peers::default())),
                notify,
            },
            rx,
        )
    }

    /// Replace the known peers with a freshly fetched list
    pub fn load(&self, relationships: Vec<PeerRelationship>) {
        let mut peers = self.peers.lock();
        peers.relationships = relationships
            .into_iter()
            .map(|rel| (rel.peer_id.clone(), rel))
            .collect();
        peers.online.clear();
        debug!(count = peers.relationships.len(), "Loaded peer list");
    }

    /// Reconcile one relationship update and return what was emitted
    ///
    /// An update for a peer we do not know yields `Unpaired` and creates no
    /// entry. Contradictory input can yield both notifications.
    pub fn apply(&self, update: &PeerRelationship) -> Vec<PairingNotification> {
        let mut emitted = Vec::new();
        {
            let mut peers = self.peers.lock();
            match peers.relationships.get_mut(&update.peer_id) {
                None => {
                    emitted.push(PairingNotification::Unpaired(update.peer_id.clone()));
                }
                Some(stored) => {
                    if !stored.same_flags(update) && update.is_active() {
                        emitted.push(PairingNotification::Paired(update.peer_id.clone()));
                    }
                    stored.is_paused = update.is_paused;
                    stored.is_paused_by_peer = update.is_paused_by_peer;
                    stored.is_synced = update.is_synced;
                    if !stored.is_active() {
                        emitted.push(PairingNotification::Unpaired(update.peer_id.clone()));
                    }
                }
            }
        }

        for notification in &emitted {
            info!(notification = ?notification, "Pairing changed");
            let _ = self.notify.send(notification.clone());
        }
        emitted
    }

    /// Drop a peer entirely, e.g. after `remove_peer`
    pub fn forget(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.lock();
        peers.online.remove(peer_id);
        peers.relationships.remove(peer_id).is_some()
    }

    pub fn set_online(&self, peer_id: &str, online: bool) {
        let mut peers = self.peers.lock();
        if online {
            peers.online.insert(peer_id.to_string());
        } else {
            peers.online.remove(peer_id);
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRelationship> {
        self.peers.lock().relationships.get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<PeerRelationship> {
        self.peers.lock().relationships.values().cloned().collect()
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.peers.lock().online.contains(peer_id)
    }

    /// Active peers currently online, the audience for a push
    pub fn visible_peers(&self) -> Vec<String> {
        let peers = self.peers.lock();
        peers
            .relationships
            .values()
            .filter(|rel| rel.is_active() && peers.online.contains(&rel.peer_id))
            .map(|rel| rel.peer_id.clone())
            .collect()
    }

    pub fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Connected { peers, .. } => self.load(peers.clone()),
            SessionEvent::Disconnected => self.peers.lock().online.clear(),
            SessionEvent::PeerRelationshipChanged(rel) => {
                self.apply(rel);
            }
            SessionEvent::PeerOnline(peer) => self.set_online(peer, true),
            SessionEvent::PeerOffline(peer) => self.set_online(peer, false),
            SessionEvent::PeerDataReceived { .. } => {}
        }
    }

    /// Follow a session subscription until it closes
    pub fn spawn(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                tracker.handle_event(&event);
            }
        })
    }
}
