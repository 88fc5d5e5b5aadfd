/*
    SessionManager - connection lifecycle with the coordination service

    State machine:

        Disconnected --connect()--> Connecting --ok--> Connected(session_id)
                                        |
                                        +--attempts exhausted--> Disconnected

        Connected --channel closed--> Reconnecting --ok--> Connected
                                           |
                                           +--attempts exhausted--> Disconnected

        any --shutdown()--> Disconnected (terminal)

    Establishing a link means: open both channels, handshake for a session id,
    fetch the peer list, then publish `Connected`. A supervisor task owns the
    inbound event stream of the live link; it fans events out to subscribers
    in arrival order and drives reconnection when the link closes.

    Nothing is buffered across a disconnect: operations outside `Connected`
    fail with `NotConnected`.
*/

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::{SyncError, SyncResult};
use crate::metrics::{self, SESSION_RECONNECTS};
use crate::model::{CharacterSnapshot, PeerRelationship};
use crate::remote::{Connector, ControlClient, Endpoint, RemoteEvent, TransferChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { session_id: String },
    Reconnecting,
}

/// Notifications delivered to every subscriber, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        session_id: String,
        uid: String,
        peers: Vec<PeerRelationship>,
    },
    Disconnected,
    PeerDataReceived {
        sender_id: String,
        snapshot: CharacterSnapshot,
    },
    PeerRelationshipChanged(PeerRelationship),
    PeerOnline(String),
    PeerOffline(String),
}

impl From<RemoteEvent> for SessionEvent {
    fn from(event: RemoteEvent) -> Self {
        match event {
            RemoteEvent::PeerDataReceived {
                sender_id,
                snapshot,
            } => SessionEvent::PeerDataReceived {
                sender_id,
                snapshot,
            },
            RemoteEvent::PeerRelationshipChanged(rel) => SessionEvent::PeerRelationshipChanged(rel),
            RemoteEvent::PeerOnline(peer) => SessionEvent::PeerOnline(peer),
            RemoteEvent::PeerOffline(peer) => SessionEvent::PeerOffline(peer),
        }
    }
}

/// Receiving end of a subscription; dropping it unsubscribes
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// The live channel pair of a connected session
#[derive(Clone)]
pub struct Link {
    pub control: ControlClient,
    pub transfer: Arc<dyn TransferChannel>,
    pub session_id: String,
    pub uid: String,
    /// Fires when this link goes away
    pub closed: CancellationToken,
}

impl Link {
    async fn close(&self) {
        self.closed.cancel();
        self.control.close().await;
        self.transfer.close().await;
    }
}

struct Established {
    link: Link,
    events: mpsc::Receiver<RemoteEvent>,
    peers: Vec<PeerRelationship>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    endpoint: RwLock<Endpoint>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    link: RwLock<Option<Link>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, endpoint: Endpoint, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                endpoint: RwLock::new(endpoint),
                config,
                state,
                link: RwLock::new(None),
                subscribers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected { .. })
    }

    pub fn session_id(&self) -> Option<String> {
        match self.state() {
            SessionState::Connected { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.read().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        Subscription { rx }
    }

    fn broadcast(&self, event: SessionEvent) {
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&self, state: SessionState) {
        debug!(state = ?state, "Session state changed");
        self.inner.state.send_replace(state);
    }

    /// Connect if disconnected. Calling this while a connection attempt is
    /// running waits for that attempt; calling it while connected is a no-op.
    pub async fn connect(&self) -> SyncResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let started = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return self.wait_settled().await;
        }

        info!(uri = %self.endpoint().uri, "Connecting to sync service");
        match self.establish().await {
            Ok(established) => {
                let events = established.events;
                let closed = established.link.closed.clone();
                self.install(established.link, established.peers);

                let manager = self.clone();
                let handle = tokio::spawn(manager.supervise(events, closed));
                if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
                    previous.abort();
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connection failed");
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn wait_settled(&self) -> SyncResult<()> {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|s| {
                matches!(
                    s,
                    SessionState::Connected { .. } | SessionState::Disconnected
                )
            })
            .await
            .map_err(|_| SyncError::Cancelled)?
            .clone();
        match settled {
            SessionState::Connected { .. } => Ok(()),
            _ => Err(SyncError::NotConnected),
        }
    }

    /// Run the bounded attempt policy against the current endpoint
    async fn establish(&self) -> SyncResult<Established> {
        let attempts = self.inner.config.handshake_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.inner.shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let endpoint = self.endpoint();
            match self.try_establish(&endpoint).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.config.retry_delay) => {}
                    _ = self.inner.shutdown.cancelled() => return Err(SyncError::Cancelled),
                }
            }
        }

        Err(SyncError::HandshakeFailed {
            attempts,
            reason: last_error,
        })
    }

    async fn try_establish(&self, endpoint: &Endpoint) -> SyncResult<Established> {
        let channels = self.inner.connector.open(endpoint).await?;
        let control = ControlClient::new(channels.control);

        let handshake = async {
            let hello = control.handshake().await?;
            let peers = control.peer_list().await?;
            Ok::<_, SyncError>((hello, peers))
        };

        match handshake.await {
            Ok((hello, peers)) => Ok(Established {
                link: Link {
                    control,
                    transfer: channels.transfer,
                    session_id: hello.session_id,
                    uid: hello.uid,
                    closed: channels.closed,
                },
                events: channels.events,
                peers,
            }),
            Err(e) => {
                channels.closed.cancel();
                control.close().await;
                channels.transfer.close().await;
                Err(e)
            }
        }
    }

    fn install(&self, link: Link, peers: Vec<PeerRelationship>) {
        let session_id = link.session_id.clone();
        let uid = link.uid.clone();
        *self.inner.link.write() = Some(link);
        self.set_state(SessionState::Connected {
            session_id: session_id.clone(),
        });
        info!(session_id = %session_id, uid = %uid, peers = peers.len(), "Connected");
        self.broadcast(SessionEvent::Connected {
            session_id,
            uid,
            peers,
        });
    }

    async fn supervise(self, mut events: mpsc::Receiver<RemoteEvent>, mut closed: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return,
                event = events.recv() => {
                    if let Some(event) = event {
                        self.broadcast(event.into());
                        continue;
                    }
                }
                _ = closed.cancelled() => {}
            }

            while let Ok(event) = events.try_recv() {
                self.broadcast(event.into());
            }

            self.set_state(SessionState::Reconnecting);
            let stale = self.inner.link.write().take();
            if let Some(link) = stale {
                link.close().await;
            }
            closed.cancel();
            warn!("Link to sync service lost, reconnecting");
            self.broadcast(SessionEvent::Disconnected);
            metrics::record_counter(SESSION_RECONNECTS, 1);

            match self.establish().await {
                Ok(established) => {
                    events = established.events;
                    closed = established.link.closed.clone();
                    self.install(established.link, established.peers);
                }
                Err(SyncError::Cancelled) => return,
                Err(e) => {
                    warn!(error = %e, "Reconnect failed, giving up");
                    self.set_state(SessionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// The live link, or `NotConnected`
    pub fn link(&self) -> SyncResult<Link> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.inner
            .link
            .read()
            .clone()
            .ok_or(SyncError::NotConnected)
    }

    pub async fn push_snapshot(
        &self,
        snapshot: &CharacterSnapshot,
        peer_ids: &[String],
    ) -> SyncResult<()> {
        let link = self.link()?;
        debug!(
            fingerprint = %snapshot.fingerprint(),
            peers = peer_ids.len(),
            "Pushing snapshot"
        );
        link.control.push_snapshot(snapshot, peer_ids).await
    }

    pub async fn request_peer_list(&self) -> SyncResult<Vec<PeerRelationship>> {
        self.link()?.control.peer_list().await
    }

    /// Tell the service which character this client plays; returns the
    /// paired peers currently online
    pub async fn announce_identity(&self, identity_hash: &str) -> SyncResult<Vec<String>> {
        self.link()?.control.announce_identity(identity_hash).await
    }

    pub async fn set_peer_paused(&self, peer_id: &str, paused: bool) -> SyncResult<()> {
        self.link()?.control.set_peer_paused(peer_id, paused).await
    }

    pub async fn add_peer(&self, peer_id: &str) -> SyncResult<()> {
        self.link()?.control.add_peer(peer_id).await
    }

    pub async fn remove_peer(&self, peer_id: &str) -> SyncResult<()> {
        self.link()?.control.remove_peer(peer_id).await
    }

    /// Obtain a new account secret from the service and switch to it. A
    /// live session is restarted so it re-authenticates with the new secret.
    pub async fn register(&self) -> SyncResult<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let endpoint = Endpoint::new(self.endpoint().uri, None);
        let channels = self.inner.connector.open(&endpoint).await?;
        let control = ControlClient::new(channels.control);
        let result = control.register().await;
        channels.closed.cancel();
        control.close().await;
        channels.transfer.close().await;
        let secret = result?;

        self.inner.endpoint.write().secret = Some(secret.clone());
        info!("Registered with sync service");

        let live = self.inner.link.read().clone();
        if let Some(link) = live {
            link.closed.cancel();
        }
        Ok(secret)
    }

    /// Close the session for good. Further `connect` calls fail.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let link = self.inner.link.write().take();
        if let Some(link) = link {
            link.close().await;
        }
        self.set_state(SessionState::Disconnected);
        info!("Session shut down");
    }
}
