/*
    remote - network surface of the coordination service

    The engine talks to the service through two channels opened together:

    - control: request/response RPCs plus a stream of pushed events
    - transfer: chunked upload and download streams keyed by content hash

    Both are trait objects so the session layer does not care whether they run
    over TCP (`tcp`) or in-process (`memory`). A `Connector` opens a fresh pair
    for an endpoint; the returned `closed` token fires when either side goes
    away, which is what drives reconnection.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::SyncResult;
use crate::model::{CharacterSnapshot, PeerRelationship};

mod control;
pub mod memory;
pub mod protocol;
pub mod tcp;

pub use control::ControlClient;
pub use memory::MemoryRemote;
pub use tcp::TcpConnector;

/// Where to connect and the secret to present when opening channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uri: String,
    pub secret: Option<String>,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            secret,
        }
    }
}

/// Notifications pushed by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteEvent {
    PeerDataReceived {
        sender_id: String,
        snapshot: CharacterSnapshot,
    },
    PeerRelationshipChanged(PeerRelationship),
    PeerOnline(String),
    PeerOffline(String),
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Invoke `method` with JSON `params`, returning the JSON result
    async fn call(&self, method: &str, params: serde_json::Value) -> SyncResult<serde_json::Value>;

    async fn close(&self);
}

#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Stream `chunks` for `hash` until the sender side is dropped. The
    /// service keeps the blob only if exactly `total_len` bytes arrived.
    async fn upload(
        &self,
        hash: &str,
        total_len: u64,
        chunks: mpsc::Receiver<Vec<u8>>,
    ) -> SyncResult<()>;

    /// Open a download stream. The receiver ends when the service has sent
    /// everything it holds, or early if the stream breaks.
    async fn download(&self, hash: &str) -> SyncResult<mpsc::Receiver<Vec<u8>>>;

    async fn close(&self);
}

/// A connected channel pair
pub struct Channels {
    pub control: Arc<dyn ControlChannel>,
    pub transfer: Arc<dyn TransferChannel>,
    pub events: mpsc::Receiver<RemoteEvent>,
    /// Cancelled once either channel is closed
    pub closed: CancellationToken,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> SyncResult<Channels>;
}
