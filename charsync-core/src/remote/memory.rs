//! In-process coordination service
//!
//! `MemoryRemote` implements the whole service side of the protocol in
//! memory: accounts and secrets, pair edges, presence, content blobs, upload
//! assembly and event fan-out. It backs the unit and integration tests, the
//! TCP test server, and `charsync serve` for local experiments.
//!
//! A handful of knobs inject the failures the engine has to survive:
//! refused connections, rejected RPCs, slow batch assembly, a throttled
//! upload consumer and dropped connections.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{
    methods, HandshakeResponse, HashParams, HashesParams, IdentityParams, PausePeerParams,
    PeerParams, PushSnapshotParams,
};
use super::{Channels, Connector, ControlChannel, Endpoint, RemoteEvent, TransferChannel};
use crate::errors::{SyncError, SyncResult};
use crate::model::PeerRelationship;
use crate::transfer::codec;

const EVENT_CAPACITY: usize = 256;
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const DOWNLOAD_CAPACITY: usize = 4;

/// A push as the service saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    pub sender_id: String,
    pub fingerprint: String,
    pub peer_ids: Vec<String>,
}

type Delivery = (mpsc::Sender<RemoteEvent>, RemoteEvent);

struct SessionEntry {
    uid: Option<String>,
    secret: Option<String>,
    events: mpsc::Sender<RemoteEvent>,
    closed: CancellationToken,
}

#[derive(Default)]
struct State {
    /// secret -> uid
    users: HashMap<String, String>,
    /// (from, to) -> paused by `from`
    edges: HashMap<(String, String), bool>,
    /// uid -> announced identity, present while online
    identities: HashMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
    partial: HashMap<String, Vec<u8>>,
    size_overrides: HashMap<String, u64>,
    chunks_received: HashMap<String, usize>,
    completion_polls: u32,
    pending_polls: u32,
    calls: Vec<(String, Value)>,
    pushes: Vec<RecordedPush>,
    rejections: HashMap<String, String>,
    failing_opens: u32,
    sessions: HashMap<u64, SessionEntry>,
    next_session: u64,
    chunk_budget: Option<Arc<Semaphore>>,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

fn parse<T: DeserializeOwned>(method: &str, params: Value) -> SyncResult<T> {
    serde_json::from_value(params)
        .map_err(|e| SyncError::rejected(method, format!("invalid params: {}", e)))
}

impl State {
    fn uid_of(&self, session: u64, method: &str) -> SyncResult<String> {
        self.sessions
            .get(&session)
            .and_then(|s| s.uid.clone())
            .ok_or_else(|| SyncError::rejected(method, "handshake required"))
    }

    fn relationship(&self, from: &str, to: &str) -> Option<PeerRelationship> {
        let paused = *self.edges.get(&(from.to_string(), to.to_string()))?;
        let reverse = self.edges.get(&(to.to_string(), from.to_string()));
        Some(PeerRelationship {
            peer_id: to.to_string(),
            is_paused: paused,
            is_paused_by_peer: reverse.copied().unwrap_or(false),
            is_synced: reverse.is_some(),
        })
    }

    fn senders_of(&self, uid: &str) -> Vec<mpsc::Sender<RemoteEvent>> {
        self.sessions
            .values()
            .filter(|s| s.uid.as_deref() == Some(uid) && !s.closed.is_cancelled())
            .map(|s| s.events.clone())
            .collect()
    }

    fn deliver_to(&self, uid: &str, event: RemoteEvent, out: &mut Vec<Delivery>) {
        for tx in self.senders_of(uid) {
            out.push((tx, event.clone()));
        }
    }

    /// Tell both sides of the `a`/`b` pair about their current relationship
    fn notify_pair(&self, a: &str, b: &str, out: &mut Vec<Delivery>) {
        if let Some(rel) = self.relationship(a, b) {
            self.deliver_to(a, RemoteEvent::PeerRelationshipChanged(rel), out);
        }
        if let Some(rel) = self.relationship(b, a) {
            self.deliver_to(b, RemoteEvent::PeerRelationshipChanged(rel), out);
        }
    }

    fn synced_peers(&self, uid: &str) -> Vec<String> {
        self.edges
            .keys()
            .filter(|(from, _)| from == uid)
            .filter_map(|(_, to)| self.relationship(uid, to))
            .filter(|rel| rel.is_synced)
            .map(|rel| rel.peer_id)
            .collect()
    }

    fn handle(
        &mut self,
        session: u64,
        method: &str,
        params: Value,
        out: &mut Vec<Delivery>,
    ) -> SyncResult<Value> {
        if method == methods::HANDSHAKE {
            let entry = self
                .sessions
                .get(&session)
                .ok_or_else(|| SyncError::ChannelClosed("session ended".into()))?;
            let uid = entry
                .secret
                .as_ref()
                .and_then(|secret| self.users.get(secret))
                .cloned()
                .ok_or_else(|| SyncError::rejected(method, "unauthorized"))?;
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.uid = Some(uid.clone());
            }
            let response = HandshakeResponse {
                session_id: Uuid::new_v4().to_string(),
                uid,
            };
            return Ok(serde_json::to_value(response)?);
        }

        if method == methods::REGISTER {
            let uid = Uuid::new_v4().simple().to_string()[..10].to_uppercase();
            let secret = Uuid::new_v4().simple().to_string();
            self.users.insert(secret.clone(), uid);
            return Ok(Value::String(secret));
        }

        let uid = self.uid_of(session, method)?;

        match method {
            methods::PEER_LIST => {
                let peers: Vec<PeerRelationship> = self
                    .edges
                    .keys()
                    .filter(|(from, _)| *from == uid)
                    .filter_map(|(_, to)| self.relationship(&uid, to))
                    .collect();
                Ok(serde_json::to_value(peers)?)
            }
            methods::PUSH_SNAPSHOT => {
                let params: PushSnapshotParams = parse(method, params)?;
                for peer in &params.peer_ids {
                    let accepts = self
                        .relationship(peer, &uid)
                        .is_some_and(|rel| rel.is_active());
                    if accepts {
                        let event = RemoteEvent::PeerDataReceived {
                            sender_id: uid.clone(),
                            snapshot: params.snapshot.clone(),
                        };
                        self.deliver_to(peer, event, out);
                    }
                }
                self.pushes.push(RecordedPush {
                    sender_id: uid,
                    fingerprint: params.snapshot.fingerprint().to_string(),
                    peer_ids: params.peer_ids,
                });
                Ok(Value::Null)
            }
            methods::QUERY_MISSING_HASHES => {
                let params: HashesParams = parse(method, params)?;
                self.pending_polls = self.completion_polls;
                let missing: Vec<String> = params
                    .hashes
                    .into_iter()
                    .filter(|hash| !self.blobs.contains_key(hash))
                    .collect();
                Ok(serde_json::to_value(missing)?)
            }
            methods::IS_UPLOAD_BATCH_COMPLETE => {
                if self.pending_polls > 0 {
                    self.pending_polls -= 1;
                    Ok(Value::Bool(false))
                } else {
                    Ok(Value::Bool(true))
                }
            }
            methods::ABORT_UPLOAD => {
                self.partial.clear();
                self.pending_polls = 0;
                Ok(Value::Null)
            }
            methods::CONTENT_SIZE => {
                let params: HashParams = parse(method, params)?;
                let size = self
                    .size_overrides
                    .get(&params.hash)
                    .copied()
                    .or_else(|| self.blobs.get(&params.hash).map(|b| b.len() as u64))
                    .unwrap_or(0);
                Ok(Value::from(size))
            }
            methods::ANNOUNCE_IDENTITY => {
                let params: IdentityParams = parse(method, params)?;
                self.identities.insert(uid.clone(), params.identity_hash);
                let mut online = Vec::new();
                for peer in self.synced_peers(&uid) {
                    if self.identities.contains_key(&peer) {
                        self.deliver_to(&peer, RemoteEvent::PeerOnline(uid.clone()), out);
                        online.push(peer);
                    }
                }
                online.sort();
                Ok(serde_json::to_value(online)?)
            }
            methods::SET_PEER_PAUSED => {
                let params: PausePeerParams = parse(method, params)?;
                let edge = self
                    .edges
                    .get_mut(&(uid.clone(), params.peer_id.clone()))
                    .ok_or_else(|| SyncError::rejected(method, "not paired"))?;
                *edge = params.paused;
                self.notify_pair(&uid, &params.peer_id, out);
                Ok(Value::Null)
            }
            methods::ADD_PEER => {
                let params: PeerParams = parse(method, params)?;
                let known = self.users.values().any(|u| *u == params.peer_id);
                if params.peer_id == uid || !known {
                    return Err(SyncError::rejected(method, "unknown peer"));
                }
                self.edges
                    .entry((uid.clone(), params.peer_id.clone()))
                    .or_insert(false);
                self.notify_pair(&uid, &params.peer_id, out);
                Ok(Value::Null)
            }
            methods::REMOVE_PEER => {
                let params: PeerParams = parse(method, params)?;
                self.edges.remove(&(uid.clone(), params.peer_id.clone()));
                if let Some(rel) = self.relationship(&params.peer_id, &uid) {
                    self.deliver_to(
                        &params.peer_id,
                        RemoteEvent::PeerRelationshipChanged(rel),
                        out,
                    );
                }
                Ok(Value::Null)
            }
            other => Err(SyncError::rejected(other, "unknown method")),
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    async fn deliver(deliveries: Vec<Delivery>) {
        for (tx, event) in deliveries {
            let _ = tx.send(event).await;
        }
    }

    async fn dispatch(&self, session: u64, method: &str, params: Value) -> SyncResult<Value> {
        let mut deliveries = Vec::new();
        let result = {
            let mut state = self.state.lock();
            state.calls.push((method.to_string(), params.clone()));
            match state.rejections.remove(method) {
                Some(message) => Err(SyncError::rejected(method, message)),
                None => state.handle(session, method, params, &mut deliveries),
            }
        };
        Self::deliver(deliveries).await;
        result
    }

    async fn end_session(&self, session: u64) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.sessions.remove(&session) else {
                return;
            };
            let Some(uid) = entry.uid else {
                return;
            };
            let still_online = state
                .sessions
                .values()
                .any(|s| s.uid.as_deref() == Some(uid.as_str()));
            if !still_online && state.identities.remove(&uid).is_some() {
                for peer in state.synced_peers(&uid) {
                    state.deliver_to(&peer, RemoteEvent::PeerOffline(uid.clone()), &mut deliveries);
                }
            }
        }
        Self::deliver(deliveries).await;
    }

    /// Create an account with a fixed uid; returns its secret
    pub fn add_user(&self, uid: impl Into<String>) -> String {
        let secret = Uuid::new_v4().simple().to_string();
        self.state.lock().users.insert(secret.clone(), uid.into());
        secret
    }

    /// Make `a` and `b` mutually paired and unpaused
    pub fn pair(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        state.edges.insert((a.to_string(), b.to_string()), false);
        state.edges.insert((b.to_string(), a.to_string()), false);
    }

    /// Store raw content as if it had been uploaded
    pub fn insert_blob(&self, hash: impl Into<String>, content: &[u8]) {
        self.state
            .lock()
            .blobs
            .insert(hash.into(), codec::compress(content));
    }

    pub fn has_blob(&self, hash: &str) -> bool {
        self.state.lock().blobs.contains_key(hash)
    }

    /// Decompressed content of a stored blob
    pub fn blob(&self, hash: &str) -> Option<Vec<u8>> {
        let packed = self.state.lock().blobs.get(hash).cloned()?;
        codec::decompress(&packed).ok()
    }

    /// Report `size` from `content_size` regardless of what is stored
    pub fn misreport_size(&self, hash: impl Into<String>, size: u64) {
        self.state.lock().size_overrides.insert(hash.into(), size);
    }

    /// Answer `is_upload_batch_complete` with false `polls` times per batch
    pub fn complete_after_polls(&self, polls: u32) {
        self.state.lock().completion_polls = polls;
    }

    pub fn reject_next(&self, method: &str, message: impl Into<String>) {
        self.state
            .lock()
            .rejections
            .insert(method.to_string(), message.into());
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    /// Let the upload consumer take only `chunks` more chunks until released
    pub fn limit_chunks(&self, chunks: usize) {
        self.state.lock().chunk_budget = Some(Arc::new(Semaphore::new(chunks)));
    }

    pub fn release_chunks(&self, chunks: usize) {
        if let Some(budget) = &self.state.lock().chunk_budget {
            budget.add_permits(chunks);
        }
    }

    pub fn chunks_received(&self, hash: &str) -> usize {
        self.state
            .lock()
            .chunks_received
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    /// Params of every call to `method`, oldest first
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Every method called so far, in order
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn pushes(&self) -> Vec<RecordedPush> {
        self.state.lock().pushes.clone()
    }

    pub fn relationship(&self, from: &str, to: &str) -> Option<PeerRelationship> {
        self.state.lock().relationship(from, to)
    }

    pub fn is_online(&self, uid: &str) -> bool {
        self.state.lock().identities.contains_key(uid)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Push `event` to every open session of `uid`
    pub async fn emit(&self, uid: &str, event: RemoteEvent) {
        let senders = self.state.lock().senders_of(uid);
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Close every open session from the service side
    pub fn drop_connections(&self) {
        let state = self.state.lock();
        for session in state.sessions.values() {
            session.closed.cancel();
        }
    }
}

#[async_trait]
impl Connector for MemoryRemote {
    async fn open(&self, endpoint: &Endpoint) -> SyncResult<Channels> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let closed = CancellationToken::new();

        let session = {
            let mut state = self.state.lock();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(SyncError::ChannelClosed(format!(
                    "connection to {} refused",
                    endpoint.uri
                )));
            }
            state.next_session += 1;
            let session = state.next_session;
            state.sessions.insert(
                session,
                SessionEntry {
                    uid: None,
                    secret: endpoint.secret.clone(),
                    events: events_tx.clone(),
                    closed: closed.clone(),
                },
            );
            session
        };

        let remote = self.clone();
        let watch = closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = events_tx.closed() => watch.cancel(),
            }
            remote.end_session(session).await;
        });

        let control = MemoryControl {
            remote: self.clone(),
            session,
            closed: closed.clone(),
        };
        let transfer = MemoryTransfer {
            remote: self.clone(),
            closed: closed.clone(),
        };

        Ok(Channels {
            control: Arc::new(control),
            transfer: Arc::new(transfer),
            events: events_rx,
            closed,
        })
    }
}

struct MemoryControl {
    remote: MemoryRemote,
    session: u64,
    closed: CancellationToken,
}

#[async_trait]
impl ControlChannel for MemoryControl {
    async fn call(&self, method: &str, params: Value) -> SyncResult<Value> {
        if self.closed.is_cancelled() {
            return Err(SyncError::ChannelClosed("control channel closed".into()));
        }
        self.remote.dispatch(self.session, method, params).await
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct MemoryTransfer {
    remote: MemoryRemote,
    closed: CancellationToken,
}

#[async_trait]
impl TransferChannel for MemoryTransfer {
    async fn upload(
        &self,
        hash: &str,
        total_len: u64,
        mut chunks: mpsc::Receiver<Vec<u8>>,
    ) -> SyncResult<()> {
        self.remote.state.lock().partial.insert(hash.to_string(), Vec::new());

        loop {
            let chunk = tokio::select! {
                chunk = chunks.recv() => chunk,
                _ = self.closed.cancelled() => {
                    return Err(SyncError::ChannelClosed("transfer channel closed".into()));
                }
            };
            let Some(data) = chunk else {
                break;
            };

            let budget = self.remote.state.lock().chunk_budget.clone();
            if let Some(budget) = budget {
                tokio::select! {
                    permit = budget.acquire() => {
                        permit
                            .map_err(|_| SyncError::ChannelClosed("chunk budget closed".into()))?
                            .forget();
                    }
                    _ = self.closed.cancelled() => {
                        return Err(SyncError::ChannelClosed("transfer channel closed".into()));
                    }
                }
            }

            let mut state = self.remote.state.lock();
            let Some(buffer) = state.partial.get_mut(hash) else {
                return Err(SyncError::rejected("upload", "upload aborted"));
            };
            buffer.extend_from_slice(&data);
            *state.chunks_received.entry(hash.to_string()).or_default() += 1;
        }

        let mut state = self.remote.state.lock();
        let data = state
            .partial
            .remove(hash)
            .ok_or_else(|| SyncError::rejected("upload", "upload aborted"))?;
        if data.len() as u64 != total_len {
            return Err(SyncError::rejected(
                "upload",
                format!("expected {} bytes, received {}", total_len, data.len()),
            ));
        }
        state.blobs.insert(hash.to_string(), data);
        Ok(())
    }

    async fn download(&self, hash: &str) -> SyncResult<mpsc::Receiver<Vec<u8>>> {
        if self.closed.is_cancelled() {
            return Err(SyncError::ChannelClosed("transfer channel closed".into()));
        }
        let data = self
            .remote
            .state
            .lock()
            .blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| SyncError::rejected("download", "unknown content"))?;

        let (tx, rx) = mpsc::channel(DOWNLOAD_CAPACITY);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            for chunk in data.chunks(DOWNLOAD_CHUNK_SIZE) {
                tokio::select! {
                    sent = tx.send(chunk.to_vec()) => if sent.is_err() { break },
                    _ = closed.cancelled() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
