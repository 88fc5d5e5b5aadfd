use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::protocol::{
    methods, HandshakeResponse, HashParams, HashesParams, IdentityParams, PausePeerParams,
    PeerParams, PushSnapshotParams,
};
use super::ControlChannel;
use crate::errors::SyncResult;
use crate::model::{CharacterSnapshot, PeerRelationship};

/// Typed RPCs over a [`ControlChannel`]
#[derive(Clone)]
pub struct ControlClient {
    channel: Arc<dyn ControlChannel>,
}

impl ControlClient {
    pub fn new(channel: Arc<dyn ControlChannel>) -> Self {
        Self { channel }
    }

    async fn invoke<P, R>(&self, method: &str, params: &P) -> SyncResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.channel.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn handshake(&self) -> SyncResult<HandshakeResponse> {
        self.invoke(methods::HANDSHAKE, &()).await
    }

    pub async fn peer_list(&self) -> SyncResult<Vec<PeerRelationship>> {
        self.invoke(methods::PEER_LIST, &()).await
    }

    pub async fn push_snapshot(
        &self,
        snapshot: &CharacterSnapshot,
        peer_ids: &[String],
    ) -> SyncResult<()> {
        let params = PushSnapshotParams {
            snapshot: snapshot.clone(),
            peer_ids: peer_ids.to_vec(),
        };
        self.invoke(methods::PUSH_SNAPSHOT, &params).await
    }

    /// The subset of `hashes` the service does not hold
    pub async fn query_missing_hashes(&self, hashes: &[String]) -> SyncResult<Vec<String>> {
        let params = HashesParams {
            hashes: hashes.to_vec(),
        };
        self.invoke(methods::QUERY_MISSING_HASHES, &params).await
    }

    pub async fn is_upload_batch_complete(&self) -> SyncResult<bool> {
        self.invoke(methods::IS_UPLOAD_BATCH_COMPLETE, &()).await
    }

    pub async fn abort_upload(&self) -> SyncResult<()> {
        self.invoke(methods::ABORT_UPLOAD, &()).await
    }

    /// Stored size of `hash`, 0 when the service does not have it
    pub async fn content_size(&self, hash: &str) -> SyncResult<u64> {
        let params = HashParams {
            hash: hash.to_string(),
        };
        self.invoke(methods::CONTENT_SIZE, &params).await
    }

    /// Ask the service for a new account; returns its secret
    pub async fn register(&self) -> SyncResult<String> {
        self.invoke(methods::REGISTER, &()).await
    }

    pub async fn announce_identity(&self, identity_hash: &str) -> SyncResult<Vec<String>> {
        let params = IdentityParams {
            identity_hash: identity_hash.to_string(),
        };
        self.invoke(methods::ANNOUNCE_IDENTITY, &params).await
    }

    pub async fn set_peer_paused(&self, peer_id: &str, paused: bool) -> SyncResult<()> {
        let params = PausePeerParams {
            peer_id: peer_id.to_string(),
            paused,
        };
        self.invoke(methods::SET_PEER_PAUSED, &params).await
    }

    pub async fn add_peer(&self, peer_id: &str) -> SyncResult<()> {
        let params = PeerParams {
            peer_id: peer_id.to_string(),
        };
        self.invoke(methods::ADD_PEER, &params).await
    }

    pub async fn remove_peer(&self, peer_id: &str) -> SyncResult<()> {
        let params = PeerParams {
            peer_id: peer_id.to_string(),
        };
        self.invoke(methods::REMOVE_PEER, &params).await
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}
