/*
    protocol.rs - RPC vocabulary and wire framing

    Every frame on the wire is `[len:4 big endian][bincode Frame]`. RPC params
    and results are carried as JSON bytes inside the frame so the method set
    can grow without touching the framing.
*/

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RemoteEvent;
use crate::errors::{SyncError, SyncResult};
use crate::model::CharacterSnapshot;

/// Upper bound on one frame, comfortably above a full upload chunk
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub mod methods {
    pub const HANDSHAKE: &str = "handshake";
    pub const PEER_LIST: &str = "peer_list";
    pub const PUSH_SNAPSHOT: &str = "push_snapshot";
    pub const QUERY_MISSING_HASHES: &str = "query_missing_hashes";
    pub const IS_UPLOAD_BATCH_COMPLETE: &str = "is_upload_batch_complete";
    pub const ABORT_UPLOAD: &str = "abort_upload";
    pub const CONTENT_SIZE: &str = "content_size";
    pub const REGISTER: &str = "register";
    pub const ANNOUNCE_IDENTITY: &str = "announce_identity";
    pub const SET_PEER_PAUSED: &str = "set_peer_paused";
    pub const ADD_PEER: &str = "add_peer";
    pub const REMOVE_PEER: &str = "remove_peer";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub session_id: String,
    /// Identity the service knows this client by
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSnapshotParams {
    pub snapshot: CharacterSnapshot,
    pub peer_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashesParams {
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashParams {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerParams {
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausePeerParams {
    pub peer_id: String,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityParams {
    pub identity_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Control,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection. Both connections of one link carry
    /// the same `link_id`.
    Hello {
        link_id: String,
        channel: ChannelKind,
        secret: Option<String>,
    },
    Request {
        id: u64,
        method: String,
        params: Vec<u8>,
    },
    Response {
        id: u64,
        result: Result<Vec<u8>, String>,
    },
    Event(RemoteEvent),
    UploadBegin {
        hash: String,
        total: u64,
    },
    UploadChunk {
        hash: String,
        data: Vec<u8>,
    },
    UploadEnd {
        hash: String,
    },
    UploadAck {
        hash: String,
        result: Result<(), String>,
    },
    DownloadOpen {
        id: u64,
        hash: String,
    },
    DownloadChunk {
        id: u64,
        data: Vec<u8>,
    },
    DownloadEnd {
        id: u64,
        error: Option<String>,
    },
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> SyncResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(Some(bincode::deserialize(&bytes)?))
}
