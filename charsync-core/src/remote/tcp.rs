/*
    tcp.rs - TCP transport for the control and transfer channels

    Client side (`TcpConnector`): one link is two TCP connections sharing a
    link id. Each connection gets a writer task (frames queued through an
    mpsc so a dropped caller can never tear a frame) and a reader task that
    routes responses, events and download chunks. Either reader hitting EOF
    or an error cancels the link's `closed` token and fails pending calls.

    Server side (`serve`): accepts links and bridges them onto a
    `MemoryRemote`, one in-memory session per link.

    ┌────────────┐  control conn   ┌────────────┐
    │ TcpControl │ ◄─────────────► │            │
    └────────────┘                 │   serve    │──► MemoryRemote
    ┌────────────┐  transfer conn  │            │
    │TcpTransfer │ ◄─────────────► │            │
    └────────────┘                 └────────────┘
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{read_frame, write_frame, ChannelKind, Frame};
use super::{
    Channels, Connector, ControlChannel, Endpoint, MemoryRemote, RemoteEvent, TransferChannel,
};
use crate::errors::{SyncError, SyncResult};

const WRITE_QUEUE: usize = 64;
const EVENT_CAPACITY: usize = 256;
const DOWNLOAD_CAPACITY: usize = 8;
const UPLOAD_CAPACITY: usize = 8;

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, String>>>>>;
type PendingUploads = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;
type OpenDownloads = Arc<Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>;

/// Strip an optional `tcp://` scheme
fn socket_addr(uri: &str) -> &str {
    uri.strip_prefix("tcp://").unwrap_or(uri)
}

/// Spawn the task that owns the write half of a connection
fn spawn_writer<W>(mut writer: W, closed: CancellationToken) -> mpsc::Sender<Frame>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITE_QUEUE);
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "Write failed, closing link");
                closed.cancel();
                break;
            }
        }
    });
    tx
}

async fn send_frame(writer: &mpsc::Sender<Frame>, frame: Frame) -> SyncResult<()> {
    writer
        .send(frame)
        .await
        .map_err(|_| SyncError::ChannelClosed("connection writer stopped".into()))
}

/// Opens links to a TCP coordination service
#[derive(Debug, Clone)]
pub struct TcpConnector {
    rpc_timeout: Duration,
}

impl TcpConnector {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }

    async fn dial(
        addr: &str,
        link_id: &str,
        channel: ChannelKind,
        secret: &Option<String>,
    ) -> SyncResult<TcpStream> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::ChannelClosed(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let hello = Frame::Hello {
            link_id: link_id.to_string(),
            channel,
            secret: secret.clone(),
        };
        write_frame(&mut stream, &hello).await?;
        Ok(stream)
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, endpoint: &Endpoint) -> SyncResult<Channels> {
        let addr = socket_addr(&endpoint.uri);
        let link_id = Uuid::new_v4().to_string();

        let control_stream =
            Self::dial(addr, &link_id, ChannelKind::Control, &endpoint.secret).await?;
        let transfer_stream =
            Self::dial(addr, &link_id, ChannelKind::Transfer, &endpoint.secret).await?;

        debug!(addr = %addr, link_id = %link_id, "Link established");

        let closed = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let control = TcpControl::start(control_stream, events_tx, self.rpc_timeout, closed.clone());
        let transfer = TcpTransfer::start(transfer_stream, closed.clone());

        Ok(Channels {
            control: Arc::new(control),
            transfer: Arc::new(transfer),
            events: events_rx,
            closed,
        })
    }
}

struct TcpControl {
    writer: mpsc::Sender<Frame>,
    pending: PendingCalls,
    next_id: AtomicU64,
    rpc_timeout: Duration,
    closed: CancellationToken,
}

impl TcpControl {
    fn start(
        stream: TcpStream,
        events: mpsc::Sender<RemoteEvent>,
        rpc_timeout: Duration,
        closed: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let writer = spawn_writer(writer, closed.clone());
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::read_loop(reader, pending.clone(), events, closed.clone()));

        Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            rpc_timeout,
            closed,
        }
    }

    async fn read_loop<R>(
        mut reader: R,
        pending: PendingCalls,
        events: mpsc::Sender<RemoteEvent>,
        closed: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(Frame::Response { id, result })) => {
                    if let Some(tx) = pending.lock().remove(&id) {
                        let _ = tx.send(result);
                    }
                }
                Ok(Some(Frame::Event(event))) => {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Some(other)) => warn!(frame = ?other, "Unexpected frame on control channel"),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Control channel read failed");
                    break;
                }
            }
        }

        closed.cancel();
        pending.lock().clear();
    }
}

#[async_trait]
impl ControlChannel for TcpControl {
    async fn call(&self, method: &str, params: serde_json::Value) -> SyncResult<serde_json::Value> {
        if self.closed.is_cancelled() {
            return Err(SyncError::ChannelClosed("control channel closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = Frame::Request {
            id,
            method: method.to_string(),
            params: serde_json::to_vec(&params)?,
        };
        if let Err(e) = send_frame(&self.writer, request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(Ok(bytes))) => Ok(serde_json::from_slice(&bytes)?),
            Ok(Ok(Err(message))) => Err(SyncError::rejected(method, message)),
            Ok(Err(_)) => Err(SyncError::ChannelClosed(format!(
                "connection lost during {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SyncError::Timeout(format!("{} after {:?}", method, self.rpc_timeout)))
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct TcpTransfer {
    writer: mpsc::Sender<Frame>,
    uploads: PendingUploads,
    downloads: OpenDownloads,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl TcpTransfer {
    fn start(stream: TcpStream, closed: CancellationToken) -> Self {
        let (reader, writer) = stream.into_split();
        let writer = spawn_writer(writer, closed.clone());
        let uploads: PendingUploads = Arc::new(Mutex::new(HashMap::new()));
        let downloads: OpenDownloads = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::read_loop(
            reader,
            uploads.clone(),
            downloads.clone(),
            closed.clone(),
        ));

        Self {
            writer,
            uploads,
            downloads,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    async fn read_loop<R>(
        mut reader: R,
        uploads: PendingUploads,
        downloads: OpenDownloads,
        closed: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(Frame::UploadAck { hash, result })) => {
                    if let Some(tx) = uploads.lock().remove(&hash) {
                        let _ = tx.send(result);
                    }
                }
                Ok(Some(Frame::DownloadChunk { id, data })) => {
                    let tx = downloads.lock().get(&id).cloned();
                    if let Some(tx) = tx {
                        if tx.send(data).await.is_err() {
                            downloads.lock().remove(&id);
                        }
                    }
                }
                Ok(Some(Frame::DownloadEnd { id, error })) => {
                    if let Some(error) = error {
                        debug!(id, error = %error, "Download ended with error");
                    }
                    downloads.lock().remove(&id);
                }
                Ok(Some(other)) => warn!(frame = ?other, "Unexpected frame on transfer channel"),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Transfer channel read failed");
                    break;
                }
            }
        }

        closed.cancel();
        uploads.lock().clear();
        downloads.lock().clear();
    }
}

#[async_trait]
impl TransferChannel for TcpTransfer {
    async fn upload(
        &self,
        hash: &str,
        total_len: u64,
        mut chunks: mpsc::Receiver<Vec<u8>>,
    ) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.uploads.lock().insert(hash.to_string(), ack_tx);

        send_frame(
            &self.writer,
            Frame::UploadBegin {
                hash: hash.to_string(),
                total: total_len,
            },
        )
        .await?;

        while let Some(data) = chunks.recv().await {
            send_frame(
                &self.writer,
                Frame::UploadChunk {
                    hash: hash.to_string(),
                    data,
                },
            )
            .await?;
        }

        send_frame(
            &self.writer,
            Frame::UploadEnd {
                hash: hash.to_string(),
            },
        )
        .await?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(SyncError::rejected("upload", message)),
            Err(_) => Err(SyncError::ChannelClosed("connection lost during upload".into())),
        }
    }

    async fn download(&self, hash: &str) -> SyncResult<mpsc::Receiver<Vec<u8>>> {
        if self.closed.is_cancelled() {
            return Err(SyncError::ChannelClosed("transfer channel closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(DOWNLOAD_CAPACITY);
        self.downloads.lock().insert(id, tx);

        let open = Frame::DownloadOpen {
            id,
            hash: hash.to_string(),
        };
        if let Err(e) = send_frame(&self.writer, open).await {
            self.downloads.lock().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Links whose first connection arrived and whose second has not
struct HalfOpen {
    control: Option<(Arc<dyn ControlChannel>, mpsc::Receiver<RemoteEvent>)>,
    transfer: Option<Arc<dyn TransferChannel>>,
    closed: CancellationToken,
}

type HalfOpenLinks = Arc<tokio::sync::Mutex<HashMap<String, HalfOpen>>>;

/// Serve `remote` to TCP clients until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    remote: MemoryRemote,
    shutdown: CancellationToken,
) -> SyncResult<()> {
    let links: HalfOpenLinks = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!(peer = %peer_addr, "Accepted connection");

        let remote = remote.clone();
        let links = links.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, remote, links, shutdown).await {
                debug!(peer = %peer_addr, error = %e, "Connection ended with error");
            }
        });
    }

    remote.drop_connections();
    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: MemoryRemote,
    links: HalfOpenLinks,
    shutdown: CancellationToken,
) -> SyncResult<()> {
    stream.set_nodelay(true)?;
    let (link_id, channel, secret) = match read_frame(&mut stream).await? {
        Some(Frame::Hello {
            link_id,
            channel,
            secret,
        }) => (link_id, channel, secret),
        other => {
            return Err(SyncError::Protocol(format!("expected Hello, got {:?}", other)));
        }
    };

    let (half, closed) = {
        let mut links = links.lock().await;
        if !links.contains_key(&link_id) {
            let channels = remote.open(&Endpoint::new("tcp", secret)).await?;
            links.insert(
                link_id.clone(),
                HalfOpen {
                    control: Some((channels.control, channels.events)),
                    transfer: Some(channels.transfer),
                    closed: channels.closed,
                },
            );
        }

        let Some(entry) = links.get_mut(&link_id) else {
            return Err(SyncError::Protocol("link vanished".into()));
        };
        let closed = entry.closed.clone();
        let half = match channel {
            ChannelKind::Control => entry.control.take().map(ServedHalf::Control),
            ChannelKind::Transfer => entry.transfer.take().map(ServedHalf::Transfer),
        };
        if entry.control.is_none() && entry.transfer.is_none() {
            links.remove(&link_id);
        }
        (half, closed)
    };

    let Some(half) = half else {
        return Err(SyncError::Protocol(format!("duplicate {:?} connection", channel)));
    };

    let (reader, writer) = stream.into_split();
    let result = match half {
        ServedHalf::Control((control, events)) => {
            serve_control(reader, writer, control, events, closed.clone(), shutdown).await
        }
        ServedHalf::Transfer(transfer) => {
            serve_transfer(reader, writer, transfer, closed.clone(), shutdown).await
        }
    };
    closed.cancel();
    result
}

enum ServedHalf {
    Control((Arc<dyn ControlChannel>, mpsc::Receiver<RemoteEvent>)),
    Transfer(Arc<dyn TransferChannel>),
}

async fn serve_control<R, W>(
    mut reader: R,
    writer: W,
    control: Arc<dyn ControlChannel>,
    mut events: mpsc::Receiver<RemoteEvent>,
    closed: CancellationToken,
    shutdown: CancellationToken,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = spawn_writer(writer, closed.clone());

    let event_writer = writer.clone();
    let event_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if send_frame(&event_writer, Frame::Event(event)).await.is_err() {
                break;
            }
        }
        event_closed.cancel();
    });

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => match frame? {
                Some(Frame::Request { id, method, params }) => {
                    let control = control.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let result = match serde_json::from_slice(&params) {
                            Ok(params) => control
                                .call(&method, params)
                                .await
                                .and_then(|value| Ok(serde_json::to_vec(&value)?)),
                            Err(e) => Err(SyncError::from(e)),
                        };
                        let result = result.map_err(|e| match e {
                            SyncError::RemoteRejected { message, .. } => message,
                            other => other.to_string(),
                        });
                        let _ = send_frame(&writer, Frame::Response { id, result }).await;
                    });
                }
                Some(other) => warn!(frame = ?other, "Unexpected frame from client"),
                None => break,
            },
        }
    }

    control.close().await;
    Ok(())
}

async fn serve_transfer<R, W>(
    mut reader: R,
    writer: W,
    transfer: Arc<dyn TransferChannel>,
    closed: CancellationToken,
    shutdown: CancellationToken,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = spawn_writer(writer, closed.clone());
    let mut uploads: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame?,
        };

        match frame {
            Some(Frame::UploadBegin { hash, total }) => {
                let (tx, rx) = mpsc::channel(UPLOAD_CAPACITY);
                // Replacing an unfinished upload of the same hash ends it short.
                uploads.insert(hash.clone(), tx);
                let transfer = transfer.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let result = transfer
                        .upload(&hash, total, rx)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = send_frame(&writer, Frame::UploadAck { hash, result }).await;
                });
            }
            Some(Frame::UploadChunk { hash, data }) => {
                if let Some(tx) = uploads.get(&hash) {
                    if tx.send(data).await.is_err() {
                        uploads.remove(&hash);
                    }
                }
            }
            Some(Frame::UploadEnd { hash }) => {
                uploads.remove(&hash);
            }
            Some(Frame::DownloadOpen { id, hash }) => {
                let transfer = transfer.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let error = match transfer.download(&hash).await {
                        Ok(mut chunks) => {
                            while let Some(data) = chunks.recv().await {
                                if send_frame(&writer, Frame::DownloadChunk { id, data })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            None
                        }
                        Err(e) => Some(e.to_string()),
                    };
                    let _ = send_frame(&writer, Frame::DownloadEnd { id, error }).await;
                });
            }
            Some(other) => warn!(frame = ?other, "Unexpected frame from client"),
            None => break,
        }
    }

    transfer.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ControlClient;
    use crate::transfer::codec;

    async fn start_server(remote: MemoryRemote) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, remote, shutdown.clone()));
        (uri, shutdown)
    }

    #[test]
    fn test_socket_addr_strips_scheme() {
        assert_eq!(socket_addr("tcp://127.0.0.1:6900"), "127.0.0.1:6900");
        assert_eq!(socket_addr("127.0.0.1:6900"), "127.0.0.1:6900");
    }

    #[tokio::test]
    async fn test_rpc_and_events_over_tcp() {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        let (uri, _shutdown) = start_server(remote.clone()).await;

        let mut channels = TcpConnector::default()
            .open(&Endpoint::new(uri, Some(secret)))
            .await
            .unwrap();
        let control = ControlClient::new(channels.control.clone());

        let hello = control.handshake().await.unwrap();
        assert_eq!(hello.uid, "ALICE");
        assert!(control.peer_list().await.unwrap().is_empty());

        remote.emit("ALICE", RemoteEvent::PeerOnline("BOB".into())).await;
        let event = tokio::time::timeout(Duration::from_secs(2), channels.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, RemoteEvent::PeerOnline("BOB".into()));

        assert!(matches!(
            control.add_peer("NOBODY").await,
            Err(SyncError::RemoteRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_and_download_over_tcp() {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        let (uri, _shutdown) = start_server(remote.clone()).await;

        let channels = TcpConnector::default()
            .open(&Endpoint::new(uri, Some(secret)))
            .await
            .unwrap();

        let packed = codec::compress(&vec![9u8; 100_000]);
        let (tx, rx) = mpsc::channel(2);
        let chunks: Vec<Vec<u8>> = packed.chunks(1000).map(|c| c.to_vec()).collect();
        let producer = tokio::spawn(async move {
            for chunk in chunks {
                tx.send(chunk).await.unwrap();
            }
        });
        channels
            .transfer
            .upload("blob", packed.len() as u64, rx)
            .await
            .unwrap();
        producer.await.unwrap();
        assert_eq!(remote.blob("blob"), Some(vec![9u8; 100_000]));

        let mut stream = channels.transfer.download("blob").await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = stream.recv().await {
            received.extend(chunk);
        }
        assert_eq!(received, packed);
    }

    #[tokio::test]
    async fn test_server_drop_closes_link() {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        let (uri, _shutdown) = start_server(remote.clone()).await;

        let channels = TcpConnector::default()
            .open(&Endpoint::new(uri, Some(secret)))
            .await
            .unwrap();
        ControlClient::new(channels.control.clone())
            .handshake()
            .await
            .unwrap();

        remote.drop_connections();
        tokio::time::timeout(Duration::from_secs(2), channels.closed.cancelled())
            .await
            .unwrap();
        assert!(channels
            .control
            .call("peer_list", serde_json::Value::Null)
            .await
            .unwrap_err()
            .is_disconnect());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector::default()
            .open(&Endpoint::new(format!("tcp://{}", addr), None))
            .await;
        assert!(matches!(result, Err(SyncError::ChannelClosed(_))));
    }
}
