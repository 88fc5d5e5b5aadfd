/*
    TransferEngine - content-addressed upload and download

    Upload batch:
        1. skip hashes this engine already knows the service holds
        2. query_missing_hashes for the rest
        3. per missing hash: read + compress on the blocking pool, stream
           chunks through a bounded channel (backpressure from the consumer)
        4. poll is_upload_batch_complete at a fixed interval, bounded in total
    A batch runs under its own cancellation token, a child of the link's
    `closed` token, so a reconnect cancels it too. Starting a batch cancels
    the previous one, waits for it to clean up, then sends abort_upload
    before querying, so the service never mixes state from both.

    Download (per hash, independently cancellable):
        content_size -> 0 means skip; stream chunks; check the declared size;
        decompress + store on the blocking pool.
*/

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::errors::{SyncError, SyncResult};
use crate::metrics::{self, Timer, DOWNLOAD_BYTES, UPLOAD_BATCH_MS, UPLOAD_BYTES, UPLOAD_CANCELLED};
use crate::model::{AssetDescriptor, Direction, TransferTicket};
use crate::session::{Link, SessionManager};
use crate::store::ContentStore;

pub mod codec;
mod tickets;

pub use tickets::TicketBoard;

/// Download buffers start at most this many chunks large
const PREALLOC_CHUNKS: u64 = 64;

/// What an upload batch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Hashes that were streamed to the service
    pub uploaded: Vec<String>,
    /// Hashes the service already had
    pub already_present: Vec<String>,
}

/// Per-hash outcome of a download request
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub stored: Vec<(String, PathBuf)>,
    /// Already local, or the service reported no content
    pub skipped: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
}

struct Inner {
    session: SessionManager,
    store: Arc<ContentStore>,
    config: TransferConfig,
    uploads: TicketBoard,
    downloads: TicketBoard,
    known_remote: Mutex<HashSet<String>>,
    batch: Mutex<Option<(u64, CancellationToken)>>,
    /// Held by the batch talking to the service, cleanup included
    upload_lane: tokio::sync::Mutex<()>,
    next_batch: Mutex<u64>,
    download_tokens: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

/// Await `fut` unless `token` fires first
async fn unless_cancelled<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}

impl TransferEngine {
    pub fn new(session: SessionManager, store: Arc<ContentStore>, config: TransferConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                store,
                config,
                uploads: TicketBoard::new(Direction::Upload),
                downloads: TicketBoard::new(Direction::Download),
                known_remote: Mutex::new(HashSet::new()),
                batch: Mutex::new(None),
                upload_lane: tokio::sync::Mutex::new(()),
                next_batch: Mutex::new(0),
                download_tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.inner.store
    }

    pub fn uploads(&self) -> Vec<TransferTicket> {
        self.inner.uploads.snapshot()
    }

    pub fn downloads(&self) -> Vec<TransferTicket> {
        self.inner.downloads.snapshot()
    }

    pub fn is_uploading(&self) -> bool {
        self.inner.batch.lock().is_some()
    }

    pub fn is_downloading(&self) -> bool {
        !self.inner.download_tokens.lock().is_empty()
    }

    /// Make sure the service holds every hash in `hashes`
    pub async fn upload_batch(&self, hashes: &BTreeSet<String>) -> SyncResult<UploadReport> {
        let link = self.inner.session.link()?;

        let token = link.closed.child_token();
        let batch_id = {
            let mut next = self.inner.next_batch.lock();
            *next += 1;
            *next
        };
        let previous = self.inner.batch.lock().replace((batch_id, token.clone()));
        let replaces_batch = previous.is_some();
        if let Some((_, previous)) = previous {
            debug!("Cancelling previous upload batch");
            previous.cancel();
        }

        let _lane = self.inner.upload_lane.lock().await;

        let timer = Timer::start(UPLOAD_BATCH_MS);
        let result = async {
            if replaces_batch {
                match unless_cancelled(&token, link.control.abort_upload()).await {
                    Ok(()) => {}
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(e) => debug!(error = %e, "abort_upload failed"),
                }
            }
            self.run_batch(&link, hashes, &token).await
        }
        .await;
        timer.stop();

        // A batch replaced by a newer one leaves the abort to its successor
        let superseded = {
            let mut slot = self.inner.batch.lock();
            match slot.as_ref() {
                Some((id, _)) if *id == batch_id => {
                    *slot = None;
                    false
                }
                Some(_) => true,
                None => false,
            }
        };

        match result {
            Ok(report) => {
                if !report.uploaded.is_empty() {
                    info!(uploaded = report.uploaded.len(), "Upload batch complete");
                }
                Ok(report)
            }
            Err(e) => {
                for hash in hashes {
                    self.inner.uploads.remove(hash);
                }
                if matches!(e, SyncError::Cancelled) {
                    warn!("Upload batch cancelled");
                    metrics::record_counter(UPLOAD_CANCELLED, 1);
                    if !superseded && !link.closed.is_cancelled() {
                        if let Err(abort_err) = link.control.abort_upload().await {
                            debug!(error = %abort_err, "abort_upload failed");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_batch(
        &self,
        link: &Link,
        hashes: &BTreeSet<String>,
        token: &CancellationToken,
    ) -> SyncResult<UploadReport> {
        let candidates: Vec<String> = {
            let known = self.inner.known_remote.lock();
            hashes.iter().filter(|h| !known.contains(*h)).cloned().collect()
        };
        if candidates.is_empty() {
            return Ok(UploadReport::default());
        }

        let missing = unless_cancelled(token, link.control.query_missing_hashes(&candidates)).await?;
        let missing_set: HashSet<&String> = missing.iter().collect();
        let already_present: Vec<String> = candidates
            .iter()
            .filter(|h| !missing_set.contains(h))
            .cloned()
            .collect();
        self.inner
            .known_remote
            .lock()
            .extend(already_present.iter().cloned());

        debug!(
            requested = candidates.len(),
            missing = missing.len(),
            "Queried service for missing content"
        );

        for hash in &missing {
            self.upload_one(link, hash, token).await?;
        }

        if !missing.is_empty() {
            self.wait_for_assembly(link, token).await?;
            for hash in &missing {
                self.inner.uploads.remove(hash);
            }
            self.inner.known_remote.lock().extend(missing.iter().cloned());
        }

        Ok(UploadReport {
            uploaded: missing,
            already_present,
        })
    }

    async fn upload_one(&self, link: &Link, hash: &str, token: &CancellationToken) -> SyncResult<()> {
        let store = self.inner.store.clone();
        let key = hash.to_string();
        let packed = tokio::task::spawn_blocking(move || -> SyncResult<Vec<u8>> {
            let data = store.read(&key)?;
            Ok(codec::compress(&data))
        })
        .await??;

        let total = packed.len() as u64;
        let chunk_size = self.inner.config.chunk_size;
        self.inner.uploads.open(hash, total);
        debug!(
            hash = %hash,
            bytes = total,
            chunks = codec::chunk_count(packed.len(), chunk_size),
            "Uploading"
        );

        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        let uploads = &self.inner.uploads;
        let producer = async move {
            for chunk in packed.chunks(chunk_size) {
                tx.send(chunk.to_vec())
                    .await
                    .map_err(|_| SyncError::ChannelClosed("upload stream closed".into()))?;
                uploads.advance(hash, chunk.len() as u64);
                metrics::record_counter(UPLOAD_BYTES, chunk.len() as u64);
            }
            Ok::<_, SyncError>(())
        };
        let consumer = link.transfer.upload(hash, total, rx);

        unless_cancelled(token, async {
            tokio::try_join!(producer, consumer)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_assembly(&self, link: &Link, token: &CancellationToken) -> SyncResult<()> {
        let interval = self.inner.config.poll_interval;
        let deadline = Instant::now() + self.inner.config.poll_timeout;

        loop {
            if unless_cancelled(token, link.control.is_upload_batch_complete()).await? {
                return Ok(());
            }
            if Instant::now() + interval > deadline {
                return Err(SyncError::Timeout(format!(
                    "upload batch not assembled within {:?}",
                    self.inner.config.poll_timeout
                )));
            }
            unless_cancelled(token, async {
                tokio::time::sleep(interval).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Cancel the running upload batch, if any
    pub fn cancel_upload(&self) -> bool {
        match self.inner.batch.lock().take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Fetch every content asset not already in the local store
    pub async fn download(&self, assets: &[AssetDescriptor]) -> SyncResult<DownloadReport> {
        let link = self.inner.session.link()?;
        let mut report = DownloadReport::default();
        let mut seen = HashSet::new();

        for asset in assets.iter().filter(|a| !a.is_swap()) {
            let hash = asset.content_hash.clone();
            if !seen.insert(hash.to_ascii_lowercase()) {
                continue;
            }
            if self.inner.store.contains(&hash) {
                report.skipped.push(hash);
                continue;
            }

            let token = link.closed.child_token();
            self.inner
                .download_tokens
                .lock()
                .insert(hash.clone(), token.clone());

            let result = self.download_one(&link, asset, &token).await;

            self.inner.download_tokens.lock().remove(&hash);
            self.inner.downloads.remove(&hash);

            match result {
                Ok(Some(path)) => report.stored.push((hash, path)),
                Ok(None) => report.skipped.push(hash),
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Download failed");
                    report.failed.push((hash, e));
                }
            }
        }

        Ok(report)
    }

    async fn download_one(
        &self,
        link: &Link,
        asset: &AssetDescriptor,
        token: &CancellationToken,
    ) -> SyncResult<Option<PathBuf>> {
        let hash = asset.content_hash.as_str();

        let expected = unless_cancelled(token, link.control.content_size(hash)).await?;
        if expected == 0 {
            debug!(hash = %hash, "Service has no content, skipping");
            return Ok(None);
        }

        let mut stream = unless_cancelled(token, link.transfer.download(hash)).await?;
        self.inner.downloads.open(hash, expected);

        // `expected` comes from the service; only trust it up to a bound
        let prealloc = (self.inner.config.chunk_size as u64)
            .saturating_mul(PREALLOC_CHUNKS)
            .min(expected);
        let mut packed = Vec::with_capacity(prealloc as usize);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                chunk = stream.recv() => chunk,
            };
            let Some(data) = chunk else {
                break;
            };
            self.inner.downloads.advance(hash, data.len() as u64);
            metrics::record_counter(DOWNLOAD_BYTES, data.len() as u64);
            packed.extend_from_slice(&data);
        }

        let received = packed.len() as u64;
        if received < expected {
            return Err(SyncError::TransferIncomplete {
                hash: hash.to_string(),
                received,
                expected,
            });
        }

        let store = self.inner.store.clone();
        let key = hash.to_string();
        let ext = asset.extension().map(str::to_string);
        let path = tokio::task::spawn_blocking(move || -> SyncResult<PathBuf> {
            let data = codec::decompress(&packed)?;
            store.put(&key, &data, ext.as_deref())
        })
        .await??;

        debug!(hash = %hash, path = %path.display(), "Downloaded");
        Ok(Some(path))
    }

    /// Cancel the download of one hash; other downloads continue
    pub fn cancel_download(&self, hash: &str) -> bool {
        match self.inner.download_tokens.lock().get(hash) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::remote::{Endpoint, MemoryRemote};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        remote: MemoryRemote,
        session: SessionManager,
        engine: TransferEngine,
        _dir: TempDir,
    }

    fn transfer_config(dir: &TempDir) -> TransferConfig {
        TransferConfig {
            chunk_size: 1000,
            channel_capacity: 1,
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_secs(2),
            cache_dir: dir.path().to_path_buf(),
        }
    }

    async fn fixture_with(config: impl FnOnce(&TempDir) -> TransferConfig) -> Fixture {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        let session = SessionManager::new(
            Arc::new(remote.clone()),
            Endpoint::new("mem://", Some(secret)),
            SessionConfig::default(),
        );
        session.connect().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = Arc::new(ContentStore::open(&config.cache_dir).unwrap());
        let engine = TransferEngine::new(session.clone(), store, config);
        Fixture {
            remote,
            session,
            engine,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(transfer_config).await
    }

    fn noise(len: usize, seed: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        blake3::Hasher::new()
            .update(seed)
            .finalize_xof()
            .fill(&mut buf);
        buf
    }

    fn set(hashes: &[&str]) -> BTreeSet<String> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    fn asset(hash: &str, path: &str) -> AssetDescriptor {
        AssetDescriptor::content(vec![path.to_string()], hash)
    }

    #[tokio::test]
    async fn test_batch_uploads_only_missing_and_polls_before_push() {
        let f = fixture().await;
        for hash in ["h1", "h2", "h3"] {
            f.engine
                .store()
                .put(hash, &noise(2500, hash.as_bytes()), Some("tex"))
                .unwrap();
        }
        f.remote.insert_blob("h2", b"already there");
        f.remote.complete_after_polls(2);

        let report = f.engine.upload_batch(&set(&["h1", "h2", "h3"])).await.unwrap();
        assert_eq!(report.uploaded, vec!["h1".to_string(), "h3".to_string()]);
        assert_eq!(report.already_present, vec!["h2".to_string()]);
        assert_eq!(f.remote.chunks_received("h2"), 0);
        assert_eq!(f.remote.blob("h1"), Some(noise(2500, b"h1")));
        assert!(f.remote.has_blob("h3"));
        assert!(f.engine.uploads().is_empty());

        let snapshot =
            crate::model::CharacterSnapshot::new(Default::default(), Default::default(), "", 0.0, "")
                .unwrap();
        f.session.push_snapshot(&snapshot, &[]).await.unwrap();

        let log = f.remote.call_log();
        let polls: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, m)| *m == "is_upload_batch_complete")
            .map(|(i, _)| i)
            .collect();
        let push = log.iter().position(|m| m == "push_snapshot").unwrap();
        assert_eq!(polls.len(), 3);
        assert!(polls.iter().all(|&p| p < push));
    }

    #[tokio::test]
    async fn test_known_hashes_are_not_queried_again() {
        let f = fixture().await;
        for hash in ["h1", "h4"] {
            f.engine.store().put(hash, hash.as_bytes(), None).unwrap();
        }

        f.engine.upload_batch(&set(&["h1"])).await.unwrap();
        let report = f.engine.upload_batch(&set(&["h1"])).await.unwrap();
        assert_eq!(report, UploadReport::default());
        assert_eq!(f.remote.calls_to("query_missing_hashes").len(), 1);

        f.engine.upload_batch(&set(&["h1", "h4"])).await.unwrap();
        let queries = f.remote.calls_to("query_missing_hashes");
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1]["hashes"], serde_json::json!(["h4"]));
        assert_eq!(f.remote.chunks_received("h1"), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_production() {
        let f = fixture().await;
        let data = noise(9_500, b"big");
        assert_eq!(codec::chunk_count(codec::compress(&data).len(), 1000), 10);
        f.engine.store().put("big", &data, Some("mdl")).unwrap();
        f.remote.limit_chunks(4);

        let engine = f.engine.clone();
        let batch = tokio::spawn(async move { engine.upload_batch(&set(&["big"])).await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.remote.chunks_received("big") < 4 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        let tickets = f.engine.uploads();
        assert_eq!(tickets.len(), 1);
        assert!(tickets[0].transferred_bytes() < tickets[0].total_bytes);
        assert!(f.engine.is_uploading());

        assert!(f.engine.cancel_upload());
        assert!(matches!(batch.await.unwrap(), Err(SyncError::Cancelled)));
        assert!(f.engine.uploads().is_empty());
        assert!(!f.engine.is_uploading());

        f.remote.release_chunks(100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.remote.chunks_received("big"), 4);
        assert!(!f.remote.has_blob("big"));
        assert_eq!(f.remote.calls_to("abort_upload").len(), 1);
    }

    #[tokio::test]
    async fn test_new_batch_aborts_previous_before_querying() {
        let f = fixture().await;
        f.engine
            .store()
            .put("big", &noise(5_000, b"big"), None)
            .unwrap();
        f.engine.store().put("small", b"small", None).unwrap();
        f.remote.limit_chunks(1);

        let engine = f.engine.clone();
        let first = tokio::spawn(async move { engine.upload_batch(&set(&["big"])).await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.remote.chunks_received("big") < 1 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        f.remote.complete_after_polls(3);
        let engine = f.engine.clone();
        let second = tokio::spawn(async move { engine.upload_batch(&set(&["small"])).await });

        assert!(matches!(first.await.unwrap(), Err(SyncError::Cancelled)));
        f.remote.release_chunks(100);
        let report = second.await.unwrap().unwrap();
        assert_eq!(report.uploaded, vec!["small".to_string()]);
        assert!(f.remote.has_blob("small"));
        assert!(!f.remote.has_blob("big"));
        assert!(f.engine.uploads().is_empty());

        let log = f.remote.call_log();
        let aborts: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, m)| *m == "abort_upload")
            .map(|(i, _)| i)
            .collect();
        let second_query = log
            .iter()
            .rposition(|m| m == "query_missing_hashes")
            .unwrap();
        assert_eq!(aborts.len(), 1);
        assert!(aborts[0] < second_query);
        assert_eq!(f.remote.calls_to("is_upload_batch_complete").len(), 4);
    }

    #[tokio::test]
    async fn test_reconnect_cancels_running_batch() {
        let f = fixture().await;
        f.engine
            .store()
            .put("big", &noise(5_000, b"x"), None)
            .unwrap();
        f.remote.limit_chunks(1);

        let engine = f.engine.clone();
        let batch = tokio::spawn(async move { engine.upload_batch(&set(&["big"])).await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.remote.chunks_received("big") < 1 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        f.remote.drop_connections();
        assert!(matches!(batch.await.unwrap(), Err(SyncError::Cancelled)));
        assert!(f.engine.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_slow_assembly_times_out() {
        let f = fixture_with(|dir| TransferConfig {
            poll_timeout: Duration::from_millis(40),
            ..transfer_config(dir)
        })
        .await;
        f.engine.store().put("h", b"content", None).unwrap();
        f.remote.complete_after_polls(1_000);

        let err = f.engine.upload_batch(&set(&["h"])).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_upload_requires_connection() {
        let f = fixture().await;
        f.session.shutdown().await;
        assert!(matches!(
            f.engine.upload_batch(&set(&["h"])).await,
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_download_stores_by_hash_and_extension() {
        let f = fixture().await;
        let data = noise(3000, b"mtrl");
        f.remote.insert_blob("abc", &data);

        let report = f
            .engine
            .download(&[asset("abc", "chara/equipment/e0001.mtrl")])
            .await
            .unwrap();

        assert_eq!(report.stored.len(), 1);
        let (hash, path) = &report.stored[0];
        assert_eq!(hash, "abc");
        assert!(path.ends_with("abc.mtrl"));
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(f.engine.store().path_for("abc").as_ref(), Some(path));
        assert!(f.engine.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_zero_size_download_is_skipped() {
        let f = fixture().await;

        let report = f.engine.download(&[asset("empty", "chara/a.tex")]).await.unwrap();

        assert_eq!(report.skipped, vec!["empty".to_string()]);
        assert!(report.stored.is_empty() && report.failed.is_empty());
        assert!(!f.engine.store().contains("empty"));
        assert_eq!(f.engine.store().len(), 0);
    }

    #[tokio::test]
    async fn test_short_stream_fails_only_that_hash() {
        let f = fixture().await;
        f.remote.insert_blob("short", b"actual bytes");
        f.remote.misreport_size("short", 1_000_000);
        f.remote.insert_blob("fine", b"fine bytes");

        let report = f
            .engine
            .download(&[asset("short", "a.tex"), asset("fine", "b.tex")])
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            SyncError::TransferIncomplete {
                expected: 1_000_000,
                ..
            }
        ));
        assert!(!f.engine.store().contains("short"));
        assert_eq!(report.stored.len(), 1);
    }

    #[tokio::test]
    async fn test_absurd_reported_size_fails_only_that_hash() {
        let f = fixture().await;
        f.remote.insert_blob("huge", b"small really");
        f.remote.misreport_size("huge", u64::MAX);

        let report = f.engine.download(&[asset("huge", "a.tex")]).await.unwrap();

        assert!(report.stored.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            SyncError::TransferIncomplete {
                expected: u64::MAX,
                ..
            }
        ));
        assert!(f.engine.downloads().is_empty());
    }

    #[tokio::test]
    async fn test_local_content_is_not_downloaded() {
        let f = fixture().await;
        f.engine.store().put("have", b"local", Some("tex")).unwrap();

        let report = f.engine.download(&[asset("have", "a.tex")]).await.unwrap();
        assert_eq!(report.skipped, vec!["have".to_string()]);
        assert!(f.remote.calls_to("content_size").is_empty());
    }
}
