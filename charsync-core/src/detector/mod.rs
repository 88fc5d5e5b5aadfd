/*
    ChangeDetector - turns "local state changed" into at most one publish

    A cycle is entered through a compare-and-set flag; triggers arriving while
    a cycle runs are dropped. One cycle:

        connectivity gate (connect_attempts, delay doubling from connect_retry_delay)
          -> source readiness (ready_attempts x ready_delay)
          -> build + hash + snapshot (blocking pool)
          -> equal to last sent fingerprint? suppress
          -> upload_batch(content hashes) -> push_snapshot(visible peers)
          -> record fingerprint

    Failures are logged and reported as the cycle outcome, never raised.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::errors::SyncResult;
use crate::metrics::{self, CYCLES_SENT, CYCLES_SUPPRESSED};
use crate::model::CharacterData;
use crate::session::SessionManager;
use crate::store::ContentHasher;
use crate::transfer::TransferEngine;

/// The local collaborator that knows the player's current state
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// False while the game side is still loading
    fn is_ready(&self) -> bool {
        true
    }

    async fn build(&self) -> SyncResult<CharacterData>;

    /// Peers that should receive the next push
    async fn visible_peers(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Sent { fingerprint: String },
    Unchanged,
    Abandoned(String),
    Failed(String),
}

struct Inner {
    session: SessionManager,
    engine: TransferEngine,
    source: Arc<dyn SnapshotSource>,
    hasher: Arc<dyn ContentHasher>,
    config: DetectorConfig,
    in_flight: AtomicBool,
    last_sent: Mutex<Option<String>>,
    generation: AtomicU64,
    cycle: Mutex<Option<JoinHandle<CycleOutcome>>>,
    shutdown: CancellationToken,
}

/// Longest wait between connectivity checks, as a multiple of the base delay
const MAX_BACKOFF_FACTOR: u32 = 8;

fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(MAX_BACKOFF_FACTOR.trailing_zeros());
    base.saturating_mul(factor)
}

/// Clears the in-flight flag however the cycle ends
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ChangeDetector {
    inner: Arc<Inner>,
}

impl ChangeDetector {
    pub fn new(
        session: SessionManager,
        engine: TransferEngine,
        source: Arc<dyn SnapshotSource>,
        hasher: Arc<dyn ContentHasher>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                engine,
                source,
                hasher,
                config,
                in_flight: AtomicBool::new(false),
                last_sent: Mutex::new(None),
                generation: AtomicU64::new(0),
                cycle: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start a cycle unless one is already running. Returns whether it started.
    pub fn notify_changed(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cycle in flight, dropping trigger");
            return false;
        }

        let guard = InFlight(self.inner.clone());
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let outcome = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => CycleOutcome::Abandoned("shutting down".into()),
                outcome = inner.run_cycle() => outcome,
            };
            match &outcome {
                CycleOutcome::Sent { fingerprint } => info!(fingerprint = %fingerprint, "Snapshot published"),
                CycleOutcome::Unchanged => debug!("Snapshot unchanged, push suppressed"),
                CycleOutcome::Abandoned(reason) => warn!(reason = %reason, "Cycle abandoned"),
                CycleOutcome::Failed(reason) => warn!(reason = %reason, "Cycle failed"),
            }
            outcome
        });

        *self.inner.cycle.lock() = Some(handle);
        true
    }

    /// Wait for the most recently started cycle
    pub async fn wait_idle(&self) -> Option<CycleOutcome> {
        let handle = self.inner.cycle.lock().take()?;
        handle.await.ok()
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Forget what was last sent so the next cycle publishes again
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        *self.inner.last_sent.lock() = None;
    }

    pub fn last_sent_fingerprint(&self) -> Option<String> {
        self.inner.last_sent.lock().clone()
    }

    /// Turn every message on `changes` into a trigger
    pub fn spawn_listener(&self, mut changes: mpsc::Receiver<()>) -> JoinHandle<()> {
        let detector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = detector.inner.shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(()) => {
                            detector.notify_changed();
                        }
                        None => break,
                    },
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.cycle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    async fn run_cycle(&self) -> CycleOutcome {
        if !self.await_connection().await {
            return CycleOutcome::Abandoned("not connected".into());
        }
        if !self.await_ready().await {
            return CycleOutcome::Abandoned("snapshot source not ready".into());
        }

        let generation = self.generation.load(Ordering::Acquire);
        match self.publish(generation).await {
            Ok(Some(fingerprint)) => CycleOutcome::Sent { fingerprint },
            Ok(None) => CycleOutcome::Unchanged,
            Err(e) => CycleOutcome::Failed(e.to_string()),
        }
    }

    async fn await_connection(&self) -> bool {
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.session.is_connected() {
                return true;
            }
            debug!(attempt, "Waiting for connection");
            if attempt < attempts {
                tokio::time::sleep(backoff(self.config.connect_retry_delay, attempt)).await;
            }
        }
        false
    }

    async fn await_ready(&self) -> bool {
        let attempts = self.config.ready_attempts.max(1);
        for attempt in 1..=attempts {
            if self.source.is_ready() {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.ready_delay).await;
            }
        }
        false
    }

    async fn publish(&self, generation: u64) -> SyncResult<Option<String>> {
        let mut data = self.source.build().await?;
        let hasher = self.hasher.clone();
        let store = self.engine.store().clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            data.compute_hashes(hasher.as_ref(), &store)?;
            data.to_snapshot()
        })
        .await??;

        let fingerprint = snapshot.fingerprint().to_string();
        if self.last_sent.lock().as_deref() == Some(fingerprint.as_str()) {
            metrics::record_counter(CYCLES_SUPPRESSED, 1);
            return Ok(None);
        }

        self.engine.upload_batch(&snapshot.content_hashes()).await?;

        let peers = self.source.visible_peers().await;
        self.session.push_snapshot(&snapshot, &peers).await?;

        if self.generation.load(Ordering::Acquire) == generation {
            *self.last_sent.lock() = Some(fingerprint.clone());
        }
        metrics::record_counter(CYCLES_SENT, 1);
        Ok(Some(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, TransferConfig};
    use crate::errors::SyncError;
    use crate::model::{FileReplacement, ObjectKind};
    use crate::remote::{Endpoint, MemoryRemote};
    use crate::store::{Blake3Hasher, ContentStore};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct TestSource {
        data: Mutex<CharacterData>,
        not_ready: AtomicBool,
        fail_build: AtomicBool,
        gate: Mutex<Option<Arc<Semaphore>>>,
        builds: AtomicU64,
    }

    #[async_trait]
    impl SnapshotSource for TestSource {
        fn is_ready(&self) -> bool {
            !self.not_ready.load(Ordering::SeqCst)
        }

        async fn build(&self) -> SyncResult<CharacterData> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                let _permit = gate.acquire().await.map_err(|_| SyncError::Cancelled)?;
            }
            if self.fail_build.load(Ordering::SeqCst) {
                return Err(SyncError::ContentMissing("source unavailable".into()));
            }
            Ok(self.data.lock().clone())
        }

        async fn visible_peers(&self) -> Vec<String> {
            vec!["BOB".to_string()]
        }
    }

    struct Fixture {
        remote: MemoryRemote,
        session: SessionManager,
        source: Arc<TestSource>,
        detector: ChangeDetector,
        dir: TempDir,
    }

    fn detector_config() -> DetectorConfig {
        DetectorConfig {
            connect_attempts: 2,
            connect_retry_delay: Duration::from_millis(5),
            ready_attempts: 2,
            ready_delay: Duration::from_millis(5),
        }
    }

    async fn fixture(connect: bool) -> Fixture {
        fixture_with(connect, detector_config()).await
    }

    async fn fixture_with(connect: bool, config: DetectorConfig) -> Fixture {
        let remote = MemoryRemote::new();
        let secret = remote.add_user("ALICE");
        remote.add_user("BOB");
        remote.pair("ALICE", "BOB");
        let session = SessionManager::new(
            Arc::new(remote.clone()),
            Endpoint::new("mem://", Some(secret)),
            SessionConfig::default(),
        );
        if connect {
            session.connect().await.unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let transfer = TransferConfig {
            poll_interval: Duration::from_millis(5),
            cache_dir: dir.path().join("cache"),
            ..TransferConfig::default()
        };
        let store = Arc::new(ContentStore::open(&transfer.cache_dir).unwrap());
        let engine = TransferEngine::new(session.clone(), store, transfer);

        let source = Arc::new(TestSource::default());
        source.data.lock().set_manipulation("manip");
        let detector = ChangeDetector::new(
            session.clone(),
            engine,
            source.clone(),
            Arc::new(Blake3Hasher),
            config,
        );
        Fixture {
            remote,
            session,
            source,
            detector,
            dir,
        }
    }

    async fn cycle(detector: &ChangeDetector) -> CycleOutcome {
        assert!(detector.notify_changed());
        detector.wait_idle().await.unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_state_is_pushed_once() {
        let f = fixture(true).await;

        let first = cycle(&f.detector).await;
        assert!(matches!(first, CycleOutcome::Sent { .. }));
        assert_eq!(cycle(&f.detector).await, CycleOutcome::Unchanged);
        assert_eq!(f.remote.pushes().len(), 1);

        f.source.data.lock().set_heels_offset(0.5);
        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Sent { .. }));
        assert_eq!(f.remote.pushes().len(), 2);
        assert_eq!(f.remote.pushes()[1].peer_ids, vec!["BOB".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_republishes() {
        let f = fixture(true).await;
        cycle(&f.detector).await;
        assert!(f.detector.last_sent_fingerprint().is_some());

        f.detector.reset();
        assert!(f.detector.last_sent_fingerprint().is_none());
        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Sent { .. }));
        assert_eq!(f.remote.pushes().len(), 2);
    }

    #[tokio::test]
    async fn test_trigger_during_cycle_is_dropped() {
        let f = fixture(true).await;
        let gate = Arc::new(Semaphore::new(0));
        *f.source.gate.lock() = Some(gate.clone());

        assert!(f.detector.notify_changed());
        assert!(f.detector.is_running());
        assert!(!f.detector.notify_changed());
        assert!(!f.detector.notify_changed());

        gate.add_permits(1);
        assert!(matches!(
            f.detector.wait_idle().await,
            Some(CycleOutcome::Sent { .. })
        ));
        assert!(!f.detector.is_running());
        assert_eq!(f.source.builds.load(Ordering::SeqCst), 1);
        assert_eq!(f.remote.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_while_awaiting_connection_is_dropped() {
        let f = fixture_with(
            false,
            DetectorConfig {
                connect_attempts: 50,
                ..detector_config()
            },
        )
        .await;

        assert!(f.detector.notify_changed());
        assert!(!f.detector.notify_changed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!f.detector.notify_changed());
        assert_eq!(f.source.builds.load(Ordering::SeqCst), 0);

        f.session.connect().await.unwrap();
        assert!(matches!(
            f.detector.wait_idle().await,
            Some(CycleOutcome::Sent { .. })
        ));
        assert_eq!(f.source.builds.load(Ordering::SeqCst), 1);
        assert_eq!(f.remote.pushes().len(), 1);
    }

    #[test]
    fn test_connect_backoff_doubles_up_to_cap() {
        let base = Duration::from_millis(5);
        assert_eq!(backoff(base, 1), base);
        assert_eq!(backoff(base, 2), Duration::from_millis(10));
        assert_eq!(backoff(base, 3), Duration::from_millis(20));
        assert_eq!(backoff(base, 4), Duration::from_millis(40));
        assert_eq!(backoff(base, 12), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_abandons_without_connection() {
        let f = fixture(false).await;
        assert_eq!(
            cycle(&f.detector).await,
            CycleOutcome::Abandoned("not connected".into())
        );
        assert_eq!(f.source.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abandons_when_source_never_ready() {
        let f = fixture(true).await;
        f.source.not_ready.store(true, Ordering::SeqCst);
        assert_eq!(
            cycle(&f.detector).await,
            CycleOutcome::Abandoned("snapshot source not ready".into())
        );
    }

    #[tokio::test]
    async fn test_failed_push_does_not_record_fingerprint() {
        let f = fixture(true).await;
        f.remote.reject_next("push_snapshot", "busy");

        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Failed(_)));
        assert!(f.detector.last_sent_fingerprint().is_none());

        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Sent { .. }));
        assert_eq!(f.remote.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_reported() {
        let f = fixture(true).await;
        f.source.fail_build.store(true, Ordering::SeqCst);
        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Failed(_)));
        assert!(f.remote.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_content_is_uploaded_before_push() {
        let f = fixture(true).await;
        let file = f.dir.path().join("body.tex");
        std::fs::write(&file, b"texture bytes").unwrap();
        let hash = Blake3Hasher.hash_of(&file).unwrap();

        f.source.data.lock().add_replacement(
            ObjectKind::Player,
            FileReplacement::new(
                vec!["chara/human/body.tex".to_string()],
                file.to_string_lossy(),
            ),
        );

        assert!(matches!(cycle(&f.detector).await, CycleOutcome::Sent { .. }));
        assert_eq!(f.remote.blob(&hash), Some(b"texture bytes".to_vec()));

        let log = f.remote.call_log();
        let query = log.iter().position(|m| m == "query_missing_hashes").unwrap();
        let push = log.iter().position(|m| m == "push_snapshot").unwrap();
        assert!(query < push);
    }

    #[tokio::test]
    async fn test_listener_and_shutdown() {
        let f = fixture(true).await;
        let (tx, rx) = mpsc::channel(4);
        let listener = f.detector.spawn_listener(rx);

        tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.remote.pushes().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        f.detector.shutdown().await;
        assert!(!f.detector.notify_changed());
        listener.await.unwrap();
        f.session.shutdown().await;
    }
}
