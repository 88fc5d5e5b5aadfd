//! Metrics emitted by the engine
//!
//! Only the `metrics` facade is used here; installing a recorder or exporter
//! is left to the embedding application.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const UPLOAD_BYTES: &str = "transfer.upload.bytes";
pub const DOWNLOAD_BYTES: &str = "transfer.download.bytes";
pub const UPLOAD_CANCELLED: &str = "transfer.upload.cancelled";
pub const UPLOAD_BATCH_MS: &str = "transfer.upload.batch_ms";
pub const SESSION_RECONNECTS: &str = "session.reconnects";
pub const CYCLES_SENT: &str = "detector.cycles.sent";
pub const CYCLES_SUPPRESSED: &str = "detector.cycles.suppressed";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(UPLOAD_BYTES, "Compressed bytes streamed to the service");
    describe_counter!(DOWNLOAD_BYTES, "Compressed bytes received from the service");
    describe_counter!(UPLOAD_CANCELLED, "Upload batches cancelled before completion");
    describe_histogram!(UPLOAD_BATCH_MS, "Upload batch duration in milliseconds");
    describe_counter!(SESSION_RECONNECTS, "Channel closures that triggered a reconnect");
    describe_counter!(CYCLES_SENT, "Detection cycles that published a snapshot");
    describe_counter!(CYCLES_SUPPRESSED, "Detection cycles skipped as unchanged");
}

pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        histogram!(self.name).record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
