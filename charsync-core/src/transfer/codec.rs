//! Block compression for content on the wire
//!
//! Blobs are LZ4 compressed with the uncompressed size prepended, so the
//! receiver can allocate once and reject truncated payloads.

use crate::errors::{SyncError, SyncResult};

pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

pub fn decompress(data: &[u8]) -> SyncResult<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| SyncError::Compression(e.to_string()))
}

/// Number of `chunk_size` pieces needed for `len` bytes
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}
