use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::errors::SyncResult;

/// Computes the content identity of a local file
pub trait ContentHasher: Send + Sync {
    fn hash_of(&self, path: &Path) -> SyncResult<String>;
}

/// Streaming BLAKE3 over the file contents, hex encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash_of(&self, path: &Path) -> SyncResult<String> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];

        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }

        Ok(hasher.finalize().to_hex().to_string())
    }
}
