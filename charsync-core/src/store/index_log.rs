/*
    index_log.rs - Append-only content index

    Durable record of which local file holds which content hash.
    Replayed on open; later records for the same hash win.

    Record layout: [len:4][bincode IndexEntry:len][crc32:4], little endian.
    A torn record at the tail (crash during append) is cut off on replay so
    the next append starts on a record boundary.
*/

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{SyncError, SyncResult};

/// Upper bound on one encoded entry; a larger length prefix is corruption
const MAX_RECORD_LEN: usize = 1 << 20;

/// One hash to path mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: String,
    pub path: PathBuf,
    /// Milliseconds since the epoch of the file's last modification
    pub last_modified: u64,
}

impl IndexEntry {
    pub fn new(hash: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified_millis(&path);
        Self {
            hash: hash.into(),
            path,
            last_modified,
        }
    }
}

fn modified_millis(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .or_else(|| Some(SystemTime::now()))
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct IndexLog {
    path: PathBuf,
    file: BufWriter<File>,
    records: u64,
}

impl IndexLog {
    pub fn open(path: PathBuf) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn append(&mut self, entry: &IndexEntry) -> SyncResult<()> {
        let data = bincode::serialize(entry)?;
        let checksum = crc32fast::hash(&data);

        self.file.write_all(&(data.len() as u32).to_le_bytes())?;
        self.file.write_all(&data)?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        self.records += 1;
        Ok(())
    }

    /// Read every intact record in append order, truncating a torn tail
    pub fn replay(&mut self) -> SyncResult<Vec<IndexEntry>> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let record_end = offset + 4 + len as u64 + 4;

            if record_end > file_len {
                tracing::warn!(
                    path = %self.path.display(),
                    offset,
                    "Truncating torn record at end of index"
                );
                break;
            }
            if len > MAX_RECORD_LEN {
                return Err(SyncError::Storage(format!(
                    "index record {} has implausible length {}",
                    entries.len(),
                    len
                )));
            }

            let mut data = vec![0u8; len];
            let mut checksum_buf = [0u8; 4];
            reader.read_exact(&mut data)?;
            reader.read_exact(&mut checksum_buf)?;

            if crc32fast::hash(&data) != u32::from_le_bytes(checksum_buf) {
                return Err(SyncError::Storage(format!(
                    "index record {} failed checksum",
                    entries.len()
                )));
            }

            entries.push(bincode::deserialize(&data)?);
            offset = record_end;
        }

        if offset < file_len {
            self.file.flush()?;
            self.file.get_ref().set_len(offset)?;
            self.file.get_ref().sync_data()?;
        }

        self.records = entries.len() as u64;
        Ok(entries)
    }

    /// Records appended or replayed through this handle
    pub fn records(&self) -> u64 {
        self.records
    }
}
