/*
    content_store.rs - Local content-addressed cache

    Maps content hashes to files on disk. Downloaded blobs are written as
    `<hash>.<ext>` under the cache root; files that already exist elsewhere
    (the local character's own assets) are registered by path only.

    All methods do blocking file I/O; async callers go through
    `tokio::task::spawn_blocking`.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::index_log::{IndexEntry, IndexLog};
use crate::errors::{SyncError, SyncResult};

const INDEX_FILE: &str = "index.log";

pub struct ContentStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, IndexEntry>,
    log: IndexLog,
}

fn key(hash: &str) -> String {
    hash.to_ascii_lowercase()
}

impl ContentStore {
    /// Open the store rooted at `root`, replaying its index
    pub fn open(root: impl AsRef<Path>) -> SyncResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut log = IndexLog::open(root.join(INDEX_FILE))?;
        let mut entries = HashMap::new();
        for entry in log.replay()? {
            entries.insert(key(&entry.hash), entry);
        }

        tracing::debug!(root = %root.display(), entries = entries.len(), "Content store opened");

        Ok(Self {
            root,
            inner: Mutex::new(Inner { entries, log }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` for `hash` and record it. Writing a hash that is already
    /// present on disk leaves the existing file in place.
    pub fn put(&self, hash: &str, bytes: &[u8], ext: Option<&str>) -> SyncResult<PathBuf> {
        if let Some(existing) = self.path_for(hash) {
            return Ok(existing);
        }

        let file_name = match ext {
            Some(ext) => format!("{}.{}", key(hash), ext),
            None => key(hash),
        };
        let path = self.root.join(file_name);
        let tmp = path.with_extension("part");

        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        self.record(hash, &path)?;
        tracing::debug!(hash = %hash, path = %path.display(), bytes = bytes.len(), "Stored content");
        Ok(path)
    }

    /// Record an existing file as the source of `hash`
    pub fn register(&self, hash: &str, path: &Path) -> SyncResult<()> {
        {
            let inner = self.inner.lock();
            if inner
                .entries
                .get(&key(hash))
                .is_some_and(|entry| entry.path == path)
            {
                return Ok(());
            }
        }
        self.record(hash, path)
    }

    fn record(&self, hash: &str, path: &Path) -> SyncResult<()> {
        let entry = IndexEntry::new(hash, path);
        let mut inner = self.inner.lock();
        inner.log.append(&entry)?;
        inner.entries.insert(key(hash), entry);
        Ok(())
    }

    /// Local file holding `hash`, if it is recorded and still on disk
    pub fn path_for(&self, hash: &str) -> Option<PathBuf> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key(hash))
            .map(|entry| entry.path.clone())
            .filter(|path| path.is_file())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.path_for(hash).is_some()
    }

    pub fn read(&self, hash: &str) -> SyncResult<Vec<u8>> {
        let path = self
            .path_for(hash)
            .ok_or_else(|| SyncError::ContentMissing(hash.to_string()))?;
        Ok(std::fs::read(path)?)
    }

    pub fn entry(&self, hash: &str) -> Option<IndexEntry> {
        self.inner.lock().entries.get(&key(hash)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_names_file_by_hash_and_extension() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();

        let path = store.put("ABCD", b"texture", Some("tex")).unwrap();
        assert_eq!(path, dir.path().join("abcd.tex"));
        assert_eq!(store.read("abcd").unwrap(), b"texture");
        assert!(store.contains("AbCd"));
        assert!(store.entry("abcd").unwrap().last_modified > 0);
    }

    #[test]
    fn test_put_is_idempotent_by_hash() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();

        let first = store.put("h1", b"bytes", Some("mdl")).unwrap();
        let second = store.put("h1", b"bytes", Some("mdl")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("own_asset.tex");
        std::fs::write(&source, b"local").unwrap();

        {
            let store = ContentStore::open(dir.path().join("cache")).unwrap();
            store.register("local-hash", &source).unwrap();
            store.put("remote-hash", b"remote", None).unwrap();
        }

        let store = ContentStore::open(dir.path().join("cache")).unwrap();
        assert_eq!(store.path_for("local-hash"), Some(source));
        assert_eq!(store.read("remote-hash").unwrap(), b"remote");
    }

    #[test]
    fn test_store_recovers_from_crash_mid_append() {
        use std::io::Write;

        let dir = tempdir().unwrap();
        {
            let store = ContentStore::open(dir.path()).unwrap();
            store.put("aa", b"first", None).unwrap();
        }
        let mut index = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(INDEX_FILE))
            .unwrap();
        index.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(index);

        {
            let store = ContentStore::open(dir.path()).unwrap();
            store.put("bb", b"second", None).unwrap();
        }

        let store = ContentStore::open(dir.path()).unwrap();
        assert_eq!(store.read("aa").unwrap(), b"first");
        assert_eq!(store.read("bb").unwrap(), b"second");
    }

    #[test]
    fn test_missing_file_is_not_reported_present() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();

        let path = store.put("gone", b"x", Some("tex")).unwrap();
        std::fs::remove_file(path).unwrap();

        assert!(!store.contains("gone"));
        assert!(matches!(store.read("gone"), Err(SyncError::ContentMissing(_))));
    }
}
