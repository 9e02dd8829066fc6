//! JSON-file backed store.
//!
//! The file is the only copy of the data. Every instance opened on the same
//! path reads the document on each access, and writes re-read it under an
//! exclusive advisory lock before rewriting, so concurrent writers merge
//! instead of overwriting each other.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use super::{entry_size, DurableStore, StorageError, StorageResult};

type Document = HashMap<String, String>;

/// A store backed by a single JSON document on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    quota: usize,
    /// Serializes writers within this process; the file lock covers other handles.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`. An existing document must be valid JSON.
    pub fn open(path: impl AsRef<Path>, quota: usize) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            lock_path: path.with_extension("lock"),
            path,
            quota,
            write_lock: Mutex::new(()),
        };

        let document = store.read_document()?;
        if !document.is_empty() {
            tracing::info!(path = %store.path.display(), entries = document.len(), "Loaded durable store");
        }
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> StorageResult<Document> {
        match File::open(&self.path) {
            Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &Document) -> StorageResult<()> {
        // Write beside the target and rename so readers never see a torn document.
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, document)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read, modify and rewrite the document while holding both locks.
    ///
    /// `change` returns whether the document needs rewriting. Nothing is
    /// written when it fails.
    fn update<F>(&self, change: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Document) -> StorageResult<bool>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        lock.lock_exclusive()?;

        let mut document = self.read_document()?;
        let result = match change(&mut document) {
            Ok(true) => self.write_document(&document),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %self.lock_path.display(), error = %e, "Failed to release store lock");
        }
        result
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read_document()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let quota = self.quota;
        self.update(|document| {
            let used: usize = document
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| entry_size(k, v))
                .sum();
            let needed = used + entry_size(key, value);
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }

            document.insert(key.to_string(), value.to_string());
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.update(|document| Ok(document.remove(key).is_some()))
    }

    fn keys(&self) -> Vec<String> {
        match self.read_document() {
            Ok(document) => document.into_keys().collect(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read durable store");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("lock"));
    }

    #[test]
    fn test_persistence() {
        let path = temp_path("store-persistence");

        let store = FileStore::open(&path, 1024).unwrap();
        store.set("fallback_audit_x", "{\"value\":1}").unwrap();
        store.set("other", "2").unwrap();
        store.remove("other").unwrap();

        // Load new instance
        let loaded = FileStore::open(&path, 1024).unwrap();
        assert_eq!(loaded.get("fallback_audit_x").unwrap().as_deref(), Some("{\"value\":1}"));
        assert!(loaded.get("other").unwrap().is_none());

        cleanup(&path);
    }

    #[test]
    fn test_instances_on_one_path_share_writes() {
        let path = temp_path("store-shared");
        let tab_a = FileStore::open(&path, 4096).unwrap();
        let tab_b = FileStore::open(&path, 4096).unwrap();

        tab_a.set("fallback_credit-scoring_c1", "{\"score\":710}").unwrap();
        assert_eq!(
            tab_b.get("fallback_credit-scoring_c1").unwrap().as_deref(),
            Some("{\"score\":710}")
        );

        tab_b.set("field_timestamp_e_f_local", "42").unwrap();
        assert_eq!(tab_a.get("field_timestamp_e_f_local").unwrap().as_deref(), Some("42"));

        let reopened = FileStore::open(&path, 4096).unwrap();
        let mut keys = reopened.keys();
        keys.sort();
        assert_eq!(keys, vec!["fallback_credit-scoring_c1", "field_timestamp_e_f_local"]);

        tab_a.remove("field_timestamp_e_f_local").unwrap();
        assert!(tab_b.get("field_timestamp_e_f_local").unwrap().is_none());

        cleanup(&path);
    }

    #[test]
    fn test_concurrent_writers_keep_every_key() {
        let path = temp_path("store-concurrent");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = FileStore::open(&path, 1 << 20).unwrap();
                    for j in 0..10 {
                        store.set(&format!("k{}_{}", i, j), "v").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = FileStore::open(&path, 1 << 20).unwrap();
        assert_eq!(store.keys().len(), 40);
        cleanup(&path);
    }

    #[test]
    fn test_failed_write_is_not_visible() {
        let dir = std::env::temp_dir().join(format!("store-missing-{}", uuid::Uuid::new_v4()));
        let store = FileStore::open(dir.join("store.json"), 1024).unwrap();

        assert!(matches!(store.set("k", "v"), Err(StorageError::Io(_))));
        assert!(store.get("k").unwrap().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_quota_rejects_without_storing() {
        let path = temp_path("store-quota");
        let store = FileStore::open(&path, 8).unwrap();

        assert!(matches!(store.set("key", "too long value"), Err(StorageError::QuotaExceeded { .. })));
        assert!(store.get("key").unwrap().is_none());
        assert!(!path.exists());
        cleanup(&path);
    }

    #[test]
    fn test_quota_counts_entries_written_by_other_instances() {
        let path = temp_path("store-quota-shared");
        let tab_a = FileStore::open(&path, 16).unwrap();
        let tab_b = FileStore::open(&path, 16).unwrap();

        tab_a.set("aaaa", "12345678").unwrap();
        assert!(matches!(tab_b.set("bbbb", "12345678"), Err(StorageError::QuotaExceeded { .. })));
        assert!(tab_a.get("bbbb").unwrap().is_none());
        cleanup(&path);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_path("store-corrupt");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(FileStore::open(&path, 1024), Err(StorageError::Serialization(_))));
        cleanup(&path);
    }
}
