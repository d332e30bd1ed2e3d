//! The ordered key-value blob store the cache persists into.
//!
//! The engine only needs get/put/delete plus ordered prefix listing, so the
//! persistence layer is a trait: [`MemoryBlobStore`] for tests and
//! ephemeral sessions, [`FsBlobStore`] for a cache directory on disk.

use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Ordered blob store with get/put/delete.
///
/// Keys are `/`-separated relative names such as `records/<id>`. `put` must
/// replace the value atomically: a reader sees either the old or the new
/// bytes, never a mix.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError>;
}

// ── In-memory ────────────────────────────────────────────────────────────

/// `BTreeMap`-backed store. Contents vanish with the value.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail, simulating a full or
    /// write-protected disk.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_writable(&self, key: &str) -> Result<(), EngineError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(EngineError::storage(key, "store is read-only"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError> {
        self.check_writable(key)?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.check_writable(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────

const TMP_SUFFIX: &str = ".tmp";

/// One file per key under a root directory.
///
/// Writes go to a sibling temp file and are renamed into place, so a crash
/// mid-write never leaves a truncated blob under the real key.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| EngineError::storage(root.display().to_string(), e))?;
        debug!("Opened blob store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, EngineError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(TMP_SUFFIX)
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(EngineError::storage(key, "invalid blob key"));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::storage(key, e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::storage(key, e))?;
        }

        // Atomic write: write to temp, then rename
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &value)
            .await
            .map_err(|e| EngineError::storage(key, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| EngineError::storage(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::storage(key, e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(EngineError::storage(dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| EngineError::storage(dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| EngineError::storage(path.display().to_string(), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(TMP_SUFFIX) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn BlobStore) {
        store.put("records/b", b"two".to_vec()).await.unwrap();
        store.put("records/a", b"one".to_vec()).await.unwrap();
        store.put("sources/a", b"raw".to_vec()).await.unwrap();

        assert_eq!(store.get("records/a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("records/zzz").await.unwrap(), None);
        assert_eq!(
            store.keys("records/").await.unwrap(),
            vec!["records/a".to_string(), "records/b".to_string()]
        );

        store.put("records/a", b"uno".to_vec()).await.unwrap();
        assert_eq!(store.get("records/a").await.unwrap(), Some(b"uno".to_vec()));

        store.delete("records/a").await.unwrap();
        store.delete("records/a").await.unwrap();
        assert_eq!(store.keys("records/").await.unwrap(), vec!["records/b".to_string()]);
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemoryBlobStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        exercise(&store).await;

        store.put("derived/x/1/export.png", vec![9; 16]).await.unwrap();
        assert!(dir.path().join("derived/x/1/export.png").exists());
        assert!(!dir.path().join("derived/x/1/export.png.tmp").exists());
        assert_eq!(
            store.keys("derived/").await.unwrap(),
            vec!["derived/x/1/export.png".to_string()]
        );
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        assert!(store.put("../evil", vec![1]).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.put("", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn read_only_memory_store_fails_writes() {
        let store = MemoryBlobStore::new();
        store.put("k", vec![1]).await.unwrap();
        store.set_read_only(true);
        assert!(matches!(
            store.put("k", vec![2]).await,
            Err(EngineError::Storage { .. })
        ));
        assert!(store.delete("k").await.is_err());
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));
    }
}
