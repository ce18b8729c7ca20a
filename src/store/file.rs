//! File-backed state store: one JSON document per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::StateStore;
use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterState;

/// Persists each key's state as `<dir>/<sha256(key)>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never sees a partially written document.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            TollgateError::Storage(format!("cannot create {}: {}", dir.display(), e))
        })?;
        debug!(dir = %dir.display(), "Opened file state store");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Fixed-length names whatever the key's length or characters.
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<LimiterState>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TollgateError::Storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        trace!(key = %key, path = %path.display(), "Loaded limiter state");
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn set(&self, key: &str, state: &LimiterState) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(state)?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| TollgateError::Storage(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            TollgateError::Storage(format!("cannot replace {}: {}", path.display(), e))
        })?;

        trace!(key = %key, path = %path.display(), "Persisted limiter state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Limit, MaxWait};
    use chrono::Utc;

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.get("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut state = LimiterState::new(Limit::PerSecond(1.0), 1, now);
        state.reserve_n(now, 1, MaxWait::Unbounded);
        state.reserve_n(now, 1, MaxWait::Unbounded);

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set("user:42/login", &state).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let loaded = store.get("user:42/login").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_keys_map_to_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));
        assert!(store.path_for("../etc").starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_long_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let key = "k".repeat(200);
        let state = LimiterState::new(Limit::PerSecond(2.0), 3, Utc::now());

        store.set(&key, &state).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(state));

        let name = store.path_for(&key);
        let name = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".json".len());
        assert!(store.get(&"k".repeat(201)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        tokio::fs::write(store.path_for("bad"), b"not json").await.unwrap();

        let result = store.get("bad").await;
        assert!(matches!(result, Err(TollgateError::Json(_))));
    }
}
