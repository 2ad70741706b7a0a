// =============================================================================
// On-disk cache layer
// =============================================================================
//
// One JSON file per key:
//   { "key": "...", "created_at_ms": 1700000000000, "payload": { ... } }
//
// Writes go to a `.tmp` sibling and are renamed into place, so a reader never
// sees a half-written file. Every failure is reported as `CacheUnavailable`;
// callers log it and carry on without the disk layer.
//
// Ages are measured against the `now` the caller passes in, and a load hands
// back what is left of the TTL so the entry keeps its original expiry.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize)]
struct Record<T> {
    key: String,
    created_at_ms: i64,
    payload: T,
}

#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Payload stored under `key` with its remaining lifetime, if present and
    /// younger than `ttl` at `now`.
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<(T, Duration)>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(&path, e)),
        };

        let record: Record<T> = serde_json::from_slice(&bytes).map_err(|e| unavailable(&path, e))?;
        if record.key != key {
            debug!(path = %path.display(), "disk cache key mismatch");
            return Ok(None);
        }

        let age_ms = now.timestamp_millis().saturating_sub(record.created_at_ms);
        let remaining = u64::try_from(age_ms)
            .ok()
            .and_then(|age| ttl.checked_sub(Duration::from_millis(age)))
            .filter(|left| !left.is_zero());
        match remaining {
            Some(left) => Ok(Some((record.payload, left))),
            None => {
                debug!(key, age_ms, "disk cache entry expired");
                Ok(None)
            }
        }
    }

    pub async fn store<T: Serialize>(&self, key: &str, payload: &T, now: DateTime<Utc>) -> Result<()> {
        let record = Record {
            key: key.to_string(),
            created_at_ms: now.timestamp_millis(),
            payload,
        };
        let path = self.path_for(key);
        let content = serde_json::to_vec(&record).map_err(|e| unavailable(&path, e))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable(&self.dir, e))?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|e| unavailable(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| unavailable(&path, e))?;

        debug!(key, bytes = content.len(), "disk cache entry written");
        Ok(())
    }

    /// Readable, collision-free file name for `key`.
    fn path_for(&self, key: &str) -> PathBuf {
        let readable: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(96)
            .collect();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.dir
            .join(format!("{readable}-{:016x}.json", hasher.finish()))
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::CacheUnavailable(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        closes: Vec<f64>,
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("cache"));
        let now = Utc::now();
        let payload = Payload {
            closes: vec![1.0, 2.5],
        };
        store.store("BTCUSDT|1h|sma(20)", &payload, now).await.unwrap();

        let back = store.load::<Payload>("BTCUSDT|1h|sma(20)", TTL, now).await.unwrap();
        assert_eq!(back, Some((payload, TTL)));
    }

    #[tokio::test]
    async fn load_reports_what_is_left_of_the_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let written = Utc::now();
        store.store("k", &Payload { closes: vec![] }, written).await.unwrap();

        let later = written + chrono::Duration::seconds(45);
        let (_, left) = store.load::<Payload>("k", TTL, later).await.unwrap().unwrap();
        assert_eq!(left, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn missing_and_expired_entries_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let now = Utc::now();
        let none = store.load::<Payload>("absent", TTL, now).await.unwrap();
        assert!(none.is_none());

        store.store("k", &Payload { closes: vec![] }, now).await.unwrap();
        let expired = store.load::<Payload>("k", Duration::ZERO, now).await.unwrap();
        assert!(expired.is_none());

        let too_late = now + chrono::Duration::seconds(60);
        assert!(store.load::<Payload>("k", TTL, too_late).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_from_the_future_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let now = Utc::now();
        store
            .store("k", &Payload { closes: vec![] }, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(store.load::<Payload>("k", TTL, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn similar_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        assert_ne!(store.path_for("a|b"), store.path_for("a/b"));
    }

    #[tokio::test]
    async fn corrupt_file_is_cache_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        std::fs::write(store.path_for("k"), b"{not json").unwrap();
        let err = store.load::<Payload>("k", TTL, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn unwritable_directory_is_cache_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // A regular file where the cache directory should be.
        let store = DiskStore::new(blocker.join("cache"));
        let err = store
            .store("k", &Payload { closes: vec![] }, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheUnavailable(_)));
    }
}
