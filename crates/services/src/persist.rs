//! # Persisted State
//!
//! Every store writes one JSON blob under its own key, wrapped as
//! `{"version": N, "state": ...}`. A blob written under another schema
//! version is reset instead of half-parsed.

use domains::{BlobStore, Result, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// On-disk wrapper for a store's state.
#[derive(Debug, Serialize, Deserialize)]
pub struct Persisted<T> {
    pub version: u32,
    pub state: T,
}

/// Returns the state when `raw` was written under `current`, `None` otherwise.
///
/// # Developer Note
/// There are no forward migrations yet: an incompatible shape is dropped and
/// the store starts empty, then refills from the next fetch.
pub fn migrate(raw: Value, current: u32) -> Option<Value> {
    let found = raw.get("version").and_then(Value::as_u64)?;
    if found != u64::from(current) {
        return None;
    }
    match raw {
        Value::Object(mut map) => map.remove("state"),
        _ => None,
    }
}

/// Loads and decodes the blob under `key`. Unknown versions and unreadable
/// blobs are reported as `Ok(None)`; only blob store failures are errors.
pub async fn load_versioned<T: DeserializeOwned>(
    blobs: &dyn BlobStore,
    key: &str,
    version: u32,
) -> Result<Option<T>> {
    let Some(raw) = blobs
        .load(key)
        .await
        .map_err(|e| SyncError::Persistence(e.to_string()))?
    else {
        return Ok(None);
    };

    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(key, error = %e, "persisted blob is not JSON; resetting");
            return Ok(None);
        }
    };

    let Some(state) = migrate(parsed, version) else {
        warn!(key, version, "persisted blob has an incompatible schema; resetting");
        return Ok(None);
    };

    match serde_json::from_value(state) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(key, error = %e, "persisted state does not decode; resetting");
            Ok(None)
        }
    }
}

/// Encodes `state` and replaces the blob under `key`.
pub async fn save_versioned<T: Serialize>(
    blobs: &dyn BlobStore,
    key: &str,
    version: u32,
    state: &T,
) -> Result<()> {
    let blob = serde_json::to_string(&Persisted { version, state })
        .map_err(|e| SyncError::Persistence(e.to_string()))?;
    blobs
        .save(key, blob)
        .await
        .map_err(|e| SyncError::Persistence(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage_adapters::MemoryBlobStore;

    #[test]
    fn test_migrate_resets_other_versions() {
        assert_eq!(migrate(json!({ "version": 1, "state": [1] }), 1), Some(json!([1])));
        assert_eq!(migrate(json!({ "version": 0, "state": [1] }), 1), None);
        assert_eq!(migrate(json!({ "state": [1] }), 1), None);
    }

    #[tokio::test]
    async fn test_round_trip_and_garbage() {
        let blobs = MemoryBlobStore::new();
        save_versioned(&blobs, "k", 2, &vec!["a".to_string()]).await.unwrap();
        let back: Option<Vec<String>> = load_versioned(&blobs, "k", 2).await.unwrap();
        assert_eq!(back, Some(vec!["a".to_string()]));

        // Same blob read by a newer schema is dropped
        let newer: Option<Vec<String>> = load_versioned(&blobs, "k", 3).await.unwrap();
        assert_eq!(newer, None);

        blobs.save("bad", "{not json".into()).await.unwrap();
        let bad: Option<Vec<String>> = load_versioned(&blobs, "bad", 2).await.unwrap();
        assert_eq!(bad, None);
    }

    #[tokio::test]
    async fn test_blob_store_failure_is_an_error() {
        let mut blobs = domains::MockBlobStore::new();
        blobs
            .expect_load()
            .returning(|_| Err(anyhow::anyhow!("disk unplugged")));
        let result: Result<Option<Vec<String>>> = load_versioned(&blobs, "k", 1).await;
        assert!(matches!(result, Err(SyncError::Persistence(_))));
    }
}
