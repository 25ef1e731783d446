//! Durable key/value map persisted as a single file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-origin high-water-marks tracked by the Synchronizer.
///
/// `items_version` mirrors whatever `lastModified` stamp the origin's
/// `getIndexes` response carried last time (a Subsonic server-defined
/// string, not necessarily numeric), carried forward verbatim when the
/// origin omits it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SynchronizerState {
    pub connection_version: u32,
    pub items_version: Option<String>,
    pub containers_version: u32,
}

struct Inner {
    path: PathBuf,
    map: HashMap<String, serde_json::Value>,
}

/// Scoped acquisition of an exclusive lock on every save/load, backed by a
/// single JSON file rewritten atomically (write-temp-then-rename).
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Loads the state file. A missing file, or one that does not decode to
    /// a JSON object, starts the store from an empty map rather than
    /// failing; any other I/O error is fatal.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(serde_json::Value::Object(obj)) => obj.into_iter().collect(),
                Ok(_) => {
                    log::warn!("state file at {} is not a JSON object, starting empty", path.display());
                    HashMap::new()
                }
                Err(err) => {
                    log::warn!("state file at {} failed to parse ({err}), starting empty", path.display());
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(StateError::Io(err)),
        };

        Ok(Self {
            inner: Mutex::new(Inner { path, map }),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let inner = self.inner.lock().await;
        inner
            .map
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        inner.map.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.map.contains_key(key)
    }

    /// Write to a temp path and atomically replace the target.
    pub async fn save(&self) -> Result<(), StateError> {
        let inner = self.inner.lock().await;
        let serialized = serde_json::to_vec_pretty(&inner.map)?;

        let temp_path = temp_path_for(&inner.path);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&serialized).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &inner.path).await?;
        Ok(())
    }

    /// The stable, once-assigned server identity, generated on first use.
    pub async fn persistent_id(&self) -> Result<u64, StateError> {
        if let Some(id) = self.get::<u64>("persistent_id").await {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().as_u64_pair().0;
        self.set("persistent_id", id).await?;
        Ok(id)
    }

    pub async fn synchronizer_state(&self, origin_index: usize) -> Option<SynchronizerState> {
        self.get(&synchronizer_key(origin_index)).await
    }

    pub async fn set_synchronizer_state(
        &self,
        origin_index: usize,
        state: SynchronizerState,
    ) -> Result<(), StateError> {
        self.set(&synchronizer_key(origin_index), state).await
    }
}

fn synchronizer_key(origin_index: usize) -> String {
    format!("synchronizers.{origin_index}")
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".temp");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).await.unwrap();
        assert!(!store.contains("anything").await);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = StateStore::load(&path).await.unwrap();
            store
                .set_synchronizer_state(
                    0,
                    SynchronizerState {
                        connection_version: 7,
                        items_version: Some("42".to_string()),
                        containers_version: 9,
                    },
                )
                .await
                .unwrap();
            store.save().await.unwrap();
        }

        let reloaded = StateStore::load(&path).await.unwrap();
        let state = reloaded.synchronizer_state(0).await.unwrap();
        assert_eq!(state.connection_version, 7);
        assert_eq!(state.items_version.as_deref(), Some("42"));
        assert_eq!(state.containers_version, 9);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty_instead_of_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = StateStore::load(&path).await.unwrap();
        assert!(!store.contains("persistent_id").await);
    }

    #[tokio::test]
    async fn persistent_id_is_stable_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let first_id = {
            let store = StateStore::load(&path).await.unwrap();
            let id = store.persistent_id().await.unwrap();
            store.save().await.unwrap();
            id
        };

        let store = StateStore::load(&path).await.unwrap();
        let second_id = store.persistent_id().await.unwrap();
        assert_eq!(first_id, second_id);
    }
}
