//! Desired-state store.
//!
//! Intents are kept in memory and written through to a JSON file on every
//! mutation.  A mutation only becomes visible in memory once the file has
//! been replaced, so a failed write never leaves an intent looking active
//! that a restart would lose.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::Intent;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, container_id: &str) -> Result<Option<Intent>, StoreError>;

    /// Insert or replace the intent for `intent.container_id`.
    async fn set(&self, intent: Intent) -> Result<(), StoreError>;

    /// Remove an intent, returning it if it existed.
    async fn delete(&self, container_id: &str) -> Result<Option<Intent>, StoreError>;

    async fn list(&self) -> Result<Vec<Intent>, StoreError>;
}

const STATE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    intents: BTreeMap<String, Intent>,
}

pub struct FileStore {
    path: PathBuf,
    intents: RwLock<BTreeMap<String, Intent>>,
}

impl FileStore {
    /// Load the store from `path`. A missing file is an empty store; an
    /// unreadable or corrupt one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let intents = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StateFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                state.intents
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        info!("Loaded {} intents from {}", intents.len(), path.display());
        Ok(Self {
            path,
            intents: RwLock::new(intents),
        })
    }

    async fn persist(&self, intents: &BTreeMap<String, Intent>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let state = StateFile {
            version: STATE_VERSION,
            intents: intents.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&state).map_err(StoreError::Encode)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
            }
        }

        // Write-then-rename so readers never see a half-written file.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!("Persisted {} intents to {}", intents.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, container_id: &str) -> Result<Option<Intent>, StoreError> {
        Ok(self.intents.read().await.get(container_id).cloned())
    }

    async fn set(&self, intent: Intent) -> Result<(), StoreError> {
        let mut intents = self.intents.write().await;
        let mut next = intents.clone();
        next.insert(intent.container_id.clone(), intent);
        self.persist(&next).await?;
        *intents = next;
        Ok(())
    }

    async fn delete(&self, container_id: &str) -> Result<Option<Intent>, StoreError> {
        let mut intents = self.intents.write().await;
        if !intents.contains_key(container_id) {
            return Ok(None);
        }
        let mut next = intents.clone();
        let removed = next.remove(container_id);
        self.persist(&next).await?;
        *intents = next;
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Intent>, StoreError> {
        Ok(self.intents.read().await.values().cloned().collect())
    }
}
