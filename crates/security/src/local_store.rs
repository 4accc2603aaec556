//! Local key-value slots.
//!
//! Each slot holds one string value. The violation collector keeps its
//! pending queue and the client identifier here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{SecurityError, SecurityResult};

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, slot: &str) -> SecurityResult<Option<String>>;
    async fn set(&self, slot: &str, value: &str) -> SecurityResult<()>;
    async fn remove(&self, slot: &str) -> SecurityResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    slots: RwLock<HashMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, slot: &str) -> SecurityResult<Option<String>> {
        Ok(self.slots.read().await.get(slot).cloned())
    }

    async fn set(&self, slot: &str, value: &str) -> SecurityResult<()> {
        self.slots
            .write()
            .await
            .insert(slot.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, slot: &str) -> SecurityResult<()> {
        self.slots.write().await.remove(slot);
        Ok(())
    }
}

/// One file per slot inside a directory. Writes go to a temporary file that
/// is renamed over the slot, so readers never see a partial value.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    pub async fn open(dir: impl AsRef<Path>) -> SecurityResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SecurityError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    fn slot_path(&self, slot: &str) -> SecurityResult<PathBuf> {
        let valid = !slot.is_empty()
            && slot
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SecurityError::InvalidConfiguration(format!(
                "invalid slot name: {:?}",
                slot
            )));
        }
        Ok(self.dir.join(format!("{}.json", slot)))
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, slot: &str) -> SecurityResult<Option<String>> {
        let path = self.slot_path(slot)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, slot: &str, value: &str) -> SecurityResult<()> {
        let path = self.slot_path(slot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, slot: &str) -> SecurityResult<()> {
        let path = self.slot_path(slot)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
