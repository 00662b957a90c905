//! Persistence for link codes and identities.

use super::LinkSnapshot;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub const LINKS_FILE: &str = "links.json";

/// Record store for the link registry.
#[async_trait]
pub trait LinkStore: Send + Sync + std::fmt::Debug {
    /// Loads the last saved snapshot, or `None` if nothing was ever saved.
    async fn load(&self) -> StorageResult<Option<LinkSnapshot>>;

    async fn save(&self, snapshot: &LinkSnapshot) -> StorageResult<()>;
}

/// Stores the snapshot as one JSON file, written atomically.
#[derive(Debug)]
pub struct JsonLinkStore {
    path: PathBuf,
}

impl JsonLinkStore {
    /// Store under `<data_folder>/data/links.json`.
    pub fn new(data_folder: &Path) -> Self {
        Self {
            path: data_folder.join("data").join(LINKS_FILE),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LinkStore for JsonLinkStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> StorageResult<Option<LinkSnapshot>> {
        let contents = match tokio_fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No link file yet");
                return Ok(None);
            }
            Err(e) => return Err(StorageError::FileRead(self.path.clone(), e)),
        };

        let snapshot: LinkSnapshot = serde_json::from_str(&contents)
            .map_err(|e| StorageError::Deserialization(self.path.clone(), e))?;
        info!(
            "📂 Loaded {} identities and {} link codes",
            snapshot.identities.len(),
            snapshot.codes.len()
        );
        Ok(Some(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(path = %self.path.display()))]
    async fn save(&self, snapshot: &LinkSnapshot) -> StorageResult<()> {
        if let Some(dir) = self.path.parent() {
            tokio_fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::DirectoryCreate(dir.to_path_buf(), e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot).map_err(StorageError::Serialization)?;

        let mut file = tokio_fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;

        // Atomic rename
        tokio_fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StorageError::FileRename(temp_path, self.path.clone(), e))?;

        debug!("💾 Saved {} identities", snapshot.identities.len());
        Ok(())
    }
}

/// Keeps the snapshot in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    snapshot: Mutex<Option<LinkSnapshot>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn load(&self) -> StorageResult<Option<LinkSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &LinkSnapshot) -> StorageResult<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkCode;
    use ranksync_event_system::{ExternalId, GameId, Identity};
    use tempfile::TempDir;

    fn snapshot() -> LinkSnapshot {
        let game_id = GameId::new();
        LinkSnapshot {
            version: LinkSnapshot::VERSION,
            codes: vec![LinkCode {
                code: "ABCD2345".into(),
                game_id: GameId::new(),
                created_at: 1_000,
                expires_at: 601_000,
            }],
            identities: vec![Identity::linked(game_id, ExternalId::new("99")).unwrap()],
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_and_creates_the_data_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonLinkStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());

        let saved = snapshot();
        store.save(&saved).await.unwrap();

        assert!(dir.path().join("data").join(LINKS_FILE).exists());
        assert!(!store.path().with_extension("json.tmp").exists());
        assert_eq!(store.load().await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_deserialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonLinkStore::with_path(path);
        assert!(matches!(
            store.load().await,
            Err(StorageError::Deserialization(_, _))
        ));
    }

    #[tokio::test]
    async fn memory_store_keeps_the_last_snapshot() {
        let store = MemoryLinkStore::new();
        assert!(store.load().await.unwrap().is_none());
        let saved = snapshot();
        store.save(&saved).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
    }
}
