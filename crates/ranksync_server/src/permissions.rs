//! A JSON file standing in for the game server's permission system.
//!
//! ```json
//! {
//!   "ranks": ["default", "admin"],
//!   "players": {
//!     "2f6c...": { "name": "Steve", "ranks": ["admin"], "online": true }
//!   }
//! }
//! ```
//!
//! The file is rewritten atomically on every rank change coming from the sync
//! core and re-read periodically so operators can edit it by hand.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ranksync::{ApplyError, GameId, LookupError, PermissionBackend, RankSet, StaticNameResource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionFile {
    /// Ranks that exist on the server. Empty accepts any rank.
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub players: BTreeMap<GameId, PlayerRecord>,
}

/// What changed between two versions of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerChange {
    Online(GameId, bool),
    RanksChanged(GameId),
}

impl PermissionFile {
    fn diff(&self, newer: &PermissionFile) -> Vec<PlayerChange> {
        let mut changes = Vec::new();
        for (game_id, record) in &newer.players {
            let old = self.players.get(game_id);
            if old.map(|o| o.online).unwrap_or(false) != record.online {
                changes.push(PlayerChange::Online(*game_id, record.online));
            }
            if old.map(|o| &o.ranks) != Some(&record.ranks) {
                changes.push(PlayerChange::RanksChanged(*game_id));
            }
        }
        for (game_id, record) in &self.players {
            if !newer.players.contains_key(game_id) {
                if record.online {
                    changes.push(PlayerChange::Online(*game_id, false));
                }
                changes.push(PlayerChange::RanksChanged(*game_id));
            }
        }
        changes
    }
}

pub struct JsonPermissionBackend {
    path: PathBuf,
    state: RwLock<PermissionFile>,
}

impl JsonPermissionBackend {
    /// Opens the file, creating one with a `default` rank when missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            read_file(&path).await?
        } else {
            let initial = PermissionFile {
                ranks: ["default"].into_iter().collect(),
                players: BTreeMap::new(),
            };
            write_file(&path, &initial).await?;
            info!("Created permission file: {}", path.display());
            initial
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn online_players(&self) -> Vec<GameId> {
        self.state
            .read()
            .await
            .players
            .iter()
            .filter(|(_, record)| record.online)
            .map(|(game_id, _)| *game_id)
            .collect()
    }

    pub async fn player(&self, game_id: GameId) -> Option<PlayerRecord> {
        self.state.read().await.players.get(&game_id).cloned()
    }

    /// Copies every known player name into `names`.
    pub async fn export_names(&self, names: &StaticNameResource) {
        for (game_id, record) in &self.state.read().await.players {
            match &record.name {
                Some(name) => names.set_name(*game_id, name.clone()),
                None => {
                    names.remove(*game_id);
                }
            }
        }
    }

    /// Re-reads the file and reports what changed since the last read or write.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn reload(&self) -> Result<Vec<PlayerChange>> {
        let newer = read_file(&self.path).await?;
        let mut state = self.state.write().await;
        let changes = state.diff(&newer);
        if !changes.is_empty() {
            debug!("Permission file changed: {} update(s)", changes.len());
        }
        *state = newer;
        Ok(changes)
    }
}

#[async_trait]
impl PermissionBackend for JsonPermissionBackend {
    fn name(&self) -> &str {
        "json-file"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn known_ranks(&self) -> Option<RankSet> {
        let state = self.state.read().await;
        if state.ranks.is_empty() {
            None
        } else {
            Some(state.ranks.clone())
        }
    }

    async fn ranks_of(&self, game_id: GameId) -> Result<RankSet, LookupError> {
        Ok(self
            .state
            .read()
            .await
            .players
            .get(&game_id)
            .map(|record| record.ranks.clone())
            .unwrap_or_default())
    }

    async fn set_ranks(&self, game_id: GameId, ranks: &RankSet) -> Result<(), ApplyError> {
        let mut state = self.state.write().await;
        if !state.ranks.is_empty() {
            if let Some(unknown) = ranks.iter().find(|rank| !state.ranks.contains(rank)) {
                return Err(ApplyError::Rejected(format!("unknown rank '{}'", unknown)));
            }
        }

        let mut updated = state.clone();
        updated.players.entry(game_id).or_default().ranks = ranks.clone();
        write_file(&self.path, &updated)
            .await
            .map_err(|e| ApplyError::Backend(format!("{:#}", e)))?;
        *state = updated;
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<PermissionFile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

async fn write_file(path: &Path, file: &PermissionFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(file)?;
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, json)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("renaming {} to {}", temp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> RankSet {
        items.iter().copied().collect()
    }

    #[tokio::test]
    async fn missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perms").join("permissions.json");

        let backend = JsonPermissionBackend::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(backend.known_ranks().await, Some(set(&["default"])));
        assert!(backend.online_players().await.is_empty());
    }

    #[tokio::test]
    async fn rank_writes_are_persisted_and_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permissions.json");
        tokio::fs::write(&path, r#"{"ranks": ["default", "admin"]}"#).await.unwrap();

        let backend = JsonPermissionBackend::open(&path).await.unwrap();
        let player = GameId::new();
        assert_eq!(backend.ranks_of(player).await.unwrap(), RankSet::new());

        backend.set_ranks(player, &set(&["admin"])).await.unwrap();
        assert!(matches!(
            backend.set_ranks(player, &set(&["owner"])).await,
            Err(ApplyError::Rejected(_))
        ));

        let reopened = JsonPermissionBackend::open(&path).await.unwrap();
        assert_eq!(reopened.ranks_of(player).await.unwrap(), set(&["admin"]));
        // Our own write is not reported as an outside change.
        assert!(backend.reload().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reload_reports_outside_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permissions.json");
        let backend = JsonPermissionBackend::open(&path).await.unwrap();

        let steve = GameId::new();
        let mut edited = PermissionFile::default();
        edited.players.insert(
            steve,
            PlayerRecord {
                name: Some("Steve".to_string()),
                ranks: set(&["default"]),
                online: true,
            },
        );
        tokio::fs::write(&path, serde_json::to_string(&edited).unwrap()).await.unwrap();

        let changes = backend.reload().await.unwrap();
        assert_eq!(
            changes,
            vec![PlayerChange::Online(steve, true), PlayerChange::RanksChanged(steve)]
        );
        assert_eq!(backend.online_players().await, vec![steve]);

        let names = StaticNameResource::new();
        backend.export_names(&names).await;
        assert_eq!(names.len(), 1);

        tokio::fs::write(&path, "{}").await.unwrap();
        let changes = backend.reload().await.unwrap();
        assert_eq!(
            changes,
            vec![PlayerChange::Online(steve, false), PlayerChange::RanksChanged(steve)]
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permissions.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(JsonPermissionBackend::open(&path).await.is_err());
    }
}
