//! Display-name lookup for game accounts.

use async_trait::async_trait;
use dashmap::DashMap;
use ranksync_event_system::GameId;

/// Resolves the display name of a game account.
///
/// Hosts supply one per deployment through
/// [`RankSyncHost::create_name_resource`](crate::host::RankSyncHost::create_name_resource).
#[async_trait]
pub trait NameResource: Send + Sync {
    /// The player's current display name, if the host knows it.
    async fn display_name(&self, game_id: GameId) -> Option<String>;
}

/// Name resource backed by a concurrent map the host keeps up to date.
#[derive(Debug, Default)]
pub struct StaticNameResource {
    names: DashMap<GameId, String>,
}

impl StaticNameResource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&self, game_id: GameId, name: impl Into<String>) {
        self.names.insert(game_id, name.into());
    }

    pub fn remove(&self, game_id: GameId) -> Option<String> {
        self.names.remove(&game_id).map(|(_, name)| name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[async_trait]
impl NameResource for StaticNameResource {
    async fn display_name(&self, game_id: GameId) -> Option<String> {
        self.names.get(&game_id).map(|name| name.value().clone())
    }
}
