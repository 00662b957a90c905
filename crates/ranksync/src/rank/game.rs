//! Game-side rank resource on top of the host's permission system.

use super::{RankMapping, RankResource, RankSet, Side};
use crate::error::{ApplyError, LookupError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ranksync_event_system::{GameId, Identity};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The host permission system (groups, ranks) as seen by the sync core.
#[async_trait]
pub trait PermissionBackend: Send + Sync {
    /// Name used in logs, e.g. the permission plugin the host runs.
    fn name(&self) -> &str;

    /// Whether the backend is loaded and reachable.
    fn is_available(&self) -> bool;

    /// Every rank the backend knows about, if it can enumerate them.
    async fn known_ranks(&self) -> Option<RankSet>;

    async fn ranks_of(&self, game_id: GameId) -> Result<RankSet, LookupError>;

    async fn set_ranks(&self, game_id: GameId, ranks: &RankSet) -> Result<(), ApplyError>;
}

/// In-process permission backend.
///
/// Players without an entry hold no ranks. Every successful `set_ranks` call is
/// counted so tests can assert that nothing was written.
#[derive(Debug, Default)]
pub struct MemoryPermissionBackend {
    ranks: DashMap<GameId, RankSet>,
    known: DashSet<String>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryPermissionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that knows exactly `ranks`.
    pub fn with_known_ranks(ranks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let backend = Self::default();
        for rank in ranks {
            backend.known.insert(rank.into());
        }
        backend
    }

    pub fn define_rank(&self, rank: impl Into<String>) {
        self.known.insert(rank.into());
    }

    /// Sets a player's ranks out of band, as an admin command on the host would.
    pub fn grant(&self, game_id: GameId, ranks: RankSet) {
        self.ranks.insert(game_id, ranks);
    }

    /// Current ranks without going through the async interface.
    pub fn ranks(&self, game_id: GameId) -> RankSet {
        self.ranks
            .get(&game_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionBackend for MemoryPermissionBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn known_ranks(&self) -> Option<RankSet> {
        if self.known.is_empty() {
            return None;
        }
        Some(self.known.iter().map(|rank| rank.key().clone()).collect())
    }

    async fn ranks_of(&self, game_id: GameId) -> Result<RankSet, LookupError> {
        if !self.is_available() {
            return Err(LookupError::Backend("permission backend unavailable".to_string()));
        }
        Ok(self.ranks(game_id))
    }

    async fn set_ranks(&self, game_id: GameId, ranks: &RankSet) -> Result<(), ApplyError> {
        if !self.is_available() {
            return Err(ApplyError::Backend("permission backend unavailable".to_string()));
        }
        self.ranks.insert(game_id, ranks.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`RankResource`] for the game side of an identity.
#[derive(Clone)]
pub struct GameRankResource {
    backend: Arc<dyn PermissionBackend>,
}

impl GameRankResource {
    /// Wraps `backend` without checking it.
    pub fn new(backend: Arc<dyn PermissionBackend>) -> Self {
        Self { backend }
    }

    /// Wraps `backend` only if it is reachable and knows every mapped rank.
    ///
    /// Returns `None` otherwise; the caller must not start reconciling.
    pub async fn validate(
        backend: Arc<dyn PermissionBackend>,
        mapping: &RankMapping,
    ) -> Option<Self> {
        if !backend.is_available() {
            warn!("⚠️ Permission backend '{}' is not available", backend.name());
            return None;
        }

        if let Some(known) = backend.known_ranks().await {
            let missing = mapping.game_ranks().difference(&known);
            if !missing.is_empty() {
                warn!(
                    "⚠️ Permission backend '{}' does not know mapped ranks {}",
                    backend.name(),
                    missing
                );
                return None;
            }
        }

        debug!("Permission backend '{}' validated", backend.name());
        Some(Self { backend })
    }

    pub fn backend(&self) -> &Arc<dyn PermissionBackend> {
        &self.backend
    }
}

#[async_trait]
impl RankResource for GameRankResource {
    fn side(&self) -> Side {
        Side::Game
    }

    async fn current_ranks(&self, identity: &Identity) -> Result<RankSet, LookupError> {
        self.backend.ranks_of(identity.game_id).await
    }

    async fn apply_ranks(&self, identity: &Identity, ranks: &RankSet) -> Result<(), ApplyError> {
        self.backend.set_ranks(identity.game_id, ranks).await
    }

    fn is_available(&self) -> bool {
        self.backend.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::{MappingEntry, SyncDirection};

    fn mapping() -> RankMapping {
        RankMapping::from_entries([MappingEntry::new(
            "Admin",
            ["admin", "mod"].into_iter().collect(),
            SyncDirection::GameToExternal,
        )])
        .unwrap()
    }

    #[tokio::test]
    async fn validation_requires_an_available_backend() {
        let backend = Arc::new(MemoryPermissionBackend::new());
        backend.set_available(false);
        assert!(GameRankResource::validate(backend.clone(), &mapping()).await.is_none());

        backend.set_available(true);
        assert!(GameRankResource::validate(backend, &mapping()).await.is_some());
    }

    #[tokio::test]
    async fn validation_rejects_unknown_mapped_ranks() {
        let backend = Arc::new(MemoryPermissionBackend::with_known_ranks(["admin"]));
        assert!(GameRankResource::validate(backend.clone(), &mapping()).await.is_none());

        backend.define_rank("mod");
        assert!(GameRankResource::validate(backend, &mapping()).await.is_some());
    }

    #[tokio::test]
    async fn reads_and_writes_go_to_the_backend() {
        let backend = Arc::new(MemoryPermissionBackend::new());
        let resource = GameRankResource::new(backend.clone());
        let identity = Identity::pending(GameId::new()).unwrap();

        assert!(resource.current_ranks(&identity).await.unwrap().is_empty());

        let ranks: RankSet = ["admin"].into_iter().collect();
        resource.apply_ranks(&identity, &ranks).await.unwrap();
        assert_eq!(backend.ranks(identity.game_id), ranks);
        assert_eq!(backend.writes(), 1);
    }
}
