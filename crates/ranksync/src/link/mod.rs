//! Account linking with short-lived one-time codes.
//!
//! A player asks for a code in game, then hands it to a bot on the external
//! platform. Redeeming the code binds the two accounts into an [`Identity`].
//!
//! All registry state sits behind one async mutex, so issue, redeem and unlink
//! are atomic with respect to each other. Events are published after the lock is
//! released.

pub mod storage;

pub use storage::{JsonLinkStore, LinkStore, MemoryLinkStore};

use crate::error::{RedeemError, StorageResult};
use rand::Rng;
use ranksync_event_system::{
    current_timestamp, EventSystem, ExternalId, GameId, Identity, LinkCodeCreatedEvent,
    PlayerLinkedEvent, PlayerUnlinkedEvent, SyncEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Characters used in codes. Leaves out 0/O and 1/I so codes survive being
/// read aloud or retyped.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_LENGTH: usize = 8;
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(600);

/// A one-time code proving ownership of a game account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCode {
    pub code: String,
    pub game_id: GameId,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Milliseconds since the Unix epoch
    pub expires_at: u64,
}

impl LinkCode {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Persistent form of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub version: u32,
    pub codes: Vec<LinkCode>,
    pub identities: Vec<Identity>,
}

impl LinkSnapshot {
    pub const VERSION: u32 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub code_length: usize,
    pub code_ttl: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            code_ttl: DEFAULT_CODE_TTL,
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    codes: HashMap<String, LinkCode>,
    code_by_player: HashMap<GameId, String>,
    identities: HashMap<GameId, ExternalId>,
    by_external: HashMap<ExternalId, GameId>,
    /// Consumed codes and when they would have expired
    redeemed: HashMap<String, u64>,
}

impl LinkState {
    fn remove_code(&mut self, code: &str) -> Option<LinkCode> {
        let link = self.codes.remove(code)?;
        if self.code_by_player.get(&link.game_id).map(String::as_str) == Some(code) {
            self.code_by_player.remove(&link.game_id);
        }
        Some(link)
    }

    fn remove_identity(&mut self, game_id: GameId) -> Option<ExternalId> {
        let external_id = self.identities.remove(&game_id)?;
        self.by_external.remove(&external_id);
        Some(external_id)
    }
}

/// Issues and redeems link codes and owns the set of linked identities.
pub struct LinkRegistry {
    state: Mutex<LinkState>,
    settings: LinkSettings,
    events: Arc<EventSystem>,
}

impl LinkRegistry {
    pub fn new(settings: LinkSettings, events: Arc<EventSystem>) -> Self {
        Self {
            state: Mutex::new(LinkState::default()),
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Issues a fresh code for `game_id`, invalidating any code it still holds.
    pub async fn issue_code(&self, game_id: GameId) -> LinkCode {
        self.issue_code_at(game_id, current_timestamp()).await
    }

    pub async fn issue_code_at(&self, game_id: GameId, now: u64) -> LinkCode {
        let link = {
            let mut state = self.state.lock().await;

            if let Some(previous) = state.code_by_player.get(&game_id).cloned() {
                state.remove_code(&previous);
                debug!("♻️ Invalidated previous link code for {}", game_id);
            }

            let code = loop {
                let candidate = generate_code(self.settings.code_length);
                if !state.codes.contains_key(&candidate) && !state.redeemed.contains_key(&candidate)
                {
                    break candidate;
                }
            };

            let link = LinkCode {
                code: code.clone(),
                game_id,
                created_at: now,
                expires_at: now.saturating_add(self.settings.code_ttl.as_millis() as u64),
            };
            state.code_by_player.insert(game_id, code.clone());
            state.codes.insert(code, link.clone());
            link
        };

        info!("🔑 Issued link code for {}", game_id);
        self.notify(&LinkCodeCreatedEvent {
            game_id,
            code: link.code.clone(),
            expires_at: link.expires_at,
        })
        .await;
        link
    }

    /// Redeems `code` on behalf of `external_id`.
    ///
    /// Consuming the code and creating the identity happen atomically, so of two
    /// concurrent redemptions of one code exactly one succeeds.
    pub async fn redeem(&self, code: &str, external_id: ExternalId) -> Result<Identity, RedeemError> {
        self.redeem_at(code, external_id, current_timestamp()).await
    }

    pub async fn redeem_at(
        &self,
        code: &str,
        external_id: ExternalId,
        now: u64,
    ) -> Result<Identity, RedeemError> {
        let code = normalize_code(code);

        let (identity, replaced) = {
            let mut state = self.state.lock().await;

            let Some(link) = state.codes.get(&code).cloned() else {
                return Err(if state.redeemed.contains_key(&code) {
                    RedeemError::AlreadyRedeemed
                } else {
                    RedeemError::NotFound
                });
            };

            if link.is_expired_at(now) {
                state.remove_code(&code);
                return Err(RedeemError::Expired);
            }

            if let Some(owner) = state.by_external.get(&external_id) {
                if *owner != link.game_id {
                    return Err(RedeemError::AlreadyLinked(external_id));
                }
            }

            let identity = Identity::linked(link.game_id, external_id.clone())
                .ok_or(RedeemError::NotFound)?;

            state.remove_code(&code);
            state.redeemed.insert(code, link.expires_at);

            let replaced = state
                .remove_identity(link.game_id)
                .filter(|previous| *previous != external_id);
            state.identities.insert(link.game_id, external_id.clone());
            state.by_external.insert(external_id, link.game_id);

            (identity, replaced)
        };

        if let Some(previous) = replaced {
            info!("🔗 {} moved its link away from {}", identity.game_id, previous);
            self.notify(&PlayerUnlinkedEvent {
                game_id: identity.game_id,
                external_id: previous,
                timestamp: now,
            })
            .await;
        }

        info!("🔗 Linked {}", identity);
        self.notify(&PlayerLinkedEvent {
            identity: identity.clone(),
            timestamp: now,
        })
        .await;
        Ok(identity)
    }

    /// Removes the link of `game_id`. Returns the external account it had.
    pub async fn unlink(&self, game_id: GameId) -> Option<ExternalId> {
        let external_id = self.state.lock().await.remove_identity(game_id)?;

        info!("✂️ Unlinked {} from {}", game_id, external_id);
        self.notify(&PlayerUnlinkedEvent {
            game_id,
            external_id: external_id.clone(),
            timestamp: current_timestamp(),
        })
        .await;
        Some(external_id)
    }

    pub async fn identity_of(&self, game_id: GameId) -> Option<Identity> {
        let state = self.state.lock().await;
        let external_id = state.identities.get(&game_id)?.clone();
        Identity::linked(game_id, external_id)
    }

    pub async fn identity_by_external(&self, external_id: &ExternalId) -> Option<Identity> {
        let state = self.state.lock().await;
        let game_id = *state.by_external.get(external_id)?;
        Identity::linked(game_id, external_id.clone())
    }

    pub async fn linked_identities(&self) -> Vec<Identity> {
        let state = self.state.lock().await;
        let mut identities: Vec<Identity> = state
            .identities
            .iter()
            .filter_map(|(game_id, external_id)| Identity::linked(*game_id, external_id.clone()))
            .collect();
        identities.sort_by_key(|identity| identity.game_id);
        identities
    }

    pub async fn linked_count(&self) -> usize {
        self.state.lock().await.identities.len()
    }

    /// The unexpired code `game_id` currently holds, if any.
    pub async fn active_code_for(&self, game_id: GameId) -> Option<LinkCode> {
        let now = current_timestamp();
        let state = self.state.lock().await;
        let code = state.code_by_player.get(&game_id)?;
        state
            .codes
            .get(code)
            .filter(|link| !link.is_expired_at(now))
            .cloned()
    }

    /// Drops expired codes and tombstones. Returns how many codes were dropped.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(current_timestamp()).await
    }

    pub async fn purge_expired_at(&self, now: u64) -> usize {
        let mut state = self.state.lock().await;

        let expired: Vec<String> = state
            .codes
            .values()
            .filter(|link| link.is_expired_at(now))
            .map(|link| link.code.clone())
            .collect();
        for code in &expired {
            state.remove_code(code);
        }
        state.redeemed.retain(|_, expires_at| now < *expires_at);

        if !expired.is_empty() {
            debug!("🧹 Purged {} expired link codes", expired.len());
        }
        expired.len()
    }

    pub async fn snapshot(&self) -> LinkSnapshot {
        let state = self.state.lock().await;
        let mut codes: Vec<LinkCode> = state.codes.values().cloned().collect();
        codes.sort_by(|a, b| a.code.cmp(&b.code));

        let mut identities: Vec<Identity> = state
            .identities
            .iter()
            .filter_map(|(game_id, external_id)| Identity::linked(*game_id, external_id.clone()))
            .collect();
        identities.sort_by_key(|identity| identity.game_id);

        LinkSnapshot {
            version: LinkSnapshot::VERSION,
            codes,
            identities,
        }
    }

    /// Replaces the registry contents with `snapshot`.
    ///
    /// Expired codes are dropped. Entries that would break uniqueness on either
    /// half of an identity are skipped with a warning.
    pub async fn restore(&self, snapshot: LinkSnapshot) {
        self.restore_at(snapshot, current_timestamp()).await
    }

    pub async fn restore_at(&self, snapshot: LinkSnapshot, now: u64) {
        let mut state = LinkState::default();

        for identity in snapshot.identities {
            let Some(external_id) = identity.external_id else {
                continue;
            };
            if identity.game_id.is_nil()
                || state.identities.contains_key(&identity.game_id)
                || state.by_external.contains_key(&external_id)
            {
                warn!("⚠️ Skipping duplicate stored link {} <-> {}", identity.game_id, external_id);
                continue;
            }
            state.by_external.insert(external_id.clone(), identity.game_id);
            state.identities.insert(identity.game_id, external_id);
        }

        for link in snapshot.codes {
            if link.is_expired_at(now) || state.code_by_player.contains_key(&link.game_id) {
                continue;
            }
            state.code_by_player.insert(link.game_id, link.code.clone());
            state.codes.insert(link.code.clone(), link);
        }

        info!(
            "📂 Restored {} identities and {} active link codes",
            state.identities.len(),
            state.codes.len()
        );
        *self.state.lock().await = state;
    }

    /// Loads the store's snapshot, if it has one.
    pub async fn load_from(&self, store: &dyn LinkStore) -> StorageResult<bool> {
        match store.load().await? {
            Some(snapshot) => {
                self.restore(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn flush_to(&self, store: &dyn LinkStore) -> StorageResult<()> {
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await
    }

    async fn notify<E: SyncEvent>(&self, event: &E) {
        if let Err(e) = self.events.publish(event).await {
            warn!("⚠️ Failed to publish {}: {}", E::EVENT_NAME, e);
        }
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
