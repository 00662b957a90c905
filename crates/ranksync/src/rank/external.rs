//! External-side rank resource: one bot plus the name resource.

use super::{RankResource, RankSet, Side};
use crate::bot::Bot;
use crate::error::{ApplyError, LookupError};
use crate::name::NameResource;
use async_trait::async_trait;
use dashmap::DashMap;
use ranksync_event_system::{ExternalId, Identity};
use std::sync::Arc;
use tracing::debug;

/// [`RankResource`] for the external side of an identity, served by one bot.
pub struct ExternalRankResource {
    bot: Arc<dyn Bot>,
    names: Arc<dyn NameResource>,
    /// Last display name pushed per account, so unchanged names are not resent.
    pushed_names: DashMap<ExternalId, String>,
}

impl ExternalRankResource {
    pub fn new(bot: Arc<dyn Bot>, names: Arc<dyn NameResource>) -> Self {
        Self {
            bot,
            names,
            pushed_names: DashMap::new(),
        }
    }

    pub fn bot(&self) -> &Arc<dyn Bot> {
        &self.bot
    }

    /// Drops the cached name for an account so the next sync resends it.
    pub fn forget(&self, external_id: &ExternalId) {
        self.pushed_names.remove(external_id);
    }

    fn external_id<'a>(&self, identity: &'a Identity) -> Result<&'a ExternalId, LookupError> {
        identity
            .external_id
            .as_ref()
            .ok_or_else(|| LookupError::AccountNotFound(format!("{} (not linked)", identity.game_id)))
    }
}

#[async_trait]
impl RankResource for ExternalRankResource {
    fn side(&self) -> Side {
        Side::External
    }

    async fn current_ranks(&self, identity: &Identity) -> Result<RankSet, LookupError> {
        let external_id = self.external_id(identity)?;
        if !self.bot.is_online() {
            return Err(LookupError::BotOffline(self.bot.name().to_string()));
        }
        self.bot.roles_of(external_id).await
    }

    async fn apply_ranks(&self, identity: &Identity, ranks: &RankSet) -> Result<(), ApplyError> {
        let external_id = self.external_id(identity)?;
        if !self.bot.is_online() {
            return Err(ApplyError::BotOffline(self.bot.name().to_string()));
        }
        self.bot.set_roles_of(external_id, ranks).await
    }

    fn is_available(&self) -> bool {
        self.bot.is_online()
    }

    async fn sync_name(&self, identity: &Identity) -> Result<bool, ApplyError> {
        let external_id = self.external_id(identity)?;
        let Some(name) = self.names.display_name(identity.game_id).await else {
            return Ok(false);
        };

        if self
            .pushed_names
            .get(external_id)
            .is_some_and(|pushed| *pushed == name)
        {
            return Ok(false);
        }

        self.bot.set_display_name(external_id, &name).await?;
        debug!("🏷️ Pushed display name '{}' for {}", name, identity);
        self.pushed_names.insert(external_id.clone(), name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{BotContext, BotFactory, BotProperties, MemoryBotFactory, MemoryPlatform};
    use crate::name::StaticNameResource;
    use ranksync_event_system::{create_event_system, GameId};

    async fn setup() -> (Arc<MemoryPlatform>, Arc<StaticNameResource>, ExternalRankResource) {
        let platform = MemoryPlatform::new();
        let bot = MemoryBotFactory::new(platform.clone())
            .connect(
                BotContext {
                    name: "main".into(),
                    events: create_event_system(),
                },
                &BotProperties::new().with("token", "t"),
            )
            .await
            .unwrap();
        let names = Arc::new(StaticNameResource::new());
        let resource = ExternalRankResource::new(bot, names.clone());
        (platform, names, resource)
    }

    #[tokio::test]
    async fn unlinked_identity_is_a_lookup_error() {
        let (_platform, _names, resource) = setup().await;
        let pending = Identity::pending(GameId::new()).unwrap();
        assert!(matches!(
            resource.current_ranks(&pending).await,
            Err(LookupError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn offline_bot_short_circuits() {
        let (platform, _names, resource) = setup().await;
        platform.add_member("7", RankSet::new());
        let identity = Identity::linked(GameId::new(), ExternalId::new("7")).unwrap();

        platform.set_bot_online("main", false);
        assert!(!resource.is_available());
        assert!(matches!(
            resource.current_ranks(&identity).await,
            Err(LookupError::BotOffline(_))
        ));
    }

    #[tokio::test]
    async fn names_are_pushed_once_until_they_change() {
        let (platform, names, resource) = setup().await;
        let external = ExternalId::new("7");
        platform.add_member("7", RankSet::new());
        let identity = Identity::linked(GameId::new(), external.clone()).unwrap();

        assert!(!resource.sync_name(&identity).await.unwrap());

        names.set_name(identity.game_id, "Steve");
        assert!(resource.sync_name(&identity).await.unwrap());
        assert!(!resource.sync_name(&identity).await.unwrap());
        assert_eq!(platform.nickname(&external).as_deref(), Some("Steve"));

        names.set_name(identity.game_id, "Alex");
        assert!(resource.sync_name(&identity).await.unwrap());
        assert_eq!(platform.nickname(&external).as_deref(), Some("Alex"));
    }
}
