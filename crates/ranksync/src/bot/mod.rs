//! The bot abstraction: one capability surface over every external platform.
//!
//! A platform ships a [`BotFactory`]; the lifecycle manager looks the factory up
//! by platform name in [`BotFactories`], connects it with the configured
//! [`BotProperties`] and keeps the resulting [`Bot`] in a [`BotRegistry`].

pub mod memory;
pub mod properties;
pub mod registry;

pub use memory::{MemoryBot, MemoryBotFactory, MemoryPlatform};
pub use properties::BotProperties;
pub use registry::BotRegistry;

use crate::error::{ApplyError, ConnectError, LookupError};
use crate::rank::RankSet;
use async_trait::async_trait;
use ranksync_event_system::{EventSystem, ExternalId};
use std::collections::HashMap;
use std::sync::Arc;

/// A connected bot on one external platform.
///
/// Every call may suspend on network I/O. Errors are returned to the caller,
/// never swallowed.
#[async_trait]
pub trait Bot: Send + Sync {
    /// Registry name of this bot.
    fn name(&self) -> &str;

    /// Platform the bot was created for.
    fn platform(&self) -> &str;

    fn is_online(&self) -> bool;

    /// Closes the connection. Calling it twice is harmless.
    async fn disconnect(&self);

    async fn roles_of(&self, external_id: &ExternalId) -> Result<RankSet, LookupError>;

    /// Replaces the roles the account holds with exactly `roles`.
    async fn set_roles_of(&self, external_id: &ExternalId, roles: &RankSet)
        -> Result<(), ApplyError>;

    async fn set_display_name(&self, external_id: &ExternalId, name: &str)
        -> Result<(), ApplyError>;

    async fn send_direct_message(&self, external_id: &ExternalId, text: &str)
        -> Result<(), ApplyError>;
}

/// What a factory gets besides its properties.
#[derive(Clone)]
pub struct BotContext {
    /// Name the bot will be registered under
    pub name: String,
    /// Dispatcher for events the platform raises (code submissions and the like)
    pub events: Arc<EventSystem>,
}

/// Creates connected bots for one platform.
#[async_trait]
pub trait BotFactory: Send + Sync {
    fn platform(&self) -> &str;

    async fn connect(
        &self,
        context: BotContext,
        properties: &BotProperties,
    ) -> Result<Arc<dyn Bot>, ConnectError>;
}

/// Bot factories keyed by case-insensitive platform name.
#[derive(Clone, Default)]
pub struct BotFactories {
    factories: HashMap<String, Arc<dyn BotFactory>>,
}

impl BotFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for the same platform.
    pub fn register(&mut self, factory: Arc<dyn BotFactory>) -> &mut Self {
        self.factories
            .insert(factory.platform().to_ascii_lowercase(), factory);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn BotFactory>> {
        self.factories.get(&platform.to_ascii_lowercase()).cloned()
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.factories.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    /// Looks up the factory for `platform` and connects a bot through it.
    pub async fn connect(
        &self,
        platform: &str,
        context: BotContext,
        properties: &BotProperties,
    ) -> Result<Arc<dyn Bot>, ConnectError> {
        let factory = self
            .get(platform)
            .ok_or_else(|| ConnectError::UnknownPlatform(platform.to_string()))?;
        factory.connect(context, properties).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranksync_event_system::create_event_system;

    #[tokio::test]
    async fn factories_resolve_case_insensitively() {
        let platform = MemoryPlatform::new();
        let mut factories = BotFactories::new();
        factories.register(Arc::new(MemoryBotFactory::new(platform)));

        assert!(factories.get("Memory").is_some());
        assert_eq!(factories.platforms(), vec!["memory".to_string()]);

        let context = BotContext {
            name: "main".into(),
            events: create_event_system(),
        };
        let props = BotProperties::new().with("token", "t");
        let bot = factories.connect("MEMORY", context, &props).await.unwrap();
        assert_eq!(bot.name(), "main");
        assert!(bot.is_online());
    }

    #[tokio::test]
    async fn unknown_platform_is_a_connect_error() {
        let factories = BotFactories::new();
        let context = BotContext {
            name: "main".into(),
            events: create_event_system(),
        };
        let result = factories
            .connect("discord", context, &BotProperties::new())
            .await;
        assert!(matches!(result, Err(ConnectError::UnknownPlatform(p)) if p == "discord"));
    }
}
