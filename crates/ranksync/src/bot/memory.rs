//! In-process `memory` platform.
//!
//! Behaves like a single guild on a chat service: members with roles and
//! nicknames, a direct message inbox per member, and switches to make the
//! platform unreachable or make it refuse role updates. Bots connected to it
//! can be taken offline individually.

use super::{Bot, BotContext, BotFactory, BotProperties};
use crate::error::{ApplyError, ConnectError, LookupError};
use crate::rank::RankSet;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ranksync_event_system::{
    current_timestamp, BotForceShutdownEvent, EventError, EventSystem, ExternalId,
    LinkCodeSubmittedEvent,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const MEMORY_PLATFORM: &str = "memory";

#[derive(Debug, Clone, Default)]
struct Member {
    roles: RankSet,
    nickname: Option<String>,
}

struct BotSlot {
    events: Arc<EventSystem>,
    online: Arc<AtomicBool>,
}

/// Shared state of the simulated platform.
#[derive(Default)]
pub struct MemoryPlatform {
    members: DashMap<ExternalId, Member>,
    known_roles: DashSet<String>,
    inbox: DashMap<ExternalId, Vec<String>>,
    bots: DashMap<String, BotSlot>,
    unreachable: AtomicBool,
    reject_applies: AtomicBool,
    permission_denied: AtomicBool,
    rate_limit_ms: AtomicU64,
    role_writes: AtomicU64,
}

impl MemoryPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member, or replaces the roles of an existing one.
    pub fn add_member(&self, external_id: impl Into<ExternalId>, roles: RankSet) {
        let external_id = external_id.into();
        self.members
            .entry(external_id)
            .and_modify(|member| member.roles = roles.clone())
            .or_insert_with(|| Member {
                roles,
                nickname: None,
            });
    }

    pub fn remove_member(&self, external_id: &ExternalId) -> bool {
        self.members.remove(external_id).is_some()
    }

    pub fn member_roles(&self, external_id: &ExternalId) -> Option<RankSet> {
        self.members.get(external_id).map(|m| m.roles.clone())
    }

    pub fn nickname(&self, external_id: &ExternalId) -> Option<String> {
        self.members
            .get(external_id)
            .and_then(|m| m.nickname.clone())
    }

    /// Restricts assignable roles. With no roles defined, any role is accepted.
    pub fn define_role(&self, role: impl Into<String>) {
        self.known_roles.insert(role.into());
    }

    pub fn direct_messages(&self, external_id: &ExternalId) -> Vec<String> {
        self.inbox
            .get(external_id)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_reject_applies(&self, reject: bool) {
        self.reject_applies.store(reject, Ordering::SeqCst);
    }

    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Makes every role update fail as rate limited. `None` lifts the limit.
    pub fn set_rate_limit(&self, retry_after_ms: Option<u64>) {
        self.rate_limit_ms
            .store(retry_after_ms.unwrap_or(0), Ordering::SeqCst);
    }

    /// Number of successful role updates across all bots.
    pub fn role_writes(&self) -> u64 {
        self.role_writes.load(Ordering::SeqCst)
    }

    /// Names of the currently connected bots.
    pub fn connected_bots(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bots.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Flips a connected bot's online flag. Returns false for unknown bots.
    pub fn set_bot_online(&self, bot_name: &str, online: bool) -> bool {
        match self.bots.get(bot_name) {
            Some(slot) => {
                slot.online.store(online, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Simulates the platform kicking a bot: it goes offline and a
    /// [`BotForceShutdownEvent`] is published on its event system.
    ///
    /// Returns `Ok(false)` when no bot with that name is connected.
    pub async fn drop_bot(&self, bot_name: &str, reason: &str) -> Result<bool, EventError> {
        let events = match self.bots.get(bot_name) {
            Some(slot) => {
                slot.online.store(false, Ordering::SeqCst);
                slot.events.clone()
            }
            None => return Ok(false),
        };

        info!("💥 Memory platform dropped bot '{}': {}", bot_name, reason);
        let event = BotForceShutdownEvent {
            bot_name: bot_name.to_string(),
            reason: reason.to_string(),
            timestamp: current_timestamp(),
        };
        events.publish(&event).await?;
        Ok(true)
    }

    /// Simulates a member sending a link code to a bot.
    ///
    /// Returns `Ok(false)` when no bot with that name is connected.
    pub async fn submit_code(
        &self,
        bot_name: &str,
        external_id: impl Into<ExternalId>,
        code: &str,
    ) -> Result<bool, EventError> {
        let events = match self.bots.get(bot_name) {
            Some(slot) => slot.events.clone(),
            None => return Ok(false),
        };

        let event = LinkCodeSubmittedEvent {
            bot_name: bot_name.to_string(),
            external_id: external_id.into(),
            code: code.to_string(),
        };
        events.publish(&event).await?;
        Ok(true)
    }
}

/// A bot connected to a [`MemoryPlatform`].
pub struct MemoryBot {
    name: String,
    platform: Arc<MemoryPlatform>,
    online: Arc<AtomicBool>,
}

impl MemoryBot {
    fn ensure_online_for_lookup(&self) -> Result<(), LookupError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(LookupError::BotOffline(self.name.clone()))
        }
    }

    fn ensure_online_for_apply(&self) -> Result<(), ApplyError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ApplyError::BotOffline(self.name.clone()))
        }
    }

    fn ensure_permitted(&self, action: &str) -> Result<(), ApplyError> {
        if self.platform.permission_denied.load(Ordering::SeqCst) {
            return Err(ApplyError::InsufficientPermission(action.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Bot for MemoryBot {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> &str {
        MEMORY_PLATFORM
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.platform
            .bots
            .remove_if(&self.name, |_, slot| Arc::ptr_eq(&slot.online, &self.online));
        debug!("🔌 Memory bot '{}' disconnected", self.name);
    }

    async fn roles_of(&self, external_id: &ExternalId) -> Result<RankSet, LookupError> {
        self.ensure_online_for_lookup()?;
        self.platform
            .member_roles(external_id)
            .ok_or_else(|| LookupError::AccountNotFound(external_id.to_string()))
    }

    async fn set_roles_of(
        &self,
        external_id: &ExternalId,
        roles: &RankSet,
    ) -> Result<(), ApplyError> {
        self.ensure_online_for_apply()?;
        self.ensure_permitted("manage roles")?;

        let retry_after_ms = self.platform.rate_limit_ms.load(Ordering::SeqCst);
        if retry_after_ms > 0 {
            return Err(ApplyError::RateLimited { retry_after_ms });
        }
        if self.platform.reject_applies.load(Ordering::SeqCst) {
            return Err(ApplyError::Rejected("role update refused".to_string()));
        }
        if !self.platform.known_roles.is_empty() {
            let unknown: RankSet = roles
                .iter()
                .filter(|role| !self.platform.known_roles.contains(role.as_str()))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(ApplyError::Rejected(format!("unknown roles {}", unknown)));
            }
        }

        let mut member = self
            .platform
            .members
            .get_mut(external_id)
            .ok_or_else(|| ApplyError::AccountNotFound(external_id.to_string()))?;
        member.roles = roles.clone();
        self.platform.role_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_display_name(&self, external_id: &ExternalId, name: &str) -> Result<(), ApplyError> {
        self.ensure_online_for_apply()?;
        self.ensure_permitted("manage nicknames")?;

        let mut member = self
            .platform
            .members
            .get_mut(external_id)
            .ok_or_else(|| ApplyError::AccountNotFound(external_id.to_string()))?;
        member.nickname = Some(name.to_string());
        Ok(())
    }

    async fn send_direct_message(&self, external_id: &ExternalId, text: &str) -> Result<(), ApplyError> {
        self.ensure_online_for_apply()?;
        if !self.platform.members.contains_key(external_id) {
            return Err(ApplyError::AccountNotFound(external_id.to_string()));
        }
        self.platform
            .inbox
            .entry(external_id.clone())
            .or_default()
            .push(text.to_string());
        Ok(())
    }
}

/// Factory for bots on a shared [`MemoryPlatform`].
pub struct MemoryBotFactory {
    platform: Arc<MemoryPlatform>,
}

impl MemoryBotFactory {
    pub fn new(platform: Arc<MemoryPlatform>) -> Self {
        Self { platform }
    }

    pub fn platform_state(&self) -> &Arc<MemoryPlatform> {
        &self.platform
    }
}

#[async_trait]
impl BotFactory for MemoryBotFactory {
    fn platform(&self) -> &str {
        MEMORY_PLATFORM
    }

    async fn connect(
        &self,
        context: BotContext,
        properties: &BotProperties,
    ) -> Result<Arc<dyn Bot>, ConnectError> {
        properties.require_str("token")?;

        if self.platform.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectError::Unreachable(
                "memory platform is not accepting connections".to_string(),
            ));
        }

        let online = Arc::new(AtomicBool::new(true));
        self.platform.bots.insert(
            context.name.clone(),
            BotSlot {
                events: context.events,
                online: online.clone(),
            },
        );

        info!("🤖 Memory bot '{}' connected", context.name);
        Ok(Arc::new(MemoryBot {
            name: context.name,
            platform: self.platform.clone(),
            online,
        }))
    }
}
