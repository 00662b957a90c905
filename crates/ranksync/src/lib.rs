//! # RankSync
//!
//! Keeps the ranks of a game server and the roles of an external community
//! platform consistent for players who linked their accounts.
//!
//! The crate is the synchronization core. The host server plugs in through
//! [`RankSyncHost`] (configuration, permission system, display names, timers)
//! and platforms plug in through [`BotFactory`]. Everything is started and
//! stopped by a [`LifecycleManager`]:
//!
//! ```rust,no_run
//! # use ranksync::*;
//! # use std::sync::Arc;
//! # async fn demo(host: Arc<dyn RankSyncHost>) -> Result<(), LifecycleError> {
//! let platform = MemoryPlatform::new();
//! let mut factories = BotFactories::new();
//! factories.register(Arc::new(MemoryBotFactory::new(platform)));
//!
//! let manager = LifecycleManager::new(host, factories);
//! manager.enable().await?;
//! // ...
//! manager.shutdown("server stopping").await?;
//! # Ok(())
//! # }
//! ```

pub mod bot;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod link;
pub mod name;
pub mod rank;
pub mod reconcile;

pub use bot::{
    Bot, BotContext, BotFactories, BotFactory, BotProperties, BotRegistry, MemoryBot,
    MemoryBotFactory, MemoryPlatform,
};
pub use config::{ConfigProvider, SyncSettings};
pub use error::*;
pub use host::{RankSyncHost, TaskControl, TimerTask, TokioTaskTimer};
pub use lifecycle::{shutdown_with_timeout, LifecycleManager, LifecycleState};
pub use link::{JsonLinkStore, LinkCode, LinkRegistry, LinkSettings, LinkSnapshot, LinkStore, MemoryLinkStore};
pub use name::{NameResource, StaticNameResource};
pub use rank::{
    ExternalRankResource, GameRankResource, MappingEntry, MemoryPermissionBackend,
    PermissionBackend, RankMapping, RankResource, RankSet, Side, SyncDirection,
};
pub use reconcile::{
    plan_reconciliation, plan_reconciliation_with, RankDelta, RankReconciler, ReconcileLanes,
    ReconcileOutcome, ReconcilePlan, ReconcileReport, SyncPolicy,
};

pub use ranksync_event_system as events;
pub use ranksync_event_system::{ExternalId, GameId, Identity};
