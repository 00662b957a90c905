//! Startup and shutdown of the whole sync core.
//!
//! [`LifecycleManager`] is an explicitly constructed, cheaply cloneable handle.
//! `enable()` builds every component of one run into an `ActiveRuntime` and only
//! publishes it once everything is wired, so a failed startup leaves nothing
//! behind. Event handlers and timers hold weak references to that runtime and go
//! quiet as soon as it is torn down.

use crate::bot::{Bot, BotContext, BotFactories, BotRegistry};
use crate::config::{DatabaseKind, SyncSettings};
use crate::error::{LifecycleError, LifecycleResult};
use crate::host::{RankSyncHost, TaskControl, TimerTask};
use crate::link::{JsonLinkStore, LinkRegistry, LinkStore, MemoryLinkStore};
use crate::name::NameResource;
use crate::rank::{ExternalRankResource, RankMapping, RankResource};
use crate::reconcile::{RankReconciler, ReconcileLanes, ReconcileReport};
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use ranksync_event_system::{
    current_timestamp, BotEnabledEvent, BotForceShutdownEvent, EventError, EventSystem, GameId,
    LinkCodeSubmittedEvent, PlayerLinkedEvent, PlayerOnlineStatusChangedEvent,
    PlayerRanksChangedEvent, PlayerUnlinkedEvent, SubscriptionId, SyncEvent,
};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Where the core is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    /// Running with at least one bot lost
    Degraded,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Everything that exists only while the core is enabled.
struct ActiveRuntime {
    mapping: Arc<RankMapping>,
    links: Arc<LinkRegistry>,
    store: Arc<dyn LinkStore>,
    names: Arc<dyn NameResource>,
    bots: BotRegistry,
    externals: DashMap<String, Arc<ExternalRankResource>>,
    lanes: ReconcileLanes,
    online: DashSet<GameId>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ActiveRuntime {
    fn is_closed(&self) -> bool {
        self.lanes.is_closed()
    }

    fn enqueue_online(&self) -> usize {
        let mut queued = 0;
        for game_id in self.online.iter() {
            if self.lanes.enqueue(*game_id) {
                queued += 1;
            }
        }
        queued
    }

    async fn answer_code(&self, event: LinkCodeSubmittedEvent) {
        let reply = match self.links.redeem(&event.code, event.external_id.clone()).await {
            Ok(identity) => {
                let who = self
                    .names
                    .display_name(identity.game_id)
                    .await
                    .unwrap_or_else(|| identity.game_id.to_string());
                format!("Your account is now linked to {}.", who)
            }
            Err(e) => {
                debug!("Link code from {} rejected: {}", event.external_id, e);
                format!("Linking failed: {}", e)
            }
        };

        let Some(bot) = self.bots.get(&event.bot_name).await else {
            warn!("⚠️ Cannot answer link request, bot '{}' is gone", event.bot_name);
            return;
        };
        if let Err(e) = bot.send_direct_message(&event.external_id, &reply).await {
            warn!("⚠️ Failed to message {} via '{}': {}", event.external_id, event.bot_name, e);
        }
    }

    async fn flush(&self) {
        if let Err(e) = self.links.flush_to(self.store.as_ref()).await {
            error!("❌ Failed to save link state: {}", e);
        }
    }
}

struct Inner {
    host: Arc<dyn RankSyncHost>,
    factories: BotFactories,
    events: Arc<EventSystem>,
    state: RwLock<LifecycleState>,
    /// Serializes enable, shutdown and bot removal.
    transition: Mutex<()>,
    runtime: RwLock<Option<Arc<ActiveRuntime>>>,
}

/// Handle that owns startup and shutdown ordering.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(host: Arc<dyn RankSyncHost>, factories: BotFactories) -> Self {
        Self::with_events(host, factories, Arc::new(EventSystem::new()))
    }

    /// Uses an existing dispatcher, e.g. one the host already publishes to.
    pub fn with_events(
        host: Arc<dyn RankSyncHost>,
        factories: BotFactories,
        events: Arc<EventSystem>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                factories,
                events,
                state: RwLock::new(LifecycleState::Stopped),
                transition: Mutex::new(()),
                runtime: RwLock::new(None),
            }),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.inner.state.read().await
    }

    pub fn events(&self) -> Arc<EventSystem> {
        self.inner.events.clone()
    }

    pub async fn get_bot(&self, name: &str) -> Option<Arc<dyn Bot>> {
        self.runtime().await?.bots.get(name).await
    }

    pub async fn get_bots(&self) -> Vec<Arc<dyn Bot>> {
        match self.runtime().await {
            Some(runtime) => runtime.bots.all().await,
            None => Vec::new(),
        }
    }

    /// The rank mapping of the current run, keyed by external role.
    pub async fn get_synced_ranks(&self) -> Option<Arc<RankMapping>> {
        Some(self.runtime().await?.mapping.clone())
    }

    pub async fn link_registry(&self) -> Option<Arc<LinkRegistry>> {
        Some(self.runtime().await?.links.clone())
    }

    pub async fn online_players(&self) -> Vec<GameId> {
        match self.runtime().await {
            Some(runtime) => runtime.online.iter().map(|id| *id).collect(),
            None => Vec::new(),
        }
    }

    /// Queues a reconciliation pass for one player.
    pub async fn request_resync(&self, game_id: GameId) -> bool {
        match self.runtime().await {
            Some(runtime) => runtime.lanes.enqueue(game_id),
            None => false,
        }
    }

    /// Queues a pass for one player and waits for its reports.
    pub async fn resync_and_wait(&self, game_id: GameId) -> Option<Vec<ReconcileReport>> {
        let lanes = self.runtime().await?.lanes.clone();
        lanes.enqueue_and_wait(game_id).await
    }

    /// Runs the full startup sequence.
    ///
    /// Configuration, dependency validation and restoring link state must all
    /// succeed or the manager stays `Stopped` with nothing registered. Bots that
    /// fail to connect are only logged and announced through
    /// [`BotForceShutdownEvent`].
    pub async fn enable(&self) -> LifecycleResult<()> {
        let _transition = self.inner.transition.lock().await;

        let current = self.state().await;
        if current != LifecycleState::Stopped {
            return Err(LifecycleError::InvalidState {
                action: "enable",
                state: current.to_string(),
            });
        }
        self.set_state(LifecycleState::Starting).await;

        match self.start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("❌ Failed to enable RankSync: {}", e);
                self.set_state(LifecycleState::Stopped).await;
                Err(e)
            }
        }
    }

    /// Stops everything: listeners, lanes and bots (newest first), then saves
    /// link state. Calling it while stopped does nothing.
    pub async fn shutdown(&self, reason: &str) -> LifecycleResult<()> {
        let _transition = self.inner.transition.lock().await;
        self.shutdown_locked(reason).await
    }

    async fn start(&self) -> LifecycleResult<()> {
        let started = Instant::now();
        let host = self.inner.host.clone();
        info!("🚀 Enabling RankSync");

        let settings = SyncSettings::from_provider(host.config())?;
        let names = host.create_name_resource();
        let mapping = Arc::new(settings.mapping.clone());

        let game: Arc<dyn RankResource> = host.validate_dependencies(&mapping).await.ok_or_else(|| {
            LifecycleError::ValidationFailed(
                "the permission system is missing, unavailable or lacks mapped ranks".to_string(),
            )
        })?;

        let store: Arc<dyn LinkStore> = match settings.database.kind {
            DatabaseKind::Json => Arc::new(JsonLinkStore::new(host.data_folder())),
            DatabaseKind::Memory => Arc::new(MemoryLinkStore::new()),
        };
        let links = Arc::new(LinkRegistry::new(settings.link, self.inner.events.clone()));
        links.load_from(store.as_ref()).await?;

        let bots = BotRegistry::new();
        let mut failures = Vec::new();
        for bot_settings in &settings.bots {
            let context = BotContext {
                name: bot_settings.name.clone(),
                events: self.inner.events.clone(),
            };
            let properties = settings.bot_properties(bot_settings, host.data_folder());
            match self
                .inner
                .factories
                .connect(&bot_settings.platform, context, &properties)
                .await
            {
                Ok(bot) => {
                    info!("✅ Bot '{}' connected ({})", bot.name(), bot.platform());
                    bots.insert(bot).await;
                }
                Err(e) => {
                    warn!("⚠️ Bot '{}' failed to connect: {}", bot_settings.name, e);
                    failures.push((bot_settings.name.clone(), e.to_string()));
                }
            }
        }

        let externals = DashMap::new();
        let mut reconcilers = Vec::new();
        for bot in bots.all().await {
            let external = Arc::new(ExternalRankResource::new(bot.clone(), names.clone()));
            externals.insert(bot.name().to_string(), external.clone());
            reconcilers.push(Arc::new(RankReconciler::new(
                bot.name(),
                game.clone(),
                external,
                mapping.clone(),
                settings.policy,
            )));
        }
        let lanes = ReconcileLanes::new(links.clone(), reconcilers);

        let runtime = Arc::new(ActiveRuntime {
            mapping,
            links,
            store,
            names,
            bots,
            externals,
            lanes,
            online: DashSet::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        if let Err(e) = self.register_listeners(&runtime).await {
            self.teardown(&runtime).await;
            return Err(e.into());
        }
        self.start_timers(&runtime, &settings);

        let connected = runtime.bots.len().await;
        *self.inner.runtime.write().await = Some(runtime.clone());
        self.set_state(if failures.is_empty() {
            LifecycleState::Running
        } else {
            LifecycleState::Degraded
        })
        .await;

        info!(
            "✅ RankSync enabled in {} ms with {} bot(s) and {} mapped role(s)",
            started.elapsed().as_millis(),
            connected,
            runtime.mapping.len()
        );

        for bot in runtime.bots.all().await {
            self.publish(&BotEnabledEvent {
                bot_name: bot.name().to_string(),
                timestamp: current_timestamp(),
            })
            .await;
        }
        for (bot_name, reason) in failures {
            self.publish(&BotForceShutdownEvent {
                bot_name,
                reason,
                timestamp: current_timestamp(),
            })
            .await;
        }

        if connected == 0 {
            warn!("⚠️ No bot could be connected, shutting down");
            self.shutdown_locked("no bot could be connected").await?;
        }
        Ok(())
    }

    async fn shutdown_locked(&self, reason: &str) -> LifecycleResult<()> {
        let Some(runtime) = self.inner.runtime.write().await.take() else {
            return Ok(());
        };

        self.set_state(LifecycleState::Stopping).await;
        info!("🛑 Shutting down RankSync: {}", reason);

        self.teardown(&runtime).await;
        let flushed = runtime.links.flush_to(runtime.store.as_ref()).await;

        self.set_state(LifecycleState::Stopped).await;
        info!("✅ RankSync stopped");
        flushed.map_err(LifecycleError::from)
    }

    /// Unsubscribes listeners, closes the lanes and disconnects every bot.
    async fn teardown(&self, runtime: &ActiveRuntime) {
        let subscriptions: Vec<SubscriptionId> = runtime.subscriptions.lock().await.drain(..).collect();
        for id in subscriptions {
            self.inner.events.unsubscribe(id).await;
        }
        runtime.lanes.close();

        for bot in runtime.bots.drain_reverse().await {
            bot.disconnect().await;
            info!("🔌 Bot '{}' disconnected", bot.name());
        }
    }

    /// Takes one bot out of service after it was force-shut-down.
    async fn remove_bot(&self, expected: &Weak<ActiveRuntime>, event: BotForceShutdownEvent) {
        let _transition = self.inner.transition.lock().await;

        // Only act on the run the event belongs to.
        let Some(runtime) = self.runtime().await else {
            return;
        };
        if !Weak::ptr_eq(expected, &Arc::downgrade(&runtime)) {
            return;
        }

        if let Some(bot) = runtime.bots.remove(&event.bot_name).await {
            warn!("⚠️ Bot '{}' was force-shut-down: {}", event.bot_name, event.reason);
            runtime.lanes.remove_bot(&event.bot_name).await;
            runtime.externals.remove(&event.bot_name);
            bot.disconnect().await;
        }

        if runtime.bots.is_empty().await {
            if let Err(e) = self.shutdown_locked("all bots are down").await {
                error!("❌ Shutdown after losing all bots failed: {}", e);
            }
        } else if self.state().await == LifecycleState::Running {
            self.set_state(LifecycleState::Degraded).await;
        }
    }

    async fn register_listeners(&self, runtime: &Arc<ActiveRuntime>) -> Result<(), EventError> {
        let events = &self.inner.events;
        let mut ids = Vec::new();

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: PlayerOnlineStatusChangedEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        // Both transitions trigger a pass; logging off syncs
                        // whatever changed during the session.
                        if event.online {
                            runtime.online.insert(event.game_id);
                        } else {
                            runtime.online.remove(&event.game_id);
                        }
                        runtime.lanes.enqueue(event.game_id);
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: PlayerLinkedEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        runtime.lanes.enqueue(event.identity.game_id);
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: PlayerUnlinkedEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        for external in runtime.externals.iter() {
                            external.forget(&event.external_id);
                        }
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: PlayerRanksChangedEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        runtime.lanes.enqueue(event.game_id);
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: BotEnabledEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        let queued = runtime.enqueue_online();
                        debug!("Bot '{}' enabled, queued {} passes", event.bot_name, queued);
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        ids.push(
            events
                .subscribe(move |event: LinkCodeSubmittedEvent| {
                    if let Some(runtime) = weak.upgrade() {
                        tokio::spawn(async move { runtime.answer_code(event).await });
                    }
                    Ok(())
                })
                .await?,
        );

        let weak = Arc::downgrade(runtime);
        let manager = Arc::downgrade(&self.inner);
        ids.push(
            events
                .subscribe(move |event: BotForceShutdownEvent| {
                    if let Some(inner) = manager.upgrade() {
                        let expected = weak.clone();
                        tokio::spawn(async move {
                            LifecycleManager { inner }.remove_bot(&expected, event).await;
                        });
                    }
                    Ok(())
                })
                .await?,
        );

        debug!("📡 Registered {} listeners", ids.len());
        runtime.subscriptions.lock().await.extend(ids);
        Ok(())
    }

    fn start_timers(&self, runtime: &Arc<ActiveRuntime>, settings: &SyncSettings) {
        let host = &self.inner.host;

        if let Some(period) = settings.timers.purge_interval {
            host.run_task_timer(
                runtime_task(runtime, |runtime| async move {
                    runtime.links.purge_expired().await;
                }),
                period,
                period,
            );
        }
        if let Some(period) = settings.timers.flush_interval {
            host.run_task_timer(
                runtime_task(runtime, |runtime| async move { runtime.flush().await }),
                period,
                period,
            );
        }
        if let Some(period) = settings.timers.resync_interval {
            host.run_task_timer(
                runtime_task(runtime, |runtime| async move {
                    let queued = runtime.enqueue_online();
                    debug!("Periodic resync queued {} passes", queued);
                }),
                period,
                period,
            );
        }
    }

    async fn runtime(&self) -> Option<Arc<ActiveRuntime>> {
        self.inner.runtime.read().await.clone()
    }

    async fn set_state(&self, state: LifecycleState) {
        *self.inner.state.write().await = state;
    }

    async fn publish<E: SyncEvent>(&self, event: &E) {
        if let Err(e) = self.inner.events.publish(event).await {
            warn!("⚠️ Failed to publish {}: {}", E::EVENT_NAME, e);
        }
    }
}

/// Wraps `work` into a timer task that stops once its run is over.
fn runtime_task<F, Fut>(runtime: &Arc<ActiveRuntime>, work: F) -> TimerTask
where
    F: Fn(Arc<ActiveRuntime>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(runtime);
    let work = Arc::new(work);
    Arc::new(move || -> BoxFuture<'static, TaskControl> {
        let weak = weak.clone();
        let work = work.clone();
        Box::pin(async move {
            match weak.upgrade() {
                Some(runtime) if !runtime.is_closed() => {
                    work(runtime).await;
                    TaskControl::Continue
                }
                _ => TaskControl::Stop,
            }
        })
    })
}

/// Convenience for hosts that want a fixed grace period before stopping.
pub async fn shutdown_with_timeout(
    manager: &LifecycleManager,
    reason: &str,
    timeout: Duration,
) -> LifecycleResult<()> {
    match tokio::time::timeout(timeout, manager.shutdown(reason)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("⚠️ Shutdown did not finish within {:?}", timeout);
            Ok(())
        }
    }
}
