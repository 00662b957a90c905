//! RankSync reference server
//!
//! Loads the config file, wires the JSON permission file and the in-process
//! platform into the sync core, and runs until a signal or the console's
//! `stop` command.

mod cli;
mod config;
mod console;
mod host;
mod logging;
mod permissions;
mod signals;

use anyhow::{Context, Result};
use cli::CliArgs;
use config::LoadedConfig;
use console::Console;
use host::ServerHost;
use permissions::{JsonPermissionBackend, PlayerChange};
use ranksync::events::{EventSystem, PlayerOnlineStatusChangedEvent, PlayerRanksChangedEvent};
use ranksync::{
    shutdown_with_timeout, BotFactories, LifecycleManager, LifecycleState, MemoryBotFactory,
    MemoryPlatform, StaticNameResource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Application {
    config: LoadedConfig,
    console: bool,
    manager: LifecycleManager,
    platform: Arc<MemoryPlatform>,
    permissions: Arc<JsonPermissionBackend>,
    names: Arc<StaticNameResource>,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self> {
        let mut config = LoadedConfig::load_from_file(&args.config_path).await?;
        config.apply_overrides(&args);
        config
            .app
            .validate()
            .context("Configuration validation failed")?;

        logging::setup_logging(&config.app.logging)?;

        let data_dir = config.app.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let permissions = Arc::new(JsonPermissionBackend::open(config.app.permission_file()).await?);
        let names = Arc::new(StaticNameResource::new());
        permissions.export_names(&names).await;

        let platform = MemoryPlatform::new();
        let mut factories = BotFactories::new();
        factories.register(Arc::new(MemoryBotFactory::new(platform.clone())));

        let host = Arc::new(ServerHost::new(
            config.raw.clone(),
            data_dir,
            permissions.clone(),
            names.clone(),
        ));
        let manager = LifecycleManager::new(host, factories);

        info!(
            "📂 Config: {} | Data: {} | Permissions: {}",
            args.config_path.display(),
            config.app.server.data_dir,
            permissions.path().display()
        );

        Ok(Self {
            config,
            console: args.console,
            manager,
            platform,
            permissions,
            names,
        })
    }

    pub async fn run(self) -> Result<()> {
        let version = env!("CARGO_PKG_VERSION");
        info!("🌟 Starting {} (RankSync v{})", self.config.app.server.name, version);

        self.manager.enable().await?;
        if self.manager.state().await == LifecycleState::Stopped {
            warn!("⚠️ Sync core stopped right after startup, check the bot configuration");
        }

        let events = self.manager.events();
        for game_id in self.permissions.online_players().await {
            publish_change(&events, PlayerChange::Online(game_id, true)).await;
        }

        let watcher = self.spawn_permission_watcher(events.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        let console = if self.console {
            let console = Console::new(self.manager.clone(), self.platform.clone(), self.permissions.clone());
            info!("⌨️ Console ready, type 'help' for commands");
            Some(tokio::spawn(console.run(BufReader::new(tokio::io::stdin()), stop_tx)))
        } else {
            None
        };

        info!("✅ {} is running", self.config.app.server.name);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            result = signals::wait_for_shutdown_signal() => {
                result.context("installing signal handlers")?;
            }
            // A dropped sender (no console, or stdin closed) disables this branch.
            Ok(()) = stop_rx => {
                info!("🛑 Stop requested from the console");
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(console) = console {
            console.abort();
        }

        shutdown_with_timeout(&self.manager, "server stopping", SHUTDOWN_GRACE).await?;

        let stats = events.get_stats().await;
        info!("📊 Events dispatched: {} | handler failures: {}", stats.events_emitted, stats.handler_failures);
        info!("👋 {} stopped", self.config.app.server.name);
        Ok(())
    }

    /// Re-reads the permission file and turns outside edits into core events.
    fn spawn_permission_watcher(&self, events: Arc<EventSystem>) -> Option<tokio::task::JoinHandle<()>> {
        let period = self.config.app.permissions.reload_secs;
        if period == 0 {
            return None;
        }

        let permissions = self.permissions.clone();
        let names = self.names.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(period));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match permissions.reload().await {
                    Ok(changes) => {
                        if !changes.is_empty() {
                            permissions.export_names(&names).await;
                        }
                        for change in changes {
                            publish_change(&events, change).await;
                        }
                    }
                    Err(e) => warn!("⚠️ Failed to reload permission file: {:#}", e),
                }
            }
        }))
    }
}

async fn publish_change(events: &EventSystem, change: PlayerChange) {
    let result = match change {
        PlayerChange::Online(game_id, online) => {
            events
                .publish(&PlayerOnlineStatusChangedEvent { game_id, online })
                .await
        }
        PlayerChange::RanksChanged(game_id) => {
            events.publish(&PlayerRanksChangedEvent { game_id }).await
        }
    };
    if let Err(e) = result {
        warn!("⚠️ Failed to publish player change: {}", e);
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {:#}", e);
        std::process::exit(1);
    }
}
