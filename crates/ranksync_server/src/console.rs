//! Operator console on stdin.
//!
//! Stands in for the in-game `/link` command and, with the in-process
//! platform, for the community members on the other side.

use crate::permissions::JsonPermissionBackend;
use anyhow::{anyhow, bail, Result};
use ranksync::{ExternalId, GameId, LifecycleManager, MemoryPlatform, RankSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tracing::{info, warn};

const HELP: &str = "commands: status | link <player> | unlink <player> | resync <player> | \
member <external-id> [role,role,..] | submit <bot> <external-id> <code> | help | stop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Link(GameId),
    Unlink(GameId),
    Resync(GameId),
    /// Sets a member's roles on the in-process platform
    Member { external_id: ExternalId, roles: RankSet },
    /// A member sends a link code to a bot on the in-process platform
    Submit { bot: String, external_id: ExternalId, code: String },
    Stop,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = words.split_first() else {
            bail!("empty command");
        };

        let player = |args: &[&str]| -> Result<GameId> {
            match args {
                [id] => id
                    .parse::<GameId>()
                    .map_err(|_| anyhow!("'{}' is not a player id", id)),
                _ => bail!("expected exactly one player id"),
            }
        };

        Ok(match verb.to_ascii_lowercase().as_str() {
            "help" | "?" => ConsoleCommand::Help,
            "status" => ConsoleCommand::Status,
            "link" => ConsoleCommand::Link(player(args)?),
            "unlink" => ConsoleCommand::Unlink(player(args)?),
            "resync" => ConsoleCommand::Resync(player(args)?),
            "member" => match args {
                [external_id] => ConsoleCommand::Member {
                    external_id: ExternalId::new(*external_id),
                    roles: RankSet::new(),
                },
                [external_id, roles] => ConsoleCommand::Member {
                    external_id: ExternalId::new(*external_id),
                    roles: roles
                        .split(',')
                        .map(str::trim)
                        .filter(|role| !role.is_empty())
                        .collect(),
                },
                _ => bail!("usage: member <external-id> [role,role,..]"),
            },
            "submit" => match args {
                [bot, external_id, code] => ConsoleCommand::Submit {
                    bot: bot.to_string(),
                    external_id: ExternalId::new(*external_id),
                    code: code.to_string(),
                },
                _ => bail!("usage: submit <bot> <external-id> <code>"),
            },
            "stop" | "exit" | "quit" => ConsoleCommand::Stop,
            other => bail!("unknown command '{}'", other),
        })
    }
}

pub struct Console {
    manager: LifecycleManager,
    platform: Arc<MemoryPlatform>,
    permissions: Arc<JsonPermissionBackend>,
}

impl Console {
    pub fn new(
        manager: LifecycleManager,
        platform: Arc<MemoryPlatform>,
        permissions: Arc<JsonPermissionBackend>,
    ) -> Self {
        Self {
            manager,
            platform,
            permissions,
        }
    }

    /// Reads commands until `stop` or end of input. `stop` fires `on_stop`.
    pub async fn run<R>(self, input: R, on_stop: oneshot::Sender<()>)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!("⚠️ Console input failed: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Stop) => {
                    let _ = on_stop.send(());
                    return;
                }
                Ok(command) => {
                    if let Err(e) = self.execute(command).await {
                        warn!("⚠️ {}", e);
                    }
                }
                Err(e) => warn!("⚠️ {} ({})", e, HELP),
            }
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Help => info!("{}", HELP),
            ConsoleCommand::Status => self.status().await,
            ConsoleCommand::Link(game_id) => {
                let links = self.links().await?;
                let code = links.issue_code(game_id).await;
                info!(
                    "🔗 Link code for {}: {} (send it to a bot within {} s)",
                    game_id,
                    code.code,
                    links.settings().code_ttl.as_secs()
                );
            }
            ConsoleCommand::Unlink(game_id) => match self.links().await?.unlink(game_id).await {
                Some(external_id) => info!("✂️ {} is no longer linked to {}", game_id, external_id),
                None => info!("{} was not linked", game_id),
            },
            ConsoleCommand::Resync(game_id) => {
                let reports = self
                    .manager
                    .resync_and_wait(game_id)
                    .await
                    .ok_or_else(|| anyhow!("sync is not running"))?;
                if reports.is_empty() {
                    info!("{} is not linked, nothing to do", game_id);
                }
                for report in reports {
                    info!(
                        "🔄 {} via '{}': {} (game {}, external {})",
                        game_id,
                        report.bot_name,
                        report.outcome,
                        report.game_applied,
                        report.external_applied
                    );
                    for warning in &report.warnings {
                        warn!("  ⚠️ {}", warning);
                    }
                }
            }
            ConsoleCommand::Member { external_id, roles } => {
                info!("👤 Member {} now holds {}", external_id, roles);
                self.platform.add_member(external_id, roles);
            }
            ConsoleCommand::Submit {
                bot,
                external_id,
                code,
            } => {
                let delivered = self
                    .platform
                    .submit_code(&bot, external_id.clone(), &code)
                    .await?;
                if !delivered {
                    bail!("no bot named '{}' is connected", bot);
                }
                // The reply is sent asynchronously; give it a moment before showing the inbox.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                for message in self.platform.direct_messages(&external_id) {
                    info!("✉️ {} <- {}", external_id, message);
                }
            }
            ConsoleCommand::Stop => {}
        }
        Ok(())
    }

    async fn status(&self) {
        let state = self.manager.state().await;
        let bots: Vec<String> = self
            .manager
            .get_bots()
            .await
            .iter()
            .map(|bot| format!("{} ({})", bot.name(), if bot.is_online() { "online" } else { "offline" }))
            .collect();
        let linked = match self.manager.link_registry().await {
            Some(links) => links.linked_count().await,
            None => 0,
        };
        let stats = self.manager.events().get_stats().await;

        info!("📋 State: {}", state);
        info!("  🤖 Bots: {}", if bots.is_empty() { "none".to_string() } else { bots.join(", ") });
        info!("  🔗 Linked players: {}", linked);
        info!("  🎮 Online players: {}", self.permissions.online_players().await.len());
        info!(
            "  📡 Handlers: {} | events: {} | handler failures: {}",
            stats.total_handlers, stats.events_emitted, stats.handler_failures
        );
    }

    async fn links(&self) -> Result<Arc<ranksync::LinkRegistry>> {
        self.manager
            .link_registry()
            .await
            .ok_or_else(|| anyhow!("sync is not running"))
    }
}
