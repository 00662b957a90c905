//! Configuration file of the reference server.
//!
//! One TOML file carries both the server's own sections (`[server]`,
//! `[logging]`, `[permissions]`) and the sync core's sections (`[discord]`,
//! `[ranks]`, `[link]`, ...). The server deserializes its part with serde and
//! hands the whole document to the core untouched.

use crate::cli::CliArgs;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Written when no configuration file exists yet. Runs against the in-process
/// platform so a fresh install starts without credentials.
pub const DEFAULT_CONFIG: &str = r#"language = "english"

[server]
name = "RankSync"
data_dir = "data"

[logging]
level = "info"
json_format = false

[permissions]
file = "permissions.json"
reload_secs = 5

[discord]
platform = "memory"
token = "dry-run"
guild-id = "0"
update-non-synced = false
sync-names = true

[database]
type = "json"

[link]
code-length = 8
ttl-secs = 600

[sync]
interval-secs = 300
purge-interval-secs = 60
flush-interval-secs = 300

[ranks]
Admin = ["admin"]
Moderator = ["moderator"]

[ranks.Booster]
game = ["supporter"]
direction = "external-to-game"
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub permissions: PermissionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Shown in logs and the console
    pub name: String,
    /// Root for link state and the permission file
    pub data_dir: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "RankSync".to_string(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    /// Relative paths resolve against the data directory
    pub file: String,
    /// How often the file is re-read for outside edits; 0 disables
    pub reload_secs: u64,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            file: "permissions.json".to_string(),
            reload_secs: 5,
        }
    }
}

/// The parsed file: typed server settings plus the raw document for the core.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub app: AppConfig,
    pub raw: toml::Value,
}

impl LoadedConfig {
    /// Reads `path`, creating it from [`DEFAULT_CONFIG`] first when missing.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = if path.exists() {
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?
        } else {
            tokio::fs::write(path, DEFAULT_CONFIG)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            DEFAULT_CONFIG.to_string()
        };
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(content)?;
        let app: AppConfig = raw.clone().try_into()?;
        Ok(Self { app, raw })
    }

    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(data_dir) = &args.data_dir {
            self.app.server.data_dir = data_dir.to_string_lossy().to_string();
        }
        if let Some(level) = &args.log_level {
            self.app.logging.level = level.clone();
        }
        if args.json_logs {
            self.app.logging.json_format = true;
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            bail!("Server name cannot be empty");
        }
        if self.server.data_dir.trim().is_empty() {
            bail!("Data directory cannot be empty");
        }
        if self.permissions.file.trim().is_empty() {
            bail!("Permission file cannot be empty");
        }
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {VALID_LEVELS:?}",
                self.logging.level
            );
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.data_dir)
    }

    pub fn permission_file(&self) -> PathBuf {
        let file = PathBuf::from(&self.permissions.file);
        if file.is_absolute() {
            file
        } else {
            self.data_dir().join(file)
        }
    }
}
