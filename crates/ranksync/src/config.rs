//! Configuration access and the typed settings the core runs on.
//!
//! The host hands the core a [`ConfigProvider`]; [`SyncSettings::from_provider`]
//! reads everything the lifecycle manager needs from it in one go, so a bad key
//! fails `enable()` before anything is started.

use crate::bot::BotProperties;
use crate::error::{ConfigError, ConfigResult};
use crate::link::{LinkSettings, DEFAULT_CODE_LENGTH, DEFAULT_CODE_TTL};
use crate::rank::{MappingEntry, RankMapping, RankSet, SyncDirection};
use crate::reconcile::SyncPolicy;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Read-only access to the host's configuration, keyed by dotted paths.
pub trait ConfigProvider: Send + Sync {
    fn contains(&self, key: &str) -> bool;
    fn get_string(&self, key: &str) -> Option<String>;
    fn get_string_list(&self, key: &str) -> Option<Vec<String>>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_long(&self, key: &str) -> Option<i64>;
    fn get_int(&self, key: &str) -> Option<i32>;
    /// Direct child keys of a section, sorted.
    fn get_keys(&self, section: &str) -> Vec<String>;

    /// Segment-wise lookups for keys that may contain dots themselves, such as
    /// role names returned by `get_keys("ranks")`.
    fn contains_at(&self, path: &[&str]) -> bool {
        self.contains(&path.join("."))
    }

    fn get_string_at(&self, path: &[&str]) -> Option<String> {
        self.get_string(&path.join("."))
    }

    fn get_string_list_at(&self, path: &[&str]) -> Option<Vec<String>> {
        self.get_string_list(&path.join("."))
    }
}

/// Dotted-path lookups over a parsed TOML document.
///
/// Each path segment matches exactly first and then with `-` and `_` swapped,
/// so `discord.guild-id` and `discord.guild_id` both work.
impl ConfigProvider for toml::Value {
    fn contains(&self, key: &str) -> bool {
        lookup(self, key).is_some()
    }

    fn get_string(&self, key: &str) -> Option<String> {
        as_string(lookup(self, key)?)
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        as_string_list(lookup(self, key)?)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        lookup(self, key)?.as_bool()
    }

    fn get_long(&self, key: &str) -> Option<i64> {
        lookup(self, key)?.as_integer()
    }

    fn get_int(&self, key: &str) -> Option<i32> {
        i32::try_from(self.get_long(key)?).ok()
    }

    fn get_keys(&self, section: &str) -> Vec<String> {
        let table = if section.is_empty() {
            Some(self)
        } else {
            lookup(self, section)
        };
        match table.and_then(toml::Value::as_table) {
            Some(table) => {
                let mut keys: Vec<String> = table.keys().cloned().collect();
                keys.sort();
                keys
            }
            None => Vec::new(),
        }
    }

    fn contains_at(&self, path: &[&str]) -> bool {
        lookup_path(self, path.iter().copied()).is_some()
    }

    fn get_string_at(&self, path: &[&str]) -> Option<String> {
        as_string(lookup_path(self, path.iter().copied())?)
    }

    fn get_string_list_at(&self, path: &[&str]) -> Option<Vec<String>> {
        as_string_list(lookup_path(self, path.iter().copied())?)
    }
}

fn as_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        // Snowflake ids are often written as bare integers.
        toml::Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn as_string_list(value: &toml::Value) -> Option<Vec<String>> {
    match value {
        toml::Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        toml::Value::String(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

fn lookup<'a>(root: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    lookup_path(root, key.split('.'))
}

fn lookup_path<'a, 'k>(
    root: &'a toml::Value,
    segments: impl Iterator<Item = &'k str>,
) -> Option<&'a toml::Value> {
    let mut current = root;
    for segment in segments {
        let table = current.as_table()?;
        current = match table.get(segment) {
            Some(value) => value,
            None => {
                let alternative = if segment.contains('-') {
                    segment.replace('-', "_")
                } else {
                    segment.replace('_', "-")
                };
                table.get(&alternative)?
            }
        };
    }
    Some(current)
}

pub const DEFAULT_LANGUAGE: &str = "english";
pub const DEFAULT_BOT_NAME: &str = "discord";
pub const DEFAULT_PLATFORM: &str = "memory";

/// Where link codes and identities are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Json,
    Memory,
}

/// SQL connection settings. Passed to bots in their properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlSettings {
    pub max_pool_size: Option<i64>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub kind: DatabaseKind,
    pub sql: SqlSettings,
}

/// One bot to connect at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSettings {
    pub name: String,
    pub platform: String,
    pub token: String,
    pub guild_id: Option<String>,
}

/// Periods of the background tasks. `None` disables a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub resync_interval: Option<Duration>,
    pub purge_interval: Option<Duration>,
    pub flush_interval: Option<Duration>,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            resync_interval: Some(Duration::from_secs(300)),
            purge_interval: Some(Duration::from_secs(60)),
            flush_interval: Some(Duration::from_secs(300)),
        }
    }
}

/// Everything the lifecycle manager reads from configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub language: String,
    pub bots: Vec<BotSettings>,
    pub policy: SyncPolicy,
    pub database: DatabaseSettings,
    pub link: LinkSettings,
    pub timers: TimerSettings,
    pub mapping: RankMapping,
}

impl SyncSettings {
    pub fn from_provider(config: &dyn ConfigProvider) -> ConfigResult<Self> {
        let language = match config.get_string("language") {
            Some(language) if !language.trim().is_empty() => language,
            _ => {
                warn!("⚠️ No language specified in the config, using {}", DEFAULT_LANGUAGE);
                DEFAULT_LANGUAGE.to_string()
            }
        };

        let policy = SyncPolicy {
            update_non_synced: optional_bool(config, "discord.update-non-synced")?.unwrap_or(false),
            sync_names: optional_bool(config, "discord.sync-names")?.unwrap_or(false),
        };

        let mut bots = vec![BotSettings {
            name: optional_string(config, "discord.name")?
                .unwrap_or_else(|| DEFAULT_BOT_NAME.to_string()),
            platform: optional_string(config, "discord.platform")?
                .unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
            token: required_string(config, "discord.token")?,
            guild_id: optional_string(config, "discord.guild-id")?,
        }];
        for name in config.get_keys("bots") {
            let prefix = format!("bots.{}", name);
            let bot = BotSettings {
                platform: optional_string(config, &format!("{}.platform", prefix))?
                    .unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
                token: required_string(config, &format!("{}.token", prefix))?,
                guild_id: optional_string(config, &format!("{}.guild-id", prefix))?,
                name,
            };
            if bots.iter().any(|b| b.name == bot.name) {
                return Err(ConfigError::Invalid {
                    key: prefix,
                    reason: "bot name is already in use".to_string(),
                });
            }
            bots.push(bot);
        }

        let database = DatabaseSettings {
            kind: match optional_string(config, "database.type")?.as_deref() {
                None => DatabaseKind::Json,
                Some(kind) => match kind.to_ascii_lowercase().as_str() {
                    "json" => DatabaseKind::Json,
                    "memory" => DatabaseKind::Memory,
                    _ => {
                        return Err(ConfigError::Unsupported {
                            key: "database.type".to_string(),
                            value: kind.to_string(),
                        })
                    }
                },
            },
            sql: SqlSettings {
                max_pool_size: optional_long(config, "database.sql.max-pool-size")?,
                host: optional_string(config, "database.sql.host")?,
                port: optional_long(config, "database.sql.port")?,
                database: optional_string(config, "database.sql.database")?,
                user: optional_string(config, "database.sql.user")?,
                password: optional_string(config, "database.sql.password")?,
            },
        };

        let code_length = match optional_long(config, "link.code-length")? {
            None => DEFAULT_CODE_LENGTH,
            Some(len) if (4..=32).contains(&len) => len as usize,
            Some(len) => {
                return Err(ConfigError::Invalid {
                    key: "link.code-length".to_string(),
                    reason: format!("{} is outside 4..=32", len),
                })
            }
        };
        let link = LinkSettings {
            code_length,
            code_ttl: optional_secs(config, "link.ttl-secs")?
                .filter(|ttl| !ttl.is_zero())
                .unwrap_or(DEFAULT_CODE_TTL),
        };

        let defaults = TimerSettings::default();
        let timers = TimerSettings {
            resync_interval: timer(config, "sync.interval-secs", defaults.resync_interval)?,
            purge_interval: timer(config, "sync.purge-interval-secs", defaults.purge_interval)?,
            flush_interval: timer(config, "sync.flush-interval-secs", defaults.flush_interval)?,
        };

        Ok(Self {
            language,
            bots,
            policy,
            database,
            link,
            timers,
            mapping: read_mapping(config)?,
        })
    }

    /// Property bag for one bot, in the shape platform factories expect.
    pub fn bot_properties(&self, bot: &BotSettings, data_folder: &Path) -> BotProperties {
        let mut props = BotProperties::new()
            .with("token", bot.token.clone())
            .with("update_non_synced", self.policy.update_non_synced)
            .with("sync_names", self.policy.sync_names)
            .with(
                "type",
                match self.database.kind {
                    DatabaseKind::Json => "json",
                    DatabaseKind::Memory => "memory",
                },
            )
            .with(
                "base_path",
                data_folder.join("data").to_string_lossy().into_owned(),
            )
            .with("language", self.language.clone());

        if let Some(guild_id) = &bot.guild_id {
            props.set("guild_id", guild_id.clone());
        }
        let sql = &self.database.sql;
        if let Some(size) = sql.max_pool_size {
            props.set("max_pool_size", size);
        }
        if let Some(host) = &sql.host {
            props.set("host", host.clone());
        }
        if let Some(port) = sql.port {
            props.set("port", port);
        }
        if let Some(database) = &sql.database {
            props.set("database", database.clone());
        }
        if let Some(user) = &sql.user {
            props.set("username", user.clone());
        }
        if let Some(password) = &sql.password {
            props.set("password", password.clone());
        }
        props
    }
}

fn read_mapping(config: &dyn ConfigProvider) -> ConfigResult<RankMapping> {
    let roles = config.get_keys("ranks");
    if roles.is_empty() {
        return Err(ConfigError::Missing("ranks".to_string()));
    }

    let mut entries = Vec::with_capacity(roles.len());
    for role in roles {
        // Role names may contain dots ("Lv.10"), so never rebuild a dotted key.
        let key = format!("ranks.{}", role);
        let short_form = config.get_string_list_at(&["ranks", role.as_str()]);
        let (game_ranks, direction) = if let Some(list) = short_form {
            (list, SyncDirection::default())
        } else {
            let list = config
                .get_string_list_at(&["ranks", role.as_str(), "game"])
                .ok_or_else(|| ConfigError::Missing(format!("{}.game", key)))?;
            let direction = if config.contains_at(&["ranks", role.as_str(), "direction"]) {
                let direction_key = format!("{}.direction", key);
                let raw = config
                    .get_string_at(&["ranks", role.as_str(), "direction"])
                    .ok_or_else(|| invalid(&direction_key, "a string"))?;
                raw.parse().map_err(|reason| ConfigError::Invalid {
                    key: direction_key,
                    reason,
                })?
            } else {
                SyncDirection::default()
            };
            (list, direction)
        };
        entries.push(MappingEntry::new(
            role,
            game_ranks.into_iter().collect::<RankSet>(),
            direction,
        ));
    }

    RankMapping::from_entries(entries)
}

fn invalid(key: &str, expected: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("expected {}", expected),
    }
}

fn required_string(config: &dyn ConfigProvider, key: &str) -> ConfigResult<String> {
    match optional_string(config, key)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

fn optional_string(config: &dyn ConfigProvider, key: &str) -> ConfigResult<Option<String>> {
    if !config.contains(key) {
        return Ok(None);
    }
    config
        .get_string(key)
        .map(Some)
        .ok_or_else(|| invalid(key, "a string"))
}

fn optional_bool(config: &dyn ConfigProvider, key: &str) -> ConfigResult<Option<bool>> {
    if !config.contains(key) {
        return Ok(None);
    }
    config
        .get_bool(key)
        .map(Some)
        .ok_or_else(|| invalid(key, "true or false"))
}

fn optional_long(config: &dyn ConfigProvider, key: &str) -> ConfigResult<Option<i64>> {
    if !config.contains(key) {
        return Ok(None);
    }
    config
        .get_long(key)
        .map(Some)
        .ok_or_else(|| invalid(key, "an integer"))
}

fn optional_secs(config: &dyn ConfigProvider, key: &str) -> ConfigResult<Option<Duration>> {
    match optional_long(config, key)? {
        None => Ok(None),
        Some(secs) if secs >= 0 => Ok(Some(Duration::from_secs(secs as u64))),
        Some(_) => Err(invalid(key, "a non-negative number of seconds")),
    }
}

/// A timer period where `0` switches the task off.
fn timer(
    config: &dyn ConfigProvider,
    key: &str,
    default: Option<Duration>,
) -> ConfigResult<Option<Duration>> {
    Ok(match optional_secs(config, key)? {
        None => default,
        Some(period) if period.is_zero() => None,
        Some(period) => Some(period),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> toml::Value {
        toml::from_str(text).unwrap()
    }

    const MINIMAL: &str = r#"
[discord]
token = "abc"

[ranks]
Admin = ["admin", "mod"]
"#;

    #[test]
    fn dotted_lookup_accepts_both_separators() {
        let config = parse(
            r#"
[discord]
guild_id = 1234567890123
sync-names = true
"#,
        );
        assert_eq!(config.get_string("discord.guild-id").as_deref(), Some("1234567890123"));
        assert_eq!(config.get_bool("discord.sync_names"), Some(true));
        assert_eq!(config.get_int("discord.guild-id"), None);
        assert_eq!(config.get_keys("discord"), vec!["guild_id", "sync-names"]);
        assert!(config.get_keys("nothing").is_empty());
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let settings = SyncSettings::from_provider(&parse(MINIMAL)).unwrap();

        assert_eq!(settings.language, DEFAULT_LANGUAGE);
        assert_eq!(settings.bots.len(), 1);
        assert_eq!(settings.bots[0].name, DEFAULT_BOT_NAME);
        assert_eq!(settings.bots[0].platform, DEFAULT_PLATFORM);
        assert_eq!(settings.policy, SyncPolicy::default());
        assert_eq!(settings.database.kind, DatabaseKind::Json);
        assert_eq!(settings.link, LinkSettings::default());
        assert_eq!(settings.timers, TimerSettings::default());
        assert_eq!(settings.mapping.len(), 1);
    }

    #[test]
    fn full_config_is_read() {
        let config = parse(
            r#"
language = "dutch"

[discord]
token = "abc"
guild-id = "42"
update-non-synced = true
sync-names = true

[bots.backup]
platform = "memory"
token = "def"

[database]
type = "memory"

[database.sql]
host = "localhost"
port = 3306
user = "sync"

[link]
code-length = 6
ttl-secs = 120

[sync]
interval-secs = 0
purge-interval-secs = 30

[ranks]
Admin = ["admin", "mod"]

[ranks.Booster]
game = ["supporter"]
direction = "external-to-game"
"#,
        );
        let settings = SyncSettings::from_provider(&config).unwrap();

        assert_eq!(settings.language, "dutch");
        assert_eq!(settings.bots.len(), 2);
        assert_eq!(settings.bots[1].name, "backup");
        assert!(settings.policy.update_non_synced && settings.policy.sync_names);
        assert_eq!(settings.database.kind, DatabaseKind::Memory);
        assert_eq!(settings.link.code_length, 6);
        assert_eq!(settings.link.code_ttl, Duration::from_secs(120));
        assert_eq!(settings.timers.resync_interval, None);
        assert_eq!(settings.timers.purge_interval, Some(Duration::from_secs(30)));
        assert_eq!(
            settings.mapping.get("Booster").map(|e| e.direction),
            Some(SyncDirection::ExternalToGame)
        );

        let props = settings.bot_properties(&settings.bots[0], Path::new("/srv/sync"));
        assert_eq!(props.get_str("guild_id"), Some("42"));
        assert_eq!(props.get_str("username"), Some("sync"));
        assert_eq!(props.get_u64("port"), Some(3306));
        assert_eq!(props.get_str("type"), Some("memory"));
        assert_eq!(props.get_str("base_path"), Some("/srv/sync/data"));
        assert_eq!(props.get_bool("update_non_synced"), Some(true));
    }

    #[test]
    fn missing_token_and_ranks_are_reported() {
        let no_token = parse("[ranks]\nAdmin = [\"admin\"]\n");
        assert!(matches!(
            SyncSettings::from_provider(&no_token),
            Err(ConfigError::Missing(key)) if key == "discord.token"
        ));

        let no_ranks = parse("[discord]\ntoken = \"abc\"\n");
        assert!(matches!(
            SyncSettings::from_provider(&no_ranks),
            Err(ConfigError::Missing(key)) if key == "ranks"
        ));
    }

    #[test]
    fn role_names_may_contain_dots() {
        let config = parse(
            "[discord]\ntoken = \"abc\"\n[ranks]\n\"Lv.10\" = [\"veteran\"]\n\
             [ranks.\"Lv.20\"]\ngame = [\"elder\"]\ndirection = \"external-to-game\"\n",
        );
        let settings = SyncSettings::from_provider(&config).unwrap();
        assert_eq!(settings.mapping.game_ranks_for("Lv.10"), Some(&["veteran"].into_iter().collect::<RankSet>()));
        assert_eq!(settings.mapping.get("Lv.20").map(|e| e.direction), Some(SyncDirection::ExternalToGame));
        assert_eq!(config.get_string_list_at(&["ranks", "Lv.10"]), Some(vec!["veteran".to_string()]));
        assert!(!config.contains_at(&["ranks", "Lv", "10"]));
    }

    #[test]
    fn sql_database_is_unsupported() {
        let config = parse(&format!("{}\n[database]\ntype = \"sql\"\n", MINIMAL));
        assert!(matches!(
            SyncSettings::from_provider(&config),
            Err(ConfigError::Unsupported { value, .. }) if value == "sql"
        ));
    }

    #[test]
    fn wrong_types_are_invalid() {
        let config = parse(&format!("{}\n[link]\ncode-length = \"long\"\n", MINIMAL));
        assert!(matches!(
            SyncSettings::from_provider(&config),
            Err(ConfigError::Invalid { key, .. }) if key == "link.code-length"
        ));

        let config = parse(
            "[discord]\ntoken = \"abc\"\n[ranks.Admin]\ngame = [\"admin\"]\ndirection = \"up\"\n",
        );
        assert!(matches!(
            SyncSettings::from_provider(&config),
            Err(ConfigError::Invalid { key, .. }) if key == "ranks.Admin.direction"
        ));
    }
}
