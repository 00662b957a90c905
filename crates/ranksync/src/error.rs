//! Error types for the RankSync core

use ranksync_event_system::{EventError, ExternalId};
use std::{io::Error as IoError, path::PathBuf};
use thiserror::Error;

/// Missing or malformed configuration. Fatal to `enable()`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required config key: {0}")]
    Missing(String),

    #[error("Invalid value for config key {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Unsupported value for config key {key}: {value}")]
    Unsupported { key: String, value: String },
}

/// A bot could not reach its platform. Disables that bot only.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("No bot factory registered for platform '{0}'")]
    UnknownPlatform(String),

    #[error("Missing bot property: {0}")]
    MissingProperty(String),

    #[error("Invalid bot property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Platform unreachable: {0}")]
    Unreachable(String),
}

/// Reading state from one side failed. Transient; retried on the next pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Bot {0} is offline")]
    BotOffline(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl LookupError {
    /// Whether retrying the same lookup later can succeed.
    ///
    /// Members rejoin and bots reconnect, so every lookup failure qualifies.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// A mutation was refused by one side. Transient; retried on the next pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Bot lacks permission: {0}")]
    InsufficientPermission(String),

    #[error("Bot {0} is offline")]
    BotOffline(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl ApplyError {
    /// Whether retrying the same mutation later can succeed.
    ///
    /// A permission problem needs an operator, everything else can heal by itself.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::InsufficientPermission(_))
    }
}

impl From<LookupError> for ApplyError {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::AccountNotFound(id) => ApplyError::AccountNotFound(id),
            LookupError::BotOffline(bot) => ApplyError::BotOffline(bot),
            LookupError::Backend(msg) => ApplyError::Backend(msg),
        }
    }
}

/// Redeeming a link code failed. Surfaced to the user, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RedeemError {
    #[error("No active link code matches")]
    NotFound,

    #[error("The link code has expired")]
    Expired,

    #[error("The link code has already been used")]
    AlreadyRedeemed,

    #[error("Account {0} is already linked to another player")]
    AlreadyLinked(ExternalId),
}

/// Link persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {0}: {1}")]
    DirectoryCreate(PathBuf, IoError),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, IoError),

    #[error("Failed to rename file from {0} to {1}: {2}")]
    FileRename(PathBuf, PathBuf, IoError),

    #[error("Failed to serialize link state: {0}")]
    Serialization(serde_json::Error),

    #[error("Failed to deserialize file {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),
}

/// Errors surfaced by the lifecycle manager
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dependency validation failed: {0}")]
    ValidationFailed(String),

    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Event system error: {0}")]
    EventSystem(String),
}

impl From<EventError> for LifecycleError {
    fn from(e: EventError) -> Self {
        LifecycleError::EventSystem(e.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type LifecycleResult<T> = Result<T, LifecycleError>;
