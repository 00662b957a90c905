//! Domain events carried by the RankSync event system.
//!
//! Every event implements [`SyncEvent`], which pins it to a stable event name so
//! publishers and subscribers agree on routing without sharing string literals.

use crate::types::{ExternalId, GameId, Identity};
use crate::Event;
use serde::{Deserialize, Serialize};

/// An [`Event`] with a fixed name in the `sync:` namespace.
pub trait SyncEvent: Event + Serialize + for<'de> Deserialize<'de> {
    /// Name of the event inside the `sync:` namespace.
    const EVENT_NAME: &'static str;
}

/// A player asked for a link code and one was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCodeCreatedEvent {
    pub game_id: GameId,
    pub code: String,
    /// Expiry in milliseconds since the Unix epoch
    pub expires_at: u64,
}

impl SyncEvent for LinkCodeCreatedEvent {
    const EVENT_NAME: &'static str = "link_code_created";
}

/// Someone on the external platform submitted a link code to a bot.
///
/// Bots publish this; the lifecycle manager redeems the code and answers the
/// submitter through the same bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCodeSubmittedEvent {
    pub bot_name: String,
    pub external_id: ExternalId,
    pub code: String,
}

impl SyncEvent for LinkCodeSubmittedEvent {
    const EVENT_NAME: &'static str = "link_code_submitted";
}

/// A link code was redeemed and the two accounts are now linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLinkedEvent {
    pub identity: Identity,
    pub timestamp: u64,
}

impl SyncEvent for PlayerLinkedEvent {
    const EVENT_NAME: &'static str = "player_linked";
}

/// A link was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerUnlinkedEvent {
    pub game_id: GameId,
    pub external_id: ExternalId,
    pub timestamp: u64,
}

impl SyncEvent for PlayerUnlinkedEvent {
    const EVENT_NAME: &'static str = "player_unlinked";
}

/// A player joined or left the game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerOnlineStatusChangedEvent {
    pub game_id: GameId,
    pub online: bool,
}

impl SyncEvent for PlayerOnlineStatusChangedEvent {
    const EVENT_NAME: &'static str = "player_online_status_changed";
}

/// The host changed a player's ranks outside of RankSync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRanksChangedEvent {
    pub game_id: GameId,
}

impl SyncEvent for PlayerRanksChangedEvent {
    const EVENT_NAME: &'static str = "player_ranks_changed";
}

/// A bot finished connecting and is ready to serve requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotEnabledEvent {
    pub bot_name: String,
    pub timestamp: u64,
}

impl SyncEvent for BotEnabledEvent {
    const EVENT_NAME: &'static str = "bot_enabled";
}

/// A bot could not connect, or lost its platform, and has to be taken down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotForceShutdownEvent {
    pub bot_name: String,
    pub reason: String,
    pub timestamp: u64,
}

impl SyncEvent for BotForceShutdownEvent {
    const EVENT_NAME: &'static str = "bot_force_shutdown";
}
