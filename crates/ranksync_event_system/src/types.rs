//! Identity types shared by every RankSync component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of an account on the game server.
///
/// Game accounts are keyed by UUID, the same way the host server keys its
/// players. The nil UUID is never a valid account.
///
/// # Examples
///
/// ```rust
/// use ranksync_event_system::GameId;
///
/// let id = GameId::new();
/// let parsed: GameId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId(pub Uuid);

impl GameId {
    /// Creates a new random game id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns true for the nil UUID, which never names an account.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for GameId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GameId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of an account on the external platform.
///
/// Platforms disagree on the shape of their ids (snowflakes, handles, e-mail
/// addresses), so this stays an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A game account together with the external account it is linked to.
///
/// `external_id` is only `None` while the player is still in the linking
/// window; every identity handed out by the link registry is complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub game_id: GameId,
    pub external_id: Option<ExternalId>,
}

impl Identity {
    /// Creates a fully linked identity. Returns `None` for the nil game id.
    pub fn linked(game_id: GameId, external_id: ExternalId) -> Option<Self> {
        if game_id.is_nil() {
            return None;
        }
        Some(Self {
            game_id,
            external_id: Some(external_id),
        })
    }

    /// Creates an identity that has not been linked yet.
    pub fn pending(game_id: GameId) -> Option<Self> {
        if game_id.is_nil() {
            return None;
        }
        Some(Self {
            game_id,
            external_id: None,
        })
    }

    pub fn is_linked(&self) -> bool {
        self.external_id.is_some()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.external_id {
            Some(external) => write!(f, "{} <-> {}", self.game_id, external),
            None => write!(f, "{} <-> (unlinked)", self.game_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_game_id_never_forms_an_identity() {
        let nil = GameId(Uuid::nil());
        assert!(Identity::linked(nil, ExternalId::new("1")).is_none());
        assert!(Identity::pending(nil).is_none());
    }

    #[test]
    fn identity_display_shows_both_halves() {
        let game_id = GameId::new();
        let identity = Identity::linked(game_id, ExternalId::new("4242")).unwrap();
        assert_eq!(identity.to_string(), format!("{} <-> 4242", game_id));
        assert!(identity.is_linked());
        assert!(!Identity::pending(game_id).unwrap().is_linked());
    }
}
