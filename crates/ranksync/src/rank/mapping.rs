//! The configured equivalence between external roles and game ranks.

use super::RankSet;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which side is authoritative for one mapping entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Game ranks decide whether the external role is held.
    #[default]
    GameToExternal,
    /// The external role decides whether the game ranks are held.
    ExternalToGame,
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "game-to-external" | "to-external" => Ok(SyncDirection::GameToExternal),
            "external-to-game" | "to-game" => Ok(SyncDirection::ExternalToGame),
            other => Err(format!(
                "unknown sync direction '{}', expected game-to-external or external-to-game",
                other
            )),
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::GameToExternal => write!(f, "game-to-external"),
            SyncDirection::ExternalToGame => write!(f, "external-to-game"),
        }
    }
}

/// One external role and the game ranks it corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub role: String,
    pub game_ranks: RankSet,
    #[serde(default)]
    pub direction: SyncDirection,
}

impl MappingEntry {
    pub fn new(role: impl Into<String>, game_ranks: RankSet, direction: SyncDirection) -> Self {
        Self {
            role: role.into(),
            game_ranks,
            direction,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Owned {
    game_ranks: RankSet,
    external_roles: RankSet,
}

/// Immutable, many-to-many mapping between external roles and game ranks.
///
/// Built once at startup and shared behind an `Arc`; every lookup is a plain
/// read, so reconciliation passes never contend on it. The per-direction
/// ownership sets are computed up front.
#[derive(Debug, Clone, Default)]
pub struct RankMapping {
    entries: BTreeMap<String, MappingEntry>,
    to_external: Owned,
    to_game: Owned,
    all_roles: RankSet,
    all_game_ranks: RankSet,
}

impl RankMapping {
    /// Builds a mapping, rejecting empty names, duplicate roles and game ranks
    /// claimed by both directions.
    pub fn from_entries(
        entries: impl IntoIterator<Item = MappingEntry>,
    ) -> Result<Self, ConfigError> {
        let mut mapping = RankMapping::default();

        for entry in entries {
            let key = format!("ranks.{}", entry.role);
            if entry.role.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "role name cannot be empty".to_string(),
                });
            }
            if entry.game_ranks.is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "at least one game rank is required".to_string(),
                });
            }
            if entry.game_ranks.iter().any(|rank| rank.trim().is_empty()) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "game rank names cannot be empty".to_string(),
                });
            }
            if mapping.entries.contains_key(&entry.role) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "role is mapped more than once".to_string(),
                });
            }

            // A game rank has exactly one authoritative side.
            let other = match entry.direction {
                SyncDirection::GameToExternal => &mapping.to_game,
                SyncDirection::ExternalToGame => &mapping.to_external,
            };
            let contested = entry.game_ranks.intersection(&other.game_ranks);
            if !contested.is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!(
                        "game ranks {} are already mapped in the opposite direction",
                        contested
                    ),
                });
            }

            let owned = match entry.direction {
                SyncDirection::GameToExternal => &mut mapping.to_external,
                SyncDirection::ExternalToGame => &mut mapping.to_game,
            };
            owned.external_roles.insert(entry.role.clone());
            owned.game_ranks = owned.game_ranks.union(&entry.game_ranks);

            mapping.all_roles.insert(entry.role.clone());
            mapping.all_game_ranks = mapping.all_game_ranks.union(&entry.game_ranks);
            mapping.entries.insert(entry.role.clone(), entry);
        }

        Ok(mapping)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn get(&self, role: &str) -> Option<&MappingEntry> {
        self.entries.get(role)
    }

    pub fn game_ranks_for(&self, role: &str) -> Option<&RankSet> {
        self.entries.get(role).map(|entry| &entry.game_ranks)
    }

    /// Every external role named by the mapping.
    pub fn roles(&self) -> &RankSet {
        &self.all_roles
    }

    /// Every game rank named by the mapping (its codomain).
    pub fn game_ranks(&self) -> &RankSet {
        &self.all_game_ranks
    }

    /// Game ranks written by entries of the given direction.
    pub fn owned_game_ranks(&self, direction: SyncDirection) -> &RankSet {
        &self.owned(direction).game_ranks
    }

    /// External roles written or read by entries of the given direction.
    pub fn owned_external_roles(&self, direction: SyncDirection) -> &RankSet {
        &self.owned(direction).external_roles
    }

    /// Game ranks implied by holding `external_roles`, for entries of `direction`.
    pub fn translate_to_game(&self, external_roles: &RankSet, direction: SyncDirection) -> RankSet {
        let mut ranks = RankSet::new();
        for entry in self.entries.values().filter(|e| e.direction == direction) {
            if external_roles.contains(&entry.role) {
                ranks = ranks.union(&entry.game_ranks);
            }
        }
        ranks
    }

    /// External roles implied by holding `game_ranks`, for entries of `direction`.
    ///
    /// A role is implied as soon as any one of its game ranks is held.
    pub fn translate_to_external(&self, game_ranks: &RankSet, direction: SyncDirection) -> RankSet {
        self.entries
            .values()
            .filter(|e| e.direction == direction && e.game_ranks.overlaps(game_ranks))
            .map(|e| e.role.clone())
            .collect()
    }

    /// The mapping as role name to game ranks, the shape hosts consume.
    pub fn as_table(&self) -> BTreeMap<String, RankSet> {
        self.entries
            .iter()
            .map(|(role, entry)| (role.clone(), entry.game_ranks.clone()))
            .collect()
    }

    fn owned(&self, direction: SyncDirection) -> &Owned {
        match direction {
            SyncDirection::GameToExternal => &self.to_external,
            SyncDirection::ExternalToGame => &self.to_game,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> RankSet {
        items.iter().copied().collect()
    }

    fn sample() -> RankMapping {
        RankMapping::from_entries([
            MappingEntry::new("Admin", set(&["admin", "mod"]), SyncDirection::GameToExternal),
            MappingEntry::new("Builder", set(&["builder"]), SyncDirection::GameToExternal),
            MappingEntry::new("Booster", set(&["supporter"]), SyncDirection::ExternalToGame),
        ])
        .unwrap()
    }

    #[test]
    fn any_matching_rank_implies_the_role() {
        let mapping = sample();
        let roles = mapping.translate_to_external(&set(&["mod", "default"]), SyncDirection::GameToExternal);
        assert_eq!(roles, set(&["Admin"]));
    }

    #[test]
    fn held_role_implies_all_of_its_ranks() {
        let mapping = sample();
        let ranks = mapping.translate_to_game(&set(&["Booster", "Admin"]), SyncDirection::ExternalToGame);
        assert_eq!(ranks, set(&["supporter"]));
    }

    #[test]
    fn ownership_is_split_by_direction() {
        let mapping = sample();
        assert_eq!(
            *mapping.owned_game_ranks(SyncDirection::ExternalToGame),
            set(&["supporter"])
        );
        assert_eq!(
            *mapping.owned_external_roles(SyncDirection::GameToExternal),
            set(&["Admin", "Builder"])
        );
        assert_eq!(mapping.game_ranks().len(), 4);
        assert_eq!(mapping.roles().len(), 3);
    }

    #[test]
    fn rejects_duplicates_and_empty_entries() {
        let duplicate = RankMapping::from_entries([
            MappingEntry::new("Admin", set(&["admin"]), SyncDirection::GameToExternal),
            MappingEntry::new("Admin", set(&["mod"]), SyncDirection::GameToExternal),
        ]);
        assert!(matches!(duplicate, Err(ConfigError::Invalid { .. })));

        let empty = RankMapping::from_entries([MappingEntry::new(
            "Admin",
            RankSet::new(),
            SyncDirection::GameToExternal,
        )]);
        assert!(matches!(empty, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn ranks_cannot_be_owned_by_both_directions() {
        let contested = RankMapping::from_entries([
            MappingEntry::new("Admin", set(&["admin"]), SyncDirection::GameToExternal),
            MappingEntry::new("Booster", set(&["admin", "supporter"]), SyncDirection::ExternalToGame),
        ]);
        match contested {
            Err(ConfigError::Invalid { reason, .. }) => assert!(reason.contains("admin")),
            other => panic!("expected the shared rank to be rejected, got {:?}", other.map(|_| ())),
        }

        // Same game rank under two roles of one direction is still fine.
        let shared = RankMapping::from_entries([
            MappingEntry::new("Admin", set(&["staff"]), SyncDirection::GameToExternal),
            MappingEntry::new("Moderator", set(&["staff"]), SyncDirection::GameToExternal),
        ]);
        assert!(shared.is_ok());
    }

    #[test]
    fn direction_parsing_accepts_both_spellings() {
        assert_eq!("external_to_game".parse::<SyncDirection>(), Ok(SyncDirection::ExternalToGame));
        assert_eq!("Game-To-External".parse::<SyncDirection>(), Ok(SyncDirection::GameToExternal));
        assert!("sideways".parse::<SyncDirection>().is_err());
    }
}
