//! Rank sets, the rank mapping and the per-side rank resources.

pub mod external;
pub mod game;
pub mod mapping;

pub use external::ExternalRankResource;
pub use game::{GameRankResource, MemoryPermissionBackend, PermissionBackend};
pub use mapping::{MappingEntry, RankMapping, SyncDirection};

use crate::error::{ApplyError, LookupError};
use async_trait::async_trait;
use ranksync_event_system::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The ranks (game side) or roles (external side) one account holds.
///
/// Backed by a `BTreeSet` so iteration, logging and serialization are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankSet(BTreeSet<String>);

impl RankSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, rank: &str) -> bool {
        self.0.contains(rank)
    }

    pub fn insert(&mut self, rank: impl Into<String>) -> bool {
        self.0.insert(rank.into())
    }

    pub fn remove(&mut self, rank: &str) -> bool {
        self.0.remove(rank)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Ranks in `self` that are not in `other`.
    pub fn difference(&self, other: &RankSet) -> RankSet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    pub fn union(&self, other: &RankSet) -> RankSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &RankSet) -> RankSet {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// True when the two sets share at least one rank.
    pub fn overlaps(&self, other: &RankSet) -> bool {
        self.0.iter().any(|rank| other.0.contains(rank))
    }
}

impl<S: Into<String>> FromIterator<S> for RankSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IntoIterator for RankSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RankSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, rank) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", rank)?;
        }
        write!(f, "}}")
    }
}

/// Which system a rank resource talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Game,
    External,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Game => write!(f, "game"),
            Side::External => write!(f, "external"),
        }
    }
}

/// Reads and writes the ranks of one side of an identity.
///
/// Implementations never cache: every `current_ranks` call reflects the owning
/// system at that moment.
#[async_trait]
pub trait RankResource: Send + Sync {
    fn side(&self) -> Side;

    /// Fetches the ranks this side currently holds for the identity.
    async fn current_ranks(&self, identity: &Identity) -> Result<RankSet, LookupError>;

    /// Replaces the ranks this side holds for the identity with `ranks`.
    async fn apply_ranks(&self, identity: &Identity, ranks: &RankSet) -> Result<(), ApplyError>;

    /// Whether the resource can currently serve requests.
    fn is_available(&self) -> bool {
        true
    }

    /// Pushes the identity's game display name to this side.
    ///
    /// Returns whether anything was sent. Only the external side does anything.
    async fn sync_name(&self, _identity: &Identity) -> Result<bool, ApplyError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> RankSet {
        items.iter().copied().collect()
    }

    #[test]
    fn set_operations() {
        let a = set(&["admin", "mod", "vip"]);
        let b = set(&["mod", "builder"]);

        assert_eq!(a.difference(&b), set(&["admin", "vip"]));
        assert_eq!(a.intersection(&b), set(&["mod"]));
        assert_eq!(a.union(&b).len(), 4);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&RankSet::new()));
    }

    #[test]
    fn display_is_sorted() {
        let set: RankSet = ["vip", "admin"].into_iter().collect();
        assert_eq!(set.to_string(), "{admin, vip}");
    }

    #[test]
    fn serializes_as_plain_list() {
        let set: RankSet = ["b", "a"].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a","b"]"#);
    }
}
