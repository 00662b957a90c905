//! Rank reconciliation: bring both sides of an identity into agreement.
//!
//! A pass fetches both rank sets, plans the target state for each side with
//! [`plan_reconciliation`] and applies the game side first, then the external
//! side. There is no rollback. The plan only depends on the current state, so a
//! failed or abandoned pass is completed by the next one.
//!
//! Every mapping entry has a single authoritative side ([`SyncDirection`]):
//!
//! - `GameToExternal` entries: the external role is held exactly when the game
//!   account holds at least one of the entry's ranks.
//! - `ExternalToGame` entries: the entry's game ranks are held exactly when the
//!   external account holds the role.
//!
//! The external plan is computed from the game side's *target*, so changes that
//! flow into the game in this pass also flow out again in the same pass and a
//! second pass finds nothing to do.
//!
//! With several bots, `ExternalToGame` ranks are granted when the role is held
//! on any reachable platform ([`plan_reconciliation_with`]). Otherwise two
//! platforms that disagree would take turns revoking each other's grants.

pub mod lanes;

pub use lanes::ReconcileLanes;

use crate::error::{ApplyError, LookupError};
use crate::rank::{RankMapping, RankResource, RankSet, SyncDirection};
use ranksync_event_system::Identity;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Behaviour switches taken from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Also strip external roles that appear nowhere in the mapping.
    pub update_non_synced: bool,
    /// Push the game display name to the external account after a pass.
    pub sync_names: bool,
}

/// Ranks to add and remove on one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankDelta {
    pub add: RankSet,
    pub remove: RankSet,
}

impl RankDelta {
    pub fn between(current: &RankSet, target: &RankSet) -> Self {
        Self {
            add: target.difference(current),
            remove: current.difference(target),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Every rank the delta touches.
    pub fn touched(&self) -> RankSet {
        self.add.union(&self.remove)
    }
}

impl fmt::Display for RankDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} -{}", self.add, self.remove)
    }
}

/// Target state and deltas for both sides of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub game_target: RankSet,
    pub external_target: RankSet,
    pub game: RankDelta,
    pub external: RankDelta,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.game.is_empty() && self.external.is_empty()
    }
}

/// Plans one pass from the current rank sets of both sides.
pub fn plan_reconciliation(
    mapping: &RankMapping,
    policy: SyncPolicy,
    game: &RankSet,
    external: &RankSet,
) -> ReconcilePlan {
    plan_reconciliation_with(mapping, policy, game, external, external)
}

/// Like [`plan_reconciliation`], but the `ExternalToGame` ranks are granted
/// from `granting_roles` instead of this platform's own roles.
///
/// With several bots, `granting_roles` is the union of the identity's roles on
/// every reachable platform, so all bots agree on the game target.
pub fn plan_reconciliation_with(
    mapping: &RankMapping,
    policy: SyncPolicy,
    game: &RankSet,
    external: &RankSet,
    granting_roles: &RankSet,
) -> ReconcilePlan {
    let owned_game = mapping.owned_game_ranks(SyncDirection::ExternalToGame);
    let expected_from_external =
        mapping.translate_to_game(granting_roles, SyncDirection::ExternalToGame);
    let game_target = game.difference(owned_game).union(&expected_from_external);

    let external_target = plan_external_target(mapping, policy, &game_target, external);

    ReconcilePlan {
        game: RankDelta::between(game, &game_target),
        external: RankDelta::between(external, &external_target),
        game_target,
        external_target,
    }
}

/// Target external roles given the game ranks the account (will) hold.
pub fn plan_external_target(
    mapping: &RankMapping,
    policy: SyncPolicy,
    game: &RankSet,
    external: &RankSet,
) -> RankSet {
    let owned_external = mapping.owned_external_roles(SyncDirection::GameToExternal);
    let expected_from_game = mapping.translate_to_external(game, SyncDirection::GameToExternal);

    let mut kept = external.difference(owned_external);
    if policy.update_non_synced {
        kept = kept.intersection(mapping.roles());
    }
    kept.union(&expected_from_game)
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Both sides agree with the plan (possibly without any change).
    Converged,
    /// Some mutation was refused; the next pass retries it.
    Partial,
    /// A side could not be read, nothing was changed.
    Failed,
    /// The bot went offline before or during the pass.
    Abandoned,
    /// The identity is not linked.
    Skipped,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReconcileOutcome::Converged => "converged",
            ReconcileOutcome::Partial => "partial",
            ReconcileOutcome::Failed => "failed",
            ReconcileOutcome::Abandoned => "abandoned",
            ReconcileOutcome::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Result of one pass. Deltas only list what was actually applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub identity: Identity,
    pub bot_name: String,
    pub outcome: ReconcileOutcome,
    pub game_applied: RankDelta,
    pub external_applied: RankDelta,
    pub name_pushed: bool,
    pub warnings: Vec<String>,
}

impl ReconcileReport {
    fn new(identity: &Identity, bot_name: &str) -> Self {
        Self {
            identity: identity.clone(),
            bot_name: bot_name.to_string(),
            outcome: ReconcileOutcome::Converged,
            game_applied: RankDelta::default(),
            external_applied: RankDelta::default(),
            name_pushed: false,
            warnings: Vec::new(),
        }
    }

    fn finish(mut self, outcome: ReconcileOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// True when the pass changed nothing on either side.
    pub fn is_noop(&self) -> bool {
        self.game_applied.is_empty() && self.external_applied.is_empty()
    }
}

/// Runs reconciliation passes between the game and one bot's platform.
pub struct RankReconciler {
    bot_name: String,
    game: Arc<dyn RankResource>,
    external: Arc<dyn RankResource>,
    mapping: Arc<RankMapping>,
    policy: SyncPolicy,
}

impl RankReconciler {
    pub fn new(
        bot_name: impl Into<String>,
        game: Arc<dyn RankResource>,
        external: Arc<dyn RankResource>,
        mapping: Arc<RankMapping>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            game,
            external,
            mapping,
            policy,
        }
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn mapping(&self) -> &Arc<RankMapping> {
        &self.mapping
    }

    /// Runs one pass for `identity`.
    ///
    /// Never fails: lookup and apply errors are logged as warnings and end up in
    /// the report.
    pub async fn reconcile(&self, identity: &Identity) -> ReconcileReport {
        self.reconcile_shared(identity, None).await
    }

    /// Reads the identity's roles on this bot's platform, `None` when the bot
    /// is offline or the lookup fails.
    pub async fn observe_external(&self, identity: &Identity) -> Option<RankSet> {
        if !identity.is_linked() || !self.external.is_available() {
            return None;
        }
        match self.external.current_ranks(identity).await {
            Ok(roles) => Some(roles),
            Err(e) => {
                debug!("Bot '{}' could not read roles of {}: {}", self.bot_name, identity, e);
                None
            }
        }
    }

    /// Runs one pass where `ExternalToGame` ranks are granted by this
    /// platform's roles plus `shared_roles`, the roles seen on the other bots.
    pub async fn reconcile_shared(
        &self,
        identity: &Identity,
        shared_roles: Option<&RankSet>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::new(identity, &self.bot_name);

        if !identity.is_linked() {
            return report.finish(ReconcileOutcome::Skipped);
        }
        if !self.external.is_available() {
            debug!("Bot '{}' offline, abandoning pass for {}", self.bot_name, identity);
            return report.finish(ReconcileOutcome::Abandoned);
        }

        let (game, external) = tokio::join!(
            self.game.current_ranks(identity),
            self.external.current_ranks(identity)
        );
        let game = match game {
            Ok(ranks) => ranks,
            Err(e) => {
                self.warn_lookup(&mut report, "game", &e);
                return report.finish(ReconcileOutcome::Failed);
            }
        };
        let external = match external {
            Ok(roles) => roles,
            Err(LookupError::BotOffline(_)) => return report.finish(ReconcileOutcome::Abandoned),
            Err(e) => {
                self.warn_lookup(&mut report, "external", &e);
                return report.finish(ReconcileOutcome::Failed);
            }
        };

        let granting = match shared_roles {
            Some(shared) => external.union(shared),
            None => external.clone(),
        };
        let plan = plan_reconciliation_with(&self.mapping, self.policy, &game, &external, &granting);
        let mut partial = false;

        // Game side first.
        let game_now = if plan.game.is_empty() {
            plan.game_target.clone()
        } else {
            match self.game.apply_ranks(identity, &plan.game_target).await {
                Ok(()) => {
                    report.game_applied = plan.game.clone();
                    plan.game_target.clone()
                }
                Err(e) => {
                    self.warn_apply(&mut report, "game", &e);
                    partial = true;
                    game
                }
            }
        };

        if !self.external.is_available() {
            debug!("Bot '{}' went offline mid-pass for {}", self.bot_name, identity);
            return report.finish(ReconcileOutcome::Abandoned);
        }

        let external_target = if partial {
            plan_external_target(&self.mapping, self.policy, &game_now, &external)
        } else {
            plan.external_target.clone()
        };
        let external_delta = RankDelta::between(&external, &external_target);

        if !external_delta.is_empty() {
            match self.external.apply_ranks(identity, &external_target).await {
                Ok(()) => report.external_applied = external_delta,
                Err(ApplyError::BotOffline(_)) => {
                    return report.finish(ReconcileOutcome::Abandoned);
                }
                Err(e) => {
                    self.warn_apply(&mut report, "external", &e);
                    partial = true;
                }
            }
        }

        if self.policy.sync_names && !partial {
            match self.external.sync_name(identity).await {
                Ok(pushed) => report.name_pushed = pushed,
                Err(e) => self.warn_apply(&mut report, "display name", &e),
            }
        }

        if !report.is_noop() {
            info!(
                "🔄 Reconciled {} via '{}': game {}, external {}",
                identity, self.bot_name, report.game_applied, report.external_applied
            );
        }

        let outcome = if partial {
            ReconcileOutcome::Partial
        } else {
            ReconcileOutcome::Converged
        };
        report.finish(outcome)
    }

    fn warn_lookup(&self, report: &mut ReconcileReport, side: &str, error: &LookupError) {
        let message = format!("reading {} ranks failed: {}", side, error);
        warn!("⚠️ [{}] {} for {}", self.bot_name, message, report.identity);
        report.warnings.push(message);
    }

    fn warn_apply(&self, report: &mut ReconcileReport, side: &str, error: &ApplyError) {
        let message = format!("updating {} failed: {}", side, error);
        if error.is_retryable() {
            warn!("⚠️ [{}] {} for {}", self.bot_name, message, report.identity);
        } else {
            warn!(
                "⚠️ [{}] {} for {}; this will not heal without operator action",
                self.bot_name, message, report.identity
            );
        }
        report.warnings.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApplyError, LookupError};
    use crate::rank::{MappingEntry, Side};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use ranksync_event_system::{ExternalId, GameId};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn set(items: &[&str]) -> RankSet {
        items.iter().copied().collect()
    }

    fn mapping() -> RankMapping {
        RankMapping::from_entries([
            MappingEntry::new("Admin", set(&["admin", "mod"]), SyncDirection::GameToExternal),
            MappingEntry::new("Builder", set(&["builder"]), SyncDirection::GameToExternal),
            MappingEntry::new("Booster", set(&["supporter"]), SyncDirection::ExternalToGame),
        ])
        .unwrap()
    }

    /// Plain in-memory side with switches for failures.
    #[derive(Default)]
    struct FakeSide {
        ranks: DashMap<GameId, RankSet>,
        offline: AtomicBool,
        reject: AtomicBool,
        applies: AtomicUsize,
        external: bool,
    }

    impl FakeSide {
        fn external() -> Self {
            Self {
                external: true,
                ..Self::default()
            }
        }

        fn get(&self, id: GameId) -> RankSet {
            self.ranks.get(&id).map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl RankResource for FakeSide {
        fn side(&self) -> Side {
            if self.external {
                Side::External
            } else {
                Side::Game
            }
        }

        async fn current_ranks(&self, identity: &Identity) -> Result<RankSet, LookupError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(LookupError::BotOffline("fake".into()));
            }
            Ok(self.get(identity.game_id))
        }

        async fn apply_ranks(&self, identity: &Identity, ranks: &RankSet) -> Result<(), ApplyError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(ApplyError::Rejected("nope".into()));
            }
            self.applies.fetch_add(1, Ordering::SeqCst);
            self.ranks.insert(identity.game_id, ranks.clone());
            Ok(())
        }

        fn is_available(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn linked() -> Identity {
        Identity::linked(GameId::new(), ExternalId::new("1")).unwrap()
    }

    fn reconciler(
        game: &Arc<FakeSide>,
        external: &Arc<FakeSide>,
        policy: SyncPolicy,
    ) -> RankReconciler {
        RankReconciler::new(
            "main",
            game.clone(),
            external.clone(),
            Arc::new(mapping()),
            policy,
        )
    }

    #[test]
    fn single_rank_grants_the_external_role() {
        let plan = plan_reconciliation(
            &mapping(),
            SyncPolicy::default(),
            &set(&["admin"]),
            &RankSet::new(),
        );
        assert_eq!(plan.external_target, set(&["Admin"]));
        assert!(plan.game.is_empty());
    }

    #[test]
    fn external_role_grants_game_ranks_and_removal_revokes_them() {
        let m = mapping();
        let plan = plan_reconciliation(&m, SyncPolicy::default(), &set(&["default"]), &set(&["Booster"]));
        assert_eq!(plan.game.add, set(&["supporter"]));

        let plan = plan_reconciliation(&m, SyncPolicy::default(), &set(&["default", "supporter"]), &RankSet::new());
        assert_eq!(plan.game.remove, set(&["supporter"]));
        assert_eq!(plan.game_target, set(&["default"]));
    }

    #[test]
    fn unmapped_ranks_pass_through_by_default() {
        let m = mapping();
        let plan = plan_reconciliation(
            &m,
            SyncPolicy::default(),
            &set(&["default", "builder"]),
            &set(&["Admin", "Nitro", "Muted"]),
        );

        assert!(plan.game.is_empty());
        assert_eq!(plan.external.remove, set(&["Admin"]));
        assert_eq!(plan.external.add, set(&["Builder"]));
        for rank in plan.game.touched().iter().chain(plan.external.touched().iter()) {
            assert!(m.roles().contains(rank) || m.game_ranks().contains(rank));
        }
    }

    #[test]
    fn update_non_synced_strips_unmapped_external_roles_only() {
        let policy = SyncPolicy {
            update_non_synced: true,
            sync_names: false,
        };
        let plan = plan_reconciliation(&mapping(), policy, &set(&["default"]), &set(&["Muted", "Booster"]));

        assert_eq!(plan.external_target, set(&["Booster"]));
        assert_eq!(plan.game_target, set(&["default", "supporter"]));
    }

    #[test]
    fn second_plan_after_applying_the_first_is_empty() {
        let m = mapping();
        for policy in [
            SyncPolicy::default(),
            SyncPolicy {
                update_non_synced: true,
                sync_names: false,
            },
        ] {
            let first = plan_reconciliation(
                &m,
                policy,
                &set(&["mod", "supporter", "default"]),
                &set(&["Builder", "Booster", "Nitro"]),
            );
            let second = plan_reconciliation(&m, policy, &first.game_target, &first.external_target);
            assert!(second.is_empty(), "{:?}", second);
        }
    }

    #[test]
    fn roles_from_other_platforms_keep_granted_ranks() {
        let m = mapping();
        let here = set(&["Admin"]);
        let everywhere = set(&["Admin", "Booster"]);

        let plan = plan_reconciliation_with(
            &m,
            SyncPolicy::default(),
            &set(&["admin", "supporter"]),
            &here,
            &everywhere,
        );
        assert!(plan.game.is_empty(), "{:?}", plan.game);
        assert!(plan.external.is_empty(), "Booster is not pushed to this platform");

        let alone = plan_reconciliation(&m, SyncPolicy::default(), &set(&["admin", "supporter"]), &here);
        assert_eq!(alone.game.remove, set(&["supporter"]));
    }

    #[tokio::test]
    async fn pass_applies_game_then_external_and_is_idempotent() {
        let game = Arc::new(FakeSide::default());
        let external = Arc::new(FakeSide::external());
        let identity = linked();
        game.ranks.insert(identity.game_id, set(&["admin"]));

        let reconciler = reconciler(&game, &external, SyncPolicy::default());
        let first = reconciler.reconcile(&identity).await;
        assert_eq!(first.outcome, ReconcileOutcome::Converged);
        assert_eq!(external.get(identity.game_id), set(&["Admin"]));
        assert_eq!(game.get(identity.game_id), set(&["admin"]));
        assert_eq!(game.applies.load(Ordering::SeqCst), 0);

        let second = reconciler.reconcile(&identity).await;
        assert!(second.is_noop());
        assert_eq!(external.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_game_apply_still_syncs_external_from_actual_ranks() {
        let game = Arc::new(FakeSide::default());
        let external = Arc::new(FakeSide::external());
        let identity = linked();
        game.ranks.insert(identity.game_id, set(&["builder"]));
        external.ranks.insert(identity.game_id, set(&["Booster"]));
        game.reject.store(true, Ordering::SeqCst);

        let report = reconciler(&game, &external, SyncPolicy::default())
            .reconcile(&identity)
            .await;

        assert_eq!(report.outcome, ReconcileOutcome::Partial);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.game_applied.is_empty());
        assert_eq!(external.get(identity.game_id), set(&["Booster", "Builder"]));
    }

    #[tokio::test]
    async fn offline_bot_abandons_without_touching_the_game() {
        let game = Arc::new(FakeSide::default());
        let external = Arc::new(FakeSide::external());
        external.offline.store(true, Ordering::SeqCst);

        let report = reconciler(&game, &external, SyncPolicy::default())
            .reconcile(&linked())
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::Abandoned);
        assert_eq!(game.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unlinked_identity_is_skipped() {
        let game = Arc::new(FakeSide::default());
        let external = Arc::new(FakeSide::external());
        let report = reconciler(&game, &external, SyncPolicy::default())
            .reconcile(&Identity::pending(GameId::new()).unwrap())
            .await;
        assert_eq!(report.outcome, ReconcileOutcome::Skipped);
    }
}
