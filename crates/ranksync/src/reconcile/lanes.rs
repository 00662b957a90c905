//! Per-identity work queues for reconciliation passes.
//!
//! Every game id gets its own lane: an unbounded channel drained by one task.
//! Passes for one identity therefore never overlap and run in the order they
//! were requested, while different identities proceed in parallel. Requests that
//! pile up behind a running pass are folded into a single follow-up pass, since
//! one pass over the latest state satisfies all of them.
//!
//! A pass runs every bot's reconciler in turn, after reading the identity's
//! roles on all platforms once so the bots agree on the game side.

use super::{RankReconciler, ReconcileReport};
use crate::link::LinkRegistry;
use crate::rank::RankSet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use ranksync_event_system::GameId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, trace};

type Reply = oneshot::Sender<Vec<ReconcileReport>>;

struct PassRequest {
    reply: Option<Reply>,
}

struct LanesInner {
    links: Arc<LinkRegistry>,
    reconcilers: RwLock<Vec<Arc<RankReconciler>>>,
    lanes: DashMap<GameId, mpsc::UnboundedSender<PassRequest>>,
    closed: AtomicBool,
    passes: AtomicU64,
    coalesced: AtomicU64,
}

/// Serializes reconciliation per identity.
///
/// Cheap to clone; clones share the same lanes.
#[derive(Clone)]
pub struct ReconcileLanes {
    inner: Arc<LanesInner>,
}

impl ReconcileLanes {
    pub fn new(links: Arc<LinkRegistry>, reconcilers: Vec<Arc<RankReconciler>>) -> Self {
        Self {
            inner: Arc::new(LanesInner {
                links,
                reconcilers: RwLock::new(reconcilers),
                lanes: DashMap::new(),
                closed: AtomicBool::new(false),
                passes: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Queues a pass for `game_id`. Returns false once the lanes are closed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, game_id: GameId) -> bool {
        self.submit(game_id, None)
    }

    /// Queues a pass and waits for the pass that covers it.
    ///
    /// Returns one report per bot, or `None` if the lanes were closed first.
    pub async fn enqueue_and_wait(&self, game_id: GameId) -> Option<Vec<ReconcileReport>> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(game_id, Some(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// Stops accepting work. Passes already running finish in the background.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.lanes.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops the reconciler of a bot that went away.
    pub async fn remove_bot(&self, bot_name: &str) -> bool {
        let mut reconcilers = self.inner.reconcilers.write().await;
        let before = reconcilers.len();
        reconcilers.retain(|r| r.bot_name() != bot_name);
        reconcilers.len() != before
    }

    pub async fn bot_names(&self) -> Vec<String> {
        let reconcilers = self.inner.reconcilers.read().await;
        reconcilers.iter().map(|r| r.bot_name().to_string()).collect()
    }

    /// Identities with a lane that is currently busy.
    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.len()
    }

    pub fn passes_run(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    pub fn requests_coalesced(&self) -> u64 {
        self.inner.coalesced.load(Ordering::SeqCst)
    }

    fn submit(&self, game_id: GameId, reply: Option<Reply>) -> bool {
        if self.is_closed() {
            return false;
        }

        let request = PassRequest { reply };
        // Sending under the entry guard keeps the idle worker from retiring
        // between our lookup and our send.
        match self.inner.lanes.entry(game_id) {
            Entry::Occupied(lane) => lane.get().send(request).is_ok(),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sent = tx.send(request).is_ok();
                slot.insert(tx);
                tokio::spawn(run_lane(self.inner.clone(), game_id, rx));
                sent
            }
        }
    }
}

async fn run_lane(
    inner: Arc<LanesInner>,
    game_id: GameId,
    mut rx: mpsc::UnboundedReceiver<PassRequest>,
) {
    trace!("Lane opened for {}", game_id);

    while let Some(first) = rx.recv().await {
        let mut waiters: Vec<Reply> = first.reply.into_iter().collect();
        while let Ok(next) = rx.try_recv() {
            inner.coalesced.fetch_add(1, Ordering::SeqCst);
            waiters.extend(next.reply);
        }

        let reports = run_pass(&inner, game_id).await;
        inner.passes.fetch_add(1, Ordering::SeqCst);
        for waiter in waiters {
            let _ = waiter.send(reports.clone());
        }

        // Retire while idle. Submitters send under the same entry guard, so
        // nothing can slip in between the emptiness check and the removal.
        if let Entry::Occupied(lane) = inner.lanes.entry(game_id) {
            if rx.is_empty() {
                lane.remove();
                break;
            }
        }
    }

    trace!("Lane closed for {}", game_id);
}

async fn run_pass(inner: &LanesInner, game_id: GameId) -> Vec<ReconcileReport> {
    let Some(identity) = inner.links.identity_of(game_id).await else {
        debug!("Skipping pass for {}: not linked", game_id);
        return Vec::new();
    };

    let reconcilers = inner.reconcilers.read().await.clone();

    // Every bot grants game ranks from the roles seen on all platforms, so
    // they agree on the game target instead of undoing each other.
    let shared = if reconcilers.len() > 1 {
        let observed = join_all(reconcilers.iter().map(|r| r.observe_external(&identity))).await;
        Some(
            observed
                .into_iter()
                .flatten()
                .fold(RankSet::new(), |all, roles| all.union(&roles)),
        )
    } else {
        None
    };

    let mut reports = Vec::with_capacity(reconcilers.len());
    for reconciler in reconcilers {
        reports.push(reconciler.reconcile_shared(&identity, shared.as_ref()).await);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApplyError, LookupError};
    use crate::link::LinkSettings;
    use crate::rank::{MappingEntry, RankMapping, RankResource, Side, SyncDirection};
    use crate::reconcile::{ReconcileOutcome, SyncPolicy};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use ranksync_event_system::{create_event_system, ExternalId, Identity};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Game side that records the order of reads and can be slowed down.
    struct SlowGame {
        reads: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        log: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl RankResource for SlowGame {
        fn side(&self) -> Side {
            Side::Game
        }

        async fn current_ranks(&self, _identity: &Identity) -> Result<RankSet, LookupError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(n);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RankSet::new())
        }

        async fn apply_ranks(&self, _identity: &Identity, _ranks: &RankSet) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    struct EmptyExternal;

    #[async_trait]
    impl RankResource for EmptyExternal {
        fn side(&self) -> Side {
            Side::External
        }

        async fn current_ranks(&self, _identity: &Identity) -> Result<RankSet, LookupError> {
            Ok(RankSet::new())
        }

        async fn apply_ranks(&self, _identity: &Identity, _ranks: &RankSet) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    async fn setup(delay: Duration) -> (ReconcileLanes, Arc<SlowGame>, Arc<LinkRegistry>) {
        let links = Arc::new(LinkRegistry::new(LinkSettings::default(), create_event_system()));
        let game = Arc::new(SlowGame {
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
            log: Mutex::new(Vec::new()),
        });
        let mapping = RankMapping::from_entries([MappingEntry::new(
            "Admin",
            ["admin"].into_iter().collect(),
            SyncDirection::GameToExternal,
        )])
        .unwrap();
        let reconciler = Arc::new(RankReconciler::new(
            "main",
            game.clone(),
            Arc::new(EmptyExternal),
            Arc::new(mapping),
            SyncPolicy::default(),
        ));
        (ReconcileLanes::new(links.clone(), vec![reconciler]), game, links)
    }

    async fn link(links: &LinkRegistry, external: &str) -> GameId {
        let game_id = GameId::new();
        let code = links.issue_code(game_id).await.code;
        links.redeem(&code, ExternalId::new(external)).await.unwrap();
        game_id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_pass_in_flight_per_identity() {
        let (lanes, game, links) = setup(Duration::from_millis(20)).await;
        let game_id = link(&links, "1").await;

        let waits: Vec<_> = (0..5)
            .map(|_| {
                let lanes = lanes.clone();
                tokio::spawn(async move { lanes.enqueue_and_wait(game_id).await })
            })
            .collect();
        for wait in futures::future::join_all(waits).await {
            let reports = wait.unwrap().unwrap();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].outcome, ReconcileOutcome::Converged);
        }

        assert_eq!(game.max_in_flight.load(Ordering::SeqCst), 1);
        // Requests queued behind a running pass are folded together.
        assert_eq!(
            lanes.passes_run() + lanes.requests_coalesced(),
            5,
            "every request is either run or coalesced"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identities_run_in_parallel() {
        let (lanes, game, links) = setup(Duration::from_millis(50)).await;
        let a = link(&links, "1").await;
        let b = link(&links, "2").await;

        let (ra, rb) = tokio::join!(lanes.enqueue_and_wait(a), lanes.enqueue_and_wait(b));
        assert!(ra.is_some() && rb.is_some());
        assert_eq!(game.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unlinked_identity_yields_no_reports() {
        let (lanes, _game, _links) = setup(Duration::ZERO).await;
        let reports = lanes.enqueue_and_wait(GameId::new()).await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn lanes_retire_when_idle_and_reject_work_after_close() {
        let (lanes, _game, links) = setup(Duration::ZERO).await;
        let game_id = link(&links, "1").await;

        lanes.enqueue_and_wait(game_id).await.unwrap();
        // The worker retires right after answering; give it a moment.
        for _ in 0..50 {
            if lanes.active_lanes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lanes.active_lanes(), 0);

        lanes.close();
        assert!(!lanes.enqueue(game_id));
        assert!(lanes.enqueue_and_wait(game_id).await.is_none());
    }

    fn set(items: &[&str]) -> RankSet {
        items.iter().copied().collect()
    }

    /// Rank storage keyed by game id that counts writes.
    struct StoredSide {
        side: Side,
        ranks: DashMap<GameId, RankSet>,
        writes: AtomicUsize,
    }

    impl StoredSide {
        fn new(side: Side) -> Arc<Self> {
            Arc::new(Self {
                side,
                ranks: DashMap::new(),
                writes: AtomicUsize::new(0),
            })
        }

        fn get(&self, id: GameId) -> RankSet {
            self.ranks.get(&id).map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl RankResource for StoredSide {
        fn side(&self) -> Side {
            self.side
        }

        async fn current_ranks(&self, identity: &Identity) -> Result<RankSet, LookupError> {
            Ok(self.get(identity.game_id))
        }

        async fn apply_ranks(&self, identity: &Identity, ranks: &RankSet) -> Result<(), ApplyError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.ranks.insert(identity.game_id, ranks.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn bots_that_disagree_settle_on_one_game_state() {
        let links = Arc::new(LinkRegistry::new(LinkSettings::default(), create_event_system()));
        let mapping = Arc::new(
            RankMapping::from_entries([
                MappingEntry::new("Admin", set(&["admin"]), SyncDirection::GameToExternal),
                MappingEntry::new("Booster", set(&["supporter"]), SyncDirection::ExternalToGame),
            ])
            .unwrap(),
        );
        let game = StoredSide::new(Side::Game);
        let discord = StoredSide::new(Side::External);
        let matrix = StoredSide::new(Side::External);
        let reconcilers = [("discord", &discord), ("matrix", &matrix)]
            .into_iter()
            .map(|(name, external)| {
                Arc::new(RankReconciler::new(
                    name,
                    game.clone(),
                    external.clone(),
                    mapping.clone(),
                    SyncPolicy::default(),
                ))
            })
            .collect();
        let lanes = ReconcileLanes::new(links.clone(), reconcilers);

        let game_id = link(&links, "1").await;
        game.ranks.insert(game_id, set(&["admin"]));
        // Boosting on one platform only.
        discord.ranks.insert(game_id, set(&["Booster"]));

        let first = lanes.enqueue_and_wait(game_id).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.outcome == ReconcileOutcome::Converged));
        let expected = set(&["admin", "supporter"]);
        assert_eq!(game.get(game_id), expected);
        assert_eq!(discord.get(game_id), set(&["Admin", "Booster"]));
        assert_eq!(matrix.get(game_id), set(&["Admin"]));
        let game_writes = game.writes.load(Ordering::SeqCst);
        assert_eq!(game_writes, 1);

        for _ in 0..3 {
            let again = lanes.enqueue_and_wait(game_id).await.unwrap();
            assert!(again.iter().all(|r| r.is_noop()), "{:?}", again);
        }
        assert_eq!(game.writes.load(Ordering::SeqCst), game_writes);
        assert_eq!(game.get(game_id), expected);

        // Losing the role everywhere revokes the rank once.
        discord.ranks.insert(game_id, set(&["Admin"]));
        lanes.enqueue_and_wait(game_id).await.unwrap();
        assert_eq!(game.get(game_id), set(&["admin"]));
        assert_eq!(game.writes.load(Ordering::SeqCst), game_writes + 1);
    }

    #[tokio::test]
    async fn removed_bot_is_no_longer_reconciled() {
        let (lanes, _game, links) = setup(Duration::ZERO).await;
        let game_id = link(&links, "1").await;

        assert!(lanes.remove_bot("main").await);
        assert!(!lanes.remove_bot("main").await);
        assert!(lanes.bot_names().await.is_empty());
        assert!(lanes.enqueue_and_wait(game_id).await.unwrap().is_empty());
    }
}
