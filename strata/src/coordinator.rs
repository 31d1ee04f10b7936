//! Fleet-wide rollup passes.
//!
//! A pass walks the rollup tree of every recently active agent bottom up. A
//! node rolls up only once its whole subtree has finished, siblings run
//! concurrently on a bounded worker pool, and sibling order is shuffled on
//! every pass so concurrent coordinators sharing a store tend to work on
//! different nodes. Nothing here prevents two coordinators from rolling up
//! the same node; the upserts they issue are identical.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use metrics::{counter, gauge};
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use strata_signal::Watcher;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, next_pass_delay},
    config::CoordinatorConfig,
    pool::PoolSizer,
    row::AgentCapture,
    scheduler::{self, RollupReport, Scheduler},
    store::{self, RollupKind, RowStore},
    tree::{RollupNode, build_forest},
};

/// Failure reported by an [`AlertEvaluator`].
#[derive(thiserror::Error, Debug)]
#[error("alert evaluation failed: {0}")]
pub struct AlertError(pub String);

/// Evaluates alert conditions once a node's rollup for the pass is done.
#[async_trait]
pub trait AlertEvaluator: Send + Sync {
    /// Evaluate the alerts of `agent_rollup_id`, whose data is complete
    /// through `horizon`.
    async fn evaluate(&self, agent_rollup_id: &str, horizon: i64) -> Result<(), AlertError>;
}

/// An [`AlertEvaluator`] with no alerts configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAlerts;

#[async_trait]
impl AlertEvaluator for NoAlerts {
    async fn evaluate(&self, _agent_rollup_id: &str, _horizon: i64) -> Result<(), AlertError> {
        Ok(())
    }
}

/// Totals of a finished pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Nodes visited.
    pub nodes: usize,
    /// Nodes whose aggregate or gauge rollup failed or was skipped.
    pub failures: usize,
    /// Whether the pass used the sweep window.
    pub sweep: bool,
    /// Wall time of the pass.
    pub elapsed: Duration,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every node was visited. Individual nodes may have failed.
    Completed(PassSummary),
    /// The pass could not start.
    Failed,
    /// Shutdown interrupted the pass.
    Cancelled,
}

/// Outcome of one node within a pass. Each chain carries its own horizon:
/// gauges arriving never make aggregates look complete, and the reverse.
#[derive(Debug, Clone)]
struct NodeResult {
    id: String,
    aggregate_horizon: Option<i64>,
    gauge_horizon: Option<i64>,
    failed: bool,
    gauges_ok: bool,
}

impl NodeResult {
    fn horizon(&self, kind: RollupKind) -> Option<i64> {
        match kind {
            RollupKind::Aggregate => self.aggregate_horizon,
            RollupKind::Gauge => self.gauge_horizon,
        }
    }

    /// The horizon alerts see: the older of the two chains.
    fn alert_horizon(&self) -> Option<i64> {
        match (self.aggregate_horizon, self.gauge_horizon) {
            (Some(aggregates), Some(gauges)) => Some(aggregates.min(gauges)),
            (aggregates, gauges) => aggregates.or(gauges),
        }
    }
}

struct Shared<S: ?Sized, A> {
    scheduler: Scheduler<S>,
    alerts: A,
    child_lag_tolerance: i64,
}

/// The horizon of a group: the oldest horizon among its children, leaving
/// out children lagging the most advanced one by more than `tolerance`.
///
/// A child left out keeps rolling up its own levels, but the group moves on
/// without it. Level 0 rows the child later delivers at or before the
/// group's last level 0 rollup time are never merged into the group. Use
/// [`lagging_children`] to find the children left out.
#[must_use]
pub fn group_horizon(children: impl IntoIterator<Item = i64>, tolerance: i64) -> Option<i64> {
    let horizons: Vec<i64> = children.into_iter().collect();
    let newest = horizons.iter().copied().max()?;
    horizons
        .into_iter()
        .filter(|horizon| newest - horizon <= tolerance)
        .min()
}

/// Children whose horizon trails the most advanced sibling by more than
/// `tolerance`, in input order.
#[must_use]
pub fn lagging_children<'a>(children: impl IntoIterator<Item = (&'a str, i64)>, tolerance: i64) -> Vec<&'a str> {
    let children: Vec<(&str, i64)> = children.into_iter().collect();
    let Some(newest) = children.iter().map(|(_, horizon)| *horizon).max() else {
        return Vec::new();
    };
    children
        .into_iter()
        .filter(|(_, horizon)| newest - horizon > tolerance)
        .map(|(id, _)| id)
        .collect()
}

/// Drives rollup passes over the agent tree.
pub struct Coordinator<S: ?Sized, C, A> {
    shared: Arc<Shared<S, A>>,
    clock: C,
    config: CoordinatorConfig,
    sizer: PoolSizer,
    passes: u64,
}

impl<S: ?Sized, C, A> fmt::Debug for Coordinator<S, C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("sizer", &self.sizer)
            .field("passes", &self.passes)
            .finish_non_exhaustive()
    }
}

impl<S, C, A> Coordinator<S, C, A>
where
    S: RowStore + ?Sized + 'static,
    C: Clock,
    A: AlertEvaluator + 'static,
{
    /// Create a coordinator starting with `config.min_workers` workers.
    #[must_use]
    pub fn new(scheduler: Scheduler<S>, clock: C, alerts: A, config: CoordinatorConfig) -> Self {
        let sizer = PoolSizer::new(
            config.min_workers,
            config.max_workers,
            config.slow_pass(),
            config.fast_pass(),
            config.resize_after_passes,
        );
        Self {
            shared: Arc::new(Shared {
                scheduler,
                alerts,
                child_lag_tolerance: config.child_lag_tolerance_millis,
            }),
            clock,
            config,
            sizer,
            passes: 0,
        }
    }

    /// Workers the next pass will use.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.sizer.current()
    }

    /// Run passes on the configured cadence until shutdown is signaled.
    pub async fn run(mut self, mut watcher: Watcher) {
        loop {
            let delay = next_pass_delay(
                self.clock.now_millis(),
                self.config.pass_interval_millis,
                self.config.pass_offset_millis,
            );
            tokio::select! {
                biased;

                () = watcher.recv() => {
                    info!("shutdown signaled, rollup driver stopping");
                    return;
                }
                () = self.clock.sleep(delay) => {}
            }
            if self.run_pass(&mut watcher).await == PassOutcome::Cancelled {
                return;
            }
        }
    }

    /// Run one pass. Shutdown aborts the pass promptly, leaving only whole
    /// rows behind.
    pub async fn run_pass(&mut self, watcher: &mut Watcher) -> PassOutcome {
        let started = Instant::now();
        self.passes += 1;
        let pass = self.passes;
        let sweep = self.config.sweep_every_passes > 0 && pass % self.config.sweep_every_passes == 0;
        let window = if sweep {
            self.config.sweep_window_millis
        } else {
            self.config.active_window_millis
        };
        let now = self.clock.now_millis();
        let work = pass_work(Arc::clone(&self.shared), now - window, sweep, self.sizer.current());

        let result = tokio::select! {
            biased;

            () = watcher.recv() => {
                info!(pass, "rollup pass cancelled by shutdown");
                return PassOutcome::Cancelled;
            }
            result = work => result,
        };

        let (nodes, failures) = match result {
            Ok(totals) => totals,
            Err(err) => {
                error!(pass, "rollup pass failed: {err}");
                return PassOutcome::Failed;
            }
        };
        let elapsed = started.elapsed();
        let workers = self.sizer.observe(elapsed);
        gauge!("strata_rollup_pass_duration_seconds").set(elapsed.as_secs_f64());
        counter!("strata_rollup_pass_total").increment(1);
        #[allow(clippy::cast_precision_loss)]
        let worker_gauge = workers as f64;
        gauge!("strata_rollup_workers").set(worker_gauge);
        info!(pass, nodes, failures, sweep, ?elapsed, workers, "rollup pass complete");
        PassOutcome::Completed(PassSummary {
            nodes,
            failures,
            sweep,
            elapsed,
        })
    }
}

async fn pass_work<S, A>(
    shared: Arc<Shared<S, A>>,
    since: i64,
    sweep: bool,
    workers: usize,
) -> Result<(usize, usize), store::Error>
where
    S: RowStore + ?Sized + 'static,
    A: AlertEvaluator + 'static,
{
    let store = Arc::clone(shared.scheduler.store());
    let agents = store.active_agents(since).await?;
    let captures: FxHashMap<String, AgentCapture> = agents
        .into_iter()
        .map(|agent| (agent.agent_id.clone(), agent))
        .collect();
    let mut roots = build_forest(captures.keys().map(String::as_str));
    roots.shuffle(&mut rand::rng());
    let forest: usize = roots.iter().map(RollupNode::node_count).sum();
    debug!(agents = captures.len(), nodes = forest, "rollup forest built");

    let captures = Arc::new(captures);
    let permits = Arc::new(Semaphore::new(workers));
    let results: Vec<NodeResult> = join_all(roots.into_iter().map(|root| {
        roll_node(
            Arc::clone(&shared),
            root,
            Arc::clone(&captures),
            Arc::clone(&permits),
        )
    }))
    .await
    .into_iter()
    .flatten()
    .collect();

    for result in &results {
        let Some(horizon) = result.alert_horizon() else {
            continue;
        };
        if result.failed {
            continue;
        }
        if let Err(err) = shared.alerts.evaluate(&result.id, horizon).await {
            warn!(agent_rollup_id = %result.id, "{err}");
        }
    }

    let pruned = shared.scheduler.prune_idle_locks();
    debug!(pruned, "released idle agent locks");

    if sweep {
        let expired = store.expire_full_texts(since).await?;
        debug!(expired, "expired unused full texts");
    }

    let failures = results
        .iter()
        .filter(|result| result.failed || !result.gauges_ok)
        .count();
    Ok((results.len(), failures))
}

/// Roll up the subtree under `node`, children first. The node's own result
/// is the last element.
fn roll_node<S, A>(
    shared: Arc<Shared<S, A>>,
    node: RollupNode,
    captures: Arc<FxHashMap<String, AgentCapture>>,
    permits: Arc<Semaphore>,
) -> BoxFuture<'static, Vec<NodeResult>>
where
    S: RowStore + ?Sized + 'static,
    A: AlertEvaluator + 'static,
{
    async move {
        let child_ids = node.child_ids();
        let RollupNode { id, mut children } = node;
        children.shuffle(&mut rand::rng());

        let subtrees = join_all(children.into_iter().map(|child| {
            roll_node(
                Arc::clone(&shared),
                child,
                Arc::clone(&captures),
                Arc::clone(&permits),
            )
        }))
        .await;

        let (horizons, gauges_blocked) = {
            let direct: Vec<&NodeResult> = subtrees.iter().filter_map(|subtree| subtree.last()).collect();
            let horizon = |kind: RollupKind| {
                if child_ids.is_empty() {
                    return captures.get(&id).and_then(|capture| capture.latest(kind));
                }
                let present: Vec<(&str, i64)> = direct
                    .iter()
                    .filter_map(|child| child.horizon(kind).map(|horizon| (child.id.as_str(), horizon)))
                    .collect();
                for child in lagging_children(present.iter().copied(), shared.child_lag_tolerance) {
                    warn!(
                        agent_rollup_id = %id,
                        child,
                        kind = ?kind,
                        "child lags its siblings, group rolls up without it"
                    );
                    counter!("strata_rollup_lagging_child_total").increment(1);
                }
                group_horizon(present.into_iter().map(|(_, horizon)| horizon), shared.child_lag_tolerance)
            };
            (
                Horizons {
                    aggregates: horizon(RollupKind::Aggregate),
                    gauges: horizon(RollupKind::Gauge),
                },
                direct.iter().any(|child| !child.gauges_ok),
            )
        };

        let mut results: Vec<NodeResult> = subtrees.into_iter().flatten().collect();
        let own = if horizons.aggregates.is_none() && horizons.gauges.is_none() {
            NodeResult {
                id,
                aggregate_horizon: None,
                gauge_horizon: None,
                failed: false,
                gauges_ok: !gauges_blocked,
            }
        } else {
            run_node(shared, id, child_ids, horizons, gauges_blocked, permits).await
        };
        results.push(own);
        results
    }
    .boxed()
}

#[derive(Debug, Clone, Copy)]
struct Horizons {
    aggregates: Option<i64>,
    gauges: Option<i64>,
}

/// Roll up one node on the worker pool. A chain with no horizon has
/// nothing to roll up this pass.
async fn run_node<S, A>(
    shared: Arc<Shared<S, A>>,
    id: String,
    children: Vec<String>,
    horizons: Horizons,
    gauges_blocked: bool,
    permits: Arc<Semaphore>,
) -> NodeResult
where
    S: RowStore + ?Sized + 'static,
    A: AlertEvaluator + 'static,
{
    let failed = NodeResult {
        id: id.clone(),
        aggregate_horizon: horizons.aggregates,
        gauge_horizon: horizons.gauges,
        failed: true,
        gauges_ok: false,
    };
    let Ok(_permit) = permits.acquire_owned().await else {
        error!(agent_rollup_id = %id, "worker pool closed");
        return failed;
    };

    // Dropping the set aborts the task, so a cancelled pass stops here.
    let mut set = JoinSet::new();
    let task_id = id.clone();
    set.spawn(async move {
        let scheduler = &shared.scheduler;
        let aggregates = match horizons.aggregates {
            Some(horizon) => Some(scheduler.rollup_aggregates(&task_id, &children, horizon).await),
            None => None,
        };
        let gauges = match horizons.gauges {
            Some(_) if gauges_blocked => GaugeRun::Blocked,
            Some(horizon) => GaugeRun::Ran(scheduler.rollup_gauges(&task_id, &children, horizon).await),
            None => GaugeRun::Idle,
        };
        (aggregates, gauges)
    });
    let (aggregates, gauges) = match set.join_next().await {
        Some(Ok(outcome)) => outcome,
        Some(Err(err)) => {
            error!(agent_rollup_id = %id, "rollup task failed: {err}");
            counter!("strata_rollup_node_failure_total").increment(1);
            return failed;
        }
        None => return failed,
    };

    let aggregates_failed = match aggregates {
        None => false,
        Some(Ok(report)) => {
            debug!(
                agent_rollup_id = %id,
                horizon = horizons.aggregates,
                buckets = report.buckets,
                "aggregates rolled up"
            );
            false
        }
        Some(Err(err)) => {
            error!(agent_rollup_id = %id, "aggregate rollup failed: {err}");
            counter!("strata_rollup_node_failure_total").increment(1);
            true
        }
    };
    let gauges_ok = match gauges {
        GaugeRun::Idle => !gauges_blocked,
        GaugeRun::Blocked => {
            warn!(agent_rollup_id = %id, "gauge rollup skipped, a child's gauge rollup did not complete");
            false
        }
        GaugeRun::Ran(Ok(_)) => true,
        GaugeRun::Ran(Err(err)) => {
            error!(agent_rollup_id = %id, "gauge rollup failed: {err}");
            counter!("strata_rollup_node_failure_total").increment(1);
            false
        }
    };
    NodeResult {
        id,
        aggregate_horizon: horizons.aggregates,
        gauge_horizon: horizons.gauges,
        failed: aggregates_failed,
        gauges_ok,
    }
}

#[derive(Debug)]
enum GaugeRun {
    Idle,
    Blocked,
    Ran(Result<RollupReport, scheduler::Error>),
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use strata_aggregate::MutableAggregate;

    use super::{
        AlertError, AlertEvaluator, Coordinator, NoAlerts, PassOutcome, PassSummary, group_horizon, lagging_children,
    };
    use crate::{
        blobs::{self, LevelStores, Limits},
        clock::Clock,
        config::CoordinatorConfig,
        ingest::Collector,
        row::{GaugeValue, Scope, ScopeFilter, TimeRange},
        scheduler::Scheduler,
        store::{MemoryStore, RollupKind, RowStore},
    };

    const LIMITS: Limits = Limits {
        max_query_aggregates: 10,
        max_service_call_aggregates: 10,
    };

    #[derive(Debug, Clone, Copy)]
    struct FixedClock(i64);

    #[async_trait]
    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }

    #[derive(Debug, Default)]
    struct RecordingAlerts(Mutex<Vec<(String, i64)>>);

    #[async_trait]
    impl AlertEvaluator for Arc<RecordingAlerts> {
        async fn evaluate(&self, agent_rollup_id: &str, horizon: i64) -> Result<(), AlertError> {
            self.0
                .lock()
                .expect("alerts lock")
                .push((agent_rollup_id.to_string(), horizon));
            Ok(())
        }
    }

    async fn raw(store: &MemoryStore, capped: &LevelStores, agent: &str, time: i64) {
        let mut agg = MutableAggregate::new();
        agg.add_scalar_sums(1.0, 1, 0, false);
        blobs::persist_aggregate(
            store,
            capped.level(0).expect("level"),
            agent,
            0,
            &Scope::overall("Web"),
            time,
            &agg,
            LIMITS,
        )
        .await
        .expect("persist");
        store
            .record_capture(agent, RollupKind::Aggregate, time)
            .await
            .expect("capture");
    }

    async fn gauge(store: &MemoryStore, agent: &str, time: i64) {
        store
            .upsert_gauge(
                agent,
                0,
                GaugeValue {
                    name: "heap.used".to_string(),
                    capture_time: time,
                    value: 1.0,
                    weight: 1,
                },
            )
            .await
            .expect("gauge");
        store
            .record_capture(agent, RollupKind::Gauge, time)
            .await
            .expect("capture");
    }

    async fn completed(coordinator: &mut Coordinator<MemoryStore, FixedClock, NoAlerts>) -> PassSummary {
        let (mut watcher, _broadcaster) = strata_signal::signal();
        match coordinator.run_pass(&mut watcher).await {
            PassOutcome::Completed(summary) => summary,
            outcome => panic!("pass ended with {outcome:?}"),
        }
    }

    async fn setup(dir: &std::path::Path) -> (Arc<MemoryStore>, Scheduler<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let capped = Arc::new(LevelStores::open(dir, &[1 << 16, 1 << 16]).expect("open"));
        for agent in ["g::fast", "g::slow"] {
            raw(&store, &capped, agent, 60_000).await;
            raw(&store, &capped, agent, 300_000).await;
        }
        let scheduler = Scheduler::new(Arc::clone(&store), capped, vec![0, 300_000], LIMITS);
        (store, scheduler)
    }

    #[test]
    fn lagging_children_do_not_hold_back_groups() {
        assert_eq!(group_horizon([600_000, 540_000], 300_000), Some(540_000));
        assert_eq!(group_horizon([600_000, 60_000], 300_000), Some(600_000));
        assert_eq!(group_horizon([], 300_000), None);
    }

    #[test]
    fn lagging_children_are_named() {
        let children = [("g::a", 600_000), ("g::b", 60_000), ("g::c", 540_000)];
        assert_eq!(lagging_children(children, 300_000), vec!["g::b"]);
        assert!(lagging_children(children, 600_000).is_empty());
        assert!(lagging_children([], 300_000).is_empty());
    }

    #[tokio::test]
    async fn gauges_do_not_advance_the_aggregate_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let capped = Arc::new(LevelStores::open(dir.path(), &[1 << 16, 1 << 16]).expect("open"));
        let collector = Collector::new(Arc::clone(&store), Arc::clone(&capped), LIMITS, 64);
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&capped), vec![0, 300_000], LIMITS);
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());

        let heap = GaugeValue {
            name: "heap.used".to_string(),
            capture_time: 300_000,
            value: 10.0,
            weight: 1,
        };
        collector.store_gauges("agent", &[heap]).await.expect("gauges");
        let first = completed(&mut coordinator).await;
        assert_eq!(first.failures, 0);
        assert_eq!(
            store
                .read_last_rollup_times("agent", RollupKind::Gauge)
                .await
                .expect("times")
                .get(1)
                .copied(),
            Some(300_000)
        );
        assert!(
            store
                .read_last_rollup_times("agent", RollupKind::Aggregate)
                .await
                .expect("times")
                .iter()
                .all(|time| *time == 0)
        );

        raw(&store, &capped, "agent", 240_000).await;
        raw(&store, &capped, "agent", 300_000).await;
        let second = completed(&mut coordinator).await;
        assert_eq!(second.failures, 0);

        let row = store
            .read_aggregate("agent", 1, &Scope::overall("Web"), 300_000)
            .await
            .expect("read")
            .expect("level 1 row");
        assert_eq!(row.decode().expect("decode").transaction_count, 2);
    }

    #[tokio::test]
    async fn node_failure_does_not_stop_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let capped = Arc::new(LevelStores::open(dir.path(), &[1 << 16, 1 << 16]).expect("open"));
        for agent in ["bad", "good"] {
            raw(&store, &capped, agent, 300_000).await;
        }
        store.fail_reads("bad", RollupKind::Aggregate);
        let scheduler = Scheduler::new(Arc::clone(&store), capped, vec![0, 300_000], LIMITS);
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());

        let summary = completed(&mut coordinator).await;
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.failures, 1);

        let range = TimeRange::closed(0, 600_000);
        let good = store
            .read_aggregates("good", 1, &ScopeFilter::Any, range)
            .await
            .expect("read");
        assert_eq!(good.len(), 1);
        assert!(store.upsert_log().iter().all(|(agent, level)| agent != "bad" || *level == 0));
    }

    #[tokio::test]
    async fn child_gauge_failure_skips_parent_gauges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let capped = Arc::new(LevelStores::open(dir.path(), &[1 << 16, 1 << 16]).expect("open"));
        for agent in ["g::bad", "g::good"] {
            raw(&store, &capped, agent, 300_000).await;
            gauge(&store, agent, 300_000).await;
        }
        store.fail_reads("g::bad", RollupKind::Gauge);
        let scheduler = Scheduler::new(Arc::clone(&store), capped, vec![0, 300_000], LIMITS);
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());

        let summary = completed(&mut coordinator).await;
        assert_eq!(summary.nodes, 3);
        assert_eq!(summary.failures, 2);

        let range = TimeRange::closed(0, 600_000);
        assert_eq!(store.read_gauges("g::good", 1, range).await.expect("read").len(), 1);
        for level in [0, 1] {
            assert!(
                store.read_gauges("g::", level, range).await.expect("read").is_empty(),
                "group gauges written at level {level}"
            );
        }
        let group = store
            .read_aggregates("g::", 1, &ScopeFilter::Any, range)
            .await
            .expect("read");
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].decode().expect("decode").transaction_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_waits_for_slow_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        store.delay_reads("g::slow", Duration::from_millis(50));
        let alerts = Arc::new(RecordingAlerts::default());
        let config = CoordinatorConfig {
            max_workers: 4,
            min_workers: 4,
            ..CoordinatorConfig::default()
        };
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), Arc::clone(&alerts), config);

        let (mut watcher, _broadcaster) = strata_signal::signal();
        let PassOutcome::Completed(summary) = coordinator.run_pass(&mut watcher).await else {
            panic!("pass did not complete");
        };
        assert_eq!(summary.nodes, 3);
        assert_eq!(summary.failures, 0);

        let log = store.upsert_log();
        let last_child = log
            .iter()
            .rposition(|(agent, level)| agent != "g::" && *level == 1)
            .expect("children rolled up");
        let first_group = log
            .iter()
            .position(|(agent, _)| agent == "g::")
            .expect("group rolled up");
        assert!(last_child < first_group, "group ran before its children: {log:?}");

        let group = store
            .read_aggregates("g::", 1, &ScopeFilter::Any, TimeRange::closed(300_000, 300_000))
            .await
            .expect("read");
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].decode().expect("decode").transaction_count, 4);

        let mut evaluated = alerts.0.lock().expect("alerts lock").clone();
        evaluated.sort();
        assert_eq!(
            evaluated,
            vec![
                ("g::".to_string(), 300_000),
                ("g::fast".to_string(), 300_000),
                ("g::slow".to_string(), 300_000),
            ]
        );
    }

    #[tokio::test]
    async fn second_pass_changes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());
        let (mut watcher, _broadcaster) = strata_signal::signal();

        coordinator.run_pass(&mut watcher).await;
        let before = store
            .read_aggregates("g::", 1, &ScopeFilter::Any, TimeRange::closed(0, 600_000))
            .await
            .expect("read");
        let outcome = coordinator.run_pass(&mut watcher).await;
        assert!(matches!(outcome, PassOutcome::Completed(_)));
        let after = store
            .read_aggregates("g::", 1, &ScopeFilter::Any, TimeRange::closed(0, 600_000))
            .await
            .expect("read");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());
        let (mut watcher, broadcaster) = strata_signal::signal();
        broadcaster.signal();

        assert_eq!(coordinator.run_pass(&mut watcher).await, PassOutcome::Cancelled);
        let rows = store
            .read_aggregates("g::", 0, &ScopeFilter::Any, TimeRange::closed(0, 600_000))
            .await
            .expect("read");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn shutdown_mid_pass_leaves_whole_rows_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        store.delay_reads("g::slow", Duration::from_secs(5));
        let mut coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());
        let (mut watcher, broadcaster) = strata_signal::signal();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            broadcaster.signal();
        };
        let (outcome, ()) = tokio::join!(coordinator.run_pass(&mut watcher), cancel);
        assert_eq!(outcome, PassOutcome::Cancelled);

        let range = TimeRange::closed(0, 600_000);
        for (agent, level) in [("g::slow", 1), ("g::", 0), ("g::", 1)] {
            let times = store
                .read_capture_times(agent, level, range)
                .await
                .expect("read");
            assert!(times.is_empty(), "{agent} level {level} was written");
        }
        for row in store
            .read_aggregates("g::fast", 1, &ScopeFilter::Any, range)
            .await
            .expect("read")
        {
            row.decode().expect("whole row");
        }
    }

    #[tokio::test]
    async fn driver_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_store, scheduler) = setup(dir.path()).await;
        let coordinator = Coordinator::new(scheduler, FixedClock(400_000), NoAlerts, CoordinatorConfig::default());
        let (watcher, broadcaster) = strata_signal::signal();
        broadcaster.signal();

        tokio::time::timeout(Duration::from_secs(5), coordinator.run(watcher))
            .await
            .expect("driver stopped");
    }
}
