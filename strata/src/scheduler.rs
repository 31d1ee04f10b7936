//! Per-agent rollup.
//!
//! Level `i` of an agent is derived only from its level `i - 1`. A group's
//! level 0 is derived from the level 0 rows of its children at the same
//! capture times, after which its coarser levels roll up like any agent's.
//! Every step for one agent runs under that agent's rollup lock; different
//! agents roll up concurrently.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use rustc_hash::FxHashMap;
use strata_aggregate::MutableAggregate;
use tracing::{debug, info};

use crate::{
    blobs::{self, LevelStores, Limits},
    levels::{bucket_boundary, bucket_window, safe_rollup_time},
    row::{GaugeValue, ScopeFilter, StoredRow, TimeRange},
    store::{self, RollupKind, RowStore, Upsert},
};

/// Errors produced by a rollup.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Row store failure.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// Writing a row or blob failed.
    #[error(transparent)]
    Persist(#[from] blobs::Error),
    /// Capped store failure other than malformed content.
    #[error(transparent)]
    Capped(#[from] strata_capped::Error),
    /// The lock table was poisoned by a panicking holder.
    #[error("rollup lock table poisoned")]
    Poisoned,
}

/// What one rollup invocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    /// Buckets computed across all levels.
    pub buckets: usize,
    /// Rows inserted or replaced.
    pub written: usize,
    /// Rows found identical and left alone.
    pub unchanged: usize,
    /// Input rows skipped as malformed.
    pub skipped: usize,
}

impl RollupReport {
    fn absorb(&mut self, other: RollupReport) {
        self.buckets += other.buckets;
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
    }
}

/// Where one level's input comes from.
#[derive(Debug, Clone, Copy)]
struct LevelStep<'a> {
    sources: &'a [String],
    source_level: usize,
    target_level: usize,
    interval: i64,
}

/// Rolls agents up level by level.
#[derive(Debug)]
pub struct Scheduler<S: ?Sized> {
    store: Arc<S>,
    capped: Arc<LevelStores>,
    intervals: Vec<i64>,
    limits: Limits,
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: RowStore + ?Sized> Scheduler<S> {
    /// Create a scheduler over `intervals`, index 0 being the raw level.
    #[must_use]
    pub fn new(store: Arc<S>, capped: Arc<LevelStores>, intervals: Vec<i64>, limits: Limits) -> Self {
        Self {
            store,
            capped,
            intervals,
            limits,
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// The row store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The per-level capped stores.
    #[must_use]
    pub fn capped(&self) -> &Arc<LevelStores> {
        &self.capped
    }

    /// Bucket widths, index 0 being the raw level.
    #[must_use]
    pub fn intervals(&self) -> &[i64] {
        &self.intervals
    }

    fn agent_lock(&self, agent: &str) -> Result<Arc<tokio::sync::Mutex<()>>, Error> {
        let mut locks = self.locks.lock().map_err(|_| Error::Poisoned)?;
        Ok(Arc::clone(locks.entry(agent.to_string()).or_default()))
    }

    /// Drop the locks of agents no rollup currently holds. Returns how many
    /// were dropped.
    pub fn prune_idle_locks(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    fn steps<'a>(&self, own: &'a [String], children: &'a [String]) -> Vec<LevelStep<'a>> {
        let mut steps = Vec::with_capacity(self.intervals.len());
        if !children.is_empty() {
            if let Some(&interval) = self.intervals.first() {
                steps.push(LevelStep {
                    sources: children,
                    source_level: 0,
                    target_level: 0,
                    interval,
                });
            }
        }
        for (level, &interval) in self.intervals.iter().enumerate().skip(1) {
            steps.push(LevelStep {
                sources: own,
                source_level: level - 1,
                target_level: level,
                interval,
            });
        }
        steps
    }

    /// Roll up the duration aggregates of `agent` through `horizon`, the
    /// capture time through which its level 0 input is complete.
    ///
    /// For a group, `children` names the nodes whose level 0 rows make up
    /// the group's level 0. Pass no children for a leaf agent.
    ///
    /// # Errors
    ///
    /// Returns storage failures. Malformed input rows are skipped and
    /// counted, never returned.
    pub async fn rollup_aggregates(
        &self,
        agent: &str,
        children: &[String],
        horizon: i64,
    ) -> Result<RollupReport, Error> {
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().await;

        let last = self.store.read_last_rollup_times(agent, RollupKind::Aggregate).await?;
        let me = [agent.to_string()];
        let mut report = RollupReport::default();
        for step in self.steps(&me, children) {
            let last = last.get(step.target_level).copied().unwrap_or(0);
            report.absorb(self.roll_aggregate_level(agent, step, last, horizon).await?);
        }
        if report.buckets > 0 {
            info!(
                agent_rollup_id = agent,
                buckets = report.buckets,
                written = report.written,
                "aggregate rollup complete"
            );
        }
        Ok(report)
    }

    /// Bucket boundaries at `step.interval` with input in `(last, safe]`.
    async fn pending_boundaries(
        &self,
        step: LevelStep<'_>,
        kind: RollupKind,
        window: TimeRange,
    ) -> Result<BTreeSet<i64>, Error> {
        let mut boundaries = BTreeSet::new();
        for source in step.sources {
            let times = match kind {
                RollupKind::Aggregate => {
                    self.store
                        .read_capture_times(source, step.source_level, window)
                        .await?
                }
                RollupKind::Gauge => self
                    .store
                    .read_gauges(source, step.source_level, window)
                    .await?
                    .into_iter()
                    .map(|value| value.capture_time)
                    .collect(),
            };
            boundaries.extend(times.into_iter().map(|time| bucket_boundary(time, step.interval)));
        }
        Ok(boundaries)
    }

    async fn roll_aggregate_level(
        &self,
        agent: &str,
        step: LevelStep<'_>,
        last: i64,
        horizon: i64,
    ) -> Result<RollupReport, Error> {
        let mut report = RollupReport::default();
        let safe = safe_rollup_time(horizon, step.interval);
        if safe <= last {
            return Ok(report);
        }
        let boundaries = self
            .pending_boundaries(step, RollupKind::Aggregate, TimeRange::new(last, safe))
            .await?;
        let source_capped = self.capped.level(step.source_level)?;
        let target_capped = self.capped.level(step.target_level)?;

        for boundary in boundaries {
            let window = bucket_window(boundary, step.interval);
            let mut rows: Vec<(&String, StoredRow)> = Vec::new();
            for source in step.sources {
                let found = self
                    .store
                    .read_aggregates(source, step.source_level, &ScopeFilter::Any, window)
                    .await?;
                rows.extend(found.into_iter().map(|row| (source, row)));
            }
            rows.sort_by(|(a_source, a), (b_source, b)| {
                (a.capture_time, &a.scope, a_source).cmp(&(b.capture_time, &b.scope, b_source))
            });

            let mut scopes: BTreeMap<_, (MutableAggregate, bool)> = BTreeMap::new();
            for (source, row) in &rows {
                let (aggregate, merged) = scopes.entry(row.scope.clone()).or_default();
                if blobs::merge_row(aggregate, source_capped, source, step.source_level, row)? {
                    *merged = true;
                } else {
                    report.skipped += 1;
                }
            }

            for (scope, (aggregate, merged)) in &scopes {
                if !merged {
                    continue;
                }
                let upsert = blobs::persist_aggregate(
                    self.store.as_ref(),
                    target_capped,
                    agent,
                    step.target_level,
                    scope,
                    boundary,
                    aggregate,
                    self.limits,
                )
                .await?;
                match upsert {
                    Upsert::Written => report.written += 1,
                    Upsert::Unchanged => report.unchanged += 1,
                }
            }
            report.buckets += 1;
        }

        self.store
            .write_last_rollup_time(agent, RollupKind::Aggregate, step.target_level, safe)
            .await?;
        debug!(
            agent_rollup_id = agent,
            rollup_level = step.target_level,
            safe_rollup_time = safe,
            buckets = report.buckets,
            "level rolled up"
        );
        Ok(report)
    }

    /// Roll up the gauges of `agent` through `horizon`. Same level rules as
    /// [`Scheduler::rollup_aggregates`], tracked on a separate chain.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn rollup_gauges(&self, agent: &str, children: &[String], horizon: i64) -> Result<RollupReport, Error> {
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().await;

        let last = self.store.read_last_rollup_times(agent, RollupKind::Gauge).await?;
        let me = [agent.to_string()];
        let mut report = RollupReport::default();
        for step in self.steps(&me, children) {
            let last = last.get(step.target_level).copied().unwrap_or(0);
            report.absorb(self.roll_gauge_level(agent, step, last, horizon).await?);
        }
        Ok(report)
    }

    async fn roll_gauge_level(
        &self,
        agent: &str,
        step: LevelStep<'_>,
        last: i64,
        horizon: i64,
    ) -> Result<RollupReport, Error> {
        let mut report = RollupReport::default();
        let safe = safe_rollup_time(horizon, step.interval);
        if safe <= last {
            return Ok(report);
        }
        let boundaries = self
            .pending_boundaries(step, RollupKind::Gauge, TimeRange::new(last, safe))
            .await?;

        for boundary in boundaries {
            let window = bucket_window(boundary, step.interval);
            let mut values: Vec<(&String, GaugeValue)> = Vec::new();
            for source in step.sources {
                let found = self.store.read_gauges(source, step.source_level, window).await?;
                values.extend(found.into_iter().map(|value| (source, value)));
            }
            values.sort_by(|(a_source, a), (b_source, b)| {
                (a.capture_time, &a.name, a_source).cmp(&(b.capture_time, &b.name, b_source))
            });

            let mut merged: BTreeMap<String, GaugeValue> = BTreeMap::new();
            for (_, value) in values {
                match merged.get_mut(&value.name) {
                    Some(existing) => existing.absorb(&value),
                    None => {
                        merged.insert(
                            value.name.clone(),
                            GaugeValue {
                                capture_time: boundary,
                                ..value
                            },
                        );
                    }
                }
            }
            for value in merged.into_values() {
                match self.store.upsert_gauge(agent, step.target_level, value).await? {
                    Upsert::Written => report.written += 1,
                    Upsert::Unchanged => report.unchanged += 1,
                }
            }
            report.buckets += 1;
        }

        self.store
            .write_last_rollup_time(agent, RollupKind::Gauge, step.target_level, safe)
            .await?;
        Ok(report)
    }
}
