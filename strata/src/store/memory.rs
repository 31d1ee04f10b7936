//! In-process [`RowStore`].
//!
//! Rows are kept encoded, exactly as a persistent backend would hold them,
//! so upserts can detect byte-identical rewrites.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use strata_capped::CappedId;

use super::{Error, RollupKind, RowStore, Upsert};
use crate::row::{AgentCapture, CappedColumn, GaugeValue, Scope, ScopeFilter, StoredRow, TimeRange};

type RowsByTime = BTreeMap<i64, BTreeMap<Scope, StoredRow>>;
type GaugesByTime = BTreeMap<i64, BTreeMap<String, GaugeValue>>;

#[derive(Debug)]
struct SharedText {
    text: String,
    last_used: i64,
}

#[derive(Debug, Default)]
struct Tables {
    aggregates: FxHashMap<(String, usize), RowsByTime>,
    gauges: FxHashMap<(String, usize), GaugesByTime>,
    rollup_times: FxHashMap<(String, RollupKind), Vec<i64>>,
    agents: FxHashMap<String, AgentCapture>,
    texts: FxHashMap<String, SharedText>,
}

fn bounds(range: TimeRange) -> (Bound<i64>, Bound<i64>) {
    (Bound::Excluded(range.after), Bound::Included(range.through))
}

/// A [`RowStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    hooks: test_hooks::Hooks,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, Error> {
        self.tables.read().map_err(|_| Error::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, Error> {
        self.tables.write().map_err(|_| Error::Poisoned)
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn upsert_aggregate(&self, agent: &str, level: usize, row: StoredRow) -> Result<Upsert, Error> {
        #[cfg(test)]
        self.hooks.note_upsert(agent, level);

        let mut tables = self.write()?;
        let slot = tables
            .aggregates
            .entry((agent.to_string(), level))
            .or_default()
            .entry(row.capture_time)
            .or_default();
        match slot.get(&row.scope) {
            Some(existing) if existing.encoded() == row.encoded() => Ok(Upsert::Unchanged),
            _ => {
                slot.insert(row.scope.clone(), row);
                Ok(Upsert::Written)
            }
        }
    }

    async fn read_aggregate(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        capture_time: i64,
    ) -> Result<Option<StoredRow>, Error> {
        let tables = self.read()?;
        Ok(tables
            .aggregates
            .get(&(agent.to_string(), level))
            .and_then(|rows| rows.get(&capture_time))
            .and_then(|scopes| scopes.get(scope))
            .cloned())
    }

    async fn read_aggregates(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
    ) -> Result<Vec<StoredRow>, Error> {
        #[cfg(test)]
        {
            self.hooks.delay(agent).await;
            self.hooks.check(agent, RollupKind::Aggregate)?;
        }

        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        let Some(rows) = tables.aggregates.get(&(agent.to_string(), level)) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(bounds(range))
            .flat_map(|(_, scopes)| scopes.values())
            .filter(|row| filter.matches(&row.scope))
            .cloned()
            .collect())
    }

    async fn read_capture_times(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<i64>, Error> {
        #[cfg(test)]
        self.hooks.check(agent, RollupKind::Aggregate)?;

        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        Ok(tables
            .aggregates
            .get(&(agent.to_string(), level))
            .map(|rows| {
                rows.range(bounds(range))
                    .filter(|(_, scopes)| !scopes.is_empty())
                    .map(|(time, _)| *time)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn any_capped(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
        column: CappedColumn,
        min_id: CappedId,
    ) -> Result<bool, Error> {
        if range.is_empty() {
            return Ok(false);
        }
        let tables = self.read()?;
        let Some(rows) = tables.aggregates.get(&(agent.to_string(), level)) else {
            return Ok(false);
        };
        Ok(rows
            .range(bounds(range))
            .flat_map(|(_, scopes)| scopes.values())
            .any(|row| filter.matches(&row.scope) && row.capped_id(column).is_some_and(|id| id >= min_id)))
    }

    async fn read_last_rollup_times(&self, agent: &str, kind: RollupKind) -> Result<Vec<i64>, Error> {
        let tables = self.read()?;
        Ok(tables
            .rollup_times
            .get(&(agent.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_last_rollup_time(
        &self,
        agent: &str,
        kind: RollupKind,
        level: usize,
        rollup_time: i64,
    ) -> Result<(), Error> {
        let mut tables = self.write()?;
        let times = tables.rollup_times.entry((agent.to_string(), kind)).or_default();
        if times.len() <= level {
            times.resize(level + 1, 0);
        }
        times[level] = times[level].max(rollup_time);
        Ok(())
    }

    async fn record_capture(&self, agent: &str, kind: RollupKind, capture_time: i64) -> Result<(), Error> {
        let mut tables = self.write()?;
        tables
            .agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentCapture::new(agent))
            .advance(kind, capture_time);
        Ok(())
    }

    async fn active_agents(&self, since: i64) -> Result<Vec<AgentCapture>, Error> {
        let tables = self.read()?;
        let mut agents: Vec<AgentCapture> = tables
            .agents
            .values()
            .filter(|agent| agent.newest().is_some_and(|time| time > since))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn upsert_gauge(&self, agent: &str, level: usize, value: GaugeValue) -> Result<Upsert, Error> {
        let mut tables = self.write()?;
        let slot = tables
            .gauges
            .entry((agent.to_string(), level))
            .or_default()
            .entry(value.capture_time)
            .or_default();
        if slot.get(&value.name) == Some(&value) {
            return Ok(Upsert::Unchanged);
        }
        slot.insert(value.name.clone(), value);
        Ok(Upsert::Written)
    }

    async fn read_gauges(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<GaugeValue>, Error> {
        #[cfg(test)]
        self.hooks.check(agent, RollupKind::Gauge)?;

        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        Ok(tables
            .gauges
            .get(&(agent.to_string(), level))
            .map(|gauges| {
                gauges
                    .range(bounds(range))
                    .flat_map(|(_, names)| names.values())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn store_full_text(&self, sha: &str, text: &str, now: i64) -> Result<(), Error> {
        let mut tables = self.write()?;
        tables
            .texts
            .entry(sha.to_string())
            .and_modify(|shared| shared.last_used = shared.last_used.max(now))
            .or_insert_with(|| SharedText {
                text: text.to_string(),
                last_used: now,
            });
        Ok(())
    }

    async fn read_full_text(&self, sha: &str, now: i64) -> Result<Option<String>, Error> {
        let mut tables = self.write()?;
        Ok(tables.texts.get_mut(sha).map(|shared| {
            shared.last_used = shared.last_used.max(now);
            shared.text.clone()
        }))
    }

    async fn expire_full_texts(&self, cutoff: i64) -> Result<usize, Error> {
        let mut tables = self.write()?;
        let before = tables.texts.len();
        tables.texts.retain(|_, shared| shared.last_used >= cutoff);
        Ok(before - tables.texts.len())
    }
}

#[cfg(test)]
pub(crate) mod test_hooks {
    use std::{sync::Mutex, time::Duration};

    use rustc_hash::{FxHashMap, FxHashSet};

    use super::MemoryStore;
    use crate::store::{Error, RollupKind};

    #[derive(Debug, Default)]
    pub(crate) struct Hooks {
        delays: Mutex<FxHashMap<String, Duration>>,
        failures: Mutex<FxHashSet<(String, RollupKind)>>,
        upserts: Mutex<Vec<(String, usize)>>,
    }

    impl Hooks {
        pub(super) fn check(&self, agent: &str, kind: RollupKind) -> Result<(), Error> {
            let failing = self
                .failures
                .lock()
                .expect("failures lock")
                .contains(&(agent.to_string(), kind));
            if failing {
                return Err(Error::Unavailable(format!("{agent} {kind:?} reads disabled")));
            }
            Ok(())
        }

        pub(super) async fn delay(&self, agent: &str) {
            let delay = self
                .delays
                .lock()
                .expect("delays lock")
                .get(agent)
                .copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        pub(super) fn note_upsert(&self, agent: &str, level: usize) {
            self.upserts
                .lock()
                .expect("upserts lock")
                .push((agent.to_string(), level));
        }
    }

    impl MemoryStore {
        /// Slow down every aggregate range read of `agent`.
        pub(crate) fn delay_reads(&self, agent: &str, delay: Duration) {
            self.hooks
                .delays
                .lock()
                .expect("delays lock")
                .insert(agent.to_string(), delay);
        }

        /// Fail every `kind` read of `agent` from now on.
        pub(crate) fn fail_reads(&self, agent: &str, kind: RollupKind) {
            self.hooks
                .failures
                .lock()
                .expect("failures lock")
                .insert((agent.to_string(), kind));
        }

        /// Every aggregate upsert so far, in order.
        pub(crate) fn upsert_log(&self) -> Vec<(String, usize)> {
            self.hooks.upserts.lock().expect("upserts lock").clone()
        }
    }
}
