//! The rollup row store.
//!
//! Rows are keyed by agent rollup id, rollup level, capture time and scope.
//! Every write is a whole-row upsert, so a rollup pass interrupted at any
//! point leaves only complete rows behind. The store also holds the per-agent
//! rollup progress, the agent capture index, gauge values and the shared
//! full-text table.

use async_trait::async_trait;
use strata_capped::CappedId;

use crate::row::{AgentCapture, CappedColumn, GaugeValue, Scope, ScopeFilter, StoredRow, TimeRange};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors produced by [`RowStore`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend could not serve the request.
    #[error("row store unavailable: {0}")]
    Unavailable(String),
    /// An internal lock was poisoned by a panicking writer.
    #[error("row store lock poisoned")]
    Poisoned,
    /// `SQLite` failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The store holds no tables for this rollup level.
    #[error("no tables for rollup level {0}")]
    UnknownLevel(usize),
    /// A capped id does not fit the storage column.
    #[error("capped id {0} out of range")]
    IdRange(u64),
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The row was inserted or replaced.
    Written,
    /// An identical row was already present; nothing changed.
    Unchanged,
}

/// The two independent rollup chains of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupKind {
    /// Duration aggregates.
    Aggregate,
    /// Gauge values.
    Gauge,
}

/// Persistence for everything the rollup engine reads and writes.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert or replace the row at `(agent, level, row.scope, row.capture_time)`.
    async fn upsert_aggregate(&self, agent: &str, level: usize, row: StoredRow) -> Result<Upsert, Error>;

    /// Read one row.
    async fn read_aggregate(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        capture_time: i64,
    ) -> Result<Option<StoredRow>, Error>;

    /// Read the rows in `range` matching `filter`, ordered by capture time
    /// then scope.
    async fn read_aggregates(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
    ) -> Result<Vec<StoredRow>, Error>;

    /// Distinct capture times with at least one row in `range`, ascending.
    async fn read_capture_times(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<i64>, Error>;

    /// True if any row in `range` matching `filter` holds an id of at least
    /// `min_id` in `column`. Rows whose id is below `min_id` are skipped
    /// without being decoded.
    async fn any_capped(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
        column: CappedColumn,
        min_id: CappedId,
    ) -> Result<bool, Error>;

    /// Last rollup time per level for one chain. Levels never rolled up
    /// read as zero; the result may be shorter than the level count.
    async fn read_last_rollup_times(&self, agent: &str, kind: RollupKind) -> Result<Vec<i64>, Error>;

    /// Advance the last rollup time of one level. Never moves it backwards.
    async fn write_last_rollup_time(
        &self,
        agent: &str,
        kind: RollupKind,
        level: usize,
        rollup_time: i64,
    ) -> Result<(), Error>;

    /// Note that `agent` delivered `kind` data captured at `capture_time`.
    /// Each chain keeps its own latest capture time.
    async fn record_capture(&self, agent: &str, kind: RollupKind, capture_time: i64) -> Result<(), Error>;

    /// Agents that delivered data of either kind captured after `since`,
    /// with the latest capture time of each chain, ordered by id.
    async fn active_agents(&self, since: i64) -> Result<Vec<AgentCapture>, Error>;

    /// Insert or replace the gauge at `(agent, level, value.name, value.capture_time)`.
    async fn upsert_gauge(&self, agent: &str, level: usize, value: GaugeValue) -> Result<Upsert, Error>;

    /// Gauge values in `range`, ordered by capture time then name.
    async fn read_gauges(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<GaugeValue>, Error>;

    /// Store a full text under its digest, refreshing its last-used time.
    async fn store_full_text(&self, sha: &str, text: &str, now: i64) -> Result<(), Error>;

    /// Look up a full text, refreshing its last-used time.
    async fn read_full_text(&self, sha: &str, now: i64) -> Result<Option<String>, Error>;

    /// Remove texts not used since `cutoff`, returning how many were removed.
    async fn expire_full_texts(&self, cutoff: i64) -> Result<usize, Error>;
}
