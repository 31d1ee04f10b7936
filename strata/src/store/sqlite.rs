//! `SQLite` backed [`RowStore`].
//!
//! Every rollup level has an aggregate table and a gauge table, keyed by
//! agent, scope (or gauge name) and capture time. The capped ids of a row are
//! stored in their own columns beside the encoded record so existence checks
//! filter on `id >= smallest live id` in SQL without decoding anything.
//! Rollup progress, the agent capture index and the shared full texts live in
//! three further tables.
//!
//! `rusqlite` is blocking. Calls run on the blocking pool behind a single
//! connection.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter, types::Value};
use strata_capped::CappedId;
use tracing::info;

use super::{Error, RollupKind, RowStore, Upsert};
use crate::row::{AgentCapture, CappedColumn, GaugeValue, Scope, ScopeFilter, StoredRow, TimeRange};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS rollup_times (
    agent TEXT NOT NULL,
    kind TEXT NOT NULL,
    level INTEGER NOT NULL,
    rollup_time INTEGER NOT NULL,
    PRIMARY KEY (agent, kind, level)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS agent_captures (
    agent TEXT NOT NULL,
    kind TEXT NOT NULL,
    capture_time INTEGER NOT NULL,
    PRIMARY KEY (agent, kind)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS agent_captures_time ON agent_captures (capture_time);

CREATE TABLE IF NOT EXISTS full_texts (
    sha TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    last_used INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS full_texts_last_used ON full_texts (last_used);
";

const ROW_COLUMNS: &str = "transaction_type, per_name, transaction_name, capture_time, record, \
     queries_capped_id, service_calls_capped_id, main_thread_profile_capped_id, aux_thread_profile_capped_id";

fn level_schema(level: usize) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS aggregate_rollup_{level} (
    agent TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    per_name INTEGER NOT NULL,
    transaction_name TEXT NOT NULL,
    capture_time INTEGER NOT NULL,
    record BLOB NOT NULL,
    queries_capped_id INTEGER,
    service_calls_capped_id INTEGER,
    main_thread_profile_capped_id INTEGER,
    aux_thread_profile_capped_id INTEGER,
    PRIMARY KEY (agent, transaction_type, per_name, transaction_name, capture_time)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS aggregate_rollup_{level}_time ON aggregate_rollup_{level} (agent, capture_time);

CREATE TABLE IF NOT EXISTS gauge_rollup_{level} (
    agent TEXT NOT NULL,
    name TEXT NOT NULL,
    capture_time INTEGER NOT NULL,
    value REAL NOT NULL,
    weight INTEGER NOT NULL,
    PRIMARY KEY (agent, name, capture_time)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS gauge_rollup_{level}_time ON gauge_rollup_{level} (agent, capture_time);
"
    )
}

fn column_name(column: CappedColumn) -> &'static str {
    match column {
        CappedColumn::Queries => "queries_capped_id",
        CappedColumn::ServiceCalls => "service_calls_capped_id",
        CappedColumn::MainThreadProfile => "main_thread_profile_capped_id",
        CappedColumn::AuxThreadProfile => "aux_thread_profile_capped_id",
    }
}

fn kind_name(kind: RollupKind) -> &'static str {
    match kind {
        RollupKind::Aggregate => "aggregate",
        RollupKind::Gauge => "gauge",
    }
}

fn sql_id(id: CappedId) -> Result<i64, Error> {
    i64::try_from(id.get()).map_err(|_| Error::IdRange(id.get()))
}

/// `(transaction_type, per_name, transaction_name)`. Overall rows store an
/// empty name and `per_name = 0`.
fn scope_key(scope: &Scope) -> (&str, i64, &str) {
    match &scope.transaction_name {
        Some(name) => (&scope.transaction_type, 1, name),
        None => (&scope.transaction_type, 0, ""),
    }
}

fn push_filter(sql: &mut String, values: &mut Vec<Value>, filter: &ScopeFilter) {
    match filter {
        ScopeFilter::Any => {}
        ScopeFilter::Exact(scope) => {
            let (transaction_type, per_name, transaction_name) = scope_key(scope);
            sql.push_str(" AND transaction_type = ? AND per_name = ? AND transaction_name = ?");
            values.push(Value::Text(transaction_type.to_string()));
            values.push(Value::Integer(per_name));
            values.push(Value::Text(transaction_name.to_string()));
        }
        ScopeFilter::NamesOf(transaction_type) => {
            sql.push_str(" AND transaction_type = ? AND per_name = 1");
            values.push(Value::Text(transaction_type.clone()));
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let transaction_type: String = row.get(0)?;
    let per_name: bool = row.get(1)?;
    let transaction_name: String = row.get(2)?;
    let scope = if per_name {
        Scope::per_name(transaction_type, transaction_name)
    } else {
        Scope::overall(transaction_type)
    };
    let capture_time: i64 = row.get(3)?;
    let record: Vec<u8> = row.get(4)?;
    let mut ids = Vec::with_capacity(CappedColumn::ALL.len());
    for (offset, column) in CappedColumn::ALL.into_iter().enumerate() {
        let raw: Option<i64> = row.get(5 + offset)?;
        ids.push((column, raw.and_then(|raw| u64::try_from(raw).ok()).map(CappedId::new)));
    }
    Ok(StoredRow::from_parts(scope, capture_time, Bytes::from(record), ids))
}

fn read_gauge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GaugeValue> {
    Ok(GaugeValue {
        name: row.get(0)?,
        capture_time: row.get(1)?,
        value: row.get(2)?,
        weight: row.get(3)?,
    })
}

/// A [`RowStore`] in a `SQLite` database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    levels: usize,
}

impl SqliteStore {
    /// Open or create the database at `path` with tables for `levels`
    /// rollup levels. Existing rows and rollup progress are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sqlite`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: impl Into<PathBuf>, levels: usize) -> Result<Self, Error> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        for level in 0..levels {
            conn.execute_batch(&level_schema(level))?;
        }
        info!(path = %path.display(), levels, "row store open");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            levels,
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn aggregate_table(&self, level: usize) -> Result<String, Error> {
        if level < self.levels {
            Ok(format!("aggregate_rollup_{level}"))
        } else {
            Err(Error::UnknownLevel(level))
        }
    }

    fn gauge_table(&self, level: usize) -> Result<String, Error> {
        if level < self.levels {
            Ok(format!("gauge_rollup_{level}"))
        } else {
            Err(Error::UnknownLevel(level))
        }
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| Error::Poisoned)?;
            work(&mut conn)
        })
        .await
        .map_err(|err| Error::Unavailable(err.to_string()))?
    }

    /// `SELECT ... FROM <table> WHERE agent = ? AND capture_time in range`,
    /// ready for further predicates.
    fn range_query(select: &str, table: &str, agent: &str, range: TimeRange) -> (String, Vec<Value>) {
        let sql = format!("SELECT {select} FROM {table} WHERE agent = ? AND capture_time > ? AND capture_time <= ?");
        let values = vec![
            Value::Text(agent.to_string()),
            Value::Integer(range.after),
            Value::Integer(range.through),
        ];
        (sql, values)
    }
}

#[async_trait]
impl RowStore for SqliteStore {
    async fn upsert_aggregate(&self, agent: &str, level: usize, row: StoredRow) -> Result<Upsert, Error> {
        let table = self.aggregate_table(level)?;
        let mut ids = [None; 4];
        for (slot, column) in ids.iter_mut().zip(CappedColumn::ALL) {
            *slot = row.capped_id(column).map(sql_id).transpose()?;
        }
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (transaction_type, per_name, transaction_name) = scope_key(&row.scope);
            let existing: Option<Vec<u8>> = tx
                .query_row(
                    &format!(
                        "SELECT record FROM {table} WHERE agent = ?1 AND transaction_type = ?2 \
                         AND per_name = ?3 AND transaction_name = ?4 AND capture_time = ?5"
                    ),
                    params![agent, transaction_type, per_name, transaction_name, row.capture_time],
                    |found| found.get(0),
                )
                .optional()?;
            if existing.as_deref() == Some(&row.encoded()[..]) {
                return Ok(Upsert::Unchanged);
            }
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table} (agent, {ROW_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    agent,
                    transaction_type,
                    per_name,
                    transaction_name,
                    row.capture_time,
                    &row.encoded()[..],
                    ids[0],
                    ids[1],
                    ids[2],
                    ids[3],
                ],
            )?;
            tx.commit()?;
            Ok(Upsert::Written)
        })
        .await
    }

    async fn read_aggregate(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        capture_time: i64,
    ) -> Result<Option<StoredRow>, Error> {
        let table = self.aggregate_table(level)?;
        let agent = agent.to_string();
        let scope = scope.clone();
        self.with_conn(move |conn| {
            let (transaction_type, per_name, transaction_name) = scope_key(&scope);
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {ROW_COLUMNS} FROM {table} WHERE agent = ?1 AND transaction_type = ?2 \
                         AND per_name = ?3 AND transaction_name = ?4 AND capture_time = ?5"
                    ),
                    params![agent, transaction_type, per_name, transaction_name, capture_time],
                    read_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn read_aggregates(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
    ) -> Result<Vec<StoredRow>, Error> {
        let table = self.aggregate_table(level)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let (mut sql, mut values) = Self::range_query(ROW_COLUMNS, &table, agent, range);
        push_filter(&mut sql, &mut values, filter);
        sql.push_str(" ORDER BY capture_time, transaction_type, per_name, transaction_name");
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(&sql)?;
            let rows = statement
                .query_map(params_from_iter(values), read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn read_capture_times(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<i64>, Error> {
        let table = self.aggregate_table(level)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let (mut sql, values) = Self::range_query("DISTINCT capture_time", &table, agent, range);
        sql.push_str(" ORDER BY capture_time");
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(&sql)?;
            let times = statement
                .query_map(params_from_iter(values), |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(times)
        })
        .await
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
        let table = self.aggregate_table(level)?;
        if range.is_empty() {
            return Ok(false);
        }
        let (mut sql, mut values) = Self::range_query("1", &table, agent, range);
        sql.push_str(&format!(" AND {} >= ?", column_name(column)));
        values.push(Value::Integer(sql_id(min_id)?));
        push_filter(&mut sql, &mut values, filter);
        let sql = format!("SELECT EXISTS ({sql})");
        self.with_conn(move |conn| {
            let found: bool = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
            Ok(found)
        })
        .await
    }

    async fn read_last_rollup_times(&self, agent: &str, kind: RollupKind) -> Result<Vec<i64>, Error> {
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(
                "SELECT level, rollup_time FROM rollup_times WHERE agent = ?1 AND kind = ?2 ORDER BY level",
            )?;
            let stored = statement
                .query_map(params![agent, kind_name(kind)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut times = Vec::new();
            for (level, rollup_time) in stored {
                let Ok(level) = usize::try_from(level) else {
                    continue;
                };
                if times.len() <= level {
                    times.resize(level + 1, 0);
                }
                times[level] = rollup_time;
            }
            Ok(times)
        })
        .await
    }

    async fn write_last_rollup_time(
        &self,
        agent: &str,
        kind: RollupKind,
        level: usize,
        rollup_time: i64,
    ) -> Result<(), Error> {
        let stored_level = i64::try_from(level).map_err(|_| Error::UnknownLevel(level))?;
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rollup_times (agent, kind, level, rollup_time) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (agent, kind, level) DO UPDATE SET rollup_time = MAX(rollup_time, excluded.rollup_time)",
                params![agent, kind_name(kind), stored_level, rollup_time],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_capture(&self, agent: &str, kind: RollupKind, capture_time: i64) -> Result<(), Error> {
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_captures (agent, kind, capture_time) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (agent, kind) DO UPDATE SET capture_time = MAX(capture_time, excluded.capture_time)",
                params![agent, kind_name(kind), capture_time],
            )?;
            Ok(())
        })
        .await
    }

    async fn active_agents(&self, since: i64) -> Result<Vec<AgentCapture>, Error> {
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(
                "SELECT agent, kind, capture_time FROM agent_captures \
                 WHERE agent IN (SELECT agent FROM agent_captures WHERE capture_time > ?1) \
                 ORDER BY agent",
            )?;
            let stored = statement
                .query_map(params![since], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut agents: Vec<AgentCapture> = Vec::new();
            for (agent, kind, capture_time) in stored {
                let kind = match kind.as_str() {
                    "aggregate" => RollupKind::Aggregate,
                    "gauge" => RollupKind::Gauge,
                    _ => continue,
                };
                match agents.last_mut() {
                    Some(last) if last.agent_id == agent => last.advance(kind, capture_time),
                    _ => {
                        let mut capture = AgentCapture::new(agent);
                        capture.advance(kind, capture_time);
                        agents.push(capture);
                    }
                }
            }
            Ok(agents)
        })
        .await
    }

    async fn upsert_gauge(&self, agent: &str, level: usize, value: GaugeValue) -> Result<Upsert, Error> {
        let table = self.gauge_table(level)?;
        let agent = agent.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<(f64, i64)> = tx
                .query_row(
                    &format!("SELECT value, weight FROM {table} WHERE agent = ?1 AND name = ?2 AND capture_time = ?3"),
                    params![agent, value.name, value.capture_time],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let unchanged = existing.is_some_and(|(stored, weight)| {
                stored.to_bits() == value.value.to_bits() && weight == value.weight
            });
            if unchanged {
                return Ok(Upsert::Unchanged);
            }
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table} (agent, name, capture_time, value, weight) \
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![agent, value.name, value.capture_time, value.value, value.weight],
            )?;
            tx.commit()?;
            Ok(Upsert::Written)
        })
        .await
    }

    async fn read_gauges(&self, agent: &str, level: usize, range: TimeRange) -> Result<Vec<GaugeValue>, Error> {
        let table = self.gauge_table(level)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let (mut sql, values) = Self::range_query("name, capture_time, value, weight", &table, agent, range);
        sql.push_str(" ORDER BY capture_time, name");
        self.with_conn(move |conn| {
            let mut statement = conn.prepare(&sql)?;
            let gauges = statement
                .query_map(params_from_iter(values), read_gauge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(gauges)
        })
        .await
    }

    async fn store_full_text(&self, sha: &str, text: &str, now: i64) -> Result<(), Error> {
        let sha = sha.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO full_texts (sha, text, last_used) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (sha) DO UPDATE SET last_used = MAX(last_used, excluded.last_used)",
                params![sha, text, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn read_full_text(&self, sha: &str, now: i64) -> Result<Option<String>, Error> {
        let sha = sha.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE full_texts SET last_used = MAX(last_used, ?2) WHERE sha = ?1",
                params![sha, now],
            )?;
            let text: Option<String> = tx
                .query_row("SELECT text FROM full_texts WHERE sha = ?1", params![sha], |row| {
                    row.get(0)
                })
                .optional()?;
            tx.commit()?;
            Ok(text)
        })
        .await
    }

    async fn expire_full_texts(&self, cutoff: i64) -> Result<usize, Error> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM full_texts WHERE last_used < ?1", params![cutoff])?;
            Ok(removed)
        })
        .await
    }
}
