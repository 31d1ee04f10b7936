//! Per-level capped stores and aggregate row persistence.
//!
//! Every rollup level owns its own capped store, so blob retention at a
//! coarse level is independent of the finer levels feeding it.

use std::path::{Path, PathBuf};

use metrics::counter;
use prost::Message;
use sha2::{Digest, Sha256};
use strata_aggregate::{
    MutableAggregate,
    proto::{AggregateRecord, ProfileNode, Query, ServiceCall},
};
use strata_capped::{Blob, CappedId, CappedStore};
use tracing::{debug, warn};

use crate::{
    row::{CappedColumn, Scope, StoredRow},
    store::{self, RowStore, Upsert},
};

/// Errors produced while persisting an aggregate row.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Row store failure.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// Capped store failure.
    #[error(transparent)]
    Capped(#[from] strata_capped::Error),
    /// No capped store exists for the level.
    #[error("no capped store for rollup level {0}")]
    UnknownLevel(usize),
}

/// One capped store per rollup level.
#[derive(Debug)]
pub struct LevelStores {
    stores: Vec<CappedStore>,
}

impl LevelStores {
    /// Wrap already opened stores, index = rollup level.
    #[must_use]
    pub fn new(stores: Vec<CappedStore>) -> Self {
        Self { stores }
    }

    /// Open `<dir>/rollup-<level>.capped` for every level in `sizes`.
    ///
    /// # Errors
    ///
    /// Returns the first store that fails to open. This is the one failure
    /// that stops startup.
    pub fn open(dir: &Path, sizes: &[u64]) -> Result<Self, strata_capped::Error> {
        let stores = sizes
            .iter()
            .enumerate()
            .map(|(level, size)| CappedStore::open(Self::path(dir, level), *size))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stores })
    }

    /// Path of the store file for `level`.
    #[must_use]
    pub fn path(dir: &Path, level: usize) -> PathBuf {
        dir.join(format!("rollup-{level}.capped"))
    }

    /// The store of `level`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLevel`] past the last level.
    pub fn level(&self, level: usize) -> Result<&CappedStore, Error> {
        self.stores.get(level).ok_or(Error::UnknownLevel(level))
    }

    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// True if there are no levels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Flush every store.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure.
    pub fn flush(&self) -> Result<(), strata_capped::Error> {
        self.stores.iter().try_for_each(CappedStore::flush)
    }
}

/// Truncation limits applied when a row's tables are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Queries kept per query type.
    pub max_query_aggregates: usize,
    /// Service calls kept per call type.
    pub max_service_call_aggregates: usize,
}

/// SHA-256 over the length-delimited encoding of `records`.
#[must_use]
pub fn content_digest<M: Message>(records: &[M]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.encode_length_delimited_to_vec());
    }
    hasher.finalize().to_vec()
}

/// Write `records` as a blob, reusing `existing`'s blob when its content
/// digest matches and it has not expired.
fn write_or_reuse<M: Message>(
    capped: &CappedStore,
    records: &[M],
    existing: Option<(CappedId, &[u8])>,
) -> Result<Option<(CappedId, Vec<u8>)>, strata_capped::Error> {
    if records.is_empty() {
        return Ok(None);
    }
    let digest = content_digest(records);
    if let Some((id, existing_digest)) = existing {
        if existing_digest == digest.as_slice() && id >= capped.smallest_non_expired_id()? {
            return Ok(Some((id, digest)));
        }
    }
    let id = capped.write_messages(records)?;
    Ok(Some((id, digest)))
}

/// Serialize `aggregate` into a row at `(agent, level, scope, capture_time)`.
///
/// Blobs are written to the level's capped store, reusing the blobs of the
/// row already present when their content is unchanged. A re-run over the
/// same input therefore produces a byte-identical row and the upsert is a
/// no-op.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn persist_aggregate<S: RowStore + ?Sized>(
    store: &S,
    capped: &CappedStore,
    agent: &str,
    level: usize,
    scope: &Scope,
    capture_time: i64,
    aggregate: &MutableAggregate,
    limits: Limits,
) -> Result<Upsert, Error> {
    let existing = match store.read_aggregate(agent, level, scope, capture_time).await? {
        None => None,
        Some(row) => match row.decode() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(agent_rollup_id = agent, rollup_level = level, capture_time, "replacing malformed row: {err}");
                None
            }
        },
    };
    let prior = |column: CappedColumn| {
        existing
            .as_ref()
            .and_then(|record| column.id(record).map(|id| (id, column.digest(record))))
    };

    let mut record = aggregate.to_record();
    let queries = aggregate.queries(limits.max_query_aggregates);
    let service_calls = aggregate.service_calls(limits.max_service_call_aggregates);
    let blobs = [
        (
            CappedColumn::Queries,
            write_or_reuse(capped, &queries, prior(CappedColumn::Queries))?,
        ),
        (
            CappedColumn::ServiceCalls,
            write_or_reuse(capped, &service_calls, prior(CappedColumn::ServiceCalls))?,
        ),
        (
            CappedColumn::MainThreadProfile,
            write_or_reuse(
                capped,
                aggregate.main_thread_profile(),
                prior(CappedColumn::MainThreadProfile),
            )?,
        ),
        (
            CappedColumn::AuxThreadProfile,
            write_or_reuse(
                capped,
                aggregate.aux_thread_profile(),
                prior(CappedColumn::AuxThreadProfile),
            )?,
        ),
    ];
    for (column, blob) in blobs {
        if let Some((id, digest)) = blob {
            column.set(&mut record, id, digest);
        }
    }

    let upsert = store
        .upsert_aggregate(agent, level, StoredRow::new(scope.clone(), capture_time, &record))
        .await?;
    match upsert {
        Upsert::Written => counter!("strata_rollup_rows_written_total").increment(1),
        Upsert::Unchanged => counter!("strata_rollup_rows_unchanged_total").increment(1),
    }
    Ok(upsert)
}

/// The blob tables a stored row references, read back from its level's
/// capped store. Expired blobs read as empty tables.
#[derive(Debug, Default)]
pub(crate) struct RowBlobs {
    pub(crate) queries: Vec<Query>,
    pub(crate) service_calls: Vec<ServiceCall>,
    pub(crate) main_thread_profile: Vec<ProfileNode>,
    pub(crate) aux_thread_profile: Vec<ProfileNode>,
}

fn read_column<M: Message + Default>(
    capped: &CappedStore,
    row: &StoredRow,
    column: CappedColumn,
) -> Result<Vec<M>, strata_capped::Error> {
    let Some(id) = row.capped_id(column) else {
        return Ok(Vec::new());
    };
    match capped.read::<M>(id)? {
        Blob::Live(records) => Ok(records),
        Blob::Expired => {
            debug!(capped_id = id.get(), capture_time = row.capture_time, ?column, "blob expired");
            Ok(Vec::new())
        }
    }
}

impl RowBlobs {
    /// Load every blob of `row`. Malformed content surfaces as an error for
    /// which [`strata_capped::Error::is_malformed`] holds.
    pub(crate) fn load(capped: &CappedStore, row: &StoredRow) -> Result<Self, strata_capped::Error> {
        Ok(Self {
            queries: read_column(capped, row, CappedColumn::Queries)?,
            service_calls: read_column(capped, row, CappedColumn::ServiceCalls)?,
            main_thread_profile: read_column(capped, row, CappedColumn::MainThreadProfile)?,
            aux_thread_profile: read_column(capped, row, CappedColumn::AuxThreadProfile)?,
        })
    }

    /// Merge into `aggregate`.
    pub(crate) fn merge_into(&self, aggregate: &mut MutableAggregate) {
        aggregate.merge_queries(&self.queries);
        aggregate.merge_service_calls(&self.service_calls);
        aggregate.merge_main_thread_profile(&self.main_thread_profile);
        aggregate.merge_aux_thread_profile(&self.aux_thread_profile);
    }
}

/// Decode `row` and merge it, blobs included, into `aggregate`.
///
/// Returns `Ok(false)` and merges nothing if the row or any of its blobs is
/// malformed. Only store unavailability is an error.
pub(crate) fn merge_row(
    aggregate: &mut MutableAggregate,
    capped: &CappedStore,
    agent: &str,
    level: usize,
    row: &StoredRow,
) -> Result<bool, strata_capped::Error> {
    let skip = |reason: &dyn std::fmt::Display| {
        warn!(
            agent_rollup_id = agent,
            rollup_level = level,
            capture_time = row.capture_time,
            "skipping malformed row: {reason}"
        );
        counter!("strata_rollup_malformed_row_total").increment(1);
        Ok(false)
    };

    let record: AggregateRecord = match row.decode() {
        Ok(record) => record,
        Err(err) => return skip(&err),
    };
    let blobs = match RowBlobs::load(capped, row) {
        Ok(blobs) => blobs,
        Err(err) if err.is_malformed() => return skip(&err),
        Err(err) => return Err(err),
    };
    if let Err(err) = aggregate.merge_record_inline(&record) {
        return skip(&err);
    }
    blobs.merge_into(aggregate);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use strata_aggregate::{MutableAggregate, proto::Query};
    use strata_capped::CappedStore;

    use super::{Limits, LevelStores, merge_row, persist_aggregate};
    use crate::{
        row::{CappedColumn, Scope, StoredRow},
        store::{MemoryStore, RowStore, Upsert},
    };

    const LIMITS: Limits = Limits {
        max_query_aggregates: 10,
        max_service_call_aggregates: 10,
    };

    fn aggregate_with_query(total: f64) -> MutableAggregate {
        let mut agg = MutableAggregate::new();
        agg.add_scalar_sums(total, 1, 0, false);
        agg.merge_queries(&[Query {
            query_type: "SQL".to_string(),
            truncated_text: "select 1".to_string(),
            total_duration_nanos: total,
            execution_count: 1,
            ..Query::default()
        }]);
        agg
    }

    #[tokio::test]
    async fn rewrite_reuses_blob_and_is_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let capped = CappedStore::open(dir.path().join("l.capped"), 4096).expect("open");
        let store = MemoryStore::new();
        let scope = Scope::overall("Web");
        let agg = aggregate_with_query(5.0);

        let first = persist_aggregate(&store, &capped, "a", 1, &scope, 300_000, &agg, LIMITS)
            .await
            .expect("persist");
        let cursor = capped.smallest_non_expired_id().expect("smallest");
        let second = persist_aggregate(&store, &capped, "a", 1, &scope, 300_000, &agg, LIMITS)
            .await
            .expect("persist");
        assert_eq!(first, Upsert::Written);
        assert_eq!(second, Upsert::Unchanged);
        assert_eq!(capped.smallest_non_expired_id().expect("smallest"), cursor);

        let row = store
            .read_aggregate("a", 1, &scope, 300_000)
            .await
            .expect("read")
            .expect("row");
        assert!(row.capped_id(CappedColumn::Queries).is_some());
        assert!(row.capped_id(CappedColumn::ServiceCalls).is_none());
    }

    #[tokio::test]
    async fn malformed_row_contributes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let capped = CappedStore::open(dir.path().join("l.capped"), 4096).expect("open");
        let bad = StoredRow::raw(Scope::overall("Web"), 60_000, Bytes::from_static(&[0xff, 0xff]));

        let mut agg = MutableAggregate::new();
        let merged = merge_row(&mut agg, &capped, "a", 0, &bad).expect("not a store failure");
        assert!(!merged);
        assert_eq!(agg.transaction_count(), 0);
    }

    #[test]
    fn level_paths_are_per_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stores = LevelStores::open(dir.path(), &[1024, 2048]).expect("open");
        assert_eq!(stores.len(), 2);
        assert!(LevelStores::path(dir.path(), 1).ends_with("rollup-1.capped"));
        assert_eq!(stores.level(1).expect("level").capacity().expect("capacity"), 2048);
        assert!(stores.level(2).is_err());
    }
}
