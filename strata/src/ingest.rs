//! Level 0 ingestion of decoded agent batches.
//!
//! A batch is a stream of [`IngestEvent`]s in delivery order. Shared texts
//! are numbered by their position among the `SharedText` events, and
//! snapshots refer to them by that index.

use std::{collections::BTreeMap, sync::Arc};

use sha2::{Digest, Sha256};
use strata_aggregate::{
    MutableAggregate,
    proto::{AggregateSnapshot, Query},
};
use tracing::{debug, warn};

use crate::{
    blobs::{self, LevelStores, Limits},
    row::{GaugeValue, Scope},
    store::{RollupKind, RowStore, Upsert},
};

/// Errors produced while storing a batch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Writing a row or blob failed.
    #[error(transparent)]
    Persist(#[from] blobs::Error),
    /// Row store failure outside row persistence.
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

/// One element of a delivered batch.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    /// A text referenced by index from later snapshots.
    SharedText(String),
    /// Snapshot of every transaction of a type.
    OverallSnapshot {
        /// Transaction type.
        transaction_type: String,
        /// The measurements.
        snapshot: AggregateSnapshot,
    },
    /// Snapshot of one named transaction.
    PerNameSnapshot {
        /// Transaction type.
        transaction_type: String,
        /// Transaction name.
        transaction_name: String,
        /// The measurements.
        snapshot: AggregateSnapshot,
    },
}

/// Writes delivered batches as level 0 rows.
#[derive(Debug)]
pub struct Collector<S: ?Sized> {
    store: Arc<S>,
    capped: Arc<LevelStores>,
    limits: Limits,
    full_text_min_length: usize,
}

/// A query text after truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedText {
    /// The text kept inline.
    pub text: String,
    /// Hex SHA-256 of the full text, empty if nothing was cut.
    pub full_text_sha: String,
}

/// Cut `text` to `min_length` characters when it is longer, returning the
/// digest under which the full text is shared.
#[must_use]
pub fn truncate_text(text: &str, min_length: usize) -> TruncatedText {
    match text.char_indices().nth(min_length) {
        None => TruncatedText {
            text: text.to_string(),
            full_text_sha: String::new(),
        },
        Some((cut, _)) => TruncatedText {
            text: text[..cut].to_string(),
            full_text_sha: hex::encode(Sha256::digest(text.as_bytes())),
        },
    }
}

impl<S: RowStore + ?Sized> Collector<S> {
    /// Create a collector writing level 0 rows into `store`.
    #[must_use]
    pub fn new(store: Arc<S>, capped: Arc<LevelStores>, limits: Limits, full_text_min_length: usize) -> Self {
        Self {
            store,
            capped,
            limits,
            full_text_min_length,
        }
    }

    /// Store one batch captured at `capture_time`.
    ///
    /// Snapshots for the same scope within a batch are merged into one row.
    /// Queries referring to an unknown shared text are dropped.
    ///
    /// # Errors
    ///
    /// Returns storage failures. Rows already written stay written.
    pub async fn store(
        &self,
        agent: &str,
        capture_time: i64,
        events: impl IntoIterator<Item = IngestEvent>,
    ) -> Result<(), Error> {
        let mut shared_texts: Vec<String> = Vec::new();
        let mut scopes: BTreeMap<Scope, MutableAggregate> = BTreeMap::new();

        for event in events {
            let (scope, snapshot) = match event {
                IngestEvent::SharedText(text) => {
                    shared_texts.push(text);
                    continue;
                }
                IngestEvent::OverallSnapshot {
                    transaction_type,
                    snapshot,
                } => (Scope::overall(transaction_type), snapshot),
                IngestEvent::PerNameSnapshot {
                    transaction_type,
                    transaction_name,
                    snapshot,
                } => (Scope::per_name(transaction_type, transaction_name), snapshot),
            };
            let queries = self
                .resolve_queries(agent, capture_time, &snapshot, &shared_texts)
                .await?;
            let aggregate = scopes.entry(scope).or_default();
            aggregate.merge_snapshot(&snapshot);
            aggregate.merge_queries(&queries);
        }

        let capped = self.capped.level(0)?;
        for (scope, aggregate) in &scopes {
            let upsert = blobs::persist_aggregate(
                self.store.as_ref(),
                capped,
                agent,
                0,
                scope,
                capture_time,
                aggregate,
                self.limits,
            )
            .await?;
            if upsert == Upsert::Unchanged {
                debug!(agent_rollup_id = agent, capture_time, ?scope, "duplicate delivery");
            }
        }
        self.store
            .record_capture(agent, RollupKind::Aggregate, capture_time)
            .await?;
        Ok(())
    }

    async fn resolve_queries(
        &self,
        agent: &str,
        capture_time: i64,
        snapshot: &AggregateSnapshot,
        shared_texts: &[String],
    ) -> Result<Vec<Query>, Error> {
        let mut queries = Vec::with_capacity(snapshot.queries.len());
        for query in &snapshot.queries {
            let Some(text) = shared_texts.get(query.shared_query_text_index as usize) else {
                warn!(
                    agent_rollup_id = agent,
                    capture_time,
                    index = query.shared_query_text_index,
                    "query refers to unknown shared text"
                );
                continue;
            };
            let truncated = truncate_text(text, self.full_text_min_length);
            if !truncated.full_text_sha.is_empty() {
                self.store
                    .store_full_text(&truncated.full_text_sha, text, capture_time)
                    .await?;
            }
            queries.push(Query {
                query_type: query.query_type.clone(),
                truncated_text: truncated.text,
                full_text_sha: truncated.full_text_sha,
                total_duration_nanos: query.total_duration_nanos,
                execution_count: query.execution_count,
                total_rows: query.total_rows,
            });
        }
        Ok(queries)
    }

    /// Store raw gauge samples at level 0.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn store_gauges(&self, agent: &str, values: &[GaugeValue]) -> Result<(), Error> {
        let mut latest = None;
        for value in values {
            self.store.upsert_gauge(agent, 0, value.clone()).await?;
            latest = latest.max(Some(value.capture_time));
        }
        if let Some(capture_time) = latest {
            self.store
                .record_capture(agent, RollupKind::Gauge, capture_time)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_aggregate::proto::{AggregateSnapshot, SnapshotQuery};

    use super::{Collector, IngestEvent, truncate_text};
    use crate::{
        blobs::{LevelStores, Limits, RowBlobs},
        row::{CappedColumn, Scope, ScopeFilter, TimeRange},
        store::{MemoryStore, RowStore},
    };

    fn collector(dir: &std::path::Path) -> (Arc<MemoryStore>, Arc<LevelStores>, Collector<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let capped = Arc::new(LevelStores::open(dir, &[1 << 16]).expect("open"));
        let limits = Limits {
            max_query_aggregates: 10,
            max_service_call_aggregates: 10,
        };
        let collector = Collector::new(Arc::clone(&store), Arc::clone(&capped), limits, 8);
        (store, capped, collector)
    }

    fn snapshot(total: f64) -> AggregateSnapshot {
        AggregateSnapshot {
            total_duration_nanos: total,
            transaction_count: 1,
            ..AggregateSnapshot::default()
        }
    }

    #[test]
    fn short_texts_are_kept_whole() {
        let kept = truncate_text("select 1", 8);
        assert_eq!(kept.text, "select 1");
        assert!(kept.full_text_sha.is_empty());

        let cut = truncate_text("select * from orders", 8);
        assert_eq!(cut.text, "select *");
        assert_eq!(cut.full_text_sha.len(), 64);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let cut = truncate_text("ééééééééé", 3);
        assert_eq!(cut.text, "ééé");
    }

    #[tokio::test]
    async fn batch_writes_level_zero_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, capped, collector) = collector(dir.path());

        let long = "select * from orders where id = ?".to_string();
        let mut with_query = snapshot(10.0);
        with_query.queries.push(SnapshotQuery {
            query_type: "SQL".to_string(),
            shared_query_text_index: 0,
            total_duration_nanos: 4.0,
            execution_count: 2,
            total_rows: Some(7),
        });
        let mut dangling = snapshot(5.0);
        dangling.queries.push(SnapshotQuery {
            shared_query_text_index: 9,
            ..SnapshotQuery::default()
        });

        collector
            .store(
                "agent",
                60_000,
                [
                    IngestEvent::SharedText(long.clone()),
                    IngestEvent::OverallSnapshot {
                        transaction_type: "Web".to_string(),
                        snapshot: with_query,
                    },
                    IngestEvent::PerNameSnapshot {
                        transaction_type: "Web".to_string(),
                        transaction_name: "/home".to_string(),
                        snapshot: dangling,
                    },
                ],
            )
            .await
            .expect("store");

        let rows = store
            .read_aggregates("agent", 0, &ScopeFilter::Any, TimeRange::closed(60_000, 60_000))
            .await
            .expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].scope, Scope::overall("Web"));
        assert!(rows[0].capped_id(CappedColumn::Queries).is_some());
        assert!(rows[1].capped_id(CappedColumn::Queries).is_none());

        let blobs = RowBlobs::load(capped.level(0).expect("level"), &rows[0]).expect("blobs");
        assert_eq!(blobs.queries.len(), 1);
        let query = &blobs.queries[0];
        assert_eq!(query.truncated_text, "select *");
        assert_eq!(
            store
                .read_full_text(&query.full_text_sha, 60_000)
                .await
                .expect("text"),
            Some(long)
        );

        let agents = store.active_agents(0).await.expect("agents");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].aggregates, Some(60_000));
        assert_eq!(agents[0].gauges, None);
    }

    #[tokio::test]
    async fn same_scope_snapshots_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _capped, collector) = collector(dir.path());
        let events = [1.0, 2.0].map(|total| IngestEvent::OverallSnapshot {
            transaction_type: "Web".to_string(),
            snapshot: snapshot(total),
        });
        collector.store("agent", 60_000, events).await.expect("store");

        let row = store
            .read_aggregate("agent", 0, &Scope::overall("Web"), 60_000)
            .await
            .expect("read")
            .expect("row");
        let record = row.decode().expect("decode");
        assert_eq!(record.transaction_count, 2);
        assert_eq!(record.total_duration_nanos, 3.0);
    }
}
