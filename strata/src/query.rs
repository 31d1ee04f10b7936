//! Read contracts over rollup output.
//!
//! Every read is bounded by a rollup level and a closed time range. Blobs
//! that aged out of their capped store read as expired, never as empty
//! data passed off as complete.

use std::{cmp::Ordering, sync::Arc};

use prost::Message;
use rustc_hash::FxHashMap;
use strata_aggregate::{
    DurationHistogram, QueryCollector, ServiceCallCollector,
    profile::merge_profile,
    proto::{AggregateRecord, ProfileNode, Query, ServiceCall, ThreadStats},
};
use strata_capped::{Blob, CappedId};
use tracing::warn;

use crate::{
    blobs::{self, LevelStores},
    row::{CappedColumn, Scope, ScopeFilter, StoredRow, TimeRange},
    store::{self, RowStore},
};

/// Errors produced by reads.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Row store failure.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// Capped store failure, malformed content included.
    #[error(transparent)]
    Capped(#[from] strata_capped::Error),
    /// The level has no capped store.
    #[error(transparent)]
    Level(#[from] blobs::Error),
}

/// Order of [`QueryService::transaction_summaries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySort {
    /// Largest total duration first.
    TotalTime,
    /// Largest average duration first.
    AverageTime,
    /// Most transactions first.
    Throughput,
}

/// Totals of one transaction name, or of a whole type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransactionSummary {
    /// Transaction name, `None` for an overall summary.
    pub transaction_name: Option<String>,
    /// Summed duration.
    pub total_duration_nanos: f64,
    /// Summed transaction count.
    pub transaction_count: i64,
    /// Summed error count.
    pub error_count: i64,
}

impl TransactionSummary {
    /// Mean duration, zero without transactions.
    #[must_use]
    pub fn average_nanos(&self) -> f64 {
        if self.transaction_count == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.transaction_count as f64;
        self.total_duration_nanos / count
    }

    fn add(&mut self, record: &AggregateRecord) {
        self.total_duration_nanos += record.total_duration_nanos;
        self.transaction_count += record.transaction_count;
        self.error_count += record.error_count;
    }
}

/// One bucket of the overview series.
#[derive(Debug, Clone, PartialEq)]
pub struct OverviewPoint {
    /// Bucket boundary.
    pub capture_time: i64,
    /// Duration in the bucket.
    pub total_duration_nanos: f64,
    /// Transactions in the bucket.
    pub transaction_count: i64,
    /// Errors in the bucket.
    pub error_count: i64,
    /// Main thread counters, absent if never recorded.
    pub main_thread_stats: Option<ThreadStats>,
    /// Auxiliary thread counters, absent if never recorded.
    pub aux_thread_stats: Option<ThreadStats>,
}

/// One bucket of the percentile series.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentilePoint {
    /// Bucket boundary.
    pub capture_time: i64,
    /// Transactions in the bucket.
    pub transaction_count: i64,
    /// One estimate per requested percentile, `None` without samples.
    pub values: Vec<Option<f64>>,
}

/// One bucket of the throughput series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputPoint {
    /// Bucket boundary.
    pub capture_time: i64,
    /// Transactions in the bucket.
    pub transaction_count: i64,
}

/// A table merged across rows. `expired` is set if any row's blob aged out,
/// in which case `items` covers only the rows still live.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Merged<T> {
    /// The merged content.
    pub items: Vec<T>,
    /// Whether some content had expired.
    pub expired: bool,
}

/// Serves reads for the query layer.
#[derive(Debug)]
pub struct QueryService<S: ?Sized> {
    store: Arc<S>,
    capped: Arc<LevelStores>,
}

impl<S: RowStore + ?Sized> QueryService<S> {
    /// Create a service over `store` and its blobs.
    #[must_use]
    pub fn new(store: Arc<S>, capped: Arc<LevelStores>) -> Self {
        Self { store, capped }
    }

    async fn records(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        range: TimeRange,
    ) -> Result<Vec<(StoredRow, AggregateRecord)>, Error> {
        let rows = self.store.read_aggregates(agent, level, filter, range).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.decode() {
                Ok(record) => Some((row, record)),
                Err(err) => {
                    warn!(agent_rollup_id = agent, rollup_level = level, capture_time = row.capture_time, "unreadable row: {err}");
                    None
                }
            })
            .collect())
    }

    /// Per-name totals of `transaction_type` over `[from, to]`, sorted by
    /// `sort` with ties broken by name, at most `limit` entries.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    #[allow(clippy::too_many_arguments)]
    pub async fn transaction_summaries(
        &self,
        agent: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
        sort: SummarySort,
        limit: usize,
    ) -> Result<Vec<TransactionSummary>, Error> {
        let filter = ScopeFilter::NamesOf(transaction_type.to_string());
        let mut by_name: FxHashMap<String, TransactionSummary> = FxHashMap::default();
        for (row, record) in self.records(agent, level, &filter, TimeRange::closed(from, to)).await? {
            let Some(name) = row.scope.transaction_name else {
                continue;
            };
            by_name
                .entry(name.clone())
                .or_insert_with(|| TransactionSummary {
                    transaction_name: Some(name),
                    ..TransactionSummary::default()
                })
                .add(&record);
        }

        let mut summaries: Vec<TransactionSummary> = by_name.into_values().collect();
        summaries.sort_by(|a, b| {
            let primary = match sort {
                SummarySort::TotalTime => b.total_duration_nanos.total_cmp(&a.total_duration_nanos),
                SummarySort::AverageTime => b.average_nanos().total_cmp(&a.average_nanos()),
                SummarySort::Throughput => b.transaction_count.cmp(&a.transaction_count),
            };
            match primary {
                Ordering::Equal => a.transaction_name.cmp(&b.transaction_name),
                other => other,
            }
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Totals of the overall rows of `transaction_type` over `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn overall_summary(
        &self,
        agent: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
    ) -> Result<TransactionSummary, Error> {
        let filter = ScopeFilter::Exact(Scope::overall(transaction_type));
        let mut summary = TransactionSummary::default();
        for (_, record) in self.records(agent, level, &filter, TimeRange::closed(from, to)).await? {
            summary.add(&record);
        }
        Ok(summary)
    }

    /// One point per row of `scope` in `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn overview_points(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        from: i64,
        to: i64,
    ) -> Result<Vec<OverviewPoint>, Error> {
        let filter = ScopeFilter::Exact(scope.clone());
        Ok(self
            .records(agent, level, &filter, TimeRange::closed(from, to))
            .await?
            .into_iter()
            .map(|(row, record)| OverviewPoint {
                capture_time: row.capture_time,
                total_duration_nanos: record.total_duration_nanos,
                transaction_count: record.transaction_count,
                error_count: record.error_count,
                main_thread_stats: record.main_thread_stats,
                aux_thread_stats: record.aux_thread_stats,
            })
            .collect())
    }

    /// Percentile estimates per row of `scope` in `[from, to]`.
    /// `percentiles` are in `[0, 100]`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn percentile_points(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        from: i64,
        to: i64,
        percentiles: &[f64],
    ) -> Result<Vec<PercentilePoint>, Error> {
        let filter = ScopeFilter::Exact(scope.clone());
        Ok(self
            .records(agent, level, &filter, TimeRange::closed(from, to))
            .await?
            .into_iter()
            .map(|(row, record)| {
                let histogram = record
                    .duration_histogram
                    .as_ref()
                    .map(DurationHistogram::from)
                    .unwrap_or_default();
                PercentilePoint {
                    capture_time: row.capture_time,
                    transaction_count: record.transaction_count,
                    values: percentiles
                        .iter()
                        .map(|percentile| histogram.quantile(percentile / 100.0))
                        .collect(),
                }
            })
            .collect())
    }

    /// Transactions per row of `scope` in `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn throughput_points(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        from: i64,
        to: i64,
    ) -> Result<Vec<ThroughputPoint>, Error> {
        let filter = ScopeFilter::Exact(scope.clone());
        Ok(self
            .records(agent, level, &filter, TimeRange::closed(from, to))
            .await?
            .into_iter()
            .map(|(row, record)| ThroughputPoint {
                capture_time: row.capture_time,
                transaction_count: record.transaction_count,
            })
            .collect())
    }

    /// True if some row matching `filter` in `[from, to]` references a live
    /// blob in `column`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn should_have(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        column: CappedColumn,
        from: i64,
        to: i64,
    ) -> Result<bool, Error> {
        let min_id = self.capped.level(level)?.smallest_non_expired_id()?;
        Ok(self
            .store
            .any_capped(agent, level, filter, TimeRange::closed(from, to), column, min_id)
            .await?)
    }

    /// See [`QueryService::should_have`].
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn should_have_queries(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        from: i64,
        to: i64,
    ) -> Result<bool, Error> {
        self.should_have(agent, level, filter, CappedColumn::Queries, from, to)
            .await
    }

    /// See [`QueryService::should_have`].
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn should_have_service_calls(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        from: i64,
        to: i64,
    ) -> Result<bool, Error> {
        self.should_have(agent, level, filter, CappedColumn::ServiceCalls, from, to)
            .await
    }

    /// See [`QueryService::should_have`].
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn should_have_main_thread_profile(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        from: i64,
        to: i64,
    ) -> Result<bool, Error> {
        self.should_have(agent, level, filter, CappedColumn::MainThreadProfile, from, to)
            .await
    }

    /// See [`QueryService::should_have`].
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn should_have_aux_thread_profile(
        &self,
        agent: &str,
        level: usize,
        filter: &ScopeFilter,
        from: i64,
        to: i64,
    ) -> Result<bool, Error> {
        self.should_have(agent, level, filter, CappedColumn::AuxThreadProfile, from, to)
            .await
    }

    /// Fetch one blob from `level`'s capped store.
    ///
    /// # Errors
    ///
    /// Returns storage failures and malformed content. Expiry is
    /// [`Blob::Expired`].
    pub fn fetch<M: Message + Default>(&self, level: usize, id: CappedId) -> Result<Blob<Vec<M>>, Error> {
        Ok(self.capped.level(level)?.read(id)?)
    }

    async fn fetch_column<M: Message + Default>(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        column: CappedColumn,
        from: i64,
        to: i64,
    ) -> Result<(Vec<Vec<M>>, bool), Error> {
        let filter = ScopeFilter::Exact(scope.clone());
        let rows = self
            .store
            .read_aggregates(agent, level, &filter, TimeRange::closed(from, to))
            .await?;
        let mut tables = Vec::new();
        let mut expired = false;
        for id in rows.iter().filter_map(|row| row.capped_id(column)) {
            match self.fetch::<M>(level, id)? {
                Blob::Live(records) => tables.push(records),
                Blob::Expired => expired = true,
            }
        }
        Ok((tables, expired))
    }

    /// Queries of `scope` over `[from, to]`, merged and truncated to
    /// `limit_per_type` per query type.
    ///
    /// # Errors
    ///
    /// Returns storage failures and malformed content.
    pub async fn merged_queries(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        from: i64,
        to: i64,
        limit_per_type: usize,
    ) -> Result<Merged<Query>, Error> {
        let (tables, expired) = self
            .fetch_column::<Query>(agent, level, scope, CappedColumn::Queries, from, to)
            .await?;
        let mut collector = QueryCollector::new();
        for table in &tables {
            collector.merge_all(table);
        }
        Ok(Merged {
            items: collector.to_queries(limit_per_type),
            expired,
        })
    }

    /// Service calls of `scope` over `[from, to]`, merged and truncated.
    ///
    /// # Errors
    ///
    /// Returns storage failures and malformed content.
    pub async fn merged_service_calls(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        from: i64,
        to: i64,
        limit_per_type: usize,
    ) -> Result<Merged<ServiceCall>, Error> {
        let (tables, expired) = self
            .fetch_column::<ServiceCall>(agent, level, scope, CappedColumn::ServiceCalls, from, to)
            .await?;
        let mut collector = ServiceCallCollector::new();
        for table in &tables {
            collector.merge_all(table);
        }
        Ok(Merged {
            items: collector.to_service_calls(limit_per_type),
            expired,
        })
    }

    /// Profile of `scope` over `[from, to]`. `column` selects the main or
    /// auxiliary thread profile.
    ///
    /// # Errors
    ///
    /// Returns storage failures and malformed content.
    pub async fn merged_profile(
        &self,
        agent: &str,
        level: usize,
        scope: &Scope,
        column: CappedColumn,
        from: i64,
        to: i64,
    ) -> Result<Merged<ProfileNode>, Error> {
        let (tables, expired) = self
            .fetch_column::<ProfileNode>(agent, level, scope, column, from, to)
            .await?;
        let mut roots = Vec::new();
        for table in &tables {
            merge_profile(&mut roots, table);
        }
        Ok(Merged { items: roots, expired })
    }

    /// The full text behind a truncated query, refreshing its last use.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn full_query_text(&self, full_text_sha: &str, now: i64) -> Result<Option<String>, Error> {
        Ok(self.store.read_full_text(full_text_sha, now).await?)
    }
}
