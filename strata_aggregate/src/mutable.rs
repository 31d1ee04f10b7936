//! The single-owner accumulator behind every rollup.

use crate::{
    collector::{QueryCollector, ServiceCallCollector},
    histogram::DurationHistogram,
    profile::merge_profile,
    proto::{
        AggregateRecord, AggregateSnapshot, Histogram, ProfileNode, Query, ServiceCall,
        ThreadStats, Timer,
    },
    thread_stats, timer,
};

/// Combines any number of aggregate rows or snapshots into one.
///
/// Not shared between threads. A rollup creates one per scope and bucket,
/// feeds it every contributing row, then serializes it.
#[derive(Debug, Clone, Default)]
pub struct MutableAggregate {
    total_duration_nanos: f64,
    transaction_count: i64,
    error_count: i64,
    async_transactions: bool,
    main_thread_root_timers: Vec<Timer>,
    aux_thread_root_timers: Vec<Timer>,
    async_timers: Vec<Timer>,
    main_thread_stats: Option<ThreadStats>,
    aux_thread_stats: Option<ThreadStats>,
    duration_histogram: DurationHistogram,
    queries: QueryCollector,
    service_calls: ServiceCallCollector,
    main_thread_profile: Vec<ProfileNode>,
    aux_thread_profile: Vec<ProfileNode>,
}

impl MutableAggregate {
    /// An empty aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add duration, counts and the async flag.
    pub fn add_scalar_sums(
        &mut self,
        total_duration_nanos: f64,
        transaction_count: i64,
        error_count: i64,
        async_transactions: bool,
    ) {
        self.total_duration_nanos += total_duration_nanos;
        self.transaction_count += transaction_count;
        self.error_count += error_count;
        self.async_transactions |= async_transactions;
    }

    /// Merge main and auxiliary thread counters.
    pub fn merge_thread_stats(&mut self, main: Option<&ThreadStats>, aux: Option<&ThreadStats>) {
        thread_stats::merge_optional(&mut self.main_thread_stats, main);
        thread_stats::merge_optional(&mut self.aux_thread_stats, aux);
    }

    /// Union a serialized histogram into the duration distribution.
    pub fn merge_histogram(&mut self, histogram: &Histogram) {
        self.duration_histogram.merge_proto(histogram);
    }

    /// Merge main thread root timers.
    pub fn merge_main_thread_timers(&mut self, timers: &[Timer]) {
        timer::merge_timers(&mut self.main_thread_root_timers, timers);
    }

    /// Merge auxiliary thread root timers.
    pub fn merge_aux_thread_timers(&mut self, timers: &[Timer]) {
        timer::merge_timers(&mut self.aux_thread_root_timers, timers);
    }

    /// Merge async timers.
    pub fn merge_async_timers(&mut self, timers: &[Timer]) {
        timer::merge_timers(&mut self.async_timers, timers);
    }

    /// Accumulate a query table.
    pub fn merge_queries(&mut self, queries: &[Query]) {
        self.queries.merge_all(queries);
    }

    /// Accumulate a service call table.
    pub fn merge_service_calls(&mut self, calls: &[ServiceCall]) {
        self.service_calls.merge_all(calls);
    }

    /// Union a main thread profile.
    pub fn merge_main_thread_profile(&mut self, roots: &[ProfileNode]) {
        merge_profile(&mut self.main_thread_profile, roots);
    }

    /// Union an auxiliary thread profile.
    pub fn merge_aux_thread_profile(&mut self, roots: &[ProfileNode]) {
        merge_profile(&mut self.aux_thread_profile, roots);
    }

    /// Merge the inline part of a stored row, everything except the capped
    /// blobs it references.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the legacy auxiliary timer field is
    /// malformed. Nothing is merged in that case.
    pub fn merge_record_inline(&mut self, record: &AggregateRecord) -> Result<(), prost::DecodeError> {
        let legacy_root = timer::decode_legacy_aux_root(&record.legacy_aux_thread_root_timer)?;

        self.add_scalar_sums(
            record.total_duration_nanos,
            record.transaction_count,
            record.error_count,
            record.async_transactions,
        );
        self.merge_thread_stats(
            record.main_thread_stats.as_ref(),
            record.aux_thread_stats.as_ref(),
        );
        if let Some(histogram) = &record.duration_histogram {
            self.merge_histogram(histogram);
        }
        self.merge_main_thread_timers(&record.main_thread_root_timers);
        self.merge_aux_thread_timers(&record.aux_thread_root_timers);
        if let Some(root) = legacy_root {
            self.merge_aux_thread_timers(std::slice::from_ref(&root));
        }
        self.merge_async_timers(&record.async_timers);
        Ok(())
    }

    /// Merge an agent snapshot. Snapshot queries carry shared text indexes
    /// and are resolved by the caller, then merged with
    /// [`MutableAggregate::merge_queries`].
    pub fn merge_snapshot(&mut self, snapshot: &AggregateSnapshot) {
        self.add_scalar_sums(
            snapshot.total_duration_nanos,
            snapshot.transaction_count,
            snapshot.error_count,
            snapshot.async_transactions,
        );
        self.merge_thread_stats(
            snapshot.main_thread_stats.as_ref(),
            snapshot.aux_thread_stats.as_ref(),
        );
        if let Some(histogram) = &snapshot.duration_histogram {
            self.merge_histogram(histogram);
        }
        self.merge_main_thread_timers(&snapshot.main_thread_root_timers);
        self.merge_aux_thread_timers(&snapshot.aux_thread_root_timers);
        self.merge_async_timers(&snapshot.async_timers);
        self.merge_service_calls(&snapshot.service_calls);
        self.merge_main_thread_profile(&snapshot.main_thread_profile);
        self.merge_aux_thread_profile(&snapshot.aux_thread_profile);
    }

    /// Number of transactions merged so far.
    #[must_use]
    pub fn transaction_count(&self) -> i64 {
        self.transaction_count
    }

    /// The merged duration distribution.
    #[must_use]
    pub fn duration_histogram(&self) -> &DurationHistogram {
        &self.duration_histogram
    }

    /// The inline row. Capped ids and digests are left unset for the caller
    /// to fill after writing blobs.
    #[must_use]
    pub fn to_record(&self) -> AggregateRecord {
        AggregateRecord {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timers: self.main_thread_root_timers.clone(),
            aux_thread_root_timers: self.aux_thread_root_timers.clone(),
            async_timers: self.async_timers.clone(),
            main_thread_stats: self.main_thread_stats,
            aux_thread_stats: self.aux_thread_stats,
            duration_histogram: (!self.duration_histogram.is_empty())
                .then(|| self.duration_histogram.to_proto()),
            ..AggregateRecord::default()
        }
    }

    /// Query table truncated to `limit_per_type`, empty if none recorded.
    #[must_use]
    pub fn queries(&self, limit_per_type: usize) -> Vec<Query> {
        self.queries.to_queries(limit_per_type)
    }

    /// Service call table truncated to `limit_per_type`.
    #[must_use]
    pub fn service_calls(&self, limit_per_type: usize) -> Vec<ServiceCall> {
        self.service_calls.to_service_calls(limit_per_type)
    }

    /// Main thread profile roots.
    #[must_use]
    pub fn main_thread_profile(&self) -> &[ProfileNode] {
        &self.main_thread_profile
    }

    /// Auxiliary thread profile roots.
    #[must_use]
    pub fn aux_thread_profile(&self) -> &[ProfileNode] {
        &self.aux_thread_profile
    }
}
