//! Wire messages for aggregate rows, blob records and agent snapshots.
//!
//! Hand-maintained prost messages. Field tags are stable: rows written by
//! older builds must keep decoding.

/// A named timer and its nested children.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Timer {
    /// Timer name, unique among siblings after merge.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Whether the timer was still running when captured.
    #[prost(bool, tag = "2")]
    pub extended: bool,
    /// Accumulated time in nanoseconds.
    #[prost(double, tag = "3")]
    pub total_nanos: f64,
    /// Number of times the timer fired.
    #[prost(int64, tag = "4")]
    pub count: i64,
    /// Nested timers.
    #[prost(message, repeated, tag = "5")]
    pub child_timers: Vec<Timer>,
}

/// Per-thread resource counters. `None` means the agent did not record the
/// counter, which is distinct from zero.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ThreadStats {
    /// CPU time in nanoseconds.
    #[prost(double, optional, tag = "1")]
    pub cpu_nanos: Option<f64>,
    /// Time spent blocked, nanoseconds.
    #[prost(double, optional, tag = "2")]
    pub blocked_nanos: Option<f64>,
    /// Time spent waiting, nanoseconds.
    #[prost(double, optional, tag = "3")]
    pub waited_nanos: Option<f64>,
    /// Bytes allocated.
    #[prost(double, optional, tag = "4")]
    pub allocated_bytes: Option<f64>,
}

/// One bucket of a [`Histogram`].
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HistogramBucket {
    /// Logarithmic bucket index.
    #[prost(sint32, tag = "1")]
    pub index: i32,
    /// Samples in the bucket.
    #[prost(uint64, tag = "2")]
    pub count: u64,
}

/// Serialized duration histogram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Histogram {
    /// Samples with a duration of zero.
    #[prost(uint64, tag = "1")]
    pub zero_count: u64,
    /// Non-empty buckets in ascending index order.
    #[prost(message, repeated, tag = "2")]
    pub buckets: Vec<HistogramBucket>,
}

/// One entry of a query table blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Query {
    /// Query kind, for instance `SQL`.
    #[prost(string, tag = "1")]
    pub query_type: String,
    /// Query text, truncated when `full_text_sha` is set.
    #[prost(string, tag = "2")]
    pub truncated_text: String,
    /// Hex SHA-256 of the full text held in the shared text store, or empty
    /// when `truncated_text` is the whole text.
    #[prost(string, tag = "3")]
    pub full_text_sha: String,
    /// Accumulated duration in nanoseconds.
    #[prost(double, tag = "4")]
    pub total_duration_nanos: f64,
    /// Number of executions.
    #[prost(int64, tag = "5")]
    pub execution_count: i64,
    /// Rows returned. `None` when the driver does not report rows.
    #[prost(int64, optional, tag = "6")]
    pub total_rows: Option<i64>,
}

/// One entry of a service call table blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceCall {
    /// Call kind, for instance `HTTP`.
    #[prost(string, tag = "1")]
    pub service_call_type: String,
    /// Call text, usually a method and URL.
    #[prost(string, tag = "2")]
    pub text: String,
    /// Accumulated duration in nanoseconds.
    #[prost(double, tag = "3")]
    pub total_duration_nanos: f64,
    /// Number of executions.
    #[prost(int64, tag = "4")]
    pub execution_count: i64,
}

/// A call tree node carrying stack sample counts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileNode {
    /// Stack frame, rendered.
    #[prost(string, tag = "1")]
    pub frame: String,
    /// Samples that passed through this frame.
    #[prost(int64, tag = "2")]
    pub sample_count: i64,
    /// Callees.
    #[prost(message, repeated, tag = "3")]
    pub children: Vec<ProfileNode>,
}

/// A stored aggregate row. Large tables live in capped blobs referenced by
/// id; everything else is inline.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregateRecord {
    /// Sum of transaction durations in nanoseconds.
    #[prost(double, tag = "1")]
    pub total_duration_nanos: f64,
    /// Number of transactions.
    #[prost(int64, tag = "2")]
    pub transaction_count: i64,
    /// Number of transactions that ended in error.
    #[prost(int64, tag = "3")]
    pub error_count: i64,
    /// Whether any contributing transaction was asynchronous.
    #[prost(bool, tag = "4")]
    pub async_transactions: bool,
    /// Main thread root timers.
    #[prost(message, repeated, tag = "5")]
    pub main_thread_root_timers: Vec<Timer>,
    /// Auxiliary thread root timers.
    #[prost(message, repeated, tag = "6")]
    pub aux_thread_root_timers: Vec<Timer>,
    /// Async timers, not nested.
    #[prost(message, repeated, tag = "7")]
    pub async_timers: Vec<Timer>,
    /// Main thread resource counters.
    #[prost(message, optional, tag = "8")]
    pub main_thread_stats: Option<ThreadStats>,
    /// Auxiliary thread resource counters.
    #[prost(message, optional, tag = "9")]
    pub aux_thread_stats: Option<ThreadStats>,
    /// Duration distribution.
    #[prost(message, optional, tag = "10")]
    pub duration_histogram: Option<Histogram>,
    /// Capped id of the query table.
    #[prost(uint64, optional, tag = "11")]
    pub queries_capped_id: Option<u64>,
    /// Capped id of the service call table.
    #[prost(uint64, optional, tag = "12")]
    pub service_calls_capped_id: Option<u64>,
    /// Capped id of the main thread profile.
    #[prost(uint64, optional, tag = "13")]
    pub main_thread_profile_capped_id: Option<u64>,
    /// Capped id of the auxiliary thread profile.
    #[prost(uint64, optional, tag = "14")]
    pub aux_thread_profile_capped_id: Option<u64>,
    /// Digest of the query table content.
    #[prost(bytes = "vec", tag = "15")]
    pub queries_digest: Vec<u8>,
    /// Digest of the service call table content.
    #[prost(bytes = "vec", tag = "16")]
    pub service_calls_digest: Vec<u8>,
    /// Digest of the main thread profile content.
    #[prost(bytes = "vec", tag = "17")]
    pub main_thread_profile_digest: Vec<u8>,
    /// Digest of the auxiliary thread profile content.
    #[prost(bytes = "vec", tag = "18")]
    pub aux_thread_profile_digest: Vec<u8>,
    /// Auxiliary root timer as written by older agents, see
    /// [`crate::timer::decode_legacy_aux_root`].
    #[prost(bytes = "vec", tag = "19")]
    pub legacy_aux_thread_root_timer: Vec<u8>,
}

/// A query entry inside an agent snapshot. The text is an index into the
/// shared texts delivered in the same batch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotQuery {
    /// Query kind.
    #[prost(string, tag = "1")]
    pub query_type: String,
    /// Index of the text among the batch's shared texts.
    #[prost(uint32, tag = "2")]
    pub shared_query_text_index: u32,
    /// Accumulated duration in nanoseconds.
    #[prost(double, tag = "3")]
    pub total_duration_nanos: f64,
    /// Number of executions.
    #[prost(int64, tag = "4")]
    pub execution_count: i64,
    /// Rows returned, when reported.
    #[prost(int64, optional, tag = "5")]
    pub total_rows: Option<i64>,
}

/// One interval of measurements for one transaction scope, as delivered by
/// an agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregateSnapshot {
    /// Sum of transaction durations in nanoseconds.
    #[prost(double, tag = "1")]
    pub total_duration_nanos: f64,
    /// Number of transactions.
    #[prost(int64, tag = "2")]
    pub transaction_count: i64,
    /// Number of transactions that ended in error.
    #[prost(int64, tag = "3")]
    pub error_count: i64,
    /// Whether any transaction was asynchronous.
    #[prost(bool, tag = "4")]
    pub async_transactions: bool,
    /// Main thread root timers.
    #[prost(message, repeated, tag = "5")]
    pub main_thread_root_timers: Vec<Timer>,
    /// Auxiliary thread root timers.
    #[prost(message, repeated, tag = "6")]
    pub aux_thread_root_timers: Vec<Timer>,
    /// Async timers.
    #[prost(message, repeated, tag = "7")]
    pub async_timers: Vec<Timer>,
    /// Main thread resource counters.
    #[prost(message, optional, tag = "8")]
    pub main_thread_stats: Option<ThreadStats>,
    /// Auxiliary thread resource counters.
    #[prost(message, optional, tag = "9")]
    pub aux_thread_stats: Option<ThreadStats>,
    /// Duration distribution.
    #[prost(message, optional, tag = "10")]
    pub duration_histogram: Option<Histogram>,
    /// Queries, with texts by shared index.
    #[prost(message, repeated, tag = "11")]
    pub queries: Vec<SnapshotQuery>,
    /// Service calls.
    #[prost(message, repeated, tag = "12")]
    pub service_calls: Vec<ServiceCall>,
    /// Main thread profile roots.
    #[prost(message, repeated, tag = "13")]
    pub main_thread_profile: Vec<ProfileNode>,
    /// Auxiliary thread profile roots.
    #[prost(message, repeated, tag = "14")]
    pub aux_thread_profile: Vec<ProfileNode>,
}
