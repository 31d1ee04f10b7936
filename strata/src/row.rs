//! Rows of the rollup store.

use bytes::Bytes;
use prost::Message;
use strata_aggregate::proto::AggregateRecord;
use strata_capped::CappedId;

use crate::store::RollupKind;

/// The transaction scope a row aggregates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    /// Transaction type, for instance `Web`.
    pub transaction_type: String,
    /// Transaction name, `None` for the overall row of the type.
    pub transaction_name: Option<String>,
}

impl Scope {
    /// The overall scope of `transaction_type`.
    #[must_use]
    pub fn overall(transaction_type: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: None,
        }
    }

    /// The scope of one named transaction.
    #[must_use]
    pub fn per_name(transaction_type: impl Into<String>, transaction_name: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: Some(transaction_name.into()),
        }
    }

    /// True for an overall row.
    #[must_use]
    pub fn is_overall(&self) -> bool {
        self.transaction_name.is_none()
    }
}

/// Time range `(after, through]` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Exclusive lower bound.
    pub after: i64,
    /// Inclusive upper bound.
    pub through: i64,
}

impl TimeRange {
    /// The half-open range `(after, through]`.
    #[must_use]
    pub const fn new(after: i64, through: i64) -> Self {
        Self { after, through }
    }

    /// The closed range `[from, to]`.
    #[must_use]
    pub const fn closed(from: i64, to: i64) -> Self {
        Self {
            after: from - 1,
            through: to,
        }
    }

    /// True if `time` falls in the range.
    #[must_use]
    pub const fn contains(&self, time: i64) -> bool {
        time > self.after && time <= self.through
    }

    /// True if no time falls in the range.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.through <= self.after
    }
}

/// Selects rows by scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every row.
    Any,
    /// Exactly one scope.
    Exact(Scope),
    /// Every named transaction of a type, excluding the overall row.
    NamesOf(String),
}

impl ScopeFilter {
    /// True if `scope` is selected.
    #[must_use]
    pub fn matches(&self, scope: &Scope) -> bool {
        match self {
            ScopeFilter::Any => true,
            ScopeFilter::Exact(wanted) => wanted == scope,
            ScopeFilter::NamesOf(transaction_type) => {
                scope.transaction_name.is_some() && &scope.transaction_type == transaction_type
            }
        }
    }
}

/// A row column holding a capped blob id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CappedColumn {
    /// Query table.
    Queries,
    /// Service call table.
    ServiceCalls,
    /// Main thread profile.
    MainThreadProfile,
    /// Auxiliary thread profile.
    AuxThreadProfile,
}

impl CappedColumn {
    /// Every capped column, in storage order.
    pub const ALL: [CappedColumn; 4] = [
        CappedColumn::Queries,
        CappedColumn::ServiceCalls,
        CappedColumn::MainThreadProfile,
        CappedColumn::AuxThreadProfile,
    ];

    const fn slot(self) -> usize {
        match self {
            CappedColumn::Queries => 0,
            CappedColumn::ServiceCalls => 1,
            CappedColumn::MainThreadProfile => 2,
            CappedColumn::AuxThreadProfile => 3,
        }
    }

    /// The id stored in this column of `record`.
    #[must_use]
    pub fn id(self, record: &AggregateRecord) -> Option<CappedId> {
        match self {
            CappedColumn::Queries => record.queries_capped_id,
            CappedColumn::ServiceCalls => record.service_calls_capped_id,
            CappedColumn::MainThreadProfile => record.main_thread_profile_capped_id,
            CappedColumn::AuxThreadProfile => record.aux_thread_profile_capped_id,
        }
        .map(CappedId::new)
    }

    /// The content digest stored alongside the id.
    #[must_use]
    pub fn digest(self, record: &AggregateRecord) -> &[u8] {
        match self {
            CappedColumn::Queries => &record.queries_digest,
            CappedColumn::ServiceCalls => &record.service_calls_digest,
            CappedColumn::MainThreadProfile => &record.main_thread_profile_digest,
            CappedColumn::AuxThreadProfile => &record.aux_thread_profile_digest,
        }
    }

    /// Point this column of `record` at a blob.
    pub fn set(self, record: &mut AggregateRecord, id: CappedId, digest: Vec<u8>) {
        let (slot, digest_slot) = match self {
            CappedColumn::Queries => (&mut record.queries_capped_id, &mut record.queries_digest),
            CappedColumn::ServiceCalls => (
                &mut record.service_calls_capped_id,
                &mut record.service_calls_digest,
            ),
            CappedColumn::MainThreadProfile => (
                &mut record.main_thread_profile_capped_id,
                &mut record.main_thread_profile_digest,
            ),
            CappedColumn::AuxThreadProfile => (
                &mut record.aux_thread_profile_capped_id,
                &mut record.aux_thread_profile_digest,
            ),
        };
        *slot = Some(id.get());
        *digest_slot = digest;
    }
}

/// A row as held by a store: the encoded record plus its capped id columns
/// kept in the clear so range scans can filter on them without decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Scope of the row.
    pub scope: Scope,
    /// Bucket boundary of the row.
    pub capture_time: i64,
    encoded: Bytes,
    columns: [Option<CappedId>; 4],
}

impl StoredRow {
    /// Encode `record` for storage.
    #[must_use]
    pub fn new(scope: Scope, capture_time: i64, record: &AggregateRecord) -> Self {
        let mut columns = [None; 4];
        for column in CappedColumn::ALL {
            columns[column.slot()] = column.id(record);
        }
        Self {
            scope,
            capture_time,
            encoded: Bytes::from(record.encode_to_vec()),
            columns,
        }
    }

    /// Reassemble a row read back from storage. `ids` yields the capped id
    /// of each column as stored beside the encoded record.
    pub(crate) fn from_parts(
        scope: Scope,
        capture_time: i64,
        encoded: Bytes,
        ids: impl IntoIterator<Item = (CappedColumn, Option<CappedId>)>,
    ) -> Self {
        let mut columns = [None; 4];
        for (column, id) in ids {
            columns[column.slot()] = id;
        }
        Self {
            scope,
            capture_time,
            encoded,
            columns,
        }
    }

    #[cfg(test)]
    pub(crate) fn raw(scope: Scope, capture_time: i64, encoded: Bytes) -> Self {
        Self::from_parts(scope, capture_time, encoded, [])
    }

    /// Decode the record.
    ///
    /// # Errors
    ///
    /// Returns the decode error for malformed historical rows.
    pub fn decode(&self) -> Result<AggregateRecord, prost::DecodeError> {
        AggregateRecord::decode(self.encoded.clone())
    }

    /// The encoded record.
    #[must_use]
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// The capped id in `column`, if any.
    #[must_use]
    pub fn capped_id(&self, column: CappedColumn) -> Option<CappedId> {
        self.columns[column.slot()]
    }
}

/// A gauge sample or rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeValue {
    /// Gauge name, for instance `heap.used`.
    pub name: String,
    /// Capture time or bucket boundary.
    pub capture_time: i64,
    /// Value, an average for rolled up rows.
    pub value: f64,
    /// Samples behind `value`.
    pub weight: i64,
}

impl GaugeValue {
    /// Fold `other` into `self` as a weighted average.
    pub fn absorb(&mut self, other: &GaugeValue) {
        let total = self.weight + other.weight;
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let combined = (self.value * self.weight as f64 + other.value * other.weight as f64)
                / total as f64;
            self.value = combined;
        }
        self.weight = total;
    }
}

/// Latest capture times of an agent, one per rollup chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCapture {
    /// Agent id.
    pub agent_id: String,
    /// Latest capture time of a delivered aggregate batch.
    pub aggregates: Option<i64>,
    /// Latest capture time of a delivered gauge value.
    pub gauges: Option<i64>,
}

impl AgentCapture {
    /// An agent that has delivered nothing yet.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            aggregates: None,
            gauges: None,
        }
    }

    /// Latest capture time on the `kind` chain.
    #[must_use]
    pub fn latest(&self, kind: RollupKind) -> Option<i64> {
        match kind {
            RollupKind::Aggregate => self.aggregates,
            RollupKind::Gauge => self.gauges,
        }
    }

    /// Advance the `kind` chain to `capture_time`. Never moves it backwards.
    pub fn advance(&mut self, kind: RollupKind, capture_time: i64) {
        let slot = match kind {
            RollupKind::Aggregate => &mut self.aggregates,
            RollupKind::Gauge => &mut self.gauges,
        };
        *slot = Some(slot.map_or(capture_time, |latest| latest.max(capture_time)));
    }

    /// Latest capture time on either chain.
    #[must_use]
    pub fn newest(&self) -> Option<i64> {
        self.aggregates.max(self.gauges)
    }
}

#[cfg(test)]
mod tests {
    use strata_aggregate::proto::AggregateRecord;
    use strata_capped::CappedId;

    use super::{AgentCapture, CappedColumn, GaugeValue, Scope, ScopeFilter, StoredRow, TimeRange};
    use crate::store::RollupKind;

    #[test]
    fn range_is_half_open() {
        let range = TimeRange::new(0, 300_000);
        assert!(!range.contains(0));
        assert!(range.contains(1));
        assert!(range.contains(300_000));
        assert!(!range.contains(300_001));
        assert!(TimeRange::closed(5, 5).contains(5));
    }

    #[test]
    fn names_of_excludes_overall() {
        let filter = ScopeFilter::NamesOf("Web".to_string());
        assert!(filter.matches(&Scope::per_name("Web", "/home")));
        assert!(!filter.matches(&Scope::overall("Web")));
        assert!(!filter.matches(&Scope::per_name("Background", "job")));
    }

    #[test]
    fn columns_are_mirrored_out_of_the_record() {
        let mut record = AggregateRecord::default();
        CappedColumn::ServiceCalls.set(&mut record, CappedId::new(42), vec![1, 2]);
        let row = StoredRow::new(Scope::overall("Web"), 60_000, &record);
        assert_eq!(row.capped_id(CappedColumn::ServiceCalls), Some(CappedId::new(42)));
        assert_eq!(row.capped_id(CappedColumn::Queries), None);
        assert_eq!(row.decode().expect("decode"), record);
    }

    #[test]
    fn gauge_absorb_is_weighted() {
        let mut a = GaugeValue {
            name: "heap".to_string(),
            capture_time: 0,
            value: 10.0,
            weight: 1,
        };
        a.absorb(&GaugeValue {
            value: 40.0,
            weight: 2,
            ..a.clone()
        });
        assert_eq!(a.value, 30.0);
        assert_eq!(a.weight, 3);
    }

    #[test]
    fn chains_advance_independently() {
        let mut agent = AgentCapture::new("a");
        assert_eq!(agent.newest(), None);
        agent.advance(RollupKind::Gauge, 300_000);
        agent.advance(RollupKind::Aggregate, 120_000);
        agent.advance(RollupKind::Aggregate, 60_000);
        assert_eq!(agent.latest(RollupKind::Aggregate), Some(120_000));
        assert_eq!(agent.latest(RollupKind::Gauge), Some(300_000));
        assert_eq!(agent.newest(), Some(300_000));
    }
}
