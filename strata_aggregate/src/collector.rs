//! Top-N query and service call tables.
//!
//! Collectors accumulate every entry they are given. Truncation to the
//! heaviest entries per type happens only when a table is serialized, and
//! whatever is cut is summed into one [`LIMIT_EXCEEDED_BUCKET`] entry per
//! type so table totals stay exact across any number of rollups.

use std::{cmp::Ordering, collections::BTreeMap};

use rustc_hash::FxHashMap;

use crate::proto::{Query, ServiceCall};

/// Text of the entry that absorbs everything past the limit.
pub const LIMIT_EXCEEDED_BUCKET: &str = "LIMIT EXCEEDED BUCKET";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct QueryKey {
    query_type: String,
    truncated_text: String,
    full_text_sha: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct QueryTotals {
    total_duration_nanos: f64,
    execution_count: i64,
    total_rows: Option<i64>,
}

impl QueryTotals {
    fn absorb(&mut self, other: &QueryTotals) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
        self.total_rows = match (self.total_rows, other.total_rows) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// Accumulates queries keyed by type and text.
#[derive(Debug, Clone, Default)]
pub struct QueryCollector {
    entries: FxHashMap<QueryKey, QueryTotals>,
}

impl QueryCollector {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one query.
    pub fn merge(&mut self, query: &Query) {
        let key = QueryKey {
            query_type: query.query_type.clone(),
            truncated_text: query.truncated_text.clone(),
            full_text_sha: query.full_text_sha.clone(),
        };
        self.entries.entry(key).or_default().absorb(&QueryTotals {
            total_duration_nanos: query.total_duration_nanos,
            execution_count: query.execution_count,
            total_rows: query.total_rows,
        });
    }

    /// Add every query of a table.
    pub fn merge_all(&mut self, queries: &[Query]) {
        for query in queries {
            self.merge(query);
        }
    }

    /// Number of distinct entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize, keeping at most `limit_per_type` entries of each type plus
    /// one overflow entry. Output is ordered by type, then total duration
    /// descending, then text.
    #[must_use]
    pub fn to_queries(&self, limit_per_type: usize) -> Vec<Query> {
        let mut by_type: BTreeMap<&str, Vec<(&QueryKey, &QueryTotals)>> = BTreeMap::new();
        for (key, totals) in &self.entries {
            by_type
                .entry(key.query_type.as_str())
                .or_default()
                .push((key, totals));
        }

        let mut out = Vec::with_capacity(self.entries.len().min(limit_per_type * by_type.len()));
        for (query_type, mut entries) in by_type {
            entries.sort_by(|(ka, ta), (kb, tb)| {
                heaviest_first(ta.total_duration_nanos, tb.total_duration_nanos)
                    .then_with(|| ka.cmp(kb))
            });

            let mut overflow: Option<QueryTotals> = None;
            let mut kept = 0;
            for (key, totals) in entries {
                if key.truncated_text == LIMIT_EXCEEDED_BUCKET || kept >= limit_per_type {
                    overflow.get_or_insert_with(QueryTotals::default).absorb(totals);
                    continue;
                }
                kept += 1;
                out.push(Query {
                    query_type: key.query_type.clone(),
                    truncated_text: key.truncated_text.clone(),
                    full_text_sha: key.full_text_sha.clone(),
                    total_duration_nanos: totals.total_duration_nanos,
                    execution_count: totals.execution_count,
                    total_rows: totals.total_rows,
                });
            }
            if let Some(totals) = overflow {
                out.push(Query {
                    query_type: query_type.to_string(),
                    truncated_text: LIMIT_EXCEEDED_BUCKET.to_string(),
                    full_text_sha: String::new(),
                    total_duration_nanos: totals.total_duration_nanos,
                    execution_count: totals.execution_count,
                    total_rows: totals.total_rows,
                });
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CallTotals {
    total_duration_nanos: f64,
    execution_count: i64,
}

impl CallTotals {
    fn absorb(&mut self, other: CallTotals) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
    }
}

/// Accumulates service calls keyed by type and text.
#[derive(Debug, Clone, Default)]
pub struct ServiceCallCollector {
    entries: FxHashMap<(String, String), CallTotals>,
}

impl ServiceCallCollector {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one service call.
    pub fn merge(&mut self, call: &ServiceCall) {
        self.entries
            .entry((call.service_call_type.clone(), call.text.clone()))
            .or_default()
            .absorb(CallTotals {
                total_duration_nanos: call.total_duration_nanos,
                execution_count: call.execution_count,
            });
    }

    /// Add every call of a table.
    pub fn merge_all(&mut self, calls: &[ServiceCall]) {
        for call in calls {
            self.merge(call);
        }
    }

    /// True if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize with the same truncation rules as
    /// [`QueryCollector::to_queries`].
    #[must_use]
    pub fn to_service_calls(&self, limit_per_type: usize) -> Vec<ServiceCall> {
        let mut by_type: BTreeMap<&str, Vec<(&str, CallTotals)>> = BTreeMap::new();
        for ((call_type, text), totals) in &self.entries {
            by_type
                .entry(call_type.as_str())
                .or_default()
                .push((text.as_str(), *totals));
        }

        let mut out = Vec::new();
        for (call_type, mut entries) in by_type {
            entries.sort_by(|(ta, a), (tb, b)| {
                heaviest_first(a.total_duration_nanos, b.total_duration_nanos)
                    .then_with(|| ta.cmp(tb))
            });

            let mut overflow: Option<CallTotals> = None;
            let mut kept = 0;
            for (text, totals) in entries {
                if text == LIMIT_EXCEEDED_BUCKET || kept >= limit_per_type {
                    overflow.get_or_insert_with(CallTotals::default).absorb(totals);
                    continue;
                }
                kept += 1;
                out.push(ServiceCall {
                    service_call_type: call_type.to_string(),
                    text: text.to_string(),
                    total_duration_nanos: totals.total_duration_nanos,
                    execution_count: totals.execution_count,
                });
            }
            if let Some(totals) = overflow {
                out.push(ServiceCall {
                    service_call_type: call_type.to_string(),
                    text: LIMIT_EXCEEDED_BUCKET.to_string(),
                    total_duration_nanos: totals.total_duration_nanos,
                    execution_count: totals.execution_count,
                });
            }
        }
        out
    }
}

fn heaviest_first(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

#[cfg(test)]
mod tests {
    use super::{LIMIT_EXCEEDED_BUCKET, QueryCollector, ServiceCallCollector};
    use crate::proto::{Query, ServiceCall};

    fn query(text: &str, total: f64, count: i64, rows: Option<i64>) -> Query {
        Query {
            query_type: "SQL".to_string(),
            truncated_text: text.to_string(),
            full_text_sha: String::new(),
            total_duration_nanos: total,
            execution_count: count,
            total_rows: rows,
        }
    }

    #[test]
    fn same_key_accumulates() {
        let mut collector = QueryCollector::new();
        collector.merge(&query("select 1", 10.0, 1, Some(1)));
        collector.merge(&query("select 1", 5.0, 2, None));
        let out = collector.to_queries(10);
        assert_eq!(out, vec![query("select 1", 15.0, 3, Some(1))]);
    }

    #[test]
    fn truncation_sums_overflow() {
        let mut collector = QueryCollector::new();
        collector.merge_all(&[
            query("a", 30.0, 1, None),
            query("b", 20.0, 1, None),
            query("c", 10.0, 1, None),
            query("d", 5.0, 2, None),
        ]);
        let out = collector.to_queries(2);
        let texts: Vec<&str> = out.iter().map(|q| q.truncated_text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", LIMIT_EXCEEDED_BUCKET]);
        assert_eq!(out[2].total_duration_nanos, 15.0);
        assert_eq!(out[2].execution_count, 3);

        let total: f64 = out.iter().map(|q| q.total_duration_nanos).sum();
        assert_eq!(total, 65.0);
    }

    #[test]
    fn merge_never_drops_entries_before_serialization() {
        // Entry "c" is light in each input but heaviest once combined.
        let mut first = QueryCollector::new();
        first.merge_all(&[query("a", 10.0, 1, None), query("c", 6.0, 1, None)]);
        let mut second = QueryCollector::new();
        second.merge_all(&[query("b", 10.0, 1, None), query("c", 6.0, 1, None)]);

        let mut combined = QueryCollector::new();
        combined.merge_all(&first.to_queries(10));
        combined.merge_all(&second.to_queries(10));
        let out = combined.to_queries(1);
        assert_eq!(out[0].truncated_text, "c");
        assert_eq!(out[0].total_duration_nanos, 12.0);
    }

    #[test]
    fn existing_overflow_is_folded_not_ranked() {
        let mut collector = QueryCollector::new();
        collector.merge_all(&[
            query(LIMIT_EXCEEDED_BUCKET, 100.0, 4, None),
            query("a", 1.0, 1, None),
        ]);
        let out = collector.to_queries(1);
        assert_eq!(out[0].truncated_text, "a");
        assert_eq!(out[1].truncated_text, LIMIT_EXCEEDED_BUCKET);
        assert_eq!(out[1].total_duration_nanos, 100.0);
    }

    #[test]
    fn service_calls_group_by_type() {
        let call = |kind: &str, text: &str, total: f64| ServiceCall {
            service_call_type: kind.to_string(),
            text: text.to_string(),
            total_duration_nanos: total,
            execution_count: 1,
        };
        let mut collector = ServiceCallCollector::new();
        collector.merge_all(&[
            call("HTTP", "GET /a", 3.0),
            call("HTTP", "GET /b", 2.0),
            call("HTTP", "GET /a", 3.0),
            call("GRPC", "Svc/M", 1.0),
        ]);
        let out = collector.to_service_calls(1);
        assert_eq!(
            out,
            vec![
                call("GRPC", "Svc/M", 1.0),
                ServiceCall {
                    execution_count: 2,
                    ..call("HTTP", "GET /a", 6.0)
                },
                call("HTTP", LIMIT_EXCEEDED_BUCKET, 2.0),
            ]
        );
    }
}
