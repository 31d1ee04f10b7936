use std::{path::Path, sync::Arc};

use strata::{
    blobs::{LevelStores, Limits},
    ingest::{Collector, IngestEvent},
    row::{ScopeFilter, TimeRange},
    scheduler::Scheduler,
    store::{RollupKind, RowStore, SqliteStore},
};
use strata_aggregate::proto::AggregateSnapshot;

const LIMITS: Limits = Limits {
    max_query_aggregates: 500,
    max_service_call_aggregates: 500,
};
const INTERVALS: [i64; 2] = [0, 300_000];

fn open(dir: &Path) -> (Arc<SqliteStore>, Arc<LevelStores>) {
    let store = Arc::new(SqliteStore::open(dir.join("strata.db"), INTERVALS.len()).expect("open row store"));
    let capped = Arc::new(LevelStores::open(dir, &[1 << 20, 1 << 20]).expect("open capped stores"));
    (store, capped)
}

fn snapshot(nanos: f64) -> IngestEvent {
    IngestEvent::OverallSnapshot {
        transaction_type: "web".to_string(),
        snapshot: AggregateSnapshot {
            total_duration_nanos: nanos,
            transaction_count: 1,
            ..AggregateSnapshot::default()
        },
    }
}

#[tokio::test]
async fn rollup_resumes_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let everything = TimeRange::closed(0, 10_000_000);

    {
        let (store, capped) = open(dir.path());
        let collector = Collector::new(Arc::clone(&store), Arc::clone(&capped), LIMITS, 120);
        for (time, nanos) in [(60_000, 10.0), (120_000, 20.0)] {
            collector.store("agent", time, [snapshot(nanos)]).await.expect("store");
        }
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&capped), INTERVALS.to_vec(), LIMITS);
        let report = scheduler
            .rollup_aggregates("agent", &[], 300_000)
            .await
            .expect("rollup");
        assert_eq!(report.written, 1);
        capped.flush().expect("flush");
    }

    let (store, capped) = open(dir.path());
    let agents = store.active_agents(0).await.expect("agents");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].aggregates, Some(120_000));
    assert_eq!(
        store
            .read_last_rollup_times("agent", RollupKind::Aggregate)
            .await
            .expect("times")
            .get(1)
            .copied(),
        Some(300_000)
    );

    let rows = store
        .read_aggregates("agent", 1, &ScopeFilter::Any, everything)
        .await
        .expect("read");
    assert_eq!(rows.len(), 1);
    let record = rows[0].decode().expect("decode");
    assert_eq!(record.transaction_count, 2);
    assert_eq!(record.total_duration_nanos, 30.0);

    let scheduler = Scheduler::new(Arc::clone(&store), capped, INTERVALS.to_vec(), LIMITS);
    let again = scheduler
        .rollup_aggregates("agent", &[], 300_000)
        .await
        .expect("rollup");
    assert_eq!(again.written, 0);
}
