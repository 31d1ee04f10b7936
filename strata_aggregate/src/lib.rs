//! Aggregate data model and merge engine for strata.
//!
//! Agents report one [`proto::AggregateSnapshot`] per transaction scope and
//! interval. Rollups combine many stored [`proto::AggregateRecord`] rows, plus
//! the capped blobs they reference, into one through a [`MutableAggregate`].
//! Every merge here is order independent so re-running a rollup, or running
//! it concurrently on two nodes, produces the same row.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod collector;
pub mod histogram;
pub mod mutable;
pub mod profile;
pub mod proto;
pub mod thread_stats;
pub mod timer;

pub use collector::{LIMIT_EXCEEDED_BUCKET, QueryCollector, ServiceCallCollector};
pub use histogram::DurationHistogram;
pub use mutable::MutableAggregate;
