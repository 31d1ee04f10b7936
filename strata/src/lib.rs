//! The strata rollup backend.
//!
//! Agents deliver fine grained aggregates which [`ingest`] stores as level 0
//! rows. The [`scheduler`] compacts each agent's rows into coarser buckets
//! level by level and the [`coordinator`] drives that across the whole agent
//! tree on a fixed cadence. Large row fields live in per-level capped stores
//! and are referenced from rows by id, see [`blobs`]. The [`query`] module
//! holds the read contracts over the result.

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

pub mod blobs;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod levels;
pub mod pool;
pub mod query;
pub mod row;
pub mod scheduler;
pub mod store;
pub mod tree;
