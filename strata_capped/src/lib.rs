//! Capped blob storage for strata.
//!
//! Rollup rows are small and queried often. The blobs hanging off them --
//! query tables, service call tables, profile trees -- are large, written
//! once and read rarely. This crate keeps those blobs in a fixed-size file
//! used as a ring: every write lands at the cursor and returns a
//! [`CappedId`], the logical byte offset of the write. When the ring wraps the
//! oldest blobs are overwritten. Nothing is ever deleted explicitly and disk
//! usage never grows past the configured capacity.
//!
//! A [`CappedId`] is valid while `id >= smallest_non_expired_id()`. Reading an
//! older id is not an error, it yields [`Blob::Expired`].

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
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{fmt, io, path::PathBuf};

mod frame;
mod store;

pub use store::CappedStore;

/// Handle of a blob written to a [`CappedStore`].
///
/// Ids are strictly increasing per store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CappedId(u64);

impl CappedId {
    /// Wrap a raw id, typically one read back from a row.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id, suitable for storing in a row column.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CappedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a read against a [`CappedStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob<T> {
    /// The blob is still inside the ring.
    Live(T),
    /// The blob aged out and has been overwritten.
    Expired,
}

impl<T> Blob<T> {
    /// True if the blob aged out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Blob::Expired)
    }

    /// Convert into an `Option`, mapping `Expired` to `None`.
    #[must_use]
    pub fn live(self) -> Option<T> {
        match self {
            Blob::Live(value) => Some(value),
            Blob::Expired => None,
        }
    }

    /// Transform the live value.
    pub fn map<U, F>(self, f: F) -> Blob<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Blob::Live(value) => Blob::Live(f(value)),
            Blob::Expired => Blob::Expired,
        }
    }
}

/// Errors produced by [`CappedStore`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO error against the backing file.
    #[error("[{context}] capped store io error: {source}")]
    Io {
        /// Simple tag naming the failed operation.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The backing file exists but does not carry a capped store header.
    #[error("{path:?} is not a capped store file")]
    BadHeader {
        /// Path of the offending file.
        path: PathBuf,
    },
    /// The header declares a format version this build does not read.
    #[error("unsupported capped store version {version}")]
    UnsupportedVersion {
        /// The version found in the header.
        version: u32,
    },
    /// A capacity of zero bytes was requested.
    #[error("capped store capacity must be non-zero")]
    ZeroCapacity,
    /// The framed write does not fit in the ring at all.
    #[error("block of {block} bytes exceeds capped store capacity of {capacity} bytes")]
    BlockTooLarge {
        /// Framed size of the rejected block.
        block: u64,
        /// Current ring capacity.
        capacity: u64,
    },
    /// The id was never issued by this store.
    #[error("capped id {id} is beyond the write cursor {cursor}")]
    UnknownId {
        /// The requested id.
        id: CappedId,
        /// The current write cursor.
        cursor: u64,
    },
    /// The stored block framing is inconsistent.
    #[error("corrupt block at capped id {id}: {reason}")]
    Corrupt {
        /// The requested id.
        id: CappedId,
        /// Short description of the inconsistency.
        reason: &'static str,
    },
    /// A record could not be decoded into the requested message type.
    #[error("failed to decode record at capped id {id}: {source}")]
    Decode {
        /// The requested id.
        id: CappedId,
        /// The underlying decode error.
        #[source]
        source: prost::DecodeError,
    },
    /// A record could not be length-delimited.
    #[error("failed to frame record: {0}")]
    Encode(#[from] prost::EncodeError),
    /// The internal lock was poisoned by a panicking thread.
    #[error("capped store lock poisoned")]
    Poisoned,
}

impl Error {
    /// True when the error describes malformed stored content rather than an
    /// unavailable store. Callers skip the affected row on these.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Corrupt { .. } | Error::Decode { .. })
    }
}
