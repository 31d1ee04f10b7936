//! This module controls configuration parsing from the end user. Invalid
//! configuration is rejected here, before any store is opened.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use byte_unit::Byte;
use serde::Deserialize;

use crate::blobs::Limits;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the config file.
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// No rollup level configured.
    #[error("at least one rollup level is required")]
    NoLevels,
    /// A level's interval does not extend its predecessor.
    #[error("rollup level {level} interval {interval}ms must be a positive multiple of {previous}ms")]
    Interval {
        /// Offending level.
        level: usize,
        /// Its interval.
        interval: u64,
        /// Interval of the level below.
        previous: u64,
    },
    /// A level has no capped store space.
    #[error("rollup level {0} capped_store_size must be non-zero")]
    ZeroCappedSize(usize),
    /// Worker bounds are inverted or zero.
    #[error("coordinator workers must satisfy 0 < min_workers ({min}) <= max_workers ({max})")]
    Workers {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// One rollup level.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RollupLevelConfig {
    /// Bucket width, zero for the raw level.
    pub interval_millis: u64,
    /// Size of the level's capped store file.
    pub capped_store_size: Byte,
}

fn default_max_aggregates() -> usize {
    500
}

fn default_full_text_min_length() -> usize {
    120
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the capped store files.
    pub data_dir: PathBuf,
    /// Rollup levels, finest first.
    pub rollup_levels: Vec<RollupLevelConfig>,
    /// Queries kept per query type in a row.
    #[serde(default = "default_max_aggregates")]
    pub max_query_aggregates: usize,
    /// Service calls kept per call type in a row.
    #[serde(default = "default_max_aggregates")]
    pub max_service_call_aggregates: usize,
    /// Query texts longer than this are shared by digest.
    #[serde(default = "default_full_text_min_length")]
    pub full_query_text_min_length: usize,
    /// The hierarchical rollup driver.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Telemetry,
}

/// Settings of the hierarchical rollup driver.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorConfig {
    /// Fewest workers.
    pub min_workers: usize,
    /// Most workers.
    pub max_workers: usize,
    /// A pass at least this long counts as slow.
    pub slow_pass_millis: u64,
    /// A pass at most this long counts as fast.
    pub fast_pass_millis: u64,
    /// Consecutive slow or fast passes before resizing.
    pub resize_after_passes: u32,
    /// Agents that delivered data within this window are rolled up.
    pub active_window_millis: i64,
    /// Window used on sweep passes.
    pub sweep_window_millis: i64,
    /// Every this many passes is a sweep pass.
    pub sweep_every_passes: u64,
    /// Pass cadence.
    pub pass_interval_millis: i64,
    /// Passes start this long after a cadence boundary.
    pub pass_offset_millis: i64,
    /// A child lagging the most advanced sibling by more than this does not
    /// hold back its group's horizon.
    pub child_lag_tolerance_millis: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            slow_pass_millis: 30_000,
            fast_pass_millis: 5_000,
            resize_after_passes: 3,
            active_window_millis: 7 * 24 * 60 * 60 * 1000,
            sweep_window_millis: 30 * 24 * 60 * 60 * 1000,
            sweep_every_passes: 100,
            pass_interval_millis: 60_000,
            pass_offset_millis: 10_000,
            child_lag_tolerance_millis: 300_000,
        }
    }
}

impl CoordinatorConfig {
    /// Slow pass threshold.
    #[must_use]
    pub fn slow_pass(&self) -> Duration {
        Duration::from_millis(self.slow_pass_millis)
    }

    /// Fast pass threshold.
    #[must_use]
    pub fn fast_pass(&self) -> Duration {
        Duration::from_millis(self.fast_pass_millis)
    }
}

/// Defines the manner of telemetry.
#[derive(Debug, Deserialize, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Address to expose a Prometheus scrape endpoint on, none to disable.
    pub prometheus_addr: Option<SocketAddr>,
}

impl Config {
    /// Parse and validate YAML.
    ///
    /// # Errors
    ///
    /// Returns a parse error or the first validation failure.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns read, parse and validation failures.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check the invariants parsing cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rollup_levels.is_empty() {
            return Err(Error::NoLevels);
        }
        for (level, window) in self.rollup_levels.windows(2).enumerate() {
            let (previous, interval) = (window[0].interval_millis, window[1].interval_millis);
            let extends = interval > previous && (previous == 0 || interval % previous == 0);
            if !extends {
                return Err(Error::Interval {
                    level: level + 1,
                    interval,
                    previous,
                });
            }
        }
        if let Some(level) = self
            .rollup_levels
            .iter()
            .position(|level| level.capped_store_size.as_u64() == 0)
        {
            return Err(Error::ZeroCappedSize(level));
        }
        let (min, max) = (self.coordinator.min_workers, self.coordinator.max_workers);
        if min == 0 || min > max {
            return Err(Error::Workers { min, max });
        }
        Ok(())
    }

    /// Bucket widths in milliseconds, finest first.
    #[must_use]
    pub fn intervals(&self) -> Vec<i64> {
        self.rollup_levels
            .iter()
            .map(|level| i64::try_from(level.interval_millis).unwrap_or(i64::MAX))
            .collect()
    }

    /// Capped store sizes in bytes, finest first.
    #[must_use]
    pub fn capped_store_sizes(&self) -> Vec<u64> {
        self.rollup_levels
            .iter()
            .map(|level| level.capped_store_size.as_u64())
            .collect()
    }

    /// Row truncation limits.
    #[must_use]
    pub fn limits(&self) -> Limits {
        Limits {
            max_query_aggregates: self.max_query_aggregates,
            max_service_call_aggregates: self.max_service_call_aggregates,
        }
    }
}
