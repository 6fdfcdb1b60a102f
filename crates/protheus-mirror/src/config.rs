//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::env;

use crate::types::RunScope;

/// Configuration for the synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Records fetched and written per batch. Cancellation is checked between batches.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Elapsed seconds after which a running run is flagged long-running.
    #[serde(default = "default_long_running_threshold_secs")]
    pub long_running_threshold_secs: u64,
    /// Seconds without a heartbeat after which a running run is flagged stalled.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Maximum rows accepted by a single CSV import.
    #[serde(default = "default_csv_max_rows")]
    pub csv_max_rows: usize,
    /// Scope used by scheduled runs.
    #[serde(default = "default_scheduled_scope")]
    pub scheduled_scope: RunScope,
}

fn default_batch_size() -> usize {
    500
}

fn default_long_running_threshold_secs() -> u64 {
    600
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_csv_max_rows() -> usize {
    10_000
}

fn default_scheduled_scope() -> RunScope {
    RunScope::Incremental
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            long_running_threshold_secs: default_long_running_threshold_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            csv_max_rows: default_csv_max_rows(),
            scheduled_scope: default_scheduled_scope(),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from environment variables.
    ///
    /// - `MIRROR_BATCH_SIZE` (default 500, minimum 1)
    /// - `MIRROR_LONG_RUNNING_SECS` (default 600)
    /// - `MIRROR_STALL_SECS` (default 300)
    /// - `MIRROR_CSV_MAX_ROWS` (default 10000)
    /// - `MIRROR_SCHEDULED_SCOPE`: `incremental` or `full` (default incremental)
    #[must_use]
    pub fn from_env() -> Self {
        let batch_size = env::var("MIRROR_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(default_batch_size)
            .max(1);

        let long_running_threshold_secs = env::var("MIRROR_LONG_RUNNING_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_long_running_threshold_secs);

        let stall_threshold_secs = env::var("MIRROR_STALL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_stall_threshold_secs);

        let csv_max_rows = env::var("MIRROR_CSV_MAX_ROWS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_csv_max_rows);

        let scheduled_scope = env::var("MIRROR_SCHEDULED_SCOPE")
            .ok()
            .and_then(|s| s.parse::<RunScope>().ok())
            .filter(|scope| matches!(scope, RunScope::Incremental | RunScope::Full))
            .unwrap_or_else(default_scheduled_scope);

        Self {
            batch_size,
            long_running_threshold_secs,
            stall_threshold_secs,
            csv_max_rows,
            scheduled_scope,
        }
    }

    /// Long-running threshold as a chrono duration.
    #[must_use]
    pub fn long_running_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.long_running_threshold_secs).unwrap_or(i64::MAX))
    }

    /// Stall threshold as a chrono duration.
    #[must_use]
    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stall_threshold_secs).unwrap_or(i64::MAX))
    }
}
