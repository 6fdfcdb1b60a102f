//! Persistence of table definitions, mirror rows, runs and row errors.
//!
//! [`MirrorStore`] is the single seam between the engine and storage.
//! Mutual exclusion lives here: `begin_run` refuses to create a run while
//! another one is active for the table, and `finalize_run` only finalizes an
//! active run.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MirrorResult;
use crate::record::{MirrorSchema, MirroredRecord};
use crate::run::{RowError, RunCounts, RunOutcome, SyncRun};
use crate::table::SourceTableConfig;

pub use memory::InMemoryStore;
pub use postgres::PgMirrorStore;

/// Storage backend of the mirror engine.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    // ---- table definitions ----

    /// Insert a new table definition.
    async fn insert_table(&self, table: &SourceTableConfig) -> MirrorResult<()>;

    /// Replace a table definition. Returns false when it does not exist.
    async fn update_table(&self, table: &SourceTableConfig) -> MirrorResult<bool>;

    /// Delete a table definition. Returns false when it does not exist.
    async fn delete_table(&self, table_id: Uuid) -> MirrorResult<bool>;

    /// Get a table definition.
    async fn get_table(&self, table_id: Uuid) -> MirrorResult<Option<SourceTableConfig>>;

    /// List all table definitions ordered by source table name.
    async fn list_tables(&self) -> MirrorResult<Vec<SourceTableConfig>>;

    /// Store the computed next due time.
    async fn set_next_due(&self, table_id: Uuid, next_due_at: Option<DateTime<Utc>>) -> MirrorResult<()>;

    // ---- mirror tables ----

    /// Create the mirror table if it does not exist.
    async fn create_mirror_table(&self, mirror: &str) -> MirrorResult<MirrorSchema>;

    /// Inspect the mirror table's reconciliation columns.
    async fn mirror_schema(&self, mirror: &str) -> MirrorResult<MirrorSchema>;

    /// Add missing soft-delete columns. Returns the columns added.
    async fn add_soft_delete_columns(&self, mirror: &str) -> MirrorResult<Vec<String>>;

    /// Remove every row of the mirror. Returns the number removed.
    async fn truncate_mirror(&self, mirror: &str) -> MirrorResult<u64>;

    // ---- mirror rows ----

    /// Get the rows with the given keys (missing keys are skipped).
    async fn get_records(&self, mirror: &str, keys: &[String]) -> MirrorResult<Vec<MirroredRecord>>;

    /// Insert or replace rows by key.
    async fn upsert_records(&self, mirror: &str, records: &[MirroredRecord]) -> MirrorResult<u64>;

    /// All rows ordered by key.
    async fn all_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>>;

    /// Keys of rows not flagged `pending_deletion`.
    async fn live_keys(&self, mirror: &str) -> MirrorResult<Vec<String>>;

    /// Rows flagged `pending_deletion`, ordered by key.
    async fn deleted_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>>;

    /// Physically remove rows flagged `pending_deletion`.
    async fn purge_deleted(&self, mirror: &str) -> MirrorResult<u64>;

    /// Settle the explicit status of live rows the previous run created or
    /// updated to `unchanged`. Returns the number of rows settled.
    async fn reset_statuses(&self, mirror: &str) -> MirrorResult<u64>;

    /// Count rows stamped by a run, by the flags they carry.
    async fn count_stamped(&self, mirror: &str, run_id: Uuid) -> MirrorResult<RunCounts>;

    // ---- runs ----

    /// Create a run unless the table already has an active one.
    ///
    /// Fails with `ConcurrencyConflict` naming the active run.
    async fn begin_run(&self, run: &SyncRun) -> MirrorResult<SyncRun>;

    /// Move a pending run to running. Returns false when it is not pending.
    async fn mark_running(&self, run_id: Uuid) -> MirrorResult<bool>;

    /// Store progress counts and a heartbeat. Returns false when the run is
    /// no longer active.
    async fn record_progress(
        &self,
        run_id: Uuid,
        counts: &RunCounts,
        at: DateTime<Utc>,
    ) -> MirrorResult<bool>;

    /// Finalize an active run. Returns `None` when the run was already
    /// finalized, leaving it untouched.
    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> MirrorResult<Option<SyncRun>>;

    /// Get a run.
    async fn get_run(&self, run_id: Uuid) -> MirrorResult<Option<SyncRun>>;

    /// The table's pending or running run, if any.
    async fn active_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>>;

    /// The table's most recently started run.
    async fn latest_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>>;

    /// The most recent completed run that fetched from the ERP.
    async fn last_successful_remote_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>>;

    /// Runs of a table, newest first.
    async fn list_runs(&self, table_id: Uuid, limit: usize) -> MirrorResult<Vec<SyncRun>>;

    // ---- row errors ----

    /// Persist row errors.
    async fn record_errors(&self, errors: &[RowError]) -> MirrorResult<()>;

    /// Row errors of a table, optionally limited to one run, oldest first.
    async fn list_errors(&self, table_id: Uuid, run_id: Option<Uuid>) -> MirrorResult<Vec<RowError>>;
}
