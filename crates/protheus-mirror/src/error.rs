//! Mirror engine error types.
//!
//! Errors are split into run-level failures (abort the run, mark it failed)
//! and row-level failures (captured per record, the run continues).

use thiserror::Error;
use uuid::Uuid;

use crate::source::SourceError;

/// Errors that can occur in the synchronization engine.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The ERP source is unreachable. Safe to retry.
    #[error("ERP connectivity error: {message}")]
    Connectivity { message: String },

    /// A single record could not be mapped into the mirror.
    #[error("Row transform error for record {key:?}: {message}")]
    RowTransform { key: Option<String>, message: String },

    /// The mirror table lacks reconciliation columns.
    #[error("Schema drift on mirror {mirror_table}: missing columns {missing_columns:?}")]
    SchemaDrift {
        mirror_table: String,
        missing_columns: Vec<String>,
    },

    /// A run is already active for the table.
    #[error("Sync already active for table {table_id}: run {run_id}")]
    ConcurrencyConflict { table_id: Uuid, run_id: Uuid },

    /// A run is recorded as active but no process owns it.
    #[error("Run {run_id} for table {table_id} is orphaned and must be finalized")]
    OrphanedRun { table_id: Uuid, run_id: Uuid },

    /// The table has no pending or running run.
    #[error("No active run for table {table_id}")]
    NoActiveRun { table_id: Uuid },

    /// Source table configuration not found.
    #[error("Source table not found: {0}")]
    TableNotFound(Uuid),

    /// Sync run not found.
    #[error("Sync run not found: {0}")]
    RunNotFound(Uuid),

    /// Mirrored record not found.
    #[error("Record {key} not found in table {table_id}")]
    RecordNotFound { table_id: Uuid, key: String },

    /// The table is linked outside Protheus and cannot be deleted.
    #[error("Table {table_id} is linked outside Protheus and cannot be deleted")]
    Protected { table_id: Uuid },

    /// Invalid run state for the requested transition.
    #[error("Invalid state for run {run_id}: expected {expected}, got {actual}")]
    InvalidState {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    /// Invalid table or engine configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Non-connectivity failure reported by the ERP source.
    #[error("Source error: {message}")]
    Source { message: String },

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// CSV parsing or writing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MirrorError {
    /// Create a connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Create a row transform error.
    pub fn row_transform(key: Option<String>, message: impl Into<String>) -> Self {
        Self::RowTransform {
            key,
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the failed operation can simply be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Database(_))
    }

    /// Row-level errors never fail a whole run.
    #[must_use]
    pub fn is_row_level(&self) -> bool {
        matches!(self, Self::RowTransform { .. })
    }

    /// Check if this error is a mutual-exclusion rejection.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::OrphanedRun { .. }
        )
    }
}

impl From<SourceError> for MirrorError {
    fn from(err: SourceError) -> Self {
        if err.is_connectivity() {
            Self::Connectivity {
                message: err.to_string(),
            }
        } else {
            Self::Source {
                message: err.to_string(),
            }
        }
    }
}

/// Result type for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
