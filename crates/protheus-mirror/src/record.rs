//! Mirrored records and mirror table schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::RecordStatus;

/// Business columns of a record, keyed by ERP field name.
pub type FieldMap = Map<String, Value>;

/// Columns that implement soft deletion on a mirror table.
pub const SOFT_DELETE_COLUMNS: &[&str] = &["pending_deletion", "deleted_at"];

/// Optional column holding an explicit record status.
pub const RECORD_STATUS_COLUMN: &str = "record_status";

/// One source record copied into the mirror, plus reconciliation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirroredRecord {
    /// Key derived from the table's key fields.
    pub key: String,
    /// Business columns.
    pub data: FieldMap,
    /// Content fingerprint of the last observed values.
    pub record_hash: Option<String>,
    /// Inserted by the run in `last_sync_id`.
    pub is_new_record: bool,
    /// Changed by the run in `last_sync_id`.
    pub was_updated_last_sync: bool,
    /// Run that last touched this record.
    pub last_sync_id: Option<Uuid>,
    /// Soft-delete marker.
    pub pending_deletion: bool,
    /// When the record was soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Explicit status, only on mirrors that carry the column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_status: Option<RecordStatus>,
    /// When the record was last written by a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl MirroredRecord {
    /// Create a record with cleared reconciliation flags.
    #[must_use]
    pub fn new(key: impl Into<String>, data: FieldMap) -> Self {
        Self {
            key: key.into(),
            data,
            record_hash: None,
            is_new_record: false,
            was_updated_last_sync: false,
            last_sync_id: None,
            pending_deletion: false,
            deleted_at: None,
            record_status: None,
            synced_at: None,
        }
    }

    /// Flags that contradict each other: a deleted record cannot be new.
    #[must_use]
    pub fn has_contradictory_flags(&self) -> bool {
        self.pending_deletion && self.is_new_record
    }

    /// Value of a business field rendered as text, for filtering and export.
    #[must_use]
    pub fn field_text(&self, field: &str) -> Option<String> {
        self.data.get(field).map(value_text)
    }
}

/// Render a JSON value as plain text (strings unquoted, null empty).
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reconciliation capabilities of a mirror table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSchema {
    /// Mirror table name.
    pub mirror_table: String,
    /// Whether the table exists.
    pub exists: bool,
    /// Soft-delete columns that are absent.
    pub missing_soft_delete_columns: Vec<String>,
    /// Whether the explicit `record_status` column exists.
    pub has_record_status: bool,
}

impl MirrorSchema {
    /// Schema of a freshly created mirror.
    #[must_use]
    pub fn current(mirror_table: impl Into<String>) -> Self {
        Self {
            mirror_table: mirror_table.into(),
            exists: true,
            missing_soft_delete_columns: Vec::new(),
            has_record_status: true,
        }
    }

    /// Schema of a mirror that has not been created yet.
    #[must_use]
    pub fn absent(mirror_table: impl Into<String>) -> Self {
        Self {
            mirror_table: mirror_table.into(),
            exists: false,
            missing_soft_delete_columns: SOFT_DELETE_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
            has_record_status: false,
        }
    }

    /// Whether soft deletion is possible on this mirror.
    #[must_use]
    pub fn supports_soft_delete(&self) -> bool {
        self.exists && self.missing_soft_delete_columns.is_empty()
    }
}
