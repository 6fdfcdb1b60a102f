//! Per-record write rules.
//!
//! The executor, the CSV reconciler, the archive and the repairer all mutate
//! mirror rows through these functions, so a record ends up with the same
//! flags whichever path touched it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::record::{FieldMap, MirrorSchema, MirroredRecord};
use crate::types::RecordStatus;

/// A record as observed in the source (or a CSV row), already fingerprinted.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub data: FieldMap,
    pub hash: String,
}

/// What applying an observation did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No mirror row existed.
    Created,
    /// The stored hash differed.
    Updated,
    /// A soft-deleted row was seen again.
    Revived,
    /// Nothing changed.
    Unchanged,
}

impl WriteOutcome {
    /// Status the record carries after this outcome.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        match self {
            WriteOutcome::Created => RecordStatus::New,
            WriteOutcome::Updated | WriteOutcome::Revived => RecordStatus::Updated,
            WriteOutcome::Unchanged => RecordStatus::Unchanged,
        }
    }
}

fn explicit(schema: &MirrorSchema, status: RecordStatus) -> Option<RecordStatus> {
    schema.has_record_status.then_some(status)
}

/// Apply an observed record to its mirror row (if any).
///
/// Always returns the row to write: every observed row is stamped with the
/// run id, unchanged ones included.
#[must_use]
pub fn apply_observation(
    existing: Option<&MirroredRecord>,
    observed: Observation,
    run_id: Uuid,
    schema: &MirrorSchema,
    now: DateTime<Utc>,
) -> (MirroredRecord, WriteOutcome) {
    let Some(existing) = existing else {
        let mut record = MirroredRecord::new(observed.key, observed.data);
        record.record_hash = Some(observed.hash);
        record.is_new_record = true;
        record.last_sync_id = Some(run_id);
        record.record_status = explicit(schema, RecordStatus::New);
        record.synced_at = Some(now);
        return (record, WriteOutcome::Created);
    };

    let same_content = match existing.record_hash.as_deref() {
        Some(hash) => hash == observed.hash,
        // Rows written before hashing existed: compare the stored values.
        None => existing.data == observed.data,
    };

    let outcome = if existing.pending_deletion {
        WriteOutcome::Revived
    } else if same_content {
        WriteOutcome::Unchanged
    } else {
        WriteOutcome::Updated
    };

    let mut record = existing.clone();
    record.data = observed.data;
    record.record_hash = Some(observed.hash);
    record.is_new_record = false;
    record.was_updated_last_sync = outcome != WriteOutcome::Unchanged;
    record.pending_deletion = false;
    record.deleted_at = None;
    record.last_sync_id = Some(run_id);
    record.record_status = explicit(schema, outcome.status());
    record.synced_at = Some(now);
    (record, outcome)
}

/// Soft-delete a row absent from a complete remote fetch.
///
/// Returns `None` when the row is already soft-deleted.
#[must_use]
pub fn soft_delete(
    existing: &MirroredRecord,
    run_id: Uuid,
    schema: &MirrorSchema,
    now: DateTime<Utc>,
) -> Option<MirroredRecord> {
    if existing.pending_deletion {
        return None;
    }
    let mut record = existing.clone();
    record.pending_deletion = true;
    record.deleted_at = Some(now);
    record.is_new_record = false;
    record.was_updated_last_sync = false;
    record.last_sync_id = Some(run_id);
    record.record_status = explicit(schema, RecordStatus::Deleted);
    record.synced_at = Some(now);
    Some(record)
}

/// Restore a soft-deleted row so it classifies as updated, never new.
#[must_use]
pub fn restore(
    existing: &MirroredRecord,
    run_id: Uuid,
    schema: &MirrorSchema,
    now: DateTime<Utc>,
) -> MirroredRecord {
    let mut record = existing.clone();
    record.pending_deletion = false;
    record.deleted_at = None;
    record.is_new_record = false;
    record.was_updated_last_sync = true;
    record.last_sync_id = Some(run_id);
    record.record_status = explicit(schema, RecordStatus::Updated);
    record.synced_at = Some(now);
    record
}

/// Settle a live row's explicit status before a new run writes.
///
/// What the previous run created or updated is unchanged relative to the
/// new one. Returns `None` when there is nothing to settle: no status
/// column, a soft-deleted row, or a status that is not a live change.
#[must_use]
pub fn reset_status(existing: &MirroredRecord, schema: &MirrorSchema) -> Option<MirroredRecord> {
    if !schema.has_record_status || existing.pending_deletion {
        return None;
    }
    if !matches!(
        existing.record_status,
        Some(RecordStatus::New | RecordStatus::Updated)
    ) {
        return None;
    }
    let mut record = existing.clone();
    record.record_status = Some(RecordStatus::Unchanged);
    Some(record)
}

/// Normalize contradictory flags; deletion wins.
///
/// Returns `None` when the row is consistent. Touches only flags, never the
/// run stamp, so repeated repairs converge.
#[must_use]
pub fn normalize_flags(existing: &MirroredRecord, schema: &MirrorSchema) -> Option<MirroredRecord> {
    let stale_status = existing.pending_deletion
        && schema.has_record_status
        && existing.record_status != Some(RecordStatus::Deleted);

    if !existing.has_contradictory_flags() && !stale_status {
        return None;
    }

    let mut record = existing.clone();
    record.is_new_record = false;
    record.was_updated_last_sync = false;
    if schema.has_record_status {
        record.record_status = Some(RecordStatus::Deleted);
    }
    Some(record)
}
