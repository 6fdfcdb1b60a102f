//! Record status classification.
//!
//! Every consumer obtains a record's status through [`classify`]; nothing
//! else reads the reconciliation flags to decide what a record is.

use uuid::Uuid;

use crate::record::MirroredRecord;
use crate::types::RecordStatus;

/// Derive a record's change status relative to `current_run`.
///
/// Soft deletion dominates. An explicit `record_status` column wins over the
/// flags; mirrors without that column fall back to the flags, which only
/// count when the record was stamped by `current_run`.
#[must_use]
pub fn classify(record: &MirroredRecord, current_run: Option<Uuid>) -> RecordStatus {
    if record.pending_deletion {
        return RecordStatus::Deleted;
    }

    if let Some(status) = record.record_status {
        return status;
    }

    let stamped_by_current = current_run.is_some() && record.last_sync_id == current_run;

    if record.is_new_record && stamped_by_current {
        RecordStatus::New
    } else if record.was_updated_last_sync && !record.is_new_record && stamped_by_current {
        RecordStatus::Updated
    } else {
        RecordStatus::Unchanged
    }
}

/// A record paired with its computed status.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClassifiedRecord {
    pub status: RecordStatus,
    #[serde(flatten)]
    pub record: MirroredRecord,
}

impl ClassifiedRecord {
    /// Classify a record.
    #[must_use]
    pub fn new(record: MirroredRecord, current_run: Option<Uuid>) -> Self {
        Self {
            status: classify(&record, current_run),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldMap;

    fn record() -> MirroredRecord {
        MirroredRecord::new("1", FieldMap::new())
    }

    #[test]
    fn test_deletion_dominates_every_combination() {
        let run = Uuid::new_v4();
        let statuses = [
            None,
            Some(RecordStatus::New),
            Some(RecordStatus::Updated),
            Some(RecordStatus::Unchanged),
            Some(RecordStatus::Deleted),
        ];

        for bits in 0u8..8 {
            for status in statuses {
                for stamp in [None, Some(run), Some(Uuid::new_v4())] {
                    let mut r = record();
                    r.pending_deletion = true;
                    r.is_new_record = bits & 1 != 0;
                    r.was_updated_last_sync = bits & 2 != 0;
                    r.record_status = status;
                    r.last_sync_id = if bits & 4 != 0 { stamp } else { None };
                    assert_eq!(classify(&r, Some(run)), RecordStatus::Deleted);
                    assert_eq!(classify(&r, None), RecordStatus::Deleted);
                }
            }
        }
    }

    #[test]
    fn test_explicit_status_wins_over_flags() {
        let run = Uuid::new_v4();
        let mut r = record();
        r.is_new_record = true;
        r.last_sync_id = Some(run);
        r.record_status = Some(RecordStatus::Unchanged);
        assert_eq!(classify(&r, Some(run)), RecordStatus::Unchanged);

        r.record_status = Some(RecordStatus::Updated);
        assert_eq!(classify(&r, None), RecordStatus::Updated);
    }

    #[test]
    fn test_flag_fallback_new() {
        let run = Uuid::new_v4();
        let mut r = record();
        r.is_new_record = true;
        r.last_sync_id = Some(run);
        assert_eq!(classify(&r, Some(run)), RecordStatus::New);

        // Stamped by an older run: no longer new.
        assert_eq!(classify(&r, Some(Uuid::new_v4())), RecordStatus::Unchanged);
        assert_eq!(classify(&r, None), RecordStatus::Unchanged);
    }

    #[test]
    fn test_flag_fallback_updated() {
        let run = Uuid::new_v4();
        let mut r = record();
        r.was_updated_last_sync = true;
        r.last_sync_id = Some(run);
        assert_eq!(classify(&r, Some(run)), RecordStatus::Updated);

        r.is_new_record = true;
        assert_eq!(classify(&r, Some(run)), RecordStatus::New);
    }

    #[test]
    fn test_unstamped_record_is_unchanged() {
        let r = record();
        assert_eq!(classify(&r, None), RecordStatus::Unchanged);
        assert_eq!(classify(&r, Some(Uuid::new_v4())), RecordStatus::Unchanged);
    }

    #[test]
    fn test_classified_record_serializes_status() {
        let run = Uuid::new_v4();
        let mut r = record();
        r.pending_deletion = true;
        let classified = ClassifiedRecord::new(r, Some(run));
        let json = serde_json::to_value(&classified).unwrap();
        assert_eq!(json["status"], "deleted");
        assert_eq!(json["key"], "1");
    }
}
