//! CSV export of mirror rows. Read-only.

use std::collections::BTreeSet;
use std::io::Write;
use uuid::Uuid;

use crate::classifier::ClassifiedRecord;
use crate::error::{MirrorError, MirrorResult};
use crate::query::RecordQuery;
use crate::record::RECORD_STATUS_COLUMN;

/// Which rows to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    All,
    /// Rows matching a listing query, all pages.
    Filtered(RecordQuery),
    /// Rows the latest run created, updated or deleted.
    ChangesSinceLastSync,
}

impl ExportScope {
    /// Query selecting the scope's rows, in key order.
    #[must_use]
    pub fn query(&self) -> RecordQuery {
        match self {
            ExportScope::All | ExportScope::ChangesSinceLastSync => RecordQuery::default(),
            ExportScope::Filtered(query) => query.clone(),
        }
    }

    /// Whether a classified row belongs to the export.
    ///
    /// A change counts only when `current_run` stamped the row; rows
    /// soft-deleted by earlier runs stay `deleted` but are not exported.
    #[must_use]
    pub fn includes(&self, record: &ClassifiedRecord, current_run: Option<Uuid>) -> bool {
        match self {
            ExportScope::ChangesSinceLastSync => {
                record.status.is_change()
                    && current_run.is_some()
                    && record.record.last_sync_id == current_run
            }
            _ => true,
        }
    }
}

/// Write rows as CSV: `record_key`, `record_status`, then business fields by name.
///
/// Returns the number of data rows written.
pub fn write_csv<W: Write>(writer: W, records: &[ClassifiedRecord]) -> MirrorResult<usize> {
    let fields: BTreeSet<&str> = records
        .iter()
        .flat_map(|c| c.record.data.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["record_key", RECORD_STATUS_COLUMN];
    header.extend(fields.iter().copied());
    wtr.write_record(&header)?;

    for classified in records {
        let mut row = Vec::with_capacity(header.len());
        row.push(classified.record.key.clone());
        row.push(classified.status.to_string());
        for field in &fields {
            row.push(classified.record.field_text(field).unwrap_or_default());
        }
        wtr.write_record(&row)?;
    }

    wtr.flush()
        .map_err(|e| MirrorError::internal(format!("failed to write export: {e}")))?;
    Ok(records.len())
}

/// Render rows as a CSV string.
pub fn to_csv_string(records: &[ClassifiedRecord]) -> MirrorResult<String> {
    let mut buffer = Vec::new();
    write_csv(&mut buffer, records)?;
    String::from_utf8(buffer).map_err(|e| MirrorError::internal(format!("export is not UTF-8: {e}")))
}
