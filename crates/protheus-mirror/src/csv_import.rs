//! CSV reconciler.
//!
//! Applies operator-supplied rows through the same write rules as an
//! incremental sync, under a `manual_import` run. Rows missing from the file
//! are left alone: an import corrects or adds, it never deletes.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::fingerprint::{record_key, Fingerprinter};
use crate::record::{FieldMap, MirrorSchema, MirroredRecord, RECORD_STATUS_COLUMN, SOFT_DELETE_COLUMNS};
use crate::run::{RowError, RowErrorKind, RunCounts, SyncRun};
use crate::store::MirrorStore;
use crate::sync::{apply_observation, begin_local_run, ensure_mirror, finish_local_run, Observation, WriteOutcome};
use crate::table::SourceTableConfig;
use crate::types::{RunScope, TriggerType};

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Export columns that are not business fields.
const RECONCILIATION_COLUMNS: &[&str] = &[
    "record_key",
    RECORD_STATUS_COLUMN,
    "record_hash",
    "is_new_record",
    "was_updated_last_sync",
    "last_sync_id",
    "synced_at",
];

/// One data row of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    /// 1-based line number (header = 1, first data row = 2).
    pub line_number: usize,
    pub fields: HashMap<String, String>,
}

/// Parse a CSV file with a header row.
///
/// Reconciliation columns are dropped so an export can be fed back as is.
pub fn parse_csv(data: &[u8], max_rows: usize) -> MirrorResult<Vec<CsvRow>> {
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(MirrorError::invalid_config("CSV file is empty"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(data);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().any(String::is_empty) {
        return Err(MirrorError::invalid_config("CSV header contains an empty column name"));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        if index >= max_rows {
            return Err(MirrorError::invalid_config(format!(
                "CSV file exceeds the maximum of {max_rows} rows"
            )));
        }
        let record = record?;
        let fields = headers
            .iter()
            .zip(record.iter())
            .filter(|(name, _)| !is_reconciliation_column(name))
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        rows.push(CsvRow {
            line_number: index + 2,
            fields,
        });
    }
    Ok(rows)
}

fn is_reconciliation_column(name: &str) -> bool {
    RECONCILIATION_COLUMNS.contains(&name) || SOFT_DELETE_COLUMNS.contains(&name)
}

/// Convert a cell to the JSON type the mirror already holds for that field.
///
/// Cells are text; typing them like the stored value lets an unchanged row
/// fingerprint identically.
#[must_use]
pub fn coerce(cell: &str, existing: Option<&Value>) -> Value {
    match existing {
        Some(Value::Number(_)) => {
            let trimmed = cell.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Value::from(n);
            }
            if let Some(n) = trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                return Value::Number(n);
            }
        }
        Some(Value::Bool(_)) => match cell.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => return Value::Bool(true),
            "false" | "f" | "0" => return Value::Bool(false),
            _ => {}
        },
        Some(Value::Null) if cell.is_empty() => return Value::Null,
        _ => {}
    }
    Value::String(cell.to_string())
}

/// Imports CSV rows into a mirror.
pub struct CsvReconciler {
    store: Arc<dyn MirrorStore>,
    config: EngineConfig,
}

impl CsvReconciler {
    /// Create a new reconciler.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Parse and import a CSV file.
    pub async fn import_csv(
        &self,
        table: &SourceTableConfig,
        data: &[u8],
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        let rows = parse_csv(data, self.config.csv_max_rows)?;
        self.import_rows(table, rows, triggered_by).await
    }

    /// Import already parsed rows.
    #[instrument(skip(self, table, rows, triggered_by), fields(table_id = %table.id, rows = rows.len()))]
    pub async fn import_rows(
        &self,
        table: &SourceTableConfig,
        rows: Vec<CsvRow>,
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        if rows.len() > self.config.csv_max_rows {
            return Err(MirrorError::invalid_config(format!(
                "CSV import exceeds the maximum of {} rows",
                self.config.csv_max_rows
            )));
        }

        let (table, schema) = ensure_mirror(self.store.as_ref(), table).await?;

        // Fingerprint the way the last sync did, so untouched rows stay unchanged.
        let excluded = self
            .store
            .last_successful_remote_run(table.id)
            .await?
            .map(|run| run.excluded_binary_fields)
            .unwrap_or_default();
        let fingerprinter = Fingerprinter::new(excluded);

        let run = begin_local_run(
            self.store.as_ref(),
            SyncRun::new(table.id, TriggerType::ManualImport, RunScope::Import).triggered_by(triggered_by),
        )
        .await?;

        let mut counts = RunCounts::default();
        let result = async {
            self.store.reset_statuses(&schema.mirror_table).await?;
            for chunk in rows.chunks(self.config.batch_size.max(1)) {
                self.apply_chunk(&table, &schema, &run, &fingerprinter, chunk, &mut counts)
                    .await?;
                if !self.store.record_progress(run.id, &counts, Utc::now()).await? {
                    warn!(run_id = %run.id, "Import run finalized elsewhere, stopping");
                    break;
                }
            }
            Ok::<_, MirrorError>(counts)
        }
        .await;

        let run = finish_local_run(self.store.as_ref(), &run, result).await?;
        info!(
            table_id = %table.id,
            run_id = %run.id,
            created = run.counts.created,
            updated = run.counts.updated,
            unchanged = run.counts.unchanged,
            failed = run.counts.failed,
            "CSV import finished"
        );
        Ok(run)
    }

    async fn apply_chunk(
        &self,
        table: &SourceTableConfig,
        schema: &MirrorSchema,
        run: &SyncRun,
        fingerprinter: &Fingerprinter,
        rows: &[CsvRow],
        counts: &mut RunCounts,
    ) -> MirrorResult<()> {
        let mirror = &schema.mirror_table;
        let mut errors = Vec::new();

        // Keys first, from the raw cells.
        let mut keyed: Vec<(String, &CsvRow)> = Vec::with_capacity(rows.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let raw: FieldMap = row
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            match record_key(&raw, &table.key_fields) {
                Ok(key) => match positions.get(&key) {
                    Some(&i) => keyed[i].1 = row,
                    None => {
                        positions.insert(key.clone(), keyed.len());
                        keyed.push((key, row));
                    }
                },
                Err(e) => {
                    counts.failed += 1;
                    errors.push(RowError::new(
                        run,
                        None,
                        RowErrorKind::Transform,
                        format!("line {}: {e}", row.line_number),
                    ));
                }
            }
        }

        let keys: Vec<String> = keyed.iter().map(|(k, _)| k.clone()).collect();
        let current: HashMap<String, MirroredRecord> = self
            .store
            .get_records(mirror, &keys)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let now = Utc::now();
        let mut writes = Vec::with_capacity(keyed.len());
        for (key, row) in keyed {
            let existing = current.get(&key);
            let mut data = existing.map(|r| r.data.clone()).unwrap_or_default();
            for (field, cell) in &row.fields {
                let value = coerce(cell, data.get(field));
                data.insert(field.clone(), value);
            }
            let hash = fingerprinter.fingerprint(&data);

            let (record, outcome) =
                apply_observation(existing, Observation { key, data, hash }, run.id, schema, now);
            match outcome {
                WriteOutcome::Created => counts.created += 1,
                WriteOutcome::Updated | WriteOutcome::Revived => counts.updated += 1,
                WriteOutcome::Unchanged => counts.unchanged += 1,
            }
            writes.push(record);
        }

        self.store.upsert_records(mirror, &writes).await?;
        self.store.record_errors(&errors).await?;
        debug!(run_id = %run.id, written = writes.len(), failed = errors.len(), "Applied CSV rows");
        Ok(())
    }
}
