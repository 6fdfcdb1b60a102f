//! In-memory store.
//!
//! Same semantics as the PostgreSQL store, kept behind one lock so
//! check-and-insert of runs is atomic. Mirrors can be created with a legacy
//! schema to exercise the repair paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::MirrorStore;
use crate::error::{MirrorError, MirrorResult};
use crate::record::{MirrorSchema, MirroredRecord, SOFT_DELETE_COLUMNS};
use crate::run::{RowError, RunCounts, RunOutcome, SyncRun};
use crate::sync::reset_status;
use crate::table::SourceTableConfig;
use crate::types::RunState;

#[derive(Debug)]
struct MirrorTable {
    schema: MirrorSchema,
    rows: BTreeMap<String, MirroredRecord>,
}

impl MirrorTable {
    /// Drop values the schema has no column for.
    fn fit(&self, mut record: MirroredRecord) -> MirroredRecord {
        if !self.schema.supports_soft_delete() {
            record.pending_deletion = false;
            record.deleted_at = None;
        }
        if !self.schema.has_record_status {
            record.record_status = None;
        }
        record
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<Uuid, SourceTableConfig>,
    mirrors: HashMap<String, MirrorTable>,
    /// Insertion order is start order.
    runs: Vec<SyncRun>,
    errors: Vec<RowError>,
}

impl Inner {
    fn mirror(&self, mirror: &str) -> MirrorResult<&MirrorTable> {
        self.mirrors
            .get(mirror)
            .ok_or_else(|| MirrorError::internal(format!("mirror table {mirror} does not exist")))
    }

    fn mirror_mut(&mut self, mirror: &str) -> MirrorResult<&mut MirrorTable> {
        self.mirrors
            .get_mut(mirror)
            .ok_or_else(|| MirrorError::internal(format!("mirror table {mirror} does not exist")))
    }

    fn active_run(&self, table_id: Uuid) -> Option<&SyncRun> {
        self.runs
            .iter()
            .rev()
            .find(|r| r.table_id == table_id && r.is_active())
    }
}

/// [`MirrorStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mirror with an older schema.
    pub async fn create_legacy_mirror(&self, mirror: &str, soft_delete: bool, record_status: bool) {
        let mut schema = MirrorSchema::current(mirror);
        if !soft_delete {
            schema.missing_soft_delete_columns =
                SOFT_DELETE_COLUMNS.iter().map(|c| (*c).to_string()).collect();
        }
        schema.has_record_status = record_status;

        self.inner.write().await.mirrors.insert(
            mirror.to_string(),
            MirrorTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Write rows directly, bypassing the engine.
    pub async fn seed_records(&self, mirror: &str, records: Vec<MirroredRecord>) -> MirrorResult<()> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        for record in records {
            table.rows.insert(record.key.clone(), record);
        }
        Ok(())
    }

    /// Number of rows in a mirror, soft-deleted ones included.
    pub async fn row_count(&self, mirror: &str) -> usize {
        self.inner
            .read()
            .await
            .mirrors
            .get(mirror)
            .map_or(0, |t| t.rows.len())
    }
}

#[async_trait]
impl MirrorStore for InMemoryStore {
    async fn insert_table(&self, table: &SourceTableConfig) -> MirrorResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .tables
            .values()
            .any(|t| t.source_table.eq_ignore_ascii_case(&table.source_table))
        {
            return Err(MirrorError::invalid_config(format!(
                "source table {} is already configured",
                table.source_table
            )));
        }
        inner.tables.insert(table.id, table.clone());
        Ok(())
    }

    async fn update_table(&self, table: &SourceTableConfig) -> MirrorResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.tables.get_mut(&table.id) {
            Some(existing) => {
                *existing = table.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_table(&self, table_id: Uuid) -> MirrorResult<bool> {
        Ok(self.inner.write().await.tables.remove(&table_id).is_some())
    }

    async fn get_table(&self, table_id: Uuid) -> MirrorResult<Option<SourceTableConfig>> {
        Ok(self.inner.read().await.tables.get(&table_id).cloned())
    }

    async fn list_tables(&self) -> MirrorResult<Vec<SourceTableConfig>> {
        let mut tables: Vec<_> = self.inner.read().await.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.source_table.cmp(&b.source_table));
        Ok(tables)
    }

    async fn set_next_due(&self, table_id: Uuid, next_due_at: Option<DateTime<Utc>>) -> MirrorResult<()> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(&table_id)
            .ok_or(MirrorError::TableNotFound(table_id))?;
        table.next_due_at = next_due_at;
        Ok(())
    }

    async fn create_mirror_table(&self, mirror: &str) -> MirrorResult<MirrorSchema> {
        let mut inner = self.inner.write().await;
        let table = inner
            .mirrors
            .entry(mirror.to_string())
            .or_insert_with(|| MirrorTable {
                schema: MirrorSchema::current(mirror),
                rows: BTreeMap::new(),
            });
        Ok(table.schema.clone())
    }

    async fn mirror_schema(&self, mirror: &str) -> MirrorResult<MirrorSchema> {
        Ok(self
            .inner
            .read()
            .await
            .mirrors
            .get(mirror)
            .map_or_else(|| MirrorSchema::absent(mirror), |t| t.schema.clone()))
    }

    async fn add_soft_delete_columns(&self, mirror: &str) -> MirrorResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        Ok(std::mem::take(&mut table.schema.missing_soft_delete_columns))
    }

    async fn truncate_mirror(&self, mirror: &str) -> MirrorResult<u64> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        let removed = table.rows.len() as u64;
        table.rows.clear();
        Ok(removed)
    }

    async fn get_records(&self, mirror: &str, keys: &[String]) -> MirrorResult<Vec<MirroredRecord>> {
        let inner = self.inner.read().await;
        let table = inner.mirror(mirror)?;
        Ok(keys.iter().filter_map(|k| table.rows.get(k).cloned()).collect())
    }

    async fn upsert_records(&self, mirror: &str, records: &[MirroredRecord]) -> MirrorResult<u64> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        for record in records {
            let fitted = table.fit(record.clone());
            table.rows.insert(fitted.key.clone(), fitted);
        }
        Ok(records.len() as u64)
    }

    async fn all_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.mirror(mirror)?.rows.values().cloned().collect())
    }

    async fn live_keys(&self, mirror: &str) -> MirrorResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mirror(mirror)?
            .rows
            .values()
            .filter(|r| !r.pending_deletion)
            .map(|r| r.key.clone())
            .collect())
    }

    async fn deleted_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mirror(mirror)?
            .rows
            .values()
            .filter(|r| r.pending_deletion)
            .cloned()
            .collect())
    }

    async fn purge_deleted(&self, mirror: &str) -> MirrorResult<u64> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        let before = table.rows.len();
        table.rows.retain(|_, r| !r.pending_deletion);
        Ok((before - table.rows.len()) as u64)
    }

    async fn reset_statuses(&self, mirror: &str) -> MirrorResult<u64> {
        let mut inner = self.inner.write().await;
        let table = inner.mirror_mut(mirror)?;
        let settled: Vec<MirroredRecord> = table
            .rows
            .values()
            .filter_map(|record| reset_status(record, &table.schema))
            .collect();
        for record in &settled {
            table.rows.insert(record.key.clone(), record.clone());
        }
        Ok(settled.len() as u64)
    }

    async fn count_stamped(&self, mirror: &str, run_id: Uuid) -> MirrorResult<RunCounts> {
        let inner = self.inner.read().await;
        let mut counts = RunCounts::default();
        for record in inner
            .mirror(mirror)?
            .rows
            .values()
            .filter(|r| r.last_sync_id == Some(run_id))
        {
            if record.pending_deletion {
                counts.deleted += 1;
            } else if record.is_new_record {
                counts.created += 1;
            } else if record.was_updated_last_sync {
                counts.updated += 1;
            } else {
                counts.unchanged += 1;
            }
        }
        Ok(counts)
    }

    async fn begin_run(&self, run: &SyncRun) -> MirrorResult<SyncRun> {
        let mut inner = self.inner.write().await;
        if let Some(active) = inner.active_run(run.table_id) {
            return Err(MirrorError::ConcurrencyConflict {
                table_id: run.table_id,
                run_id: active.id,
            });
        }
        inner.runs.push(run.clone());
        Ok(run.clone())
    }

    async fn mark_running(&self, run_id: Uuid) -> MirrorResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.runs.iter_mut().find(|r| r.id == run_id) {
            Some(run) if run.state == RunState::Pending => {
                run.state = RunState::Running;
                run.last_heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        run_id: Uuid,
        counts: &RunCounts,
        at: DateTime<Utc>,
    ) -> MirrorResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.runs.iter_mut().find(|r| r.id == run_id) {
            Some(run) if run.is_active() => {
                run.counts = *counts;
                run.last_heartbeat_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> MirrorResult<Option<SyncRun>> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(MirrorError::RunNotFound(run_id))?;

        if !run.is_active() {
            return Ok(None);
        }

        run.state = outcome.state;
        run.counts = outcome.counts;
        run.excluded_binary_fields = outcome.excluded_binary_fields.clone();
        run.error_message = outcome.error_message.clone();
        run.finished_at = Some(Utc::now());
        Ok(Some(run.clone()))
    }

    async fn get_run(&self, run_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned())
    }

    async fn active_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        Ok(self.inner.read().await.active_run(table_id).cloned())
    }

    async fn latest_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .rev()
            .find(|r| r.table_id == table_id)
            .cloned())
    }

    async fn last_successful_remote_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .rev()
            .find(|r| r.table_id == table_id && r.is_successful_remote_run())
            .cloned())
    }

    async fn list_runs(&self, table_id: Uuid, limit: usize) -> MirrorResult<Vec<SyncRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .rev()
            .filter(|r| r.table_id == table_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_errors(&self, errors: &[RowError]) -> MirrorResult<()> {
        self.inner.write().await.errors.extend_from_slice(errors);
        Ok(())
    }

    async fn list_errors(&self, table_id: Uuid, run_id: Option<Uuid>) -> MirrorResult<Vec<RowError>> {
        Ok(self
            .inner
            .read()
            .await
            .errors
            .iter()
            .filter(|e| e.table_id == table_id && run_id.map_or(true, |id| e.run_id == id))
            .cloned()
            .collect())
    }
}
