//! Mirror service.
//!
//! Main entry point for operators and external invokers: table definitions,
//! triggering and supervising runs, record listing, archive, import and
//! export.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::anomaly::{AnomalyDetector, AnomalyReport, RepairReport};
use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::csv_import::CsvReconciler;
use crate::error::{MirrorError, MirrorResult};
use crate::export::{write_csv, ExportScope};
use crate::monitor::{JobMonitor, RunStatus};
use crate::query::{RecordPage, RecordQuery};
use crate::record::{MirrorSchema, MirroredRecord};
use crate::run::{ErrorScope, RowError, SyncRun};
use crate::scheduler::Scheduler;
use crate::source::ErpSource;
use crate::store::MirrorStore;
use crate::sync::{ensure_mirror, SyncExecutor};
use crate::table::SourceTableConfig;
use crate::types::{RunScope, TriggerType};

/// What happened to a due table in a scheduled pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScheduledStart {
    Started { table_id: Uuid, run_id: Uuid },
    Skipped { table_id: Uuid, reason: String },
}

/// Facade over the mirror engine.
pub struct MirrorService {
    store: Arc<dyn MirrorStore>,
    config: EngineConfig,
    executor: Arc<SyncExecutor>,
    monitor: JobMonitor,
    anomalies: AnomalyDetector,
    archive: Archive,
    csv: CsvReconciler,
    /// Serializes the check-begin-register sequence of run starts.
    start_lock: Mutex<()>,
}

impl MirrorService {
    /// Create a new service.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>, source: Arc<dyn ErpSource>, config: EngineConfig) -> Self {
        Self {
            executor: Arc::new(SyncExecutor::new(
                Arc::clone(&store),
                Arc::clone(&source),
                config.clone(),
            )),
            monitor: JobMonitor::new(Arc::clone(&store), config.clone()),
            anomalies: AnomalyDetector::new(Arc::clone(&store), source, config.clone()),
            archive: Archive::new(Arc::clone(&store)),
            csv: CsvReconciler::new(Arc::clone(&store), config.clone()),
            store,
            config,
            start_lock: Mutex::new(()),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The job monitor.
    #[must_use]
    pub fn monitor(&self) -> &JobMonitor {
        &self.monitor
    }

    // ------------------------------------------------------------------
    // Table definitions
    // ------------------------------------------------------------------

    /// Register a table to mirror.
    #[instrument(skip(self, table), fields(source_table = %table.source_table))]
    pub async fn create_table(&self, mut table: SourceTableConfig) -> MirrorResult<SourceTableConfig> {
        table.validate()?;
        let now = Utc::now();
        table.created_at = now;
        table.updated_at = now;
        table.next_due_at = Scheduler::next_due_at(&table, None, now)?;
        self.store.insert_table(&table).await?;

        info!(table_id = %table.id, source_table = %table.source_table, "Created source table");
        Ok(table)
    }

    /// Update a table definition. Mirror state fields are kept as stored.
    #[instrument(skip(self, table), fields(table_id = %table.id))]
    pub async fn update_table(&self, mut table: SourceTableConfig) -> MirrorResult<SourceTableConfig> {
        table.validate()?;
        let current = self.get_table(table.id).await?;

        let now = Utc::now();
        table.created_at = current.created_at;
        table.mirror_table_exists = current.mirror_table_exists;
        if current.mirror_table_exists {
            table.mirror_table = current.mirror_table.clone();
        }
        table.updated_at = now;

        let last_finished = self
            .store
            .latest_run(table.id)
            .await?
            .and_then(|run| run.finished_at);
        table.next_due_at = Scheduler::next_due_at(&table, last_finished, now)?;

        if !self.store.update_table(&table).await? {
            return Err(MirrorError::TableNotFound(table.id));
        }
        info!(table_id = %table.id, "Updated source table");
        Ok(table)
    }

    /// Delete a table definition. The mirror's rows are left in place.
    #[instrument(skip(self))]
    pub async fn delete_table(&self, table_id: Uuid) -> MirrorResult<()> {
        let table = self.get_table(table_id).await?;
        if table.linked_outside_protheus {
            return Err(MirrorError::Protected { table_id });
        }
        if let Some(active) = self.store.active_run(table_id).await? {
            return Err(MirrorError::ConcurrencyConflict {
                table_id,
                run_id: active.id,
            });
        }
        if !self.store.delete_table(table_id).await? {
            return Err(MirrorError::TableNotFound(table_id));
        }
        info!(table_id = %table_id, "Deleted source table");
        Ok(())
    }

    /// Get a table definition.
    pub async fn get_table(&self, table_id: Uuid) -> MirrorResult<SourceTableConfig> {
        self.store
            .get_table(table_id)
            .await?
            .ok_or(MirrorError::TableNotFound(table_id))
    }

    /// All table definitions.
    pub async fn list_tables(&self) -> MirrorResult<Vec<SourceTableConfig>> {
        self.store.list_tables().await
    }

    /// Create the table's mirror if it does not exist yet.
    pub async fn create_mirror_table(&self, table_id: Uuid) -> MirrorResult<MirrorSchema> {
        let table = self.get_table(table_id).await?;
        let (_, schema) = ensure_mirror(self.store.as_ref(), &table).await?;
        Ok(schema)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Start a sync run in the background and return it.
    ///
    /// Rejected with `ConcurrencyConflict` while another run is active, or
    /// with `OrphanedRun` when the active run has nothing behind it.
    #[instrument(skip(self, triggered_by))]
    pub async fn trigger_sync(
        &self,
        table_id: Uuid,
        scope: RunScope,
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        if !scope.is_remote() {
            return Err(MirrorError::invalid_config(format!(
                "{scope} runs cannot be triggered as a sync"
            )));
        }
        let trigger = if scope == RunScope::Cleanup {
            TriggerType::FullCleanup
        } else {
            TriggerType::Manual
        };
        let table = self.get_table(table_id).await?;
        self.start_run(&table, trigger, scope, triggered_by).await
    }

    async fn start_run(
        &self,
        table: &SourceTableConfig,
        trigger: TriggerType,
        scope: RunScope,
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        table.validate()?;
        let _guard = self.start_lock.lock().await;

        if let Some(active) = self.store.active_run(table.id).await? {
            if self.monitor.is_orphaned(&active).await {
                return Err(MirrorError::OrphanedRun {
                    table_id: table.id,
                    run_id: active.id,
                });
            }
            return Err(MirrorError::ConcurrencyConflict {
                table_id: table.id,
                run_id: active.id,
            });
        }

        let run = self
            .store
            .begin_run(&SyncRun::new(table.id, trigger, scope).triggered_by(triggered_by))
            .await?;

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&self.executor).spawn(table.clone(), run.clone(), cancel.clone());
        self.monitor.register(table.id, run.id, cancel, handle).await;

        info!(
            table_id = %table.id,
            run_id = %run.id,
            scope = %scope,
            trigger = %trigger,
            "Triggered sync run"
        );
        Ok(run)
    }

    /// Poll the status of the table's current run.
    pub async fn sync_status(&self, table_id: Uuid) -> MirrorResult<RunStatus> {
        self.get_table(table_id).await?;
        self.monitor.status(table_id).await
    }

    /// Wait for the run this process started on the table.
    ///
    /// Returns `None` when this process has no task for the table.
    pub async fn wait_for_run(&self, table_id: Uuid) -> Option<MirrorResult<SyncRun>> {
        self.monitor.wait(table_id).await
    }

    /// Force-terminate the table's active run.
    pub async fn force_terminate(&self, table_id: Uuid) -> MirrorResult<SyncRun> {
        self.get_table(table_id).await?;
        self.monitor.force_terminate(table_id).await
    }

    /// Finalize an orphaned run so the table can sync again.
    pub async fn finalize_orphaned_run(&self, table_id: Uuid) -> MirrorResult<SyncRun> {
        self.get_table(table_id).await?;
        self.monitor.finalize_orphaned(table_id).await
    }

    /// Run history, newest first.
    pub async fn list_runs(&self, table_id: Uuid, limit: usize) -> MirrorResult<Vec<SyncRun>> {
        self.store.list_runs(table_id, limit).await
    }

    /// Per-row errors of the latest run or of all time.
    pub async fn list_errors(&self, table_id: Uuid, scope: ErrorScope) -> MirrorResult<Vec<RowError>> {
        match scope {
            ErrorScope::AllTime => self.store.list_errors(table_id, None).await,
            ErrorScope::LastRun => match self.store.latest_run(table_id).await? {
                Some(run) => self.store.list_errors(table_id, Some(run.id)).await,
                None => Ok(Vec::new()),
            },
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Tables due at `now`.
    pub async fn due_tables(&self, now: DateTime<Utc>) -> MirrorResult<Vec<SourceTableConfig>> {
        let tables = self.store.list_tables().await?;
        Ok(Scheduler::due_tables(&tables, now).into_iter().cloned().collect())
    }

    /// Start scheduled runs for every due table without an active run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> MirrorResult<Vec<ScheduledStart>> {
        let mut starts = Vec::new();
        for table in self.due_tables(now).await? {
            let scope = table.scheduled_scope.unwrap_or(self.config.scheduled_scope);
            match self
                .start_run(&table, TriggerType::Scheduled, scope, Some("scheduler".to_string()))
                .await
            {
                Ok(run) => starts.push(ScheduledStart::Started {
                    table_id: table.id,
                    run_id: run.id,
                }),
                Err(e) if e.is_conflict() || matches!(e, MirrorError::InvalidConfig { .. }) => {
                    warn!(table_id = %table.id, error = %e, "Skipping due table");
                    starts.push(ScheduledStart::Skipped {
                        table_id: table.id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(starts)
    }

    // ------------------------------------------------------------------
    // Anomalies
    // ------------------------------------------------------------------

    /// Scan the table's mirror for flag anomalies.
    pub async fn detect_anomalies(&self, table_id: Uuid) -> MirrorResult<AnomalyReport> {
        let table = self.get_table(table_id).await?;
        self.anomalies.detect(&table).await
    }

    /// Repair flag anomalies.
    ///
    /// With `follow_up`, a full sync is started when deletions were found
    /// that the mirror does not reflect yet.
    pub async fn fix_flags(&self, table_id: Uuid, follow_up: bool) -> MirrorResult<RepairReport> {
        let table = self.get_table(table_id).await?;
        let mut report = self.anomalies.repair(&table).await?;

        if follow_up && report.follow_up_full_sync_required {
            let run = self
                .start_run(&table, TriggerType::Manual, RunScope::Full, Some("fix-flags".to_string()))
                .await?;
            report.follow_up_run_id = Some(run.id);
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// List records with their computed status.
    pub async fn list_records(&self, table_id: Uuid, query: &RecordQuery) -> MirrorResult<RecordPage> {
        let (records, current_run) = self.classification_input(table_id).await?;
        Ok(query.apply(records, current_run))
    }

    /// Soft-deleted records.
    pub async fn list_deleted(&self, table_id: Uuid) -> MirrorResult<Vec<MirroredRecord>> {
        let table = self.get_table(table_id).await?;
        self.archive.list_deleted(&table).await
    }

    /// Restore soft-deleted records.
    pub async fn restore(
        &self,
        table_id: Uuid,
        keys: &[String],
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        let table = self.get_table(table_id).await?;
        self.archive.restore(&table, keys, triggered_by).await
    }

    /// Physically remove soft-deleted rows.
    #[instrument(skip(self))]
    pub async fn purge_deleted(&self, table_id: Uuid) -> MirrorResult<u64> {
        let table = self.get_table(table_id).await?;
        if let Some(active) = self.store.active_run(table_id).await? {
            return Err(MirrorError::ConcurrencyConflict {
                table_id,
                run_id: active.id,
            });
        }
        let schema = self.store.mirror_schema(&table.mirror_table_name()).await?;
        if !schema.exists || !schema.supports_soft_delete() {
            return Ok(0);
        }
        let purged = self.store.purge_deleted(&schema.mirror_table).await?;
        info!(table_id = %table_id, purged, "Purged soft-deleted records");
        Ok(purged)
    }

    /// Import CSV rows under a manual-import run.
    pub async fn import_csv(
        &self,
        table_id: Uuid,
        data: &[u8],
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        let table = self.get_table(table_id).await?;
        self.csv.import_csv(&table, data, triggered_by).await
    }

    /// Export records as CSV. Returns the number of rows written.
    pub async fn export<W: Write + Send>(
        &self,
        table_id: Uuid,
        scope: &ExportScope,
        writer: W,
    ) -> MirrorResult<usize> {
        let (records, current_run) = self.classification_input(table_id).await?;
        let selected: Vec<_> = scope
            .query()
            .select(records, current_run)
            .into_iter()
            .filter(|record| scope.includes(record, current_run))
            .collect();
        write_csv(writer, &selected)
    }

    /// Mirror rows and the run they are classified against.
    async fn classification_input(
        &self,
        table_id: Uuid,
    ) -> MirrorResult<(Vec<MirroredRecord>, Option<Uuid>)> {
        let table = self.get_table(table_id).await?;
        let schema = self.store.mirror_schema(&table.mirror_table_name()).await?;
        if !schema.exists {
            return Ok((Vec::new(), None));
        }
        let records = self.store.all_records(&schema.mirror_table).await?;
        let current_run = self.store.latest_run(table_id).await?.map(|run| run.id);
        Ok((records, current_run))
    }
}
