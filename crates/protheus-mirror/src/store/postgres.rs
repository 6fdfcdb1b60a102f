//! PostgreSQL store.
//!
//! Definitions, runs and row errors live in the tables created by the
//! migrations. Each source table gets its own mirror table: business columns
//! in a JSONB `data` column next to the reconciliation columns. Mirror names
//! are validated identifiers and quoted before they are interpolated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use tracing::{info, instrument};
use uuid::Uuid;

use super::MirrorStore;
use crate::error::{MirrorError, MirrorResult};
use crate::record::{FieldMap, MirrorSchema, MirroredRecord, RECORD_STATUS_COLUMN, SOFT_DELETE_COLUMNS};
use crate::run::{RowError, RowErrorKind, RunCounts, RunOutcome, SyncRun};
use crate::table::{is_valid_identifier, SourceTableConfig};
use crate::types::{IntervalUnit, RecordStatus, RunScope, RunState, SyncMode, TriggerType};

const TABLE_COLUMNS: &str = r"
    id, source_table, mirror_table, description, key_fields, sync_mode,
    interval_value, interval_unit, schedule, cron_expression, scheduled_scope,
    next_due_at, is_active, linked_outside_protheus, mirror_table_exists,
    created_at, updated_at
";

const RUN_COLUMNS: &str = r"
    id, table_id, trigger_type, scope, state, started_at, finished_at,
    last_heartbeat_at, created_count, updated_count, deleted_count,
    unchanged_count, failed_count, excluded_binary_fields, error_message,
    triggered_by
";

/// [`MirrorStore`] backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgMirrorStore {
    pool: PgPool,
}

impl PgMirrorStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database.
    pub async fn connect(database_url: &str, max_connections: u32) -> MirrorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> MirrorResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MirrorError::internal(format!("migration failed: {e}")))?;
        info!("Migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn quoted(mirror: &str) -> MirrorResult<String> {
        if !is_valid_identifier(mirror) {
            return Err(MirrorError::invalid_config(format!(
                "invalid mirror table name '{mirror}'"
            )));
        }
        Ok(format!("\"{mirror}\""))
    }

    /// Columns to select, substituting constants for absent columns.
    fn select_list(schema: &MirrorSchema) -> String {
        let has = |col: &str| !schema.missing_soft_delete_columns.iter().any(|m| m == col);
        let pending = if has("pending_deletion") {
            "pending_deletion"
        } else {
            "FALSE AS pending_deletion"
        };
        let deleted_at = if has("deleted_at") {
            "deleted_at"
        } else {
            "NULL::timestamptz AS deleted_at"
        };
        let status = if schema.has_record_status {
            "record_status"
        } else {
            "NULL::text AS record_status"
        };
        format!(
            "record_key, data, record_hash, is_new_record, was_updated_last_sync, last_sync_id, {pending}, {deleted_at}, {status}, synced_at"
        )
    }

    /// Columns that can be written on this mirror.
    fn write_columns(schema: &MirrorSchema) -> Vec<&'static str> {
        let mut columns = vec![
            "record_key",
            "data",
            "record_hash",
            "is_new_record",
            "was_updated_last_sync",
            "last_sync_id",
            "synced_at",
        ];
        for col in SOFT_DELETE_COLUMNS {
            if !schema.missing_soft_delete_columns.iter().any(|m| m == col) {
                columns.push(col);
            }
        }
        if schema.has_record_status {
            columns.push(RECORD_STATUS_COLUMN);
        }
        columns
    }

    /// Soft-delete predicate, or `FALSE` on mirrors without the column.
    fn pending_expr(schema: &MirrorSchema) -> &'static str {
        if schema.missing_soft_delete_columns.iter().any(|m| m == "pending_deletion") {
            "FALSE"
        } else {
            "pending_deletion"
        }
    }

    async fn existing_schema(&self, mirror: &str) -> MirrorResult<MirrorSchema> {
        let schema = self.mirror_schema(mirror).await?;
        if !schema.exists {
            return Err(MirrorError::internal(format!("mirror table {mirror} does not exist")));
        }
        Ok(schema)
    }

    async fn fetch_records(&self, mirror: &str, filter: &str) -> MirrorResult<Vec<MirroredRecord>> {
        let schema = self.existing_schema(mirror).await?;
        let sql = format!(
            "SELECT {} FROM {} {filter} ORDER BY record_key",
            Self::select_list(&schema),
            Self::quoted(mirror)?,
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(RecordRow::into_record).collect())
    }
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    #[instrument(skip(self, table), fields(source_table = %table.source_table))]
    async fn insert_table(&self, table: &SourceTableConfig) -> MirrorResult<()> {
        let result = sqlx::query(
            r"
            INSERT INTO mirror_source_tables
                (id, source_table, mirror_table, description, key_fields, sync_mode,
                 interval_value, interval_unit, schedule, cron_expression, scheduled_scope,
                 next_due_at, is_active, linked_outside_protheus, mirror_table_exists,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(table.id)
        .bind(&table.source_table)
        .bind(&table.mirror_table)
        .bind(&table.description)
        .bind(&table.key_fields)
        .bind(table.sync_mode.as_str())
        .bind(table.interval_value.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(table.interval_unit.map(|u| u.as_str()))
        .bind(&table.schedule)
        .bind(&table.cron_expression)
        .bind(table.scheduled_scope.map(|s| s.as_str()))
        .bind(table.next_due_at)
        .bind(table.is_active)
        .bind(table.linked_outside_protheus)
        .bind(table.mirror_table_exists)
        .bind(table.created_at)
        .bind(table.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(MirrorError::invalid_config(format!(
                "source table {} is already configured",
                table.source_table
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, table), fields(table_id = %table.id))]
    async fn update_table(&self, table: &SourceTableConfig) -> MirrorResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE mirror_source_tables
            SET source_table = $2, mirror_table = $3, description = $4, key_fields = $5,
                sync_mode = $6, interval_value = $7, interval_unit = $8, schedule = $9,
                cron_expression = $10, scheduled_scope = $11, next_due_at = $12,
                is_active = $13, linked_outside_protheus = $14, mirror_table_exists = $15,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(table.id)
        .bind(&table.source_table)
        .bind(&table.mirror_table)
        .bind(&table.description)
        .bind(&table.key_fields)
        .bind(table.sync_mode.as_str())
        .bind(table.interval_value.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(table.interval_unit.map(|u| u.as_str()))
        .bind(&table.schedule)
        .bind(&table.cron_expression)
        .bind(table.scheduled_scope.map(|s| s.as_str()))
        .bind(table.next_due_at)
        .bind(table.is_active)
        .bind(table.linked_outside_protheus)
        .bind(table.mirror_table_exists)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_table(&self, table_id: Uuid) -> MirrorResult<bool> {
        let result = sqlx::query("DELETE FROM mirror_source_tables WHERE id = $1")
            .bind(table_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_table(&self, table_id: Uuid) -> MirrorResult<Option<SourceTableConfig>> {
        let sql = format!("SELECT {TABLE_COLUMNS} FROM mirror_source_tables WHERE id = $1");
        let row: Option<TableRow> = sqlx::query_as(&sql)
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(TableRow::into_config))
    }

    #[instrument(skip(self))]
    async fn list_tables(&self) -> MirrorResult<Vec<SourceTableConfig>> {
        let sql = format!("SELECT {TABLE_COLUMNS} FROM mirror_source_tables ORDER BY source_table");
        let rows: Vec<TableRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(TableRow::into_config).collect())
    }

    #[instrument(skip(self))]
    async fn set_next_due(&self, table_id: Uuid, next_due_at: Option<DateTime<Utc>>) -> MirrorResult<()> {
        let result = sqlx::query(
            "UPDATE mirror_source_tables SET next_due_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(table_id)
        .bind(next_due_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MirrorError::TableNotFound(table_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_mirror_table(&self, mirror: &str) -> MirrorResult<MirrorSchema> {
        let quoted = Self::quoted(mirror)?;
        let sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {quoted} (
                record_key             TEXT PRIMARY KEY,
                data                   JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                record_hash            TEXT,
                is_new_record          BOOLEAN NOT NULL DEFAULT FALSE,
                was_updated_last_sync  BOOLEAN NOT NULL DEFAULT FALSE,
                last_sync_id           UUID,
                pending_deletion       BOOLEAN NOT NULL DEFAULT FALSE,
                deleted_at             TIMESTAMPTZ,
                record_status          TEXT,
                synced_at              TIMESTAMPTZ
            )
            "
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        self.mirror_schema(mirror).await
    }

    #[instrument(skip(self))]
    async fn mirror_schema(&self, mirror: &str) -> MirrorResult<MirrorSchema> {
        let columns: HashSet<String> = sqlx::query(
            r"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ",
        )
        .bind(mirror)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .filter_map(|row| row.try_get::<String, _>("column_name").ok())
        .collect();

        if columns.is_empty() {
            return Ok(MirrorSchema::absent(mirror));
        }

        Ok(MirrorSchema {
            mirror_table: mirror.to_string(),
            exists: true,
            missing_soft_delete_columns: SOFT_DELETE_COLUMNS
                .iter()
                .filter(|c| !columns.contains(**c))
                .map(|c| (*c).to_string())
                .collect(),
            has_record_status: columns.contains(RECORD_STATUS_COLUMN),
        })
    }

    #[instrument(skip(self))]
    async fn add_soft_delete_columns(&self, mirror: &str) -> MirrorResult<Vec<String>> {
        let schema = self.existing_schema(mirror).await?;
        let quoted = Self::quoted(mirror)?;

        let mut tx = self.pool.begin().await?;
        for column in &schema.missing_soft_delete_columns {
            let definition = match column.as_str() {
                "pending_deletion" => "BOOLEAN NOT NULL DEFAULT FALSE",
                _ => "TIMESTAMPTZ",
            };
            let sql = format!("ALTER TABLE {quoted} ADD COLUMN IF NOT EXISTS {column} {definition}");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(schema.missing_soft_delete_columns)
    }

    #[instrument(skip(self))]
    async fn truncate_mirror(&self, mirror: &str) -> MirrorResult<u64> {
        let sql = format!("DELETE FROM {}", Self::quoted(mirror)?);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn get_records(&self, mirror: &str, keys: &[String]) -> MirrorResult<Vec<MirroredRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.existing_schema(mirror).await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE record_key = ANY($1)",
            Self::select_list(&schema),
            Self::quoted(mirror)?,
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).bind(keys).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(RecordRow::into_record).collect())
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn upsert_records(&self, mirror: &str, records: &[MirroredRecord]) -> MirrorResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let schema = self.existing_schema(mirror).await?;
        let columns = Self::write_columns(&schema);
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (record_key) DO UPDATE SET {}",
            Self::quoted(mirror)?,
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        );

        let mut tx = self.pool.begin().await?;
        for record in records {
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = match *column {
                    "record_key" => query.bind(&record.key),
                    "data" => query.bind(serde_json::Value::Object(record.data.clone())),
                    "record_hash" => query.bind(&record.record_hash),
                    "is_new_record" => query.bind(record.is_new_record),
                    "was_updated_last_sync" => query.bind(record.was_updated_last_sync),
                    "last_sync_id" => query.bind(record.last_sync_id),
                    "synced_at" => query.bind(record.synced_at),
                    "pending_deletion" => query.bind(record.pending_deletion),
                    "deleted_at" => query.bind(record.deleted_at),
                    _ => query.bind(record.record_status.map(|s| s.as_str())),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(records.len() as u64)
    }

    async fn all_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>> {
        self.fetch_records(mirror, "").await
    }

    #[instrument(skip(self))]
    async fn live_keys(&self, mirror: &str) -> MirrorResult<Vec<String>> {
        let schema = self.existing_schema(mirror).await?;
        let sql = format!(
            "SELECT record_key FROM {} WHERE NOT {} ORDER BY record_key",
            Self::quoted(mirror)?,
            Self::pending_expr(&schema),
        );
        let keys: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(keys.into_iter().map(|(k,)| k).collect())
    }

    async fn deleted_records(&self, mirror: &str) -> MirrorResult<Vec<MirroredRecord>> {
        let schema = self.existing_schema(mirror).await?;
        if !schema.supports_soft_delete() {
            return Ok(Vec::new());
        }
        self.fetch_records(mirror, "WHERE pending_deletion").await
    }

    #[instrument(skip(self))]
    async fn purge_deleted(&self, mirror: &str) -> MirrorResult<u64> {
        let schema = self.existing_schema(mirror).await?;
        if !schema.supports_soft_delete() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE pending_deletion", Self::quoted(mirror)?);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reset_statuses(&self, mirror: &str) -> MirrorResult<u64> {
        let schema = self.existing_schema(mirror).await?;
        if !schema.has_record_status {
            return Ok(0);
        }
        // Set-based form of `rules::reset_status`.
        let sql = format!(
            "UPDATE {} SET record_status = $1 WHERE record_status = ANY($2) AND NOT {}",
            Self::quoted(mirror)?,
            Self::pending_expr(&schema),
        );
        let result = sqlx::query(&sql)
            .bind(RecordStatus::Unchanged.as_str())
            .bind(vec![RecordStatus::New.as_str(), RecordStatus::Updated.as_str()])
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn count_stamped(&self, mirror: &str, run_id: Uuid) -> MirrorResult<RunCounts> {
        let schema = self.existing_schema(mirror).await?;
        let pending = Self::pending_expr(&schema);
        let sql = format!(
            r"
            SELECT
                COUNT(*) FILTER (WHERE {pending})::INT AS deleted,
                COUNT(*) FILTER (WHERE NOT {pending} AND is_new_record)::INT AS created,
                COUNT(*) FILTER (WHERE NOT {pending} AND NOT is_new_record AND was_updated_last_sync)::INT AS updated,
                COUNT(*) FILTER (WHERE NOT {pending} AND NOT is_new_record AND NOT was_updated_last_sync)::INT AS unchanged
            FROM {}
            WHERE last_sync_id = $1
            ",
            Self::quoted(mirror)?,
        );
        let row = sqlx::query(&sql).bind(run_id).fetch_one(&self.pool).await?;

        Ok(RunCounts {
            created: from_db_count(row.try_get("created")?),
            updated: from_db_count(row.try_get("updated")?),
            deleted: from_db_count(row.try_get("deleted")?),
            unchanged: from_db_count(row.try_get("unchanged")?),
            failed: 0,
        })
    }

    #[instrument(skip(self, run), fields(table_id = %run.table_id, run_id = %run.id))]
    async fn begin_run(&self, run: &SyncRun) -> MirrorResult<SyncRun> {
        let sql = format!(
            r"
            INSERT INTO mirror_sync_runs
                (id, table_id, trigger_type, scope, state, started_at, triggered_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {RUN_COLUMNS}
            "
        );
        let result: Result<RunRow, sqlx::Error> = sqlx::query_as(&sql)
            .bind(run.id)
            .bind(run.table_id)
            .bind(run.trigger.as_str())
            .bind(run.scope.as_str())
            .bind(run.state.as_str())
            .bind(run.started_at)
            .bind(&run.triggered_by)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => Ok(row.into_run()),
            Err(e) if is_unique_violation(&e) => {
                let active = self.active_run(run.table_id).await?;
                Err(MirrorError::ConcurrencyConflict {
                    table_id: run.table_id,
                    run_id: active.map_or(Uuid::nil(), |r| r.id),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, run_id: Uuid) -> MirrorResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE mirror_sync_runs
            SET state = 'running', last_heartbeat_at = NOW()
            WHERE id = $1 AND state = 'pending'
            ",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, counts))]
    async fn record_progress(
        &self,
        run_id: Uuid,
        counts: &RunCounts,
        at: DateTime<Utc>,
    ) -> MirrorResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE mirror_sync_runs
            SET created_count = $2, updated_count = $3, deleted_count = $4,
                unchanged_count = $5, failed_count = $6, last_heartbeat_at = $7
            WHERE id = $1 AND state IN ('pending', 'running')
            ",
        )
        .bind(run_id)
        .bind(to_db_count(counts.created))
        .bind(to_db_count(counts.updated))
        .bind(to_db_count(counts.deleted))
        .bind(to_db_count(counts.unchanged))
        .bind(to_db_count(counts.failed))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, outcome), fields(state = %outcome.state))]
    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> MirrorResult<Option<SyncRun>> {
        let sql = format!(
            r"
            UPDATE mirror_sync_runs
            SET state = $2, finished_at = NOW(),
                created_count = $3, updated_count = $4, deleted_count = $5,
                unchanged_count = $6, failed_count = $7,
                excluded_binary_fields = $8, error_message = $9
            WHERE id = $1 AND state IN ('pending', 'running')
            RETURNING {RUN_COLUMNS}
            "
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .bind(outcome.state.as_str())
            .bind(to_db_count(outcome.counts.created))
            .bind(to_db_count(outcome.counts.updated))
            .bind(to_db_count(outcome.counts.deleted))
            .bind(to_db_count(outcome.counts.unchanged))
            .bind(to_db_count(outcome.counts.failed))
            .bind(&outcome.excluded_binary_fields)
            .bind(&outcome.error_message)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_none() && self.get_run(run_id).await?.is_none() {
            return Err(MirrorError::RunNotFound(run_id));
        }
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM mirror_sync_runs WHERE id = $1");
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self))]
    async fn active_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        let sql = format!(
            r"
            SELECT {RUN_COLUMNS} FROM mirror_sync_runs
            WHERE table_id = $1 AND state IN ('pending', 'running')
            LIMIT 1
            "
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self))]
    async fn latest_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        let sql = format!(
            r"
            SELECT {RUN_COLUMNS} FROM mirror_sync_runs
            WHERE table_id = $1
            ORDER BY started_at DESC
            LIMIT 1
            "
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self))]
    async fn last_successful_remote_run(&self, table_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        let sql = format!(
            r"
            SELECT {RUN_COLUMNS} FROM mirror_sync_runs
            WHERE table_id = $1
              AND state = 'completed'
              AND scope IN ('incremental', 'full', 'cleanup')
            ORDER BY started_at DESC
            LIMIT 1
            "
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(table_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, table_id: Uuid, limit: usize) -> MirrorResult<Vec<SyncRun>> {
        let sql = format!(
            r"
            SELECT {RUN_COLUMNS} FROM mirror_sync_runs
            WHERE table_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(table_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    #[instrument(skip(self, errors), fields(errors = errors.len()))]
    async fn record_errors(&self, errors: &[RowError]) -> MirrorResult<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for error in errors {
            sqlx::query(
                r"
                INSERT INTO mirror_sync_errors
                    (id, run_id, table_id, record_key, kind, message, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(error.id)
            .bind(error.run_id)
            .bind(error.table_id)
            .bind(&error.record_key)
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(error.occurred_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_errors(&self, table_id: Uuid, run_id: Option<Uuid>) -> MirrorResult<Vec<RowError>> {
        let rows: Vec<ErrorRow> = sqlx::query_as(
            r"
            SELECT id, run_id, table_id, record_key, kind, message, occurred_at
            FROM mirror_sync_errors
            WHERE table_id = $1 AND ($2::uuid IS NULL OR run_id = $2)
            ORDER BY occurred_at
            ",
        )
        .bind(table_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ErrorRow::into_error).collect())
    }
}

/// Row from `mirror_source_tables`.
#[derive(Debug, sqlx::FromRow)]
struct TableRow {
    id: Uuid,
    source_table: String,
    mirror_table: Option<String>,
    description: Option<String>,
    key_fields: Vec<String>,
    sync_mode: String,
    interval_value: Option<i32>,
    interval_unit: Option<String>,
    schedule: Vec<String>,
    cron_expression: Option<String>,
    scheduled_scope: Option<String>,
    next_due_at: Option<DateTime<Utc>>,
    is_active: bool,
    linked_outside_protheus: bool,
    mirror_table_exists: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TableRow {
    fn into_config(self) -> SourceTableConfig {
        SourceTableConfig {
            id: self.id,
            source_table: self.source_table,
            mirror_table: self.mirror_table,
            description: self.description,
            key_fields: self.key_fields,
            sync_mode: self.sync_mode.parse().unwrap_or(SyncMode::Interval),
            interval_value: self.interval_value.and_then(|v| u32::try_from(v).ok()),
            interval_unit: self
                .interval_unit
                .and_then(|u| u.parse::<IntervalUnit>().ok()),
            schedule: self.schedule,
            cron_expression: self.cron_expression,
            scheduled_scope: self.scheduled_scope.and_then(|s| s.parse::<RunScope>().ok()),
            next_due_at: self.next_due_at,
            is_active: self.is_active,
            linked_outside_protheus: self.linked_outside_protheus,
            mirror_table_exists: self.mirror_table_exists,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Row from `mirror_sync_runs`.
#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    table_id: Uuid,
    trigger_type: String,
    scope: String,
    state: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    created_count: i32,
    updated_count: i32,
    deleted_count: i32,
    unchanged_count: i32,
    failed_count: i32,
    excluded_binary_fields: Vec<String>,
    error_message: Option<String>,
    triggered_by: Option<String>,
}

impl RunRow {
    fn into_run(self) -> SyncRun {
        SyncRun {
            id: self.id,
            table_id: self.table_id,
            trigger: self.trigger_type.parse().unwrap_or(TriggerType::Manual),
            scope: self.scope.parse().unwrap_or(RunScope::Incremental),
            state: self.state.parse().unwrap_or(RunState::Failed),
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_heartbeat_at: self.last_heartbeat_at,
            counts: RunCounts {
                created: from_db_count(self.created_count),
                updated: from_db_count(self.updated_count),
                deleted: from_db_count(self.deleted_count),
                unchanged: from_db_count(self.unchanged_count),
                failed: from_db_count(self.failed_count),
            },
            excluded_binary_fields: self.excluded_binary_fields,
            error_message: self.error_message,
            triggered_by: self.triggered_by,
        }
    }
}

/// Row from a mirror table.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    record_key: String,
    data: serde_json::Value,
    record_hash: Option<String>,
    is_new_record: bool,
    was_updated_last_sync: bool,
    last_sync_id: Option<Uuid>,
    pending_deletion: bool,
    deleted_at: Option<DateTime<Utc>>,
    record_status: Option<String>,
    synced_at: Option<DateTime<Utc>>,
}

impl RecordRow {
    fn into_record(self) -> MirroredRecord {
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            _ => FieldMap::new(),
        };
        MirroredRecord {
            key: self.record_key,
            data,
            record_hash: self.record_hash,
            is_new_record: self.is_new_record,
            was_updated_last_sync: self.was_updated_last_sync,
            last_sync_id: self.last_sync_id,
            pending_deletion: self.pending_deletion,
            deleted_at: self.deleted_at,
            record_status: self.record_status.and_then(|s| s.parse().ok()),
            synced_at: self.synced_at,
        }
    }
}

/// Row from `mirror_sync_errors`.
#[derive(Debug, sqlx::FromRow)]
struct ErrorRow {
    id: Uuid,
    run_id: Uuid,
    table_id: Uuid,
    record_key: Option<String>,
    kind: String,
    message: String,
    occurred_at: DateTime<Utc>,
}

impl ErrorRow {
    fn into_error(self) -> RowError {
        RowError {
            id: self.id,
            run_id: self.run_id,
            table_id: self.table_id,
            record_key: self.record_key,
            kind: self.kind.parse().unwrap_or(RowErrorKind::Write),
            message: self.message,
            occurred_at: self.occurred_at,
        }
    }
}
