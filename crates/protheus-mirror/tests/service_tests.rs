//! Integration tests for operator operations of the mirror service.

mod common;

use chrono::{Duration, Utc};

use common::{suppliers, test_config, Harness};
use protheus_mirror::{
    AnomalyKind, EngineConfig, ExportScope, FieldFilter, MirrorError, MirrorStore, MirroredRecord,
    RecordQuery, RecordStatus, RemoteCheck, RunScope, RunState, ScheduledStart, SourceTableConfig,
    SyncRun, TriggerType,
};

// =============================================================================
// Table definitions
// =============================================================================

#[tokio::test]
async fn test_duplicate_table_is_rejected() {
    let h = Harness::new(suppliers(1..=3)).await;
    let err = h
        .service
        .create_table(SourceTableConfig::new("sa2010"))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::InvalidConfig { .. }));
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_on_update() {
    let h = Harness::new(suppliers(1..=3)).await;
    let table = h.table.clone().with_cron("not a cron");
    let err = h.service.update_table(table).await.unwrap_err();
    assert!(matches!(err, MirrorError::InvalidConfig { .. }));

    let table = h.table.clone().with_cron("0 2 * * MON-FRI");
    let updated = h.service.update_table(table).await.unwrap();
    assert!(updated.next_due_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_linked_table_cannot_be_deleted() {
    let h = Harness::new(suppliers(1..=3)).await;
    let linked = h
        .service
        .create_table(SourceTableConfig::new("SB1010").linked_outside(true))
        .await
        .unwrap();

    let err = h.service.delete_table(linked.id).await.unwrap_err();
    assert!(matches!(err, MirrorError::Protected { .. }));
    assert!(h.service.get_table(linked.id).await.is_ok());

    h.service.delete_table(h.table.id).await.unwrap();
    let err = h.service.get_table(h.table.id).await.unwrap_err();
    assert!(matches!(err, MirrorError::TableNotFound(_)));
}

#[tokio::test]
async fn test_create_mirror_table_marks_table() {
    let h = Harness::new(suppliers(1..=3)).await;
    let schema = h.service.create_mirror_table(h.table.id).await.unwrap();
    assert!(schema.exists);
    assert!(schema.supports_soft_delete());

    let table = h.service.get_table(h.table.id).await.unwrap();
    assert!(table.mirror_table_exists);
    assert_eq!(table.mirror_table.as_deref(), Some(h.mirror().as_str()));
}

#[tokio::test]
async fn test_local_scopes_cannot_be_triggered() {
    let h = Harness::new(suppliers(1..=3)).await;
    let err = h
        .service
        .trigger_sync(h.table.id, RunScope::Restore, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::InvalidConfig { .. }));
}

// =============================================================================
// Orphaned runs
// =============================================================================

async fn orphan(h: &Harness) -> SyncRun {
    let mut run = SyncRun::new(h.table.id, TriggerType::Manual, RunScope::Full);
    run.started_at = Utc::now() - Duration::minutes(30);
    h.store.begin_run(&run).await.unwrap()
}

fn orphan_config() -> EngineConfig {
    EngineConfig {
        stall_threshold_secs: 60,
        ..test_config()
    }
}

#[tokio::test]
async fn test_orphaned_run_blocks_trigger_until_finalized() {
    let h = Harness::with_config(suppliers(1..=10), orphan_config()).await;
    let run = orphan(&h).await;

    let err = h
        .service
        .trigger_sync(h.table.id, RunScope::Full, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::OrphanedRun { .. }));

    let status = h.service.sync_status(h.table.id).await.unwrap();
    assert!(status.orphaned);
    assert!(status.stalled);
    assert!(status.long_running);

    // The crashed run got as far as three records.
    h.service.create_mirror_table(h.table.id).await.unwrap();
    let written: Vec<MirroredRecord> = suppliers(1..=3)
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            let mut record = MirroredRecord::new((i + 1).to_string(), data);
            record.is_new_record = true;
            record.last_sync_id = Some(run.id);
            record
        })
        .collect();
    h.store.seed_records(&h.mirror(), written).await.unwrap();

    let finalized = h.service.finalize_orphaned_run(h.table.id).await.unwrap();
    assert_eq!(finalized.id, run.id);
    assert_eq!(finalized.state, RunState::Completed);
    assert_eq!(finalized.counts.created, 3);

    let next = h.sync(RunScope::Full).await;
    assert_eq!(next.counts.created, 7);
    assert_eq!(next.counts.unchanged, 3);
}

#[tokio::test]
async fn test_orphaned_run_without_rows_finalizes_failed() {
    let h = Harness::with_config(suppliers(1..=3), orphan_config()).await;
    orphan(&h).await;

    let finalized = h.service.finalize_orphaned_run(h.table.id).await.unwrap();
    assert_eq!(finalized.state, RunState::Failed);
    assert!(finalized.error_message.is_some());

    let err = h.service.finalize_orphaned_run(h.table.id).await.unwrap_err();
    assert!(matches!(err, MirrorError::NoActiveRun { .. }));
}

// =============================================================================
// Flag anomalies
// =============================================================================

#[tokio::test]
async fn test_fix_flags_is_idempotent() {
    let h = Harness::new(suppliers(1..=5)).await;
    h.sync(RunScope::Full).await;

    let mut records = h
        .store
        .get_records(&h.mirror(), &["1".to_string(), "2".to_string(), "3".to_string()])
        .await
        .unwrap();
    let original_hash = records[2].record_hash.clone();
    records[0].pending_deletion = true;
    records[0].is_new_record = true;
    records[1].pending_deletion = true;
    records[2].record_hash = None;
    h.store.seed_records(&h.mirror(), records).await.unwrap();

    let report = h.service.detect_anomalies(h.table.id).await.unwrap();
    assert_eq!(report.remote_check, RemoteCheck::Checked);
    assert_eq!(report.count(AnomalyKind::ContradictoryFlags), 1);
    assert_eq!(report.count(AnomalyKind::StaleStatus), 2);
    assert_eq!(report.count(AnomalyKind::MissingHash), 1);
    assert_eq!(report.count(AnomalyKind::UnreflectedDeletion), 0);

    let first = h.service.fix_flags(h.table.id, false).await.unwrap();
    assert_eq!(first.flags_normalized, 2);
    assert_eq!(first.hashes_recomputed, 1);
    assert!(first.columns_added.is_empty());
    assert_eq!(first.total_repairs(), 3);

    let second = h.service.fix_flags(h.table.id, false).await.unwrap();
    assert_eq!(second.total_repairs(), 0);
    assert!(h.service.detect_anomalies(h.table.id).await.unwrap().is_clean());

    let repaired = h
        .store
        .get_records(&h.mirror(), &["1".to_string(), "3".to_string()])
        .await
        .unwrap();
    assert!(repaired[0].pending_deletion);
    assert!(!repaired[0].is_new_record);
    assert_eq!(repaired[0].record_status, Some(RecordStatus::Deleted));
    assert_eq!(repaired[1].record_hash, original_hash);
}

#[tokio::test]
async fn test_fix_flags_adds_columns_and_follows_up_deletions() {
    let h = Harness::new(suppliers(1..=10)).await;
    h.store.create_legacy_mirror(&h.mirror(), false, false).await;
    h.sync(RunScope::Full).await;
    h.source.remove_row("SA2010", 10);

    let report = h.service.detect_anomalies(h.table.id).await.unwrap();
    assert_eq!(report.missing_columns.len(), 2);
    assert_eq!(report.count(AnomalyKind::UnreflectedDeletion), 1);

    let repair = h.service.fix_flags(h.table.id, true).await.unwrap();
    assert_eq!(repair.columns_added.len(), 2);
    assert_eq!(repair.unreflected_deletions, 1);
    assert!(repair.follow_up_full_sync_required);
    let follow_up = repair.follow_up_run_id.unwrap();

    let run = h.service.wait_for_run(h.table.id).await.unwrap().unwrap();
    assert_eq!(run.id, follow_up);
    assert_eq!(run.counts.deleted, 1);

    let again = h.service.fix_flags(h.table.id, true).await.unwrap();
    assert_eq!(again.total_repairs(), 0);
    assert!(!again.follow_up_full_sync_required);
}

#[tokio::test]
async fn test_anomaly_scan_without_source() {
    let h = Harness::new(suppliers(1..=3)).await;
    h.sync(RunScope::Full).await;
    h.source.set_unreachable(true);

    let report = h.service.detect_anomalies(h.table.id).await.unwrap();
    assert!(matches!(report.remote_check, RemoteCheck::Unavailable(_)));
    assert!(report.is_clean());
}

// =============================================================================
// Archive
// =============================================================================

#[tokio::test]
async fn test_restore_deleted_record() {
    let h = Harness::new(suppliers(1..=5)).await;
    h.sync(RunScope::Full).await;
    h.source.remove_row("SA2010", 2);
    h.sync(RunScope::Full).await;

    let deleted = h.service.list_deleted(h.table.id).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].key, "2");

    let run = h
        .service
        .restore(h.table.id, &["2".to_string()], Some("operator".to_string()))
        .await
        .unwrap();
    assert_eq!(run.trigger, TriggerType::Restore);
    assert_eq!(run.counts.updated, 1);

    let page = h
        .service
        .list_records(h.table.id, &RecordQuery::default().with_filter(FieldFilter::equals("A2_COD", "000002")))
        .await
        .unwrap();
    assert_eq!(page.items[0].status, RecordStatus::Updated);
    assert!(!page.items[0].record.pending_deletion);
    assert!(h.service.list_deleted(h.table.id).await.unwrap().is_empty());

    let err = h
        .service
        .restore(h.table.id, &["4".to_string()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::RecordNotFound { .. }));
}

#[tokio::test]
async fn test_purge_removes_only_deleted_rows() {
    let h = Harness::new(suppliers(1..=5)).await;
    h.sync(RunScope::Full).await;
    h.source.remove_row("SA2010", 5);
    h.sync(RunScope::Full).await;

    assert_eq!(h.service.purge_deleted(h.table.id).await.unwrap(), 1);
    assert_eq!(h.store.row_count(&h.mirror()).await, 4);
}

// =============================================================================
// CSV import / export
// =============================================================================

#[tokio::test]
async fn test_csv_import_updates_and_creates_without_deleting() {
    let h = Harness::new(suppliers(1..=10)).await;
    h.sync(RunScope::Full).await;

    let csv = "R_E_C_N_O_,A2_COD,A2_LOJA,A2_NOME,A2_SALDO\n\
               1,000001,01,ACME Renamed,10\n\
               2,000002,01,Globex Renamed,20\n\
               3,000003,01,Initech Renamed,30\n\
               11,000011,01,Umbrella,110\n\
               12,000012,01,Hooli,120\n";

    let run = h
        .service
        .import_csv(h.table.id, csv.as_bytes(), Some("operator".to_string()))
        .await
        .unwrap();

    assert_eq!(run.trigger, TriggerType::ManualImport);
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.counts.updated, 3);
    assert_eq!(run.counts.created, 2);
    assert_eq!(run.counts.deleted, 0);
    assert_eq!(h.store.row_count(&h.mirror()).await, 12);
    assert!(h.service.list_deleted(h.table.id).await.unwrap().is_empty());

    // Rows the earlier sync created are no longer new relative to the import.
    assert_eq!(count_with_status(&h, RecordStatus::Updated).await, 3);
    assert_eq!(count_with_status(&h, RecordStatus::New).await, 2);
    assert_eq!(count_with_status(&h, RecordStatus::Unchanged).await, 7);
}

async fn count_with_status(h: &Harness, status: RecordStatus) -> usize {
    let query = RecordQuery::default().with_status(status);
    h.service.list_records(h.table.id, &query).await.unwrap().total
}

#[tokio::test]
async fn test_csv_import_of_identical_row_is_unchanged() {
    let h = Harness::new(suppliers(1..=3)).await;
    h.sync(RunScope::Full).await;

    let csv = "R_E_C_N_O_,A2_COD,A2_LOJA,A2_NOME,A2_SALDO\n4,000004,01,Supplier 4,40\n3,000003,01,Supplier 3,30\n";
    let run = h.service.import_csv(h.table.id, csv.as_bytes(), None).await.unwrap();

    assert_eq!(run.counts.unchanged, 1);
    assert_eq!(run.counts.created, 1);
    assert_eq!(run.counts.updated, 0);
}

#[tokio::test]
async fn test_csv_import_row_without_key_is_recorded() {
    let h = Harness::new(suppliers(1..=3)).await;
    h.sync(RunScope::Full).await;

    let csv = "R_E_C_N_O_,A2_NOME\n,Nobody\n1,Supplier 1\n";
    let run = h.service.import_csv(h.table.id, csv.as_bytes(), None).await.unwrap();
    assert_eq!(run.counts.failed, 1);

    let errors = h
        .service
        .list_errors(h.table.id, protheus_mirror::ErrorScope::LastRun)
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("line 2"));
}

#[tokio::test]
async fn test_export_changes_since_last_sync() {
    let h = Harness::new(suppliers(1..=10)).await;
    h.sync(RunScope::Full).await;
    h.source.remove_row("SA2010", 10);
    h.source.update_row("SA2010", 1, "A2_NOME", serde_json::json!("Changed"));
    h.sync(RunScope::Full).await;

    let mut all = Vec::new();
    let written = h.service.export(h.table.id, &ExportScope::All, &mut all).await.unwrap();
    assert_eq!(written, 10);

    let mut changes = Vec::new();
    let written = h
        .service
        .export(h.table.id, &ExportScope::ChangesSinceLastSync, &mut changes)
        .await
        .unwrap();
    assert_eq!(written, 2);

    let text = String::from_utf8(changes).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("record_key,record_status,"));
    let rows: Vec<&str> = lines.collect();
    assert!(rows.iter().any(|l| l.starts_with("1,updated,")));
    assert!(rows.iter().any(|l| l.starts_with("10,deleted,")));

    // Exporting does not touch the mirror.
    let page = h.service.list_records(h.table.id, &RecordQuery::default()).await.unwrap();
    assert_eq!(page.total, 10);
}

#[tokio::test]
async fn test_list_records_sorts_and_pages() {
    let h = Harness::new(suppliers(1..=100)).await;
    h.sync(RunScope::Full).await;

    let query = RecordQuery::default()
        .sorted_by("-A2_SALDO".parse().unwrap())
        .page(2, 10);
    let page = h.service.list_records(h.table.id, &query).await.unwrap();

    assert_eq!(page.total, 100);
    assert_eq!(page.total_pages(), 10);
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.items[0].record.key, "90");
    assert!(page.items.iter().all(|c| c.status == RecordStatus::New));
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_run_due_starts_scheduled_runs() {
    let h = Harness::new(suppliers(1..=5)).await;
    let now = Utc::now();

    assert!(h.service.due_tables(now).await.unwrap().is_empty());
    assert!(h.service.run_due(now).await.unwrap().is_empty());

    let later = now + Duration::hours(2);
    let starts = h.service.run_due(later).await.unwrap();
    assert_eq!(starts.len(), 1);
    assert!(matches!(starts[0], ScheduledStart::Started { .. }));

    let run = h.service.wait_for_run(h.table.id).await.unwrap().unwrap();
    assert_eq!(run.trigger, TriggerType::Scheduled);
    assert_eq!(run.scope, RunScope::Incremental);
    assert_eq!(run.state, RunState::Completed);

    let table = h.service.get_table(h.table.id).await.unwrap();
    assert!(table.next_due_at.unwrap() > run.finished_at.unwrap());
}

#[tokio::test]
async fn test_run_due_skips_busy_tables() {
    let h = Harness::new(suppliers(1..=5)).await;
    h.source.hold_fetches();
    h.service
        .trigger_sync(h.table.id, RunScope::Full, None)
        .await
        .unwrap();
    h.source.wait_for_fetches(1).await;

    let starts = h.service.run_due(Utc::now() + Duration::hours(2)).await.unwrap();
    assert!(matches!(starts[0], ScheduledStart::Skipped { .. }));

    h.source.release();
    h.service.wait_for_run(h.table.id).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inactive_tables_are_never_due() {
    let h = Harness::new(suppliers(1..=5)).await;
    let mut table = h.table.clone();
    table.is_active = false;
    h.service.update_table(table).await.unwrap();

    let starts = h.service.run_due(Utc::now() + Duration::days(2)).await.unwrap();
    assert!(starts.is_empty());
}
