//! Synchronization runs.

pub mod executor;
pub mod rules;

use chrono::Utc;
use tracing::{info, warn};

pub use executor::SyncExecutor;
pub use rules::{
    apply_observation, normalize_flags, reset_status, restore, soft_delete, Observation, WriteOutcome,
};

use crate::error::{MirrorError, MirrorResult};
use crate::record::MirrorSchema;
use crate::run::{RunCounts, RunOutcome, SyncRun};
use crate::scheduler::Scheduler;
use crate::store::MirrorStore;
use crate::table::SourceTableConfig;

/// Make sure the table's mirror exists, creating it on first use.
///
/// Returns the table definition as stored afterwards and the mirror schema.
pub async fn ensure_mirror(
    store: &dyn MirrorStore,
    table: &SourceTableConfig,
) -> MirrorResult<(SourceTableConfig, MirrorSchema)> {
    let mirror = table.mirror_table_name();
    let mut schema = store.mirror_schema(&mirror).await?;
    let mut table = table.clone();

    if !schema.exists {
        schema = store.create_mirror_table(&mirror).await?;
        info!(table_id = %table.id, mirror_table = %mirror, "Created mirror table");
    }

    if table.mirror_table.as_deref() != Some(mirror.as_str()) || !table.mirror_table_exists {
        table.mirror_table = Some(mirror);
        table.mirror_table_exists = true;
        table.updated_at = Utc::now();
        store.update_table(&table).await?;
    }

    Ok((table, schema))
}

/// Recompute and store the table's next due time after a run finished.
pub async fn reschedule(store: &dyn MirrorStore, table: &SourceTableConfig, run: &SyncRun) {
    let now = Utc::now();
    let next = match Scheduler::next_due_at(table, run.finished_at.or(Some(now)), now) {
        Ok(next) => next,
        Err(e) => {
            warn!(table_id = %table.id, error = %e, "Could not compute next due time");
            return;
        }
    };
    if let Err(e) = store.set_next_due(table.id, next).await {
        warn!(table_id = %table.id, error = %e, "Could not store next due time");
    }
}

/// Begin a run that does its work in-process (restore, CSV import) and move
/// it to running.
pub(crate) async fn begin_local_run(store: &dyn MirrorStore, run: SyncRun) -> MirrorResult<SyncRun> {
    let run = store.begin_run(&run).await?;
    if !store.mark_running(run.id).await? {
        return Err(MirrorError::InvalidState {
            run_id: run.id,
            expected: "pending".to_string(),
            actual: "finalized".to_string(),
        });
    }
    Ok(run)
}

/// Finalize an in-process run from the result of its work.
pub(crate) async fn finish_local_run(
    store: &dyn MirrorStore,
    run: &SyncRun,
    result: MirrorResult<RunCounts>,
) -> MirrorResult<SyncRun> {
    let (outcome, error) = match result {
        Ok(counts) => (RunOutcome::completed(counts, Vec::new()), None),
        Err(e) => (RunOutcome::failed(RunCounts::default(), e.to_string()), Some(e)),
    };

    let finalized = store.finalize_run(run.id, &outcome).await?;

    if let Some(e) = error {
        return Err(e);
    }

    match finalized {
        Some(run) => Ok(run),
        None => store
            .get_run(run.id)
            .await?
            .ok_or(MirrorError::RunNotFound(run.id)),
    }
}
