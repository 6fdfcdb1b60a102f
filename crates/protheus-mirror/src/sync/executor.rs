//! Sync executor.
//!
//! Reconciles one table's mirror against the ERP for one run:
//!
//! ```text
//!   mark running
//!        |
//!   describe table ──► binary fields excluded from fingerprints
//!        |
//!   ┌─► cancelled? ──► stop (run keeps its terminated state)
//!   │    fetch page
//!   │    cancelled? ──► stop, nothing written
//!   │    fingerprint + apply write rules ──► upsert, row errors
//!   │    progress + heartbeat
//!   └─── has_next
//!        |
//!   full run: soft-delete keys not seen (batched, same checkpoints)
//!        |
//!   finalize (only if still active) + reschedule
//! ```
//!
//! Connectivity loss and store failures fail the run; per-row problems are
//! recorded and the run goes on.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rules::{apply_observation, soft_delete, Observation, WriteOutcome};
use super::{ensure_mirror, reschedule};
use crate::config::EngineConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::fingerprint::{record_key, Fingerprinter};
use crate::record::{FieldMap, MirrorSchema, MirroredRecord};
use crate::run::{RowError, RowErrorKind, RunCounts, RunOutcome, SyncRun};
use crate::source::{ErpSource, FetchScope, PageRequest, RemotePage};
use crate::store::MirrorStore;
use crate::table::SourceTableConfig;
use crate::types::RunScope;

/// Why the reconcile loop stopped early.
#[derive(Debug)]
enum Stop {
    /// Cancellation was requested or the run was finalized elsewhere.
    Cancelled,
    Failed(MirrorError),
}

impl From<MirrorError> for Stop {
    fn from(err: MirrorError) -> Self {
        Stop::Failed(err)
    }
}

/// Mutable state of one run.
#[derive(Debug, Default)]
struct Progress {
    counts: RunCounts,
    excluded: Vec<String>,
}

/// Executes sync runs.
pub struct SyncExecutor {
    store: Arc<dyn MirrorStore>,
    source: Arc<dyn ErpSource>,
    config: EngineConfig,
}

impl SyncExecutor {
    /// Create a new executor.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>, source: Arc<dyn ErpSource>, config: EngineConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Run in a background task.
    ///
    /// The run is executed in an inner task; if that task panics, the run is
    /// finalized as failed so it never stays active.
    pub fn spawn(
        self: Arc<Self>,
        table: SourceTableConfig,
        run: SyncRun,
        cancel: CancellationToken,
    ) -> JoinHandle<MirrorResult<SyncRun>> {
        tokio::spawn(async move {
            let run_id = run.id;
            let worker = Arc::clone(&self);
            let inner = tokio::spawn(async move { worker.execute(&table, run, cancel).await });

            match inner.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(run_id = %run_id, error = %join_err, "Sync task aborted");
                    let outcome = RunOutcome::failed(
                        RunCounts::default(),
                        format!("sync task aborted: {join_err}"),
                    );
                    self.store.finalize_run(run_id, &outcome).await?;
                    self.store
                        .get_run(run_id)
                        .await?
                        .ok_or(MirrorError::RunNotFound(run_id))
                }
            }
        })
    }

    /// Execute a run that was created by `MirrorStore::begin_run`.
    ///
    /// Always leaves the run finalized and returns it as stored.
    pub async fn execute(
        &self,
        table: &SourceTableConfig,
        run: SyncRun,
        cancel: CancellationToken,
    ) -> MirrorResult<SyncRun> {
        if !self.store.mark_running(run.id).await? {
            debug!(run_id = %run.id, "Run finalized before it started");
            return self
                .store
                .get_run(run.id)
                .await?
                .ok_or(MirrorError::RunNotFound(run.id));
        }

        info!(
            table_id = %table.id,
            source_table = %table.source_table,
            run_id = %run.id,
            scope = %run.scope,
            trigger = %run.trigger,
            "Started sync run"
        );

        let mut progress = Progress::default();
        let result = self.reconcile(table, &run, &cancel, &mut progress).await;

        let outcome = match result {
            Ok(()) => RunOutcome::completed(progress.counts, progress.excluded.clone()),
            Err(Stop::Cancelled) => {
                info!(run_id = %run.id, "Sync run stopped at checkpoint");
                RunOutcome::terminated(progress.counts).with_excluded(progress.excluded.clone())
            }
            Err(Stop::Failed(e)) => {
                error!(run_id = %run.id, error = %e, "Sync run failed");
                RunOutcome::failed(progress.counts, e.to_string()).with_excluded(progress.excluded.clone())
            }
        };

        let finalized = match self.store.finalize_run(run.id, &outcome).await? {
            Some(run) => run,
            // Terminated or finalized elsewhere: the stored state stands.
            None => self
                .store
                .get_run(run.id)
                .await?
                .ok_or(MirrorError::RunNotFound(run.id))?,
        };

        info!(
            table_id = %table.id,
            run_id = %finalized.id,
            state = %finalized.state,
            created = finalized.counts.created,
            updated = finalized.counts.updated,
            deleted = finalized.counts.deleted,
            failed = finalized.counts.failed,
            "Finished sync run"
        );

        let current = self.store.get_table(table.id).await?.unwrap_or_else(|| table.clone());
        reschedule(self.store.as_ref(), &current, &finalized).await;

        Ok(finalized)
    }

    async fn reconcile(
        &self,
        table: &SourceTableConfig,
        run: &SyncRun,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(), Stop> {
        let (table, schema) = ensure_mirror(self.store.as_ref(), table).await?;
        let mirror = table.mirror_table_name();

        let settled = self.store.reset_statuses(&mirror).await?;
        debug!(run_id = %run.id, settled, "Settled statuses of the previous run");

        let structure = self
            .source
            .describe_table(&table.source_table)
            .await
            .map_err(MirrorError::from)?;
        let fingerprinter = Fingerprinter::new(structure.binary_fields());
        progress.excluded = fingerprinter.excluded_binary_fields();

        let fetch_scope = match run.scope {
            RunScope::Incremental => match self.store.last_successful_remote_run(table.id).await? {
                Some(last) => FetchScope::ChangedSince(last.started_at),
                None => FetchScope::All,
            },
            _ => FetchScope::All,
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut page = PageRequest::first(self.config.batch_size);
        let mut truncated = run.scope != RunScope::Cleanup;

        loop {
            checkpoint(cancel)?;
            let remote = self.fetch(&table, fetch_scope, page).await?;
            checkpoint(cancel)?;

            if !truncated {
                // Only wipe the mirror once the source has answered.
                let removed = self.store.truncate_mirror(&mirror).await?;
                info!(run_id = %run.id, removed, "Truncated mirror for cleanup resync");
                truncated = true;
            }

            let has_next = remote.has_next && !remote.items.is_empty();
            let keys = self
                .apply_batch(&mirror, &table, &schema, &fingerprinter, run, remote.items, progress)
                .await?;
            seen.extend(keys);

            self.heartbeat(run, progress).await?;

            if !has_next {
                break;
            }
            page = page.next();
        }

        if run.scope == RunScope::Full {
            self.delete_absent(&mirror, &schema, run, &seen, cancel, progress).await?;
        }

        Ok(())
    }

    async fn fetch(
        &self,
        table: &SourceTableConfig,
        scope: FetchScope,
        page: PageRequest,
    ) -> Result<RemotePage, Stop> {
        self.source
            .fetch_page(&table.source_table, scope, page)
            .await
            .map_err(|e| Stop::Failed(e.into()))
    }

    async fn heartbeat(&self, run: &SyncRun, progress: &Progress) -> Result<(), Stop> {
        if self
            .store
            .record_progress(run.id, &progress.counts, Utc::now())
            .await?
        {
            Ok(())
        } else {
            Err(Stop::Cancelled)
        }
    }

    /// Fingerprint and write one page. Returns the keys seen.
    #[allow(clippy::too_many_arguments)]
    async fn apply_batch(
        &self,
        mirror: &str,
        table: &SourceTableConfig,
        schema: &MirrorSchema,
        fingerprinter: &Fingerprinter,
        run: &SyncRun,
        items: Vec<FieldMap>,
        progress: &mut Progress,
    ) -> Result<Vec<String>, Stop> {
        let mut observations: Vec<Observation> = Vec::with_capacity(items.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut errors = Vec::new();

        for item in items {
            match record_key(&item, &table.key_fields) {
                Ok(key) => {
                    let hash = fingerprinter.fingerprint(&item);
                    let observation = Observation {
                        key: key.clone(),
                        data: item,
                        hash,
                    };
                    // A key repeated within the page keeps its last version.
                    match positions.get(&key) {
                        Some(&i) => observations[i] = observation,
                        None => {
                            positions.insert(key, observations.len());
                            observations.push(observation);
                        }
                    }
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Skipping record");
                    progress.counts.failed += 1;
                    errors.push(RowError::new(run, None, RowErrorKind::Transform, e.to_string()));
                }
            }
        }

        let keys: Vec<String> = observations.iter().map(|o| o.key.clone()).collect();
        let current: HashMap<String, MirroredRecord> = self
            .store
            .get_records(mirror, &keys)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let now = Utc::now();
        let mut writes = Vec::with_capacity(observations.len());
        for observation in observations {
            let existing = current.get(&observation.key);
            let (record, outcome) = apply_observation(existing, observation, run.id, schema, now);
            match outcome {
                WriteOutcome::Created => progress.counts.created += 1,
                WriteOutcome::Updated | WriteOutcome::Revived => progress.counts.updated += 1,
                WriteOutcome::Unchanged => progress.counts.unchanged += 1,
            }
            writes.push(record);
        }

        self.store.upsert_records(mirror, &writes).await?;
        self.store.record_errors(&errors).await?;

        debug!(run_id = %run.id, written = writes.len(), failed = errors.len(), "Applied batch");
        Ok(keys)
    }

    /// Soft-delete live rows absent from a complete fetch.
    async fn delete_absent(
        &self,
        mirror: &str,
        schema: &MirrorSchema,
        run: &SyncRun,
        seen: &HashSet<String>,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(), Stop> {
        if !schema.supports_soft_delete() {
            let drift = MirrorError::SchemaDrift {
                mirror_table: mirror.to_string(),
                missing_columns: schema.missing_soft_delete_columns.clone(),
            };
            warn!(run_id = %run.id, error = %drift, "Skipping deletion phase");
            self.store
                .record_errors(&[RowError::new(run, None, RowErrorKind::SchemaDrift, drift.to_string())])
                .await?;
            return Ok(());
        }

        let absent: Vec<String> = self
            .store
            .live_keys(mirror)
            .await?
            .into_iter()
            .filter(|k| !seen.contains(k))
            .collect();

        for chunk in absent.chunks(self.config.batch_size.max(1)) {
            checkpoint(cancel)?;
            let now = Utc::now();
            let deletions: Vec<MirroredRecord> = self
                .store
                .get_records(mirror, chunk)
                .await?
                .iter()
                .filter_map(|r| soft_delete(r, run.id, schema, now))
                .collect();
            progress.counts.deleted += u32::try_from(deletions.len()).unwrap_or(u32::MAX);
            self.store.upsert_records(mirror, &deletions).await?;
            self.heartbeat(run, progress).await?;
        }

        if !absent.is_empty() {
            info!(run_id = %run.id, deleted = absent.len(), "Soft-deleted records absent from source");
        }
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), Stop> {
    if cancel.is_cancelled() {
        Err(Stop::Cancelled)
    } else {
        Ok(())
    }
}
