//! Job monitor.
//!
//! Tracks the sync tasks this process owns and reports on a table's current
//! run: elapsed time, long-running and stalled flags, and whether the run is
//! orphaned (recorded as active with no task behind it). A run owned by
//! another process keeps heartbeating, so only a stalled run that no local
//! task owns counts as orphaned. Also hosts the two operator actions on
//! active runs: force-terminate and finalize-orphaned.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::run::{RunOutcome, SyncRun};
use crate::store::MirrorStore;
use crate::sync::reschedule;

/// A sync task owned by this process.
struct ActiveJob {
    run_id: Uuid,
    cancel: CancellationToken,
    task: AbortHandle,
    /// Taken by the caller waiting for the result.
    handle: Option<JoinHandle<MirrorResult<SyncRun>>>,
}

/// Polled status of a table's current run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub table_id: Uuid,
    /// Latest run of the table, active or not.
    pub run: Option<SyncRun>,
    pub elapsed_secs: Option<i64>,
    /// Active and running longer than the configured threshold.
    pub long_running: bool,
    /// Active with no heartbeat within the stall threshold.
    pub stalled: bool,
    /// Stalled and not owned by any task of this process.
    pub orphaned: bool,
}

impl RunStatus {
    /// Whether the table currently holds an active run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.run.as_ref().is_some_and(SyncRun::is_active)
    }
}

/// Registry of in-flight sync tasks.
pub struct JobMonitor {
    store: Arc<dyn MirrorStore>,
    config: EngineConfig,
    jobs: Mutex<HashMap<Uuid, ActiveJob>>,
}

impl JobMonitor {
    /// Create a new monitor.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Track a spawned sync task.
    pub async fn register(
        &self,
        table_id: Uuid,
        run_id: Uuid,
        cancel: CancellationToken,
        handle: JoinHandle<MirrorResult<SyncRun>>,
    ) {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, job| !job.task.is_finished());
        jobs.insert(
            table_id,
            ActiveJob {
                run_id,
                cancel,
                task: handle.abort_handle(),
                handle: Some(handle),
            },
        );
    }

    /// Whether a live task of this process owns the run.
    pub async fn owns(&self, table_id: Uuid, run_id: Uuid) -> bool {
        self.jobs
            .lock()
            .await
            .get(&table_id)
            .is_some_and(|job| job.run_id == run_id && !job.task.is_finished())
    }

    /// Poll the status of a table's current run.
    pub async fn status(&self, table_id: Uuid) -> MirrorResult<RunStatus> {
        let run = self.store.latest_run(table_id).await?;
        let now = Utc::now();

        let Some(run) = run else {
            return Ok(RunStatus {
                table_id,
                run: None,
                elapsed_secs: None,
                long_running: false,
                stalled: false,
                orphaned: false,
            });
        };

        let active = run.is_active();
        let owned = active && self.owns(table_id, run.id).await;
        let (long_running, stalled) = if active {
            self.classify_activity(&run, now)
        } else {
            (false, false)
        };

        Ok(RunStatus {
            table_id,
            elapsed_secs: Some(run.elapsed(now).num_seconds()),
            long_running,
            stalled,
            orphaned: active && !owned && stalled,
            run: Some(run),
        })
    }

    /// Whether an active run has no live task behind it.
    pub async fn is_orphaned(&self, run: &SyncRun) -> bool {
        if !run.is_active() || self.owns(run.table_id, run.id).await {
            return false;
        }
        let (_, stalled) = self.classify_activity(run, Utc::now());
        stalled
    }

    fn classify_activity(&self, run: &SyncRun, now: DateTime<Utc>) -> (bool, bool) {
        let long_running = run.elapsed(now) > self.config.long_running_threshold();
        let last_sign_of_life = run.last_heartbeat_at.unwrap_or(run.started_at);
        let stalled = now - last_sign_of_life > self.config.stall_threshold();
        (long_running, stalled)
    }

    /// Force-terminate the table's active run.
    ///
    /// Records the terminated state first, then asks the task to stop at its
    /// next checkpoint. Rows already written stay as they are.
    pub async fn force_terminate(&self, table_id: Uuid) -> MirrorResult<SyncRun> {
        let active = self
            .store
            .active_run(table_id)
            .await?
            .ok_or(MirrorError::NoActiveRun { table_id })?;

        let finalized = self
            .store
            .finalize_run(active.id, &RunOutcome::terminated(active.counts))
            .await?
            .ok_or_else(|| MirrorError::InvalidState {
                run_id: active.id,
                expected: "pending or running".to_string(),
                actual: "finalized".to_string(),
            })?;

        if let Some(job) = self.jobs.lock().await.get(&table_id) {
            if job.run_id == active.id {
                job.cancel.cancel();
            }
        }

        info!(table_id = %table_id, run_id = %finalized.id, "Force-terminated sync run");
        self.reschedule(table_id, &finalized).await;
        Ok(finalized)
    }

    /// Finalize a run left active by a process that no longer exists.
    ///
    /// Rows stamped with the run id show how far it got: any stamped row
    /// finalizes it as completed with those counts, none as failed.
    pub async fn finalize_orphaned(&self, table_id: Uuid) -> MirrorResult<SyncRun> {
        let active = self
            .store
            .active_run(table_id)
            .await?
            .ok_or(MirrorError::NoActiveRun { table_id })?;

        if !self.is_orphaned(&active).await {
            let actual = if self.owns(table_id, active.id).await {
                "owned by a live task"
            } else {
                "still heartbeating"
            };
            return Err(MirrorError::InvalidState {
                run_id: active.id,
                expected: "orphaned".to_string(),
                actual: actual.to_string(),
            });
        }

        let table = self
            .store
            .get_table(table_id)
            .await?
            .ok_or(MirrorError::TableNotFound(table_id))?;

        let mirror = table.mirror_table_name();
        let counts = if self.store.mirror_schema(&mirror).await?.exists {
            self.store.count_stamped(&mirror, active.id).await?
        } else {
            Default::default()
        };

        let outcome = if counts.processed() > 0 {
            let mut outcome = RunOutcome::completed(counts, active.excluded_binary_fields.clone());
            outcome.error_message = Some("finalized after interruption".to_string());
            outcome
        } else {
            RunOutcome::failed(counts, "finalized after interruption: no records were written")
        };

        let finalized = self
            .store
            .finalize_run(active.id, &outcome)
            .await?
            .ok_or_else(|| MirrorError::InvalidState {
                run_id: active.id,
                expected: "pending or running".to_string(),
                actual: "finalized".to_string(),
            })?;

        warn!(
            table_id = %table_id,
            run_id = %finalized.id,
            state = %finalized.state,
            created = finalized.counts.created,
            updated = finalized.counts.updated,
            deleted = finalized.counts.deleted,
            "Finalized orphaned sync run"
        );
        self.reschedule(table_id, &finalized).await;
        Ok(finalized)
    }

    /// Wait for this process's task on a table to finish.
    ///
    /// Returns `None` when no task is registered for the table or another
    /// caller already waits on it.
    pub async fn wait(&self, table_id: Uuid) -> Option<MirrorResult<SyncRun>> {
        // The entry stays registered while waiting: force-terminate reaches
        // the task through it even if this future is dropped.
        let (run_id, handle) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(&table_id)?;
            (job.run_id, job.handle.take()?)
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(MirrorError::internal(format!("sync task failed: {e}"))),
        };

        let mut jobs = self.jobs.lock().await;
        if jobs.get(&table_id).is_some_and(|job| job.run_id == run_id) {
            jobs.remove(&table_id);
        }
        Some(result)
    }

    /// Number of live tasks.
    pub async fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| !job.task.is_finished())
            .count()
    }

    async fn reschedule(&self, table_id: Uuid, run: &SyncRun) {
        match self.store.get_table(table_id).await {
            Ok(Some(table)) => reschedule(self.store.as_ref(), &table, run).await,
            Ok(None) => {}
            Err(e) => warn!(table_id = %table_id, error = %e, "Could not reload table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunCounts;
    use crate::store::InMemoryStore;
    use crate::types::{RunScope, RunState, TriggerType};

    fn monitor(store: Arc<InMemoryStore>, config: EngineConfig) -> JobMonitor {
        JobMonitor::new(store, config)
    }

    #[tokio::test]
    async fn test_status_without_runs() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = monitor(store, EngineConfig::default());
        let status = monitor.status(Uuid::new_v4()).await.unwrap();
        assert!(status.run.is_none());
        assert!(!status.is_active());
    }

    #[tokio::test]
    async fn test_unowned_active_run_is_orphaned_and_stalled() {
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig {
            long_running_threshold_secs: 0,
            stall_threshold_secs: 0,
            ..EngineConfig::default()
        };
        let table_id = Uuid::new_v4();
        let mut run = SyncRun::new(table_id, TriggerType::Manual, RunScope::Full);
        run.started_at = Utc::now() - chrono::Duration::seconds(5);
        store.begin_run(&run).await.unwrap();

        let monitor = monitor(Arc::clone(&store), config);
        let status = monitor.status(table_id).await.unwrap();
        assert!(status.is_active());
        assert!(status.orphaned);
        assert!(status.long_running);
        assert!(status.stalled);
    }

    #[tokio::test]
    async fn test_fresh_unowned_run_is_not_orphaned() {
        let store = Arc::new(InMemoryStore::new());
        let table_id = Uuid::new_v4();
        let run = SyncRun::new(table_id, TriggerType::Manual, RunScope::Full);
        store.begin_run(&run).await.unwrap();

        let monitor = monitor(Arc::clone(&store), EngineConfig::default());
        let status = monitor.status(table_id).await.unwrap();
        assert!(status.is_active());
        assert!(!status.orphaned);

        let err = monitor.finalize_orphaned(table_id).await.unwrap_err();
        assert!(matches!(err, MirrorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_force_terminate_requires_active_run() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = monitor(store, EngineConfig::default());
        let err = monitor.force_terminate(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MirrorError::NoActiveRun { .. }));
    }

    #[tokio::test]
    async fn test_force_terminate_cancels_owned_task() {
        let store = Arc::new(InMemoryStore::new());
        let table_id = Uuid::new_v4();
        let run = SyncRun::new(table_id, TriggerType::Manual, RunScope::Full);
        store.begin_run(&run).await.unwrap();

        let monitor = monitor(Arc::clone(&store), EngineConfig::default());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let run_for_task = run.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            Ok(run_for_task)
        });
        monitor.register(table_id, run.id, cancel.clone(), handle).await;
        assert!(monitor.owns(table_id, run.id).await);

        let terminated = monitor.force_terminate(table_id).await.unwrap();
        assert_eq!(terminated.state, RunState::Terminated);
        assert!(cancel.is_cancelled());
        assert!(monitor.wait(table_id).await.is_some());
        assert_eq!(monitor.active_jobs().await, 0);

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Terminated);
        assert_eq!(stored.counts, RunCounts::default());
    }
}
