//! Scheduling commands: list due tables and start their runs
//!
//! The engine only computes due-ness. `run-due` is the external invoker:
//! run it from cron or a systemd timer, or with `--every` as a standalone
//! process that repeats the same pass.

use std::time::Duration;

use chrono::Utc;
use clap::Args;
use protheus_mirror::{MirrorError, MirrorService, ScheduledStart, SyncRun};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::commands::drain_tasks;
use crate::error::CliResult;
use crate::output::{print_json, print_run, print_tables};

/// Arguments for the run-due command
#[derive(Args, Debug)]
pub struct RunDueArgs {
    /// Keep running, checking for due tables every N seconds
    #[arg(long, value_name = "SECS")]
    pub every: Option<u64>,
}

/// How a scheduling pass ended.
enum Pass {
    /// Every started run finished.
    Finished(Vec<SyncRun>),
    /// Ctrl-C arrived; the started runs were terminated.
    Interrupted(Vec<SyncRun>),
}

/// List tables due now
pub async fn due(service: &MirrorService, json: bool) -> CliResult<()> {
    let tables = service.due_tables(Utc::now()).await?;
    if json {
        print_json(&tables)
    } else {
        print_tables(&tables);
        Ok(())
    }
}

/// Start runs for due tables and wait for them.
///
/// With `--every`, repeats until Ctrl-C. Ctrl-C during a pass terminates
/// the runs it started before exiting.
pub async fn run_due(service: &MirrorService, args: RunDueArgs, json: bool) -> CliResult<()> {
    let Some(every) = args.every else {
        let (Pass::Finished(runs) | Pass::Interrupted(runs)) = pass(service).await?;
        return report(&runs, json);
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(every_secs = every, "Scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Scheduler stopping");
                return Ok(());
            }
        }

        match pass(service).await {
            Ok(Pass::Finished(finished)) => report(&finished, json)?,
            Ok(Pass::Interrupted(terminated)) => {
                report(&terminated, json)?;
                info!("Scheduler stopping");
                return Ok(());
            }
            Err(e) => error!(error = %e, "Scheduled pass failed"),
        }
    }
}

/// One scheduling pass: start every due table, then wait for each run.
async fn pass(service: &MirrorService) -> CliResult<Pass> {
    let starts = service.run_due(Utc::now()).await?;
    let started = started_tables(&starts);

    tokio::select! {
        finished = wait_all(service, &started) => Ok(Pass::Finished(finished)),
        _ = tokio::signal::ctrl_c() => {
            warn!(runs = started.len(), "Interrupted, terminating scheduled runs");
            Ok(Pass::Interrupted(interrupt(service, &started).await))
        }
    }
}

/// Tables a pass started runs on. Skipped tables are logged.
fn started_tables(starts: &[ScheduledStart]) -> Vec<Uuid> {
    starts
        .iter()
        .filter_map(|start| match start {
            ScheduledStart::Started { table_id, run_id } => {
                info!(%table_id, %run_id, "Started scheduled run");
                Some(*table_id)
            }
            ScheduledStart::Skipped { table_id, reason } => {
                info!(%table_id, %reason, "Skipped due table");
                None
            }
        })
        .collect()
}

async fn wait_all(service: &MirrorService, tables: &[Uuid]) -> Vec<SyncRun> {
    let mut finished = Vec::new();
    for &table_id in tables {
        match service.wait_for_run(table_id).await {
            Some(Ok(run)) => finished.push(run),
            Some(Err(e)) => error!(%table_id, error = %e, "Scheduled run failed"),
            None => {}
        }
    }
    finished
}

/// Force-terminate the runs a pass started and let their tasks stop.
///
/// Runs that already finished are left as they are.
async fn interrupt(service: &MirrorService, tables: &[Uuid]) -> Vec<SyncRun> {
    let mut terminated = Vec::new();
    for &table_id in tables {
        match service.force_terminate(table_id).await {
            Ok(run) => terminated.push(run),
            Err(MirrorError::NoActiveRun { .. }) => {}
            Err(e) => error!(%table_id, error = %e, "Could not terminate scheduled run"),
        }
    }
    drain_tasks(service).await;
    terminated
}

fn report(runs: &[SyncRun], json: bool) -> CliResult<()> {
    if json {
        return print_json(runs);
    }
    if runs.is_empty() {
        println!("No tables were due.");
    }
    for run in runs {
        print_run(run);
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use protheus_mirror::source::{
        FetchScope, PageRequest, RemotePage, SourceResult, TableSchema,
    };
    use protheus_mirror::{
        EngineConfig, ErpSource, InMemoryStore, MirrorStore, RunState, SourceTableConfig,
    };
    use serde_json::json;
    use std::sync::Arc;

    /// ERP that never runs out of pages.
    struct EndlessSource;

    #[async_trait]
    impl ErpSource for EndlessSource {
        async fn describe_table(&self, _table: &str) -> SourceResult<TableSchema> {
            Ok(TableSchema { fields: Vec::new() })
        }

        async fn fetch_page(
            &self,
            _table: &str,
            _scope: FetchScope,
            page: PageRequest,
        ) -> SourceResult<RemotePage> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let row = json!({"R_E_C_N_O_": page.page, "A2_NOME": "ACME"});
            Ok(RemotePage {
                items: row.as_object().cloned().into_iter().collect(),
                has_next: true,
            })
        }
    }

    #[tokio::test]
    async fn test_interrupt_terminates_started_runs() {
        let store = Arc::new(InMemoryStore::new());
        let service = MirrorService::new(store.clone(), Arc::new(EndlessSource), EngineConfig::default());
        let table = service
            .create_table(SourceTableConfig::new("SA2010"))
            .await
            .unwrap();

        let starts = service
            .run_due(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        let started = started_tables(&starts);
        assert_eq!(started, vec![table.id]);

        let terminated = interrupt(&service, &started).await;
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].state, RunState::Terminated);

        assert_eq!(service.monitor().active_jobs().await, 0);
        assert!(store.active_run(table.id).await.unwrap().is_none());

        // The table can be scheduled again right away.
        let err = service.force_terminate(table.id).await.unwrap_err();
        assert!(matches!(err, MirrorError::NoActiveRun { .. }));
    }

    #[tokio::test]
    async fn test_interrupt_skips_finished_tables() {
        let service = MirrorService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EndlessSource),
            EngineConfig::default(),
        );
        let table = service
            .create_table(SourceTableConfig::new("SA2010"))
            .await
            .unwrap();

        assert!(interrupt(&service, &[table.id]).await.is_empty());
    }
}
