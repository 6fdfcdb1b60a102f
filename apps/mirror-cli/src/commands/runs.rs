//! Run commands: trigger, supervise and inspect sync runs

use clap::Args;
use protheus_mirror::{ErrorScope, MirrorService, RunScope, RunState, SyncRun};
use tracing::warn;

use crate::commands::{drain_tasks, resolve_table};
use crate::error::{CliError, CliResult};
use crate::output::{print_json, print_key_value, print_run, print_success, print_warning};

/// Arguments for the sync command
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// incremental, full or cleanup (truncate and reload)
    #[arg(long, default_value = "incremental")]
    pub scope: RunScope,

    /// Name recorded as the run's initiator
    #[arg(long, env = "USER")]
    pub by: Option<String>,
}

/// Arguments for commands that act on a table's current run
#[derive(Args, Debug)]
pub struct RunTableArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,
}

/// Arguments for the history command
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// Maximum number of runs to show
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

/// Arguments for the errors command
#[derive(Args, Debug)]
pub struct ErrorsArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// last-run or all-time
    #[arg(long, default_value = "last-run")]
    pub scope: ErrorScope,
}

/// Trigger a run and follow it to the end.
///
/// Ctrl-C force-terminates the run instead of leaving it behind as orphaned.
pub async fn sync(service: &MirrorService, args: SyncArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let run = service.trigger_sync(table.id, args.scope, args.by).await?;
    if !json {
        println!("Started {} run {} on {}", run.scope, run.id, table.source_table);
    }

    let finished = tokio::select! {
        result = service.wait_for_run(table.id) => match result {
            Some(result) => result?,
            None => service
                .list_runs(table.id, 1)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| CliError::NotFound(format!("run {}", run.id)))?,
        },
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run.id, "Interrupted, terminating run");
            let terminated = service.force_terminate(table.id).await?;
            drain_tasks(service).await;
            terminated
        }
    };

    report(&finished, json)
}

fn report(run: &SyncRun, json: bool) -> CliResult<()> {
    if json {
        print_json(run)?;
    } else {
        print_run(run);
    }
    if run.state == RunState::Completed {
        Ok(())
    } else {
        Err(CliError::RunUnsuccessful {
            run_id: run.id.to_string(),
            state: run.state.to_string(),
        })
    }
}

/// Show the current run of a table
pub async fn status(service: &MirrorService, args: RunTableArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let status = service.sync_status(table.id).await?;
    if json {
        return print_json(&status);
    }

    let Some(run) = &status.run else {
        println!("{} has never synced.", table.source_table);
        return Ok(());
    };
    print_run(run);
    if let Some(elapsed) = status.elapsed_secs {
        print_key_value("Elapsed", &format!("{elapsed}s"));
    }
    if status.orphaned {
        print_warning("Run is orphaned: no process is working on it. Use 'finalize' to close it.");
    } else if status.stalled {
        print_warning("Run has not reported progress recently.");
    } else if status.long_running {
        print_warning("Run is taking longer than usual.");
    }
    Ok(())
}

/// Force-terminate the active run of a table
pub async fn terminate(service: &MirrorService, args: RunTableArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let run = service.force_terminate(table.id).await?;
    if json {
        print_json(&run)
    } else {
        print_success(&format!("Terminated run {}", run.id));
        Ok(())
    }
}

/// Close an orphaned run
pub async fn finalize(service: &MirrorService, args: RunTableArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let run = service.finalize_orphaned_run(table.id).await?;
    if json {
        print_json(&run)
    } else {
        print_success(&format!("Finalized run {} as {}", run.id, run.state));
        print_run(&run);
        Ok(())
    }
}

/// List past runs of a table
pub async fn history(service: &MirrorService, args: HistoryArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let runs = service.list_runs(table.id, args.limit).await?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<11}  {:<13}  {:<19}  {:>7}  {:>6}",
        "RUN", "STATE", "SCOPE", "TRIGGER", "STARTED", "CHANGED", "FAILED"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<10}  {:<11}  {:<13}  {:<19}  {:>7}  {:>6}",
            run.id.to_string(),
            run.state.as_str(),
            run.scope.as_str(),
            run.trigger.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.counts.changed(),
            run.counts.failed
        );
    }
    Ok(())
}

/// Show per-row errors
pub async fn errors(service: &MirrorService, args: ErrorsArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let errors = service.list_errors(table.id, args.scope).await?;
    if json {
        return print_json(&errors);
    }
    if errors.is_empty() {
        println!("No errors.");
        return Ok(());
    }
    for error in &errors {
        println!(
            "{}  {:<12}  {:<10}  {}",
            error.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            error.kind.as_str(),
            error.record_key.as_deref().unwrap_or("-"),
            error.message
        );
    }
    Ok(())
}
