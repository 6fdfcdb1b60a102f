//! mirrorctl - Operator and scheduler CLI for Protheus table mirrors
//!
//! This CLI enables operators to:
//! - Register ERP tables and their schedules
//! - Trigger, supervise, terminate and finalize sync runs
//! - Run due tables from cron or as a long-lived scheduler
//! - Repair flag anomalies, restore or purge deleted records
//! - Reconcile CSV files into a mirror and export mirror rows

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod error;
mod logging;
mod output;

use commands::{flags, records, runs, schedule, tables};
use config::CliConfig;
use error::CliResult;

/// mirrorctl - Protheus table mirror management
#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines (for scheduled invocations)
    #[arg(long, global = true, env = "MIRROR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage mirrored table definitions
    Tables(tables::TablesArgs),

    /// Run a sync now and wait for it
    Sync(runs::SyncArgs),

    /// Show the current run of a table
    Status(runs::RunTableArgs),

    /// Force-terminate the active run of a table
    Terminate(runs::RunTableArgs),

    /// Finalize a run left behind by a crashed process
    Finalize(runs::RunTableArgs),

    /// Show past runs of a table
    History(runs::HistoryArgs),

    /// Show per-row errors of a table
    Errors(runs::ErrorsArgs),

    /// List tables that are due now
    Due,

    /// Start runs for every due table
    RunDue(schedule::RunDueArgs),

    /// List mirror records with their status
    Records(records::RecordsArgs),

    /// List soft-deleted records
    Deleted(records::ArchiveArgs),

    /// Restore soft-deleted records
    Restore(records::RestoreArgs),

    /// Physically remove soft-deleted records
    Purge(records::ArchiveArgs),

    /// Reconcile a CSV file into a mirror
    Import(records::ImportArgs),

    /// Export mirror records as CSV
    Export(records::ExportArgs),

    /// Scan a mirror for flag anomalies
    Anomalies(flags::AnomaliesArgs),

    /// Repair flag anomalies
    FixFlags(flags::FixFlagsArgs),
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_json);

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = CliConfig::from_env()?;
    let service = commands::connect(&config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Tables(args) => tables::execute(&service, args, json).await,
        Commands::Sync(args) => runs::sync(&service, args, json).await,
        Commands::Status(args) => runs::status(&service, args, json).await,
        Commands::Terminate(args) => runs::terminate(&service, args, json).await,
        Commands::Finalize(args) => runs::finalize(&service, args, json).await,
        Commands::History(args) => runs::history(&service, args, json).await,
        Commands::Errors(args) => runs::errors(&service, args, json).await,
        Commands::Due => schedule::due(&service, json).await,
        Commands::RunDue(args) => schedule::run_due(&service, args, json).await,
        Commands::Records(args) => records::list(&service, args, json).await,
        Commands::Deleted(args) => records::deleted(&service, args, json).await,
        Commands::Restore(args) => records::restore(&service, args, json).await,
        Commands::Purge(args) => records::purge(&service, args, json).await,
        Commands::Import(args) => records::import(&service, args, json).await,
        Commands::Export(args) => records::export(&service, args).await,
        Commands::Anomalies(args) => flags::anomalies(&service, args, json).await,
        Commands::FixFlags(args) => flags::fix_flags(&service, args, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync() {
        let cli = Cli::try_parse_from(["mirrorctl", "sync", "SA2010", "--scope", "full"]).unwrap();
        match cli.command {
            Commands::Sync(args) => {
                assert_eq!(args.table, "SA2010");
                assert_eq!(args.scope, protheus_mirror::RunScope::Full);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_parse_export_changes() {
        let cli = Cli::try_parse_from([
            "mirrorctl",
            "--json",
            "export",
            "SA2010",
            "--changes",
            "-o",
            "changes.csv",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Export(ref a) if a.changes));
    }

    #[test]
    fn test_parse_records_query() {
        let cli = Cli::try_parse_from([
            "mirrorctl",
            "records",
            "SA2010",
            "--filter",
            "A2_NOME~acme",
            "--sort",
            "-A2_SALDO",
            "--status",
            "updated",
        ])
        .unwrap();
        let Commands::Records(args) = cli.command else {
            panic!("expected records");
        };
        assert_eq!(args.query.filters.len(), 1);
        assert_eq!(args.query.status, Some(protheus_mirror::RecordStatus::Updated));
    }

    #[test]
    fn test_schedule_options_conflict() {
        let parsed = Cli::try_parse_from([
            "mirrorctl",
            "tables",
            "add",
            "SA2010",
            "--every",
            "30",
            "--unit",
            "minutes",
            "--cron",
            "0 2 * * *",
        ]);
        assert!(parsed.is_err());
    }
}
