//! Table definition commands

use clap::{Args, Subcommand};
use protheus_mirror::{IntervalUnit, MirrorService, RunScope, SourceTableConfig, SyncMode};

use crate::commands::resolve_table;
use crate::error::{CliError, CliResult};
use crate::output::{print_json, print_key_value, print_success, print_tables};

/// Table definition commands
#[derive(Args, Debug)]
pub struct TablesArgs {
    #[command(subcommand)]
    pub command: TablesCommands,
}

#[derive(Subcommand, Debug)]
pub enum TablesCommands {
    /// List configured tables
    List,
    /// Show one table definition
    Show(TableRef),
    /// Register an ERP table to mirror
    Add(AddArgs),
    /// Change the schedule or flags of a table
    Update(UpdateArgs),
    /// Remove a table definition (the mirror's rows stay)
    Remove(TableRef),
    /// Create the mirror table if it does not exist yet
    CreateMirror(TableRef),
}

/// A table given by id or ERP name
#[derive(Args, Debug)]
pub struct TableRef {
    /// Table id (UUID) or ERP table name, e.g. SA2010
    pub table: String,
}

/// Schedule options shared by add and update
#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Run every N units, e.g. --every 30 --unit minutes
    #[arg(long, requires = "unit", conflicts_with_all = ["at", "cron"])]
    pub every: Option<u32>,

    /// Interval unit: minutes, hours, days
    #[arg(long)]
    pub unit: Option<IntervalUnit>,

    /// Run at fixed times of day (HH:MM, repeatable)
    #[arg(long, conflicts_with = "cron")]
    pub at: Vec<String>,

    /// Run on a cron expression (5 to 7 fields, UTC)
    #[arg(long)]
    pub cron: Option<String>,

    /// Scope of scheduled runs: incremental or full
    #[arg(long)]
    pub scope: Option<RunScope>,
}

impl ScheduleArgs {
    fn is_empty(&self) -> bool {
        self.every.is_none() && self.at.is_empty() && self.cron.is_none() && self.scope.is_none()
    }

    fn apply(self, mut table: SourceTableConfig) -> CliResult<SourceTableConfig> {
        if let Some(value) = self.every {
            let unit = self
                .unit
                .ok_or_else(|| CliError::Validation("--every needs --unit".into()))?;
            table = table.with_interval(value, unit);
        } else if !self.at.is_empty() {
            table = table.with_schedule(self.at);
        } else if let Some(expression) = self.cron {
            table = table.with_cron(expression);
        }
        if let Some(scope) = self.scope {
            if !matches!(scope, RunScope::Incremental | RunScope::Full) {
                return Err(CliError::Validation(
                    "scheduled scope must be incremental or full".into(),
                ));
            }
            table.scheduled_scope = Some(scope);
        }
        Ok(table)
    }
}

/// Arguments for the add command
#[derive(Args, Debug)]
pub struct AddArgs {
    /// ERP table name, e.g. SA2010
    pub source_table: String,

    /// Mirror table name (default: mirror_<table>)
    #[arg(long)]
    pub mirror_table: Option<String>,

    /// Key fields (repeatable, default R_E_C_N_O_)
    #[arg(long = "key")]
    pub keys: Vec<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Mark the table as used by systems outside Protheus
    #[arg(long)]
    pub linked_outside: bool,

    #[command(flatten)]
    pub schedule: ScheduleArgs,
}

/// Arguments for the update command
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    #[arg(long)]
    pub description: Option<String>,

    /// Enable or disable scheduled runs
    #[arg(long)]
    pub active: Option<bool>,

    #[arg(long)]
    pub linked_outside: Option<bool>,

    #[command(flatten)]
    pub schedule: ScheduleArgs,
}

/// Execute a table command
pub async fn execute(service: &MirrorService, args: TablesArgs, json: bool) -> CliResult<()> {
    match args.command {
        TablesCommands::List => {
            let tables = service.list_tables().await?;
            if json {
                print_json(&tables)?;
            } else {
                print_tables(&tables);
            }
        }
        TablesCommands::Show(r) => {
            let table = resolve_table(service, &r.table).await?;
            show(&table, json)?;
        }
        TablesCommands::Add(args) => {
            let mut table = SourceTableConfig::new(args.source_table);
            table.mirror_table = args.mirror_table;
            table.description = args.description;
            table.linked_outside_protheus = args.linked_outside;
            if !args.keys.is_empty() {
                table = table.with_key_fields(args.keys);
            }
            let table = args.schedule.apply(table)?;

            let created = service.create_table(table).await?;
            if json {
                print_json(&created)?;
            } else {
                print_success(&format!("Registered {} as {}", created.source_table, created.id));
            }
        }
        TablesCommands::Update(args) => {
            let mut table = resolve_table(service, &args.table).await?;
            if let Some(description) = args.description {
                table.description = Some(description);
            }
            if let Some(active) = args.active {
                table.is_active = active;
            }
            if let Some(linked) = args.linked_outside {
                table.linked_outside_protheus = linked;
            }
            if !args.schedule.is_empty() {
                table = args.schedule.apply(table)?;
            }

            let updated = service.update_table(table).await?;
            if json {
                print_json(&updated)?;
            } else {
                print_success(&format!("Updated {}", updated.source_table));
            }
        }
        TablesCommands::Remove(r) => {
            let table = resolve_table(service, &r.table).await?;
            service.delete_table(table.id).await?;
            if !json {
                print_success(&format!("Removed {}", table.source_table));
            }
        }
        TablesCommands::CreateMirror(r) => {
            let table = resolve_table(service, &r.table).await?;
            let schema = service.create_mirror_table(table.id).await?;
            if json {
                print_json(&schema)?;
            } else {
                print_success(&format!("Mirror {} is ready", schema.mirror_table));
            }
        }
    }
    Ok(())
}

fn show(table: &SourceTableConfig, json: bool) -> CliResult<()> {
    if json {
        return print_json(table);
    }
    print_key_value("ID", &table.id.to_string());
    print_key_value("Table", &table.source_table);
    print_key_value("Mirror", &table.mirror_table_name());
    print_key_value("Mirror exists", if table.mirror_table_exists { "yes" } else { "no" });
    print_key_value("Keys", &table.key_fields.join(", "));
    print_key_value("Mode", table.sync_mode.as_str());
    match table.sync_mode {
        SyncMode::Interval => print_key_value(
            "Every",
            &format!(
                "{} {}",
                table.interval_value.unwrap_or_default(),
                table.interval_unit.map_or("?", |u| u.as_str())
            ),
        ),
        SyncMode::FixedSchedule => print_key_value("At", &table.schedule.join(", ")),
        SyncMode::Cron => print_key_value("Cron", table.cron_expression.as_deref().unwrap_or("-")),
    }
    if let Some(due) = table.next_due_at {
        print_key_value("Next due", &due.to_rfc3339());
    }
    print_key_value("Active", if table.is_active { "yes" } else { "no" });
    if table.linked_outside_protheus {
        print_key_value("Linked outside", "yes");
    }
    Ok(())
}
