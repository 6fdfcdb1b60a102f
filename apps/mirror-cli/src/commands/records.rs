//! Record commands: listing, archive, CSV import and export

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::PathBuf;

use clap::Args;
use protheus_mirror::{ExportScope, FieldFilter, MirrorService, RecordQuery, RecordStatus, SortSpec};

use crate::commands::resolve_table;
use crate::error::{CliError, CliResult};
use crate::output::{print_json, print_run, print_success};

/// Filter, sort and paging options
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Field filter: FIELD=value (exact) or FIELD~value (contains), repeatable
    #[arg(long = "filter")]
    pub filters: Vec<FieldFilter>,

    /// Only records with this status: new, updated, unchanged, deleted
    #[arg(long)]
    pub status: Option<RecordStatus>,

    /// Sort by key or a field; prefix with '-' for descending
    #[arg(long, allow_hyphen_values = true)]
    pub sort: Option<SortSpec>,

    #[arg(long, default_value = "1")]
    pub page: usize,

    #[arg(long, default_value = "50")]
    pub per_page: usize,
}

impl QueryArgs {
    fn into_query(self) -> RecordQuery {
        let mut query = RecordQuery::default().page(self.page, self.per_page);
        for filter in self.filters {
            query = query.with_filter(filter);
        }
        if let Some(status) = self.status {
            query = query.with_status(status);
        }
        if let Some(sort) = self.sort {
            query = query.sorted_by(sort);
        }
        query
    }
}

/// Arguments for the records command
#[derive(Args, Debug)]
pub struct RecordsArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    #[command(flatten)]
    pub query: QueryArgs,
}

/// Arguments for the deleted and purge commands
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,
}

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// Record keys to restore
    #[arg(required = true)]
    pub keys: Vec<String>,

    #[arg(long, env = "USER")]
    pub by: Option<String>,
}

/// Arguments for the import command
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// CSV file with a header row ('-' for stdin)
    pub file: PathBuf,

    #[arg(long, env = "USER")]
    pub by: Option<String>,
}

/// Arguments for the export command
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// Output file (default: stdout)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Only records changed by the latest run
    #[arg(long, conflicts_with_all = ["filters", "status"])]
    pub changes: bool,

    #[command(flatten)]
    pub query: QueryArgs,
}

/// List records with their status
pub async fn list(service: &MirrorService, args: RecordsArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let page = service.list_records(table.id, &args.query.into_query()).await?;
    if json {
        return print_json(&page);
    }

    for item in &page.items {
        let fields: Vec<String> = item
            .record
            .data
            .iter()
            .filter(|(name, _)| !table.key_fields.contains(name))
            .take(4)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        println!("{:<12}  {:<9}  {}", item.record.key, item.status.as_str(), fields.join("  "));
    }
    println!(
        "\nPage {} of {} ({} records)",
        page.page,
        page.total_pages(),
        page.total
    );
    Ok(())
}

/// List soft-deleted records
pub async fn deleted(service: &MirrorService, args: ArchiveArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let records = service.list_deleted(table.id).await?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No deleted records.");
        return Ok(());
    }
    for record in &records {
        let when = record
            .deleted_at
            .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
        println!("{:<12}  deleted {when}", record.key);
    }
    Ok(())
}

/// Restore soft-deleted records
pub async fn restore(service: &MirrorService, args: RestoreArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let run = service.restore(table.id, &args.keys, args.by).await?;
    if json {
        print_json(&run)
    } else {
        print_success(&format!("Restored {} record(s)", run.counts.updated));
        Ok(())
    }
}

/// Physically remove soft-deleted records
pub async fn purge(service: &MirrorService, args: ArchiveArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let purged = service.purge_deleted(table.id).await?;
    if json {
        print_json(&serde_json::json!({ "purged": purged }))
    } else {
        print_success(&format!("Purged {purged} deleted record(s)"));
        Ok(())
    }
}

/// Reconcile a CSV file into the mirror
pub async fn import(service: &MirrorService, args: ImportArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;

    let mut data = Vec::new();
    if args.file.as_os_str() == "-" {
        io::stdin().read_to_end(&mut data)?;
    } else {
        File::open(&args.file)
            .map_err(|e| CliError::Validation(format!("{}: {e}", args.file.display())))?
            .read_to_end(&mut data)?;
    }

    let run = service.import_csv(table.id, &data, args.by).await?;
    if json {
        print_json(&run)
    } else {
        print_run(&run);
        Ok(())
    }
}

/// Export records as CSV
pub async fn export(service: &MirrorService, args: ExportArgs) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let scope = if args.changes {
        ExportScope::ChangesSinceLastSync
    } else if args.query.filters.is_empty()
        && args.query.status.is_none()
        && args.query.sort.is_none()
    {
        ExportScope::All
    } else {
        ExportScope::Filtered(args.query.into_query())
    };

    let written = match &args.output {
        Some(path) => {
            let file = File::create(path)?;
            service.export(table.id, &scope, BufWriter::new(file)).await?
        }
        None => service.export(table.id, &scope, io::stdout()).await?,
    };

    if args.output.is_some() {
        print_success(&format!("Exported {written} record(s)"));
    }
    Ok(())
}
