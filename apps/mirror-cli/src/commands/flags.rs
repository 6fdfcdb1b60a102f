//! Flag anomaly commands

use clap::Args;
use protheus_mirror::{AnomalyKind, AnomalyReport, MirrorService, RemoteCheck};

use crate::commands::resolve_table;
use crate::error::CliResult;
use crate::output::{print_json, print_key_value, print_success, print_warning};

/// Arguments for the anomalies command
#[derive(Args, Debug)]
pub struct AnomaliesArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,
}

/// Arguments for the fix-flags command
#[derive(Args, Debug)]
pub struct FixFlagsArgs {
    /// Table id (UUID) or ERP table name
    pub table: String,

    /// Do not start a full sync when deletions are not reflected yet
    #[arg(long)]
    pub no_follow_up: bool,
}

const KINDS: [AnomalyKind; 4] = [
    AnomalyKind::ContradictoryFlags,
    AnomalyKind::StaleStatus,
    AnomalyKind::MissingHash,
    AnomalyKind::UnreflectedDeletion,
];

/// Scan a mirror for flag anomalies without changing it
pub async fn anomalies(service: &MirrorService, args: AnomaliesArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let report = service.detect_anomalies(table.id).await?;
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &AnomalyReport) {
    if !report.mirror_exists {
        println!("Mirror {} does not exist yet.", report.mirror_table);
        return;
    }
    if !report.missing_columns.is_empty() {
        print_key_value("Missing columns", &report.missing_columns.join(", "));
    }
    for kind in KINDS {
        print_key_value(kind.as_str(), &report.count(kind).to_string());
    }
    if let RemoteCheck::Unavailable(reason) = &report.remote_check {
        print_warning(&format!("Deletion check skipped: {reason}"));
    }
    if report.is_clean() {
        print_success("No anomalies found");
    }
}

/// Repair flag anomalies
pub async fn fix_flags(service: &MirrorService, args: FixFlagsArgs, json: bool) -> CliResult<()> {
    let table = resolve_table(service, &args.table).await?;
    let report = service.fix_flags(table.id, !args.no_follow_up).await?;

    let follow_up = match report.follow_up_run_id {
        Some(_) => service.wait_for_run(table.id).await.transpose()?,
        None => None,
    };

    if json {
        return print_json(&serde_json::json!({
            "repair": report,
            "follow_up_run": follow_up,
        }));
    }

    if !report.columns_added.is_empty() {
        print_key_value("Columns added", &report.columns_added.join(", "));
    }
    print_key_value("Flags normalized", &report.flags_normalized.to_string());
    print_key_value("Hashes recomputed", &report.hashes_recomputed.to_string());
    print_key_value("Unreflected", &report.unreflected_deletions.to_string());
    match follow_up {
        Some(run) => print_success(&format!(
            "Follow-up full sync {} marked {} deletion(s)",
            run.state, run.counts.deleted
        )),
        None if report.follow_up_full_sync_required => {
            print_warning("A full sync is needed to mark the unreflected deletions.");
        }
        None => {}
    }
    if report.total_repairs() == 0 && !report.follow_up_full_sync_required {
        print_success("Nothing to repair");
    }
    Ok(())
}
