//! Terminal output helpers

use serde::Serialize;

use protheus_mirror::{SourceTableConfig, SyncRun};

use crate::error::CliResult;

/// Print a key-value pair with alignment
pub fn print_key_value(key: &str, value: &str) {
    println!("{key:<18} {value}");
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    if std::env::var("NO_COLOR").is_err() {
        println!("\x1b[32m✓\x1b[0m {message}");
    } else {
        println!("✓ {message}");
    }
}

/// Print a warning message
pub fn print_warning(message: &str) {
    if std::env::var("NO_COLOR").is_err() {
        println!("\x1b[33m!\x1b[0m {message}");
    } else {
        println!("! {message}");
    }
}

/// Print a run summary
pub fn print_run(run: &SyncRun) {
    print_key_value("Run", &run.id.to_string());
    print_key_value("State", run.state.as_str());
    print_key_value("Scope", run.scope.as_str());
    print_key_value("Trigger", run.trigger.as_str());
    print_key_value("Started", &run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        print_key_value("Finished", &finished.to_rfc3339());
    }
    print_key_value(
        "Counts",
        &format!(
            "created {} / updated {} / deleted {} / unchanged {} / failed {}",
            run.counts.created,
            run.counts.updated,
            run.counts.deleted,
            run.counts.unchanged,
            run.counts.failed
        ),
    );
    if !run.excluded_binary_fields.is_empty() {
        print_key_value("Binary excluded", &run.excluded_binary_fields.join(", "));
    }
    if let Some(message) = &run.error_message {
        print_key_value("Error", message);
    }
}

/// Print one line per table
pub fn print_tables(tables: &[SourceTableConfig]) {
    if tables.is_empty() {
        println!("No tables configured.");
        return;
    }
    println!(
        "{:<36}  {:<10}  {:<10}  {:<6}  {}",
        "ID", "TABLE", "MODE", "ACTIVE", "NEXT DUE"
    );
    for table in tables {
        println!(
            "{:<36}  {:<10}  {:<10}  {:<6}  {}",
            table.id,
            truncate(&table.source_table, 10),
            table.sync_mode.as_str(),
            if table.is_active { "yes" } else { "no" },
            table
                .next_due_at
                .map_or_else(|| "-".to_string(), |due| due.to_rfc3339())
        );
    }
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("SA2010", 10), "SA2010");
        assert_eq!(truncate("VERY_LONG_TABLE", 6), "VERY_…");
    }
}
