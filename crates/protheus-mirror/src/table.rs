//! Source table configuration.
//!
//! One [`SourceTableConfig`] exists per mirrored ERP table. It carries the
//! scheduling parameters, the key fields that identify a record, and the
//! flags that protect the definition from deletion.

use chrono::{DateTime, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{MirrorError, MirrorResult};
use crate::scheduler::parse_cron;
use crate::types::{IntervalUnit, RunScope, SyncMode};

/// Default key field of Protheus tables.
pub const DEFAULT_KEY_FIELD: &str = "R_E_C_N_O_";

/// Prefix for generated mirror table names.
pub const MIRROR_TABLE_PREFIX: &str = "mirror_";

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").expect("valid identifier regex"))
}

/// Check that a name is safe to use as an SQL identifier.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

/// Configuration of one mirrored ERP table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTableConfig {
    /// Stable ID.
    pub id: Uuid,
    /// ERP table name (e.g. `SA2010`).
    pub source_table: String,
    /// Local mirror table name, set once the mirror is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_table: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Fields whose values identify a record.
    pub key_fields: Vec<String>,
    /// Scheduling mode.
    pub sync_mode: SyncMode,
    /// Interval value (interval mode).
    #[serde(default)]
    pub interval_value: Option<u32>,
    /// Interval unit (interval mode).
    #[serde(default)]
    pub interval_unit: Option<IntervalUnit>,
    /// Times of day as `HH:MM` (fixed schedule mode).
    #[serde(default)]
    pub schedule: Vec<String>,
    /// Cron expression (cron mode).
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Scope used when a scheduled run fires. `None` uses the engine default.
    #[serde(default)]
    pub scheduled_scope: Option<RunScope>,
    /// Next time the table is due.
    #[serde(default)]
    pub next_due_at: Option<DateTime<Utc>>,
    /// Inactive tables are never due.
    pub is_active: bool,
    /// Protects the definition from deletion.
    pub linked_outside_protheus: bool,
    /// Whether the mirror table exists.
    pub mirror_table_exists: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl SourceTableConfig {
    /// Create a new interval-scheduled table definition.
    #[must_use]
    pub fn new(source_table: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_table: source_table.into(),
            mirror_table: None,
            description: None,
            key_fields: vec![DEFAULT_KEY_FIELD.to_string()],
            sync_mode: SyncMode::Interval,
            interval_value: Some(1),
            interval_unit: Some(IntervalUnit::Hours),
            schedule: Vec::new(),
            cron_expression: None,
            scheduled_scope: None,
            next_due_at: None,
            is_active: true,
            linked_outside_protheus: false,
            mirror_table_exists: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the key fields.
    #[must_use]
    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Use an interval schedule.
    #[must_use]
    pub fn with_interval(mut self, value: u32, unit: IntervalUnit) -> Self {
        self.sync_mode = SyncMode::Interval;
        self.interval_value = Some(value);
        self.interval_unit = Some(unit);
        self
    }

    /// Use a fixed list of times of day.
    #[must_use]
    pub fn with_schedule<I, S>(mut self, times: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync_mode = SyncMode::FixedSchedule;
        self.schedule = times.into_iter().map(Into::into).collect();
        self
    }

    /// Use a cron expression.
    #[must_use]
    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.sync_mode = SyncMode::Cron;
        self.cron_expression = Some(expression.into());
        self
    }

    /// Mark the table as linked outside Protheus.
    #[must_use]
    pub fn linked_outside(mut self, linked: bool) -> Self {
        self.linked_outside_protheus = linked;
        self
    }

    /// Name the mirror table gets when it is created.
    #[must_use]
    pub fn default_mirror_table(&self) -> String {
        format!("{MIRROR_TABLE_PREFIX}{}", self.source_table.to_lowercase())
    }

    /// Mirror table name, existing or planned.
    #[must_use]
    pub fn mirror_table_name(&self) -> String {
        self.mirror_table
            .clone()
            .unwrap_or_else(|| self.default_mirror_table())
    }

    /// Parsed fixed-schedule times, sorted.
    pub fn schedule_times(&self) -> MirrorResult<Vec<NaiveTime>> {
        let mut times = self
            .schedule
            .iter()
            .map(|s| {
                NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| {
                    MirrorError::invalid_config(format!("invalid time of day '{s}', expected HH:MM"))
                })
            })
            .collect::<MirrorResult<Vec<_>>>()?;
        times.sort();
        times.dedup();
        Ok(times)
    }

    /// Validate the table definition.
    pub fn validate(&self) -> MirrorResult<()> {
        if !is_valid_identifier(&self.source_table) {
            return Err(MirrorError::invalid_config(format!(
                "invalid source table name '{}'",
                self.source_table
            )));
        }

        if let Some(mirror) = &self.mirror_table {
            if !is_valid_identifier(mirror) {
                return Err(MirrorError::invalid_config(format!(
                    "invalid mirror table name '{mirror}'"
                )));
            }
        }

        if self.key_fields.is_empty() || self.key_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(MirrorError::invalid_config(
                "at least one non-empty key field is required",
            ));
        }

        match self.sync_mode {
            SyncMode::Interval => match (self.interval_value, self.interval_unit) {
                (Some(value), Some(_)) if value > 0 => {}
                _ => {
                    return Err(MirrorError::invalid_config(
                        "interval mode requires a positive interval value and a unit",
                    ))
                }
            },
            SyncMode::FixedSchedule => {
                if self.schedule.is_empty() {
                    return Err(MirrorError::invalid_config(
                        "fixed schedule mode requires at least one time of day",
                    ));
                }
                self.schedule_times()?;
            }
            SyncMode::Cron => {
                let expr = self.cron_expression.as_deref().unwrap_or_default();
                parse_cron(expr)?;
            }
        }

        if let Some(scope) = self.scheduled_scope {
            if !matches!(scope, RunScope::Incremental | RunScope::Full) {
                return Err(MirrorError::invalid_config(format!(
                    "scheduled runs must be incremental or full, got {scope}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_defaults() {
        let table = SourceTableConfig::new("SA2010");
        assert_eq!(table.key_fields, vec![DEFAULT_KEY_FIELD.to_string()]);
        assert_eq!(table.sync_mode, SyncMode::Interval);
        assert!(table.is_active);
        assert!(!table.mirror_table_exists);
        assert_eq!(table.mirror_table_name(), "mirror_sa2010");
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_identifiers() {
        assert!(SourceTableConfig::new("SA2010; DROP TABLE x").validate().is_err());
        assert!(SourceTableConfig::new("").validate().is_err());

        let mut table = SourceTableConfig::new("SA1010");
        table.mirror_table = Some("mirror sa1010".to_string());
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_schedule_modes() {
        let table = SourceTableConfig::new("SA1010").with_interval(0, IntervalUnit::Minutes);
        assert!(table.validate().is_err());

        let table = SourceTableConfig::new("SA1010").with_schedule(Vec::<String>::new());
        assert!(table.validate().is_err());

        let table = SourceTableConfig::new("SA1010").with_schedule(["08:00", "25:99"]);
        assert!(table.validate().is_err());

        let table = SourceTableConfig::new("SA1010").with_schedule(["18:30", "08:00"]);
        assert!(table.validate().is_ok());
        let times = table.schedule_times().unwrap();
        assert_eq!(times[0], NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        let table = SourceTableConfig::new("SA1010").with_cron("not a cron");
        assert!(table.validate().is_err());

        let table = SourceTableConfig::new("SA1010").with_cron("0 6 * * *");
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_validate_key_fields() {
        let table = SourceTableConfig::new("SA1010").with_key_fields(Vec::<String>::new());
        assert!(table.validate().is_err());

        let table = SourceTableConfig::new("SA1010").with_key_fields(["A1_FILIAL", "A1_COD"]);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_validate_scheduled_scope() {
        let mut table = SourceTableConfig::new("SA1010");
        table.scheduled_scope = Some(RunScope::Import);
        assert!(table.validate().is_err());

        table.scheduled_scope = Some(RunScope::Full);
        assert!(table.validate().is_ok());
    }
}
