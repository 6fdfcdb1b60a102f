//! Sync scheduling.
//!
//! Computes when a table is next due. Nothing here runs unattended: callers
//! ask which tables are due and trigger them.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{MirrorError, MirrorResult};
use crate::table::SourceTableConfig;
use crate::types::SyncMode;

/// Parse a cron expression.
///
/// Five-field expressions (minute precision) get a leading seconds field;
/// six and seven field expressions are used as given. Evaluated in UTC.
pub fn parse_cron(expression: &str) -> MirrorResult<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(MirrorError::invalid_config(format!(
                "cron expression '{expression}' must have 5, 6 or 7 fields"
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| {
        MirrorError::invalid_config(format!("invalid cron expression '{expression}': {e}"))
    })
}

/// Scheduler for table sync runs.
pub struct Scheduler;

impl Scheduler {
    /// Calculate when the table is next due.
    ///
    /// Interval schedules count from the last finished run (or `now` when the
    /// table never ran). Fixed schedules and cron pick the first slot after
    /// `now`.
    pub fn next_due_at(
        config: &SourceTableConfig,
        last_finished: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MirrorResult<Option<DateTime<Utc>>> {
        match config.sync_mode {
            SyncMode::Interval => {
                let (Some(value), Some(unit)) = (config.interval_value, config.interval_unit) else {
                    return Err(MirrorError::invalid_config("interval schedule is incomplete"));
                };
                let base = last_finished.unwrap_or(now);
                Ok(Some(base + unit.duration(value)))
            }
            SyncMode::FixedSchedule => Self::next_fixed(config, now),
            SyncMode::Cron => {
                let expr = config.cron_expression.as_deref().unwrap_or_default();
                let schedule = parse_cron(expr)?;
                Ok(schedule.after(&now).next())
            }
        }
    }

    /// Nearest future time of day in the schedule list.
    fn next_fixed(config: &SourceTableConfig, now: DateTime<Utc>) -> MirrorResult<Option<DateTime<Utc>>> {
        let times = config.schedule_times()?;
        let today = now.date_naive();

        let next = times
            .iter()
            .map(|t| today.and_time(*t).and_utc())
            .find(|candidate| *candidate > now)
            .or_else(|| {
                times
                    .first()
                    .map(|t| (today + Duration::days(1)).and_time(*t).and_utc())
            });

        Ok(next)
    }

    /// Whether the table is due at `now`.
    #[must_use]
    pub fn is_due(config: &SourceTableConfig, now: DateTime<Utc>) -> bool {
        config.is_active && config.next_due_at.is_some_and(|due| now >= due)
    }

    /// Filter the tables that are due at `now`.
    #[must_use]
    pub fn due_tables<'a>(
        tables: &'a [SourceTableConfig],
        now: DateTime<Utc>,
    ) -> Vec<&'a SourceTableConfig> {
        tables.iter().filter(|t| Self::is_due(t, now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalUnit;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_interval_counts_from_last_finish() {
        let table = SourceTableConfig::new("SA2010").with_interval(30, IntervalUnit::Minutes);
        let next = Scheduler::next_due_at(&table, Some(at(10, 0)), at(10, 5)).unwrap();
        assert_eq!(next, Some(at(10, 30)));

        let next = Scheduler::next_due_at(&table, None, at(10, 5)).unwrap();
        assert_eq!(next, Some(at(10, 35)));
    }

    #[test]
    fn test_fixed_schedule_nearest_future_time() {
        let table = SourceTableConfig::new("SA2010").with_schedule(["18:00", "08:00", "12:30"]);

        assert_eq!(Scheduler::next_due_at(&table, None, at(9, 0)).unwrap(), Some(at(12, 30)));
        assert_eq!(Scheduler::next_due_at(&table, None, at(12, 30)).unwrap(), Some(at(18, 0)));

        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 16, 8, 0, 0).unwrap();
        assert_eq!(Scheduler::next_due_at(&table, None, at(19, 0)).unwrap(), Some(tomorrow));
    }

    #[test]
    fn test_cron_next_match() {
        let table = SourceTableConfig::new("SA2010").with_cron("*/15 * * * *");
        assert_eq!(Scheduler::next_due_at(&table, None, at(10, 7)).unwrap(), Some(at(10, 15)));

        let table = SourceTableConfig::new("SA2010").with_cron("0 0 6 * * *");
        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 16, 6, 0, 0).unwrap();
        assert_eq!(Scheduler::next_due_at(&table, None, at(7, 0)).unwrap(), Some(tomorrow));
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("0 6 * * *").is_ok());
        assert!(parse_cron("0 0 6 * * MON-FRI").is_ok());
        assert!(parse_cron("* *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[test]
    fn test_is_due() {
        let mut table = SourceTableConfig::new("SA2010");
        assert!(!Scheduler::is_due(&table, at(10, 0)));

        table.next_due_at = Some(at(10, 0));
        assert!(Scheduler::is_due(&table, at(10, 0)));
        assert!(Scheduler::is_due(&table, at(11, 0)));
        assert!(!Scheduler::is_due(&table, at(9, 59)));

        table.is_active = false;
        assert!(!Scheduler::is_due(&table, at(11, 0)));
    }

    #[test]
    fn test_due_tables_filters() {
        let mut due = SourceTableConfig::new("SA1010");
        due.next_due_at = Some(at(9, 0));
        let mut later = SourceTableConfig::new("SA2010");
        later.next_due_at = Some(at(12, 0));

        let tables = vec![due, later];
        let result = Scheduler::due_tables(&tables, at(10, 0));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].source_table, "SA1010");
    }
}
