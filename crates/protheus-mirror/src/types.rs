//! Common enums shared by the mirror engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a table's next run is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fixed interval after the previous run finished.
    Interval,
    /// A list of times of day.
    FixedSchedule,
    /// A cron expression.
    Cron,
}

impl SyncMode {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Interval => "interval",
            SyncMode::FixedSchedule => "fixed_schedule",
            SyncMode::Cron => "cron",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interval" => Ok(SyncMode::Interval),
            "fixed_schedule" | "schedule" => Ok(SyncMode::FixedSchedule),
            "cron" => Ok(SyncMode::Cron),
            _ => Err(format!("Unknown sync mode: {s}")),
        }
    }
}

/// Unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }

    /// Duration of `value` units.
    #[must_use]
    pub fn duration(&self, value: u32) -> chrono::Duration {
        let value = i64::from(value);
        match self {
            IntervalUnit::Minutes => chrono::Duration::minutes(value),
            IntervalUnit::Hours => chrono::Duration::hours(value),
            IntervalUnit::Days => chrono::Duration::days(value),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minute" | "minutes" => Ok(IntervalUnit::Minutes),
            "hour" | "hours" => Ok(IntervalUnit::Hours),
            "day" | "days" => Ok(IntervalUnit::Days),
            _ => Err(format!("Unknown interval unit: {s}")),
        }
    }
}

/// What a run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    /// Records changed since the last successful run.
    Incremental,
    /// The complete remote set; absent rows are soft-deleted.
    Full,
    /// Truncate the mirror and repopulate from a complete fetch.
    Cleanup,
    /// Operator-supplied CSV rows.
    Import,
    /// Restore of archived records.
    Restore,
}

impl RunScope {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunScope::Incremental => "incremental",
            RunScope::Full => "full",
            RunScope::Cleanup => "cleanup",
            RunScope::Import => "import",
            RunScope::Restore => "restore",
        }
    }

    /// Whether this scope fetches from the ERP source.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            RunScope::Incremental | RunScope::Full | RunScope::Cleanup
        )
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(RunScope::Incremental),
            "full" => Ok(RunScope::Full),
            "cleanup" => Ok(RunScope::Cleanup),
            "import" => Ok(RunScope::Import),
            "restore" => Ok(RunScope::Restore),
            _ => Err(format!("Unknown run scope: {s}")),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    FullCleanup,
    ManualImport,
    Restore,
}

impl TriggerType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::FullCleanup => "full_cleanup",
            TriggerType::ManualImport => "manual_import",
            TriggerType::Restore => "restore",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            "full_cleanup" => Ok(TriggerType::FullCleanup),
            "manual_import" => Ok(TriggerType::ManualImport),
            "restore" => Ok(TriggerType::Restore),
            _ => Err(format!("Unknown trigger type: {s}")),
        }
    }
}

/// Lifecycle state of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RunState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Terminated => "terminated",
        }
    }

    /// Pending and running runs hold the table's run slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Pending | RunState::Running)
    }

    /// Check if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Check whether the state machine allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match self {
            RunState::Pending => matches!(
                next,
                RunState::Running | RunState::Failed | RunState::Terminated
            ),
            RunState::Running => matches!(
                next,
                RunState::Completed | RunState::Failed | RunState::Terminated
            ),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "terminated" => Ok(RunState::Terminated),
            _ => Err(format!("Unknown run state: {s}")),
        }
    }
}

/// Change status of a mirrored record, computed by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    New,
    Updated,
    Unchanged,
    Deleted,
}

impl RecordStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Updated => "updated",
            RecordStatus::Unchanged => "unchanged",
            RecordStatus::Deleted => "deleted",
        }
    }

    /// Whether the record changed in the reference run.
    #[must_use]
    pub fn is_change(&self) -> bool {
        !matches!(self, RecordStatus::Unchanged)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(RecordStatus::New),
            "updated" => Ok(RecordStatus::Updated),
            "unchanged" => Ok(RecordStatus::Unchanged),
            "deleted" => Ok(RecordStatus::Deleted),
            _ => Err(format!("Unknown record status: {s}")),
        }
    }
}
