//! Sync run records and per-row errors.
//!
//! A [`SyncRun`] is the audited job record of one reconciliation pass. It is
//! created by the store's `begin_run` and finalized exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{RunScope, RunState, TriggerType};

/// Record counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    #[serde(default)]
    pub created: u32,
    #[serde(default)]
    pub updated: u32,
    #[serde(default)]
    pub deleted: u32,
    #[serde(default)]
    pub unchanged: u32,
    /// Rows that failed with a row-level error.
    #[serde(default)]
    pub failed: u32,
}

impl RunCounts {
    /// Records the run changed.
    #[must_use]
    pub fn changed(&self) -> u32 {
        self.created + self.updated + self.deleted
    }

    /// Records the run looked at, failed ones included.
    #[must_use]
    pub fn processed(&self) -> u32 {
        self.changed() + self.unchanged + self.failed
    }

    /// Merge with another counts instance.
    pub fn merge(&mut self, other: &RunCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// One execution of the reconciliation process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub table_id: Uuid,
    pub trigger: TriggerType,
    pub scope: RunScope,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    /// Null while the run is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Updated after every processed batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    /// Binary fields left out of fingerprints.
    #[serde(default)]
    pub excluded_binary_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Operator who triggered the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

impl SyncRun {
    /// Create a pending run.
    #[must_use]
    pub fn new(table_id: Uuid, trigger: TriggerType, scope: RunScope) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_id,
            trigger,
            scope,
            state: RunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            last_heartbeat_at: None,
            counts: RunCounts::default(),
            excluded_binary_fields: Vec::new(),
            error_message: None,
            triggered_by: None,
        }
    }

    /// Set the operator who triggered the run.
    #[must_use]
    pub fn triggered_by(mut self, who: Option<String>) -> Self {
        self.triggered_by = who;
        self
    }

    /// Whether the run holds the table's run slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Time spent so far, or total duration once finished.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.finished_at.unwrap_or(now) - self.started_at
    }

    /// Whether a completed run can serve as the incremental cursor.
    #[must_use]
    pub fn is_successful_remote_run(&self) -> bool {
        self.state == RunState::Completed && self.scope.is_remote()
    }
}

/// Terminal outcome handed to the store when a run finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: RunState,
    pub counts: RunCounts,
    pub excluded_binary_fields: Vec<String>,
    pub error_message: Option<String>,
}

impl RunOutcome {
    /// Successful outcome.
    #[must_use]
    pub fn completed(counts: RunCounts, excluded_binary_fields: Vec<String>) -> Self {
        Self {
            state: RunState::Completed,
            counts,
            excluded_binary_fields,
            error_message: None,
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failed(counts: RunCounts, error: impl Into<String>) -> Self {
        Self {
            state: RunState::Failed,
            counts,
            excluded_binary_fields: Vec::new(),
            error_message: Some(error.into()),
        }
    }

    /// Operator-terminated outcome.
    #[must_use]
    pub fn terminated(counts: RunCounts) -> Self {
        Self {
            state: RunState::Terminated,
            counts,
            excluded_binary_fields: Vec::new(),
            error_message: Some("terminated by operator".to_string()),
        }
    }

    /// Keep the binary field list.
    #[must_use]
    pub fn with_excluded(mut self, fields: Vec<String>) -> Self {
        self.excluded_binary_fields = fields;
        self
    }
}

/// Kind of a per-row error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// The row could not be mapped (missing key, bad value).
    Transform,
    /// The mirror schema prevented a write.
    SchemaDrift,
    /// Writing the row failed.
    Write,
}

impl RowErrorKind {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RowErrorKind::Transform => "transform",
            RowErrorKind::SchemaDrift => "schema_drift",
            RowErrorKind::Write => "write",
        }
    }
}

impl fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RowErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transform" => Ok(RowErrorKind::Transform),
            "schema_drift" => Ok(RowErrorKind::SchemaDrift),
            "write" => Ok(RowErrorKind::Write),
            _ => Err(format!("Unknown row error kind: {s}")),
        }
    }
}

/// A per-record failure captured during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub id: Uuid,
    pub run_id: Uuid,
    pub table_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    pub kind: RowErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RowError {
    /// Create a row error for a run.
    #[must_use]
    pub fn new(
        run: &SyncRun,
        record_key: Option<String>,
        kind: RowErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run.id,
            table_id: run.table_id,
            record_key,
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Which errors the error viewer shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Errors of the most recent run only.
    #[default]
    LastRun,
    /// Every recorded error of the table.
    AllTime,
}

impl std::str::FromStr for ErrorScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "last_run" | "last" => Ok(ErrorScope::LastRun),
            "all_time" | "all" => Ok(ErrorScope::AllTime),
            _ => Err(format!("Unknown error scope: {s}")),
        }
    }
}
