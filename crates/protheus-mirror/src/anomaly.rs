//! Flag anomaly detection and repair.
//!
//! An anomaly is a mirror row whose reconciliation metadata is inconsistent:
//! pending deletion while flagged new, an explicit status that disagrees with
//! a pending deletion, or no fingerprint at all. Schema drift (a mirror
//! created before soft-delete columns existed) and deletions the mirror never
//! reflected are reported alongside.
//!
//! Repair rewrites flags through the shared write rules and never touches run
//! stamps, so a second repair with no sync in between writes nothing.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::fingerprint::{record_key, Fingerprinter};
use crate::record::MirroredRecord;
use crate::source::{ErpSource, FetchScope, PageRequest};
use crate::store::MirrorStore;
use crate::sync::normalize_flags;
use crate::table::SourceTableConfig;
use crate::types::RecordStatus;

/// Kind of per-row anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Pending deletion and new at the same time.
    ContradictoryFlags,
    /// Pending deletion but the explicit status says otherwise.
    StaleStatus,
    /// No fingerprint stored.
    MissingHash,
    /// Absent in the ERP but not pending deletion.
    UnreflectedDeletion,
}

impl AnomalyKind {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::ContradictoryFlags => "contradictory_flags",
            AnomalyKind::StaleStatus => "stale_status",
            AnomalyKind::MissingHash => "missing_hash",
            AnomalyKind::UnreflectedDeletion => "unreflected_deletion",
        }
    }
}

/// One detected anomaly. Computed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagAnomaly {
    pub record_key: String,
    pub kind: AnomalyKind,
}

/// Outcome of the remote existence check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RemoteCheck {
    Checked,
    /// The ERP could not be scanned; unreflected deletions are unknown.
    Unavailable(String),
}

/// Result of a detection scan.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub table_id: Uuid,
    pub mirror_table: String,
    pub mirror_exists: bool,
    /// Soft-delete columns the mirror lacks.
    pub missing_columns: Vec<String>,
    pub anomalies: Vec<FlagAnomaly>,
    pub remote_check: RemoteCheck,
}

impl AnomalyReport {
    /// Number of anomalies of the given kind.
    #[must_use]
    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.anomalies.iter().filter(|a| a.kind == kind).count()
    }

    /// Whether the scan found nothing to repair.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_columns.is_empty() && self.anomalies.is_empty()
    }
}

/// Result of a repair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub table_id: Uuid,
    pub columns_added: Vec<String>,
    pub flags_normalized: u32,
    pub hashes_recomputed: u32,
    pub unreflected_deletions: u32,
    /// A full sync is needed to mark unreflected deletions.
    pub follow_up_full_sync_required: bool,
    /// Run started to reflect deletions, when one was triggered.
    pub follow_up_run_id: Option<Uuid>,
}

impl RepairReport {
    /// Writes performed by the repair.
    #[must_use]
    pub fn total_repairs(&self) -> u32 {
        self.columns_added.len() as u32 + self.flags_normalized + self.hashes_recomputed
    }
}

/// Scans and repairs one table's mirror.
pub struct AnomalyDetector {
    store: Arc<dyn MirrorStore>,
    source: Arc<dyn ErpSource>,
    config: EngineConfig,
}

impl AnomalyDetector {
    /// Create a new detector.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>, source: Arc<dyn ErpSource>, config: EngineConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Scan the mirror without writing anything.
    #[instrument(skip(self, table), fields(table_id = %table.id))]
    pub async fn detect(&self, table: &SourceTableConfig) -> MirrorResult<AnomalyReport> {
        let mirror = table.mirror_table_name();
        let schema = self.store.mirror_schema(&mirror).await?;

        if !schema.exists {
            return Ok(AnomalyReport {
                table_id: table.id,
                mirror_table: mirror,
                mirror_exists: false,
                missing_columns: Vec::new(),
                anomalies: Vec::new(),
                remote_check: RemoteCheck::Checked,
            });
        }

        let records = self.store.all_records(&mirror).await?;
        let mut anomalies: Vec<FlagAnomaly> = records.iter().flat_map(row_anomalies).collect();

        let remote_check = match self.remote_keys(table).await {
            Ok(remote) => {
                anomalies.extend(
                    unreflected(&records, &remote)
                        .into_iter()
                        .map(|record_key| FlagAnomaly {
                            record_key,
                            kind: AnomalyKind::UnreflectedDeletion,
                        }),
                );
                RemoteCheck::Checked
            }
            Err(e) => {
                warn!(table_id = %table.id, error = %e, "Remote existence check unavailable");
                RemoteCheck::Unavailable(e.to_string())
            }
        };

        Ok(AnomalyReport {
            table_id: table.id,
            mirror_table: mirror,
            mirror_exists: true,
            missing_columns: schema.missing_soft_delete_columns,
            anomalies,
            remote_check,
        })
    }

    /// Repair the mirror.
    ///
    /// Rejected while the table has an active run. Adds missing soft-delete
    /// columns, normalizes contradictory flags (deletion wins) and recomputes
    /// missing fingerprints. Unreflected deletions are only reported; marking
    /// them is left to a full sync.
    #[instrument(skip(self, table), fields(table_id = %table.id))]
    pub async fn repair(&self, table: &SourceTableConfig) -> MirrorResult<RepairReport> {
        if let Some(active) = self.store.active_run(table.id).await? {
            return Err(MirrorError::ConcurrencyConflict {
                table_id: table.id,
                run_id: active.id,
            });
        }

        let mut report = RepairReport {
            table_id: table.id,
            ..RepairReport::default()
        };

        let mirror = table.mirror_table_name();
        let mut schema = self.store.mirror_schema(&mirror).await?;
        if !schema.exists {
            return Ok(report);
        }

        if !schema.missing_soft_delete_columns.is_empty() {
            report.columns_added = self.store.add_soft_delete_columns(&mirror).await?;
            schema = self.store.mirror_schema(&mirror).await?;
        }

        let records = self.store.all_records(&mirror).await?;
        let mut fingerprinter: Option<Fingerprinter> = None;
        let mut writes = Vec::new();

        for record in &records {
            let mut fixed = normalize_flags(record, &schema);
            if fixed.is_some() {
                report.flags_normalized += 1;
            }

            if record.record_hash.is_none() {
                if fingerprinter.is_none() {
                    fingerprinter = Some(self.fingerprinter(table).await?);
                }
                if let Some(fp) = &fingerprinter {
                    let target = fixed.get_or_insert_with(|| record.clone());
                    target.record_hash = Some(fp.fingerprint(&target.data));
                    report.hashes_recomputed += 1;
                }
            }

            if let Some(record) = fixed {
                writes.push(record);
            }
        }

        for chunk in writes.chunks(self.config.batch_size.max(1)) {
            self.store.upsert_records(&mirror, chunk).await?;
        }

        match self.remote_keys(table).await {
            Ok(remote) => {
                report.unreflected_deletions = unreflected(&records, &remote).len() as u32;
                report.follow_up_full_sync_required = report.unreflected_deletions > 0;
            }
            Err(e) => warn!(table_id = %table.id, error = %e, "Remote existence check unavailable"),
        }

        info!(
            table_id = %table.id,
            columns_added = report.columns_added.len(),
            flags_normalized = report.flags_normalized,
            hashes_recomputed = report.hashes_recomputed,
            unreflected_deletions = report.unreflected_deletions,
            "Repaired mirror flags"
        );

        Ok(report)
    }

    /// Fingerprinter matching the one sync runs use for this table.
    async fn fingerprinter(&self, table: &SourceTableConfig) -> MirrorResult<Fingerprinter> {
        match self.source.describe_table(&table.source_table).await {
            Ok(structure) => Ok(Fingerprinter::new(structure.binary_fields())),
            Err(e) => {
                warn!(table_id = %table.id, error = %e, "Falling back to last run's binary fields");
                let excluded = self
                    .store
                    .last_successful_remote_run(table.id)
                    .await?
                    .map(|run| run.excluded_binary_fields)
                    .unwrap_or_default();
                Ok(Fingerprinter::new(excluded))
            }
        }
    }

    /// Keys of every record currently in the ERP table.
    async fn remote_keys(&self, table: &SourceTableConfig) -> MirrorResult<HashSet<String>> {
        let mut keys = HashSet::new();
        let mut request = PageRequest::first(self.config.batch_size);
        loop {
            let page = self
                .source
                .fetch_page(&table.source_table, FetchScope::All, request)
                .await?;
            keys.extend(
                page.items
                    .iter()
                    .filter_map(|item| record_key(item, &table.key_fields).ok()),
            );
            if !page.has_next {
                return Ok(keys);
            }
            request = request.next();
        }
    }
}

fn row_anomalies(record: &MirroredRecord) -> Vec<FlagAnomaly> {
    let mut found = Vec::new();
    let mut push = |kind| {
        found.push(FlagAnomaly {
            record_key: record.key.clone(),
            kind,
        });
    };

    if record.has_contradictory_flags() {
        push(AnomalyKind::ContradictoryFlags);
    }
    if record.pending_deletion
        && record
            .record_status
            .is_some_and(|status| status != RecordStatus::Deleted)
    {
        push(AnomalyKind::StaleStatus);
    }
    if record.record_hash.is_none() {
        push(AnomalyKind::MissingHash);
    }
    found
}

fn unreflected(records: &[MirroredRecord], remote: &HashSet<String>) -> Vec<String> {
    records
        .iter()
        .filter(|r| !r.pending_deletion && !remote.contains(&r.key))
        .map(|r| r.key.clone())
        .collect()
}
