//! Deleted-record archive and restore.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{MirrorError, MirrorResult};
use crate::record::MirroredRecord;
use crate::run::{RunCounts, SyncRun};
use crate::store::MirrorStore;
use crate::sync::{begin_local_run, finish_local_run, restore};
use crate::table::SourceTableConfig;
use crate::types::{RunScope, TriggerType};

/// Read and restore soft-deleted rows.
pub struct Archive {
    store: Arc<dyn MirrorStore>,
}

impl Archive {
    /// Create a new archive over the store.
    #[must_use]
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    /// Rows pending deletion, by key.
    pub async fn list_deleted(&self, table: &SourceTableConfig) -> MirrorResult<Vec<MirroredRecord>> {
        let schema = self.store.mirror_schema(&table.mirror_table_name()).await?;
        if !schema.exists || !schema.supports_soft_delete() {
            return Ok(Vec::new());
        }
        self.store.deleted_records(&schema.mirror_table).await
    }

    /// Restore soft-deleted rows under a dedicated restore run.
    ///
    /// All keys are checked before anything is written; an unknown key or a
    /// key that is not pending deletion fails the whole request.
    #[instrument(skip(self, table, keys), fields(table_id = %table.id, keys = keys.len()))]
    pub async fn restore(
        &self,
        table: &SourceTableConfig,
        keys: &[String],
        triggered_by: Option<String>,
    ) -> MirrorResult<SyncRun> {
        let mirror = table.mirror_table_name();
        let schema = self.store.mirror_schema(&mirror).await?;

        let found = if schema.exists {
            self.store.get_records(&mirror, keys).await?
        } else {
            Vec::new()
        };
        for key in keys {
            if !found.iter().any(|r| &r.key == key && r.pending_deletion) {
                return Err(MirrorError::RecordNotFound {
                    table_id: table.id,
                    key: key.clone(),
                });
            }
        }

        let run = begin_local_run(
            self.store.as_ref(),
            SyncRun::new(table.id, TriggerType::Restore, RunScope::Restore).triggered_by(triggered_by),
        )
        .await?;

        let result = async {
            self.store.reset_statuses(&mirror).await?;
            let now = Utc::now();
            let restored: Vec<MirroredRecord> = found
                .iter()
                .map(|record| restore(record, run.id, &schema, now))
                .collect();
            self.store.upsert_records(&mirror, &restored).await?;
            Ok::<_, MirrorError>(RunCounts {
                updated: restored.len() as u32,
                ..RunCounts::default()
            })
        }
        .await;

        let run = finish_local_run(self.store.as_ref(), &run, result).await?;
        info!(table_id = %table.id, run_id = %run.id, restored = run.counts.updated, "Restored records");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::store::InMemoryStore;
    use crate::types::{RecordStatus, RunState};
    use serde_json::json;

    fn deleted(key: &str) -> MirroredRecord {
        let data = json!({"R_E_C_N_O_": key}).as_object().cloned().unwrap();
        let mut record = MirroredRecord::new(key, data);
        record.pending_deletion = true;
        record.deleted_at = Some(Utc::now());
        record.record_status = Some(RecordStatus::Deleted);
        record
    }

    async fn setup() -> (Arc<InMemoryStore>, SourceTableConfig) {
        let store = Arc::new(InMemoryStore::new());
        let table = SourceTableConfig::new("SA2010");
        store.insert_table(&table).await.unwrap();
        store.create_mirror_table(&table.mirror_table_name()).await.unwrap();
        store
            .seed_records(&table.mirror_table_name(), vec![deleted("1"), deleted("2")])
            .await
            .unwrap();
        (store, table)
    }

    #[tokio::test]
    async fn test_restore_classifies_as_updated() {
        let (store, table) = setup().await;
        let archive = Archive::new(store.clone());

        assert_eq!(archive.list_deleted(&table).await.unwrap().len(), 2);

        let run = archive
            .restore(&table, &["1".to_string()], Some("operator".to_string()))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.trigger, TriggerType::Restore);
        assert_eq!(run.counts.updated, 1);

        let records = store
            .get_records(&table.mirror_table_name(), &["1".to_string()])
            .await
            .unwrap();
        let restored = &records[0];
        assert!(!restored.pending_deletion);
        assert_eq!(classify(restored, Some(run.id)), RecordStatus::Updated);
        assert_eq!(archive.list_deleted(&table).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_unknown_key_writes_nothing() {
        let (store, table) = setup().await;
        let archive = Archive::new(store.clone());

        let err = archive
            .restore(&table, &["1".to_string(), "99".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::RecordNotFound { .. }));
        assert_eq!(archive.list_deleted(&table).await.unwrap().len(), 2);
        assert!(store.latest_run(table.id).await.unwrap().is_none());
    }
}
