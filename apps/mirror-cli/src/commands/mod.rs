//! Command implementations

pub mod flags;
pub mod records;
pub mod runs;
pub mod schedule;
pub mod tables;

use std::sync::Arc;
use std::time::Duration;

use protheus_mirror::{HttpErpSource, MirrorService, PgMirrorStore, SourceTableConfig};
use uuid::Uuid;

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

/// Connect to the database and the ERP and build the service.
pub async fn connect(config: &CliConfig) -> CliResult<MirrorService> {
    let store = PgMirrorStore::connect(&config.database_url, config.max_connections).await?;
    if config.run_migrations {
        store.migrate().await?;
    }
    let source = HttpErpSource::new(config.erp.clone())?;
    Ok(MirrorService::new(
        Arc::new(store),
        Arc::new(source),
        config.engine.clone(),
    ))
}

/// Resolve a table given as id or as ERP table name.
pub async fn resolve_table(service: &MirrorService, reference: &str) -> CliResult<SourceTableConfig> {
    if let Ok(id) = Uuid::parse_str(reference) {
        return Ok(service.get_table(id).await?);
    }
    service
        .list_tables()
        .await?
        .into_iter()
        .find(|t| t.source_table.eq_ignore_ascii_case(reference))
        .ok_or_else(|| CliError::NotFound(format!("table '{reference}'")))
}

/// Give sync tasks of this process time to reach a checkpoint after their
/// runs were terminated, so the runtime does not drop them mid-batch.
pub async fn drain_tasks(service: &MirrorService) {
    for _ in 0..100 {
        if service.monitor().active_jobs().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
