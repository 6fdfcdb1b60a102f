//! # Protheus Mirror
//!
//! Synchronization and reconciliation engine for local mirrors of Protheus
//! ERP tables.
//!
//! This crate provides:
//! - Change detection by record fingerprint
//! - Incremental, full and cleanup-and-resync runs with soft deletes
//! - Due-time computation for interval, fixed-schedule and cron tables
//! - Run supervision: long-running and stalled runs, force-terminate,
//!   finalization of orphaned runs
//! - Flag anomaly detection and idempotent repair
//! - Deleted-record archive with restore
//! - CSV import and export
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   trigger    ┌───────────────┐  fetch pages  ┌──────────────┐
//! │ MirrorService │─────────────►│ SyncExecutor  │──────────────►│  ErpSource   │
//! │ (CLI / cron)  │              │               │               │ (REST / mock)│
//! └───────┬───────┘              └───────┬───────┘               └──────────────┘
//!         │                              │ fingerprint + write rules
//!         │ poll / terminate             ▼
//! ┌───────▼───────┐              ┌───────────────┐
//! │  JobMonitor   │─────────────►│  MirrorStore  │◄──── Archive, CsvReconciler,
//! └───────────────┘  run state   │ (Postgres/mem)│      AnomalyDetector
//!                                └───────┬───────┘
//!                                        │ rows
//!                                        ▼
//!                                 Classifier ──► new / updated / unchanged / deleted
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use protheus_mirror::{EngineConfig, MirrorService, RunScope, SourceTableConfig};
//!
//! let service = MirrorService::new(store, source, EngineConfig::from_env());
//! let table = service
//!     .create_table(SourceTableConfig::new("SA2010").with_cron("0 2 * * *"))
//!     .await?;
//!
//! service.trigger_sync(table.id, RunScope::Full, Some("operator".into())).await?;
//! let status = service.sync_status(table.id).await?;
//! ```

pub mod anomaly;
pub mod archive;
pub mod classifier;
pub mod config;
pub mod csv_import;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod monitor;
pub mod query;
pub mod record;
pub mod run;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod store;
pub mod sync;
pub mod table;
pub mod types;

// Re-exports for convenience
pub use anomaly::{AnomalyDetector, AnomalyKind, AnomalyReport, FlagAnomaly, RemoteCheck, RepairReport};
pub use archive::Archive;
pub use classifier::{classify, ClassifiedRecord};
pub use config::EngineConfig;
pub use csv_import::{CsvReconciler, CsvRow};
pub use error::{MirrorError, MirrorResult};
pub use export::ExportScope;
pub use fingerprint::{record_key, Fingerprinter};
pub use monitor::{JobMonitor, RunStatus};
pub use query::{FieldFilter, FilterOp, RecordPage, RecordQuery, SortDirection, SortKey, SortSpec};
pub use record::{FieldMap, MirrorSchema, MirroredRecord};
pub use run::{ErrorScope, RowError, RowErrorKind, RunCounts, RunOutcome, SyncRun};
pub use scheduler::Scheduler;
pub use service::{MirrorService, ScheduledStart};
pub use source::{ErpConfig, ErpSource, HttpErpSource, SourceError, SourceResult};
pub use store::{InMemoryStore, MirrorStore, PgMirrorStore};
pub use sync::SyncExecutor;
pub use table::SourceTableConfig;
pub use types::{IntervalUnit, RecordStatus, RunScope, RunState, SyncMode, TriggerType};
