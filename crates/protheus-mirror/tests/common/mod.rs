//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use protheus_mirror::source::{
    FetchScope, FieldDescriptor, PageRequest, RemotePage, SourceError, SourceResult, TableSchema,
};
use protheus_mirror::{
    EngineConfig, ErpSource, FieldMap, InMemoryStore, MirrorService, SourceTableConfig, SyncRun,
};

/// Binary field present on every supplier row.
pub const PHOTO_FIELD: &str = "A2_FOTO";

/// In-memory ERP with failure injection and a gate to hold fetches.
#[derive(Default)]
pub struct MockErpSource {
    tables: Mutex<HashMap<String, Vec<FieldMap>>>,
    binary_fields: Mutex<Vec<String>>,
    scopes: Mutex<Vec<FetchScope>>,
    fail: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    fetches: AtomicUsize,
}

impl MockErpSource {
    pub fn new() -> Self {
        Self {
            binary_fields: Mutex::new(vec![PHOTO_FIELD.to_string()]),
            ..Self::default()
        }
    }

    pub fn set_rows(&self, table: &str, rows: Vec<FieldMap>) {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
    }

    pub fn update_row(&self, table: &str, recno: i64, field: &str, value: serde_json::Value) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.get_mut(table).unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.get("R_E_C_N_O_") == Some(&json!(recno)))
            .unwrap();
        row.insert(field.to_string(), value);
    }

    pub fn remove_row(&self, table: &str, recno: i64) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.get_mut(table).unwrap();
        rows.retain(|r| r.get("R_E_C_N_O_") != Some(&json!(recno)));
    }

    pub fn push_row(&self, table: &str, row: FieldMap) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Make every call fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail.store(unreachable, Ordering::SeqCst);
    }

    /// Hold every fetch until `release` is called.
    pub fn hold_fetches(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let one held fetch through and stop holding new ones.
    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn scopes(&self) -> Vec<FetchScope> {
        self.scopes.lock().unwrap().clone()
    }

    /// Wait until at least `n` fetches have started.
    pub async fn wait_for_fetches(&self, n: usize) {
        for _ in 0..500 {
            if self.fetch_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {n} fetches, saw {}", self.fetch_count());
    }
}

#[async_trait]
impl ErpSource for MockErpSource {
    async fn describe_table(&self, table: &str) -> SourceResult<TableSchema> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::connectivity("connection refused"));
        }
        if !self.tables.lock().unwrap().contains_key(table) {
            return Err(SourceError::TableNotFound {
                table: table.to_string(),
            });
        }
        let fields = self
            .binary_fields
            .lock()
            .unwrap()
            .iter()
            .map(|name| FieldDescriptor {
                name: name.clone(),
                field_type: Some("M".to_string()),
                binary: true,
            })
            .collect();
        Ok(TableSchema { fields })
    }

    async fn fetch_page(
        &self,
        table: &str,
        scope: FetchScope,
        page: PageRequest,
    ) -> SourceResult<RemotePage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.scopes.lock().unwrap().push(scope);

        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::connectivity("connection reset by peer"));
        }

        let tables = self.tables.lock().unwrap();
        let rows = tables.get(table).ok_or_else(|| SourceError::TableNotFound {
            table: table.to_string(),
        })?;

        let size = page.page_size as usize;
        let start = (page.page as usize - 1) * size;
        let items: Vec<FieldMap> = rows.iter().skip(start).take(size).cloned().collect();
        Ok(RemotePage {
            has_next: start + items.len() < rows.len(),
            items,
        })
    }
}

/// A supplier row of SA2010.
pub fn supplier(recno: i64, name: &str) -> FieldMap {
    let mut row = json!({
        "R_E_C_N_O_": recno,
        "A2_COD": format!("{recno:06}"),
        "A2_LOJA": "01",
        "A2_NOME": name,
        "A2_SALDO": recno * 10,
    })
    .as_object()
    .cloned()
    .unwrap();
    row.insert(PHOTO_FIELD.to_string(), json!(format!("blob-{recno}")));
    row
}

pub fn suppliers(range: std::ops::RangeInclusive<i64>) -> Vec<FieldMap> {
    range.map(|i| supplier(i, &format!("Supplier {i}"))).collect()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        batch_size: 25,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub source: Arc<MockErpSource>,
    pub service: MirrorService,
    pub table: SourceTableConfig,
}

impl Harness {
    pub async fn new(rows: Vec<FieldMap>) -> Self {
        Self::with_config(rows, test_config()).await
    }

    pub async fn with_config(rows: Vec<FieldMap>, config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let source = Arc::new(MockErpSource::new());
        source.set_rows("SA2010", rows);

        let service = MirrorService::new(store.clone(), source.clone(), config);
        let table = service
            .create_table(SourceTableConfig::new("SA2010"))
            .await
            .unwrap();

        Self {
            store,
            source,
            service,
            table,
        }
    }

    pub fn mirror(&self) -> String {
        self.table.mirror_table_name()
    }

    /// Trigger a run and wait for it to finish.
    pub async fn sync(&self, scope: protheus_mirror::RunScope) -> SyncRun {
        self.service
            .trigger_sync(self.table.id, scope, Some("test".to_string()))
            .await
            .unwrap();
        self.service
            .wait_for_run(self.table.id)
            .await
            .expect("run registered")
            .unwrap()
    }
}
