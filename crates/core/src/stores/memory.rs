use crate::error::RagError;
use crate::traits::PersistenceBackend;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// Volatile backend holding every table in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn put_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<(), RagError> {
        let mut tables = self.tables.lock().await;
        tables.entry(table.to_string()).or_default().extend(records);
        Ok(())
    }

    async fn delete_all(&self, table: &str, ids: &[String]) -> Result<(), RagError> {
        let mut tables = self.tables.lock().await;
        if let Some(records) = tables.get_mut(table) {
            for id in ids {
                records.remove(id);
            }
        }
        Ok(())
    }

    async fn load_all(&self, table: &str) -> Result<Vec<(String, Value)>, RagError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, value)| (id.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, table: &str) -> Result<(), RagError> {
        self.tables.lock().await.remove(table);
        Ok(())
    }
}
