use crate::error::RagError;
use crate::traits::PersistenceBackend;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

// Stays well under SQLite's bound-parameter limit.
const DELETE_BATCH: usize = 500;

/// Stores every logical table as its own SQLite table of `(id, record)` rows.
///
/// Tables are created on first use, so new record kinds need no migration.
pub struct SqliteBackend {
    pool: SqlitePool,
    db_path: PathBuf,
    known_tables: Mutex<HashSet<String>>,
}

impl SqliteBackend {
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self, RagError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RagError::persistence)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(RagError::persistence)?;

        Ok(Self {
            pool,
            db_path,
            known_tables: Mutex::new(HashSet::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Validates `table` and creates it if this backend has not seen it yet.
    /// Returns the quoted identifier.
    async fn ensure_table(&self, table: &str) -> Result<String, RagError> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !valid {
            return Err(RagError::InvalidArgument(format!(
                "invalid table name: {table:?}"
            )));
        }
        let quoted = format!("\"{table}\"");

        let mut known = self.known_tables.lock().await;
        if !known.contains(table) {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {quoted} (
                    id TEXT PRIMARY KEY,
                    record TEXT NOT NULL
                )"
            ))
            .execute(&self.pool)
            .await
            .map_err(RagError::persistence)?;
            known.insert(table.to_string());
        }
        Ok(quoted)
    }
}

#[async_trait]
impl PersistenceBackend for SqliteBackend {
    async fn put_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<(), RagError> {
        if records.is_empty() {
            return Ok(());
        }
        let quoted = self.ensure_table(table).await?;
        let statement = format!("INSERT OR REPLACE INTO {quoted} (id, record) VALUES (?1, ?2)");

        let mut tx = self.pool.begin().await.map_err(RagError::persistence)?;
        for (id, record) in records {
            let encoded = serde_json::to_string(&record)?;
            sqlx::query(&statement)
                .bind(id)
                .bind(encoded)
                .execute(&mut *tx)
                .await
                .map_err(RagError::persistence)?;
        }
        tx.commit().await.map_err(RagError::persistence)?;
        Ok(())
    }

    async fn delete_all(&self, table: &str, ids: &[String]) -> Result<(), RagError> {
        if ids.is_empty() {
            return Ok(());
        }
        let quoted = self.ensure_table(table).await?;

        let mut tx = self.pool.begin().await.map_err(RagError::persistence)?;
        for batch in ids.chunks(DELETE_BATCH) {
            let mut builder =
                QueryBuilder::<Sqlite>::new(format!("DELETE FROM {quoted} WHERE id IN ("));
            let mut separated = builder.separated(", ");
            for id in batch {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(RagError::persistence)?;
        }
        tx.commit().await.map_err(RagError::persistence)?;
        Ok(())
    }

    async fn load_all(&self, table: &str) -> Result<Vec<(String, Value)>, RagError> {
        let quoted = self.ensure_table(table).await?;
        let rows = sqlx::query(&format!("SELECT id, record FROM {quoted} ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await
            .map_err(RagError::persistence)?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let record: String = row.get("record");
                let value: Value = serde_json::from_str(&record).map_err(|error| {
                    RagError::persistence(format!("record {id} in {table} is corrupt: {error}"))
                })?;
                Ok::<_, RagError>((id, value))
            })
            .collect()
    }

    async fn clear(&self, table: &str) -> Result<(), RagError> {
        let quoted = self.ensure_table(table).await?;
        sqlx::query(&format!("DELETE FROM {quoted}"))
            .execute(&self.pool)
            .await
            .map_err(RagError::persistence)?;
        Ok(())
    }
}
