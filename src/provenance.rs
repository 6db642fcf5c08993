//! Provenance log - append-only record of successful runs
//!
//! Each record links the staged input, the request, the generated SQL and the
//! published artifact. Writes go through `ProvenanceStore` so the materializer
//! can treat a store failure as a warning rather than a run failure.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub input_file_name: String,
    pub input_request_text: String,
    pub generated_query: String,
    pub output_artifact_name: String,
    pub created_at: DateTime<Utc>,
}

pub trait ProvenanceStore: Send + Sync {
    fn append(&self, record: &ProvenanceRecord) -> Result<()>;
}

/// SQLite-backed store using a single `query_results` table.
pub struct SqliteProvenanceStore {
    db: Mutex<Connection>,
}

impl SqliteProvenanceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(path)
            .map_err(|e| PipelineError::Config(format!("Failed to open provenance database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;

        info!("Provenance store ready at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| PipelineError::Config(format!("Failed to open provenance database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input_file_name TEXT NOT NULL,
                input_data TEXT NOT NULL,
                sql_query TEXT NOT NULL,
                output_file TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| PipelineError::Config(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<ProvenanceRecord>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db
            .prepare(
                "SELECT input_file_name, input_data, sql_query, output_file, created_at \
                 FROM query_results ORDER BY id",
            )
            .map_err(|e| PipelineError::Materialization(format!("Failed to query provenance: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(4)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    created_at,
                ))
            })
            .map_err(|e| PipelineError::Materialization(format!("Failed to query provenance: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let (input_file_name, input_request_text, generated_query, output_artifact_name, created_at) =
                row.map_err(|e| PipelineError::Materialization(format!("Failed to read row: {}", e)))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| PipelineError::Materialization(format!("Bad timestamp in provenance: {}", e)))?
                .with_timezone(&Utc);
            records.push(ProvenanceRecord {
                input_file_name,
                input_request_text,
                generated_query,
                output_artifact_name,
                created_at,
            });
        }
        Ok(records)
    }
}

impl ProvenanceStore for SqliteProvenanceStore {
    fn append(&self, record: &ProvenanceRecord) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.execute(
            r#"
            INSERT INTO query_results (input_file_name, input_data, sql_query, output_file, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.input_file_name,
                record.input_request_text,
                record.generated_query,
                record.output_artifact_name,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::Materialization(format!("Failed to insert provenance record: {}", e)))?;

        info!("✅ Provenance stored for {}", record.output_artifact_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(output: &str) -> ProvenanceRecord {
        ProvenanceRecord {
            input_file_name: "input.csv".to_string(),
            input_request_text: "total amount by id".to_string(),
            generated_query: "SELECT id, SUM(amount) FROM temp_view GROUP BY id".to_string(),
            output_artifact_name: output.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let store = SqliteProvenanceStore::in_memory().unwrap();
        store.append(&record("2024_01_01_00_00_00_input.csv")).unwrap();
        store.append(&record("2024_01_01_00_00_01_input.csv")).unwrap();

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].output_artifact_name, "2024_01_01_00_00_00_input.csv");
        assert_eq!(records[1].input_request_text, "total amount by id");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("provenance.db");

        SqliteProvenanceStore::open(&path)
            .unwrap()
            .append(&record("a.csv"))
            .unwrap();

        let reopened = SqliteProvenanceStore::open(&path).unwrap();
        assert_eq!(reopened.records().unwrap().len(), 1);
    }
}
