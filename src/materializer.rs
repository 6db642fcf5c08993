//! Result materialization - publishes the result table as one CSV artifact
//!
//! The table is written as a single part file inside a scoped working
//! directory under the output location, then linked into place as
//! `{YYYY_MM_DD_HH_MM_SS}_{original_file_name}`. The working directory is a
//! `TempDir`, so it is removed on every exit path, including a refused publish.
//!
//! Recording provenance is independent of the artifact: a log-store failure
//! becomes a warning on the returned value and the artifact stays in place.

use crate::error::{PipelineError, Result};
use crate::provenance::{ProvenanceRecord, ProvenanceStore};
use crate::synthesizer::GeneratedQuery;
use chrono::{NaiveDateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

const PART_PREFIX: &str = "part-";

/// Published, never-overwritten result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub name: String,
    pub path: PathBuf,
    pub row_count: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Materialized {
    pub artifact: ResultArtifact,
    pub provenance: ProvenanceRecord,
    /// Set when the log store rejected the record; the artifact is still valid.
    pub provenance_warning: Option<String>,
}

pub fn artifact_name(timestamp: &NaiveDateTime, original_file_name: &str) -> String {
    format!(
        "{}_{}",
        timestamp.format(ARTIFACT_TIMESTAMP_FORMAT),
        original_file_name
    )
}

pub struct ResultMaterializer {
    output_dir: PathBuf,
    store: Arc<dyn ProvenanceStore>,
}

impl ResultMaterializer {
    pub fn new(output_dir: impl Into<PathBuf>, store: Arc<dyn ProvenanceStore>) -> Self {
        Self {
            output_dir: output_dir.into(),
            store,
        }
    }

    pub fn materialize(
        &self,
        result: &mut DataFrame,
        original_file_name: &str,
        request_text: &str,
        query: &GeneratedQuery,
        timestamp: &NaiveDateTime,
    ) -> Result<Materialized> {
        let artifact = self.write_artifact(result, original_file_name, timestamp)?;

        let provenance = ProvenanceRecord {
            input_file_name: original_file_name.to_string(),
            input_request_text: request_text.to_string(),
            generated_query: query.as_str().to_string(),
            output_artifact_name: artifact.name.clone(),
            created_at: Utc::now(),
        };
        let provenance_warning = self.record_provenance(&provenance);

        Ok(Materialized {
            artifact,
            provenance,
            provenance_warning,
        })
    }

    pub fn write_artifact(
        &self,
        result: &mut DataFrame,
        original_file_name: &str,
        timestamp: &NaiveDateTime,
    ) -> Result<ResultArtifact> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            PipelineError::Materialization(format!(
                "Failed to create output directory {}: {}",
                self.output_dir.display(),
                e
            ))
        })?;

        let work_dir = tempfile::Builder::new()
            .prefix(".out-")
            .tempdir_in(&self.output_dir)
            .map_err(|e| PipelineError::Materialization(format!("Failed to create working directory: {}", e)))?;

        write_single_part(result, work_dir.path())?;
        let part = find_single_part(work_dir.path())?;

        let name = artifact_name(timestamp, original_file_name);
        let final_path = self.output_dir.join(&name);

        // Linking fails on an existing target, so a published artifact is never replaced.
        std::fs::hard_link(&part, &final_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => PipelineError::Materialization(format!(
                "Artifact already exists: {}",
                final_path.display()
            )),
            _ => PipelineError::Materialization(format!(
                "Failed to publish {} as {}: {}",
                part.display(),
                final_path.display(),
                e
            )),
        })?;

        if let Err(e) = work_dir.close() {
            warn!("Failed to remove working directory: {}", e);
        }

        info!("✅ Result written to {}", final_path.display());
        Ok(ResultArtifact {
            name,
            path: final_path,
            row_count: result.height(),
            columns: result.get_column_names().iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Append to the log store; failures are logged and returned, never raised.
    pub fn record_provenance(&self, record: &ProvenanceRecord) -> Option<String> {
        match self.store.append(record) {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "Provenance write failed for {} (artifact kept): {}",
                    record.output_artifact_name, e
                );
                Some(e.to_string())
            }
        }
    }
}

fn write_single_part(result: &mut DataFrame, dir: &Path) -> Result<()> {
    let part_path = dir.join(format!("{}00000.csv", PART_PREFIX));
    let mut file = File::create(&part_path)
        .map_err(|e| PipelineError::Materialization(format!("Failed to create {}: {}", part_path.display(), e)))?;

    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b',')
        .finish(result)
        .map_err(|e| PipelineError::Materialization(format!("Failed to write CSV: {}", e)))?;

    debug!("Wrote {} rows to {}", result.height(), part_path.display());
    Ok(())
}

fn find_single_part(dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::Materialization(format!("Failed to list {}: {}", dir.display(), e)))?;

    let mut parts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::Materialization(e.to_string()))?;
        if entry.file_name().to_string_lossy().starts_with(PART_PREFIX) {
            parts.push(entry.path());
        }
    }

    match parts.len() {
        0 => Err(PipelineError::Materialization(format!(
            "No output partition found in {}",
            dir.display()
        ))),
        1 => Ok(parts.remove(0)),
        n => Err(PipelineError::Materialization(format!(
            "Expected a single output partition, found {}",
            n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::SqliteProvenanceStore;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct FailingStore;

    impl ProvenanceStore for FailingStore {
        fn append(&self, _record: &ProvenanceRecord) -> Result<()> {
            Err(PipelineError::Materialization("database is locked".to_string()))
        }
    }

    fn timestamp(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, second)
            .unwrap()
    }

    fn working_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".out-"))
            .count()
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name(&timestamp(0), "input.csv"), "2024_01_01_00_00_00_input.csv");
    }

    #[test]
    fn test_writes_single_csv_with_header() {
        let out = TempDir::new().unwrap();
        let materializer =
            ResultMaterializer::new(out.path(), Arc::new(SqliteProvenanceStore::in_memory().unwrap()));
        let mut df = df!["id" => [1i64, 2], "sum_amount" => [5.0, 4.0]].unwrap();

        let done = materializer
            .materialize(
                &mut df,
                "input.csv",
                "total amount by id",
                &GeneratedQuery::new("SELECT 1"),
                &timestamp(0),
            )
            .unwrap();

        assert_eq!(done.artifact.name, "2024_01_01_00_00_00_input.csv");
        assert!(done.provenance_warning.is_none());
        let content = std::fs::read_to_string(&done.artifact.path).unwrap();
        assert!(content.starts_with("id,sum_amount\n"));
        assert_eq!(working_dirs(out.path()), 0);
    }

    #[test]
    fn test_existing_artifact_is_not_overwritten() {
        let out = TempDir::new().unwrap();
        let existing = out.path().join("2024_01_01_00_00_00_input.csv");
        std::fs::write(&existing, "keep me").unwrap();

        let materializer =
            ResultMaterializer::new(out.path(), Arc::new(SqliteProvenanceStore::in_memory().unwrap()));
        let mut df = df!["id" => [1i64]].unwrap();
        let result = materializer.write_artifact(&mut df, "input.csv", &timestamp(0));

        assert!(matches!(result, Err(PipelineError::Materialization(_))));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "keep me");
        assert_eq!(working_dirs(out.path()), 0);
    }

    #[test]
    fn test_provenance_failure_keeps_artifact() {
        let out = TempDir::new().unwrap();
        let materializer = ResultMaterializer::new(out.path(), Arc::new(FailingStore));
        let mut df = df!["id" => [1i64]].unwrap();

        let done = materializer
            .materialize(&mut df, "input.csv", "ids", &GeneratedQuery::new("SELECT id FROM temp_view"), &timestamp(0))
            .unwrap();

        assert!(done.provenance_warning.unwrap().contains("database is locked"));
        assert!(done.artifact.path.exists());
    }

    #[test]
    fn test_missing_partition() {
        let dir = TempDir::new().unwrap();
        let result = find_single_part(dir.path());
        assert!(matches!(result, Err(PipelineError::Materialization(msg)) if msg.contains("No output partition")));
    }
}
