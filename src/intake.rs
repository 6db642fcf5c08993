//! Upload intake - stages a caller-provided file into the input directory
//!
//! The staged copy is what every later stage reads, so the original upload can
//! be removed by the caller as soon as staging returns.

use crate::error::{PipelineError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

/// A file copied into the input directory under a sanitized name.
#[derive(Debug, Clone)]
pub struct StagedInput {
    pub file_name: String,
    pub path: PathBuf,
}

/// Reduce an uploaded file name to a safe basename.
///
/// `../../etc/passwd` becomes `etc_passwd`; spaces and other separators
/// collapse to `_`; leading dots are dropped so nothing is staged hidden.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    let joined = normalized
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("_");
    let cleaned = UNSAFE_CHARS.replace_all(&joined, "_");
    let cleaned = cleaned.trim_start_matches(['.', '_']).trim_end_matches('_');

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Copy `source` into the run's own directory under `input_dir`.
///
/// Each run stages to `input_dir/{run_id}/{file_name}`, so concurrent runs
/// with same-named uploads never read each other's copy. `file_name` stays the
/// sanitized original name used for artifact naming.
pub fn stage_input(source: &Path, input_dir: &Path, run_id: Uuid) -> Result<StagedInput> {
    if !source.is_file() {
        return Err(PipelineError::DataLoad(format!(
            "Input file not found: {}",
            source.display()
        )));
    }

    let raw_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::DataLoad(format!("Invalid file name: {}", source.display())))?;
    let file_name = sanitize_file_name(raw_name)
        .ok_or_else(|| PipelineError::DataLoad(format!("Unusable file name: {}", raw_name)))?;

    let run_dir = input_dir.join(run_id.to_string());
    std::fs::create_dir_all(&run_dir).map_err(|e| {
        PipelineError::DataLoad(format!(
            "Failed to create input directory {}: {}",
            run_dir.display(),
            e
        ))
    })?;

    let path = run_dir.join(&file_name);
    let bytes = std::fs::copy(source, &path).map_err(|e| {
        PipelineError::DataLoad(format!("Failed to stage {}: {}", source.display(), e))
    })?;

    debug!("Copied {} bytes", bytes);
    info!("Staged {} as {}", source.display(), path.display());
    Ok(StagedInput { file_name, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("input.csv").as_deref(), Some("input.csv"));
        assert_eq!(sanitize_file_name("my sales (q1).csv").as_deref(), Some("my_sales_q1_.csv"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("etc_passwd"));
        assert_eq!(sanitize_file_name(".hidden.csv").as_deref(), Some("hidden.csv"));
        assert_eq!(sanitize_file_name("../.."), None);
    }

    #[test]
    fn test_runs_stage_separately() {
        let upload_a = TempDir::new().unwrap();
        let upload_b = TempDir::new().unwrap();
        let input_dir = TempDir::new().unwrap();
        let source_a = upload_a.path().join("input.csv");
        let source_b = upload_b.path().join("input.csv");
        std::fs::write(&source_a, "id\n1\n").unwrap();
        std::fs::write(&source_b, "id\n2\n").unwrap();

        let staged_a = stage_input(&source_a, input_dir.path(), Uuid::new_v4()).unwrap();
        let staged_b = stage_input(&source_b, input_dir.path(), Uuid::new_v4()).unwrap();

        assert_eq!(staged_a.file_name, "input.csv");
        assert_eq!(staged_b.file_name, "input.csv");
        assert_ne!(staged_a.path, staged_b.path);
        assert_eq!(std::fs::read_to_string(&staged_a.path).unwrap(), "id\n1\n");
        assert_eq!(std::fs::read_to_string(&staged_b.path).unwrap(), "id\n2\n");
    }

    #[test]
    fn test_stage_missing_source() {
        let input_dir = TempDir::new().unwrap();
        let result = stage_input(Path::new("/nonexistent/input.csv"), input_dir.path(), Uuid::new_v4());
        assert!(matches!(result, Err(PipelineError::DataLoad(_))));
    }
}
