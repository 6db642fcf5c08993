//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula::diagnostics::DIAGNOSTIC_SYSTEM_PROMPT;
use tabula::engine::SqlSession;
use tabula::llm::GenerativeModel;
use tabula::provenance::{ProvenanceRecord, ProvenanceStore, SqliteProvenanceStore};
use tabula::status::StatusBoard;
use tabula::{Pipeline, PipelineConfig, PipelineError, Result};
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct Call {
    pub model: String,
    pub system: String,
    pub prompt: String,
}

/// Replies with canned SQL per request text and a canned diagnosis.
pub struct ScriptedModel {
    sql_by_request: HashMap<String, String>,
    diagnosis: std::result::Result<String, String>,
    diagnosis_delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            sql_by_request: HashMap::new(),
            diagnosis: Ok("Check the column names against the schema.".to_string()),
            diagnosis_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn answer(mut self, request: &str, sql: &str) -> Self {
        self.sql_by_request.insert(request.to_string(), sql.to_string());
        self
    }

    pub fn failing_diagnosis(mut self, reason: &str) -> Self {
        self.diagnosis = Err(reason.to_string());
        self
    }

    pub fn slow_diagnosis(mut self, delay: Duration) -> Self {
        self.diagnosis_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn diagnostic_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.system == DIAGNOSTIC_SYSTEM_PROMPT)
            .collect()
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn generate(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        self.calls.lock().unwrap().push(Call {
            model: model.to_string(),
            system: system.to_string(),
            prompt: prompt.to_string(),
        });

        if system == DIAGNOSTIC_SYSTEM_PROMPT {
            if let Some(delay) = self.diagnosis_delay {
                tokio::time::sleep(delay).await;
            }
            return self
                .diagnosis
                .clone()
                .map_err(PipelineError::Synthesis);
        }

        self.sql_by_request
            .get(prompt)
            .cloned()
            .ok_or_else(|| PipelineError::Synthesis(format!("LLM API call failed: no answer for {:?}", prompt)))
    }
}

pub struct FailingStore;

impl ProvenanceStore for FailingStore {
    fn append(&self, _record: &ProvenanceRecord) -> Result<()> {
        Err(PipelineError::Materialization("database is locked".to_string()))
    }
}

/// Temporary upload/input/output layout for one test.
pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    pub fn upload(&self, name: &str, content: &str) -> PathBuf {
        self.upload_in("uploads", name, content)
    }

    /// Upload into a separate directory, e.g. for two users' same-named files.
    pub fn upload_in(&self, subdir: &str, name: &str, content: &str) -> PathBuf {
        let dir = self.root.path().join(subdir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.path().join("output")
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            input_dir: self.root.path().join("input"),
            output_dir: self.output_dir(),
            provenance_db: self.root.path().join("provenance.db"),
            ..PipelineConfig::default()
        }
    }

    /// Artifact files in the output directory, sorted by name.
    pub fn artifacts(&self) -> Vec<String> {
        let dir = self.output_dir();
        if !dir.exists() {
            return Vec::new();
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

pub fn pipeline(
    workspace: &Workspace,
    model: Arc<ScriptedModel>,
    store: Arc<dyn ProvenanceStore>,
) -> Pipeline {
    Pipeline::new(
        workspace.config(),
        model,
        store,
        Arc::new(SqlSession::new()),
        Arc::new(StatusBoard::new()),
    )
    .unwrap()
}

pub fn sqlite_store(workspace: &Workspace) -> Arc<SqliteProvenanceStore> {
    Arc::new(SqliteProvenanceStore::open(workspace.root.path().join("provenance.db")).unwrap())
}

pub fn read_csv(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(|s| s.to_string()).collect())
        .collect()
}
