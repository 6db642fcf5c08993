//! Pipeline configuration
//!
//! Defaults mirror a local Ollama setup. `from_env` loads a `.env` file first,
//! then reads `TABULA_*` variables; the CLI may override individual fields.

use crate::error::{PipelineError, Result};
use crate::llm::LlmProvider;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Virtual table name the generated query must reference.
pub const DEFAULT_VIEW_NAME: &str = "temp_view";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory uploaded files are staged into
    pub input_dir: PathBuf,

    /// Directory result artifacts are published to
    pub output_dir: PathBuf,

    /// SQLite file backing the provenance log
    pub provenance_db: PathBuf,

    pub view_name: String,

    /// Model used to turn requests into SQL
    pub synthesis_model: String,

    /// Model used to explain failures
    pub diagnostic_model: String,

    pub llm_provider: LlmProvider,
    pub llm_base_url: String,
    pub api_key: Option<String>,

    pub llm_timeout_secs: u64,
    pub query_timeout_secs: u64,

    /// Rows scanned for CSV type inference
    pub infer_schema_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/input"),
            output_dir: PathBuf::from("data/output"),
            provenance_db: PathBuf::from("data/provenance.db"),
            view_name: DEFAULT_VIEW_NAME.to_string(),
            synthesis_model: "duckdb-nsql".to_string(),
            diagnostic_model: "llama3.2".to_string(),
            llm_provider: LlmProvider::Ollama,
            llm_base_url: LlmProvider::Ollama.default_base_url().to_string(),
            api_key: None,
            llm_timeout_secs: 120,
            query_timeout_secs: 300,
            infer_schema_length: 1000,
        }
    }
}

impl PipelineConfig {
    /// Build configuration from the process environment (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("TABULA_INPUT_DIR") {
            config.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TABULA_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("TABULA_PROVENANCE_DB") {
            config.provenance_db = PathBuf::from(db);
        }
        if let Some(view) = lookup("TABULA_VIEW_NAME") {
            config.view_name = view;
        }
        if let Some(model) = lookup("TABULA_SYNTHESIS_MODEL") {
            config.synthesis_model = model;
        }
        if let Some(model) = lookup("TABULA_DIAGNOSTIC_MODEL") {
            config.diagnostic_model = model;
        }
        if let Some(provider) = lookup("TABULA_LLM_PROVIDER") {
            config.llm_provider = provider.parse()?;
            config.llm_base_url = config.llm_provider.default_base_url().to_string();
        }
        if let Some(url) = lookup("TABULA_LLM_BASE_URL") {
            config.llm_base_url = url;
        }
        config.api_key = lookup("OPENAI_API_KEY");

        if let Some(secs) = lookup("TABULA_LLM_TIMEOUT_SECS") {
            config.llm_timeout_secs = parse_number("TABULA_LLM_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("TABULA_QUERY_TIMEOUT_SECS") {
            config.query_timeout_secs = parse_number("TABULA_QUERY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(rows) = lookup("TABULA_INFER_SCHEMA_LENGTH") {
            config.infer_schema_length = parse_number("TABULA_INFER_SCHEMA_LENGTH", &rows)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.view_name.trim().is_empty() {
            return Err(PipelineError::Config("view name must not be empty".to_string()));
        }
        if self.llm_timeout_secs == 0 || self.query_timeout_secs == 0 {
            return Err(PipelineError::Config("timeouts must be positive".to_string()));
        }
        if self.llm_provider == LlmProvider::OpenAi && self.api_key.is_none() {
            return Err(PipelineError::Config(
                "OPENAI_API_KEY is required for the openai provider".to_string(),
            ));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{} is not a valid number: {}", key, raw)))
}
