//! Diagnostic fallback - asks a model to explain a failed run
//!
//! The prompt is independent of the synthesis prompt and carries the failing
//! stage's message verbatim. There is no second-level fallback: if this call
//! fails, the caller ends the run hard with the original error.

use crate::error::{PipelineError, Result};
use crate::llm::GenerativeModel;
use crate::schema::Schema;
use crate::synthesizer::GeneratedQuery;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DIAGNOSTIC_SYSTEM_PROMPT: &str = "You are a troubleshooting assistant that helps resolve SQL query engine errors. \
Provide clear, concise solutions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Synthesis,
    Execution,
    Materialization,
}

impl FailedStage {
    pub fn of(error: &PipelineError) -> Option<Self> {
        match error {
            PipelineError::Synthesis(_) => Some(FailedStage::Synthesis),
            PipelineError::Execution(_) => Some(FailedStage::Execution),
            PipelineError::Materialization(_) => Some(FailedStage::Materialization),
            _ => None,
        }
    }
}

impl fmt::Display for FailedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedStage::Synthesis => write!(f, "query generation"),
            FailedStage::Execution => write!(f, "query execution"),
            FailedStage::Materialization => write!(f, "result materialization"),
        }
    }
}

/// Everything a user needs to understand and reproduce a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub failed_stage: FailedStage,
    pub original_error_text: String,
    pub input_file_name: String,
    pub schema_snapshot: Schema,
    pub generated_query: Option<GeneratedQuery>,
    pub diagnostic_explanation: String,
}

/// What went wrong, as captured by the orchestrator.
pub struct FailureContext<'a> {
    pub stage: FailedStage,
    pub error_text: String,
    pub input_file_name: &'a str,
    pub schema: &'a Schema,
    pub generated_query: Option<&'a GeneratedQuery>,
}

pub fn build_diagnostic_prompt(failure: &FailureContext<'_>) -> String {
    let mut parts = vec![
        format!("The following error occurred during {}:", failure.stage),
        String::new(),
        failure.error_text.clone(),
        String::new(),
        "The table is registered as a view with this structure:".to_string(),
        failure.schema.to_string(),
    ];

    if let Some(query) = failure.generated_query {
        parts.push(String::new());
        parts.push("The query that was run:".to_string());
        parts.push(query.as_str().to_string());
    }

    parts.push(String::new());
    parts.push("Please analyze this error and suggest possible solutions.".to_string());
    parts.join("\n")
}

pub struct DiagnosticFallback {
    model: Arc<dyn GenerativeModel>,
    model_id: String,
    timeout: Duration,
}

impl DiagnosticFallback {
    pub fn new(model: Arc<dyn GenerativeModel>, model_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model,
            model_id: model_id.into(),
            timeout,
        }
    }

    /// Returns the explanation, or the reason the diagnostic call failed.
    pub async fn diagnose(&self, failure: FailureContext<'_>) -> std::result::Result<DiagnosticRecord, String> {
        let prompt = build_diagnostic_prompt(&failure);
        info!("Asking {} to diagnose {} failure", self.model_id, failure.stage);

        let reply: Result<String> = match tokio::time::timeout(
            self.timeout,
            self.model.generate(&self.model_id, DIAGNOSTIC_SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => {
                return Err(format!("Diagnostic generation timed out after {:?}", self.timeout));
            }
        };

        let explanation = reply.map_err(|e| {
            warn!("Diagnostic model {} failed: {}", self.model_id, e);
            e.to_string()
        })?;

        if explanation.trim().is_empty() {
            return Err("Diagnostic model returned an empty explanation".to_string());
        }

        Ok(DiagnosticRecord {
            failed_stage: failure.stage,
            original_error_text: failure.error_text,
            input_file_name: failure.input_file_name.to_string(),
            schema_snapshot: failure.schema.clone(),
            generated_query: failure.generated_query.cloned(),
            diagnostic_explanation: explanation,
        })
    }
}
