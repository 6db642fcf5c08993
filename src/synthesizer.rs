//! Query synthesis - natural-language request to SQL text via a generative model
//!
//! The model's reply is returned untouched. Whether it parses is discovered by
//! the executor, never here.

use crate::error::{PipelineError, Result};
use crate::llm::GenerativeModel;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// SQL text exactly as the model produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratedQuery(String);

impl GeneratedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneratedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grounding message naming the virtual table and listing its columns.
pub fn build_system_prompt(view_name: &str, schema: &Schema) -> String {
    format!(
        "Table name is {}. The structure of the table is:\n{}",
        view_name, schema
    )
}

pub struct QuerySynthesizer {
    model: Arc<dyn GenerativeModel>,
    model_id: String,
    timeout: Duration,
}

impl QuerySynthesizer {
    pub fn new(model: Arc<dyn GenerativeModel>, model_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model,
            model_id: model_id.into(),
            timeout,
        }
    }

    pub async fn synthesize(
        &self,
        schema: &Schema,
        request_text: &str,
        view_name: &str,
    ) -> Result<GeneratedQuery> {
        let system = build_system_prompt(view_name, schema);
        info!("Generating SQL with {} for: {}", self.model_id, request_text);

        let text = tokio::time::timeout(
            self.timeout,
            self.model.generate(&self.model_id, &system, request_text),
        )
        .await
        .map_err(|_| {
            PipelineError::Synthesis(format!(
                "Query generation timed out after {:?}",
                self.timeout
            ))
        })?
        .map_err(|e| PipelineError::Synthesis(e.raw_message()))?;

        if text.trim().is_empty() {
            warn!("Model {} returned no query text", self.model_id);
            return Err(PipelineError::Synthesis(
                "Model returned an empty query".to_string(),
            ));
        }

        info!("✅ Generated SQL: {}", text.trim());
        Ok(GeneratedQuery(text))
    }
}
