use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// A text generation backend: one system prompt, one user prompt, one reply.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, model: &str, system: &str, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    OpenAi,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::OpenAi => "https://api.openai.com/v1",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(LlmProvider::Ollama),
            "openai" => Ok(LlmProvider::OpenAi),
            other => Err(PipelineError::Config(format!("Unknown LLM provider: {}", other))),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::OpenAi => write!(f, "openai"),
        }
    }
}

pub struct LlmClient {
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        provider: LlmProvider,
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    pub fn from_config(config: &crate::config::PipelineConfig) -> Result<Self> {
        Self::new(
            config.llm_provider,
            config.llm_base_url.clone(),
            config.api_key.clone(),
            config.llm_timeout(),
        )
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::Ollama => format!("{}/api/generate", self.base_url),
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
        }
    }
}

#[async_trait]
impl GenerativeModel for LlmClient {
    async fn generate(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        let body = build_request_body(self.provider, model, system, prompt);
        debug!("Calling {} model {} at {}", self.provider, model, self.endpoint());

        let mut request = self
            .http
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            return Err(PipelineError::Synthesis(format!(
                "LLM API returned {}: {}",
                status, response_json
            )));
        }

        extract_text(self.provider, &response_json)
    }
}

/// Request payload for a single non-streaming generation call.
pub fn build_request_body(
    provider: LlmProvider,
    model: &str,
    system: &str,
    prompt: &str,
) -> serde_json::Value {
    match provider {
        LlmProvider::Ollama => serde_json::json!({
            "model": model,
            "system": system,
            "prompt": prompt,
            "stream": false
        }),
        LlmProvider::OpenAi => serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1
        }),
    }
}

pub fn extract_text(provider: LlmProvider, response: &serde_json::Value) -> Result<String> {
    let content = match provider {
        LlmProvider::Ollama => response["response"].as_str(),
        LlmProvider::OpenAi => response["choices"][0]["message"]["content"].as_str(),
    };

    content
        .map(|s| s.to_string())
        .ok_or_else(|| PipelineError::Synthesis("No content in LLM response".to_string()))
}
