//! Pipeline orchestrator
//!
//! Sequences one run: stage upload → extract schema → synthesize → execute →
//! materialize. Every stage returns a `Result`; the orchestrator matches on it
//! to continue, abort (upload and schema failures), or hand the failure to the
//! diagnostic fallback (synthesis, execution and materialization failures).
//!
//! Progress is published per run on the shared `StatusBoard`.

use crate::config::PipelineConfig;
use crate::diagnostics::{DiagnosticFallback, DiagnosticRecord, FailedStage, FailureContext};
use crate::engine::{QueryExecutor, SqlSession};
use crate::error::{PipelineError, Result};
use crate::intake::stage_input;
use crate::llm::{GenerativeModel, LlmClient};
use crate::materializer::{ResultArtifact, ResultMaterializer};
use crate::provenance::{ProvenanceStore, SqliteProvenanceStore};
use crate::schema::{Schema, SchemaExtractor};
use crate::status::{RunState, RunStatus, StatusBoard};
use crate::synthesizer::{GeneratedQuery, QuerySynthesizer};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Uploaded file as handed over by the intake layer
    pub source_path: PathBuf,
    pub request_text: String,
}

impl RunRequest {
    pub fn new(source_path: impl Into<PathBuf>, request_text: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            request_text: request_text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSuccess {
    pub run_id: Uuid,
    pub input_file_name: String,
    pub request_text: String,
    pub schema: Schema,
    pub generated_query: GeneratedQuery,
    pub artifact: ResultArtifact,
    pub provenance_warning: Option<String>,
}

/// A completed run produces exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunSuccess),
    Diagnosed(DiagnosticRecord),
}

impl RunOutcome {
    pub fn artifact(&self) -> Option<&ResultArtifact> {
        match self {
            RunOutcome::Completed(success) => Some(&success.artifact),
            RunOutcome::Diagnosed(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Option<&DiagnosticRecord> {
        match self {
            RunOutcome::Completed(_) => None,
            RunOutcome::Diagnosed(record) => Some(record),
        }
    }
}

/// Per-run handle: identity, artifact timestamp, and the run's status slot.
pub struct RunContext {
    run_id: Uuid,
    timestamp: NaiveDateTime,
    board: Arc<StatusBoard>,
    transitions: Mutex<Vec<RunState>>,
}

impl RunContext {
    fn new(board: Arc<StatusBoard>, timestamp: NaiveDateTime) -> Self {
        let run_id = Uuid::new_v4();
        board.publish(run_id, RunStatus::idle());
        Self {
            run_id,
            timestamp,
            board,
            transitions: Mutex::new(vec![RunState::Idle]),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn timestamp(&self) -> &NaiveDateTime {
        &self.timestamp
    }

    pub fn state(&self) -> RunState {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
            .unwrap_or(RunState::Idle)
    }

    /// Every state this run has entered, starting with `Idle`.
    pub fn transitions(&self) -> Vec<RunState> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, next: RunState, message: impl Into<String>) {
        let message = message.into();
        let mut transitions = self.transitions.lock().unwrap_or_else(PoisonError::into_inner);
        let current = transitions.last().copied().unwrap_or(RunState::Idle);
        if !current.can_transition_to(next) {
            warn!("Run {}: unexpected transition {} -> {}", self.run_id, current, next);
        }
        transitions.push(next);
        info!("Run {} [{}] {}", self.run_id, next, message);
        self.board.publish(self.run_id, RunStatus { state: next, message });
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    extractor: SchemaExtractor,
    synthesizer: QuerySynthesizer,
    executor: QueryExecutor,
    materializer: ResultMaterializer,
    fallback: DiagnosticFallback,
    board: Arc<StatusBoard>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        model: Arc<dyn GenerativeModel>,
        store: Arc<dyn ProvenanceStore>,
        session: Arc<SqlSession>,
        board: Arc<StatusBoard>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            extractor: SchemaExtractor::new(config.infer_schema_length),
            synthesizer: QuerySynthesizer::new(
                Arc::clone(&model),
                config.synthesis_model.clone(),
                config.llm_timeout(),
            ),
            executor: QueryExecutor::new(session, config.query_timeout()),
            materializer: ResultMaterializer::new(config.output_dir.clone(), store),
            fallback: DiagnosticFallback::new(model, config.diagnostic_model.clone(), config.llm_timeout()),
            board,
            config,
        })
    }

    /// Wire the production collaborators: HTTP model client, SQLite
    /// provenance store, a fresh engine session and status board.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let model = Arc::new(LlmClient::from_config(&config)?);
        let store = Arc::new(SqliteProvenanceStore::open(&config.provenance_db)?);
        Self::new(
            config,
            model,
            store,
            Arc::new(SqlSession::new()),
            Arc::new(StatusBoard::new()),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    /// Allocate a run id and publish its idle status.
    pub fn context(&self, timestamp: NaiveDateTime) -> RunContext {
        RunContext::new(Arc::clone(&self.board), timestamp)
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        self.run_at(request, Local::now().naive_local()).await
    }

    pub async fn run_at(&self, request: RunRequest, timestamp: NaiveDateTime) -> Result<RunOutcome> {
        let ctx = self.context(timestamp);
        self.run_with(&ctx, request).await
    }

    /// Execute a run whose status is published under `ctx.run_id()`.
    ///
    /// `Ok` carries either a result artifact or a diagnostic record. `Err` is
    /// a hard failure: the input could not be staged or loaded, or the
    /// diagnostic model itself failed.
    pub async fn run_with(&self, ctx: &RunContext, request: RunRequest) -> Result<RunOutcome> {
        let view_name = self.config.view_name.as_str();

        ctx.transition(RunState::Uploading, "Uploading file...");
        let staged = match stage_input(&request.source_path, &self.config.input_dir, ctx.run_id()) {
            Ok(staged) => staged,
            Err(e) => return Err(self.abort(ctx, e)),
        };

        ctx.transition(RunState::SchemaLoading, "CSV file loading into query engine.");
        let (schema, dataset) = match self.extractor.extract(&staged.path) {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.abort(ctx, e)),
        };

        ctx.transition(RunState::Synthesizing, "Generating SQL query...");
        let query = match self
            .synthesizer
            .synthesize(&schema, &request.request_text, view_name)
            .await
        {
            Ok(query) => query,
            Err(e) => return self.recover(ctx, e, &staged.file_name, &schema, None).await,
        };

        ctx.transition(RunState::Executing, "Executing query...");
        let mut result = match self.executor.execute(&dataset, view_name, &query).await {
            Ok(df) => df,
            Err(e) => return self.recover(ctx, e, &staged.file_name, &schema, Some(&query)).await,
        };
        drop(dataset);

        ctx.transition(RunState::Materializing, "Saving results to CSV...");
        let materialized = match self.materializer.materialize(
            &mut result,
            &staged.file_name,
            &request.request_text,
            &query,
            ctx.timestamp(),
        ) {
            Ok(done) => done,
            Err(e) => return self.recover(ctx, e, &staged.file_name, &schema, Some(&query)).await,
        };

        ctx.transition(
            RunState::Done,
            format!("Results saved to {}", materialized.artifact.name),
        );

        Ok(RunOutcome::Completed(RunSuccess {
            run_id: ctx.run_id(),
            input_file_name: staged.file_name,
            request_text: request.request_text,
            schema,
            generated_query: query,
            artifact: materialized.artifact,
            provenance_warning: materialized.provenance_warning,
        }))
    }

    fn abort(&self, ctx: &RunContext, error: PipelineError) -> PipelineError {
        error!("Run {} aborted: {}", ctx.run_id(), error);
        ctx.transition(RunState::Aborted, error.to_string());
        error
    }

    async fn recover(
        &self,
        ctx: &RunContext,
        error: PipelineError,
        input_file_name: &str,
        schema: &Schema,
        generated_query: Option<&GeneratedQuery>,
    ) -> Result<RunOutcome> {
        let stage = match FailedStage::of(&error) {
            Some(stage) => stage,
            None => return Err(self.abort(ctx, error)),
        };
        warn!("Run {}: {} failed: {}", ctx.run_id(), stage, error);

        ctx.transition(RunState::Diagnosing, "Trying to resolve error...");
        let failure = FailureContext {
            stage,
            error_text: error.raw_message(),
            input_file_name,
            schema,
            generated_query,
        };

        match self.fallback.diagnose(failure).await {
            Ok(record) => {
                ctx.transition(RunState::Done, "Error diagnosed");
                Ok(RunOutcome::Diagnosed(record))
            }
            Err(reason) => {
                error!("Run {}: diagnostic fallback failed: {}", ctx.run_id(), reason);
                ctx.transition(RunState::Aborted, format!("Diagnosis failed: {}", reason));
                Err(PipelineError::Diagnostic {
                    original: Box::new(error),
                    reason,
                })
            }
        }
    }
}
