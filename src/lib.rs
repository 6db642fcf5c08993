pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod intake;
pub mod llm;
pub mod materializer;
pub mod pipeline;
pub mod provenance;
pub mod schema;
pub mod status;
pub mod synthesizer;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunContext, RunOutcome, RunRequest, RunSuccess};
