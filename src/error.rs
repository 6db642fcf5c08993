use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Data load error: {0}")]
    DataLoad(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Materialization error: {0}")]
    Materialization(String),

    /// The diagnostic model call failed; displays the original stage error as-is.
    #[error("{original}")]
    Diagnostic {
        original: Box<PipelineError>,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// The stage's own message without the variant prefix. For execution
    /// failures this is the engine's error text, untouched.
    pub fn raw_message(&self) -> String {
        match self {
            PipelineError::DataLoad(msg)
            | PipelineError::Synthesis(msg)
            | PipelineError::Execution(msg)
            | PipelineError::Materialization(msg)
            | PipelineError::Config(msg) => msg.clone(),
            PipelineError::Diagnostic { original, .. } => original.raw_message(),
            PipelineError::Io(e) => e.to_string(),
            PipelineError::Json(e) => e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
