use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabula::llm::LlmProvider;
use tabula::provenance::SqliteProvenanceStore;
use tabula::schema::SchemaExtractor;
use tabula::{Pipeline, PipelineConfig, RunOutcome, RunRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabula")]
#[command(about = "Ask questions of a CSV file in plain language")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and run a query for a CSV file
    Run {
        /// CSV file to query
        #[arg(short, long)]
        file: PathBuf,

        /// The question in natural language
        #[arg(short, long)]
        request: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the inferred schema of a CSV file
    Schema {
        file: PathBuf,

        /// Rows scanned for type inference
        #[arg(long, default_value_t = 1000)]
        infer_schema_length: usize,
    },
    /// List recorded runs from the provenance log
    History {
        /// Provenance database (or set TABULA_PROVENANCE_DB)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct Overrides {
    /// Directory uploads are staged into (or set TABULA_INPUT_DIR)
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Directory results are published to (or set TABULA_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Provenance database (or set TABULA_PROVENANCE_DB)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Model used to generate SQL
    #[arg(long)]
    synthesis_model: Option<String>,

    /// Model used to explain failures
    #[arg(long)]
    diagnostic_model: Option<String>,

    /// LLM provider: ollama or openai
    #[arg(long)]
    provider: Option<LlmProvider>,

    /// LLM base URL
    #[arg(long)]
    base_url: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(dir) = self.input_dir {
            config.input_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(db) = self.db {
            config.provenance_db = db;
        }
        if let Some(model) = self.synthesis_model {
            config.synthesis_model = model;
        }
        if let Some(model) = self.diagnostic_model {
            config.diagnostic_model = model;
        }
        if let Some(provider) = self.provider {
            config.llm_provider = provider;
            config.llm_base_url = provider.default_base_url().to_string();
        }
        if let Some(url) = self.base_url {
            config.llm_base_url = url;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            file,
            request,
            overrides,
            json,
        } => {
            let mut config = PipelineConfig::from_env()?;
            overrides.apply(&mut config);
            run(config, file, request, json).await
        }
        Commands::Schema {
            file,
            infer_schema_length,
        } => {
            let (schema, dataset) = SchemaExtractor::new(infer_schema_length).extract(&file)?;
            println!("{}", schema);
            info!("{} rows in {}", dataset.row_count(), dataset.source().display());
            Ok(())
        }
        Commands::History { db } => {
            let config = PipelineConfig::from_env()?;
            let store = SqliteProvenanceStore::open(db.unwrap_or(config.provenance_db))?;
            for record in store.records()? {
                println!(
                    "{}  {}  {:?}  ->  {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.input_file_name,
                    record.input_request_text,
                    record.output_artifact_name
                );
            }
            Ok(())
        }
    }
}

async fn run(config: PipelineConfig, file: PathBuf, request: String, json: bool) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    let ctx = pipeline.context(chrono::Local::now().naive_local());
    let run_id = ctx.run_id();
    let board = pipeline.board();

    let worker = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run_with(&ctx, RunRequest::new(file, request)).await })
    };

    // Poll the run's slot the way an external status reader would.
    let mut last_seen = None;
    while !worker.is_finished() {
        if let Some(status) = board.get(&run_id) {
            if last_seen.as_ref() != Some(&status) {
                eprintln!("[{}] {}", status.state, status.message);
                last_seen = Some(status);
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let outcome = worker.await??;
    board.forget(&run_id);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        RunOutcome::Completed(success) => {
            println!("Query:\n{}\n", success.generated_query.as_str().trim());
            println!(
                "Wrote {} rows to {}",
                success.artifact.row_count,
                success.artifact.path.display()
            );
            if let Some(warning) = success.provenance_warning {
                eprintln!("warning: provenance not recorded: {}", warning);
            }
        }
        RunOutcome::Diagnosed(record) => {
            println!("The run failed during {}.\n", record.failed_stage);
            println!("Error:\n{}\n", record.original_error_text);
            println!("Schema:\n{}\n", record.schema_snapshot);
            if let Some(query) = &record.generated_query {
                println!("Query:\n{}\n", query.as_str().trim());
            }
            println!("Suggested fix:\n{}", record.diagnostic_explanation);
        }
    }
    Ok(())
}
