//! Schema extraction - loads a CSV file and infers typed columns from content
//!
//! Structure (header present, names unique, rows of equal width) is checked
//! with the `csv` reader first; polars then infers column types from the data.
//! Every failure here is a `DataLoad` error: without a schema there is nothing
//! to ground a query on, so the pipeline aborts instead of diagnosing.

use crate::error::{PipelineError, Result};
use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

/// Ordered, typed column list of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDescriptor>,
}

impl Schema {
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn from_frame(df: &DataFrame) -> Self {
        let columns = df
            .get_columns()
            .iter()
            .map(|s| ColumnDescriptor {
                name: s.name().to_string(),
                data_type: sql_type_name(s.dtype()),
            })
            .collect();
        Self { columns }
    }
}

/// One `name (type)` line per column, in file order.
impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.data_type))
            .join("\n");
        write!(f, "{}", lines)
    }
}

/// In-memory table backing one run.
#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
    source: PathBuf,
}

impl Dataset {
    pub fn lazy(&self) -> LazyFrame {
        self.frame.clone().lazy()
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

pub struct SchemaExtractor {
    infer_schema_length: usize,
}

impl SchemaExtractor {
    pub fn new(infer_schema_length: usize) -> Self {
        Self {
            infer_schema_length: infer_schema_length.max(1),
        }
    }

    pub fn extract(&self, path: &Path) -> Result<(Schema, Dataset)> {
        info!("Loading {} for schema inference", path.display());

        let width = validate_structure(path)?;

        let frame = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(self.infer_schema_length))
            .with_try_parse_dates(true)
            .finish()
            .and_then(|lf| lf.collect())
            .map_err(|e| {
                PipelineError::DataLoad(format!("Failed to read CSV {}: {}", path.display(), e))
            })?;

        if frame.width() != width {
            return Err(PipelineError::DataLoad(format!(
                "Header declares {} columns but {} were loaded",
                width,
                frame.width()
            )));
        }

        let schema = Schema::from_frame(&frame);
        debug!("Inferred schema:\n{}", schema);
        info!(
            "Loaded {} rows x {} columns from {}",
            frame.height(),
            schema.len(),
            path.display()
        );

        Ok((
            schema,
            Dataset {
                frame,
                source: path.to_path_buf(),
            },
        ))
    }
}

/// Checks header and row widths; returns the column count.
fn validate_structure(path: &Path) -> Result<usize> {
    if !path.is_file() {
        return Err(PipelineError::DataLoad(format!(
            "Input file not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .map_err(|e| PipelineError::DataLoad(format!("Failed to open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::DataLoad(format!("Failed to read header row: {}", e)))?
        .clone();

    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(PipelineError::DataLoad(format!(
            "{} is empty or has no header row",
            path.display()
        )));
    }

    let mut seen = HashSet::new();
    for name in headers.iter() {
        if name.trim().is_empty() {
            return Err(PipelineError::DataLoad("Header row contains a blank column name".to_string()));
        }
        if !seen.insert(name) {
            return Err(PipelineError::DataLoad(format!("Duplicate column name: {}", name)));
        }
    }

    for record in reader.records() {
        record.map_err(|e| PipelineError::DataLoad(format!("Malformed CSV row: {}", e)))?;
    }

    Ok(headers.len())
}

/// SQL-flavoured type name used in prompts.
pub fn sql_type_name(dtype: &DataType) -> String {
    match dtype {
        DataType::Boolean => "boolean".to_string(),
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::UInt8 | DataType::UInt16 => {
            "int".to_string()
        }
        DataType::Int64 | DataType::UInt32 | DataType::UInt64 => "bigint".to_string(),
        DataType::Float32 => "float".to_string(),
        DataType::Float64 => "double".to_string(),
        DataType::String => "string".to_string(),
        DataType::Date => "date".to_string(),
        DataType::Datetime(_, _) => "timestamp".to_string(),
        other => other.to_string(),
    }
}
