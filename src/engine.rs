//! Query execution against a shared polars SQL session
//!
//! All runs share one `SQLContext` catalog. Binding the virtual table is a
//! global side effect on that catalog, so register + execute + collect +
//! unregister happen under one lock: a run never reads a dataset another run
//! bound under the same name.

use crate::error::{PipelineError, Result};
use crate::schema::Dataset;
use crate::synthesizer::GeneratedQuery;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine session owning the view catalog.
pub struct SqlSession {
    context: Mutex<SQLContext>,
}

impl SqlSession {
    pub fn new() -> Self {
        Self {
            context: Mutex::new(SQLContext::new()),
        }
    }

    /// Bind `dataset` as `view_name` (replacing any prior binding), run
    /// `sql`, and materialize the result. The engine's error text is passed
    /// through unchanged.
    pub fn execute_bound(&self, view_name: &str, dataset: &Dataset, sql: &str) -> Result<DataFrame> {
        // A panic inside a previous query poisons the lock; the catalog is
        // rebound on every call, so the inner context is still usable.
        let mut ctx = self.context.lock().unwrap_or_else(PoisonError::into_inner);

        ctx.register(view_name, dataset.lazy());
        let result = ctx.execute(sql).and_then(|lf| lf.collect());
        ctx.unregister(view_name);

        result.map_err(|e| PipelineError::Execution(e.to_string()))
    }

    /// Names currently bound in the catalog.
    pub fn registered_views(&self) -> Vec<String> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_tables()
    }
}

impl Default for SqlSession {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueryExecutor {
    session: Arc<SqlSession>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(session: Arc<SqlSession>, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    pub async fn execute(
        &self,
        dataset: &Dataset,
        view_name: &str,
        query: &GeneratedQuery,
    ) -> Result<DataFrame> {
        let start_time = Instant::now();
        info!("Executing query against {}: {}", view_name, query.as_str().trim());

        let session = Arc::clone(&self.session);
        let dataset = dataset.clone();
        let view = view_name.to_string();
        let sql = query.as_str().to_string();

        let handle = tokio::task::spawn_blocking(move || session.execute_bound(&view, &dataset, &sql));

        let df = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(PipelineError::Execution(format!(
                    "Query execution task failed: {}",
                    join_err
                )))
            }
            Err(_) => {
                warn!("Query exceeded {:?}", self.timeout);
                return Err(PipelineError::Execution(format!(
                    "Query execution timed out after {:?}",
                    self.timeout
                )));
            }
        };

        debug!("Result columns: {:?}", df.get_column_names());
        info!(
            "✅ Query returned {} rows in {}ms",
            df.height(),
            start_time.elapsed().as_millis()
        );
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaExtractor;
    use tempfile::TempDir;

    fn dataset(content: &str) -> Dataset {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, content).unwrap();
        SchemaExtractor::new(100).extract(&path).unwrap().1
    }

    #[tokio::test]
    async fn test_executes_against_view() {
        let executor = QueryExecutor::new(Arc::new(SqlSession::new()), Duration::from_secs(30));
        let data = dataset("id,amount\n1,2.0\n1,3.0\n2,4.0\n");

        let df = executor
            .execute(
                &data,
                "temp_view",
                &GeneratedQuery::new("SELECT id, SUM(amount) AS sum_amount FROM temp_view GROUP BY id ORDER BY id"),
            )
            .await
            .unwrap();

        assert_eq!(df.get_column_names(), vec!["id", "sum_amount"]);
        assert_eq!(df.height(), 2);
    }

    #[tokio::test]
    async fn test_unaliased_aggregate_keeps_input_column_name() {
        let executor = QueryExecutor::new(Arc::new(SqlSession::new()), Duration::from_secs(30));
        let data = dataset("id,amount\n1,2.0\n1,3.0\n2,4.0\n");

        let df = executor
            .execute(
                &data,
                "temp_view",
                &GeneratedQuery::new("SELECT id, SUM(amount) FROM temp_view GROUP BY id"),
            )
            .await
            .unwrap();

        // polars names an aggregate after its input column
        assert_eq!(df.get_column_names(), vec!["id", "amount"]);
        assert_eq!(df.height(), 2);
    }

    #[tokio::test]
    async fn test_query_timeout_is_execution_error() {
        let session = Arc::new(SqlSession::new());
        let data = dataset("id\n1\n");
        let executor = QueryExecutor::new(Arc::clone(&session), Duration::from_millis(50));

        // Another run holding the catalog keeps this query from finishing in time.
        let held = session.context.lock().unwrap();
        let result = executor
            .execute(&data, "temp_view", &GeneratedQuery::new("SELECT * FROM temp_view"))
            .await;
        drop(held);

        assert!(matches!(result, Err(PipelineError::Execution(msg)) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_missing_column_keeps_engine_text() {
        let session = Arc::new(SqlSession::new());
        let data = dataset("id,amount\n1,2.0\n");
        let sql = "SELECT foo FROM temp_view";

        let direct = session.execute_bound("temp_view", &data, sql).unwrap_err();
        let executor = QueryExecutor::new(Arc::clone(&session), Duration::from_secs(30));
        let via_executor = executor
            .execute(&data, "temp_view", &GeneratedQuery::new(sql))
            .await
            .unwrap_err();

        match (&direct, &via_executor) {
            (PipelineError::Execution(a), PipelineError::Execution(b)) => {
                assert!(a.contains("foo"));
                assert_eq!(a, b);
            }
            other => panic!("expected execution errors, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_query_is_execution_error() {
        let executor = QueryExecutor::new(Arc::new(SqlSession::new()), Duration::from_secs(30));
        let data = dataset("id\n1\n");
        let result = executor
            .execute(&data, "temp_view", &GeneratedQuery::new("Sure! Here is your query:"))
            .await;
        assert!(matches!(result, Err(PipelineError::Execution(_))));
    }

    #[test]
    fn test_view_is_unbound_after_execution() {
        let session = SqlSession::new();
        let data = dataset("id\n1\n");
        session.execute_bound("temp_view", &data, "SELECT * FROM temp_view").unwrap();
        assert!(session.registered_views().is_empty());
    }
}
