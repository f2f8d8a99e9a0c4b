//! Databricks SQL Statement Execution API connector.

use crate::sql::{effective_limit, ensure_select, SqlConnector};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sql_agent_common::config::DatabricksConnection;
use sql_agent_common::{DatabaseEngine, QueryResult, Result, Text2SqlError};
use tracing::{info, instrument};

pub struct DatabricksConnector {
    connection: DatabricksConnection,
    warehouse_id: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
}

impl DatabricksConnector {
    pub fn new(connection: DatabricksConnection) -> anyhow::Result<Self> {
        // The warehouse id is the trailing segment of the configured
        // http_path, e.g. /sql/1.0/warehouses/abc123.
        let warehouse_id = connection
            .http_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| anyhow::anyhow!("http_path does not contain a warehouse id"))?
            .to_string();
        let base_url = connection.host.trim_end_matches('/').to_string();
        Ok(Self {
            connection,
            warehouse_id,
            client: reqwest::Client::new(),
            base_url,
        })
    }

    /// Point at a different endpoint; test servers use this.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SqlConnector for DatabricksConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Databricks
    }

    #[instrument(skip(self))]
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult> {
        ensure_select(sql, self.engine())?;
        let limit = effective_limit(row_limit);
        info!(limit, warehouse = %self.warehouse_id, "Running query");

        let response = self
            .client
            .post(format!("{}/api/2.0/sql/statements", self.base_url))
            .bearer_auth(&self.connection.token)
            .json(&json!({
                "statement": sql,
                "warehouse_id": self.warehouse_id,
                "catalog": self.connection.catalog,
                "schema": self.connection.schema,
                "wait_timeout": "50s",
                "format": "JSON_ARRAY",
                "disposition": "INLINE",
            }))
            .send()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Text2SqlError::SqlExecution(format!("HTTP {status}: {text}")));
        }

        let body: StatementResponse = response
            .json()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Malformed response: {e}")))?;

        if body.status.state != "SUCCEEDED" {
            let message = body
                .status
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("Statement finished in state {}", body.status.state));
            return Err(Text2SqlError::SqlExecution(message));
        }

        let manifest = body
            .manifest
            .ok_or_else(|| Text2SqlError::SqlExecution("Response missing manifest".into()))?;
        let data = body.result.map(|r| r.data_array).unwrap_or_default();

        let truncated = data.len() > limit;
        let rows = data
            .into_iter()
            .take(limit)
            .map(|row| {
                row.into_iter()
                    .zip(&manifest.schema.columns)
                    .map(|(cell, column)| coerce(cell, &column.type_name))
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns: manifest.schema.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            truncated,
        })
    }
}

fn coerce(cell: Option<String>, type_name: &str) -> Value {
    let Some(text) = cell else {
        return Value::Null;
    };
    match type_name.to_uppercase().as_str() {
        "INT" | "BIGINT" | "SMALLINT" | "TINYINT" | "LONG" => {
            text.parse::<i64>().map(Value::from).unwrap_or(Value::from(text))
        }
        "FLOAT" | "DOUBLE" | "DECIMAL" => {
            text.parse::<f64>().map(Value::from).unwrap_or(Value::from(text))
        }
        "BOOLEAN" => Value::from(text.eq_ignore_ascii_case("true")),
        _ => Value::from(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base_url: &str) -> DatabricksConnector {
        DatabricksConnector::new(DatabricksConnection {
            host: "https://adb-123.azuredatabricks.net".into(),
            http_path: "/sql/1.0/warehouses/abc123".into(),
            catalog: "main".into(),
            schema: "sales".into(),
            token: "token".into(),
        })
        .unwrap()
        .with_base_url(base_url)
    }

    #[tokio::test]
    async fn sends_warehouse_id_from_http_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/sql/statements"))
            .and(body_partial_json(json!({"warehouse_id": "abc123"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [{"name": "c", "type_name": "BIGINT"}]}},
                "result": {"data_array": [["12"]]}
            })))
            .mount(&server)
            .await;

        let result = connector(&server.uri())
            .execute("SELECT COUNT(*) AS c FROM orders", 100)
            .await
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!(12)]]);
    }

    #[tokio::test]
    async fn failed_statements_surface_the_engine_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/sql/statements"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": {"state": "FAILED", "error": {"message": "TABLE_OR_VIEW_NOT_FOUND"}}
            })))
            .mount(&server)
            .await;

        let error = connector(&server.uri())
            .execute("SELECT 1 FROM missing", 10)
            .await
            .unwrap_err();
        match error {
            Text2SqlError::SqlExecution(message) => assert!(message.contains("TABLE_OR_VIEW_NOT_FOUND")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
