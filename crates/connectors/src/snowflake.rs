//! Snowflake SQL REST API connector.

use crate::sql::{effective_limit, ensure_select, SqlConnector};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sql_agent_common::config::SnowflakeConnection;
use sql_agent_common::{DatabaseEngine, QueryResult, Result, Text2SqlError};
use tracing::{info, instrument};

pub struct SnowflakeConnector {
    connection: SnowflakeConnection,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

impl SnowflakeConnector {
    pub fn new(connection: SnowflakeConnection) -> Self {
        let base_url = format!("https://{}.snowflakecomputing.com", connection.account);
        Self {
            connection,
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Point at a different endpoint; test servers use this.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SqlConnector for SnowflakeConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Snowflake
    }

    #[instrument(skip(self))]
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult> {
        ensure_select(sql, self.engine())?;
        let limit = effective_limit(row_limit);
        info!(limit, "Running query");

        let response = self
            .client
            .post(format!("{}/api/v2/statements", self.base_url))
            .bearer_auth(&self.connection.token)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .json(&json!({
                "statement": sql,
                "warehouse": self.connection.warehouse,
                "database": self.connection.database,
                "schema": self.connection.schema,
                "timeout": 60,
            }))
            .send()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Request failed: {e}")))?;

        let status = response.status();
        let body: StatementResponse = response
            .json()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Malformed response: {e}")))?;

        if !status.is_success() {
            return Err(Text2SqlError::SqlExecution(
                body.message.unwrap_or_else(|| format!("HTTP {status}")),
            ));
        }

        let meta = body
            .result_set_meta_data
            .ok_or_else(|| Text2SqlError::SqlExecution("Response missing result metadata".into()))?;
        let data = body.data.unwrap_or_default();

        let truncated = data.len() > limit;
        let rows = data
            .into_iter()
            .take(limit)
            .map(|row| {
                row.into_iter()
                    .zip(&meta.row_type)
                    .map(|(cell, row_type)| coerce(cell, &row_type.column_type))
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns: meta.row_type.iter().map(|c| c.name.clone()).collect(),
            rows,
            truncated,
        })
    }
}

/// Snowflake returns every cell as text; coerce by declared column type.
fn coerce(cell: Option<String>, column_type: &str) -> Value {
    let Some(text) = cell else {
        return Value::Null;
    };
    match column_type.to_uppercase().as_str() {
        "FIXED" => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<f64>().map(Value::from))
            .unwrap_or(Value::from(text)),
        "REAL" => text.parse::<f64>().map(Value::from).unwrap_or(Value::from(text)),
        "BOOLEAN" => Value::from(text.eq_ignore_ascii_case("true")),
        _ => Value::from(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base_url: &str) -> SnowflakeConnector {
        SnowflakeConnector::new(SnowflakeConnection {
            account: "acme".into(),
            warehouse: "COMPUTE_WH".into(),
            database: "ANALYTICS".into(),
            schema: "PUBLIC".into(),
            token: "token".into(),
        })
        .with_base_url(base_url)
    }

    #[tokio::test]
    async fn parses_statement_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/statements"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultSetMetaData": {
                    "rowType": [
                        {"name": "COUNTRY", "type": "TEXT"},
                        {"name": "TOTAL", "type": "FIXED"}
                    ]
                },
                "data": [["United Kingdom", "1523"], ["France", "987"]]
            })))
            .mount(&server)
            .await;

        let result = connector(&server.uri())
            .execute("SELECT country, SUM(total) AS total FROM orders GROUP BY country", 100)
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["COUNTRY", "TOTAL"]);
        assert_eq!(result.rows[0], vec![json!("United Kingdom"), json!(1523)]);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn row_cap_truncates_inline_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/statements"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultSetMetaData": {"rowType": [{"name": "N", "type": "FIXED"}]},
                "data": [["1"], ["2"], ["3"]]
            })))
            .mount(&server)
            .await;

        let result = connector(&server.uri()).execute("SELECT n FROM t", 2).await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn api_errors_surface_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/statements"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "SQL compilation error: invalid identifier 'MISSING'"
            })))
            .mount(&server)
            .await;

        let error = connector(&server.uri())
            .execute("SELECT missing FROM t", 10)
            .await
            .unwrap_err();
        match error {
            Text2SqlError::SqlExecution(message) => assert!(message.contains("compilation error")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
