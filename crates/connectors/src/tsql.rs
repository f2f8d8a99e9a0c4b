use crate::sql::{effective_limit, ensure_select, SqlConnector};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use sql_agent_common::config::TsqlConnection;
use sql_agent_common::{DatabaseEngine, QueryResult, Result, Text2SqlError};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{info, instrument};

/// Connects per query, mirroring the short-lived connection pattern the
/// other engines get from their pools.
pub struct TsqlConnector {
    connection: TsqlConnection,
}

impl TsqlConnector {
    pub fn new(connection: TsqlConnection) -> Self {
        Self { connection }
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.connection.host);
        config.port(self.connection.port);
        config.database(&self.connection.database);
        config.authentication(AuthMethod::sql_server(
            &self.connection.username,
            &self.connection.password,
        ));
        if self.connection.trust_certificate {
            config.trust_cert();
        }
        config
    }
}

#[async_trait]
impl SqlConnector for TsqlConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Tsql
    }

    #[instrument(skip(self))]
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult> {
        ensure_select(sql, self.engine())?;
        let limit = effective_limit(row_limit);
        info!(limit, "Running query");

        let config = self.config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Connection failed: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| Text2SqlError::SqlExecution(e.to_string()))?;
        let mut client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| Text2SqlError::SqlExecution(format!("Login failed: {e}")))?;

        let mut stream = client
            .simple_query(sql)
            .await
            .map_err(|e| Text2SqlError::SqlExecution(e.to_string()))?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut truncated = false;

        while let Some(item) = stream
            .try_next()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(e.to_string()))?
        {
            match item {
                QueryItem::Metadata(meta) => {
                    if columns.is_empty() {
                        columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                }
                QueryItem::Row(row) => {
                    if rows.len() == limit {
                        truncated = true;
                        break;
                    }
                    rows.push(row.into_iter().map(decode_value).collect());
                }
            }
        }

        Ok(QueryResult {
            columns,
            rows,
            truncated,
        })
    }
}

fn decode_value(data: ColumnData<'static>) -> serde_json::Value {
    match data {
        ColumnData::U8(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::I16(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::I32(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::I64(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::F32(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::F64(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::Bit(v) => v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        ColumnData::String(v) => v
            .map(|s| serde_json::Value::from(s.into_owned()))
            .unwrap_or(serde_json::Value::Null),
        ColumnData::Guid(v) => v
            .map(|g| serde_json::Value::from(g.to_string()))
            .unwrap_or(serde_json::Value::Null),
        ColumnData::Numeric(v) => v
            .map(|n| {
                let value =
                    n.int_part() as f64 + (n.dec_part() as f64) / 10f64.powi(n.scale() as i32);
                serde_json::Value::from(value)
            })
            .unwrap_or(serde_json::Value::Null),
        ColumnData::Binary(v) => v
            .map(|b| serde_json::Value::from(hex_string(&b)))
            .unwrap_or(serde_json::Value::Null),
        data @ ColumnData::Date(_) => from_sql_string::<NaiveDate>(&data),
        data @ ColumnData::Time(_) => from_sql_string::<NaiveTime>(&data),
        data @ (ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_)) => {
            from_sql_string::<NaiveDateTime>(&data)
        }
        data @ ColumnData::DateTimeOffset(_) => from_sql_string::<DateTime<Utc>>(&data),
        _ => serde_json::Value::Null,
    }
}

fn from_sql_string<'a, T>(data: &'a ColumnData<'static>) -> serde_json::Value
where
    T: FromSql<'a> + ToString,
{
    match T::from_sql(data) {
        Ok(Some(value)) => serde_json::Value::from(value.to_string()),
        _ => serde_json::Value::Null,
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalar_column_data() {
        assert_eq!(decode_value(ColumnData::I32(Some(42))), serde_json::json!(42));
        assert_eq!(decode_value(ColumnData::Bit(Some(true))), serde_json::json!(true));
        assert_eq!(decode_value(ColumnData::I64(None)), serde_json::Value::Null);
        assert_eq!(
            decode_value(ColumnData::String(Some("GB".into()))),
            serde_json::json!("GB")
        );
    }

    #[test]
    fn binary_decodes_to_hex() {
        assert_eq!(
            decode_value(ColumnData::Binary(Some(vec![0xde, 0xad].into()))),
            serde_json::json!("dead")
        );
    }
}
