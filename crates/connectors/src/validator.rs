//! Dialect-aware validation: every statement the pipeline emits must be a
//! single read-only SELECT under the target dialect.

use sql_agent_common::DatabaseEngine;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{
    DatabricksDialect, Dialect, MsSqlDialect, PostgreSqlDialect, SQLiteDialect, SnowflakeDialect,
};
use sqlparser::parser::Parser;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            ok: true,
            errors: vec![],
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            errors: vec![message.into()],
        }
    }
}

fn dialect_for(engine: DatabaseEngine) -> Box<dyn Dialect> {
    match engine {
        DatabaseEngine::Tsql => Box::new(MsSqlDialect {}),
        DatabaseEngine::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseEngine::Snowflake => Box::new(SnowflakeDialect {}),
        DatabaseEngine::Databricks => Box::new(DatabricksDialect {}),
        DatabaseEngine::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Parse `sql` under the engine's dialect and check it is exactly one
/// read-only SELECT. Returns parse errors verbatim so agents can
/// self-correct.
pub fn validate_select(sql: &str, engine: DatabaseEngine) -> ValidationOutcome {
    let dialect = dialect_for(engine);
    let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "SQL failed to parse");
            return ValidationOutcome::fail(e.to_string());
        }
    };

    match statements.as_slice() {
        [] => ValidationOutcome::fail("No SQL statement found"),
        [statement] => check_statement(statement),
        _ => ValidationOutcome::fail(format!(
            "Expected a single statement, found {}",
            statements.len()
        )),
    }
}

fn check_statement(statement: &Statement) -> ValidationOutcome {
    match statement {
        Statement::Query(query) => check_set_expr(&query.body),
        other => ValidationOutcome::fail(format!(
            "Only SELECT statements are allowed, found: {}",
            statement_kind(other)
        )),
    }
}

fn check_set_expr(body: &SetExpr) -> ValidationOutcome {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return ValidationOutcome::fail("SELECT INTO is not allowed");
            }
            ValidationOutcome::ok()
        }
        SetExpr::Query(inner) => check_set_expr(&inner.body),
        SetExpr::SetOperation { left, right, .. } => {
            let left_outcome = check_set_expr(left);
            if !left_outcome.ok {
                return left_outcome;
            }
            check_set_expr(right)
        }
        other => ValidationOutcome::fail(format!("Unsupported query body: {other}")),
    }
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_select_is_valid_everywhere() {
        for engine in [
            DatabaseEngine::Tsql,
            DatabaseEngine::Postgres,
            DatabaseEngine::Snowflake,
            DatabaseEngine::Databricks,
            DatabaseEngine::Sqlite,
        ] {
            let outcome = validate_select("SELECT 1 AS one", engine);
            assert!(outcome.ok, "engine {engine}: {:?}", outcome.errors);
        }
    }

    #[test]
    fn tsql_top_parses_under_mssql_dialect() {
        let outcome = validate_select(
            "SELECT TOP 10 CountryRegion, SUM(TotalDue) AS total FROM SalesLT.SalesOrderHeader GROUP BY CountryRegion",
            DatabaseEngine::Tsql,
        );
        assert!(outcome.ok, "{:?}", outcome.errors);
    }

    #[test]
    fn write_verbs_are_rejected() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET a = 1",
            "DELETE FROM t",
            "DROP TABLE t",
            "CREATE TABLE t (a INT)",
        ] {
            let outcome = validate_select(sql, DatabaseEngine::Postgres);
            assert!(!outcome.ok, "expected rejection for {sql}");
        }
    }

    #[test]
    fn multiple_statements_are_rejected() {
        let outcome = validate_select("SELECT 1; SELECT 2", DatabaseEngine::Sqlite);
        assert!(!outcome.ok);
        assert!(outcome.errors[0].contains("single statement"));
    }

    #[test]
    fn select_into_is_rejected() {
        let outcome = validate_select("SELECT a INTO new_table FROM t", DatabaseEngine::Tsql);
        assert!(!outcome.ok);
    }

    #[test]
    fn unions_of_selects_are_valid() {
        let outcome = validate_select("SELECT a FROM t UNION ALL SELECT a FROM u", DatabaseEngine::Postgres);
        assert!(outcome.ok, "{:?}", outcome.errors);
    }

    #[test]
    fn parse_errors_are_reported() {
        let outcome = validate_select("SELEC a FROM t", DatabaseEngine::Postgres);
        assert!(!outcome.ok);
        assert!(!outcome.errors.is_empty());
    }

    #[test]
    fn ctes_are_valid() {
        let outcome = validate_select(
            "WITH totals AS (SELECT CountryRegion, SUM(TotalDue) AS t FROM SalesLT.SalesOrderHeader GROUP BY CountryRegion) SELECT * FROM totals ORDER BY t DESC LIMIT 1",
            DatabaseEngine::Postgres,
        );
        assert!(outcome.ok, "{:?}", outcome.errors);
    }
}
