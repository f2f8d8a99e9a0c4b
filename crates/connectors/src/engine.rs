//! Per-engine prompt rules injected into generation and correction.

use sql_agent_common::DatabaseEngine;

/// Baseline dialect rules used when the deployment does not supply its
/// own `engine_specific_rules` fragment.
pub fn default_engine_rules(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::Tsql => {
            "Use TOP n for row limiting, never LIMIT. \
             Use YEAR()/MONTH()/DAY() for date parts and DATEADD/DATEDIFF for arithmetic. \
             String concatenation uses + and the wildcard for LIKE is %. \
             Quote identifiers with square brackets when needed."
        }
        DatabaseEngine::Postgres => {
            "Use LIMIT n for row limiting. \
             Use EXTRACT(YEAR FROM col) or date_trunc for date parts. \
             Use ILIKE for case-insensitive matching and || for string concatenation. \
             Quote identifiers with double quotes when needed."
        }
        DatabaseEngine::Snowflake => {
            "Use LIMIT n for row limiting. \
             Use YEAR()/MONTH() or DATE_TRUNC for date parts. \
             Use ILIKE for case-insensitive matching and || for string concatenation. \
             Unquoted identifiers fold to upper case."
        }
        DatabaseEngine::Databricks => {
            "Use LIMIT n for row limiting. \
             Use year()/month() or date_trunc for date parts. \
             String comparison is case sensitive; wrap with lower() for \
             case-insensitive matching. Identifiers use backticks."
        }
        DatabaseEngine::Sqlite => {
            "Use LIMIT n for row limiting. \
             Use strftime('%Y', col) for date parts; there is no YEAR() function. \
             LIKE is case-insensitive for ASCII by default and || concatenates strings."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsql_rules_mention_top() {
        assert!(default_engine_rules(DatabaseEngine::Tsql).contains("TOP"));
        assert!(!default_engine_rules(DatabaseEngine::Tsql).contains("LIMIT n"));
    }

    #[test]
    fn every_engine_has_rules() {
        use strum::IntoEnumIterator;
        for engine in DatabaseEngine::iter() {
            assert!(!default_engine_rules(engine).is_empty());
        }
    }
}
