//! Agent prompt loading.
//!
//! Prompts are YAML documents embedded in the crate, each with a
//! `system_message` carrying Jinja placeholders. The render environment
//! has no loader and no callbacks; only the placeholder context below is
//! in scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sql_agent_common::{Result, Text2SqlConfig, Text2SqlError};
use sql_agent_connectors::default_engine_rules;

use crate::tools::ToolRegistry;

#[derive(Debug, Deserialize)]
pub struct PromptTemplate {
    pub system_message: String,
}

/// Placeholder values available to every prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub use_case: String,
    pub target_engine: String,
    pub engine_specific_rules: String,
    pub row_limit: usize,
    pub current_datetime: String,
}

impl PromptContext {
    pub fn from_config(config: &Text2SqlConfig, run_started: DateTime<Utc>) -> Self {
        let engine_specific_rules = if config.engine_specific_rules.is_empty() {
            default_engine_rules(config.target_engine).to_string()
        } else {
            config.engine_specific_rules.clone()
        };
        Self {
            use_case: config.use_case.clone(),
            target_engine: config.target_engine.to_string(),
            engine_specific_rules,
            row_limit: config.row_limit,
            current_datetime: ToolRegistry::current_datetime(run_started),
        }
    }
}

/// Load an embedded prompt document by name.
pub fn load(name: &str) -> Result<PromptTemplate> {
    let raw = match name {
        "query_rewrite_agent" => include_str!("prompts/query_rewrite_agent.yaml"),
        "schema_selection_agent" => include_str!("prompts/schema_selection_agent.yaml"),
        "disambiguation_agent" => include_str!("prompts/disambiguation_agent.yaml"),
        "sql_generation_agent" => include_str!("prompts/sql_generation_agent.yaml"),
        "sql_correction_agent" => include_str!("prompts/sql_correction_agent.yaml"),
        "answer_agent" => include_str!("prompts/answer_agent.yaml"),
        "follow_up_suggestions_agent" => include_str!("prompts/follow_up_suggestions_agent.yaml"),
        other => {
            return Err(Text2SqlError::Config(format!("Unknown prompt: {other}")));
        }
    };
    serde_yaml::from_str(raw).map_err(|e| Text2SqlError::Config(format!("Malformed prompt {name}: {e}")))
}

/// Render a prompt's system message with the placeholder context.
pub fn render(name: &str, context: &PromptContext) -> Result<String> {
    let template = load(name)?;
    let env = minijinja::Environment::new();
    env.render_str(&template.system_message, context)
        .map_err(|e| Text2SqlError::Config(format!("Prompt {name} failed to render: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sql_agent_common::DatabaseEngine;

    fn context() -> PromptContext {
        let config = Text2SqlConfig {
            target_engine: DatabaseEngine::Tsql,
            use_case: "the AdventureWorks sales database".into(),
            ..Default::default()
        };
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        PromptContext::from_config(&config, instant)
    }

    #[test]
    fn all_prompts_load_and_render() {
        for name in [
            "query_rewrite_agent",
            "schema_selection_agent",
            "disambiguation_agent",
            "sql_generation_agent",
            "sql_correction_agent",
            "answer_agent",
            "follow_up_suggestions_agent",
        ] {
            let rendered = render(name, &context()).unwrap();
            assert!(!rendered.is_empty(), "{name} rendered empty");
            assert!(!rendered.contains("{{"), "{name} has unrendered placeholders");
        }
    }

    #[test]
    fn rewrite_prompt_pins_the_current_datetime() {
        let rendered = render("query_rewrite_agent", &context()).unwrap();
        assert!(rendered.contains("2024-06-01T09:00:00Z"));
    }

    #[test]
    fn generation_prompt_carries_engine_rules_and_row_limit() {
        let rendered = render("sql_generation_agent", &context()).unwrap();
        assert!(rendered.contains("TSQL"));
        assert!(rendered.contains("TOP"));
        assert!(rendered.contains("100"));
    }

    #[test]
    fn unknown_prompt_is_a_config_error() {
        assert!(load("nonexistent_agent").is_err());
    }
}
