//! End-to-end runs through the orchestrator with scripted LLM agents and
//! a real SQLite backend. The deterministic agents (cache check,
//! correction) run for real.

use async_trait::async_trait;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::payloads::{OutboundPayload, PayloadBody, UserMessagePayload};
use sql_agent_common::{
    AgentName, DatabaseEngine, Message, QueryResult, Result, Text2SqlConfig, ThreadId,
};
use sql_agent_connectors::sqlite::SqliteConnector;
use sql_agent_connectors::SqlConnector;
use sql_agent_orchestrator::agents::correction::CorrectionAgent;
use sql_agent_orchestrator::agents::rewrite::RewriteOutput;
use sql_agent_orchestrator::agents::{agent_message, AgentContext, AgentSet, CacheCheckAgent, SqlAgent};
use sql_agent_orchestrator::{Orchestrator, ToolRegistry};
use sql_agent_retrieval::{CacheEntry, ColumnValueStore, QueryCache, SchemaStore};
use sql_agent_storage::{HashEmbedder, InMemorySearchIndex, InMemoryStateStore, StateStore};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// --- scripted agents ------------------------------------------------------

struct ScriptedRewrite {
    output: RewriteOutput,
}

#[async_trait]
impl SqlAgent for ScriptedRewrite {
    fn name(&self) -> AgentName {
        AgentName::QueryRewrite
    }

    async fn run(&self, _context: &AgentContext) -> Result<Message> {
        agent_message(self.name(), &self.output, None)
    }
}

struct ScriptedSchemaSelection {
    ambiguity_detected: bool,
}

#[async_trait]
impl SqlAgent for ScriptedSchemaSelection {
    fn name(&self) -> AgentName {
        AgentName::SchemaSelection
    }

    async fn run(&self, _context: &AgentContext) -> Result<Message> {
        agent_message(
            self.name(),
            &serde_json::json!({
                "schema_options": [],
                "column_values": [],
                "ambiguity_detected": self.ambiguity_detected,
            }),
            None,
        )
    }
}

/// Emits SQL per sub-question text; resolved clarifications use the
/// fallback entry.
struct ScriptedGeneration {
    sql_by_question: HashMap<String, String>,
}

#[async_trait]
impl SqlAgent for ScriptedGeneration {
    fn name(&self) -> AgentName {
        AgentName::Generation
    }

    async fn run(&self, context: &AgentContext) -> Result<Message> {
        match self.sql_by_question.get(&context.question) {
            Some(sql) => agent_message(self.name(), &serde_json::json!({ "sql": sql }), None),
            None => agent_message(
                self.name(),
                &serde_json::json!({ "sql": null, "error": "no script for question" }),
                None,
            ),
        }
    }
}

/// Asks one clarification question on the first pass. Resumption never
/// re-invokes this agent, so no second-pass behavior is needed.
struct ScriptedDisambiguation;

#[async_trait]
impl SqlAgent for ScriptedDisambiguation {
    fn name(&self) -> AgentName {
        AgentName::Disambiguation
    }

    async fn run(&self, _context: &AgentContext) -> Result<Message> {
        agent_message(
            self.name(),
            &serde_json::json!({
                "requests": [{
                    "question": "Which region column should be used?",
                    "matching_columns": ["Address.CountryRegion", "SalesTerritory.Name"],
                    "matching_filter_values": [],
                    "other_user_choices": []
                }],
                "filter_mapping": {},
                "aggregation_mapping": {}
            }),
            None,
        )
    }
}

struct ScriptedAnswer;

#[async_trait]
impl SqlAgent for ScriptedAnswer {
    fn name(&self) -> AgentName {
        AgentName::Answer
    }

    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let sources: Vec<sql_agent_common::payloads::Source> = context
            .prior_sources
            .iter()
            .map(|s| match &s.error {
                Some(error) => sql_agent_common::payloads::Source::from_error(s.sql.clone(), error.clone()),
                None => sql_agent_common::payloads::Source::from_rows(s.sql.clone(), s.rows.clone()),
            })
            .collect();
        agent_message(
            self.name(),
            &serde_json::json!({
                "answer": format!("Answered from {} queries.", sources.iter().filter(|s| s.error.is_none()).count()),
                "sources": sources,
            }),
            None,
        )
    }
}

// --- fixtures -------------------------------------------------------------

/// Counts executions so tests can assert pre-run happened exactly once.
struct CountingConnector {
    inner: SqliteConnector,
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl SqlConnector for CountingConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Sqlite
    }

    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(sql, row_limit).await
    }
}

async fn sqlite_connector() -> SqliteConnector {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, order_date TEXT, total REAL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE employees (id INTEGER PRIMARY KEY, department TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    for (date, total) in [("2008-02-01", 10.0), ("2008-07-04", 20.0), ("2009-01-01", 30.0)] {
        sqlx::query("INSERT INTO orders (order_date, total) VALUES (?, ?)")
            .bind(date)
            .bind(total)
            .execute(&pool)
            .await
            .unwrap();
    }
    for department in ["marketing", "marketing", "engineering"] {
        sqlx::query("INSERT INTO employees (department) VALUES (?)")
            .bind(department)
            .execute(&pool)
            .await
            .unwrap();
    }
    SqliteConnector::from_pool(pool)
}

struct Fixture {
    orchestrator: Orchestrator,
    state_store: Arc<InMemoryStateStore>,
    executions: Arc<AtomicUsize>,
}

async fn fixture(
    config: Text2SqlConfig,
    extra_agents: Vec<Arc<dyn SqlAgent>>,
    cache: Option<Arc<QueryCache>>,
) -> Fixture {
    let config = Arc::new(config);
    let embedder = Arc::new(HashEmbedder::new(256));
    let schema_store = Arc::new(SchemaStore::new(
        Arc::new(InMemorySearchIndex::new(embedder.clone())),
        DatabaseEngine::Sqlite,
    ));
    let column_values = Arc::new(ColumnValueStore::new(Arc::new(InMemorySearchIndex::new(
        embedder,
    ))));

    let executions = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(CountingConnector {
        inner: sqlite_connector().await,
        executions: executions.clone(),
    });

    let tools = Arc::new(ToolRegistry::new(
        &config,
        schema_store,
        Some(column_values),
        cache,
        connector,
    ));

    // The dead client is never reached on the happy paths under test.
    let llm = Arc::new(LlmClient::new(&config.llm));
    let mut agents = AgentSet::new()
        .insert(Arc::new(CacheCheckAgent::new()))
        .insert(Arc::new(CorrectionAgent::new(llm)));
    for agent in extra_agents {
        agents = agents.insert(agent);
    }

    let state_store = Arc::new(InMemoryStateStore::new());
    let orchestrator = Orchestrator::new(agents, config, tools, state_store.clone());
    Fixture {
        orchestrator,
        state_store,
        executions,
    }
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<OutboundPayload>) -> Vec<OutboundPayload> {
    let mut payloads = Vec::new();
    while let Some(payload) = rx.recv().await {
        payloads.push(payload);
    }
    payloads
}

fn terminal(payloads: &[OutboundPayload]) -> &PayloadBody {
    &payloads.last().expect("stream must not be empty").body
}

fn single_round(questions: &[&str]) -> RewriteOutput {
    RewriteOutput {
        decomposed_user_messages: vec![questions.iter().map(|q| q.to_string()).collect()],
        combination_logic: "independent results, list both".into(),
        all_non_database_query: false,
        natural_language_response: None,
    }
}

// --- scenarios ------------------------------------------------------------

#[tokio::test]
async fn parallel_decomposition_produces_one_source_per_sub_question() {
    let q1 = "What is the total revenue for 2008?";
    let q2 = "How many employees are in marketing?";
    let sql1 = "SELECT SUM(total) AS revenue FROM orders WHERE order_date LIKE '2008%'";
    let sql2 = "SELECT COUNT(*) AS c FROM employees WHERE department = 'marketing'";

    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[q1, q2]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: false,
            }),
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::from([
                    (q1.to_string(), sql1.to_string()),
                    (q2.to_string(), sql2.to_string()),
                ]),
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("parallel".into()),
        UserMessagePayload::new(format!("{q1} {q2}")),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::AnswerWithSources { answer, sources, .. } => {
            assert_eq!(sources.len(), 2);
            // Sources arrive in round+index order.
            assert_eq!(sources[0].sql_query, sql1);
            assert_eq!(sources[1].sql_query, sql2);
            assert_eq!(sources[0].sql_rows.rows[0][0], serde_json::json!(30.0));
            assert_eq!(sources[1].sql_rows.rows[0][0], serde_json::json!(2));
            assert!(answer.contains("2"));
        }
        other => panic!("expected an answer, got {other:?}"),
    }
    assert_eq!(fixture.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_database_questions_short_circuit_without_sql() {
    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: RewriteOutput {
                    decomposed_user_messages: vec![],
                    combination_logic: String::new(),
                    all_non_database_query: true,
                    natural_language_response: Some("Hello! Ask me about your sales data.".into()),
                },
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("greeting".into()),
        UserMessagePayload::new("hi there"),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::AnswerWithSources { answer, sources, .. } => {
            assert!(answer.contains("Hello"));
            assert!(sources.is_empty());
        }
        other => panic!("expected a short-circuit answer, got {other:?}"),
    }
    assert_eq!(fixture.executions.load(Ordering::SeqCst), 0, "no SQL may run");
}

#[tokio::test]
async fn cache_hit_with_pre_run_executes_exactly_once() {
    let question = "How many orders did we have in 2008?";
    let cached_sql = "SELECT COUNT(*) AS c FROM orders WHERE order_date LIKE '2008%'";

    let cache = Arc::new(QueryCache::new(
        Arc::new(InMemorySearchIndex::new(Arc::new(HashEmbedder::new(256)))),
        0.8,
        Default::default(),
    ));
    cache
        .write(CacheEntry::new(question, cached_sql, vec![]))
        .await
        .unwrap();

    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: true,
            pre_run_query_cache: true,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[question]),
            }),
            Arc::new(ScriptedAnswer),
        ],
        Some(cache),
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("cached".into()),
        UserMessagePayload::new(question),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::AnswerWithSources { sources, .. } => {
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].sql_query, cached_sql);
            assert_eq!(sources[0].sql_rows.rows[0][0], serde_json::json!(2));
        }
        other => panic!("expected an answer, got {other:?}"),
    }
    // The cache agent's hydration is the only execution; correction
    // reuses the fresh rows.
    assert_eq!(fixture.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disambiguation_suspends_and_resumes_on_reply() {
    let question = "Show me sales by region";
    let resolved_sql = "SELECT order_date, total FROM orders LIMIT 5";

    let build_agents = || -> Vec<Arc<dyn SqlAgent>> {
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[question]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: true,
            }),
            Arc::new(ScriptedDisambiguation),
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::from([(question.to_string(), resolved_sql.to_string())]),
            }),
            Arc::new(ScriptedAnswer),
        ]
    };

    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        build_agents(),
        None,
    )
    .await;
    let thread_id = ThreadId::from_string("ambiguous".into());

    let rx = fixture
        .orchestrator
        .process_user_message(thread_id.clone(), UserMessagePayload::new(question));
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::Disambiguation { requests } => {
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].matching_columns.len(), 2);
        }
        other => panic!("expected disambiguation, got {other:?}"),
    }
    assert!(
        fixture.state_store.get(&thread_id).is_some(),
        "suspended run must be persisted"
    );

    // The caller answers on the same thread; the run resumes at
    // generation without re-rewriting.
    let rx = fixture.orchestrator.process_user_message(
        thread_id.clone(),
        UserMessagePayload::new("Address.CountryRegion"),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::AnswerWithSources { sources, .. } => {
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].sql_query, resolved_sql);
            assert!(!sources[0].sql_rows.rows.is_empty());
        }
        other => panic!("expected an answer after resumption, got {other:?}"),
    }
    assert!(
        fixture.state_store.get(&thread_id).is_none(),
        "state must be cleared after completion"
    );
}

#[tokio::test]
async fn sole_sub_question_failure_fails_the_run() {
    let question = "impossible question";

    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[question]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: false,
            }),
            // No script for this question: generation keeps reporting an
            // error until the message cap terminates the sub-run.
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::new(),
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("failing".into()),
        UserMessagePayload::new(question),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::Error { code, .. } => {
            assert_eq!(code, "sql_execution_error");
        }
        other => panic!("expected an error payload, got {other:?}"),
    }
}

#[tokio::test]
async fn partial_failure_is_annotated_when_other_sub_questions_succeed() {
    let good = "How many orders are there?";
    let bad = "unanswerable";
    let good_sql = "SELECT COUNT(*) AS c FROM orders";

    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[good, bad]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: false,
            }),
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::from([(good.to_string(), good_sql.to_string())]),
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("partial".into()),
        UserMessagePayload::new(format!("{good} and {bad}")),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::AnswerWithSources { sources, .. } => {
            assert_eq!(sources.len(), 2);
            let succeeded: Vec<_> = sources.iter().filter(|s| s.error.is_none()).collect();
            let failed: Vec<_> = sources.iter().filter(|s| s.error.is_some()).collect();
            assert_eq!(succeeded.len(), 1);
            assert_eq!(succeeded[0].sql_query, good_sql);
            assert_eq!(failed.len(), 1);
        }
        other => panic!("expected a partial answer, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![Arc::new(ScriptedAnswer)],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("empty".into()),
        UserMessagePayload::new("   "),
    );
    let payloads = collect(rx).await;

    match terminal(&payloads) {
        PayloadBody::Error { code, .. } => assert_eq!(code, "input_rejected"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn thoughts_stream_when_enabled() {
    let question = "How many orders are there?";
    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            emit_thoughts: true,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[question]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: false,
            }),
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::from([(
                    question.to_string(),
                    "SELECT COUNT(*) AS c FROM orders".to_string(),
                )]),
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("thoughts".into()),
        UserMessagePayload::new(question),
    );
    let payloads = collect(rx).await;

    let thought_agents: Vec<_> = payloads
        .iter()
        .filter_map(|p| match &p.body {
            PayloadBody::Thought { agent, .. } => Some(*agent),
            _ => None,
        })
        .collect();
    assert!(thought_agents.contains(&AgentName::Generation));
    assert!(thought_agents.contains(&AgentName::Correction));
    assert!(terminal(&payloads).is_terminal());
}

#[tokio::test]
async fn progress_updates_precede_the_terminal_payload() {
    let question = "How many orders are there?";
    let fixture = fixture(
        Text2SqlConfig {
            use_query_cache: false,
            target_engine: DatabaseEngine::Sqlite,
            ..Default::default()
        },
        vec![
            Arc::new(ScriptedRewrite {
                output: single_round(&[question]),
            }),
            Arc::new(ScriptedSchemaSelection {
                ambiguity_detected: false,
            }),
            Arc::new(ScriptedGeneration {
                sql_by_question: HashMap::from([(
                    question.to_string(),
                    "SELECT COUNT(*) AS c FROM orders".to_string(),
                )]),
            }),
            Arc::new(ScriptedAnswer),
        ],
        None,
    )
    .await;

    let rx = fixture.orchestrator.process_user_message(
        ThreadId::from_string("progress".into()),
        UserMessagePayload::new(question),
    );
    let payloads = collect(rx).await;

    assert!(payloads.len() >= 2);
    assert!(payloads[..payloads.len() - 1]
        .iter()
        .all(|p| matches!(p.body, PayloadBody::ProcessingUpdate { .. })));
    assert!(terminal(&payloads).is_terminal());
}
