//! The outer run loop: decomposition, parallel sub-question execution,
//! suspension on disambiguation, final answer assembly.

use crate::agents::{answer::AnswerOutput, rewrite::RewriteOutput, AgentContext, AgentSet, AnsweredSource};
use crate::run::{invoke_agent, InnerRun, SubRunOutcome};
use crate::state::{PendingSubQuestion, SuspendedRun};
use crate::tools::ToolRegistry;
use chrono::{DateTime, Utc};
use sql_agent_common::payloads::{OutboundPayload, PayloadBody, UserMessagePayload};
use sql_agent_common::{
    AgentName, Result, Run, SubQuestion, SubQuestionStatus, Text2SqlConfig, Text2SqlError, ThreadId, Turn,
};
use sql_agent_retrieval::{CacheEntry, EntitySchema};
use sql_agent_storage::StateStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, instrument, warn};

/// Buffered payloads per run before the producer awaits the consumer.
const STREAM_BUFFER: usize = 32;

/// A pending cache write: (question, sql, schemas used).
type CacheWrite = (String, String, Vec<EntitySchema>);

#[derive(Clone)]
pub struct Orchestrator {
    agents: AgentSet,
    config: Arc<Text2SqlConfig>,
    tools: Arc<ToolRegistry>,
    state_store: Arc<dyn StateStore>,
}

impl Orchestrator {
    pub fn new(
        agents: AgentSet,
        config: Arc<Text2SqlConfig>,
        tools: Arc<ToolRegistry>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            agents,
            config,
            tools,
            state_store,
        }
    }

    /// Process one user message. The returned channel yields progress
    /// payloads and ends with exactly one terminal payload.
    pub fn process_user_message(
        &self,
        thread_id: ThreadId,
        payload: UserMessagePayload,
    ) -> mpsc::Receiver<OutboundPayload> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_message(thread_id, payload, tx).await;
        });
        rx
    }

    #[instrument(skip_all, fields(thread_id = %thread_id))]
    async fn run_message(
        &self,
        thread_id: ThreadId,
        payload: UserMessagePayload,
        tx: mpsc::Sender<OutboundPayload>,
    ) {
        let cancel = Arc::new(AtomicBool::new(false));
        let timeout = Duration::from_secs(self.config.run_timeout_seconds);

        let outcome = tokio::time::timeout(
            timeout,
            self.drive(thread_id.clone(), payload, &tx, cancel.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Run failed");
                self.emit_error(&tx, &thread_id, &e, None).await;
            }
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                let e = Text2SqlError::RunTimeout(self.config.run_timeout_seconds);
                self.emit_error(&tx, &thread_id, &e, None).await;
            }
        }
    }

    async fn drive(
        &self,
        thread_id: ThreadId,
        payload: UserMessagePayload,
        tx: &mpsc::Sender<OutboundPayload>,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let run_started = Utc::now();
        let payload = payload.with_default_parameters(run_started);

        if payload.user_message.trim().is_empty() {
            return Err(Text2SqlError::InputRejected("user_message is empty".into()));
        }

        if let Some(persisted) = self.state_store.get(&thread_id) {
            match SuspendedRun::from_value(persisted.state.clone()) {
                Ok(suspended) => {
                    return self
                        .resume(thread_id, suspended, payload, run_started, tx, cancel)
                        .await;
                }
                Err(e) => {
                    // Unreadable snapshots restart the run rather than
                    // mis-route it.
                    warn!(error = %e, "Discarding unreadable run snapshot");
                    self.state_store.clear(&thread_id);
                }
            }
        }

        self.fresh(thread_id, payload, run_started, tx, cancel).await
    }

    async fn fresh(
        &self,
        thread_id: ThreadId,
        payload: UserMessagePayload,
        run_started: DateTime<Utc>,
        tx: &mpsc::Sender<OutboundPayload>,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut run = Run::new(thread_id.clone(), &payload.user_message);
        self.emit(tx, &thread_id, PayloadBody::ProcessingUpdate {
            title: "Processing...".into(),
            message: "Understanding your question".into(),
        })
        .await;

        let rewrite_agent = self
            .agents
            .get(AgentName::QueryRewrite)
            .ok_or_else(|| Text2SqlError::Config("No query rewrite agent registered".into()))?;
        let context = AgentContext::new(self.config.clone(), self.tools.clone(), &payload.user_message)
            .with_run_started(run_started)
            .with_chat_history(payload.chat_history.clone())
            .with_injected_parameters(payload.injected_parameters.clone());
        let message = invoke_agent(&rewrite_agent, &context).await?;
        let rewrite: RewriteOutput = serde_json::from_str(&message.content)
            .map_err(|e| Text2SqlError::Llm(format!("Malformed rewrite output: {e}")))?;
        run.thread.push(message);
        run.combination_logic = Some(rewrite.combination_logic.clone());
        run.rewritten_message = Some(
            rewrite
                .decomposed_user_messages
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" ; "),
        );

        // No database work at all: answer from the rewriter and stop.
        if rewrite.is_short_circuit() {
            info!("Short-circuiting: no database queries required");
            let answer = rewrite.natural_language_response.unwrap_or_else(|| {
                "I can only help with questions about the connected data.".to_string()
            });
            self.emit(tx, &thread_id, PayloadBody::AnswerWithSources {
                answer,
                sources: vec![],
                follow_up_suggestions: None,
            })
            .await;
            self.state_store.clear(&thread_id);
            return Ok(());
        }

        for (round_index, round) in rewrite.decomposed_user_messages.iter().enumerate() {
            run.decomposition_rounds.push(
                round
                    .iter()
                    .map(|question| SubQuestion::new(question, round_index, run.run_id))
                    .collect(),
            );
        }

        self.execute_rounds(run, 0, vec![], vec![], payload, run_started, tx, cancel)
            .await
    }

    async fn resume(
        &self,
        thread_id: ThreadId,
        suspended: SuspendedRun,
        payload: UserMessagePayload,
        run_started: DateTime<Utc>,
        tx: &mpsc::Sender<OutboundPayload>,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        info!(pending = suspended.pending.len(), "Resuming suspended run");
        self.emit(tx, &thread_id, PayloadBody::ProcessingUpdate {
            title: "Processing...".into(),
            message: "Resuming with your clarification".into(),
        })
        .await;

        let SuspendedRun {
            mut run,
            current_round,
            mut completed_sources,
            pending,
        } = suspended;
        let mut cache_writes: Vec<CacheWrite> = Vec::new();

        // The reply is not re-rewritten; each parked sub-run resumes at
        // generation with the caller's answer folded in.
        let items: Vec<(usize, String, Option<Vec<sql_agent_common::Message>>)> = pending
            .iter()
            .map(|p| {
                let mut thread = p.thread.clone();
                thread.push(InnerRun::clarification_reply(&payload.user_message));
                (p.index_in_round, p.question.clone(), Some(thread))
            })
            .collect();

        let outcomes = self
            .run_sub_questions(
                &thread_id,
                items,
                &payload,
                run_started,
                &completed_sources,
                cancel.clone(),
                tx,
            )
            .await;

        let round_size = run
            .decomposition_rounds
            .get(current_round)
            .map(|round| round.len())
            .unwrap_or(1);
        match self.fold_outcomes(
            &mut run,
            current_round,
            round_size,
            outcomes,
            &mut completed_sources,
            &mut cache_writes,
        ) {
            RoundVerdict::Suspend(pending) => {
                return self
                    .suspend(thread_id, run, current_round, completed_sources, pending, tx)
                    .await;
            }
            RoundVerdict::Abort(error) => {
                self.state_store.clear(&thread_id);
                let details = serde_json::to_value(&completed_sources).ok();
                self.emit_error(tx, &thread_id, &Text2SqlError::SqlExecution(error), details)
                    .await;
                return Ok(());
            }
            RoundVerdict::Continue => {}
        }

        self.execute_rounds(
            run,
            current_round + 1,
            completed_sources,
            cache_writes,
            payload,
            run_started,
            tx,
            cancel,
        )
        .await
    }

    /// Rounds run sequentially; sub-questions within a round run in
    /// parallel under the configured semaphore.
    #[allow(clippy::too_many_arguments)]
    async fn execute_rounds(
        &self,
        mut run: Run,
        start_round: usize,
        mut completed_sources: Vec<AnsweredSource>,
        mut cache_writes: Vec<CacheWrite>,
        payload: UserMessagePayload,
        run_started: DateTime<Utc>,
        tx: &mpsc::Sender<OutboundPayload>,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let thread_id = run.thread_id.clone();

        for round_index in start_round..run.decomposition_rounds.len() {
            let items: Vec<(usize, String, Option<Vec<sql_agent_common::Message>>)> = run
                .decomposition_rounds[round_index]
                .iter()
                .enumerate()
                .filter(|(_, sub)| sub.status == SubQuestionStatus::Pending)
                .map(|(index, sub)| (index, sub.text.clone(), None))
                .collect();
            if items.is_empty() {
                continue;
            }

            self.emit(tx, &thread_id, PayloadBody::ProcessingUpdate {
                title: "Processing...".into(),
                message: format!(
                    "Running {} database {} for round {}",
                    items.len(),
                    if items.len() == 1 { "query" } else { "queries" },
                    round_index + 1
                ),
            })
            .await;

            let round_size = run.decomposition_rounds[round_index].len();
            let outcomes = self
                .run_sub_questions(
                    &thread_id,
                    items,
                    &payload,
                    run_started,
                    &completed_sources,
                    cancel.clone(),
                    tx,
                )
                .await;

            match self.fold_outcomes(
                &mut run,
                round_index,
                round_size,
                outcomes,
                &mut completed_sources,
                &mut cache_writes,
            ) {
                RoundVerdict::Suspend(pending) => {
                    return self
                        .suspend(thread_id, run, round_index, completed_sources, pending, tx)
                        .await;
                }
                RoundVerdict::Abort(error) => {
                    // Remaining work is cancelled cooperatively.
                    cancel.store(true, Ordering::Relaxed);
                    self.state_store.clear(&thread_id);
                    let details = serde_json::to_value(&completed_sources).ok();
                    self.emit_error(tx, &thread_id, &Text2SqlError::SqlExecution(error), details)
                        .await;
                    return Ok(());
                }
                RoundVerdict::Continue => {}
            }
        }

        self.finish(run, completed_sources, cache_writes, run_started, tx).await
    }

    /// Spawn each sub-question as its own task and join them all.
    #[allow(clippy::too_many_arguments)]
    async fn run_sub_questions(
        &self,
        thread_id: &ThreadId,
        items: Vec<(usize, String, Option<Vec<sql_agent_common::Message>>)>,
        payload: &UserMessagePayload,
        run_started: DateTime<Utc>,
        completed_sources: &[AnsweredSource],
        cancel: Arc<AtomicBool>,
        tx: &mpsc::Sender<OutboundPayload>,
    ) -> Vec<(usize, String, SubRunOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_subquestions));
        let mut handles = Vec::with_capacity(items.len());

        // Diagnostic thoughts are forwarded onto the caller stream when
        // enabled.
        let (progress_tx, forwarder) = if self.config.emit_thoughts {
            let (progress_tx, mut progress_rx) = mpsc::channel::<PayloadBody>(STREAM_BUFFER);
            let tx = tx.clone();
            let thread_id = thread_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(body) = progress_rx.recv().await {
                    let _ = tx.send(OutboundPayload::new(thread_id.clone(), body)).await;
                }
            });
            (Some(progress_tx), Some(forwarder))
        } else {
            (None, None)
        };

        for (index, question, initial_thread) in items {
            let inner = InnerRun {
                agents: self.agents.clone(),
                config: self.config.clone(),
                tools: self.tools.clone(),
                cancel: cancel.clone(),
                progress: progress_tx.clone(),
            };
            let semaphore = semaphore.clone();
            let chat_history: Vec<Turn> = payload.chat_history.clone();
            let parameters: BTreeMap<String, Value> = payload.injected_parameters.clone();
            let prior_sources = completed_sources.to_vec();
            let task_question = question.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return SubRunOutcome::Failed {
                            error: "cancelled".into(),
                            thread: vec![],
                        }
                    }
                };
                inner
                    .solve(
                        &task_question,
                        run_started,
                        chat_history,
                        parameters,
                        prior_sources,
                        initial_thread,
                    )
                    .await
            });
            handles.push((index, question, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, question, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| SubRunOutcome::Failed {
                error: format!("Sub-question task failed: {e}"),
                thread: vec![],
            });
            outcomes.push((index, question, outcome));
        }

        drop(progress_tx);
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        outcomes
    }

    /// Record each outcome on the run and decide how the round ends.
    fn fold_outcomes(
        &self,
        run: &mut Run,
        round_index: usize,
        round_size: usize,
        outcomes: Vec<(usize, String, SubRunOutcome)>,
        completed_sources: &mut Vec<AnsweredSource>,
        cache_writes: &mut Vec<CacheWrite>,
    ) -> RoundVerdict {
        let mut pending: Vec<PendingSubQuestion> = Vec::new();
        let mut sole_failure: Option<String> = None;

        for (index, question, outcome) in outcomes {
            let sub = run
                .decomposition_rounds
                .get_mut(round_index)
                .and_then(|round| round.get_mut(index));

            match outcome {
                SubRunOutcome::Answered { sql, rows, schemas, .. } => {
                    if let Some(sub) = sub {
                        sub.status = SubQuestionStatus::Succeeded;
                        sub.resolved_sql = Some(sql.clone());
                        sub.resolved_rows = Some(rows.clone());
                    }
                    completed_sources.push(AnsweredSource {
                        question: question.clone(),
                        sql: sql.clone(),
                        rows,
                        error: None,
                    });
                    cache_writes.push((question, sql, schemas));
                }
                SubRunOutcome::ClarificationNeeded { requests, thread } => {
                    if let Some(sub) = sub {
                        sub.status = SubQuestionStatus::AwaitingClarification;
                    }
                    pending.push(PendingSubQuestion {
                        round_index,
                        index_in_round: index,
                        question,
                        thread,
                        requests,
                    });
                }
                SubRunOutcome::Failed { error, .. } => {
                    if let Some(sub) = sub {
                        sub.status = SubQuestionStatus::Failed;
                        sub.error = Some(error.clone());
                    }
                    if round_size == 1 {
                        sole_failure = Some(error.clone());
                    }
                    // Partial answers are allowed; failures ride along as
                    // annotated sources.
                    completed_sources.push(AnsweredSource {
                        question,
                        sql: String::new(),
                        rows: Default::default(),
                        error: Some(error),
                    });
                }
            }
        }

        if !pending.is_empty() {
            RoundVerdict::Suspend(pending)
        } else if let Some(error) = sole_failure {
            RoundVerdict::Abort(error)
        } else {
            RoundVerdict::Continue
        }
    }

    /// Persist the run and surface the aggregated clarification
    /// questions. The caller resumes on the same thread id.
    async fn suspend(
        &self,
        thread_id: ThreadId,
        run: Run,
        current_round: usize,
        completed_sources: Vec<AnsweredSource>,
        pending: Vec<PendingSubQuestion>,
        tx: &mpsc::Sender<OutboundPayload>,
    ) -> Result<()> {
        let requests = pending.iter().flat_map(|p| p.requests.clone()).collect();
        let snapshot = SuspendedRun {
            run,
            current_round,
            completed_sources,
            pending,
        };
        self.state_store
            .save(&thread_id, snapshot.to_value()?)
            .map_err(|e| Text2SqlError::StateStore(e.to_string()))?;

        info!("Run suspended awaiting clarification");
        self.emit(tx, &thread_id, PayloadBody::Disambiguation { requests }).await;
        Ok(())
    }

    /// Invoke the answer agent over every collected source and finish
    /// the run.
    async fn finish(
        &self,
        run: Run,
        completed_sources: Vec<AnsweredSource>,
        cache_writes: Vec<CacheWrite>,
        run_started: DateTime<Utc>,
        tx: &mpsc::Sender<OutboundPayload>,
    ) -> Result<()> {
        let thread_id = run.thread_id.clone();
        self.emit(tx, &thread_id, PayloadBody::ProcessingUpdate {
            title: "Processing...".into(),
            message: "Writing the final answer".into(),
        })
        .await;

        let answer_agent = self
            .agents
            .get(AgentName::Answer)
            .ok_or_else(|| Text2SqlError::Config("No answer agent registered".into()))?;
        let mut context = AgentContext::new(self.config.clone(), self.tools.clone(), &run.user_message)
            .with_run_started(run_started)
            .with_prior_sources(completed_sources);
        if let Some(combination_logic) = &run.combination_logic {
            context = context.with_combination_logic(combination_logic.clone());
        }

        let message = invoke_agent(&answer_agent, &context).await?;
        let usage = message.token_usage;
        let output: AnswerOutput = serde_json::from_str(&message.content)
            .map_err(|e| Text2SqlError::Llm(format!("Malformed answer output: {e}")))?;

        let mut payload = OutboundPayload::new(
            thread_id.clone(),
            PayloadBody::AnswerWithSources {
                answer: output.answer,
                sources: output.sources,
                follow_up_suggestions: output.follow_up_suggestions,
            },
        );
        if let Some(usage) = usage {
            payload = payload.with_usage(usage);
        }
        let _ = tx.send(payload).await;

        // Write-through per answered sub-question; failures are logged
        // and the run still succeeds.
        for (question, sql, schemas) in cache_writes {
            if let Err(e) = self.tools.cache_write(CacheEntry::new(question, sql, schemas)).await {
                warn!(error = %e, "Query cache write failed");
            }
        }

        self.state_store.clear(&thread_id);
        Ok(())
    }

    async fn emit(&self, tx: &mpsc::Sender<OutboundPayload>, thread_id: &ThreadId, body: PayloadBody) {
        let _ = tx.send(OutboundPayload::new(thread_id.clone(), body)).await;
    }

    async fn emit_error(
        &self,
        tx: &mpsc::Sender<OutboundPayload>,
        thread_id: &ThreadId,
        error: &Text2SqlError,
        details: Option<Value>,
    ) {
        self.emit(tx, thread_id, PayloadBody::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            details,
        })
        .await;
    }
}

enum RoundVerdict {
    Continue,
    Suspend(Vec<PendingSubQuestion>),
    Abort(String),
}
