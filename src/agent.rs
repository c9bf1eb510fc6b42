//! The per-turn agent loop.
//!
//! One turn is a bounded state machine around tool-using model calls:
//!
//! ```text
//! prepare context ──► model call ──► tool dispatch ──► model call ── …
//!                        │                │
//!                        │ end-of-turn    │ finalize
//!                        ▼                ▼
//!                     Finalized ◄─────────┘          (or Aborted / Failed)
//! ```
//!
//! Guarantees the rest of the system leans on:
//!
//! - exactly one `done` event per turn, whatever happens inside;
//! - at most one in-flight model request per turn;
//! - every dispatched tool call feeds exactly one result back into the
//!   model context, and visible tools emit exactly one transport event;
//! - cancellation is observed at every suspension point, and once observed
//!   no further tool output is emitted;
//! - a turn that produced nothing visible still shows the user one line.
//!
//! Tool errors are results, not failures: the model reads them and
//! corrects itself. Only model-transport exhaustion (after retries) and
//! infrastructure errors end a turn as `Failed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::context::{self, TurnFlow};
use crate::events::{EventSink, ServerEvent};
use crate::llm::ModelClient;
use crate::profile::DatasetProfile;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::tools::{ToolCall, ToolContext};
use crate::types::{ChatMessage, MessageKind, MessageRole, WireFunction, WireToolCall};

/// Minimum spacing between unchanged status events.
const STATUS_MIN_INTERVAL: Duration = Duration::from_millis(2_500);

/// Shown when a turn ends with no visible output at all.
const EMPTY_TURN_TEXT: &str =
    "I wasn't able to produce a result for that. Could you rephrase the question?";

/// What started the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTrigger {
    UserMessage(String),
    AutoAnalyze,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The model called `finalize` (or signalled end-of-turn).
    Finalized,
    /// The iteration cap was reached before `finalize`.
    IterationCap,
    /// Cancellation was observed.
    Aborted,
    /// The wall-clock cap for the whole turn expired.
    Expired,
    /// Model transport gave out after retries, or infrastructure failed.
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub end: TurnEnd,
    pub iterations: u32,
}

/// Coalesces advisory status events. Each distinct message goes out at most
/// once per [`STATUS_MIN_INTERVAL`], so fast iteration loops alternating
/// between the same two hints do not flood the transport.
struct StatusGate {
    recent: std::collections::HashMap<String, Instant>,
}

impl StatusGate {
    fn new() -> Self {
        StatusGate { recent: std::collections::HashMap::new() }
    }

    fn send(&mut self, sink: &EventSink, message: &str) {
        let now = Instant::now();
        if let Some(at) = self.recent.get(message) {
            if now.duration_since(*at) < STATUS_MIN_INTERVAL {
                return;
            }
        }
        sink.emit_status(message);
        self.recent.insert(message.to_string(), now);
    }
}

/// Result of the inner drive loop, before terminal events go out.
enum DriveEnd {
    Finalized { suggestions: Vec<String> },
    IterationCap,
    Aborted,
    Failed,
}

/// Drives turns for any session; holds no per-session state.
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    retry: RetryConfig,
    max_iterations: u32,
    max_turn_duration: Duration,
    token_budget: usize,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn ModelClient>, settings: &Settings) -> Self {
        AgentLoop {
            model,
            retry: RetryConfig::default(),
            max_iterations: settings.max_iterations,
            max_turn_duration: settings.max_turn_duration,
            token_budget: settings.context_token_budget,
        }
    }

    /// Override retry pacing (tests tighten the delays).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run one turn to completion. Emits all terminal events itself;
    /// `done` goes out exactly once on every path.
    pub async fn run_turn(
        &self,
        ctx: &ToolContext,
        profile: &DatasetProfile,
        trigger: TurnTrigger,
        cancel: CancellationToken,
    ) -> TurnReport {
        // Shared with the drive future, read from the expiry arm while that
        // future is still in scope.
        let iterations = AtomicU32::new(0);
        let visible = AtomicBool::new(false);

        let end = tokio::select! {
            end = self.drive(ctx, profile, &trigger, &cancel, &iterations, &visible) => end,
            _ = tokio::time::sleep(self.max_turn_duration) => {
                cancel.cancel();
                ctx.sink.emit(ServerEvent::error("turn exceeded the time limit")).await;
                ctx.sink.emit(ServerEvent::done_aborted()).await;
                return TurnReport {
                    end: TurnEnd::Expired,
                    iterations: iterations.load(Ordering::Relaxed),
                };
            }
        };
        let iterations = iterations.load(Ordering::Relaxed);
        let visible = visible.load(Ordering::Relaxed);

        let report_end = match end {
            DriveEnd::Finalized { suggestions } => {
                if !visible {
                    ctx.sink
                        .emit(ServerEvent::Text { text: EMPTY_TURN_TEXT.to_string() })
                        .await;
                }
                ctx.sink.emit(ServerEvent::done_with_suggestions(suggestions)).await;
                TurnEnd::Finalized
            }
            DriveEnd::IterationCap => {
                if !visible {
                    ctx.sink
                        .emit(ServerEvent::Text { text: EMPTY_TURN_TEXT.to_string() })
                        .await;
                }
                tracing::warn!(
                    session = %ctx.session_id,
                    iterations,
                    "turn hit the iteration cap without finalize"
                );
                ctx.sink.emit(ServerEvent::done()).await;
                TurnEnd::IterationCap
            }
            DriveEnd::Aborted => {
                ctx.sink.emit(ServerEvent::done_aborted()).await;
                TurnEnd::Aborted
            }
            DriveEnd::Failed => {
                ctx.sink.emit(ServerEvent::done()).await;
                TurnEnd::Failed
            }
        };

        TurnReport { end: report_end, iterations }
    }

    async fn drive(
        &self,
        ctx: &ToolContext,
        profile: &DatasetProfile,
        trigger: &TurnTrigger,
        cancel: &CancellationToken,
        iterations: &AtomicU32,
        visible: &AtomicBool,
    ) -> DriveEnd {
        let mut status = StatusGate::new();

        // History is read before the trigger is persisted, so the replay and
        // the appended trigger line up without duplication.
        let history = match ctx.store.list_messages(&ctx.session_id) {
            Ok(history) => history,
            Err(err) => {
                tracing::error!(session = %ctx.session_id, error = %err, "history read failed");
                ctx.sink.emit(ServerEvent::error("could not load the conversation")).await;
                return DriveEnd::Failed;
            }
        };

        let (flow, trigger_text) = match trigger {
            TurnTrigger::AutoAnalyze => {
                (TurnFlow::InitialAnalysis, context::AUTO_ANALYZE_INSTRUCTION.to_string())
            }
            TurnTrigger::UserMessage(text) => {
                if let Err(err) = ctx.store.append(
                    &ctx.session_id,
                    MessageRole::User,
                    MessageKind::Text,
                    text,
                    None,
                ) {
                    tracing::error!(session = %ctx.session_id, error = %err, "user message append failed");
                    ctx.sink.emit(ServerEvent::error("could not record the message")).await;
                    return DriveEnd::Failed;
                }
                (TurnFlow::FollowUp, text.clone())
            }
        };

        let system = context::system_prompt(flow, profile);
        let mut messages =
            context::build_context(system, &history, &trigger_text, self.token_budget);
        let tools = ToolCall::definitions();

        while iterations.load(Ordering::Relaxed) < self.max_iterations {
            iterations.fetch_add(1, Ordering::Relaxed);
            status.send(&ctx.sink, "Thinking…");

            if cancel.is_cancelled() {
                return DriveEnd::Aborted;
            }

            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => return DriveEnd::Aborted,
                result = retry_with_backoff(&self.retry, || {
                    self.model.complete(messages.clone(), tools.clone())
                }) => match result {
                    Ok(turn) => turn,
                    Err(err) => {
                        tracing::error!(session = %ctx.session_id, error = %err, "model request failed");
                        ctx.sink
                            .emit(ServerEvent::error("the analysis backend is unavailable right now"))
                            .await;
                        return DriveEnd::Failed;
                    }
                },
            };

            if cancel.is_cancelled() {
                return DriveEnd::Aborted;
            }

            // The model's free text is private reasoning: persisted for
            // later turns, never streamed.
            if !turn.text.trim().is_empty() {
                if let Err(err) = ctx.store.append(
                    &ctx.session_id,
                    MessageRole::Assistant,
                    MessageKind::Internal,
                    &turn.text,
                    None,
                ) {
                    tracing::warn!(session = %ctx.session_id, error = %err, "reasoning append failed");
                }
            }

            if turn.is_end_of_turn() {
                // No tool call means the model is done; same as a bare finalize.
                return DriveEnd::Finalized { suggestions: Vec::new() };
            }

            let wire_calls: Vec<WireToolCall> = turn
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect();
            messages.push(ChatMessage::assistant_with_calls(turn.text.clone(), wire_calls));

            for request in turn.tool_calls {
                status.send(&ctx.sink, phase_hint(&request.name));

                let outcome = match ToolCall::parse(&request.name, &request.arguments) {
                    Ok(call) => match call.dispatch(ctx, cancel).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::error!(session = %ctx.session_id, error = %err, "tool dispatch failed");
                            ctx.sink
                                .emit(ServerEvent::error("an internal error interrupted the analysis"))
                                .await;
                            return DriveEnd::Failed;
                        }
                    },
                    // Known tool, unusable arguments: tell the model.
                    Err(err) => {
                        messages.push(ChatMessage::tool_result(
                            request.id,
                            serde_json::json!({ "error": err.to_string() }).to_string(),
                        ));
                        continue;
                    }
                };

                if outcome.aborted {
                    return DriveEnd::Aborted;
                }
                visible.fetch_or(outcome.visible, Ordering::Relaxed);

                messages.push(ChatMessage::tool_result(request.id, outcome.reply.to_string()));

                if outcome.finalize {
                    return DriveEnd::Finalized { suggestions: outcome.suggestions };
                }
            }
        }

        DriveEnd::IterationCap
    }
}

fn phase_hint(tool_name: &str) -> &'static str {
    match tool_name {
        "sql_query" => "Running query…",
        "create_plot" => "Drawing chart…",
        "output_text" | "output_table" => "Writing up results…",
        "finalize" => "Wrapping up…",
        _ => "Working…",
    }
}
