//! Model context construction.
//!
//! Three responsibilities:
//!
//! 1. **System prompts**: one variant for the automatic first-pass analysis
//!    of a fresh upload, one for answering follow-up questions. Both describe
//!    the same tool set.
//! 2. **Data summary**: the textual rendering of a dataset profile embedded
//!    in the system prompt. This is a pure function of the profile: identical
//!    profiles must produce byte-identical summaries, because the summary is
//!    the model's only grounding in the data and must be reproducible.
//! 3. **Context replay**: rebuilding the model conversation from the
//!    persisted message log each turn. There is no in-memory chat state; the
//!    log is the single source of truth, which is what makes restarts and
//!    reconnects boring.
//!
//! Token accounting uses the same character-based approximation throughout
//! (1 token ≈ 4 characters). It is deliberately rough; the budget exists to
//! bound growth, not to bill.

use crate::profile::DatasetProfile;
use crate::types::{ChatMessage, MessageKind, MessageRole, StoredMessage};

/// Which prompt variant a turn uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnFlow {
    /// First automatic pass over a fresh upload.
    InitialAnalysis,
    /// Ordinary question answering.
    FollowUp,
}

/// Synthetic user instruction injected for the automatic analysis turn.
/// Context-only: it is never persisted, so restores show only real input.
pub const AUTO_ANALYZE_INSTRUCTION: &str =
    "Please analyze this dataset. Give a short overview of what it contains, \
     point out anything notable, and show one or two useful summaries.";

const INITIAL_ANALYSIS_PROMPT: &str = "\
You are a data analyst. A user just uploaded a tabular dataset, described \
below. Explore it and present a first analysis they can react to.

Work strictly through the tools provided:
- sql_query: run a read-only SQL SELECT against the single table `data`.
- output_text: show the user a markdown paragraph.
- output_table: show the user a small formatted table.
- create_plot: show the user a chart, given a declarative chart spec.
- finalize: end your turn; optionally set a short session title.

Plain response text is private scratch reasoning and is never shown to the \
user; anything the user should see must go through output_text, output_table \
or create_plot. Start from the column summary below instead of re-deriving \
it, keep queries small, and finish with finalize, giving the session a short \
descriptive title.";

const FOLLOW_UP_PROMPT: &str = "\
You are a data analyst answering questions about the tabular dataset \
described below. Answer only from the dataset.

Work strictly through the tools provided:
- sql_query: run a read-only SQL SELECT against the single table `data`.
- output_text: show the user a markdown paragraph.
- output_table: show the user a small formatted table.
- create_plot: show the user a chart, given a declarative chart spec.
- finalize: end your turn.

Plain response text is private scratch reasoning and is never shown to the \
user; anything the user should see must go through output_text, output_table \
or create_plot. If a query fails, read the error, correct the SQL and retry. \
If the question cannot be answered from this dataset, say so via output_text. \
End every turn with finalize.";

/// Assemble the full system prompt for a turn.
pub fn system_prompt(flow: TurnFlow, profile: &DatasetProfile) -> String {
    let instructions = match flow {
        TurnFlow::InitialAnalysis => INITIAL_ANALYSIS_PROMPT,
        TurnFlow::FollowUp => FOLLOW_UP_PROMPT,
    };
    format!("{instructions}\n\n{}", data_summary(profile))
}

/// Render the dataset profile as the grounding block of the system prompt.
///
/// Deterministic: depends only on the profile contents.
pub fn data_summary(profile: &DatasetProfile) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Dataset: {} ({} rows, {} columns)\nColumns:\n",
        profile.filename, profile.row_count, profile.column_count
    ));
    for column in &profile.columns {
        let bucket = null_bucket(profile.null_ratio(column));
        out.push_str(&format!(
            "- {} ({}, nulls: {})",
            column.name,
            column.column_type.as_str(),
            bucket
        ));
        if !column.samples.is_empty() {
            out.push_str(&format!(", e.g. {}", column.samples.join(", ")));
        }
        out.push('\n');
    }
    out
}

/// Coarse null-ratio bucket; exact ratios would make summaries noisy.
fn null_bucket(ratio: f64) -> &'static str {
    if ratio <= 0.0 {
        "none"
    } else if ratio < 0.05 {
        "<5%"
    } else if ratio < 0.25 {
        "<25%"
    } else {
        ">=25%"
    }
}

/// Estimate token count for a message list.
///
/// Character-based approximation (1 token ≈ 4 characters) with a small
/// per-message overhead. Accuracy varies by tokenizer; treat results as a
/// bound, not a count.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 16;
    for message in messages {
        total_chars += 8;
        total_chars += message.content.len();
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                total_chars += call.function.name.len() + call.function.arguments.len() + 16;
            }
        }
    }
    total_chars.div_ceil(4)
}

/// Rebuild the model conversation for one turn from the persisted log.
///
/// Replay rules:
/// - user messages come through unchanged;
/// - `internal` messages are the assistant's prior reasoning, verbatim;
/// - visible outputs (`text`/`table`/`plot`) replay as brief assistant text;
/// - `query_result` flattens onto the preceding assistant message so the
///   model sees what its queries returned without re-streaming rows.
///
/// The triggering message is appended last. If the estimated size exceeds
/// `token_budget`, whole messages are dropped from the front; the system
/// block and the trigger always survive.
pub fn build_context(
    system: String,
    history: &[StoredMessage],
    trigger: &str,
    token_budget: usize,
) -> Vec<ChatMessage> {
    let mut replayed: Vec<ChatMessage> = Vec::new();

    for msg in history {
        match (msg.role, msg.kind) {
            (MessageRole::User, _) => replayed.push(ChatMessage::user(&msg.body)),
            (MessageRole::Assistant, MessageKind::Internal) => {
                replayed.push(ChatMessage::assistant(&msg.body));
            }
            (MessageRole::Assistant, MessageKind::Text) => {
                replayed.push(ChatMessage::assistant(&msg.body));
            }
            (MessageRole::Assistant, MessageKind::Table) => {
                replayed.push(ChatMessage::assistant(format!("[shared a table: {}]", msg.body)));
            }
            (MessageRole::Assistant, MessageKind::Plot) => {
                replayed.push(ChatMessage::assistant(format!("[shared a chart: {}]", msg.body)));
            }
            (MessageRole::Assistant, MessageKind::QueryResult) => {
                let brief = flatten_query_result(msg);
                let flattened = match replayed.last_mut() {
                    Some(last) if last.role == "assistant" => {
                        last.content.push('\n');
                        last.content.push_str(&brief);
                        true
                    }
                    _ => false,
                };
                if !flattened {
                    replayed.push(ChatMessage::assistant(brief));
                }
            }
            // System turns are regenerated each turn, never replayed.
            (MessageRole::System, _) => {}
        }
    }

    replayed.push(ChatMessage::user(trigger));

    let system_msg = ChatMessage::system(system);
    let mut start = 0;
    loop {
        let mut candidate = Vec::with_capacity(1 + replayed.len() - start);
        candidate.push(system_msg.clone());
        candidate.extend(replayed[start..].iter().cloned());
        if estimate_tokens(&candidate) <= token_budget || start + 1 >= replayed.len() {
            return candidate;
        }
        start += 1;
    }
}

/// One-line textual form of a persisted query result.
fn flatten_query_result(msg: &StoredMessage) -> String {
    let payload = msg.payload.as_ref();
    let sql = payload
        .and_then(|p| p.get("sql"))
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    let is_error = payload
        .and_then(|p| p.get("is_error"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if is_error {
        let error = payload
            .and_then(|p| p.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        format!("[ran query `{sql}` -> failed: {error}]")
    } else {
        let rows = payload
            .and_then(|p| p.get("row_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        format!("[ran query `{sql}` -> {rows} rows]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ColumnProfile, ColumnType};
    use chrono::Utc;

    fn test_profile() -> DatasetProfile {
        DatasetProfile {
            filename: "people.csv".into(),
            row_count: 1000,
            column_count: 3,
            columns: vec![
                ColumnProfile {
                    name: "id".into(),
                    column_type: ColumnType::Integer,
                    null_count: 0,
                    samples: vec!["1".into(), "2".into()],
                },
                ColumnProfile {
                    name: "name".into(),
                    column_type: ColumnType::Text,
                    null_count: 30,
                    samples: vec!["alice".into(), "bob".into()],
                },
                ColumnProfile {
                    name: "age".into(),
                    column_type: ColumnType::Integer,
                    null_count: 400,
                    samples: vec![],
                },
            ],
            sample_rows: vec![],
        }
    }

    fn stored(role: MessageRole, kind: MessageKind, body: &str) -> StoredMessage {
        StoredMessage {
            id: 0,
            role,
            kind,
            body: body.to_string(),
            payload: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_data_summary_contents() {
        let summary = data_summary(&test_profile());
        assert!(summary.contains("people.csv (1000 rows, 3 columns)"));
        assert!(summary.contains("- id (integer, nulls: none), e.g. 1, 2"));
        assert!(summary.contains("- name (text, nulls: <5%), e.g. alice, bob"));
        assert!(summary.contains("- age (integer, nulls: >=25%)"));
    }

    #[test]
    fn test_data_summary_deterministic() {
        // Identical profiles must yield byte-identical summaries.
        let a = data_summary(&test_profile());
        let b = data_summary(&test_profile());
        assert_eq!(a, b);

        let via_json: DatasetProfile =
            serde_json::from_str(&serde_json::to_string(&test_profile()).unwrap()).unwrap();
        assert_eq!(a, data_summary(&via_json));
    }

    #[test]
    fn test_null_buckets() {
        assert_eq!(null_bucket(0.0), "none");
        assert_eq!(null_bucket(0.01), "<5%");
        assert_eq!(null_bucket(0.049), "<5%");
        assert_eq!(null_bucket(0.05), "<25%");
        assert_eq!(null_bucket(0.24), "<25%");
        assert_eq!(null_bucket(0.25), ">=25%");
        assert_eq!(null_bucket(1.0), ">=25%");
    }

    #[test]
    fn test_prompt_variants_differ_but_share_tools() {
        let profile = test_profile();
        let a = system_prompt(TurnFlow::InitialAnalysis, &profile);
        let b = system_prompt(TurnFlow::FollowUp, &profile);
        assert_ne!(a, b);
        for prompt in [&a, &b] {
            for tool in ["sql_query", "output_text", "output_table", "create_plot", "finalize"] {
                assert!(prompt.contains(tool), "missing {tool}");
            }
            assert!(prompt.contains("people.csv"));
        }
    }

    #[test]
    fn test_replay_user_and_text() {
        let history = vec![
            stored(MessageRole::User, MessageKind::Text, "hi"),
            stored(MessageRole::Assistant, MessageKind::Text, "hello"),
        ];
        let ctx = build_context("sys".into(), &history, "next question", 100_000);

        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx[0].role, "system");
        assert_eq!(ctx[1].content, "hi");
        assert_eq!(ctx[2].content, "hello");
        assert_eq!(ctx[3].content, "next question");
    }

    #[test]
    fn test_replay_flattens_query_result_onto_previous_assistant() {
        let mut qr = stored(MessageRole::Assistant, MessageKind::QueryResult, "row count");
        qr.payload = Some(serde_json::json!({
            "sql": "SELECT count(*) FROM data",
            "row_count": 1,
            "is_error": false
        }));
        let history = vec![
            stored(MessageRole::Assistant, MessageKind::Internal, "let me count"),
            qr,
        ];
        let ctx = build_context("sys".into(), &history, "q", 100_000);

        assert_eq!(ctx.len(), 3);
        assert!(ctx[1].content.starts_with("let me count"));
        assert!(ctx[1].content.contains("SELECT count(*) FROM data"));
        assert!(ctx[1].content.contains("1 rows"));
    }

    #[test]
    fn test_replay_query_error_flattened() {
        let mut qr = stored(MessageRole::Assistant, MessageKind::QueryResult, "bad");
        qr.payload = Some(serde_json::json!({
            "sql": "SELECT nope FROM data",
            "is_error": true,
            "error": "no such column"
        }));
        let ctx = build_context("sys".into(), &[qr], "q", 100_000);

        // No preceding assistant message: the brief stands alone.
        assert_eq!(ctx.len(), 3);
        assert!(ctx[1].content.contains("failed: no such column"));
    }

    #[test]
    fn test_budget_drops_oldest_first() {
        let mut history = Vec::new();
        for i in 0..40 {
            history.push(stored(MessageRole::User, MessageKind::Text, &format!("question {i} {}", "x".repeat(400))));
            history.push(stored(MessageRole::Assistant, MessageKind::Text, &format!("answer {i} {}", "y".repeat(400))));
        }
        let ctx = build_context("sys".into(), &history, "final question", 2_000);

        // System block survives, trigger survives, oldest content dropped.
        assert_eq!(ctx[0].role, "system");
        assert_eq!(ctx.last().unwrap().content, "final question");
        assert!(ctx.len() < 82);
        assert!(estimate_tokens(&ctx) <= 2_000);
        assert!(!ctx.iter().any(|m| m.content.contains("question 0 ")));
    }

    #[test]
    fn test_budget_never_drops_trigger() {
        let ctx = build_context("sys".into(), &[], &"z".repeat(100_000), 10);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[1].role, "user");
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_estimate_tokens_scales_with_content() {
        let small = vec![ChatMessage::user("hi")];
        let large = vec![ChatMessage::user("x".repeat(4_000))];
        assert!(estimate_tokens(&large) > estimate_tokens(&small) + 900);
    }
}
