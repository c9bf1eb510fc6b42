//! The tool set the model may invoke.
//!
//! The registry is closed by construction: a model tool call parses into one
//! case of [`ToolCall`], and names outside the set become [`ToolCall::Unknown`],
//! which dispatch answers with an error result the model can read and
//! correct. There is no dynamic lookup and nothing a model string can invoke
//! beyond these five operations.
//!
//! Dispatch owns the full effect of a tool: engine execution, the transport
//! event, and persistence, in that order. Tool failures that the model can
//! fix (bad SQL, malformed chart spec) are folded into the reply with
//! `is_error`; only infrastructure failures propagate.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::engine::QueryEngine;
use crate::events::{EventSink, ServerEvent};
use crate::store::MessageStore;
use crate::types::{DatasetFile, MessageKind, MessageRole, SessionId};
use crate::{Error, Result};

/// Everything a tool needs from its session.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub file: DatasetFile,
    pub store: Arc<MessageStore>,
    pub sink: EventSink,
    pub engine: Arc<QueryEngine>,
    pub max_result_rows: usize,
    pub max_plot_rows: usize,
}

/// One parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    SqlQuery {
        sql: String,
        description: String,
    },
    OutputText {
        markdown: String,
    },
    OutputTable {
        title: String,
        headers: Vec<String>,
        rows: Vec<Value>,
    },
    CreatePlot {
        title: String,
        spec: Value,
    },
    Finalize {
        title: Option<String>,
        suggestions: Vec<String>,
    },
    /// Anything the model invented; answered with an error result.
    Unknown {
        name: String,
    },
}

/// What dispatching one tool produced.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// JSON fed back to the model as this call's result.
    pub reply: Value,
    /// The turn ends after this tool.
    pub finalize: bool,
    /// Cancellation was observed before side effects; nothing was emitted.
    pub aborted: bool,
    /// A user-facing `text`/`table`/`plot` event went out.
    pub visible: bool,
    /// Follow-up suggestions captured from `finalize`.
    pub suggestions: Vec<String>,
}

impl ToolOutcome {
    fn reply(reply: Value) -> Self {
        ToolOutcome {
            reply,
            finalize: false,
            aborted: false,
            visible: false,
            suggestions: Vec::new(),
        }
    }

    fn shown(reply: Value) -> Self {
        ToolOutcome { visible: true, ..Self::reply(reply) }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::reply(json!({ "error": message.into() }))
    }

    fn aborted() -> Self {
        ToolOutcome {
            reply: Value::Null,
            finalize: false,
            aborted: true,
            visible: false,
            suggestions: Vec::new(),
        }
    }
}

impl ToolCall {
    /// Parse a model tool call. Unknown names map to [`ToolCall::Unknown`];
    /// known names with unusable arguments fail, and the caller turns that
    /// failure into an error result for the model.
    pub fn parse(name: &str, arguments: &Value) -> Result<ToolCall> {
        match name {
            "sql_query" => Ok(ToolCall::SqlQuery {
                sql: required_str(arguments, "sql")?,
                description: optional_str(arguments, "description").unwrap_or_default(),
            }),
            "output_text" => Ok(ToolCall::OutputText {
                markdown: required_str(arguments, "markdown")?,
            }),
            "output_table" => {
                let headers = arguments
                    .get("headers")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::invalid_input("output_table requires 'headers'"))?
                    .iter()
                    .map(|h| h.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| Error::invalid_input("'headers' must be strings"))?;
                let rows = arguments
                    .get("rows")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::invalid_input("output_table requires 'rows'"))?
                    .clone();
                Ok(ToolCall::OutputTable {
                    title: optional_str(arguments, "title").unwrap_or_default(),
                    headers,
                    rows,
                })
            }
            "create_plot" => Ok(ToolCall::CreatePlot {
                title: required_str(arguments, "title")?,
                spec: arguments
                    .get("spec")
                    .cloned()
                    .ok_or_else(|| Error::invalid_input("create_plot requires 'spec'"))?,
            }),
            "finalize" => Ok(ToolCall::Finalize {
                title: optional_str(arguments, "title"),
                suggestions: arguments
                    .get("suggestions")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|s| s.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            other => Ok(ToolCall::Unknown { name: other.to_string() }),
        }
    }

    /// OpenAI function schemas for the whole registry.
    pub fn definitions() -> Vec<Value> {
        vec![
            function_schema(
                "sql_query",
                "Run a read-only SQL SELECT against the table `data`. Returns columns and up to 50 rows.",
                json!({
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string", "description": "A single SELECT (or WITH) statement over `data`" },
                        "description": { "type": "string", "description": "One short line saying what the query checks" }
                    },
                    "required": ["sql"]
                }),
            ),
            function_schema(
                "output_text",
                "Show the user a markdown paragraph. This is the only way to show prose.",
                json!({
                    "type": "object",
                    "properties": {
                        "markdown": { "type": "string" }
                    },
                    "required": ["markdown"]
                }),
            ),
            function_schema(
                "output_table",
                "Show the user a small formatted table.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "headers": { "type": "array", "items": { "type": "string" } },
                        "rows": { "type": "array", "items": { "type": "array" } }
                    },
                    "required": ["headers", "rows"]
                }),
            ),
            function_schema(
                "create_plot",
                "Show the user a chart. `spec` is a declarative chart object with a chart-type field and embedded data.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "spec": { "type": "object", "description": "Chart spec with a 'type' (or 'mark') discriminator and a 'data' field" }
                    },
                    "required": ["title", "spec"]
                }),
            ),
            function_schema(
                "finalize",
                "End the turn. Optionally set a short session title (first turn) and suggest follow-up questions.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "suggestions": { "type": "array", "items": { "type": "string" } }
                    }
                }),
            ),
        ]
    }

    /// Execute this call against the session.
    pub async fn dispatch(
        self,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        match self {
            ToolCall::SqlQuery { sql, description } => {
                run_sql_query(ctx, cancel, sql, description).await
            }
            ToolCall::OutputText { markdown } => {
                if cancel.is_cancelled() {
                    return Ok(ToolOutcome::aborted());
                }
                ctx.sink.emit(ServerEvent::Text { text: markdown.clone() }).await;
                ctx.store.append(
                    &ctx.session_id,
                    MessageRole::Assistant,
                    MessageKind::Text,
                    &markdown,
                    None,
                )?;
                Ok(ToolOutcome::shown(json!({ "ok": true })))
            }
            ToolCall::OutputTable { title, headers, rows } => {
                if cancel.is_cancelled() {
                    return Ok(ToolOutcome::aborted());
                }
                let payload =
                    json!({ "title": title.clone(), "headers": headers.clone(), "rows": rows.clone() });
                ctx.sink
                    .emit(ServerEvent::Table {
                        title: title.clone(),
                        headers,
                        rows,
                    })
                    .await;
                ctx.store.append(
                    &ctx.session_id,
                    MessageRole::Assistant,
                    MessageKind::Table,
                    &title,
                    Some(&payload),
                )?;
                Ok(ToolOutcome::shown(json!({ "ok": true })))
            }
            ToolCall::CreatePlot { title, spec } => {
                if let Err(reason) = validate_plot_spec(&spec) {
                    return Ok(ToolOutcome::error(reason));
                }
                if cancel.is_cancelled() {
                    return Ok(ToolOutcome::aborted());
                }
                let spec = cap_embedded_data(spec, ctx.max_plot_rows);
                let payload = json!({ "title": title.clone(), "spec": spec.clone() });
                ctx.sink
                    .emit(ServerEvent::Plot { title: title.clone(), spec })
                    .await;
                ctx.store.append(
                    &ctx.session_id,
                    MessageRole::Assistant,
                    MessageKind::Plot,
                    &title,
                    Some(&payload),
                )?;
                Ok(ToolOutcome::shown(json!({ "ok": true })))
            }
            ToolCall::Finalize { title, suggestions } => {
                if cancel.is_cancelled() {
                    return Ok(ToolOutcome::aborted());
                }
                if let Some(title) = title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                    // First writer wins; later turns cannot rename.
                    if ctx.store.get_title(&ctx.session_id)?.is_none() {
                        ctx.store.set_title(&ctx.session_id, title)?;
                        ctx.sink
                            .emit(ServerEvent::SessionUpdate { title: title.to_string() })
                            .await;
                    }
                }
                Ok(ToolOutcome {
                    reply: json!({ "ok": true }),
                    finalize: true,
                    aborted: false,
                    visible: false,
                    suggestions,
                })
            }
            ToolCall::Unknown { name } => {
                Ok(ToolOutcome::error(format!("unknown tool {name}")))
            }
        }
    }
}

async fn run_sql_query(
    ctx: &ToolContext,
    cancel: &CancellationToken,
    sql: String,
    description: String,
) -> Result<ToolOutcome> {
    if cancel.is_cancelled() {
        return Ok(ToolOutcome::aborted());
    }

    let result = ctx.engine.execute(&ctx.file, &sql, ctx.max_result_rows).await;

    // Cancellation observed while the query ran: drop the result silently.
    if cancel.is_cancelled() {
        return Ok(ToolOutcome::aborted());
    }

    match result {
        Ok(output) => {
            let rows = output.rows_json();
            let payload = json!({
                "description": description.clone(),
                "sql": sql.clone(),
                "columns": output.columns.clone(),
                "rows": rows.clone(),
                "row_count": output.row_count(),
                "is_error": false,
            });
            ctx.sink
                .emit(ServerEvent::QueryResult {
                    description: description.clone(),
                    sql: sql.clone(),
                    columns: output.columns.clone(),
                    rows: rows.clone(),
                    row_count: output.row_count(),
                    is_error: false,
                    error: None,
                })
                .await;
            ctx.store.append(
                &ctx.session_id,
                MessageRole::Assistant,
                MessageKind::QueryResult,
                &description,
                Some(&payload),
            )?;
            Ok(ToolOutcome::reply(json!({
                "columns": output.columns,
                "rows": rows,
                "row_count": output.row_count(),
                "truncated": output.truncated,
            })))
        }
        Err(err) if err.is_tool_recoverable() => {
            let message = err.to_string();
            let payload = json!({
                "description": description.clone(),
                "sql": sql.clone(),
                "is_error": true,
                "error": message.clone(),
            });
            ctx.sink
                .emit(ServerEvent::QueryResult {
                    description: description.clone(),
                    sql: sql.clone(),
                    columns: Vec::new(),
                    rows: Vec::new(),
                    row_count: 0,
                    is_error: true,
                    error: Some(message.clone()),
                })
                .await;
            ctx.store.append(
                &ctx.session_id,
                MessageRole::Assistant,
                MessageKind::QueryResult,
                &description,
                Some(&payload),
            )?;
            Ok(ToolOutcome::error(message))
        }
        Err(err) => Err(err),
    }
}

/// Minimal structural check; the spec is otherwise passed through opaquely.
fn validate_plot_spec(spec: &Value) -> std::result::Result<(), String> {
    let Some(obj) = spec.as_object() else {
        return Err("chart spec must be a JSON object".to_string());
    };
    let has_discriminator = obj
        .get("type")
        .or_else(|| obj.get("mark"))
        .map(|v| v.is_string() || v.is_object())
        .unwrap_or(false);
    if !has_discriminator {
        return Err("chart spec needs a 'type' (or 'mark') field naming the chart type".to_string());
    }
    if !obj.contains_key("data") {
        return Err("chart spec needs a 'data' field".to_string());
    }
    Ok(())
}

/// Bound data embedded in a chart spec. Looks for the conventional
/// `data.values` array and truncates it; anything else passes through.
fn cap_embedded_data(mut spec: Value, max_rows: usize) -> Value {
    if let Some(values) = spec
        .get_mut("data")
        .and_then(|d| d.get_mut("values"))
        .and_then(Value::as_array_mut)
    {
        values.truncate(max_rows);
    }
    spec
}

fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

fn required_str(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_input(format!("missing required argument '{key}'")))
}

fn optional_str(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QueryEngine;
    use crate::events::EventSink;
    use crate::profile;
    use crate::types::SessionMeta;
    use chrono::Utc;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn context() -> (ToolContext, mpsc::Receiver<ServerEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("original.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"id,name,age\n1,alice,34\n2,bob,28\n3,carol,41\n").unwrap();
        let file = DatasetFile::from_path(&path).unwrap();

        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let prof = profile::build_profile(&file, "people.csv", 500).unwrap();
        store
            .register_session(
                &SessionMeta {
                    id: "s1".into(),
                    user_id: "u1".into(),
                    title: None,
                    filename: "people.csv".into(),
                    created_at: Utc::now(),
                },
                path.to_str().unwrap(),
                &prof,
            )
            .unwrap();

        let (sink, rx) = EventSink::channel(64);
        let ctx = ToolContext {
            session_id: "s1".into(),
            file,
            store,
            sink,
            engine: Arc::new(QueryEngine::new(Duration::from_secs(10))),
            max_result_rows: 50,
            max_plot_rows: 100,
        };
        (ctx, rx, dir)
    }

    #[test]
    fn test_parse_known_tools() {
        let call = ToolCall::parse(
            "sql_query",
            &json!({"sql": "SELECT 1", "description": "probe"}),
        )
        .unwrap();
        assert_eq!(
            call,
            ToolCall::SqlQuery { sql: "SELECT 1".into(), description: "probe".into() }
        );

        let call = ToolCall::parse("finalize", &json!({})).unwrap();
        assert_eq!(call, ToolCall::Finalize { title: None, suggestions: vec![] });

        let call = ToolCall::parse("finalize", &json!({"title": "Ages"})).unwrap();
        assert_eq!(
            call,
            ToolCall::Finalize { title: Some("Ages".into()), suggestions: vec![] }
        );
    }

    #[test]
    fn test_parse_unknown_tool() {
        let call = ToolCall::parse("rm_rf", &json!({})).unwrap();
        assert_eq!(call, ToolCall::Unknown { name: "rm_rf".into() });
    }

    #[test]
    fn test_parse_missing_required_argument() {
        assert!(ToolCall::parse("sql_query", &json!({})).is_err());
        assert!(ToolCall::parse("output_text", &json!({"text": "wrong key"})).is_err());
        assert!(ToolCall::parse("create_plot", &json!({"title": "t"})).is_err());
    }

    #[test]
    fn test_definitions_cover_registry() {
        let defs = ToolCall::definitions();
        let names: Vec<&str> = defs
            .iter()
            .map(|d| d["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["sql_query", "output_text", "output_table", "create_plot", "finalize"]
        );
        for def in &defs {
            assert_eq!(def["type"], "function");
            assert_eq!(def["function"]["parameters"]["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_sql_query_emits_and_persists() {
        let (ctx, mut rx, _dir) = context();
        let call = ToolCall::SqlQuery {
            sql: "SELECT name FROM data ORDER BY id".into(),
            description: "names".into(),
        };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(!outcome.finalize);
        assert_eq!(outcome.reply["row_count"], 3);
        assert_eq!(outcome.reply["truncated"], false);

        match rx.try_recv().unwrap() {
            ServerEvent::QueryResult { is_error, row_count, .. } => {
                assert!(!is_error);
                assert_eq!(row_count, 3);
            }
            other => panic!("expected query_result, got {other:?}"),
        }

        let messages = ctx.store.list_messages(&ctx.session_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::QueryResult);
    }

    #[tokio::test]
    async fn test_forbidden_sql_is_error_result_not_failure() {
        let (ctx, mut rx, _dir) = context();
        let call = ToolCall::SqlQuery { sql: "DELETE FROM data".into(), description: "".into() };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(outcome.reply["error"].as_str().unwrap().contains("DELETE"));
        match rx.try_recv().unwrap() {
            ServerEvent::QueryResult { is_error, error, .. } => {
                assert!(is_error);
                assert!(error.is_some());
            }
            other => panic!("expected query_result, got {other:?}"),
        }
        // The failed call is persisted too, so later turns can see it.
        let messages = ctx.store.list_messages(&ctx.session_id).unwrap();
        assert_eq!(messages[0].kind, MessageKind::QueryResult);
        assert_eq!(messages[0].payload.as_ref().unwrap()["is_error"], true);
    }

    #[tokio::test]
    async fn test_output_text_event_and_message() {
        let (ctx, mut rx, _dir) = context();
        let call = ToolCall::OutputText { markdown: "**3 people**".into() };
        call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Text { text: "**3 people**".into() }
        );
        let messages = ctx.store.list_messages(&ctx.session_id).unwrap();
        assert_eq!(messages[0].kind, MessageKind::Text);
        assert_eq!(messages[0].body, "**3 people**");
    }

    #[tokio::test]
    async fn test_create_plot_validates_spec() {
        let (ctx, mut rx, _dir) = context();

        // Not an object
        let call = ToolCall::CreatePlot { title: "t".into(), spec: json!("bar") };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(outcome.reply["error"].as_str().unwrap().contains("object"));

        // Missing discriminator
        let call = ToolCall::CreatePlot { title: "t".into(), spec: json!({"data": {}}) };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(outcome.reply.get("error").is_some());

        // Missing data
        let call = ToolCall::CreatePlot { title: "t".into(), spec: json!({"type": "bar"}) };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(outcome.reply.get("error").is_some());

        // No events for rejected specs
        assert!(rx.try_recv().is_err());

        // Valid spec goes through
        let call = ToolCall::CreatePlot {
            title: "Ages".into(),
            spec: json!({"type": "bar", "data": {"values": [{"x": 1}]}}),
        };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.reply["ok"], true);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Plot { .. }));
    }

    #[tokio::test]
    async fn test_plot_embedded_data_capped() {
        let (mut ctx, mut rx, _dir) = context();
        ctx.max_plot_rows = 2;
        let values: Vec<Value> = (0..10).map(|i| json!({"x": i})).collect();
        let call = ToolCall::CreatePlot {
            title: "big".into(),
            spec: json!({"type": "line", "data": {"values": values}}),
        };
        call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::Plot { spec, .. } => {
                assert_eq!(spec["data"]["values"].as_array().unwrap().len(), 2);
            }
            other => panic!("expected plot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finalize_sets_title_once() {
        let (ctx, mut rx, _dir) = context();
        let call = ToolCall::Finalize { title: Some("People data".into()), suggestions: vec![] };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(outcome.finalize);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::SessionUpdate { title: "People data".into() }
        );
        assert_eq!(ctx.store.get_title(&ctx.session_id).unwrap().unwrap(), "People data");

        // Second finalize with a different title is a no-op.
        let call = ToolCall::Finalize { title: Some("Renamed".into()), suggestions: vec![] };
        call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.store.get_title(&ctx.session_id).unwrap().unwrap(), "People data");
    }

    #[tokio::test]
    async fn test_finalize_collects_suggestions() {
        let (ctx, _rx, _dir) = context();
        let call = ToolCall::Finalize {
            title: None,
            suggestions: vec!["Age distribution?".into(), "Oldest person?".into()],
        };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.suggestions.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_reply() {
        let (ctx, mut rx, _dir) = context();
        let call = ToolCall::Unknown { name: "shell_exec".into() };
        let outcome = call.dispatch(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.reply["error"], "unknown tool shell_exec");
        assert!(!outcome.finalize);
        assert!(rx.try_recv().is_err());
        assert!(ctx.store.list_messages(&ctx.session_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_tool_emits_nothing() {
        let (ctx, mut rx, _dir) = context();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let call = ToolCall::OutputText { markdown: "never shown".into() };
        let outcome = call.dispatch(&ctx, &cancel).await.unwrap();
        assert!(outcome.aborted);
        assert!(rx.try_recv().is_err());
        assert!(ctx.store.list_messages(&ctx.session_id).unwrap().is_empty());

        let call = ToolCall::SqlQuery { sql: "SELECT 1".into(), description: "".into() };
        let outcome = call.dispatch(&ctx, &cancel).await.unwrap();
        assert!(outcome.aborted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_finalize_skips_title_and_events() {
        let (ctx, mut rx, _dir) = context();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let call = ToolCall::Finalize {
            title: Some("Never applied".into()),
            suggestions: vec!["leftover".into()],
        };
        let outcome = call.dispatch(&ctx, &cancel).await.unwrap();

        assert!(outcome.aborted);
        assert!(!outcome.finalize);
        assert!(outcome.suggestions.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.store.get_title(&ctx.session_id).unwrap(), None);
    }
}
