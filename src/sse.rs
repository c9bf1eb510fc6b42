//! Streamed model-response handling.
//!
//! The chat completions endpoint streams Server-Sent Events whose `data`
//! payloads are JSON chunks. Two problems live here:
//!
//! 1. **Framing**: `data:` lines must become [`ChatChunk`] values. The SSE
//!    framing itself is handled by `eventsource-stream`; the terminal
//!    `[DONE]` marker is filtered out.
//! 2. **Delta aggregation**: tool calls arrive as fragments spread over
//!    many chunks (`id` and `name` first, then the argument string in
//!    pieces, interleaved across calls by index). [`TurnAggregator`]
//!    accumulates fragments and only yields a [`ModelTurn`] once the stream
//!    ends, so the agent loop never sees a half-assembled call.

use std::collections::BTreeMap;

use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};

use crate::types::{ChatChunk, ModelTurn, ToolRequest};
use crate::{Error, Result};

/// Decode an HTTP response body into a stream of parsed chunks.
pub fn chunk_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<ChatChunk>> + Send {
    response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) => {
                    if event.data.trim() == "[DONE]" {
                        None
                    } else {
                        Some(
                            serde_json::from_str::<ChatChunk>(&event.data)
                                .map_err(|e| Error::stream(format!("bad chunk: {e}"))),
                        )
                    }
                }
                Err(e) => Some(Err(Error::stream(e.to_string()))),
            }
        })
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates streamed deltas into one complete model turn.
///
/// Text content concatenates in arrival order. Tool-call fragments are keyed
/// by the provider-assigned index because several calls stream interleaved.
#[derive(Default)]
pub struct TurnAggregator {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulating state.
    pub fn absorb(&mut self, chunk: &ChatChunk) {
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text.push_str(content);
            }
            if let Some(deltas) = &choice.delta.tool_calls {
                for delta in deltas {
                    let partial = self.calls.entry(delta.index).or_default();
                    if let Some(id) = &delta.id {
                        partial.id = Some(id.clone());
                    }
                    if let Some(function) = &delta.function {
                        if let Some(name) = &function.name {
                            partial.name = Some(name.clone());
                        }
                        if let Some(arguments) = &function.arguments {
                            partial.arguments.push_str(arguments);
                        }
                    }
                }
            }
        }
    }

    /// Finish the turn, validating every accumulated tool call.
    ///
    /// A call without a name is a protocol violation and fails the turn; an
    /// empty argument string means "no arguments" and becomes `{}`.
    pub fn finish(self) -> Result<ModelTurn> {
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for (index, partial) in self.calls {
            let name = partial
                .name
                .ok_or_else(|| Error::stream(format!("tool call {index} has no name")))?;
            let id = partial.id.unwrap_or_else(|| format!("call_{index}"));
            let arguments = if partial.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&partial.arguments).map_err(|e| {
                    Error::stream(format!(
                        "tool call {name} has unparseable arguments: {e}"
                    ))
                })?
            };
            tool_calls.push(ToolRequest { id, name, arguments });
        }
        Ok(ModelTurn { text: self.text, tool_calls })
    }
}

/// Drain a chunk stream into a complete turn.
pub async fn collect_turn(
    stream: impl Stream<Item = Result<ChatChunk>> + Send,
) -> Result<ModelTurn> {
    futures::pin_mut!(stream);
    let mut aggregator = TurnAggregator::new();
    while let Some(chunk) = stream.next().await {
        aggregator.absorb(&chunk?);
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(raw: &str) -> ChatChunk {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_text_concatenation() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#));
        agg.absorb(&chunk(r#"{"choices":[{"delta":{"content":" world"}}]}"#));
        agg.absorb(&chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));

        let turn = agg.finish().unwrap();
        assert_eq!(turn.text, "Hello world");
        assert!(turn.is_end_of_turn());
    }

    #[test]
    fn test_tool_call_assembled_from_fragments() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"name":"sql_query"}}]}}]}"#,
        ));
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":"{\"sql\":\"SELECT"}}]}}]}"#,
        ));
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":" 1\"}"}}]}}]}"#,
        ));

        let turn = agg.finish().unwrap();
        assert_eq!(turn.tool_calls.len(), 1);
        let call = &turn.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "sql_query");
        assert_eq!(call.arguments["sql"], "SELECT 1");
    }

    #[test]
    fn test_interleaved_calls_keyed_by_index() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"a","function":{"name":"output_text"}},
                {"index":1,"id":"b","function":{"name":"finalize"}}]}}]}"#,
        ));
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":1,"function":{"arguments":"{}"}},
                {"index":0,"function":{"arguments":"{\"markdown\":\"hi\"}"}}]}}]}"#,
        ));

        let turn = agg.finish().unwrap();
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].name, "output_text");
        assert_eq!(turn.tool_calls[1].name, "finalize");
    }

    #[test]
    fn test_text_alongside_tool_call() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(r#"{"choices":[{"delta":{"content":"Let me check."}}]}"#));
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c","function":{"name":"sql_query","arguments":"{\"sql\":\"SELECT 1\"}"}}]}}]}"#,
        ));

        let turn = agg.finish().unwrap();
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.tool_calls.len(), 1);
    }

    #[test]
    fn test_empty_arguments_become_empty_object() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c","function":{"name":"finalize"}}]}}]}"#,
        ));

        let turn = agg.finish().unwrap();
        assert_eq!(turn.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn test_unparseable_arguments_fail() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c","function":{"name":"sql_query","arguments":"{\"sql\": oops"}}]}}]}"#,
        ));
        assert!(matches!(agg.finish(), Err(Error::Stream(_))));
    }

    #[test]
    fn test_nameless_call_fails() {
        let mut agg = TurnAggregator::new();
        agg.absorb(&chunk(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c","function":{"arguments":"{}"}}]}}]}"#,
        ));
        assert!(matches!(agg.finish(), Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn test_collect_turn_drains_stream() {
        let chunks = vec![
            Ok(chunk(r#"{"choices":[{"delta":{"content":"a"}}]}"#)),
            Ok(chunk(r#"{"choices":[{"delta":{"content":"b"}}]}"#)),
        ];
        let turn = collect_turn(futures::stream::iter(chunks)).await.unwrap();
        assert_eq!(turn.text, "ab");
    }

    #[tokio::test]
    async fn test_collect_turn_propagates_errors() {
        let chunks: Vec<Result<ChatChunk>> = vec![
            Ok(chunk(r#"{"choices":[{"delta":{"content":"a"}}]}"#)),
            Err(Error::stream("connection reset")),
        ];
        assert!(collect_turn(futures::stream::iter(chunks)).await.is_err());
    }
}
