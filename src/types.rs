//! Core type definitions shared across the service.
//!
//! Two families live here:
//!
//! 1. **Domain types**: sessions, stored messages, dataset files. These are
//!    what the store persists and the REST surface returns.
//! 2. **Wire types**: the OpenAI-compatible chat completions request and
//!    streamed chunk formats, plus [`ModelTurn`], the aggregated result of
//!    one model call that the agent loop consumes.
//!
//! Keeping the wire format separate from the domain means the model provider
//! can change without touching persistence or transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Opaque session identifier, assigned by the upload collaborator.
pub type SessionId = String;

/// Opaque user identifier, produced by credential verification.
pub type UserId = String;

// ============================================================================
// MESSAGES
// ============================================================================

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions injected by the service.
    System,
    /// Input typed by the human.
    User,
    /// Output produced by the model, directly or through a tool.
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(Error::invalid_input(format!("unknown role: {other}"))),
        }
    }
}

/// What a stored message contains.
///
/// `Internal` messages are model reasoning: replayed into the model context
/// on later turns, never streamed to the client and never returned on
/// restore. `QueryResult` messages are persisted for context replay but
/// excluded from restore as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Table,
    Plot,
    QueryResult,
    Internal,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Table => "table",
            MessageKind::Plot => "plot",
            MessageKind::QueryResult => "query_result",
            MessageKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MessageKind::Text),
            "table" => Ok(MessageKind::Table),
            "plot" => Ok(MessageKind::Plot),
            "query_result" => Ok(MessageKind::QueryResult),
            "internal" => Ok(MessageKind::Internal),
            other => Err(Error::invalid_input(format!("unknown kind: {other}"))),
        }
    }

    /// Kinds returned to clients on session restore.
    pub fn visible_on_restore(self) -> bool {
        !matches!(self, MessageKind::QueryResult | MessageKind::Internal)
    }
}

/// One persisted chat turn fragment.
///
/// Identifiers are monotonically increasing within a session; listing order
/// is insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: MessageRole,
    pub kind: MessageKind,
    pub body: String,
    /// Structured payload for `table`/`plot`/`query_result` kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// SESSIONS & DATASETS
// ============================================================================

/// Session metadata as persisted (dataset profile lives alongside it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub user_id: UserId,
    pub title: Option<String>,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Supported dataset formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Csv,
    Parquet,
}

/// Handle to a session's immutable dataset file on disk.
#[derive(Debug, Clone)]
pub struct DatasetFile {
    pub path: PathBuf,
    pub format: DatasetFormat,
}

impl DatasetFile {
    /// Build a handle from a path, inferring the format from the extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("csv") => DatasetFormat::Csv,
            Some("parquet") => DatasetFormat::Parquet,
            other => {
                return Err(Error::invalid_input(format!(
                    "unsupported dataset extension: {other:?}"
                )));
            }
        };
        Ok(DatasetFile { path, format })
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().unwrap_or_default()
    }
}

/// Fixed name the dataset is stored under inside a session directory.
pub fn dataset_file_name(original: &str) -> String {
    let ext = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv");
    format!("original.{ext}")
}

// ============================================================================
// MODEL WIRE FORMAT (OpenAI-compatible)
// ============================================================================

/// One message in a chat completions request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant message that carries tool calls the model issued.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<WireToolCall>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
        }
    }

    /// Tool-role message feeding a result back for a specific call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A completed tool call in assistant-message form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded argument object, as the API transmits it.
    pub arguments: String,
}

/// Chat completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

/// One streamed chunk of a chat completions response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental update within a streamed choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Partial tool call; fields arrive spread over several chunks.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// ============================================================================
// AGGREGATED MODEL OUTPUT
// ============================================================================

/// A fully-assembled tool invocation from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Everything one model call produced, after delta aggregation.
///
/// `text` is the assistant's free-form content (empty if the model only
/// called tools). An empty `tool_calls` means the model ended its turn.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolRequest>,
}

impl ModelTurn {
    /// The model produced no tool call: treat as an end-of-turn signal.
    pub fn is_end_of_turn(&self) -> bool {
        self.tool_calls.is_empty()
    }
}
