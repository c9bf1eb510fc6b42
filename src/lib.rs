//! # tabula
//!
//! A multi-user service that answers natural-language questions about an
//! uploaded tabular dataset (CSV or Parquet). Each session owns one dataset;
//! a tool-calling model agent answers questions by running read-only SQL
//! against it and streaming text, tables and chart specs back to the client
//! over a WebSocket.
//!
//! ## Architecture
//!
//! One turn flows through the modules like this:
//!
//! ```text
//! WebSocket (server) ──► SessionRuntime (session) ──► AgentLoop (agent)
//!                                                         │
//!                     ┌──── context builder (context) ◄───┤
//!                     │                                    │
//!                  model call (llm + sse + retry)          │
//!                     │                                    │
//!                  tool dispatch (tools) ──► QueryEngine (guard + engine)
//!                     │
//!                  events out (events) + persistence (store)
//! ```
//!
//! The persisted message log is the only conversation state: model context
//! is rebuilt from it every turn, and restores and reconnects read it too.
//!
//! ## Module map
//!
//! - **agent**: the bounded tool-calling state machine driving one turn
//! - **auth**: bearer credential verification
//! - **config**: environment-driven settings
//! - **context**: system prompts, data summaries, context replay
//! - **engine**: read-only SQL execution over the session dataset
//! - **events**: transport envelopes and the per-session event sink
//! - **guard**: SQL policy validation (token scan)
//! - **llm**: model client trait and the OpenAI-compatible implementation
//! - **profile**: dataset profiling at upload time
//! - **retry**: backoff with full jitter for model requests
//! - **server**: REST + WebSocket surface
//! - **session**: per-session runtime and registry
//! - **sse**: streamed response parsing and delta aggregation
//! - **store**: SQLite persistence of sessions and messages
//! - **tools**: the closed tool set the model may invoke

pub mod agent;
pub mod auth;
pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod guard;
pub mod llm;
pub mod profile;
pub mod retry;
pub mod server;
pub mod session;
pub mod sse;
pub mod store;
pub mod tools;
pub mod types;

mod error;

pub use error::{Error, Result};

/// The most commonly used types, importable in one line.
pub mod prelude {
    pub use crate::agent::{AgentLoop, TurnEnd, TurnTrigger};
    pub use crate::auth::TokenVerifier;
    pub use crate::config::Settings;
    pub use crate::engine::{CellValue, QueryEngine, QueryOutput};
    pub use crate::events::{ClientMessage, EventSink, ServerEvent};
    pub use crate::llm::{ModelClient, OpenAiClient};
    pub use crate::profile::DatasetProfile;
    pub use crate::server::{AppState, router};
    pub use crate::session::SessionManager;
    pub use crate::store::MessageStore;
    pub use crate::types::{DatasetFile, MessageKind, MessageRole, SessionId, UserId};
    pub use crate::{Error, Result};
}
