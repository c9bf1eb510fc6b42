//! Error types for the tabula service

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the service.
///
/// Variants group into the failure classes the runtime distinguishes:
/// client input problems (`InvalidInput`, `Unauthorized`, `NotFound`,
/// `TurnActive`), SQL policy and execution failures (`SqlSyntax`,
/// `SqlForbidden`, `SqlExecution`, `SqlTimeout`), upstream model failures
/// (`Http`, `Api`, `Stream`, `Timeout`), and local infrastructure failures
/// (`Storage`, `Engine`, `Io`, `Json`, `Config`).
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request to the model endpoint failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error response from the model endpoint
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error while reading a model response
    #[error("Streaming error: {0}")]
    Stream(String),

    /// SQL rejected before execution: not parseable as a single query
    #[error("SQL syntax error: {0}")]
    SqlSyntax(String),

    /// SQL rejected by policy: write statement or foreign table reference
    #[error("SQL forbidden: {0}")]
    SqlForbidden(String),

    /// SQL accepted but failed during execution
    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    /// SQL exceeded its wall-clock deadline
    #[error("SQL query timed out")]
    SqlTimeout,

    /// Message/session store failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Analytical engine failure outside of query execution
    #[error("Engine error: {0}")]
    Engine(#[from] duckdb::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Credential missing, malformed, expired, or forged
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Session does not exist or is not owned by the caller
    #[error("Not found: {0}")]
    NotFound(String),

    /// A turn is already in progress for this session
    #[error("A turn is already in progress for this session")]
    TurnActive,

    /// Invalid input from the client
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model request exceeded its per-attempt deadline
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new syntax-rejection error
    pub fn sql_syntax(msg: impl Into<String>) -> Self {
        Error::SqlSyntax(msg.into())
    }

    /// Create a new policy-rejection error
    pub fn sql_forbidden(msg: impl Into<String>) -> Self {
        Error::SqlForbidden(msg.into())
    }

    /// Create a new execution error
    pub fn sql_execution(msg: impl Into<String>) -> Self {
        Error::SqlExecution(msg.into())
    }

    /// Create a new unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// True for SQL failures that are reported to the model as a tool result
    /// rather than terminating the turn.
    pub fn is_tool_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SqlSyntax(_)
                | Error::SqlForbidden(_)
                | Error::SqlExecution(_)
                | Error::SqlTimeout
                | Error::InvalidInput(_)
        )
    }
}
