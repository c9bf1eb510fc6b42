//! Runtime settings for the service.
//!
//! Everything the service needs at startup comes from environment variables,
//! so the same binary runs unchanged in development and behind a process
//! supervisor. [`Settings::from_env`] reads the `TABULA_*` variables;
//! [`Settings::from_lookup`] takes an arbitrary lookup function so tests can
//! construct settings without touching the process environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `TABULA_BIND_ADDR` | `127.0.0.1:8080` | Listen address |
//! | `TABULA_DATA_DIR` | `./data` | Root for per-session dataset directories |
//! | `TABULA_SIGNING_SECRET` | *(required)* | Secret for bearer-token verification |
//! | `TABULA_TOKEN_TTL_SECS` | `86400` | Credential lifetime |
//! | `TABULA_LLM_BASE_URL` | `http://localhost:1234/v1` | OpenAI-compatible endpoint |
//! | `TABULA_LLM_API_KEY` | `not-needed` | Bearer key for the endpoint |
//! | `TABULA_LLM_MODEL` | *(required)* | Model identifier |
//! | `TABULA_LLM_TIMEOUT_SECS` | `60` | Per-attempt model request deadline |
//! | `TABULA_MAX_ITERATIONS` | `15` | Tool-loop iteration cap per turn |
//! | `TABULA_MAX_TURN_SECS` | `600` | Whole-turn wall-clock cap |
//! | `TABULA_MAX_RESULT_ROWS` | `50` | Row cap for query tool results |
//! | `TABULA_MAX_PLOT_ROWS` | `100` | Row cap for plot source data |
//! | `TABULA_SQL_TIMEOUT_SECS` | `10` | Per-query wall-clock deadline |
//! | `TABULA_CONTEXT_TOKEN_BUDGET` | `24000` | Estimated-token cap for model context |
//! | `TABULA_PROFILE_SAMPLE_ROWS` | `500` | Rows sampled when profiling an upload |
//! | `TABULA_MAX_UPLOAD_BYTES` | `52428800` | Upload size accepted at registration |
//! | `TABULA_EVENT_BUFFER` | `256` | Per-session in-flight event cap |

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Immutable service configuration, shared across all sessions.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address for the HTTP/WebSocket server.
    pub bind_addr: String,

    /// Root directory holding one subdirectory per session.
    pub data_dir: String,

    /// Secret used to verify bearer credentials.
    pub signing_secret: String,

    /// Lifetime of an issued credential.
    pub token_ttl: Duration,

    /// OpenAI-compatible chat completions endpoint.
    pub llm_base_url: String,

    /// API key sent as a bearer header to the model endpoint.
    pub llm_api_key: String,

    /// Model identifier.
    pub llm_model: String,

    /// Deadline for a single model request attempt (retries excluded).
    pub llm_timeout: Duration,

    /// Maximum model-call iterations within one turn.
    pub max_iterations: u32,

    /// Wall-clock cap for a whole turn.
    pub max_turn_duration: Duration,

    /// Row cap for `sql_query` tool results.
    pub max_result_rows: usize,

    /// Row cap for plot source data.
    pub max_plot_rows: usize,

    /// Wall-clock deadline for one SQL execution.
    pub sql_timeout: Duration,

    /// Estimated-token budget for the replayed model context.
    pub context_token_budget: usize,

    /// Number of rows sampled into the dataset profile at upload time.
    pub profile_sample_rows: usize,

    /// Largest upload the registration path accepts, in bytes.
    pub max_upload_bytes: u64,

    /// Bound on buffered-but-unsent events per session.
    pub event_buffer: usize,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    ///
    /// Missing optional keys fall back to defaults; `TABULA_SIGNING_SECRET`
    /// and `TABULA_LLM_MODEL` are required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let signing_secret = lookup("TABULA_SIGNING_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::config("TABULA_SIGNING_SECRET is required"))?;

        let llm_model = lookup("TABULA_LLM_MODEL")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::config("TABULA_LLM_MODEL is required"))?;

        let llm_base_url = lookup("TABULA_LLM_BASE_URL")
            .unwrap_or_else(|| "http://localhost:1234/v1".to_string());
        if !llm_base_url.starts_with("http://") && !llm_base_url.starts_with("https://") {
            return Err(Error::config(
                "TABULA_LLM_BASE_URL must start with http:// or https://",
            ));
        }

        let settings = Settings {
            bind_addr: lookup("TABULA_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            data_dir: lookup("TABULA_DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            signing_secret,
            token_ttl: Duration::from_secs(parse_or(&lookup, "TABULA_TOKEN_TTL_SECS", 86_400)?),
            llm_base_url,
            llm_api_key: lookup("TABULA_LLM_API_KEY").unwrap_or_else(|| "not-needed".to_string()),
            llm_model,
            llm_timeout: Duration::from_secs(parse_or(&lookup, "TABULA_LLM_TIMEOUT_SECS", 60)?),
            max_iterations: parse_or(&lookup, "TABULA_MAX_ITERATIONS", 15)?,
            max_turn_duration: Duration::from_secs(parse_or(&lookup, "TABULA_MAX_TURN_SECS", 600)?),
            max_result_rows: parse_or(&lookup, "TABULA_MAX_RESULT_ROWS", 50)?,
            max_plot_rows: parse_or(&lookup, "TABULA_MAX_PLOT_ROWS", 100)?,
            sql_timeout: Duration::from_secs(parse_or(&lookup, "TABULA_SQL_TIMEOUT_SECS", 10)?),
            context_token_budget: parse_or(&lookup, "TABULA_CONTEXT_TOKEN_BUDGET", 24_000)?,
            profile_sample_rows: parse_or(&lookup, "TABULA_PROFILE_SAMPLE_ROWS", 500)?,
            max_upload_bytes: parse_or(&lookup, "TABULA_MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            event_buffer: parse_or(&lookup, "TABULA_EVENT_BUFFER", 256)?,
        };

        if settings.max_iterations == 0 {
            return Err(Error::config("TABULA_MAX_ITERATIONS must be at least 1"));
        }
        if settings.max_result_rows == 0 || settings.max_plot_rows == 0 {
            return Err(Error::config("row caps must be at least 1"));
        }
        if settings.event_buffer == 0 {
            return Err(Error::config("TABULA_EVENT_BUFFER must be at least 1"));
        }

        Ok(settings)
    }
}

/// Parse an optional variable, falling back to a default when absent.
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("{key} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TABULA_SIGNING_SECRET", "test-secret"),
            ("TABULA_LLM_MODEL", "qwen2.5-32b-instruct"),
        ])
    }

    fn build(env: &HashMap<&str, &str>) -> Result<Settings> {
        Settings::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let settings = build(&base_env()).unwrap();

        assert_eq!(settings.bind_addr, "127.0.0.1:8080");
        assert_eq!(settings.max_iterations, 15);
        assert_eq!(settings.max_result_rows, 50);
        assert_eq!(settings.max_plot_rows, 100);
        assert_eq!(settings.sql_timeout, Duration::from_secs(10));
        assert_eq!(settings.llm_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_turn_duration, Duration::from_secs(600));
        assert_eq!(settings.context_token_budget, 24_000);
        assert_eq!(settings.event_buffer, 256);
        assert_eq!(settings.llm_api_key, "not-needed");
    }

    #[test]
    fn test_signing_secret_required() {
        let mut env = base_env();
        env.remove("TABULA_SIGNING_SECRET");
        assert!(matches!(build(&env), Err(Error::Config(_))));

        env.insert("TABULA_SIGNING_SECRET", "   ");
        assert!(matches!(build(&env), Err(Error::Config(_))));
    }

    #[test]
    fn test_model_required() {
        let mut env = base_env();
        env.remove("TABULA_LLM_MODEL");
        assert!(matches!(build(&env), Err(Error::Config(_))));
    }

    #[test]
    fn test_base_url_scheme_validated() {
        let mut env = base_env();
        env.insert("TABULA_LLM_BASE_URL", "localhost:1234");
        assert!(matches!(build(&env), Err(Error::Config(_))));

        env.insert("TABULA_LLM_BASE_URL", "https://api.example.com/v1");
        assert!(build(&env).is_ok());
    }

    #[test]
    fn test_overrides_parsed() {
        let mut env = base_env();
        env.insert("TABULA_MAX_ITERATIONS", "2");
        env.insert("TABULA_MAX_RESULT_ROWS", "5");
        env.insert("TABULA_SQL_TIMEOUT_SECS", "3");

        let settings = build(&env).unwrap();
        assert_eq!(settings.max_iterations, 2);
        assert_eq!(settings.max_result_rows, 5);
        assert_eq!(settings.sql_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_garbage_numeric_rejected() {
        let mut env = base_env();
        env.insert("TABULA_MAX_ITERATIONS", "many");
        assert!(matches!(build(&env), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_caps_rejected() {
        let mut env = base_env();
        env.insert("TABULA_MAX_ITERATIONS", "0");
        assert!(matches!(build(&env), Err(Error::Config(_))));

        let mut env = base_env();
        env.insert("TABULA_MAX_RESULT_ROWS", "0");
        assert!(matches!(build(&env), Err(Error::Config(_))));
    }
}
