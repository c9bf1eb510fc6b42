//! Model client.
//!
//! [`ModelClient`] is the seam between the agent loop and the model
//! provider: the loop hands over a message list and tool schemas, and gets
//! back one aggregated [`ModelTurn`]. Production uses [`OpenAiClient`]
//! against an OpenAI-compatible `/chat/completions` endpoint with streaming
//! enabled; tests script the trait directly.
//!
//! The per-attempt deadline lives here (the whole request, connect through
//! last chunk). Retry policy lives in the agent loop, on top of this.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::sse;
use crate::types::{ChatMessage, ChatRequest, ModelTurn};
use crate::{Error, Result};

/// Sampling temperature for analysis work; low to keep SQL reproducible.
const TEMPERATURE: f32 = 0.2;

/// One model call: context in, aggregated turn out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
    ) -> Result<ModelTurn>;
}

/// Streaming client for OpenAI-compatible endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        // No client-level timeout: it would cut off healthy long streams.
        // The deadline is applied per call around the full request instead.
        let http = reqwest::Client::builder().build().map_err(Error::Http)?;
        Ok(OpenAiClient {
            http,
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
            timeout: settings.llm_timeout,
        })
    }

    async fn request_turn(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
    ) -> Result<ModelTurn> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            max_tokens: None,
            temperature: Some(TEMPERATURE),
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::api(format!("{status}: {body}")));
        }

        sse::collect_turn(sse::chunk_stream(response)).await
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
    ) -> Result<ModelTurn> {
        match tokio::time::timeout(self.timeout, self.request_turn(messages, tools)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolRequest;
    use std::collections::HashMap;

    fn settings() -> Settings {
        let env = HashMap::from([
            ("TABULA_SIGNING_SECRET", "secret"),
            ("TABULA_LLM_MODEL", "test-model"),
            ("TABULA_LLM_BASE_URL", "http://localhost:9/v1/"),
            ("TABULA_LLM_TIMEOUT_SECS", "1"),
        ]);
        Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn test_client_normalizes_base_url() {
        let client = OpenAiClient::new(&settings()).unwrap();
        assert_eq!(client.base_url, "http://localhost:9/v1");
        assert_eq!(client.model, "test-model");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_http_error() {
        // Port 9 (discard) refuses connections; the failure must surface as
        // a retryable transport error, not a panic or hang.
        let client = OpenAiClient::new(&settings()).unwrap();
        let err = client.complete(vec![ChatMessage::user("hi")], vec![]).await;
        match err {
            Err(Error::Http(_)) | Err(Error::Timeout) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    /// Scripted client used by loop tests elsewhere; kept here to pin the
    /// trait object shape.
    struct Scripted;

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _tools: Vec<serde_json::Value>,
        ) -> Result<ModelTurn> {
            Ok(ModelTurn {
                text: "ok".into(),
                tool_calls: vec![ToolRequest {
                    id: "call_0".into(),
                    name: "finalize".into(),
                    arguments: serde_json::json!({}),
                }],
            })
        }
    }

    #[tokio::test]
    async fn test_trait_object_usage() {
        let client: std::sync::Arc<dyn ModelClient> = std::sync::Arc::new(Scripted);
        let turn = client.complete(vec![], vec![]).await.unwrap();
        assert_eq!(turn.tool_calls[0].name, "finalize");
    }
}
