//! Backends the CLI can build from an `[[agents]]` entry.

use crate::config::AgentEntry;
use agentfarm_core::{AgentBackend, BackendResponse, FarmError, FarmResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Posts the task payload as JSON to an HTTP endpoint (an automation
/// webhook, a model gateway, ...) and reads the reply.
///
/// A JSON reply with an `output` field uses that field as the output and
/// picks up `tokens_used` (or `tokens`) and `cost` when present. Any other
/// JSON reply is the output as a whole; a non-JSON body becomes a string.
pub struct WebhookBackend {
    http: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl WebhookBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentBackend for WebhookBackend {
    async fn call(&self, payload: &Value) -> FarmResult<BackendResponse> {
        let mut request = self.http.post(&self.endpoint).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| FarmError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FarmError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(FarmError::Http(format!("HTTP {status}: {text}")));
        }

        debug!(endpoint = %self.endpoint, bytes = text.len(), "Webhook replied");
        Ok(parse_reply(&text))
    }
}

fn parse_reply(text: &str) -> BackendResponse {
    let Ok(body) = serde_json::from_str::<Value>(text) else {
        return BackendResponse::new(text.to_string());
    };
    let Some(obj) = body.as_object() else {
        return BackendResponse::new(body);
    };
    let Some(output) = obj.get("output") else {
        return BackendResponse::new(body);
    };

    let mut response = BackendResponse::new(output.clone());
    if let Some(tokens) = obj
        .get("tokens_used")
        .or_else(|| obj.get("tokens"))
        .and_then(Value::as_u64)
    {
        response = response.with_tokens(tokens);
    }
    if let Some(cost) = obj.get("cost").and_then(Value::as_f64) {
        response = response.with_cost(cost);
    }
    response
}

/// Answers every call with `{"agent": <id>, "echo": <payload>}`.
pub struct EchoBackend {
    agent_id: String,
}

impl EchoBackend {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn call(&self, payload: &Value) -> FarmResult<BackendResponse> {
        Ok(BackendResponse::new(serde_json::json!({
            "agent": self.agent_id,
            "echo": payload,
        })))
    }
}

/// Build the backend an `[[agents]]` entry describes.
pub fn build_backend(entry: &AgentEntry) -> Arc<dyn AgentBackend> {
    let Some(endpoint) = &entry.endpoint else {
        return Arc::new(EchoBackend::new(&entry.agent.id));
    };

    let mut backend = WebhookBackend::new(endpoint);
    if let Some(var) = &entry.auth_token_env {
        match std::env::var(var) {
            Ok(token) => backend = backend.with_auth_token(token),
            Err(_) => warn!(
                agent_id = %entry.agent.id,
                env = %var,
                "Auth token variable not set, calling without credentials"
            ),
        }
    }
    Arc::new(backend)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentfarm_orchestrator::AgentConfig;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_reads_output_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/claude"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"prompt": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "hello there",
                "tokens": 17,
                "cost": 0.004,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(format!("{}/webhook/claude", server.uri()))
            .with_auth_token("secret");
        let resp = backend.call(&json!({"prompt": "hi"})).await.unwrap();

        assert_eq!(resp.output, json!("hello there"));
        assert_eq!(resp.tokens_used, Some(17));
        assert_eq!(resp.cost, Some(0.004));
    }

    #[tokio::test]
    async fn test_webhook_without_output_field_returns_whole_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"answer": 42, "confidence": 8})),
            )
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(server.uri());
        let resp = backend.call(&json!("q")).await.unwrap();
        assert_eq!(resp.output["answer"], 42);
        assert!(resp.tokens_used.is_none());
    }

    #[tokio::test]
    async fn test_webhook_plain_text_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Confidence: 7. Paris."))
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(server.uri());
        let resp = backend.call(&json!("capital of France")).await.unwrap();
        assert_eq!(resp.output, json!("Confidence: 7. Paris."));
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(server.uri());
        let err = backend.call(&json!({})).await.unwrap_err();
        match err {
            FarmError::Http(msg) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_http_error() {
        let backend = WebhookBackend::new("http://127.0.0.1:1/none");
        let err = backend.call(&json!({})).await.unwrap_err();
        assert!(matches!(err, FarmError::Http(_)));
    }

    #[tokio::test]
    async fn test_echo_backend() {
        let backend = EchoBackend::new("local");
        let resp = backend.call(&json!({"x": 1})).await.unwrap();
        assert_eq!(resp.output["agent"], "local");
        assert_eq!(resp.output["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_build_backend_without_endpoint_echoes() {
        let entry = AgentEntry {
            agent: AgentConfig::new("solo", "Solo"),
            endpoint: None,
            auth_token_env: None,
        };
        let backend = build_backend(&entry);
        let resp = backend.call(&json!("ping")).await.unwrap();
        assert_eq!(resp.output["agent"], "solo");
    }

    #[test]
    fn test_parse_reply_ignores_non_numeric_usage() {
        let resp = parse_reply(r#"{"output": "ok", "tokens": "many"}"#);
        assert_eq!(resp.output, json!("ok"));
        assert!(resp.tokens_used.is_none());
    }
}
