use std::time::Duration;

use mode_core::config::AssistantConfig;
use mode_core::prompt::parse_reply;
use mode_core::prompt::ParsedReply;
use thiserror::Error;
use tracing::debug;

use crate::contracts::GenerateRequest;
use crate::contracts::GenerateResponse;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("AI service unavailable: {detail}")]
    Unavailable { detail: String },
    #[error("AI request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
}

/// Request/response access to the local inference service. Calls block; run them on a
/// worker thread.
pub trait ModelClient: Send + Sync {
    /// Sends a fully built prompt and parses the reply into explanation and candidate command.
    fn request_suggestion(&self, prompt: &str) -> Result<ParsedReply, ModelError>;

    /// True when the service answers its health endpoint.
    fn probe(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    endpoint: String,
    model: String,
    timeout: Duration,
    http: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ModelError::Unavailable {
                detail: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            http,
        })
    }

    pub fn from_config(config: &AssistantConfig) -> Result<Self, ModelError> {
        Self::new(
            &config.endpoint,
            &config.model,
            Duration::from_millis(config.model_timeout_ms),
        )
    }

    fn classify(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout {
                after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            ModelError::Unavailable {
                detail: err.to_string(),
            }
        }
    }
}

impl ModelClient for OllamaClient {
    fn request_suggestion(&self, prompt: &str) -> Result<ParsedReply, ModelError> {
        let url = format!("{}/api/generate", self.endpoint);
        debug!(%url, model = %self.model, prompt_len = prompt.len(), "model request");
        let response = self
            .http
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Unavailable {
                detail: format!("inference service returned {status}"),
            });
        }
        let body: GenerateResponse = response.json().map_err(|err| self.classify(err))?;
        Ok(parse_reply(body.response.trim()))
    }

    fn probe(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(PROBE_TIMEOUT.min(self.timeout))
            .send()
            .is_ok_and(|response| response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    async fn call(uri: String, timeout: Duration) -> Result<ParsedReply, ModelError> {
        tokio::task::spawn_blocking(move || {
            let client = OllamaClient::new(&uri, "test-model", timeout)?;
            client.request_suggestion("System: test\n\nUser: list files\n\nAssistant:")
        })
        .await
        .expect("blocking task")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parses_non_streaming_generate_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "test-model", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "test-model",
                "response": "This lists the files.\n```sh\nls -la\n```\n",
                "done": true,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = call(server.uri(), Duration::from_secs(5))
            .await
            .expect("reply");
        assert_eq!(
            reply,
            ParsedReply {
                explanation: "This lists the files.".to_string(),
                proposed_command: Some("ls -la".to_string()),
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_service_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = call(server.uri(), Duration::from_millis(100))
            .await
            .expect_err("times out");
        assert_eq!(err, ModelError::Timeout { after_ms: 100 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_status_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = call(server.uri(), Duration::from_secs(5))
            .await
            .expect_err("fails");
        assert!(matches!(err, ModelError::Unavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = call(server.uri(), Duration::from_secs(5))
            .await
            .expect_err("fails");
        assert!(matches!(err, ModelError::Unavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn probe_checks_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        let available = tokio::task::spawn_blocking(move || {
            OllamaClient::new(&uri, "test-model", Duration::from_secs(5))
                .map(|client| client.probe())
                .unwrap_or(false)
        })
        .await
        .expect("blocking task");
        assert!(available);
    }

    fn closed_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[test]
    fn refused_connection_is_unavailable() {
        let client = OllamaClient::new(&closed_endpoint(), "test-model", Duration::from_secs(2))
            .expect("client");
        let err = client.request_suggestion("hi").expect_err("refused");
        assert!(matches!(err, ModelError::Unavailable { .. }));
        assert!(!client.probe());
    }

    #[test]
    fn trailing_slash_in_endpoint_is_ignored() {
        let client = OllamaClient::new("http://localhost:11434/", "m", Duration::from_secs(1))
            .expect("client");
        assert_eq!(client.endpoint, "http://localhost:11434");
    }
}
