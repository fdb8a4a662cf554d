//! OpenAI-compatible chat-completions provider
//!
//! Works against api.openai.com or any server exposing the same
//! `/chat/completions` endpoint (set `base_url`).

use crate::llm::provider::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, FinishReason, LlmError,
    LlmProvider, ResponseFormat, TokenUsage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

const BACKOFF_DELAYS_MS: [u64; 3] = [100, 200, 300];

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn convert_message(message: &ChatMessage) -> WireMessage {
        let role = match message.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        WireMessage {
            role: role.to_string(),
            content: Some(message.content.clone()),
        }
    }

    fn build_request(request: &CompletionRequest) -> WireRequest {
        let format_type = match request.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::Json => Some(WireResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        WireRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: format_type,
        }
    }

    fn parse_response(
        response: WireResponse,
        metadata: HashMap<String, String>,
    ) -> Result<CompletionResponse, LlmError> {
        let Some(choice) = response.choices.into_iter().next() else {
            return Err(LlmError::InvalidResponse(
                "No choices returned from OpenAI".to_string(),
            ));
        };

        Ok(CompletionResponse {
            content: choice.message.content,
            model: response.model,
            usage: response
                .usage
                .map(|u| TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                })
                .unwrap_or_default(),
            finish_reason: Self::convert_finish_reason(choice.finish_reason.as_deref()),
            metadata,
        })
    }

    fn convert_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    fn should_retry(error: &LlmError) -> bool {
        match error {
            LlmError::NetworkError(_) => true,
            LlmError::ApiError(msg) => msg.contains("server error"),
            _ => false,
        }
    }

    async fn complete_with_retry(
        &self,
        wire_request: WireRequest,
        metadata: HashMap<String, String>,
    ) -> Result<CompletionResponse, LlmError> {
        let mut last_error = None;

        for (attempt, &delay_ms) in std::iter::once(&0u64)
            .chain(BACKOFF_DELAYS_MS.iter())
            .enumerate()
        {
            if attempt > 0 {
                debug!(attempt, delay_ms, "Retrying OpenAI request");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.send_once(&wire_request).await {
                Ok(response) => {
                    let response = Self::parse_response(response, metadata)?;
                    debug!(
                        total_tokens = response.usage.total_tokens,
                        finish_reason = ?response.finish_reason,
                        retries = attempt,
                        "OpenAI completion finished"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "OpenAI request failed");
                    if !Self::should_retry(&e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        error!("OpenAI request failed after all retries");
        Err(last_error
            .unwrap_or_else(|| LlmError::NetworkError("All retry attempts failed".to_string())))
    }

    async fn send_once(&self, wire_request: &WireRequest) -> Result<WireResponse, LlmError> {
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(wire_request)
            .send()
            .await
            .map_err(|e| {
                LlmError::NetworkError(format!(
                    "HTTP request failed: {e} (is_connect: {}, is_timeout: {})",
                    e.is_connect(),
                    e.is_timeout()
                ))
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!(
                "OpenAI API server error: {status} - {body}"
            )));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LlmError::AuthenticationFailed(format!(
                "OpenAI API rejected credentials: {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!("OpenAI API error: {status} - {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn available_models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let wire_request = Self::build_request(&request);
        debug!(
            model = %wire_request.model,
            messages = wire_request.messages.len(),
            "Sending OpenAI completion"
        );
        self.complete_with_retry(wire_request, request.metadata).await
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(self.endpoint("models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::AuthenticationFailed(
                "OpenAI API authentication failed".to_string(),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(OpenAiConfig {
            api_key: "test-key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_provider_requires_api_key() {
        let result = OpenAiProvider::new(OpenAiConfig::default());
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_endpoint_tolerates_trailing_slash() {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: "k".to_string(),
            base_url: "http://localhost:9000/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            provider.endpoint("chat/completions"),
            "http://localhost:9000/v1/chat/completions"
        );
    }

    #[test]
    fn test_json_format_is_requested_as_json_object() {
        let mut request = CompletionRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        request.response_format = ResponseFormat::Json;

        let json = serde_json::to_value(OpenAiProvider::build_request(&request)).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_text_format_is_omitted() {
        let request = CompletionRequest::new("gpt-4o-mini", vec![ChatMessage::system("s")]);
        let json = serde_json::to_value(OpenAiProvider::build_request(&request)).unwrap();
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn test_finish_reason_conversion() {
        assert_eq!(OpenAiProvider::convert_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(OpenAiProvider::convert_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(OpenAiProvider::convert_finish_reason(None), FinishReason::Error);
    }

    #[test]
    fn test_only_transient_errors_are_retried() {
        assert!(OpenAiProvider::should_retry(&LlmError::NetworkError("x".into())));
        assert!(OpenAiProvider::should_retry(&LlmError::ApiError(
            "OpenAI API server error: 502".into()
        )));
        assert!(!OpenAiProvider::should_retry(&LlmError::ApiError("OpenAI API error: 400".into())));
        assert!(!OpenAiProvider::should_retry(&LlmError::InvalidResponse("x".into())));
    }

    #[test]
    fn test_provider_name_and_models() {
        let provider = provider();
        assert_eq!(provider.name(), "openai");
        assert!(provider.available_models().contains(&"gpt-4o-mini".to_string()));
    }
}
