//! Integration tests for the OpenAI-compatible provider
//!
//! Behavioural contracts only:
//! - successful completions and usage accounting
//! - JSON response format on the wire
//! - retry on server errors, no retry on client errors
//! - health check against the models endpoint

use agentmesh::llm::provider::{
    ChatMessage, CompletionRequest, FinishReason, LlmError, LlmProvider, ResponseFormat,
};
use agentmesh::llm::providers::openai::{OpenAiConfig, OpenAiProvider};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new(OpenAiConfig {
        api_key: "test-api-key".to_string(),
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn request() -> CompletionRequest {
    let mut request = CompletionRequest::new(
        "gpt-4o-mini",
        vec![
            ChatMessage::system("You classify content."),
            ChatMessage::user("Is this toxic?"),
        ],
    );
    request.max_tokens = Some(200);
    request
}

fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
    json!({
        "model": "gpt-4o-mini",
        "choices": [{
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20 }
    })
}

#[tokio::test]
async fn test_successful_completion_reports_content_and_usage() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"label\":\"safe\"}", "stop")))
        .mount(&server)
        .await;

    // Act
    let response = provider_for(&server).complete(request()).await.unwrap();

    // Assert
    assert_eq!(response.content.as_deref(), Some("{\"label\":\"safe\"}"));
    assert_eq!(response.usage.total_tokens, 20);
    assert_eq!(response.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_json_response_format_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "response_format": { "type": "json_object" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("{}", "stop")))
        .expect(1)
        .mount(&server)
        .await;

    let mut json_request = request();
    json_request.response_format = ResponseFormat::Json;

    let result = provider_for(&server).complete(json_request).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("after retry", "length")))
        .mount(&server)
        .await;

    let response = provider_for(&server).complete(request()).await.unwrap();

    assert_eq!(response.content.as_deref(), Some("after retry"));
    assert_eq!(response.finish_reason, FinishReason::Length);
}

#[tokio::test]
async fn test_persistent_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(4)
        .mount(&server)
        .await;

    let result = provider_for(&server).complete(request()).await;

    assert!(matches!(result, Err(LlmError::ApiError(_))));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let result = provider_for(&server).complete(request()).await;

    match result {
        Err(LlmError::ApiError(message)) => assert!(message.contains("400")),
        other => panic!("expected ApiError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = provider_for(&server).complete(request()).await;

    assert!(matches!(result, Err(LlmError::AuthenticationFailed(_))));
}

#[tokio::test]
async fn test_empty_choices_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": []
        })))
        .mount(&server)
        .await;

    let result = provider_for(&server).complete(request()).await;

    assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_health_check_uses_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    assert!(provider_for(&server).health_check().await.is_ok());
}

#[tokio::test]
async fn test_health_check_fails_on_rejected_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    assert!(provider_for(&server).health_check().await.is_err());
}
