//! Inference Service backed by a chat-completions LLM

use super::{extract_json_object, InferenceError, InferenceRequest, InferenceService, InferenceStage};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, ResponseFormat};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmInferenceConfig {
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl Default for LlmInferenceConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(20),
            max_tokens: 1500,
        }
    }
}

pub struct LlmInference {
    provider: Arc<dyn LlmProvider>,
    config: LlmInferenceConfig,
}

impl LlmInference {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmInferenceConfig) -> Self {
        Self { provider, config }
    }

    fn system_prompt(stage: InferenceStage) -> &'static str {
        match stage {
            InferenceStage::Decomposition => {
                "You are the task router of a content moderation system. Decide which \
                 analysis tasks the content needs. Valid task types: content_analysis, \
                 semantic_analysis, sentiment_analysis, context_analysis, \
                 toxicity_detection, pattern_recognition, risk_assessment. Answer with one \
                 JSON object: {\"tasks\": [{\"task_type\", \"priority\" (1-10, higher is \
                 more urgent), \"focus\", \"dependencies\"}]}."
            }
            InferenceStage::Classification => {
                "You are a specialist content moderation analyst. Judge the content for \
                 the requested analysis. Answer with one JSON object: {\"label\", \
                 \"confidence\" (0-1), \"risk_score\" (0-1), \"evidence\" (list), \
                 \"categories\" (list), \"rationale\"}."
            }
            InferenceStage::Arbitration => {
                "You are the final arbitrator of a content moderation system. Weigh the \
                 specialist findings and the consensus summary. When uncertain, prefer the \
                 conservative decision. Answer with one JSON object: {\"final_decision\" \
                 (approved|rejected|needs_human_review), \"confidence_score\" (0-1), \
                 \"reasoning\", \"evidence\": {\"supporting\", \"conflicting\"}, \
                 \"risk_assessment\": {\"risk_level\", \"primary_risks\"}, \
                 \"recommendations\" (list), \"requires_escalation\", \"escalation_reason\"}."
            }
        }
    }

    fn build_request(&self, request: &InferenceRequest) -> CompletionRequest {
        let mut user_prompt = request.prompt.clone();
        if !request.context.is_null() {
            let context = serde_json::to_string_pretty(&request.context)
                .unwrap_or_else(|_| request.context.to_string());
            user_prompt.push_str("\n\nContext:\n");
            user_prompt.push_str(&context);
        }

        let mut completion = CompletionRequest::new(
            self.config.model.clone(),
            vec![
                ChatMessage::system(Self::system_prompt(request.stage)),
                ChatMessage::user(user_prompt),
            ],
        );
        completion.max_tokens = Some(self.config.max_tokens);
        completion.temperature = Some(match request.stage {
            InferenceStage::Arbitration => 0.05,
            _ => 0.1,
        });
        completion.response_format = ResponseFormat::Json;
        completion
            .metadata
            .insert("stage".to_string(), request.stage.as_str().to_string());
        completion
    }
}

#[async_trait]
impl InferenceService for LlmInference {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let completion = self.build_request(&request);
        debug!(stage = %request.stage, model = %self.config.model, "Calling inference model");

        let response = tokio::time::timeout(self.config.timeout, self.provider.complete(completion))
            .await
            .map_err(|_| InferenceError::Timeout(self.config.timeout.as_millis() as u64))??;

        let content = response
            .content
            .ok_or_else(|| InferenceError::Malformed("empty completion".to_string()))?;
        extract_json_object(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{CompletionResponse, FinishReason, LlmError, TokenUsage};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedProvider {
        reply: Result<Option<String>, LlmError>,
        delay: Duration,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn replying(content: &str) -> Self {
            Self {
                reply: Ok(Some(content.to_string())),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn available_models(&self) -> Vec<String> {
            vec!["scripted".to_string()]
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            let content = self.reply.clone()?;
            Ok(CompletionResponse {
                content,
                model: "scripted".to_string(),
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
                metadata: HashMap::new(),
            })
        }

        async fn health_check(&self) -> Result<(), LlmError> {
            Ok(())
        }
    }

    fn inference(provider: Arc<ScriptedProvider>) -> LlmInference {
        LlmInference::new(
            provider,
            LlmInferenceConfig {
                timeout: Duration::from_millis(200),
                ..LlmInferenceConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_extracts_object_from_reply() {
        let provider = Arc::new(ScriptedProvider::replying("```json\n{\"tasks\": []}\n```"));
        let service = inference(provider.clone());

        let value = service
            .infer(InferenceRequest::new(InferenceStage::Decomposition, "hello"))
            .await
            .unwrap();

        assert_eq!(value, serde_json::json!({"tasks": []}));
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].response_format, ResponseFormat::Json);
        assert_eq!(seen[0].metadata.get("stage").map(String::as_str), Some("decomposition"));
    }

    #[tokio::test]
    async fn test_context_is_appended_to_prompt() {
        let provider = Arc::new(ScriptedProvider::replying("{}"));
        let service = inference(provider.clone());
        let request = InferenceRequest::new(InferenceStage::Arbitration, "decide")
            .with_context(serde_json::json!({"consensus_score": 0.5}));

        service.infer(request).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        assert!(seen[0].messages[1].content.contains("consensus_score"));
        assert_eq!(seen[0].temperature, Some(0.05));
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let provider = Arc::new(ScriptedProvider {
            reply: Err(LlmError::ApiError("server error: 500".to_string())),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });

        let result = inference(provider)
            .infer(InferenceRequest::new(InferenceStage::Classification, "x"))
            .await;

        assert!(matches!(result, Err(InferenceError::Provider(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(ScriptedProvider {
            reply: Ok(Some("{}".to_string())),
            delay: Duration::from_secs(5),
            seen: Mutex::new(Vec::new()),
        });

        let result = inference(provider)
            .infer(InferenceRequest::new(InferenceStage::Classification, "x"))
            .await;

        assert_eq!(result, Err(InferenceError::Timeout(200)));
    }

    #[tokio::test]
    async fn test_empty_completion_is_malformed() {
        let provider = Arc::new(ScriptedProvider {
            reply: Ok(None),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });

        let result = inference(provider)
            .infer(InferenceRequest::new(InferenceStage::Classification, "x"))
            .await;

        assert!(matches!(result, Err(InferenceError::Malformed(_))));
    }
}
