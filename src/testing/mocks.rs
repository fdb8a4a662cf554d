//! Mock implementations for testing
//!
//! Provides a scripted [`InferenceService`] and a canned [`LlmProvider`] so that
//! sessions can be driven end to end without a model backend.

use crate::inference::{InferenceError, InferenceRequest, InferenceService, InferenceStage};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Scripted answer for one inference call
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(Value),
    Fail(InferenceError),
    /// Sleep before replying; lets tests trip timeouts
    Delayed(Duration, Value),
}

/// Inference service answering from per-stage scripts
///
/// Each stage pops its queue in order and keeps repeating the last entry once
/// the queue is down to one. A stage with no script fails as unavailable.
#[derive(Debug, Default)]
pub struct MockInferenceService {
    scripts: Mutex<HashMap<InferenceStage, VecDeque<Scripted>>>,
    pub requests: Arc<Mutex<Vec<InferenceRequest>>>,
}

impl MockInferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every call of `stage` with `value`
    pub fn with_reply(self, stage: InferenceStage, value: Value) -> Self {
        self.with_script(stage, vec![Scripted::Reply(value)])
    }

    pub fn with_failure(self, stage: InferenceStage, error: InferenceError) -> Self {
        self.with_script(stage, vec![Scripted::Fail(error)])
    }

    pub fn with_script(self, stage: InferenceStage, script: Vec<Scripted>) -> Self {
        self.scripts
            .try_lock()
            .map(|mut scripts| {
                scripts.insert(stage, script.into());
            })
            .ok();
        self
    }

    pub async fn calls(&self, stage: InferenceStage) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|request| request.stage == stage)
            .count()
    }
}

#[async_trait]
impl InferenceService for MockInferenceService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let stage = request.stage;
        self.requests.lock().await.push(request);

        let next = {
            let mut scripts = self.scripts.lock().await;
            match scripts.get_mut(&stage) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match next {
            Some(Scripted::Reply(value)) => Ok(value),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Delayed(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Err(InferenceError::Unavailable(format!(
                "no script for {stage} stage"
            ))),
        }
    }
}

/// Classification stage body
pub fn classification_reply(label: &str, confidence: f64, risk_score: f64) -> Value {
    json!({
        "label": label,
        "confidence": confidence,
        "risk_score": risk_score,
        "evidence": [format!("mock evidence for {label}")],
        "categories": [],
        "rationale": "scripted",
    })
}

/// Decomposition stage body listing `task_types` in order
pub fn plan_reply(task_types: &[&str]) -> Value {
    let tasks: Vec<Value> = task_types
        .iter()
        .map(|task_type| json!({ "task_type": task_type, "priority": 5, "focus": "" }))
        .collect();
    json!({ "tasks": tasks })
}

/// Arbitration stage body
pub fn arbitration_reply(final_decision: &str, confidence_score: f64) -> Value {
    json!({
        "final_decision": final_decision,
        "confidence_score": confidence_score,
        "reasoning": "scripted verdict",
        "evidence": { "supporting": [], "conflicting": [] },
        "risk_assessment": { "risk_level": "low", "primary_risks": [] },
        "recommendations": [],
        "requires_escalation": false,
    })
}

/// Mock LLM provider cycling through canned completions
#[derive(Debug, Clone)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<Mutex<usize>>,
    pub should_fail: bool,
    pub received: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(Mutex::new(0)),
            should_fail: false,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new(vec![])
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn available_models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.received.lock().await.push(request);
        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let mut current = self.current_response.lock().await;
        let content = match self.responses.get(*current % self.responses.len().max(1)) {
            Some(content) => content.clone(),
            None => "Mock response".to_string(),
        };
        *current += 1;

        Ok(CompletionResponse {
            content: Some(content),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.should_fail {
            Err(LlmError::RequestFailed(
                "Mock health check failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}
