//! Inference Service contract
//!
//! Every place the mesh needs a content judgement (task decomposition, a worker's
//! classification, the arbitrator's verdict) goes through [`InferenceService`].
//! Callers never see an error from this layer: [`judge`] folds any failure,
//! timeout or malformed body into [`StageOutcome::Fallback`] so that each stage can
//! switch to its deterministic rule.

use crate::llm::LlmError;
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub mod llm;

pub use llm::{LlmInference, LlmInferenceConfig};

/// Which stage of a session is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStage {
    Decomposition,
    Classification,
    Arbitration,
}

impl InferenceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceStage::Decomposition => "decomposition",
            InferenceStage::Classification => "classification",
            InferenceStage::Arbitration => "arbitration",
        }
    }
}

impl fmt::Display for InferenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt-shaped request plus the structured context it refers to
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub stage: InferenceStage,
    pub prompt: String,
    pub context: Value,
}

impl InferenceRequest {
    pub fn new<S: Into<String>>(stage: InferenceStage, prompt: S) -> Self {
        Self {
            stage,
            prompt: prompt.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("Inference service unavailable: {0}")]
    Unavailable(String),
    #[error("Inference timed out after {0}ms")]
    Timeout(u64),
    #[error("Malformed inference response: {0}")]
    Malformed(String),
    #[error("Inference response missing required field '{0}'")]
    MissingField(String),
    #[error("Inference provider error: {0}")]
    Provider(#[from] LlmError),
}

/// External collaborator that performs content judgements
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Return the structured judgement for `request`, or any failure
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError>;
}

/// Used when no backend is configured; every stage falls back to its rules
#[derive(Debug, Default, Clone)]
pub struct RuleOnlyInference;

#[async_trait]
impl InferenceService for RuleOnlyInference {
    fn name(&self) -> &str {
        "rules"
    }

    async fn infer(&self, _request: InferenceRequest) -> Result<Value, InferenceError> {
        Err(InferenceError::Unavailable(
            "no inference backend configured".to_string(),
        ))
    }
}

/// Result of one inference-backed stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Judged(T),
    /// The stage must use its deterministic rule; carries the reason
    Fallback(String),
}

impl<T> StageOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutcome::Fallback(_))
    }

    pub fn judged(self) -> Option<T> {
        match self {
            StageOutcome::Judged(value) => Some(value),
            StageOutcome::Fallback(_) => None,
        }
    }
}

/// Ask the service and validate the answer with `parse`
///
/// Any error from the service or from `parse` becomes a fallback with the error
/// text as its reason.
pub async fn judge<T, F>(
    service: &dyn InferenceService,
    request: InferenceRequest,
    parse: F,
) -> StageOutcome<T>
where
    F: FnOnce(Value) -> Result<T, InferenceError>,
{
    let stage = request.stage;
    let outcome = service.infer(request).await.and_then(parse);

    match outcome {
        Ok(value) => {
            metrics().inference_judged(stage.as_str());
            debug!(stage = %stage, service = service.name(), "Inference judged");
            StageOutcome::Judged(value)
        }
        Err(e) => {
            metrics().inference_fallback(stage.as_str());
            warn!(stage = %stage, service = service.name(), reason = %e, "Inference failed, using fallback");
            StageOutcome::Fallback(e.to_string())
        }
    }
}

/// The JSON object between the first `{` and the last `}` of `text`
pub fn extract_json_object(text: &str) -> Result<Value, InferenceError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(InferenceError::Malformed("no JSON object in response".to_string()));
    };
    if end < start {
        return Err(InferenceError::Malformed("no JSON object in response".to_string()));
    }

    let value: Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| InferenceError::Malformed(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(InferenceError::Malformed("response is not a JSON object".to_string()))
    }
}

/// Look up a required field, treating `null` as missing
pub fn required<'a>(value: &'a Value, field: &str) -> Result<&'a Value, InferenceError> {
    match value.get(field) {
        Some(Value::Null) | None => Err(InferenceError::MissingField(field.to_string())),
        Some(found) => Ok(found),
    }
}

/// Required numeric field clamped to [0, 1]
pub fn required_unit(value: &Value, field: &str) -> Result<f64, InferenceError> {
    required(value, field)?
        .as_f64()
        .map(|n| n.clamp(0.0, 1.0))
        .ok_or_else(|| InferenceError::Malformed(format!("'{field}' is not a number")))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// A worker's judgement of one piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
    pub risk_score: f64,
    pub evidence: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

impl Classification {
    /// Parse a classification stage response
    ///
    /// `label`, `confidence` and `evidence` are required. `risk_score` defaults to
    /// 0 when absent.
    pub fn from_value(value: Value) -> Result<Self, InferenceError> {
        let label = required(&value, "label")?
            .as_str()
            .ok_or_else(|| InferenceError::Malformed("'label' is not a string".to_string()))?
            .to_string();
        let confidence = required_unit(&value, "confidence")?;
        let evidence = string_list(Some(required(&value, "evidence")?));
        let risk_score = match value.get("risk_score") {
            Some(Value::Null) | None => 0.0,
            Some(_) => required_unit(&value, "risk_score")?,
        };

        Ok(Self {
            label,
            confidence,
            risk_score,
            evidence,
            categories: string_list(value.get("categories")),
            rationale: value
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}
