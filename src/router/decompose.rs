//! Splitting a content item into typed sub-tasks

use crate::inference::{required, InferenceError};
use crate::protocol::{TaskSpec, TaskType, DEFAULT_PRIORITY};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

/// Content longer than this (in characters) gets a semantic analysis task
pub const SEMANTIC_MIN_CHARS: usize = 20;
/// Content longer than this (in characters) gets a context analysis task
pub const CONTEXT_MIN_CHARS: usize = 50;

/// How a plan was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMethod {
    Inference,
    RuleBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub tasks: Vec<TaskSpec>,
    pub method: PlanMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl DecompositionPlan {
    pub fn judged(tasks: Vec<TaskSpec>) -> Self {
        Self {
            tasks,
            method: PlanMethod::Inference,
            fallback_reason: None,
        }
    }

    pub fn fallback(content: &str, reason: String) -> Self {
        Self {
            tasks: fallback_tasks(content),
            method: PlanMethod::RuleBased,
            fallback_reason: Some(reason),
        }
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        self.tasks.iter().map(|t| t.task_type).collect()
    }
}

fn spec(task_type: TaskType, priority: i32, focus: &str, dependencies: &[TaskType]) -> TaskSpec {
    TaskSpec {
        task_type,
        priority,
        focus: focus.to_string(),
        dependencies: dependencies.iter().map(|d| d.as_str().to_string()).collect(),
    }
}

/// Deterministic plan used whenever inference cannot produce one
///
/// Toxicity, content, risk and sentiment tasks are always present; semantic and
/// context analysis depend on the content length.
pub fn fallback_tasks(content: &str) -> Vec<TaskSpec> {
    let length = content.chars().count();
    let mut tasks = vec![
        spec(TaskType::ToxicityDetection, 9, "harmful content identification", &[]),
        spec(TaskType::ContentAnalysis, 8, "basic text features", &[]),
    ];

    if length > SEMANTIC_MIN_CHARS {
        tasks.push(spec(
            TaskType::SemanticAnalysis,
            7,
            "deeper meaning",
            &[TaskType::ContentAnalysis],
        ));
    }
    tasks.push(spec(
        TaskType::RiskAssessment,
        7,
        "overall risk level",
        &[TaskType::ToxicityDetection, TaskType::SentimentAnalysis],
    ));
    tasks.push(spec(TaskType::SentimentAnalysis, 6, "polarity and intensity", &[]));
    if length > CONTEXT_MIN_CHARS {
        tasks.push(spec(
            TaskType::ContextAnalysis,
            5,
            "cultural background and implied meaning",
            &[TaskType::SemanticAnalysis],
        ));
    }

    tasks
}

/// Validate a decomposition response
///
/// Requires a `tasks` array. Entries with unknown task types are dropped, as are
/// repeats of a type already planned. An empty result counts as malformed.
pub fn parse_plan(value: Value) -> Result<Vec<TaskSpec>, InferenceError> {
    let entries = required(&value, "tasks")?
        .as_array()
        .ok_or_else(|| InferenceError::Malformed("'tasks' is not a list".to_string()))?;

    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    for entry in entries {
        let Some(raw_type) = entry.get("task_type").and_then(Value::as_str) else {
            continue;
        };
        let task_type: TaskType = match raw_type.parse() {
            Ok(task_type) => task_type,
            Err(_) => {
                debug!(task_type = raw_type, "Dropping unknown task type from plan");
                continue;
            }
        };
        if !seen.insert(task_type) {
            continue;
        }

        let priority = entry
            .get("priority")
            .and_then(Value::as_i64)
            .map(|p| p.clamp(1, 10) as i32)
            .unwrap_or(DEFAULT_PRIORITY);
        let focus = entry
            .get("focus")
            .or_else(|| entry.get("specific_focus"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let dependencies = entry
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        tasks.push(TaskSpec {
            task_type,
            priority,
            focus,
            dependencies,
        });
    }

    if tasks.is_empty() {
        return Err(InferenceError::Malformed(
            "plan contains no known task types".to_string(),
        ));
    }
    Ok(tasks)
}

pub fn decomposition_prompt(content: &str, platform: &str, context: &Map<String, Value>) -> String {
    format!(
        "Break the following content into moderation analysis tasks.\n\n\
         Content:\n{content}\n\n\
         Platform: {platform}\n\
         Caller context: {}\n\n\
         Choose only the task types that add information for this content.",
        Value::Object(context.clone())
    )
}
