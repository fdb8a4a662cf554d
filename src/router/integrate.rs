//! Folding a session's task reports into one summary

use crate::protocol::TaskReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Confidence reported when no task produced one
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Keys in an analysis payload that carry a risk figure
pub const RISK_KEYS: [&str; 3] = ["risk_score", "toxicity_score", "severity_score"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFinding {
    pub task_id: String,
    pub task_type: String,
    pub agent_id: String,
    pub confidence: Option<f64>,
    pub risk_score: Option<f64>,
    pub main_finding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub task_type: String,
    pub agent_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSummary {
    pub session_id: String,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub overall_confidence: f64,
    pub overall_risk: f64,
    pub findings: Vec<TaskFinding>,
    pub failures: Vec<FailedTask>,
    pub integrated_at: DateTime<Utc>,
}

/// Numeric field of an analysis payload, clamped to [0, 1]
pub fn unit_field(result: &Value, key: &str) -> Option<f64> {
    let value = result.get(key)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    number.is_finite().then(|| number.clamp(0.0, 1.0))
}

/// Highest risk figure in an analysis payload
pub fn risk_of(result: &Value) -> Option<f64> {
    RISK_KEYS
        .iter()
        .filter_map(|key| unit_field(result, key))
        .reduce(f64::max)
}

fn main_finding(result: &Value) -> Option<String> {
    ["summary", "main_finding", "rationale"]
        .iter()
        .find_map(|key| result.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Partition reports, then average confidence and take the maximum risk
pub fn integrate(session_id: &str, reports: &[TaskReport]) -> IntegrationSummary {
    let mut findings = Vec::new();
    let mut failures = Vec::new();

    for report in reports {
        if report.is_completed() {
            findings.push(TaskFinding {
                task_id: report.task_id.clone(),
                task_type: report.task_type.clone(),
                agent_id: report.agent_id.clone(),
                confidence: unit_field(&report.result, "confidence"),
                risk_score: risk_of(&report.result),
                main_finding: main_finding(&report.result),
            });
        } else {
            failures.push(FailedTask {
                task_id: report.task_id.clone(),
                task_type: report.task_type.clone(),
                agent_id: report.agent_id.clone(),
                error: report
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
    }

    let confidences: Vec<f64> = findings.iter().filter_map(|f| f.confidence).collect();
    let overall_confidence = if confidences.is_empty() {
        DEFAULT_CONFIDENCE
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    let overall_risk = findings
        .iter()
        .filter_map(|f| f.risk_score)
        .fold(0.0, f64::max);

    IntegrationSummary {
        session_id: session_id.to_string(),
        total_tasks: reports.len(),
        successful_tasks: findings.len(),
        failed_tasks: failures.len(),
        overall_confidence,
        overall_risk,
        findings,
        failures,
        integrated_at: Utc::now(),
    }
}
