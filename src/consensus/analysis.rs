//! Agreement statistics over a session's findings

use crate::protocol::{ReportStatus, TaskReport};
use crate::router::integrate::{risk_of, unit_field, DEFAULT_CONFIDENCE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Risk above this puts a finding in the `reject` bucket
pub const REJECT_RISK: f64 = 0.6;
/// Risk above this (and at most [`REJECT_RISK`]) puts a finding in `review`
pub const REVIEW_RISK: f64 = 0.3;

/// Expertise weight for agent types missing from the table
pub const DEFAULT_EXPERTISE: f64 = 0.5;

const MAX_KEY_FINDINGS: usize = 5;

/// Decision an individual finding leans toward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Approve,
    Review,
    Reject,
}

impl Bucket {
    pub fn from_risk(risk: f64) -> Self {
        if risk > REJECT_RISK {
            Bucket::Reject
        } else if risk > REVIEW_RISK {
            Bucket::Review
        } else {
            Bucket::Approve
        }
    }

    /// Higher is more conservative; used to break ties
    fn caution(&self) -> u8 {
        match self {
            Bucket::Approve => 0,
            Bucket::Review => 1,
            Bucket::Reject => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusLevel {
    High,
    Medium,
    Low,
}

impl ConsensusLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ConsensusLevel::High
        } else if score >= 0.6 {
            ConsensusLevel::Medium
        } else {
            ConsensusLevel::Low
        }
    }
}

/// Weight of an agent type's opinion; a trailing `_agent` is ignored
pub fn expertise_weight(agent_type: &str) -> f64 {
    match agent_type.trim_end_matches("_agent") {
        "toxicity_detector" => 1.0,
        "risk_assessor" => 0.95,
        "semantic_analyzer" => 0.9,
        "sentiment_analyzer" => 0.8,
        "context_analyzer" => 0.8,
        "content_analyzer" => 0.7,
        _ => DEFAULT_EXPERTISE,
    }
}

/// One agent's normalized contribution to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFinding {
    pub agent_id: String,
    pub agent_type: String,
    pub task_id: String,
    pub task_type: String,
    pub status: ReportStatus,
    pub confidence: f64,
    pub risk_score: f64,
    pub key_findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentFinding {
    pub fn from_report(report: &TaskReport) -> Self {
        let result = &report.result;
        let agent_type = if report.agent_type.is_empty() {
            report.agent_id.clone()
        } else {
            report.agent_type.clone()
        };

        Self {
            agent_id: report.agent_id.clone(),
            agent_type,
            task_id: report.task_id.clone(),
            task_type: report.task_type.clone(),
            status: report.status,
            confidence: unit_field(result, "confidence").unwrap_or(DEFAULT_CONFIDENCE),
            risk_score: risk_of(result).unwrap_or(0.0),
            key_findings: key_findings(result),
            risk_level: ["risk_level", "severity_level", "threat_level"]
                .iter()
                .find_map(|key| result.get(*key))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            categories: ["detected_types", "categories", "toxicity_categories"]
                .iter()
                .filter_map(|key| result.get(*key).and_then(Value::as_array))
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            error: report.error.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ReportStatus::Completed
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::from_risk(self.risk_score)
    }

    fn weight(&self) -> f64 {
        expertise_weight(&self.agent_type) * self.confidence
    }
}

fn key_findings(result: &Value) -> Vec<String> {
    let mut findings = Vec::new();
    for key in ["summary", "main_finding", "conclusion", "key_points"] {
        match result.get(key) {
            Some(Value::String(s)) if !s.is_empty() => findings.push(s.clone()),
            Some(Value::Null) | None => {}
            Some(Value::String(_)) => {}
            Some(other) => findings.push(other.to_string()),
        }
    }
    for key in ["detected_issues", "risk_factors", "problems"] {
        if let Some(items) = result.get(key).and_then(Value::as_array) {
            findings.extend(items.iter().map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }));
        }
    }
    findings.truncate(MAX_KEY_FINDINGS);
    findings
}

/// Where one agent stands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub bucket: Bucket,
    pub confidence: f64,
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusAnalysis {
    /// Share of findings in the majority bucket
    pub consensus_score: f64,
    /// Expertise- and confidence-weighted share of the majority bucket
    pub weighted_consensus: f64,
    pub majority: Option<Bucket>,
    pub consensus_level: ConsensusLevel,
    pub agreeing_agents: Vec<String>,
    pub conflicting_agents: Vec<String>,
    pub decision_distribution: BTreeMap<Bucket, usize>,
    pub positions: BTreeMap<String, AgentPosition>,
    pub participating: usize,
    pub average_confidence: f64,
    pub average_risk_score: f64,
}

impl ConsensusAnalysis {
    fn empty() -> Self {
        Self {
            consensus_score: 0.0,
            weighted_consensus: 0.5,
            majority: None,
            consensus_level: ConsensusLevel::Low,
            agreeing_agents: Vec::new(),
            conflicting_agents: Vec::new(),
            decision_distribution: BTreeMap::new(),
            positions: BTreeMap::new(),
            participating: 0,
            average_confidence: 0.0,
            average_risk_score: 0.0,
        }
    }
}

/// Bucket the completed findings and measure how much they agree
///
/// Failed findings carry no opinion and are left out. Ties for the majority go to
/// the more conservative bucket. A single finding is full consensus; no findings
/// at all is zero consensus.
pub fn analyze(findings: &[AgentFinding]) -> ConsensusAnalysis {
    let voting: Vec<&AgentFinding> = findings.iter().filter(|f| f.is_completed()).collect();
    if voting.is_empty() {
        return ConsensusAnalysis::empty();
    }

    let mut distribution: BTreeMap<Bucket, usize> = BTreeMap::new();
    for finding in &voting {
        *distribution.entry(finding.bucket()).or_default() += 1;
    }
    let (majority, majority_count) = distribution
        .iter()
        .max_by_key(|(bucket, count)| (**count, bucket.caution()))
        .map(|(bucket, count)| (*bucket, *count))
        .unwrap_or((Bucket::Review, 0));

    let total = voting.len() as f64;
    let consensus_score = if voting.len() < 2 {
        1.0
    } else {
        majority_count as f64 / total
    };

    let total_weight: f64 = voting.iter().map(|f| f.weight()).sum();
    let agreeing_weight: f64 = voting
        .iter()
        .filter(|f| f.bucket() == majority)
        .map(|f| f.weight())
        .sum();
    let weighted_consensus = if total_weight > 0.0 {
        (agreeing_weight / total_weight).clamp(0.0, 1.0)
    } else {
        0.5
    };

    let mut agreeing_agents = Vec::new();
    let mut conflicting_agents = Vec::new();
    let mut positions = BTreeMap::new();
    for finding in &voting {
        let bucket = finding.bucket();
        if bucket == majority {
            agreeing_agents.push(finding.agent_id.clone());
        } else {
            conflicting_agents.push(finding.agent_id.clone());
        }
        positions.insert(
            finding.agent_id.clone(),
            AgentPosition {
                bucket,
                confidence: finding.confidence,
                risk_score: finding.risk_score,
            },
        );
    }

    ConsensusAnalysis {
        consensus_score,
        weighted_consensus,
        majority: Some(majority),
        consensus_level: ConsensusLevel::from_score(consensus_score),
        agreeing_agents,
        conflicting_agents,
        decision_distribution: distribution,
        positions,
        participating: voting.len(),
        average_confidence: voting.iter().map(|f| f.confidence).sum::<f64>() / total,
        average_risk_score: voting.iter().map(|f| f.risk_score).sum::<f64>() / total,
    }
}
