//! Session reports and arbitrator statistics

use super::analysis::{AgentFinding, ConsensusAnalysis};
use super::arbitration::{ArbitrationMethod, ArbitrationResult, FinalDecision};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Processing times kept for the running average
pub const PROCESSING_TIME_WINDOW: usize = 100;

/// Outcome of asking one agent to clarify its finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRecord {
    pub agent_id: String,
    pub request_sent: bool,
    pub response_received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub session_id: String,
    pub final_decision: FinalDecision,
    pub confidence_score: f64,
    pub participating_agents: usize,
    pub communication_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrail {
    pub sub_agent_inputs: usize,
    pub consensus_achieved: bool,
    pub method: ArbitrationMethod,
    pub escalation_triggered: bool,
    pub adjustments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub participation_rate: f64,
    pub communication_success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationReport {
    pub executive_summary: ExecutiveSummary,
    pub decision_trail: DecisionTrail,
    pub quality_metrics: QualityMetrics,
}

impl ArbitrationReport {
    /// `consensus_threshold` decides whether the panel reached consensus
    pub fn build(
        session_id: &str,
        findings: &[AgentFinding],
        analysis: &ConsensusAnalysis,
        result: &ArbitrationResult,
        clarifications: &[ClarificationRecord],
        consensus_threshold: f64,
    ) -> Self {
        let completed = findings.iter().filter(|f| f.is_completed()).count();
        let answered = clarifications.iter().filter(|c| c.response_received).count();

        Self {
            executive_summary: ExecutiveSummary {
                session_id: session_id.to_string(),
                final_decision: result.final_decision,
                confidence_score: result.confidence_score,
                participating_agents: findings.len(),
                communication_attempts: clarifications.len(),
            },
            decision_trail: DecisionTrail {
                sub_agent_inputs: findings.len(),
                consensus_achieved: analysis.consensus_score > consensus_threshold,
                method: result.method,
                escalation_triggered: result.requires_escalation,
                adjustments: result.adjustments.clone(),
            },
            quality_metrics: QualityMetrics {
                participation_rate: if findings.is_empty() {
                    0.0
                } else {
                    completed as f64 / findings.len() as f64
                },
                communication_success_rate: answered as f64 / clarifications.len().max(1) as f64,
            },
        }
    }
}

/// Running totals across every arbitrated session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArbitratorStats {
    pub total_arbitrations: u64,
    pub approved: u64,
    pub rejected: u64,
    pub escalated: u64,
    pub average_confidence: f64,
    pub recent_processing_ms: VecDeque<u64>,
}

impl ArbitratorStats {
    pub fn record(&mut self, result: &ArbitrationResult, elapsed: Duration) {
        self.total_arbitrations += 1;
        match result.final_decision {
            FinalDecision::Approved => self.approved += 1,
            FinalDecision::Rejected => self.rejected += 1,
            FinalDecision::NeedsHumanReview => self.escalated += 1,
        }

        let n = self.total_arbitrations as f64;
        self.average_confidence += (result.confidence_score - self.average_confidence) / n;

        self.recent_processing_ms.push_back(elapsed.as_millis() as u64);
        while self.recent_processing_ms.len() > PROCESSING_TIME_WINDOW {
            self.recent_processing_ms.pop_front();
        }
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.recent_processing_ms.is_empty() {
            return 0.0;
        }
        self.recent_processing_ms.iter().sum::<u64>() as f64 / self.recent_processing_ms.len() as f64
    }

    pub fn by_decision(&self) -> BTreeMap<FinalDecision, u64> {
        BTreeMap::from([
            (FinalDecision::Approved, self.approved),
            (FinalDecision::Rejected, self.rejected),
            (FinalDecision::NeedsHumanReview, self.escalated),
        ])
    }
}
