//! Final verdict: inference-backed arbitration, the rule-based fallback,
//! reconciliation with a strong consensus and the safety overrides

use super::analysis::{AgentFinding, Bucket, ConsensusAnalysis};
use crate::inference::{required, required_unit, InferenceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Average risk above which an approval is never released
pub const HIGH_RISK_THRESHOLD: f64 = 0.8;
/// Confidence below which the verdict is escalated to a human
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.4;
/// Both consensus figures must exceed this for reconciliation to apply
pub const STRONG_CONSENSUS: f64 = 0.8;
pub const RECONCILIATION_BOOST: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalDecision {
    Approved,
    Rejected,
    NeedsHumanReview,
}

impl FinalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalDecision::Approved => "approved",
            FinalDecision::Rejected => "rejected",
            FinalDecision::NeedsHumanReview => "needs_human_review",
        }
    }
}

impl From<Bucket> for FinalDecision {
    fn from(bucket: Bucket) -> Self {
        match bucket {
            Bucket::Approve => FinalDecision::Approved,
            Bucket::Reject => FinalDecision::Rejected,
            Bucket::Review => FinalDecision::NeedsHumanReview,
        }
    }
}

impl fmt::Display for FinalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approved" => Ok(FinalDecision::Approved),
            "rejected" => Ok(FinalDecision::Rejected),
            "needs_human_review" => Ok(FinalDecision::NeedsHumanReview),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationMethod {
    Inference,
    RuleBased,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub supporting: Vec<String>,
    pub conflicting: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: String,
    pub primary_risks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationResult {
    pub final_decision: FinalDecision,
    pub confidence_score: f64,
    pub reasoning: String,
    pub evidence: Evidence,
    pub risk_assessment: RiskAssessment,
    pub recommendations: Vec<String>,
    pub requires_escalation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub method: ArbitrationMethod,
    /// Post-processing steps that changed the verdict
    #[serde(default)]
    pub adjustments: Vec<String>,
}

impl ArbitrationResult {
    /// Verdict used when a session could not be arbitrated at all
    pub fn escalated<S: Into<String>>(reason: S) -> Self {
        let reason = reason.into();
        Self {
            final_decision: FinalDecision::NeedsHumanReview,
            confidence_score: 0.2,
            reasoning: format!("Arbitration could not run: {reason}"),
            evidence: Evidence::default(),
            risk_assessment: RiskAssessment {
                risk_level: "unknown".to_string(),
                primary_risks: Vec::new(),
            },
            recommendations: vec!["Route to a human moderator".to_string()],
            requires_escalation: true,
            escalation_reason: Some(reason),
            method: ArbitrationMethod::RuleBased,
            adjustments: Vec::new(),
        }
    }
}

fn risk_level(average_risk: f64) -> &'static str {
    if average_risk > 0.7 {
        "high"
    } else if average_risk > 0.4 {
        "medium"
    } else {
        "low"
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Validate an arbitration response
///
/// `final_decision`, `confidence_score`, `reasoning` and `evidence` are required;
/// an unknown decision counts as malformed.
pub fn parse_arbitration(value: Value) -> Result<ArbitrationResult, InferenceError> {
    let final_decision: FinalDecision = required(&value, "final_decision")?
        .as_str()
        .ok_or_else(|| InferenceError::Malformed("'final_decision' is not a string".to_string()))?
        .parse()
        .map_err(InferenceError::Malformed)?;
    let confidence_score = required_unit(&value, "confidence_score")?;
    let reasoning = required(&value, "reasoning")?
        .as_str()
        .ok_or_else(|| InferenceError::Malformed("'reasoning' is not a string".to_string()))?
        .to_string();

    let evidence = required(&value, "evidence")?;
    if !evidence.is_object() {
        return Err(InferenceError::Malformed("'evidence' is not an object".to_string()));
    }
    let evidence = Some(evidence);
    let risk = value.get("risk_assessment");
    let requires_escalation = value
        .get("requires_escalation")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(ArbitrationResult {
        final_decision,
        confidence_score,
        reasoning,
        evidence: Evidence {
            supporting: strings(evidence.and_then(|e| e.get("supporting"))),
            conflicting: strings(evidence.and_then(|e| e.get("conflicting"))),
        },
        risk_assessment: RiskAssessment {
            risk_level: risk
                .and_then(|r| r.get("risk_level"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            primary_risks: strings(risk.and_then(|r| r.get("primary_risks"))),
        },
        recommendations: strings(value.get("recommendations")),
        requires_escalation,
        escalation_reason: value
            .get("escalation_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        method: ArbitrationMethod::Inference,
        adjustments: Vec::new(),
    })
}

/// Rule-based verdict used when inference fails
pub fn fallback_arbitration(analysis: &ConsensusAnalysis, reason: &str) -> ArbitrationResult {
    let average_risk = analysis.average_risk_score;
    let consensus = analysis.consensus_score;

    let (final_decision, confidence_score) = if average_risk > 0.7 && consensus > 0.6 {
        (FinalDecision::Rejected, 0.8)
    } else if average_risk > 0.4 || consensus < 0.6 {
        (FinalDecision::NeedsHumanReview, 0.6)
    } else {
        (FinalDecision::Approved, 0.7)
    };
    let requires_escalation = final_decision == FinalDecision::NeedsHumanReview;

    ArbitrationResult {
        final_decision,
        confidence_score,
        reasoning: format!(
            "Rule-based arbitration ({reason}). Average risk {average_risk:.2}, consensus {consensus:.2}"
        ),
        evidence: Evidence {
            supporting: vec![format!("Average agent risk score {average_risk:.2}")],
            conflicting: analysis.conflicting_agents.clone(),
        },
        risk_assessment: RiskAssessment {
            risk_level: risk_level(average_risk).to_string(),
            primary_risks: Vec::new(),
        },
        recommendations: vec!["Monitor user feedback".to_string()],
        requires_escalation,
        escalation_reason: requires_escalation
            .then(|| "risk or consensus insufficient for an automatic decision".to_string()),
        method: ArbitrationMethod::RuleBased,
        adjustments: Vec::new(),
    }
}

/// Align the verdict with a strong majority
///
/// Applies only when both the raw and the weighted consensus exceed
/// [`STRONG_CONSENSUS`]. A changed decision gains [`RECONCILIATION_BOOST`]
/// confidence, capped at 1.
pub fn reconcile(mut result: ArbitrationResult, analysis: &ConsensusAnalysis) -> ArbitrationResult {
    let strong = analysis.consensus_score > STRONG_CONSENSUS
        && analysis.weighted_consensus > STRONG_CONSENSUS;
    let Some(majority) = analysis.majority.filter(|_| strong) else {
        return result;
    };

    let expected = FinalDecision::from(majority);
    if result.final_decision != expected {
        info!(from = %result.final_decision, to = %expected, "Aligning verdict with strong consensus");
        result.final_decision = expected;
        result.confidence_score = (result.confidence_score + RECONCILIATION_BOOST).min(1.0);
        result
            .adjustments
            .push(format!("aligned with strong consensus ({expected})"));
    }
    result
}

/// Last-step overrides, applied to every verdict regardless of source
pub fn apply_safety(mut result: ArbitrationResult, analysis: &ConsensusAnalysis) -> ArbitrationResult {
    result.confidence_score = result.confidence_score.clamp(0.0, 1.0);

    if analysis.average_risk_score > HIGH_RISK_THRESHOLD
        && result.final_decision == FinalDecision::Approved
    {
        warn!(
            average_risk = analysis.average_risk_score,
            "High-risk content approved, forcing human review"
        );
        result.final_decision = FinalDecision::NeedsHumanReview;
        result.reasoning.push_str(" [safety override: high average risk]");
        result.adjustments.push("safety override: high average risk".to_string());
    }

    if result.confidence_score < LOW_CONFIDENCE_THRESHOLD {
        warn!(confidence = result.confidence_score, "Low arbitration confidence, escalating");
        result.final_decision = FinalDecision::NeedsHumanReview;
        result.requires_escalation = true;
        result.escalation_reason = Some("arbitration confidence too low".to_string());
        result.adjustments.push("escalated: low confidence".to_string());
    }

    result
}

/// Per-agent findings formatted for the arbitration prompt
pub fn format_findings(findings: &[AgentFinding]) -> String {
    let mut out = String::new();
    for finding in findings {
        out.push_str(&format!(
            "[{} / {}]\nstatus: {:?}\nconfidence: {:.2}\n",
            finding.agent_id, finding.task_type, finding.status, finding.confidence
        ));
        if !finding.key_findings.is_empty() {
            out.push_str(&format!("key findings: {}\n", finding.key_findings.join("; ")));
        }
        if finding.risk_score > 0.0 {
            out.push_str(&format!(
                "risk score: {:.2}\nrisk level: {}\n",
                finding.risk_score,
                finding.risk_level.as_deref().unwrap_or("unknown")
            ));
        }
        if !finding.categories.is_empty() {
            out.push_str(&format!("categories: {}\n", finding.categories.join(", ")));
        }
        if let Some(error) = &finding.error {
            out.push_str(&format!("error: {error}\n"));
        }
        out.push('\n');
    }
    out
}

pub fn arbitration_prompt(content: &str, findings: &[AgentFinding], analysis: &ConsensusAnalysis) -> String {
    let mut summary = format!(
        "participating agents: {}\nconsensus: {:.2} ({:?})\nweighted consensus: {:.2}\n\
         average confidence: {:.2}\naverage risk: {:.2}\n",
        analysis.participating,
        analysis.consensus_score,
        analysis.consensus_level,
        analysis.weighted_consensus,
        analysis.average_confidence,
        analysis.average_risk_score,
    );
    if !analysis.conflicting_agents.is_empty() {
        summary.push_str(&format!(
            "conflicting agents: {}\n",
            analysis.conflicting_agents.join(", ")
        ));
    }

    format!(
        "Original content:\n{content}\n\nSpecialist findings:\n{}\nDetection summary:\n{summary}",
        format_findings(findings)
    )
}
