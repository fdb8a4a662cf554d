//! Consensus and arbitration engine
//!
//! For one session: normalize the agents' reports into findings, ask low-confidence
//! or failed agents to clarify, measure consensus on a bounded blocking pool, ask
//! the Inference Service for a verdict (falling back to fixed rules), reconcile
//! with a strong majority and finally apply the safety overrides. Arbitration
//! always returns a verdict; it never fails the session.

use crate::hub::{CommunicationHub, RequestOutcome};
use crate::inference::{judge, InferenceRequest, InferenceService, InferenceStage, StageOutcome};
use crate::observability::metrics::metrics;
use crate::protocol::{Message, MessageKind, TaskReport};
use crate::arbitration_span;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn, Instrument};

pub mod analysis;
pub mod arbitration;
pub mod report;

pub use analysis::{analyze, AgentFinding, Bucket, ConsensusAnalysis, ConsensusLevel};
pub use arbitration::{ArbitrationMethod, ArbitrationResult, FinalDecision};
pub use report::{ArbitrationReport, ArbitratorStats, ClarificationRecord};

/// Mailbox id of the arbitrator
pub const ARBITRATOR_ID: &str = "central_arbitrator";

/// Priority of clarification requests
pub const CLARIFICATION_PRIORITY: i32 = 8;

#[derive(Debug, Clone)]
pub struct ArbitratorSettings {
    /// Consensus above this counts as "consensus achieved" in reports
    pub consensus_threshold: f64,
    /// Findings below this confidence are sent a clarification request
    pub clarification_confidence: f64,
    pub clarification_timeout: Duration,
    /// Concurrent consensus computations
    pub analysis_permits: usize,
}

impl Default for ArbitratorSettings {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.7,
            clarification_confidence: 0.7,
            clarification_timeout: Duration::from_secs(10),
            analysis_permits: 4,
        }
    }
}

/// Everything arbitration produced for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arbitration {
    pub session_id: String,
    pub result: ArbitrationResult,
    pub analysis: ConsensusAnalysis,
    pub findings: Vec<AgentFinding>,
    pub clarifications: Vec<ClarificationRecord>,
    pub report: ArbitrationReport,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorStatus {
    pub arbitrator_id: String,
    pub total_arbitrations: u64,
    pub approved: u64,
    pub rejected: u64,
    pub escalated: u64,
    pub average_confidence: f64,
    pub average_processing_ms: f64,
    pub consensus_threshold: f64,
}

pub struct Arbitrator {
    hub: Arc<CommunicationHub>,
    inference: Arc<dyn InferenceService>,
    settings: ArbitratorSettings,
    analysis_pool: Arc<Semaphore>,
    stats: Mutex<ArbitratorStats>,
}

impl Arbitrator {
    /// Create the arbitrator and register its mailbox
    pub fn new(
        hub: Arc<CommunicationHub>,
        inference: Arc<dyn InferenceService>,
        settings: ArbitratorSettings,
    ) -> Self {
        let mut meta = Map::new();
        meta.insert("role".to_string(), json!("arbitrator"));
        hub.register(ARBITRATOR_ID, meta);

        Self {
            hub,
            inference,
            analysis_pool: Arc::new(Semaphore::new(settings.analysis_permits.max(1))),
            settings,
            stats: Mutex::new(ArbitratorStats::default()),
        }
    }

    pub fn settings(&self) -> &ArbitratorSettings {
        &self.settings
    }

    /// Arbitrate one session's reports
    pub async fn arbitrate(&self, session_id: &str, content: &str, reports: &[TaskReport]) -> Arbitration {
        let span = arbitration_span!(session_id = %session_id, reports = reports.len());
        self.run(session_id, content, reports).instrument(span).await
    }

    async fn run(&self, session_id: &str, content: &str, reports: &[TaskReport]) -> Arbitration {
        let started = Instant::now();
        let findings: Vec<AgentFinding> = reports.iter().map(AgentFinding::from_report).collect();

        let clarifications = self.clarify(session_id, content, &findings).await;
        let analysis = self.analyze(findings.clone()).await;

        let request = InferenceRequest::new(
            InferenceStage::Arbitration,
            arbitration::arbitration_prompt(content, &findings, &analysis),
        )
        .with_context(json!({
            "session_id": session_id,
            "consensus": &analysis,
            "clarifications": &clarifications,
        }));
        let verdict = match judge(self.inference.as_ref(), request, arbitration::parse_arbitration).await {
            StageOutcome::Judged(result) => result,
            StageOutcome::Fallback(reason) => arbitration::fallback_arbitration(&analysis, &reason),
        };
        let verdict = arbitration::reconcile(verdict, &analysis);
        let result = arbitration::apply_safety(verdict, &analysis);

        let elapsed = started.elapsed();
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result, elapsed);
        metrics().decision_recorded(result.final_decision.as_str(), elapsed);

        let report = ArbitrationReport::build(
            session_id,
            &findings,
            &analysis,
            &result,
            &clarifications,
            self.settings.consensus_threshold,
        );
        info!(
            decision = %result.final_decision,
            confidence = result.confidence_score,
            consensus = analysis.consensus_score,
            method = ?result.method,
            escalation = result.requires_escalation,
            "Arbitration complete"
        );

        Arbitration {
            session_id: session_id.to_string(),
            result,
            analysis,
            findings,
            clarifications,
            report,
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Consensus statistics, computed off the async workers
    async fn analyze(&self, findings: Vec<AgentFinding>) -> ConsensusAnalysis {
        let permit = match self.analysis_pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return analyze(&findings),
        };

        let fallback = findings.clone();
        match tokio::task::spawn_blocking(move || {
            let _permit = permit;
            analyze(&findings)
        })
        .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "Consensus worker failed, computing inline");
                analyze(&fallback)
            }
        }
    }

    /// Ask every uncertain or failed agent to clarify, all at once
    async fn clarify(
        &self,
        session_id: &str,
        content: &str,
        findings: &[AgentFinding],
    ) -> Vec<ClarificationRecord> {
        let mut asked = HashSet::new();
        let targets: Vec<&AgentFinding> = findings
            .iter()
            .filter(|f| !f.agent_id.is_empty())
            .filter(|f| !f.is_completed() || f.confidence < self.settings.clarification_confidence)
            .filter(|f| asked.insert(f.agent_id.clone()))
            .collect();

        let requests = targets.into_iter().map(|finding| {
            let payload = json!({
                "session_id": session_id,
                "request_type": "clarification",
                "content": content,
                "task_id": finding.task_id,
                "questions": clarification_questions(finding),
                "concerns": concerns(finding),
            });
            let message = Message::new(
                ARBITRATOR_ID,
                &finding.agent_id,
                MessageKind::CollaborationRequest,
                payload,
            )
            .with_priority(CLARIFICATION_PRIORITY);
            let agent_id = finding.agent_id.clone();

            async move {
                match self
                    .hub
                    .request(message, self.settings.clarification_timeout)
                    .await
                {
                    Ok(RequestOutcome::Response(reply)) => ClarificationRecord {
                        agent_id,
                        request_sent: true,
                        response_received: true,
                        response: Some(reply.payload),
                        error: None,
                    },
                    Ok(RequestOutcome::TimedOut) => ClarificationRecord {
                        agent_id,
                        request_sent: true,
                        response_received: false,
                        response: None,
                        error: Some("timed out".to_string()),
                    },
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Clarification request not sent");
                        ClarificationRecord {
                            agent_id,
                            request_sent: false,
                            response_received: false,
                            response: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        });

        join_all(requests).await
    }

    pub fn stats(&self) -> ArbitratorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> ArbitratorStatus {
        let stats = self.stats();
        ArbitratorStatus {
            arbitrator_id: ARBITRATOR_ID.to_string(),
            total_arbitrations: stats.total_arbitrations,
            approved: stats.approved,
            rejected: stats.rejected,
            escalated: stats.escalated,
            average_confidence: stats.average_confidence,
            average_processing_ms: stats.average_processing_ms(),
            consensus_threshold: self.settings.consensus_threshold,
        }
    }
}

fn clarification_questions(finding: &AgentFinding) -> Vec<&'static str> {
    let mut questions = Vec::new();
    if finding.confidence < 0.5 {
        questions.push("Provide the specific evidence behind this judgement");
    }
    if !finding.is_completed() {
        questions.push("Explain why the analysis did not complete");
    }
    if finding.risk_score > 0.3 {
        questions.push("Describe the type and location of the harmful content");
    }
    questions
}

fn concerns(finding: &AgentFinding) -> Vec<&'static str> {
    let mut concerns = Vec::new();
    if finding.confidence < 0.6 {
        concerns.push("low confidence");
    }
    if finding.key_findings.is_empty() {
        concerns.push("no concrete findings");
    }
    if finding.risk_score > 0.5 {
        concerns.push("elevated risk");
    }
    concerns
}

/// Look up a clarification reply for an agent, if one arrived
pub fn clarification_for<'a>(records: &'a [ClarificationRecord], agent_id: &str) -> Option<&'a Value> {
    records
        .iter()
        .find(|r| r.agent_id == agent_id)
        .and_then(|r| r.response.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RuleOnlyInference;
    use crate::protocol::Task;
    use crate::testing::mocks::MockInferenceService;

    fn arbitrator(hub: Arc<CommunicationHub>) -> Arbitrator {
        Arbitrator::new(
            hub,
            Arc::new(RuleOnlyInference),
            ArbitratorSettings {
                clarification_timeout: Duration::from_millis(200),
                ..ArbitratorSettings::default()
            },
        )
    }

    fn report(agent: &str, risk: f64, confidence: f64) -> TaskReport {
        let task = Task::new("toxicity_detection", "x");
        TaskReport::completed(&task, agent, agent, json!({"risk_score": risk, "confidence": confidence}))
    }

    #[tokio::test]
    async fn test_unanimous_high_risk_is_rejected() {
        let arbitrator = arbitrator(Arc::new(CommunicationHub::new()));
        let reports = vec![
            report("toxicity_detector", 0.9, 0.9),
            report("sentiment_analyzer", 0.85, 0.9),
            report("risk_assessor", 0.8, 0.9),
        ];

        let outcome = arbitrator.arbitrate("s-1", "content", &reports).await;

        assert_eq!(outcome.analysis.consensus_score, 1.0);
        assert_eq!(outcome.result.final_decision, FinalDecision::Rejected);
        assert_eq!(outcome.result.method, ArbitrationMethod::RuleBased);
        assert!(outcome.clarifications.is_empty());
        assert_eq!(arbitrator.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_verdict_without_evidence_falls_back() {
        let inference = MockInferenceService::new().with_reply(
            InferenceStage::Arbitration,
            json!({
                "final_decision": "approved",
                "confidence_score": 0.95,
                "reasoning": "looks fine"
            }),
        );
        let arbitrator = Arbitrator::new(
            Arc::new(CommunicationHub::new()),
            Arc::new(inference),
            ArbitratorSettings {
                clarification_timeout: Duration::from_millis(200),
                ..ArbitratorSettings::default()
            },
        );
        let reports = vec![
            report("toxicity_detector", 0.9, 0.9),
            report("risk_assessor", 0.85, 0.9),
        ];

        let outcome = arbitrator.arbitrate("s-3", "content", &reports).await;

        assert_eq!(outcome.result.method, ArbitrationMethod::RuleBased);
        assert_eq!(outcome.result.final_decision, FinalDecision::Rejected);
        assert!(outcome.result.reasoning.contains("evidence"));
    }

    #[tokio::test]
    async fn test_no_reports_escalates() {
        let arbitrator = arbitrator(Arc::new(CommunicationHub::new()));

        let outcome = arbitrator.arbitrate("s-2", "content", &[]).await;

        assert_eq!(outcome.result.final_decision, FinalDecision::NeedsHumanReview);
        assert!(outcome.result.requires_escalation);
    }

    #[tokio::test]
    async fn test_low_confidence_agent_is_asked_to_clarify() {
        let hub = Arc::new(CommunicationHub::new());
        hub.register("unsure", Map::new());
        let arbitrator = arbitrator(hub.clone());

        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let request = hub.receive("unsure", Some(Duration::from_secs(1))).await.unwrap();
                assert_eq!(request.kind, MessageKind::CollaborationRequest);
                assert_eq!(request.priority, CLARIFICATION_PRIORITY);
                hub.send(request.reply(MessageKind::CollaborationResponse, json!({"detail": "sarcasm"})))
                    .unwrap();
            })
        };

        let outcome = arbitrator
            .arbitrate("s-3", "content", &[report("unsure", 0.2, 0.3), report("missing", 0.1, 0.2)])
            .await;
        responder.await.unwrap();

        assert_eq!(outcome.clarifications.len(), 2);
        assert_eq!(
            clarification_for(&outcome.clarifications, "unsure"),
            Some(&json!({"detail": "sarcasm"}))
        );
        let missing = outcome
            .clarifications
            .iter()
            .find(|c| c.agent_id == "missing")
            .unwrap();
        assert!(!missing.request_sent);
        assert_eq!(outcome.report.quality_metrics.communication_success_rate, 0.5);
    }

    #[test]
    fn test_questions_and_concerns() {
        let task = Task::new("toxicity_detection", "x");
        let failed = AgentFinding::from_report(&TaskReport::failed(&task, "a", "a", "boom"));

        assert!(clarification_questions(&failed)
            .contains(&"Explain why the analysis did not complete"));
        assert!(concerns(&failed).contains(&"no concrete findings"));
    }
}
