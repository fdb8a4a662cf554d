//! Worker agents
//!
//! A worker owns one hub mailbox. It takes `task_assignment` messages, judges the
//! content through the Inference Service (or a lexical heuristic when inference
//! is unavailable), and answers with a `result_report` correlated to the task.
//! It also answers the arbitrator's `collaboration_request`s from the findings it
//! produced for that session.
//!
//! [`run_remote_worker`] runs the same analysis loop against any
//! [`AgentTransport`] instead of an in-process mailbox.

use crate::error::{MeshError, MeshResult};
use crate::hub::CommunicationHub;
use crate::inference::{judge, Classification, InferenceRequest, InferenceService, InferenceStage, StageOutcome};
use crate::observability::metrics::metrics;
use crate::protocol::{Message, MessageKind, RegisterRequest, Task, TaskReport};
use crate::registry::{AgentRegistration, AgentStore};
use crate::transport::AgentTransport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Confidence attached to lexical judgements
pub const HEURISTIC_CONFIDENCE: f64 = 0.45;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Findings remembered per worker for clarification answers
const FINDINGS_RETAINED: usize = 256;

const ABUSIVE_TERMS: &[&str] = &[
    "idiot", "stupid", "moron", "loser", "hate you", "kill", "die", "worthless", "trash",
    "shut up", "disgusting", "pathetic",
];
const THREAT_TERMS: &[&str] = &["kill", "hurt you", "destroy you", "find you", "beat you"];
const NEGATIVE_TERMS: &[&str] = &[
    "hate", "awful", "terrible", "angry", "worst", "horrible", "ugly", "sick of",
];
const SPAM_TERMS: &[&str] = &["click here", "free money", "buy now", "limited offer", "http://"];

/// Identity and capabilities of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
}

impl WorkerProfile {
    pub fn new<I: Into<String>, T: Into<String>>(agent_id: I, agent_type: T, capabilities: &[&str]) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// The six specialist workers started by `serve`
pub fn default_roster() -> Vec<WorkerProfile> {
    vec![
        WorkerProfile::new(
            "content_analyzer",
            "content_analyzer",
            &["content_analysis", "pattern_recognition"],
        ),
        WorkerProfile::new("semantic_analyzer", "semantic_analyzer", &["semantic_analysis"]),
        WorkerProfile::new("sentiment_analyzer", "sentiment_analyzer", &["sentiment_analysis"]),
        WorkerProfile::new("context_analyzer", "context_analyzer", &["context_analysis"]),
        WorkerProfile::new("toxicity_detector", "toxicity_detector", &["toxicity_detection"]),
        WorkerProfile::new("risk_assessor", "risk_assessor", &["risk_assessment"]),
    ]
}

/// Judges task content for one agent type
#[derive(Clone)]
pub struct TaskAnalyzer {
    agent_type: String,
    inference: Arc<dyn InferenceService>,
}

impl TaskAnalyzer {
    pub fn new<S: Into<String>>(agent_type: S, inference: Arc<dyn InferenceService>) -> Self {
        Self {
            agent_type: agent_type.into(),
            inference,
        }
    }

    /// Produce the result payload for `task`
    ///
    /// The payload always carries `confidence`, `risk_score`, `summary`,
    /// `categories`, `evidence` and `method`; toxicity tasks also carry
    /// `toxicity_score`.
    pub async fn analyze(&self, task: &Task) -> Value {
        let request = InferenceRequest::new(InferenceStage::Classification, classification_prompt(&self.agent_type, task))
            .with_context(json!({
                "task_type": task.task_type,
                "agent_type": self.agent_type,
                "focus": task.context.get("focus"),
                "platform": task.context.get("platform"),
            }));

        match judge(self.inference.as_ref(), request, Classification::from_value).await {
            StageOutcome::Judged(classification) => {
                analysis_payload(&task.task_type, &classification, "inference", None)
            }
            StageOutcome::Fallback(reason) => {
                let classification = lexical_classification(&task.task_type, &task.content);
                analysis_payload(&task.task_type, &classification, "rule_based", Some(&reason))
            }
        }
    }
}

fn classification_prompt(agent_type: &str, task: &Task) -> String {
    let focus = task
        .context
        .get("focus")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
        .unwrap_or("general review");
    format!(
        "Agent: {agent_type}\nTask: {}\nFocus: {focus}\n\nContent:\n{}",
        task.task_type, task.content
    )
}

fn analysis_payload(
    task_type: &str,
    classification: &Classification,
    method: &str,
    fallback_reason: Option<&str>,
) -> Value {
    let summary = if classification.rationale.is_empty() {
        format!("{task_type}: {}", classification.label)
    } else {
        classification.rationale.clone()
    };

    let mut payload = json!({
        "label": classification.label,
        "confidence": classification.confidence,
        "risk_score": classification.risk_score,
        "summary": summary,
        "categories": classification.categories,
        "evidence": classification.evidence,
        "detected_issues": classification.evidence,
        "method": method,
    });
    if task_type == "toxicity_detection" {
        payload["toxicity_score"] = json!(classification.risk_score);
    }
    if let Some(reason) = fallback_reason {
        payload["fallback_reason"] = json!(reason);
    }
    payload
}

/// Keyword heuristic used when the Inference Service cannot judge
pub fn lexical_classification(task_type: &str, content: &str) -> Classification {
    let lowered = content.to_lowercase();
    let hits = |terms: &[&str]| -> Vec<String> {
        terms
            .iter()
            .filter(|term| lowered.contains(*term))
            .map(|term| term.to_string())
            .collect()
    };

    let abusive = hits(ABUSIVE_TERMS);
    let threats = hits(THREAT_TERMS);
    let negative = hits(NEGATIVE_TERMS);
    let spam = hits(SPAM_TERMS);

    let mut categories = Vec::new();
    if !abusive.is_empty() {
        categories.push("harassment".to_string());
    }
    if !threats.is_empty() {
        categories.push("threat".to_string());
    }
    if !spam.is_empty() {
        categories.push("spam".to_string());
    }

    let risk = match task_type {
        "sentiment_analysis" => negative.len() as f64 * 0.2 + abusive.len() as f64 * 0.15,
        "pattern_recognition" | "content_analysis" => {
            spam.len() as f64 * 0.3 + abusive.len() as f64 * 0.25
        }
        _ => abusive.len() as f64 * 0.3 + threats.len() as f64 * 0.4 + negative.len() as f64 * 0.05,
    }
    .min(1.0);

    let evidence: Vec<String> = abusive
        .into_iter()
        .chain(threats)
        .chain(negative)
        .chain(spam)
        .map(|term| format!("matched '{term}'"))
        .collect();
    let label = if risk > 0.6 {
        "harmful"
    } else if risk > 0.3 {
        "questionable"
    } else {
        "benign"
    };

    Classification {
        label: label.to_string(),
        confidence: HEURISTIC_CONFIDENCE,
        risk_score: risk,
        evidence,
        categories,
        rationale: format!("keyword heuristic for {task_type}"),
    }
}

/// A specialist agent living on an in-process hub mailbox
pub struct WorkerAgent {
    profile: WorkerProfile,
    hub: Arc<CommunicationHub>,
    registry: Arc<dyn AgentStore>,
    analyzer: TaskAnalyzer,
    heartbeat_interval: Duration,
    findings: Mutex<HashMap<String, Value>>,
}

impl WorkerAgent {
    pub fn new(
        profile: WorkerProfile,
        hub: Arc<CommunicationHub>,
        registry: Arc<dyn AgentStore>,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        let analyzer = TaskAnalyzer::new(profile.agent_type.clone(), inference);
        Self {
            profile,
            hub,
            registry,
            analyzer,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            findings: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn profile(&self) -> &WorkerProfile {
        &self.profile
    }

    /// Register with the registry and open the hub mailbox
    pub async fn register(&self) -> MeshResult<()> {
        let mut meta = Map::new();
        meta.insert("agent_type".to_string(), json!(self.profile.agent_type));
        meta.insert("capabilities".to_string(), json!(self.profile.capabilities));

        let registration = AgentRegistration::new(&self.profile.agent_id, &self.profile.agent_type)
            .with_capabilities(&self.profile.capabilities)
            .with_meta(meta.clone());
        self.registry.register(registration).await?;
        self.hub.register(&self.profile.agent_id, meta);

        metrics().agent_registered();
        info!(
            agent_id = %self.profile.agent_id,
            capabilities = ?self.profile.capabilities,
            "Worker registered"
        );
        Ok(())
    }

    /// Handle one mailbox message
    pub async fn handle(&self, message: Message) -> MeshResult<()> {
        match message.kind {
            MessageKind::TaskAssignment => {
                let reply = match serde_json::from_value::<Task>(message.payload.clone()) {
                    Ok(task) => {
                        let report = self.process_task(&task).await;
                        let payload = serde_json::to_value(&report)
                            .map_err(|e| MeshError::internal_error(format!("encode report: {e}")))?;
                        message.reply(MessageKind::ResultReport, payload)
                    }
                    Err(e) => {
                        warn!(agent_id = %self.profile.agent_id, error = %e, "Malformed task assignment");
                        message.reply(
                            MessageKind::ErrorReport,
                            json!({ "error": format!("malformed task assignment: {e}") }),
                        )
                    }
                };
                self.hub.send(reply)?;
            }
            MessageKind::CollaborationRequest => {
                let session_id = message
                    .payload
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let finding = self.finding_for(session_id);
                let reply = message.reply(
                    MessageKind::CollaborationResponse,
                    json!({
                        "agent_id": self.profile.agent_id,
                        "agent_type": self.profile.agent_type,
                        "session_id": session_id,
                        "finding": finding,
                        "evidence": finding.as_ref().and_then(|f| f.get("evidence")).cloned().unwrap_or(json!([])),
                        "confidence": finding.as_ref().and_then(|f| f.get("confidence")).cloned(),
                    }),
                );
                self.hub.send(reply)?;
            }
            other => {
                debug!(agent_id = %self.profile.agent_id, kind = %other, "Ignoring message");
            }
        }
        Ok(())
    }

    /// Analyze one task and build its report
    pub async fn process_task(&self, task: &Task) -> TaskReport {
        debug!(agent_id = %self.profile.agent_id, task_id = %task.id, task_type = %task.task_type, "Processing task");
        let result = self.analyzer.analyze(task).await;
        if let Some(session_id) = task.session_id() {
            self.remember(session_id, result.clone());
        }
        TaskReport::completed(task, &self.profile.agent_id, &self.profile.agent_type, result)
    }

    fn remember(&self, session_id: &str, finding: Value) {
        let mut findings = self.findings.lock().unwrap_or_else(PoisonError::into_inner);
        if findings.len() >= FINDINGS_RETAINED && !findings.contains_key(session_id) {
            findings.clear();
        }
        findings.insert(session_id.to_string(), finding);
    }

    fn finding_for(&self, session_id: &str) -> Option<Value> {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Run the mailbox and heartbeat loop until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let agent_id = self.profile.agent_id.clone();
            let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
            info!(agent_id = %agent_id, "Worker started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        match self.registry.heartbeat(&agent_id, 0.0, 0).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(agent_id = %agent_id, "Worker no longer registered, re-registering");
                                if let Err(e) = self.register().await {
                                    warn!(agent_id = %agent_id, error = %e, "Re-registration failed");
                                }
                            }
                            Err(e) => warn!(agent_id = %agent_id, error = %e, "Heartbeat failed"),
                        }
                    }
                    received = self.hub.receive(&agent_id, Some(RECEIVE_TIMEOUT)) => {
                        if let Some(message) = received {
                            if let Err(e) = self.handle(message).await {
                                warn!(agent_id = %agent_id, error = %e, "Failed to handle message");
                            }
                        }
                    }
                }
            }

            if let Err(e) = self.registry.unregister(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to unregister worker");
            }
            self.hub.unregister(&agent_id);
            info!(agent_id = %agent_id, "Worker stopped");
        })
    }
}

/// Register and start one worker per profile
pub async fn spawn_roster(
    profiles: Vec<WorkerProfile>,
    hub: Arc<CommunicationHub>,
    registry: Arc<dyn AgentStore>,
    inference: Arc<dyn InferenceService>,
    heartbeat_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> MeshResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let worker = Arc::new(
            WorkerAgent::new(profile, hub.clone(), registry.clone(), inference.clone())
                .with_heartbeat_interval(heartbeat_interval),
        );
        worker.register().await?;
        handles.push(worker.spawn(shutdown.clone()));
    }
    Ok(handles)
}

#[derive(Debug, Clone)]
pub struct RemoteWorkerSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RemoteWorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Run a worker against a remote hub until `shutdown` flips to true
///
/// Registers, then polls for tasks and pushes results, heartbeating on its own
/// interval. Unregisters on the way out. Returns the number of tasks processed.
pub async fn run_remote_worker<T: AgentTransport>(
    transport: &T,
    profile: &WorkerProfile,
    analyzer: &TaskAnalyzer,
    settings: RemoteWorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64, T::Error> {
    transport
        .register(RegisterRequest {
            agent_id: transport.agent_id().to_string(),
            agent_type: profile.agent_type.clone(),
            capabilities: profile.capabilities.clone(),
            meta: Map::new(),
            cpu: 0.0,
            load: 0,
        })
        .await?;
    info!(agent_id = %transport.agent_id(), "Remote worker registered");

    let mut processed = 0u64;
    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
    let mut poll = tokio::time::interval(settings.poll_interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                transport.heartbeat(0.0, 0).await?;
            }
            _ = poll.tick() => {
                while let Some(task) = transport.poll_next_task().await? {
                    let result = analyzer.analyze(&task).await;
                    match transport.send_task_result(&task.id, Some(result), None).await {
                        Ok(()) => processed += 1,
                        Err(e) => warn!(task_id = %task.id, error = %e, "Hub refused task result"),
                    }
                }
            }
        }
    }

    transport.unregister().await?;
    info!(agent_id = %transport.agent_id(), processed, "Remote worker stopped");
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RuleOnlyInference;
    use crate::registry::MemoryAgentStore;

    fn worker(hub: Arc<CommunicationHub>) -> WorkerAgent {
        WorkerAgent::new(
            WorkerProfile::new("toxicity_detector", "toxicity_detector", &["toxicity_detection"]),
            hub,
            Arc::new(MemoryAgentStore::new()),
            Arc::new(RuleOnlyInference),
        )
    }

    #[test]
    fn test_lexical_classification_flags_abuse() {
        let classification = lexical_classification("toxicity_detection", "You are a stupid idiot, I will kill you");

        assert_eq!(classification.label, "harmful");
        assert!(classification.risk_score > 0.8);
        assert!(classification.categories.contains(&"threat".to_string()));
        assert_eq!(classification.confidence, HEURISTIC_CONFIDENCE);
    }

    #[test]
    fn test_lexical_classification_of_clean_text() {
        let classification = lexical_classification("toxicity_detection", "Lovely weather for a picnic today");

        assert_eq!(classification.label, "benign");
        assert_eq!(classification.risk_score, 0.0);
        assert!(classification.evidence.is_empty());
    }

    #[test]
    fn test_default_roster_covers_every_task_type() {
        let roster = default_roster();
        for task_type in crate::protocol::TaskType::ALL {
            assert!(
                roster
                    .iter()
                    .any(|p| p.capabilities.iter().any(|c| c == task_type.as_str())),
                "no worker handles {task_type}"
            );
        }
    }

    #[tokio::test]
    async fn test_assignment_is_answered_with_correlated_report() {
        let hub = Arc::new(CommunicationHub::new());
        hub.register("router", Map::new());
        let worker = worker(hub.clone());
        worker.register().await.unwrap();

        let mut task = Task::new("toxicity_detection", "you idiot");
        task.context.insert("session_id".to_string(), json!("s-1"));
        let assignment = Message::new(
            "router",
            "toxicity_detector",
            MessageKind::TaskAssignment,
            serde_json::to_value(&task).unwrap(),
        )
        .with_correlation(task.id.clone());

        worker.handle(assignment).await.unwrap();

        let reply = hub.receive("router", None).await.unwrap();
        assert_eq!(reply.kind, MessageKind::ResultReport);
        assert_eq!(reply.correlation_id.as_deref(), Some(task.id.as_str()));
        let report: TaskReport = serde_json::from_value(reply.payload).unwrap();
        assert!(report.is_completed());
        assert_eq!(report.result["method"], "rule_based");
        assert!(report.result["toxicity_score"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_clarification_is_answered_from_session_findings() {
        let hub = Arc::new(CommunicationHub::new());
        hub.register("arbitrator", Map::new());
        let worker = worker(hub.clone());
        worker.register().await.unwrap();

        let mut task = Task::new("toxicity_detection", "you stupid idiot");
        task.context.insert("session_id".to_string(), json!("s-9"));
        worker.process_task(&task).await;

        let request = Message::new(
            "arbitrator",
            "toxicity_detector",
            MessageKind::CollaborationRequest,
            json!({"session_id": "s-9", "request_type": "clarification"}),
        )
        .with_correlation("c-1");
        worker.handle(request).await.unwrap();

        let reply = hub.receive("arbitrator", None).await.unwrap();
        assert_eq!(reply.kind, MessageKind::CollaborationResponse);
        assert_eq!(reply.payload["finding"]["label"], "questionable");
        assert_eq!(reply.payload["evidence"][0], "matched 'idiot'");
    }

    #[tokio::test]
    async fn test_spawned_worker_unregisters_on_shutdown() {
        let hub = Arc::new(CommunicationHub::new());
        let registry: Arc<dyn AgentStore> = Arc::new(MemoryAgentStore::new());
        let (tx, rx) = watch::channel(false);
        let handles = spawn_roster(
            default_roster(),
            hub.clone(),
            registry.clone(),
            Arc::new(RuleOnlyInference),
            Duration::from_secs(60),
            rx,
        )
        .await
        .unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 6);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(registry.list().await.unwrap().is_empty());
        assert!(!hub.is_active("toxicity_detector"));
    }
}
