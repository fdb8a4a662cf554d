//! End-to-end moderation session: router, then arbitrator

use crate::consensus::{Arbitration, ArbitrationResult, Arbitrator};
use crate::router::{RoutingSession, TaskRouter};
use crate::session_span;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Instrument};
use uuid::Uuid;

/// One content item to moderate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub content: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_platform() -> String {
    "general".to_string()
}

impl ModerationRequest {
    pub fn new<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            platform: default_platform(),
            context: Map::new(),
            session_id: None,
        }
    }

    pub fn with_platform<S: Into<String>>(mut self, platform: S) -> Self {
        self.platform = platform.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationOutcome {
    pub session_id: String,
    pub result: ArbitrationResult,
    /// Absent when routing itself failed
    pub routing: Option<RoutingSession>,
    pub arbitration: Option<Arbitration>,
    pub processing_time_ms: u64,
}

pub struct ModerationPipeline {
    router: Arc<TaskRouter>,
    arbitrator: Arc<Arbitrator>,
}

impl ModerationPipeline {
    pub fn new(router: Arc<TaskRouter>, arbitrator: Arc<Arbitrator>) -> Self {
        Self { router, arbitrator }
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn arbitrator(&self) -> &Arc<Arbitrator> {
        &self.arbitrator
    }

    /// Run one session to a verdict. Never fails: a broken stage escalates.
    pub async fn moderate(&self, request: ModerationRequest) -> ModerationOutcome {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = session_span!(session_id = %session_id, platform = %request.platform);
        self.run(session_id, request).instrument(span).await
    }

    async fn run(&self, session_id: String, request: ModerationRequest) -> ModerationOutcome {
        let started = Instant::now();
        let mut context = request.context;
        context.insert("session_id".to_string(), json!(session_id));

        let routing = match self
            .router
            .process_content(&request.content, &request.platform, context)
            .await
        {
            Ok(routing) => routing,
            Err(e) => {
                error!(error = %e, "Routing failed, escalating");
                return ModerationOutcome {
                    session_id,
                    result: ArbitrationResult::escalated(format!("routing stage failed: {e}")),
                    routing: None,
                    arbitration: None,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let arbitration = self
            .arbitrator
            .arbitrate(&session_id, &request.content, &routing.reports)
            .await;
        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            decision = %arbitration.result.final_decision,
            confidence = arbitration.result.confidence_score,
            processing_time_ms,
            "Moderation complete"
        );

        ModerationOutcome {
            session_id,
            result: arbitration.result.clone(),
            routing: Some(routing),
            arbitration: Some(arbitration),
            processing_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ArbitratorSettings, FinalDecision};
    use crate::hub::CommunicationHub;
    use crate::inference::RuleOnlyInference;
    use crate::registry::MemoryAgentStore;
    use crate::router::RouterSettings;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_agents_escalates_instead_of_failing() {
        let hub = Arc::new(CommunicationHub::new());
        let inference = Arc::new(RuleOnlyInference);
        let router = Arc::new(TaskRouter::new(
            hub.clone(),
            Arc::new(MemoryAgentStore::new()),
            inference.clone(),
            RouterSettings {
                dispatch_timeout: Duration::from_millis(50),
            },
        ));
        let arbitrator = Arc::new(Arbitrator::new(hub, inference, ArbitratorSettings::default()));
        let pipeline = ModerationPipeline::new(router, arbitrator);

        let mut request = ModerationRequest::new("hello there");
        request.session_id = Some("fixed".to_string());
        let outcome = pipeline.moderate(request).await;

        assert_eq!(outcome.session_id, "fixed");
        assert_eq!(outcome.result.final_decision, FinalDecision::NeedsHumanReview);
        let routing = outcome.routing.unwrap();
        assert!(routing.reports.iter().all(|r| !r.is_completed()));
    }
}
