//! End-to-end moderation sessions
//!
//! Runs the built-in worker roster on an in-process hub with a scripted
//! inference backend and checks:
//! - judged plans, classifications and verdicts flow through unchanged
//! - a strong majority overrides a disagreeing verdict
//! - high average risk never ends in an approval
//! - with inference down every stage falls back and the session still settles
//! - `POST /moderate` serves the same session over the gateway

use agentmesh::consensus::{ArbitrationMethod, ArbitratorSettings, Bucket, FinalDecision};
use agentmesh::inference::{InferenceService, InferenceStage};
use agentmesh::router::decompose::PlanMethod;
use agentmesh::router::RouterSettings;
use agentmesh::testing::mocks::{
    arbitration_reply, classification_reply, plan_reply, MockInferenceService, Scripted,
};
use agentmesh::transport::http::gateway;
use agentmesh::worker::{default_roster, spawn_roster};
use agentmesh::{
    ApiKeyAuth, Arbitrator, CommunicationHub, Coordinator, MemoryAgentStore, ModerationPipeline,
    ModerationRequest, TaskBoard, TaskRouter,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warp::http::StatusCode;

const KEY: &str = "pipeline-secret";

struct Node {
    coordinator: Arc<Coordinator>,
    pipeline: Arc<ModerationPipeline>,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for worker in self.workers {
            worker.await.unwrap();
        }
    }
}

async fn start_node(inference: Arc<MockInferenceService>) -> Node {
    let hub = Arc::new(CommunicationHub::new());
    let registry = Arc::new(MemoryAgentStore::new());
    let coordinator = Arc::new(Coordinator::new(
        ApiKeyAuth::new([KEY]),
        registry.clone(),
        Arc::new(TaskBoard::new()),
        hub.clone(),
    ));
    let inference: Arc<dyn InferenceService> = inference;

    let router = Arc::new(TaskRouter::new(
        hub.clone(),
        registry.clone(),
        inference.clone(),
        RouterSettings {
            dispatch_timeout: Duration::from_secs(5),
        },
    ));
    let arbitrator = Arc::new(Arbitrator::new(
        hub.clone(),
        inference.clone(),
        ArbitratorSettings {
            clarification_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let workers = spawn_roster(
        default_roster(),
        hub,
        registry,
        inference,
        Duration::from_secs(5),
        shutdown_rx,
    )
    .await
    .unwrap();

    Node {
        coordinator,
        pipeline: Arc::new(ModerationPipeline::new(router, arbitrator)),
        workers,
        shutdown,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_judged_session_is_approved() {
    // Arrange
    let inference = Arc::new(
        MockInferenceService::new()
            .with_reply(
                InferenceStage::Decomposition,
                plan_reply(&["toxicity_detection", "sentiment_analysis"]),
            )
            .with_reply(
                InferenceStage::Classification,
                classification_reply("benign", 0.9, 0.1),
            )
            .with_reply(InferenceStage::Arbitration, arbitration_reply("approved", 0.85)),
    );
    let node = start_node(inference.clone()).await;

    // Act
    let outcome = node
        .pipeline
        .moderate(ModerationRequest::new("What a lovely photo of your garden"))
        .await;

    // Assert
    let routing = outcome.routing.as_ref().unwrap();
    assert_eq!(routing.plan.method, PlanMethod::Inference);
    assert_eq!(routing.reports.len(), 2);
    assert!(routing.reports.iter().all(|r| r.is_completed()));
    let mut agents: Vec<&str> = routing.reports.iter().map(|r| r.agent_id.as_str()).collect();
    agents.sort_unstable();
    assert_eq!(agents, vec!["sentiment_analyzer", "toxicity_detector"]);

    let arbitration = outcome.arbitration.as_ref().unwrap();
    assert_eq!(arbitration.analysis.majority, Some(Bucket::Approve));
    assert_eq!(arbitration.analysis.consensus_score, 1.0);
    assert!(arbitration.clarifications.is_empty());

    assert_eq!(outcome.result.final_decision, FinalDecision::Approved);
    assert_eq!(outcome.result.method, ArbitrationMethod::Inference);
    assert!((outcome.result.confidence_score - 0.85).abs() < 1e-9);
    assert!(outcome.result.adjustments.is_empty());

    assert_eq!(inference.calls(InferenceStage::Decomposition).await, 1);
    assert_eq!(inference.calls(InferenceStage::Classification).await, 2);
    assert_eq!(inference.calls(InferenceStage::Arbitration).await, 1);
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strong_majority_overrides_verdict() {
    // Arrange: every agent sees high risk, the arbitration model says approve
    let inference = Arc::new(
        MockInferenceService::new()
            .with_reply(
                InferenceStage::Decomposition,
                plan_reply(&["toxicity_detection", "risk_assessment", "sentiment_analysis"]),
            )
            .with_reply(
                InferenceStage::Classification,
                classification_reply("harmful", 0.9, 0.95),
            )
            .with_reply(InferenceStage::Arbitration, arbitration_reply("approved", 0.9)),
    );
    let node = start_node(inference).await;

    // Act
    let outcome = node
        .pipeline
        .moderate(ModerationRequest::new("content every agent dislikes"))
        .await;

    // Assert
    assert_eq!(outcome.result.final_decision, FinalDecision::Rejected);
    assert_eq!(outcome.result.confidence_score, 1.0);
    assert!(outcome
        .result
        .adjustments
        .iter()
        .any(|a| a.contains("strong consensus")));
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_high_average_risk_is_never_approved() {
    // Arrange: two rejects and one review keep consensus below the strong bar
    let inference = Arc::new(
        MockInferenceService::new()
            .with_reply(
                InferenceStage::Decomposition,
                plan_reply(&["toxicity_detection", "risk_assessment", "sentiment_analysis"]),
            )
            .with_script(
                InferenceStage::Classification,
                vec![
                    Scripted::Reply(classification_reply("harmful", 0.9, 0.99)),
                    Scripted::Reply(classification_reply("harmful", 0.9, 0.99)),
                    Scripted::Reply(classification_reply("borderline", 0.9, 0.5)),
                ],
            )
            .with_reply(InferenceStage::Arbitration, arbitration_reply("approved", 0.9)),
    );
    let node = start_node(inference).await;

    // Act
    let outcome = node
        .pipeline
        .moderate(ModerationRequest::new("mixed signals"))
        .await;

    // Assert
    let analysis = &outcome.arbitration.as_ref().unwrap().analysis;
    assert!(analysis.average_risk_score > 0.8);
    assert!(analysis.consensus_score < 0.8);
    assert_eq!(outcome.result.final_decision, FinalDecision::NeedsHumanReview);
    assert!(outcome.result.reasoning.contains("safety override"));
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inference_outage_falls_back_at_every_stage() {
    // Arrange: no scripts, every inference call fails
    let inference = Arc::new(MockInferenceService::new());
    let node = start_node(inference.clone()).await;

    // Act
    let outcome = node
        .pipeline
        .moderate(ModerationRequest::new("Have a nice day"))
        .await;

    // Assert: short content plans the four mandatory tasks
    let routing = outcome.routing.as_ref().unwrap();
    assert_eq!(routing.plan.method, PlanMethod::RuleBased);
    assert!(routing.plan.fallback_reason.is_some());
    assert_eq!(routing.reports.len(), 4);
    for report in &routing.reports {
        assert!(report.is_completed(), "report {report:?}");
        assert_eq!(report.result["method"], "rule_based");
    }

    // Heuristic findings are uncertain, so every agent is asked to clarify
    let arbitration = outcome.arbitration.as_ref().unwrap();
    assert_eq!(arbitration.clarifications.len(), 4);
    assert!(arbitration.clarifications.iter().all(|c| c.response_received));

    assert_eq!(outcome.result.method, ArbitrationMethod::RuleBased);
    assert!(inference.calls(InferenceStage::Arbitration).await >= 1);
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_moderate_route_serves_sessions() {
    // Arrange
    let inference = Arc::new(
        MockInferenceService::new()
            .with_reply(
                InferenceStage::Decomposition,
                plan_reply(&["toxicity_detection"]),
            )
            .with_reply(
                InferenceStage::Classification,
                classification_reply("benign", 0.95, 0.05),
            )
            .with_reply(InferenceStage::Arbitration, arbitration_reply("approved", 0.9)),
    );
    let node = start_node(inference).await;
    let filter = gateway(node.coordinator.clone(), Some(node.pipeline.clone()));

    // Act
    let ok = warp::test::request()
        .method("POST")
        .path("/moderate")
        .header("x-api-key", KEY)
        .json(&json!({"content": "nice post", "platform": "forum", "session_id": "s-1"}))
        .reply(&filter)
        .await;
    let empty = warp::test::request()
        .method("POST")
        .path("/moderate")
        .header("x-api-key", KEY)
        .json(&json!({"content": "   "}))
        .reply(&filter)
        .await;
    let denied = warp::test::request()
        .method("POST")
        .path("/moderate")
        .header("x-api-key", "wrong")
        .json(&json!({"content": "nice post"}))
        .reply(&filter)
        .await;

    // Assert
    assert_eq!(ok.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(ok.body()).unwrap();
    assert_eq!(body["session_id"], "s-1");
    assert_eq!(body["result"]["final_decision"], "approved");
    assert_eq!(body["routing"]["platform"], "forum");

    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(empty.body()).unwrap();
    assert_eq!(body["code"], "invalid_input");

    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    node.stop().await;
}
