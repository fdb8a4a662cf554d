//! HTTP and JSON-RPC adapter tests
//!
//! Drives the warp gateway in-process with `warp::test` and checks:
//! - the shared secret guards every route
//! - a task submitted over REST can be polled, answered and queried
//! - error bodies carry protocol codes and the documented HTTP statuses
//! - JSON-RPC notifications answer 204 and requests answer result or error

use agentmesh::protocol::{ErrorBody, ErrorCode, Task, TaskStatus, TaskStatusView};
use agentmesh::transport::http::gateway;
use agentmesh::{ApiKeyAuth, CommunicationHub, Coordinator, MemoryAgentStore, TaskBoard};
use serde_json::{json, Value};
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;

const KEY: &str = "test-secret";

fn setup() -> (Arc<Coordinator>, BoxedFilter<(Response,)>) {
    let coordinator = Arc::new(Coordinator::new(
        ApiKeyAuth::new([KEY]),
        Arc::new(MemoryAgentStore::new()),
        Arc::new(TaskBoard::new()),
        Arc::new(CommunicationHub::new()),
    ));
    let filter = gateway(coordinator.clone(), None);
    (coordinator, filter)
}

async fn post(filter: &BoxedFilter<(Response,)>, path: &str, key: &str, body: Value) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method("POST")
        .path(path)
        .header("x-api-key", key)
        .json(&body)
        .reply(filter)
        .await;
    let status = response.status();
    let body = if response.body().is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(response.body()).unwrap()
    };
    (status, body)
}

async fn get(filter: &BoxedFilter<(Response,)>, path: &str, key: &str) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method("GET")
        .path(path)
        .header("x-api-key", key)
        .reply(filter)
        .await;
    (response.status(), serde_json::from_slice(response.body()).unwrap())
}

fn registration(agent_id: &str) -> Value {
    json!({
        "agent_id": agent_id,
        "agent_type": "toxicity_detector",
        "capabilities": ["toxicity_detection"],
        "cpu": 0.2,
        "load": 1
    })
}

#[tokio::test]
async fn test_wrong_secret_is_rejected_with_401() {
    // Arrange
    let (coordinator, filter) = setup();

    // Act
    let (status, body) = post(&filter, "/register", "wrong", registration("tox")).await;

    // Assert
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let error: ErrorBody = serde_json::from_value(body).unwrap();
    assert_eq!(error.code, ErrorCode::AuthFailure);
    assert!(!error.message.contains("wrong"));
    assert!(coordinator.registry().get("tox").await.unwrap().is_none());
}

#[tokio::test]
async fn test_task_lifecycle_over_rest() {
    // Arrange
    let (_coordinator, filter) = setup();
    let (status, _) = post(&filter, "/register", KEY, registration("tox")).await;
    assert_eq!(status, StatusCode::OK);

    // Act: submit, poll, answer
    let (status, submitted) = post(
        &filter,
        "/submit_task",
        KEY,
        json!({
            "agent_id": "tox",
            "task": {"task_type": "toxicity_detection", "content": "hello", "priority": 7}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = submitted["task_id"].as_str().unwrap().to_string();

    let (status, polled) = get(&filter, "/next_task/tox", KEY).await;
    assert_eq!(status, StatusCode::OK);
    let task: Task = serde_json::from_value(polled).unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.priority, 7);

    let (status, _) = post(
        &filter,
        "/submit_result",
        KEY,
        json!({"task_id": task_id, "result": {"label": "benign"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Assert
    let (status, view) = get(&filter, &format!("/task_status/{task_id}"), KEY).await;
    assert_eq!(status, StatusCode::OK);
    let view: TaskStatusView = serde_json::from_value(view).unwrap();
    assert_eq!(view.status, TaskStatus::Finished);
    assert_eq!(view.result, Some(json!({"label": "benign"})));

    let (_, empty) = get(&filter, "/next_task/tox", KEY).await;
    assert!(empty.is_null());
}

#[tokio::test]
async fn test_batch_submit_and_cancel() {
    let (_coordinator, filter) = setup();
    post(&filter, "/register", KEY, registration("tox")).await;

    let (status, batch) = post(
        &filter,
        "/submit_batch",
        KEY,
        json!({
            "agent_id": "tox",
            "tasks": [
                {"task_type": "toxicity_detection", "content": "a"},
                {"task_type": "toxicity_detection", "content": "b"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids = batch["task_ids"].as_array().unwrap().clone();
    assert_eq!(ids.len(), 2);

    let (status, cancelled) = post(&filter, "/cancel_task", KEY, json!({"task_id": ids[0]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (_, polled) = get(&filter, "/next_task/tox", KEY).await;
    assert_eq!(polled["id"], ids[1]);
}

#[tokio::test]
async fn test_error_statuses() {
    let (_coordinator, filter) = setup();

    let (status, body) = get(&filter, "/task_status/missing", KEY).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "task_not_found");

    let (status, _) = post(
        &filter,
        "/submit_task",
        KEY,
        json!({"agent_id": "nobody", "task": {"task_type": "toxicity_detection"}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = post(&filter, "/heartbeat", KEY, json!({"cpu": "high"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_health_and_metrics_are_public() {
    let (_coordinator, filter) = setup();

    let health = warp::test::request().path("/health").reply(&filter).await;
    assert_eq!(health.status(), StatusCode::OK);
    let health: Value = serde_json::from_slice(health.body()).unwrap();
    assert_eq!(health["status"], "healthy");

    let metrics = warp::test::request().path("/metrics").reply(&filter).await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let metrics: Value = serde_json::from_slice(metrics.body()).unwrap();
    assert!(metrics.get("tasks").is_some());
}

#[tokio::test]
async fn test_unregister_removes_agent_listing() {
    let (_coordinator, filter) = setup();
    post(&filter, "/register", KEY, registration("tox")).await;

    let (_, agents) = get(&filter, "/agents", KEY).await;
    assert_eq!(agents.as_array().unwrap().len(), 1);

    let (status, body) = post(&filter, "/unregister", KEY, json!({"agent_id": "tox"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (_, agents) = get(&filter, "/agents", KEY).await;
    assert!(agents.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_rpc_notifications_answer_no_content() {
    // Arrange
    let (coordinator, filter) = setup();

    // Act
    let (status, body) = post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "method": "agent/register", "params": registration("tox")}),
    )
    .await;

    // Assert
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());
    assert!(coordinator.registry().get("tox").await.unwrap().is_some());
    assert!(coordinator.hub().is_active("tox"));
}

#[tokio::test]
async fn test_rpc_requests_answer_with_result() {
    let (_coordinator, filter) = setup();
    post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "method": "agent/register", "params": registration("tox")}),
    )
    .await;

    let (status, submitted) = post(
        &filter,
        "/rpc",
        KEY,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "task/submit",
            "params": {"agent_id": "tox", "task": {"task_type": "toxicity_detection", "content": "x"}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(submitted["id"], 1);
    let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();

    let (_, next) = post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "id": 2, "method": "task/next", "params": {"agent_id": "tox"}}),
    )
    .await;
    assert_eq!(next["result"]["id"], task_id.as_str());

    let (status, _) = post(
        &filter,
        "/rpc",
        KEY,
        json!({
            "jsonrpc": "2.0",
            "method": "task/result",
            "params": {"task_id": task_id, "error": "model crashed"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, view) = post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "id": 3, "method": "task/status", "params": {"task_id": task_id}}),
    )
    .await;
    assert_eq!(view["result"]["status"], "failed");
    assert_eq!(view["result"]["error"], "model crashed");
}

#[tokio::test]
async fn test_rpc_error_codes() {
    let (_coordinator, filter) = setup();

    let (status, denied) = post(
        &filter,
        "/rpc",
        "wrong",
        json!({"jsonrpc": "2.0", "method": "agent/heartbeat", "params": {"agent_id": "tox"}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(denied["error"]["code"], -32001);
    assert!(denied["id"].is_null());

    let (_, unknown) = post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "id": 9, "method": "agent/dance"}),
    )
    .await;
    assert_eq!(unknown["error"]["code"], -32601);
    assert_eq!(unknown["id"], 9);

    let (_, invalid) = post(
        &filter,
        "/rpc",
        KEY,
        json!({"jsonrpc": "2.0", "id": 10, "method": "task/status", "params": {"id": 1}}),
    )
    .await;
    assert_eq!(invalid["error"]["code"], -32602);
}
