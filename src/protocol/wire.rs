//! Request and response bodies shared by the HTTP, WebSocket, gRPC and JSON-RPC adapters

use crate::protocol::messages::{TaskRequest, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error codes returned to remote callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownReceiver,
    Timeout,
    NoCapableAgent,
    InferenceFailure,
    AuthFailure,
    TaskNotFound,
    InvalidInput,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub load: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub load: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnregisterRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitTaskRequest {
    pub agent_id: String,
    pub task: TaskRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitBatchRequest {
    pub agent_id: String,
    pub tasks: Vec<TaskRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskIdRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResultRequest {
    pub task_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitBatchResponse {
    pub task_ids: Vec<String>,
}

/// Answer to `get_task_status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
