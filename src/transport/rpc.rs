//! JSON-RPC 2.0 adapter at `POST /rpc`
//!
//! Agent-side state changes are notifications (no `id`) and are answered with
//! an empty 204: `agent/register`, `agent/heartbeat`, `agent/unregister`,
//! `task/result`. Queries carry an `id` and get a result or error object:
//! `task/next`, `task/submit`, `task/status`, `task/cancel`.
//!
//! A notification that fails is still answered, with the HTTP status the REST
//! adapter would use and an error object whose `id` is null, so a rejected
//! secret is never silent. There is no connection to drop; a silent agent is
//! evicted by the liveness monitor.

use super::http::status_for;
use super::{AgentTransport, Coordinator, TransportError, API_KEY_HEADER};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    ErrorCode, HeartbeatRequest, RegisterRequest, SubmitTaskRequest, Task, TaskIdRequest,
    TaskResultRequest, TaskStatusView, UnregisterRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Reply};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const AUTH_FAILED: i64 = -32001;
pub const NOT_FOUND: i64 = -32004;
pub const SERVER_ERROR: i64 = -32000;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn call(method: &str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(json!(id)),
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&MeshError> for RpcError {
    fn from(error: &MeshError) -> Self {
        let body = error.to_wire();
        let code = match error {
            MeshError::AuthFailure { .. } => AUTH_FAILED,
            MeshError::InvalidInput { .. } => INVALID_PARAMS,
            MeshError::TaskNotFound { .. } | MeshError::UnknownReceiver { .. } => NOT_FOUND,
            MeshError::Internal { .. } => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };
        Self {
            code,
            message: body.message,
            data: Some(json!({ "code": body.code })),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Why a call failed: a decoding problem or a coordinator error
enum Failure {
    Rpc(RpcError),
    Mesh(MeshError),
}

impl Failure {
    fn status(&self) -> StatusCode {
        match self {
            Failure::Rpc(_) => StatusCode::BAD_REQUEST,
            Failure::Mesh(e) => status_for(e),
        }
    }

    fn into_error(self) -> RpcError {
        match self {
            Failure::Rpc(e) => e,
            Failure::Mesh(e) => RpcError::from(&e),
        }
    }
}

impl From<MeshError> for Failure {
    fn from(error: MeshError) -> Self {
        Failure::Mesh(error)
    }
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, Failure> {
    serde_json::from_value(value)
        .map_err(|e| Failure::Rpc(RpcError::new(INVALID_PARAMS, format!("invalid params: {e}"))))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, Failure> {
    serde_json::to_value(value)
        .map_err(|e| Failure::Mesh(MeshError::internal_error(e.to_string())))
}

/// `POST /rpc` route
pub fn routes(coordinator: Arc<Coordinator>) -> BoxedFilter<(Response,)> {
    warp::path("rpc")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::optional::<String>(API_KEY_HEADER))
        .and(warp::body::content_length_limit(1024 * 1024))
        .and(warp::body::bytes())
        .and_then(move |key: Option<String>, body: Bytes| {
            let coordinator = coordinator.clone();
            async move { Ok::<_, Infallible>(handle_body(&coordinator, key.as_deref(), &body).await) }
        })
        .boxed()
}

async fn handle_body(coordinator: &Coordinator, api_key: Option<&str>, body: &[u8]) -> Response {
    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            let error = RpcError::new(PARSE_ERROR, format!("parse error: {e}"));
            return reply(StatusCode::BAD_REQUEST, RpcResponse::failure(Value::Null, error));
        }
    };

    if request.jsonrpc != "2.0" {
        let error = RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\"");
        let id = request.id.unwrap_or(Value::Null);
        return reply(StatusCode::BAD_REQUEST, RpcResponse::failure(id, error));
    }

    let outcome = dispatch(coordinator, api_key, &request.method, request.params).await;
    match (request.id, outcome) {
        (None, Ok(_)) => StatusCode::NO_CONTENT.into_response(),
        (None, Err(failure)) => {
            debug!(method = %request.method, "JSON-RPC notification rejected");
            let status = failure.status();
            reply(status, RpcResponse::failure(Value::Null, failure.into_error()))
        }
        (Some(id), Ok(result)) => reply(StatusCode::OK, RpcResponse::success(id, result)),
        (Some(id), Err(failure)) => {
            reply(StatusCode::OK, RpcResponse::failure(id, failure.into_error()))
        }
    }
}

fn reply(status: StatusCode, body: RpcResponse) -> Response {
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn dispatch(
    coordinator: &Coordinator,
    api_key: Option<&str>,
    method: &str,
    raw: Value,
) -> Result<Value, Failure> {
    match method {
        "agent/register" => {
            let request: RegisterRequest = params(raw)?;
            to_value(coordinator.register(api_key, request).await?)
        }
        "agent/heartbeat" => {
            let request: HeartbeatRequest = params(raw)?;
            coordinator.heartbeat(api_key, request).await?;
            Ok(Value::Null)
        }
        "agent/unregister" => {
            let request: UnregisterRequest = params(raw)?;
            let removed = coordinator.unregister(api_key, &request.agent_id).await?;
            Ok(json!({ "removed": removed }))
        }
        "task/result" => {
            let request: TaskResultRequest = params(raw)?;
            coordinator
                .submit_result(api_key, &request.task_id, request.result, request.error)
                .await?;
            Ok(Value::Null)
        }
        "task/next" => {
            let request: UnregisterRequest = params(raw)?;
            to_value(coordinator.poll_next_task(api_key, &request.agent_id).await?)
        }
        "task/submit" => {
            let request: SubmitTaskRequest = params(raw)?;
            let task_id = coordinator.submit_task(api_key, request).await?;
            Ok(json!({ "task_id": task_id }))
        }
        "task/status" => {
            let request: TaskIdRequest = params(raw)?;
            to_value(coordinator.task_status(api_key, &request.task_id).await?)
        }
        "task/cancel" => {
            let request: TaskIdRequest = params(raw)?;
            let status = coordinator.cancel_task(api_key, &request.task_id).await?;
            Ok(json!({ "task_id": request.task_id, "status": status }))
        }
        other => Err(Failure::Rpc(RpcError::new(
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        ))),
    }
}

/// Remote agent speaking JSON-RPC over `POST /rpc`
#[derive(Debug)]
pub struct RpcAgentClient {
    client: reqwest::Client,
    endpoint: String,
    agent_id: String,
    api_key: String,
    next_id: AtomicU64,
}

impl RpcAgentClient {
    /// `endpoint` is the full URL of the `/rpc` route
    pub fn new<A: Into<String>, K: Into<String>>(
        endpoint: &str,
        agent_id: A,
        api_key: K,
    ) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(endpoint)
            .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(Self {
            client: reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()?,
            endpoint: endpoint.to_string(),
            agent_id: agent_id.into(),
            api_key: api_key.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, request: &RpcRequest) -> Result<reqwest::Response, TransportError> {
        Ok(self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let response = self.post(&RpcRequest::notification(method, params)).await?;
        if response.status() == StatusCode::NO_CONTENT.as_u16() {
            return Ok(());
        }
        let body: RpcResponse = response.json().await?;
        Err(rejection(body.error))
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body: RpcResponse = self
            .post(&RpcRequest::call(method, params, id))
            .await?
            .json()
            .await?;

        if body.error.is_some() {
            return Err(rejection(body.error));
        }
        Ok(serde_json::from_value(body.result.unwrap_or(Value::Null))?)
    }

    pub async fn submit_task(&self, request: SubmitTaskRequest) -> Result<String, TransportError> {
        let reply: Value = self.call("task/submit", serde_json::to_value(&request)?).await?;
        reply
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("task/submit reply has no task_id".to_string()))
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusView, TransportError> {
        self.call("task/status", json!({ "task_id": task_id })).await
    }
}

fn rejection(error: Option<RpcError>) -> TransportError {
    let Some(error) = error else {
        return TransportError::Protocol("JSON-RPC reply without result or error".to_string());
    };
    let code = error
        .data
        .as_ref()
        .and_then(|data| data.get("code"))
        .and_then(|code| serde_json::from_value::<ErrorCode>(code.clone()).ok());
    match code {
        Some(code) => TransportError::Rejected {
            code,
            message: error.message,
        },
        None if error.code == AUTH_FAILED => TransportError::Rejected {
            code: ErrorCode::AuthFailure,
            message: error.message,
        },
        None => TransportError::Protocol(format!("JSON-RPC error {}: {}", error.code, error.message)),
    }
}

#[async_trait::async_trait]
impl AgentTransport for RpcAgentClient {
    type Error = TransportError;

    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn register(&self, mut request: RegisterRequest) -> Result<(), TransportError> {
        request.agent_id = self.agent_id.clone();
        self.notify("agent/register", serde_json::to_value(&request)?)
            .await
    }

    async fn heartbeat(&self, cpu: f64, load: u32) -> Result<(), TransportError> {
        let request = HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            cpu,
            load,
        };
        self.notify("agent/heartbeat", serde_json::to_value(&request)?)
            .await
    }

    async fn send_task_result(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        let request = TaskResultRequest {
            task_id: task_id.to_string(),
            result,
            error,
        };
        self.notify("task/result", serde_json::to_value(&request)?)
            .await
    }

    async fn poll_next_task(&self) -> Result<Option<Task>, TransportError> {
        self.call("task/next", json!({ "agent_id": self.agent_id }))
            .await
    }

    async fn unregister(&self) -> Result<(), TransportError> {
        self.notify("agent/unregister", json!({ "agent_id": self.agent_id }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_omits_id() {
        let encoded = serde_json::to_value(RpcRequest::notification("agent/heartbeat", json!({}))).unwrap();
        assert!(encoded.get("id").is_none());
        assert_eq!(encoded["jsonrpc"], "2.0");
    }

    #[test]
    fn test_mesh_errors_map_to_rpc_codes() {
        assert_eq!(RpcError::from(&MeshError::auth_failure("bad")).code, AUTH_FAILED);
        assert_eq!(RpcError::from(&MeshError::invalid_input("bad")).code, INVALID_PARAMS);
        assert_eq!(RpcError::from(&MeshError::task_not_found("t")).code, NOT_FOUND);
    }

    #[test]
    fn test_rejection_recovers_error_code() {
        let error = RpcError::from(&MeshError::auth_failure("invalid API key"));
        assert!(rejection(Some(error)).is_auth_failure());

        let bare = RpcError::new(METHOD_NOT_FOUND, "unknown method 'x'");
        assert!(matches!(rejection(Some(bare)), TransportError::Protocol(_)));
    }
}
