//! Transport adapters for remote agents
//!
//! Four wire protocols expose the same operations: short-poll HTTP, a duplex
//! WebSocket, a bidirectional gRPC stream and JSON-RPC notifications. The server
//! halves decode frames and hand them to the [`Coordinator`]; the client halves
//! implement [`AgentTransport`] so a remote worker can run over any of them.

use crate::error::{MeshError, MeshResult};
use crate::protocol::{ErrorBody, ErrorCode, RegisterRequest, Task};
use serde_json::Value;
use thiserror::Error;

pub mod coordinator;
pub mod grpc;
pub mod http;
pub mod rpc;
pub mod ws;

pub use coordinator::Coordinator;
pub use grpc::GrpcAgentClient;
pub use http::HttpAgentClient;
pub use rpc::RpcAgentClient;
pub use ws::WsAgentClient;

/// Header carrying the shared secret on HTTP and gRPC calls
pub const API_KEY_HEADER: &str = "x-api-key";

/// Client side of the agent protocol
///
/// One value is bound to one agent id for its whole life; `register` must be
/// called before anything else.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Agent id this transport speaks for
    fn agent_id(&self) -> &str;

    async fn register(&self, request: RegisterRequest) -> Result<(), Self::Error>;

    async fn heartbeat(&self, cpu: f64, load: u32) -> Result<(), Self::Error>;

    async fn send_task_result(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), Self::Error>;

    /// Next queued task for this agent, if any
    async fn poll_next_task(&self) -> Result<Option<Task>, Self::Error>;

    async fn unregister(&self) -> Result<(), Self::Error>;
}

/// A connection speaks for the first agent it registered
pub(crate) fn ensure_session_agent(bound: Option<&str>, agent_id: &str) -> MeshResult<()> {
    match bound {
        Some(bound) if bound != agent_id => Err(MeshError::invalid_input(format!(
            "connection already registered as '{bound}'"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gRPC call failed: {0}")]
    Grpc(Box<tonic::Status>),

    #[error("gRPC connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Remote rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Connection closed by peer")]
    Closed,

    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Grpc(Box::new(status))
    }
}

impl From<ErrorBody> for TransportError {
    fn from(body: ErrorBody) -> Self {
        TransportError::Rejected {
            code: body.code,
            message: body.message,
        }
    }
}

impl TransportError {
    /// Whether the hub refused the shared secret
    pub fn is_auth_failure(&self) -> bool {
        match self {
            TransportError::Rejected { code, .. } => *code == ErrorCode::AuthFailure,
            TransportError::Grpc(status) => status.code() == tonic::Code::Unauthenticated,
            _ => false,
        }
    }
}
