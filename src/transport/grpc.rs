//! Bidirectional gRPC streaming adapter
//!
//! One long-lived `agentmesh.AgentLink/Session` call per agent. Both directions
//! carry [`Frame`] messages whose `payload_json` holds the same JSON bodies the
//! HTTP adapter uses. Client frame kinds: `register`, `heartbeat`, `next_task`,
//! `task_result`, `unregister`. Server frame kinds: `ack`, `task`, `no_task`,
//! `error`.
//!
//! A bad secret ends the stream with `Unauthenticated`. The end of the inbound
//! stream unregisters the agent.

use super::{ensure_session_agent, AgentTransport, Coordinator, TransportError, API_KEY_HEADER};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{ErrorBody, HeartbeatRequest, RegisterRequest, Task, TaskResultRequest};
use crate::transport_span;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Status, Streaming};
use tracing::{debug, info, Instrument};

pub const SERVICE_NAME: &str = "agentmesh.AgentLink";
pub const SESSION_PATH: &str = "/agentmesh.AgentLink/Session";

const STREAM_BUFFER: usize = 32;

/// Envelope carried in both directions of the session stream
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub api_key: String,
    #[prost(string, tag = "3")]
    pub payload_json: String,
}

impl Frame {
    fn new(kind: &str, api_key: &str, payload: &Value) -> Self {
        Self {
            kind: kind.to_string(),
            api_key: api_key.to_string(),
            payload_json: if payload.is_null() {
                String::new()
            } else {
                payload.to_string()
            },
        }
    }

    fn reply(kind: &str, payload: &Value) -> Self {
        Self::new(kind, "", payload)
    }

    fn payload<T: for<'de> Deserialize<'de>>(&self) -> MeshResult<T> {
        let raw = if self.payload_json.is_empty() {
            "null"
        } else {
            &self.payload_json
        };
        serde_json::from_str(raw)
            .map_err(|e| MeshError::invalid_input(format!("bad '{}' payload: {e}", self.kind)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatPayload {
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    load: u32,
}

/// tonic service exposing the session stream
#[derive(Clone)]
pub struct AgentLinkServer {
    coordinator: Arc<Coordinator>,
}

impl AgentLinkServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl<B> Service<http::Request<B>> for AgentLinkServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            SESSION_PATH => {
                let session = SessionService(self.coordinator.clone());
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(ProstCodec::<Frame, Frame>::default());
                    Ok(grpc.streaming(session, req).await)
                })
            }
            _ => Box::pin(async move {
                let mut response = http::Response::new(empty_body());
                let headers = response.headers_mut();
                headers.insert(
                    Status::GRPC_STATUS,
                    (tonic::Code::Unimplemented as i32).into(),
                );
                headers.insert(
                    http::header::CONTENT_TYPE,
                    tonic::metadata::GRPC_CONTENT_TYPE,
                );
                Ok(response)
            }),
        }
    }
}

impl tonic::server::NamedService for AgentLinkServer {
    const NAME: &'static str = SERVICE_NAME;
}

struct SessionService(Arc<Coordinator>);

impl tonic::server::StreamingService<Frame> for SessionService {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<Frame>>) -> Self::Future {
        let coordinator = self.0.clone();
        Box::pin(async move { Ok(open_session(coordinator, request)) })
    }
}

fn open_session(
    coordinator: Arc<Coordinator>,
    request: tonic::Request<Streaming<Frame>>,
) -> tonic::Response<ReceiverStream<Result<Frame, Status>>> {
    let metadata_key = request
        .metadata()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut inbound = request.into_inner();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let span = transport_span!(transport = "grpc");

    tokio::spawn(
        async move {
            let mut session: Option<String> = None;
            loop {
                let frame = match inbound.message().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(status = %status, "gRPC session read failed");
                        break;
                    }
                };

                let api_key = if frame.api_key.is_empty() {
                    metadata_key.clone()
                } else {
                    Some(frame.api_key.clone())
                };
                let reply = match handle_frame(&coordinator, &mut session, api_key.as_deref(), &frame).await {
                    Ok(reply) => Ok(reply),
                    Err(MeshError::AuthFailure { message }) => {
                        let _ = tx.send(Err(Status::unauthenticated(message))).await;
                        break;
                    }
                    Err(e) => Ok(Frame::reply("error", &json!(e.to_wire()))),
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }

            if let Some(agent_id) = session {
                info!(agent_id = %agent_id, "gRPC stream ended, unregistering agent");
                coordinator.disconnect(&agent_id).await;
            }
        }
        .instrument(span),
    );

    tonic::Response::new(ReceiverStream::new(rx))
}

async fn handle_frame(
    coordinator: &Coordinator,
    session: &mut Option<String>,
    api_key: Option<&str>,
    frame: &Frame,
) -> MeshResult<Frame> {
    if frame.kind == "register" {
        let request: RegisterRequest = frame.payload()?;
        let agent_id = request.agent_id.clone();
        ensure_session_agent(session.as_deref(), &agent_id)?;
        coordinator.register(api_key, request).await?;
        *session = Some(agent_id);
        return Ok(Frame::reply("ack", &Value::Null));
    }

    let Some(agent_id) = session.clone() else {
        return Err(MeshError::auth_failure("first frame must be register"));
    };

    match frame.kind.as_str() {
        "heartbeat" => {
            let beat: Option<HeartbeatPayload> = frame.payload()?;
            let beat = beat.unwrap_or_default();
            coordinator
                .heartbeat(
                    api_key,
                    HeartbeatRequest {
                        agent_id,
                        cpu: beat.cpu,
                        load: beat.load,
                    },
                )
                .await?;
            Ok(Frame::reply("ack", &Value::Null))
        }
        "next_task" => match coordinator.poll_next_task(api_key, &agent_id).await? {
            Some(task) => Ok(Frame::reply("task", &json!(task))),
            None => Ok(Frame::reply("no_task", &Value::Null)),
        },
        "task_result" => {
            let result: TaskResultRequest = frame.payload()?;
            coordinator
                .submit_result(api_key, &result.task_id, result.result, result.error)
                .await?;
            Ok(Frame::reply("ack", &Value::Null))
        }
        "unregister" => {
            coordinator.unregister(api_key, &agent_id).await?;
            *session = None;
            Ok(Frame::reply("ack", &Value::Null))
        }
        other => Err(MeshError::invalid_input(format!("unknown frame kind '{other}'"))),
    }
}

/// Serve the gRPC adapter on `listener` until `shutdown` resolves
pub async fn serve<F>(
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()> + Send,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "gRPC adapter listening");
    }
    tonic::transport::Server::builder()
        .add_service(AgentLinkServer::new(coordinator))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

/// Remote agent holding one gRPC session stream
pub struct GrpcAgentClient {
    agent_id: String,
    api_key: String,
    outbound: mpsc::Sender<Frame>,
    inbound: Mutex<Streaming<Frame>>,
}

impl GrpcAgentClient {
    /// Open the session stream against `http://host:port`
    pub async fn connect<A: Into<String>, K: Into<String>>(
        endpoint: &str,
        agent_id: A,
        api_key: K,
    ) -> Result<Self, TransportError> {
        let api_key = api_key.into();
        let channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())
            .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?
            .connect()
            .await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;

        let (outbound, rx) = mpsc::channel(STREAM_BUFFER);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let key: MetadataValue<Ascii> = api_key
            .parse()
            .map_err(|_| TransportError::Protocol("API key is not valid metadata".to_string()))?;
        request.metadata_mut().insert(API_KEY_HEADER, key);

        let response = grpc
            .streaming(
                request,
                http::uri::PathAndQuery::from_static(SESSION_PATH),
                ProstCodec::<Frame, Frame>::default(),
            )
            .await?;

        Ok(Self {
            agent_id: agent_id.into(),
            api_key,
            outbound,
            inbound: Mutex::new(response.into_inner()),
        })
    }

    async fn call(&self, kind: &str, payload: Value) -> Result<Frame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        self.outbound
            .send(Frame::new(kind, &self.api_key, &payload))
            .await
            .map_err(|_| TransportError::Closed)?;

        match inbound.message().await? {
            None => Err(TransportError::Closed),
            Some(frame) if frame.kind == "error" => {
                let body: ErrorBody = serde_json::from_str(&frame.payload_json)?;
                Err(body.into())
            }
            Some(frame) => Ok(frame),
        }
    }

    async fn call_ack(&self, kind: &str, payload: Value) -> Result<(), TransportError> {
        let reply = self.call(kind, payload).await?;
        if reply.kind == "ack" {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!("expected ack, got '{}'", reply.kind)))
        }
    }
}

#[async_trait::async_trait]
impl AgentTransport for GrpcAgentClient {
    type Error = TransportError;

    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn register(&self, mut request: RegisterRequest) -> Result<(), TransportError> {
        request.agent_id = self.agent_id.clone();
        self.call_ack("register", serde_json::to_value(&request)?).await
    }

    async fn heartbeat(&self, cpu: f64, load: u32) -> Result<(), TransportError> {
        self.call_ack("heartbeat", json!({ "cpu": cpu, "load": load }))
            .await
    }

    async fn send_task_result(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        let body = TaskResultRequest {
            task_id: task_id.to_string(),
            result,
            error,
        };
        self.call_ack("task_result", serde_json::to_value(&body)?).await
    }

    async fn poll_next_task(&self) -> Result<Option<Task>, TransportError> {
        let reply = self.call("next_task", Value::Null).await?;
        match reply.kind.as_str() {
            "task" => Ok(Some(serde_json::from_str(&reply.payload_json)?)),
            "no_task" => Ok(None),
            other => Err(TransportError::Protocol(format!("expected task, got '{other}'"))),
        }
    }

    async fn unregister(&self) -> Result<(), TransportError> {
        self.call_ack("unregister", Value::Null).await
    }
}
