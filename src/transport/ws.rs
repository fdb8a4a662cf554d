//! Persistent duplex WebSocket adapter
//!
//! JSON text frames tagged by `type`. Each client frame carries the shared
//! secret. The first frame must be a `register`; a bad secret closes the socket,
//! and so does an unauthenticated first frame. When the socket closes, the
//! registered agent is unregistered.

use super::{ensure_session_agent, AgentTransport, Coordinator, TransportError};
use crate::error::MeshError;
use crate::protocol::{ErrorCode, HeartbeatRequest, RegisterRequest, Task};
use crate::transport_span;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};
use warp::filters::BoxedFilter;
use warp::filters::ws::{Message, WebSocket, Ws};
use warp::reply::Response;
use warp::{Filter, Reply};

/// Frames sent by a remote agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        api_key: Option<String>,
        agent: RegisterRequest,
    },
    Heartbeat {
        api_key: Option<String>,
        #[serde(default)]
        cpu: f64,
        #[serde(default)]
        load: u32,
    },
    NextTask {
        api_key: Option<String>,
    },
    TaskResult {
        api_key: Option<String>,
        task_id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Unregister {
        api_key: Option<String>,
    },
}

/// Frames sent back by the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack,
    Task { task: Task },
    NoTask,
    Error { code: ErrorCode, message: String },
}

impl From<&MeshError> for ServerFrame {
    fn from(error: &MeshError) -> Self {
        let body = error.to_wire();
        ServerFrame::Error {
            code: body.code,
            message: body.message,
        }
    }
}

/// `GET /ws` upgrade route
pub fn routes(coordinator: Arc<Coordinator>) -> BoxedFilter<(Response,)> {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .map(move |ws: Ws| {
            let coordinator = coordinator.clone();
            ws.on_upgrade(move |socket| {
                let span = transport_span!(transport = "websocket");
                serve_socket(socket, coordinator).instrument(span)
            })
            .into_response()
        })
        .boxed()
}

async fn serve_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    let (mut tx, mut rx) = socket.split();
    let mut session: Option<String> = None;

    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "WebSocket read failed");
                break;
            }
        };
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };

        let (reply, close) = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => handle_frame(&coordinator, &mut session, frame).await,
            Err(e) => {
                let error = MeshError::invalid_input(format!("malformed frame: {e}"));
                (ServerFrame::from(&error), session.is_none())
            }
        };

        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode WebSocket reply");
                break;
            }
        };
        if tx.send(Message::text(encoded)).await.is_err() {
            break;
        }
        if close {
            let _ = tx.close().await;
            break;
        }
    }

    if let Some(agent_id) = session {
        info!(agent_id = %agent_id, "WebSocket closed, unregistering agent");
        coordinator.disconnect(&agent_id).await;
    }
}

/// Apply one frame. The flag asks the caller to close the socket.
async fn handle_frame(
    coordinator: &Coordinator,
    session: &mut Option<String>,
    frame: ClientFrame,
) -> (ServerFrame, bool) {
    let outcome = match (frame, session.clone()) {
        (ClientFrame::Register { api_key, agent }, bound) => {
            let agent_id = agent.agent_id.clone();
            match ensure_session_agent(bound.as_deref(), &agent_id) {
                Ok(()) => coordinator
                    .register(api_key.as_deref(), agent)
                    .await
                    .map(|_| {
                        *session = Some(agent_id);
                        ServerFrame::Ack
                    }),
                Err(e) => Err(e),
            }
        }
        (_, None) => Err(MeshError::auth_failure("first frame must be register")),
        (ClientFrame::Heartbeat { api_key, cpu, load }, Some(agent_id)) => coordinator
            .heartbeat(api_key.as_deref(), HeartbeatRequest { agent_id, cpu, load })
            .await
            .map(|_| ServerFrame::Ack),
        (ClientFrame::NextTask { api_key }, Some(agent_id)) => coordinator
            .poll_next_task(api_key.as_deref(), &agent_id)
            .await
            .map(|task| match task {
                Some(task) => ServerFrame::Task { task },
                None => ServerFrame::NoTask,
            }),
        (
            ClientFrame::TaskResult {
                api_key,
                task_id,
                result,
                error,
            },
            Some(_),
        ) => coordinator
            .submit_result(api_key.as_deref(), &task_id, result, error)
            .await
            .map(|_| ServerFrame::Ack),
        (ClientFrame::Unregister { api_key }, Some(agent_id)) => coordinator
            .unregister(api_key.as_deref(), &agent_id)
            .await
            .map(|_| {
                *session = None;
                ServerFrame::Ack
            }),
    };

    match outcome {
        Ok(reply) => (reply, false),
        Err(e) => {
            let close = matches!(e, MeshError::AuthFailure { .. });
            (ServerFrame::from(&e), close)
        }
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Remote agent holding one WebSocket to the hub
pub struct WsAgentClient {
    agent_id: String,
    api_key: String,
    stream: Mutex<ClientStream>,
}

impl WsAgentClient {
    /// Connect to a `ws://host:port/ws` endpoint
    pub async fn connect<A: Into<String>, K: Into<String>>(
        url: &str,
        agent_id: A,
        api_key: K,
    ) -> Result<Self, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|_| TransportError::InvalidEndpoint(url.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(url.to_string()));
        }

        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self {
            agent_id: agent_id.into(),
            api_key: api_key.into(),
            stream: Mutex::new(stream),
        })
    }

    async fn call(&self, frame: ClientFrame) -> Result<ServerFrame, TransportError> {
        let mut stream = self.stream.lock().await;
        stream
            .send(WsMessage::Text(serde_json::to_string(&frame)?))
            .await?;

        loop {
            match stream.next().await {
                None | Some(Ok(WsMessage::Close(_))) => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => {
                    return match serde_json::from_str::<ServerFrame>(&text)? {
                        ServerFrame::Error { code, message } => {
                            Err(TransportError::Rejected { code, message })
                        }
                        reply => Ok(reply),
                    };
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    fn key(&self) -> Option<String> {
        Some(self.api_key.clone())
    }

    /// Close the socket; the hub unregisters the agent
    pub async fn close(&self) -> Result<(), TransportError> {
        self.stream.lock().await.close(None).await?;
        Ok(())
    }
}

fn expect_ack(reply: ServerFrame) -> Result<(), TransportError> {
    match reply {
        ServerFrame::Ack => Ok(()),
        other => Err(TransportError::Protocol(format!("expected ack, got {other:?}"))),
    }
}

#[async_trait::async_trait]
impl AgentTransport for WsAgentClient {
    type Error = TransportError;

    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn register(&self, mut request: RegisterRequest) -> Result<(), TransportError> {
        request.agent_id = self.agent_id.clone();
        expect_ack(
            self.call(ClientFrame::Register {
                api_key: self.key(),
                agent: request,
            })
            .await?,
        )
    }

    async fn heartbeat(&self, cpu: f64, load: u32) -> Result<(), TransportError> {
        expect_ack(
            self.call(ClientFrame::Heartbeat {
                api_key: self.key(),
                cpu,
                load,
            })
            .await?,
        )
    }

    async fn send_task_result(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        expect_ack(
            self.call(ClientFrame::TaskResult {
                api_key: self.key(),
                task_id: task_id.to_string(),
                result,
                error,
            })
            .await?,
        )
    }

    async fn poll_next_task(&self) -> Result<Option<Task>, TransportError> {
        match self.call(ClientFrame::NextTask { api_key: self.key() }).await? {
            ServerFrame::Task { task } => Ok(Some(task)),
            ServerFrame::NoTask => Ok(None),
            other => Err(TransportError::Protocol(format!("expected task, got {other:?}"))),
        }
    }

    async fn unregister(&self) -> Result<(), TransportError> {
        expect_ack(self.call(ClientFrame::Unregister { api_key: self.key() }).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyAuth;
    use crate::hub::CommunicationHub;
    use crate::queue::TaskBoard;
    use crate::registry::MemoryAgentStore;
    use serde_json::{json, Map};

    fn register_frame(agent_id: &str) -> ClientFrame {
        ClientFrame::Register {
            api_key: Some("k".to_string()),
            agent: RegisterRequest {
                agent_id: agent_id.to_string(),
                agent_type: "toxicity_detector".to_string(),
                capabilities: vec!["toxicity_detection".to_string()],
                meta: Map::new(),
                cpu: 0.0,
                load: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_socket_cannot_switch_agent_id() {
        let coordinator = Coordinator::new(
            ApiKeyAuth::new(["k"]),
            Arc::new(MemoryAgentStore::new()),
            Arc::new(TaskBoard::new()),
            Arc::new(CommunicationHub::new()),
        );
        let mut session = None;

        let (reply, _) = handle_frame(&coordinator, &mut session, register_frame("first")).await;
        assert_eq!(reply, ServerFrame::Ack);
        let (reply, close) = handle_frame(&coordinator, &mut session, register_frame("second")).await;

        assert!(matches!(
            reply,
            ServerFrame::Error {
                code: ErrorCode::InvalidInput,
                ..
            }
        ));
        assert!(!close);
        assert_eq!(session.as_deref(), Some("first"));
        assert!(coordinator.registry().get("second").await.unwrap().is_none());

        // Re-registering under the bound id is still accepted
        let (reply, _) = handle_frame(&coordinator, &mut session, register_frame("first")).await;
        assert_eq!(reply, ServerFrame::Ack);
    }

    #[test]
    fn test_frames_are_tagged_by_type() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "next_task",
            "api_key": "k"
        }))
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::NextTask {
                api_key: Some("k".to_string())
            }
        );

        let reply = serde_json::to_value(ServerFrame::NoTask).unwrap();
        assert_eq!(reply, json!({"type": "no_task"}));
    }

    #[test]
    fn test_error_frame_from_mesh_error() {
        let frame = ServerFrame::from(&MeshError::auth_failure("invalid API key"));
        match frame {
            ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::AuthFailure),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
