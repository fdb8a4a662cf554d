//! Short-poll HTTP adapter
//!
//! Every route expects the shared secret in the `x-api-key` header. Errors are
//! returned as a sanitized `{code, message}` body with 401 for a bad secret, 404
//! for unknown tasks or agents and 400 for malformed input.
//!
//! The same warp server also carries the WebSocket (`/ws`) and JSON-RPC (`/rpc`)
//! adapters and, when a pipeline is attached, `POST /moderate`; see [`gateway`].

use super::{AgentTransport, Coordinator, TransportError, API_KEY_HEADER};
use crate::error::{MeshError, MeshResult};
use crate::observability::metrics::metrics;
use crate::pipeline::{ModerationPipeline, ModerationRequest};
use crate::protocol::{
    Ack, ErrorBody, ErrorCode, HeartbeatRequest, RegisterRequest, SubmitBatchRequest,
    SubmitBatchResponse, SubmitTaskRequest, SubmitTaskResponse, Task, TaskIdRequest,
    TaskRequest, TaskResultRequest, TaskStatusView, UnregisterRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP status for an error returned to a remote caller
pub fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::AuthFailure { .. } => StatusCode::UNAUTHORIZED,
        MeshError::TaskNotFound { .. } | MeshError::UnknownReceiver { .. } => StatusCode::NOT_FOUND,
        MeshError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        MeshError::NoCapableAgent { .. } => StatusCode::CONFLICT,
        MeshError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &MeshError) -> Response {
    warp::reply::with_status(warp::reply::json(&error.to_wire()), status_for(error)).into_response()
}

fn respond<T: Serialize>(result: MeshResult<T>) -> Result<Response, Infallible> {
    Ok(match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => {
            debug!(error = %e, "HTTP request rejected");
            error_response(&e)
        }
    })
}

fn with_coordinator(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = (Arc<Coordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

fn api_key() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>(API_KEY_HEADER)
}

fn post_json<T: DeserializeOwned + Send>(
    name: &'static str,
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = (Arc<Coordinator>, Option<String>, T), Error = Rejection> + Clone {
    warp::path(name)
        .and(warp::path::end())
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and(api_key())
        .and(warp::body::content_length_limit(1024 * 1024))
        .and(warp::body::json())
}

/// The short-poll REST routes plus `/health` and `/metrics`
pub fn routes(coordinator: Arc<Coordinator>) -> BoxedFilter<(Response,)> {
    let register = post_json::<RegisterRequest>("register", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: RegisterRequest| async move {
            respond(c.register(key.as_deref(), body).await)
        },
    );

    let heartbeat = post_json::<HeartbeatRequest>("heartbeat", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: HeartbeatRequest| async move {
            respond(c.heartbeat(key.as_deref(), body).await.map(|_| Ack::ok()))
        },
    );

    let unregister = post_json::<UnregisterRequest>("unregister", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: UnregisterRequest| async move {
            respond(
                c.unregister(key.as_deref(), &body.agent_id)
                    .await
                    .map(|removed| json!({ "ok": true, "removed": removed })),
            )
        },
    );

    let submit_task = post_json::<SubmitTaskRequest>("submit_task", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: SubmitTaskRequest| async move {
            respond(
                c.submit_task(key.as_deref(), body)
                    .await
                    .map(|task_id| SubmitTaskResponse { task_id }),
            )
        },
    );

    let submit_batch = post_json::<SubmitBatchRequest>("submit_batch", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: SubmitBatchRequest| async move {
            respond(
                c.submit_batch(key.as_deref(), body)
                    .await
                    .map(|task_ids| SubmitBatchResponse { task_ids }),
            )
        },
    );

    let cancel_task = post_json::<TaskIdRequest>("cancel_task", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: TaskIdRequest| async move {
            respond(
                c.cancel_task(key.as_deref(), &body.task_id)
                    .await
                    .map(|status| json!({ "task_id": body.task_id, "status": status })),
            )
        },
    );

    let submit_result = post_json::<TaskResultRequest>("submit_result", coordinator.clone()).and_then(
        |c: Arc<Coordinator>, key: Option<String>, body: TaskResultRequest| async move {
            respond(
                c.submit_result(key.as_deref(), &body.task_id, body.result, body.error)
                    .await
                    .map(|_| Ack::ok()),
            )
        },
    );

    let task_status = warp::path!("task_status" / String)
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and(api_key())
        .and_then(|task_id: String, c: Arc<Coordinator>, key: Option<String>| async move {
            respond(c.task_status(key.as_deref(), &task_id).await)
        });

    let next_task = warp::path!("next_task" / String)
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and(api_key())
        .and_then(|agent_id: String, c: Arc<Coordinator>, key: Option<String>| async move {
            respond(c.poll_next_task(key.as_deref(), &agent_id).await)
        });

    let agents = warp::path!("agents")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and(api_key())
        .and_then(|c: Arc<Coordinator>, key: Option<String>| async move {
            respond(c.list_agents(key.as_deref()).await)
        });

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .map(|c: Arc<Coordinator>| warp::reply::json(&c.hub().health_check()).into_response());

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .map(|| warp::reply::json(&metrics().get_metrics()).into_response());

    register
        .or(heartbeat)
        .unify()
        .or(unregister)
        .unify()
        .or(submit_task)
        .unify()
        .or(submit_batch)
        .unify()
        .or(cancel_task)
        .unify()
        .or(submit_result)
        .unify()
        .or(task_status)
        .unify()
        .or(next_task)
        .unify()
        .or(agents)
        .unify()
        .or(health)
        .unify()
        .or(metrics_route)
        .unify()
        .boxed()
}

/// `POST /moderate`: run one full moderation session
pub fn moderation_route(
    coordinator: Arc<Coordinator>,
    pipeline: Arc<ModerationPipeline>,
) -> BoxedFilter<(Response,)> {
    post_json::<ModerationRequest>("moderate", coordinator)
        .and(warp::any().map(move || pipeline.clone()))
        .and_then(
            |c: Arc<Coordinator>,
             key: Option<String>,
             body: ModerationRequest,
             pipeline: Arc<ModerationPipeline>| async move {
                if let Err(e) = c.authenticate(key.as_deref()) {
                    return respond::<()>(Err(e));
                }
                if body.content.trim().is_empty() {
                    return respond::<()>(Err(MeshError::invalid_input("content must not be empty")));
                }
                respond(Ok(pipeline.moderate(body).await))
            },
        )
        .boxed()
}

/// Every adapter served over one warp listener
pub fn gateway(
    coordinator: Arc<Coordinator>,
    pipeline: Option<Arc<ModerationPipeline>>,
) -> BoxedFilter<(Response,)> {
    let adapters = routes(coordinator.clone())
        .or(super::ws::routes(coordinator.clone()))
        .unify()
        .or(super::rpc::routes(coordinator.clone()))
        .unify()
        .boxed();

    let adapters = match pipeline {
        Some(pipeline) => adapters
            .or(moderation_route(coordinator, pipeline))
            .unify()
            .boxed(),
        None => adapters,
    };

    adapters.recover(handle_rejection).unify().boxed()
}

/// Map warp's own rejections onto the error body used everywhere else
async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, code, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorCode::InvalidInput, "no such route".to_string())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, ErrorCode::InvalidInput, e.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::InvalidInput,
            "method not allowed".to_string(),
        )
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::InvalidInput,
            "payload too large".to_string(),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidInput,
            format!("{rejection:?}"),
        )
    };

    let body = ErrorBody { code, message };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

/// Bind the gateway and return its address plus the server future
///
/// The server stops when `shutdown` resolves.
pub fn bind_gateway<F>(
    coordinator: Arc<Coordinator>,
    pipeline: Option<Arc<ModerationPipeline>>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(gateway(coordinator, pipeline)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(addr = %bound, "HTTP gateway listening (REST, /ws, /rpc)");
    Ok((bound, server))
}

/// Remote agent speaking the short-poll HTTP routes
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
    api_key: String,
}

impl HttpAgentClient {
    pub fn new<A: Into<String>, K: Into<String>>(
        base_url: &str,
        agent_id: A,
        api_key: K,
    ) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|_| TransportError::InvalidEndpoint(base_url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(base_url.to_string()));
        }

        let client = reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into()),
            Err(_) => Err(TransportError::Protocol(format!("HTTP {status}: {text}"))),
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, TransportError> {
        let response = self
            .client
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, TransportError> {
        let response = self
            .client
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Submit a task to another agent's queue
    pub async fn submit_task(&self, agent_id: &str, task: TaskRequest) -> Result<String, TransportError> {
        let response: SubmitTaskResponse = self
            .post(
                "submit_task",
                &SubmitTaskRequest {
                    agent_id: agent_id.to_string(),
                    task,
                },
            )
            .await?;
        Ok(response.task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusView, TransportError> {
        self.get(&format!("task_status/{task_id}")).await
    }
}

#[async_trait::async_trait]
impl AgentTransport for HttpAgentClient {
    type Error = TransportError;

    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn register(&self, mut request: RegisterRequest) -> Result<(), TransportError> {
        request.agent_id = self.agent_id.clone();
        let _: Value = self.post("register", &request).await?;
        Ok(())
    }

    async fn heartbeat(&self, cpu: f64, load: u32) -> Result<(), TransportError> {
        let _: Ack = self
            .post(
                "heartbeat",
                &HeartbeatRequest {
                    agent_id: self.agent_id.clone(),
                    cpu,
                    load,
                },
            )
            .await?;
        Ok(())
    }

    async fn send_task_result(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        let _: Ack = self
            .post(
                "submit_result",
                &TaskResultRequest {
                    task_id: task_id.to_string(),
                    result,
                    error,
                },
            )
            .await?;
        Ok(())
    }

    async fn poll_next_task(&self) -> Result<Option<Task>, TransportError> {
        self.get(&format!("next_task/{}", self.agent_id)).await
    }

    async fn unregister(&self) -> Result<(), TransportError> {
        let _: Value = self
            .post(
                "unregister",
                &UnregisterRequest {
                    agent_id: self.agent_id.clone(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&MeshError::auth_failure("x")), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&MeshError::task_not_found("t")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MeshError::invalid_input("bad")), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_client_rejects_non_http_endpoint() {
        assert!(HttpAgentClient::new("ftp://hub", "a", "k").is_err());
        assert!(HttpAgentClient::new("not a url", "a", "k").is_err());
    }

    #[tokio::test]
    async fn test_client_surfaces_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/heartbeat"))
            .and(header(API_KEY_HEADER, "wrong"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": "auth_failure",
                "message": "Authentication failed: invalid API key"
            })))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(&server.uri(), "agent", "wrong").unwrap();
        let err = client.heartbeat(0.1, 0).await.unwrap_err();

        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_client_polls_empty_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/next_task/agent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Null))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(&server.uri(), "agent", "key").unwrap();
        assert!(client.poll_next_task().await.unwrap().is_none());
    }
}
