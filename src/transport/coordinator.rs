//! Server side of every transport adapter
//!
//! The HTTP, WebSocket, gRPC and JSON-RPC adapters only decode frames and encode
//! replies; the operations themselves live here so that all four enforce the same
//! shared-secret check and the same lifecycle rules.
//!
//! Remote agents are bridged into the hub: registration creates a hub mailbox and
//! a pump task that moves `task_assignment` messages onto the agent's task board
//! queue. When such a task settles, its outcome is sent back to the requester as a
//! `result_report`.

use crate::auth::ApiKeyAuth;
use crate::error::{MeshError, MeshResult};
use crate::hub::CommunicationHub;
use crate::observability::metrics::metrics;
use crate::protocol::{
    HeartbeatRequest, Message, MessageKind, RegisterRequest, SubmitBatchRequest,
    SubmitTaskRequest, Task, TaskReport, TaskStatus, TaskStatusView,
};
use crate::queue::TaskBoard;
use crate::registry::{Agent, AgentRegistration, AgentStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a pump waits on the hub before checking again
const PUMP_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Coordinator {
    auth: ApiKeyAuth,
    registry: Arc<dyn AgentStore>,
    board: Arc<TaskBoard>,
    hub: Arc<CommunicationHub>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        auth: ApiKeyAuth,
        registry: Arc<dyn AgentStore>,
        board: Arc<TaskBoard>,
        hub: Arc<CommunicationHub>,
    ) -> Self {
        Self {
            auth,
            registry,
            board,
            hub,
            pumps: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn AgentStore> {
        &self.registry
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    pub fn hub(&self) -> &Arc<CommunicationHub> {
        &self.hub
    }

    /// Check a credential without performing an operation
    pub fn authenticate(&self, api_key: Option<&str>) -> MeshResult<()> {
        self.auth.verify(api_key)
    }

    pub async fn register(&self, api_key: Option<&str>, request: RegisterRequest) -> MeshResult<Agent> {
        self.auth.verify(api_key)?;
        if request.agent_id.trim().is_empty() {
            return Err(MeshError::invalid_input("agent_id must not be empty"));
        }

        let registration = AgentRegistration::new(&request.agent_id, &request.agent_type)
            .with_capabilities(&request.capabilities)
            .with_meta(request.meta.clone());
        let mut agent = self.registry.register(registration).await?;
        self.registry
            .heartbeat(&agent.id, request.cpu, request.load)
            .await?;
        agent.cpu = request.cpu;
        agent.reported_load = request.load;

        let mut mailbox_meta = request.meta;
        mailbox_meta.insert("agent_type".to_string(), json!(request.agent_type));
        mailbox_meta.insert("remote".to_string(), json!(true));
        self.hub.register(&agent.id, mailbox_meta);
        self.start_pump(&agent.id);

        metrics().agent_registered();
        info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Remote agent registered");
        Ok(agent)
    }

    pub async fn heartbeat(&self, api_key: Option<&str>, request: HeartbeatRequest) -> MeshResult<()> {
        self.auth.verify(api_key)?;
        if self
            .registry
            .heartbeat(&request.agent_id, request.cpu, request.load)
            .await?
        {
            debug!(agent_id = %request.agent_id, cpu = request.cpu, load = request.load, "Heartbeat");
            Ok(())
        } else {
            Err(MeshError::unknown_receiver(request.agent_id))
        }
    }

    /// Explicit unregister. Returns false when the agent was not registered.
    pub async fn unregister(&self, api_key: Option<&str>, agent_id: &str) -> MeshResult<bool> {
        self.auth.verify(api_key)?;
        self.remove_agent(agent_id, "unregistered").await
    }

    /// Implicit unregister after a transport-level disconnect
    pub async fn disconnect(&self, agent_id: &str) {
        if let Err(e) = self.remove_agent(agent_id, "disconnected").await {
            warn!(agent_id, error = %e, "Failed to unregister disconnected agent");
        }
    }

    /// Drop an agent everywhere and fail its in-flight tasks
    pub async fn remove_agent(&self, agent_id: &str, reason: &str) -> MeshResult<bool> {
        let removed = self.registry.unregister(agent_id).await?;
        self.hub.unregister(agent_id);
        if let Some(pump) = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
        {
            pump.abort();
        }

        let failed = self
            .board
            .fail_agent_tasks(agent_id, &format!("agent {reason}"))
            .await;
        self.settle(failed).await;

        if removed.is_some() {
            metrics().agent_unregistered();
            info!(agent_id, reason, "Agent removed");
        }
        Ok(removed.is_some())
    }

    pub async fn submit_task(&self, api_key: Option<&str>, request: SubmitTaskRequest) -> MeshResult<String> {
        self.auth.verify(api_key)?;
        self.ensure_known(&request.agent_id).await?;
        validate_task_type(&request.task.task_type)?;

        let task_id = self.board.submit(&request.agent_id, request.task).await;
        self.registry.adjust_load(&request.agent_id, 1).await?;
        metrics().task_dispatched();
        Ok(task_id)
    }

    pub async fn submit_batch(
        &self,
        api_key: Option<&str>,
        request: SubmitBatchRequest,
    ) -> MeshResult<Vec<String>> {
        self.auth.verify(api_key)?;
        self.ensure_known(&request.agent_id).await?;
        for task in &request.tasks {
            validate_task_type(&task.task_type)?;
        }

        let count = request.tasks.len();
        let task_ids = self.board.submit_batch(&request.agent_id, request.tasks).await;
        self.registry
            .adjust_load(&request.agent_id, count as i64)
            .await?;
        for _ in 0..count {
            metrics().task_dispatched();
        }
        Ok(task_ids)
    }

    pub async fn cancel_task(&self, api_key: Option<&str>, task_id: &str) -> MeshResult<TaskStatus> {
        self.auth.verify(api_key)?;
        let before = self
            .board
            .get(task_id)
            .await
            .ok_or_else(|| MeshError::task_not_found(task_id))?;

        let status = self.board.cancel(task_id).await?;
        if before.status.is_in_flight() && status == TaskStatus::Cancelled && before.reply_to.is_none() {
            if let Some(agent_id) = &before.assigned_agent {
                self.registry.adjust_load(agent_id, -1).await?;
            }
        }
        Ok(status)
    }

    pub async fn task_status(&self, api_key: Option<&str>, task_id: &str) -> MeshResult<TaskStatusView> {
        self.auth.verify(api_key)?;
        self.board.status(task_id).await
    }

    pub async fn poll_next_task(&self, api_key: Option<&str>, agent_id: &str) -> MeshResult<Option<Task>> {
        self.auth.verify(api_key)?;
        Ok(self.board.poll_next(agent_id).await)
    }

    pub async fn submit_result(
        &self,
        api_key: Option<&str>,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> MeshResult<()> {
        self.auth.verify(api_key)?;
        let task = self
            .board
            .complete(task_id, result, error)
            .await
            .inspect_err(|e| warn!(task_id, error = %e, "Task result refused"))?;
        match task.status {
            TaskStatus::Finished => metrics().task_completed(),
            TaskStatus::Failed => metrics().task_failed(),
            _ => {}
        }
        debug!(task_id, status = ?task.status, "Task result recorded");
        self.settle(vec![task]).await;
        Ok(())
    }

    pub async fn list_agents(&self, api_key: Option<&str>) -> MeshResult<Vec<Agent>> {
        self.auth.verify(api_key)?;
        Ok(self.registry.list().await?)
    }

    /// Report settled tasks to whoever is waiting on them
    ///
    /// Tasks that came in as hub assignments are answered with a `result_report`;
    /// the requester owns their load accounting. Direct submissions release the
    /// agent's load here.
    pub async fn settle(&self, tasks: Vec<Task>) {
        for task in tasks {
            let Some(agent_id) = task.assigned_agent.clone() else {
                continue;
            };

            let Some(reply_to) = task.reply_to.clone() else {
                if task.status != TaskStatus::Cancelled {
                    if let Err(e) = self.registry.adjust_load(&agent_id, -1).await {
                        warn!(agent_id = %agent_id, error = %e, "Failed to release agent load");
                    }
                }
                continue;
            };

            let agent_type = match self.registry.get(&agent_id).await {
                Ok(Some(agent)) => agent.agent_type,
                _ => String::new(),
            };
            let report = match (&task.status, &task.error) {
                (TaskStatus::Finished, _) => TaskReport::completed(
                    &task,
                    &agent_id,
                    &agent_type,
                    task.result.clone().unwrap_or(Value::Null),
                ),
                (_, Some(error)) => TaskReport::failed(&task, &agent_id, &agent_type, error.clone()),
                (status, None) => {
                    TaskReport::failed(&task, &agent_id, &agent_type, format!("task {status:?}"))
                }
            };

            let payload = match serde_json::to_value(&report) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to encode task report");
                    continue;
                }
            };
            let mut message = Message::new(&agent_id, &reply_to, MessageKind::ResultReport, payload)
                .with_priority(task.priority);
            if let Some(correlation_id) = &task.correlation_id {
                message = message.with_correlation(correlation_id.clone());
            }
            if let Err(e) = self.hub.send(message) {
                warn!(task_id = %task.id, reply_to = %reply_to, error = %e, "Could not deliver task report");
            }
        }
    }

    async fn ensure_known(&self, agent_id: &str) -> MeshResult<()> {
        match self.registry.get(agent_id).await? {
            Some(_) => Ok(()),
            None => Err(MeshError::unknown_receiver(agent_id)),
        }
    }

    fn start_pump(&self, agent_id: &str) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        if pumps
            .get(agent_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        let handle = tokio::spawn(pump_mailbox(
            agent_id.to_string(),
            self.hub.clone(),
            self.board.clone(),
        ));
        pumps.insert(agent_id.to_string(), handle);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for (_, pump) in self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            pump.abort();
        }
    }
}

fn validate_task_type(task_type: &str) -> MeshResult<()> {
    if task_type.trim().is_empty() {
        Err(MeshError::invalid_input("task_type must not be empty"))
    } else {
        Ok(())
    }
}

/// Move hub traffic addressed to a remote agent onto its task queue
async fn pump_mailbox(agent_id: String, hub: Arc<CommunicationHub>, board: Arc<TaskBoard>) {
    debug!(agent_id = %agent_id, "Mailbox pump started");
    loop {
        let Some(message) = hub.receive(&agent_id, Some(PUMP_RECEIVE_TIMEOUT)).await else {
            continue;
        };

        match message.kind {
            MessageKind::TaskAssignment => {
                let mut task: Task = match serde_json::from_value(message.payload.clone()) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(agent_id = %agent_id, message_id = %message.id, error = %e, "Malformed task assignment");
                        let report = message.reply(
                            MessageKind::ErrorReport,
                            json!({ "error": format!("malformed task assignment: {e}") }),
                        );
                        if let Err(e) = hub.send(report) {
                            warn!(agent_id = %agent_id, sender = %message.sender, error = %e, "Could not report malformed assignment");
                        }
                        continue;
                    }
                };
                task.reply_to = Some(message.sender.clone());
                task.correlation_id = message.correlation_id.clone().or(Some(task.id.clone()));
                board.enqueue(&agent_id, task).await;
            }
            MessageKind::CollaborationRequest => {
                let session_id = message.payload.get("session_id").and_then(Value::as_str);
                let finding = match session_id {
                    Some(session_id) => board.latest_result(&agent_id, session_id).await,
                    None => None,
                };
                let reply = message.reply(
                    MessageKind::CollaborationResponse,
                    json!({
                        "agent_id": agent_id,
                        "remote": true,
                        "latest_finding": finding,
                    }),
                );
                if let Err(e) = hub.send(reply) {
                    debug!(agent_id = %agent_id, error = %e, "Clarification reply not delivered");
                }
            }
            other => {
                debug!(agent_id = %agent_id, kind = %other, "Remote agent ignores message kind");
            }
        }
    }
}
