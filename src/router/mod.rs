//! Task router
//!
//! Turns one content item into typed sub-tasks, hands each to the least-loaded
//! capable agent and collects the `result_report`s under a single deadline. The
//! router owns the load accounting for everything it dispatches: load goes up on
//! assignment and down on every result or timeout.

use crate::error::MeshResult;
use crate::hub::CommunicationHub;
use crate::inference::{judge, InferenceRequest, InferenceService, InferenceStage, StageOutcome};
use crate::observability::metrics::metrics;
use crate::protocol::{Message, MessageKind, ReportStatus, Task, TaskReport};
use crate::registry::{AgentStatus, AgentStore};
use crate::{dispatch_span, session_span};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub mod decompose;
pub mod integrate;

pub use decompose::{DecompositionPlan, PlanMethod};
pub use integrate::{integrate, IntegrationSummary};

/// Mailbox id of the router
pub const ROUTER_ID: &str = "central_router";

/// Global deadline for collecting one session's results
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Error recorded for tasks that missed the dispatch deadline
pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub dispatch_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

/// A task paired with the agent chosen for it
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub task: Task,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentPlan {
    pub assigned: Vec<Assignment>,
    /// Tasks no registered agent can handle
    pub unassigned: Vec<Task>,
}

impl AssignmentPlan {
    /// `task_id -> agent_id`
    pub fn mapping(&self) -> BTreeMap<String, String> {
        self.assigned
            .iter()
            .map(|a| (a.task.id.clone(), a.agent_id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Reported(TaskReport),
    TimedOut,
}

/// Everything the router learned about one content item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSession {
    pub session_id: String,
    pub content: String,
    pub platform: String,
    pub context: Map<String, Value>,
    pub plan: DecompositionPlan,
    /// One report per planned task; timeouts and unassignable tasks appear as failures
    pub reports: Vec<TaskReport>,
    pub summary: IntegrationSummary,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub router_id: String,
    pub active_sessions: usize,
    pub completed_sessions: u64,
    pub registered_agents: usize,
    pub agent_load: BTreeMap<String, u32>,
}

pub struct TaskRouter {
    hub: Arc<CommunicationHub>,
    registry: Arc<dyn AgentStore>,
    inference: Arc<dyn InferenceService>,
    settings: RouterSettings,
    active_sessions: AtomicUsize,
    completed_sessions: AtomicU64,
}

impl TaskRouter {
    /// Create the router and register its mailbox
    pub fn new(
        hub: Arc<CommunicationHub>,
        registry: Arc<dyn AgentStore>,
        inference: Arc<dyn InferenceService>,
        settings: RouterSettings,
    ) -> Self {
        let mut meta = Map::new();
        meta.insert("role".to_string(), json!("router"));
        hub.register(ROUTER_ID, meta);

        Self {
            hub,
            registry,
            inference,
            settings,
            active_sessions: AtomicUsize::new(0),
            completed_sessions: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Plan the sub-tasks for `content`, falling back to the length rules
    pub async fn decompose(
        &self,
        content: &str,
        platform: &str,
        context: &Map<String, Value>,
    ) -> DecompositionPlan {
        let request = InferenceRequest::new(
            InferenceStage::Decomposition,
            decompose::decomposition_prompt(content, platform, context),
        )
        .with_context(json!({ "platform": platform }));

        match judge(self.inference.as_ref(), request, decompose::parse_plan).await {
            StageOutcome::Judged(tasks) => DecompositionPlan::judged(tasks),
            StageOutcome::Fallback(reason) => DecompositionPlan::fallback(content, reason),
        }
    }

    /// Pick the least-loaded capable agent for every task
    ///
    /// Ties go to the agent that registered first. Each pick raises that agent's
    /// load before the next task is considered. If the registry fails partway,
    /// the load already taken is given back before the error is returned.
    pub async fn assign(&self, tasks: Vec<Task>) -> MeshResult<AssignmentPlan> {
        let mut agents = self.registry.list().await?;
        agents.retain(|a| a.status == AgentStatus::Active);
        let mut plan = AssignmentPlan::default();

        for mut task in tasks {
            let chosen = agents
                .iter_mut()
                .filter(|a| a.can_handle(&task.task_type))
                .min_by_key(|a| (a.load, a.registration_seq));

            let Some(agent) = chosen else {
                warn!(task_id = %task.id, task_type = %task.task_type, "No capable agent for task");
                plan.unassigned.push(task);
                continue;
            };

            agent.load += 1;
            let agent_id = agent.id.clone();
            if let Err(e) = self.registry.adjust_load(&agent_id, 1).await {
                self.release_assignments(&plan.assigned).await;
                return Err(e.into());
            }
            task.assigned_agent = Some(agent_id.clone());
            debug!(task_id = %task.id, task_type = %task.task_type, agent_id = %agent_id, "Task assigned");
            plan.assigned.push(Assignment { task, agent_id });
        }

        Ok(plan)
    }

    async fn release_assignments(&self, assignments: &[Assignment]) {
        for assignment in assignments {
            if let Err(e) = self.registry.adjust_load(&assignment.agent_id, -1).await {
                warn!(agent_id = %assignment.agent_id, error = %e, "Failed to release agent load");
            }
        }
    }

    /// Send every assignment and wait for the reports until `timeout` elapses
    ///
    /// Reports left over from earlier sessions are dropped from the router's
    /// mailbox first. Tasks that cannot be delivered are reported as failed.
    pub async fn dispatch_and_collect(
        &self,
        assignments: &[Assignment],
        timeout: Duration,
    ) -> BTreeMap<String, DispatchOutcome> {
        let stale = self.hub.discard_queued(ROUTER_ID, MessageKind::ResultReport);
        if stale > 0 {
            debug!(stale, "Discarded stale result reports");
        }

        let mut outcomes = BTreeMap::new();
        let mut pending: HashMap<String, &Assignment> = assignments
            .iter()
            .map(|a| (a.task.id.clone(), a))
            .collect();
        let mut batch = self
            .hub
            .expect_responses(ROUTER_ID, pending.keys().cloned().collect());

        for assignment in assignments {
            let task = &assignment.task;
            let payload = match serde_json::to_value(task) {
                Ok(payload) => payload,
                Err(e) => {
                    self.settle_undelivered(&mut pending, &mut outcomes, assignment, e.to_string())
                        .await;
                    continue;
                }
            };
            let message = Message::new(ROUTER_ID, &assignment.agent_id, MessageKind::TaskAssignment, payload)
                .with_correlation(task.id.clone())
                .with_priority(task.priority);

            match self.hub.send(message) {
                Ok(_) => metrics().task_dispatched(),
                Err(e) => {
                    self.settle_undelivered(&mut pending, &mut outcomes, assignment, e.to_string())
                        .await
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            let Some(message) = batch.next_before(deadline).await else {
                break;
            };
            let Some(task_id) = message.correlation_id.clone() else {
                continue;
            };
            let Some(assignment) = pending.remove(&task_id) else {
                continue;
            };

            let report = match serde_json::from_value::<TaskReport>(message.payload) {
                Ok(report) => report,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Unreadable result report");
                    TaskReport::failed(
                        &assignment.task,
                        &assignment.agent_id,
                        "",
                        format!("unreadable result report: {e}"),
                    )
                }
            };
            match report.status {
                ReportStatus::Completed => metrics().task_completed(),
                ReportStatus::Failed => metrics().task_failed(),
            }
            self.release_load(&assignment.agent_id).await;
            outcomes.insert(task_id, DispatchOutcome::Reported(report));
        }

        for (task_id, assignment) in pending {
            warn!(task_id = %task_id, agent_id = %assignment.agent_id, "Task missed dispatch deadline");
            metrics().task_timed_out();
            self.release_load(&assignment.agent_id).await;
            outcomes.insert(task_id, DispatchOutcome::TimedOut);
        }

        outcomes
    }

    async fn settle_undelivered(
        &self,
        pending: &mut HashMap<String, &Assignment>,
        outcomes: &mut BTreeMap<String, DispatchOutcome>,
        assignment: &Assignment,
        error: String,
    ) {
        warn!(task_id = %assignment.task.id, agent_id = %assignment.agent_id, error = %error, "Task assignment not delivered");
        pending.remove(&assignment.task.id);
        metrics().task_failed();
        self.release_load(&assignment.agent_id).await;
        outcomes.insert(
            assignment.task.id.clone(),
            DispatchOutcome::Reported(TaskReport::failed(
                &assignment.task,
                &assignment.agent_id,
                "",
                error,
            )),
        );
    }

    async fn release_load(&self, agent_id: &str) {
        if let Err(e) = self.registry.adjust_load(agent_id, -1).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to release agent load");
        }
    }

    /// Integrate reports and publish the summary as `integration_result_<session_id>`
    pub fn integrate(&self, session_id: &str, reports: &[TaskReport]) -> IntegrationSummary {
        let summary = integrate::integrate(session_id, reports);
        match serde_json::to_value(&summary) {
            Ok(value) => self
                .hub
                .context()
                .set(format!("integration_result_{session_id}"), value, ROUTER_ID),
            Err(e) => warn!(session_id, error = %e, "Failed to publish integration summary"),
        }
        summary
    }

    /// Decompose, assign, dispatch and integrate one content item
    pub async fn process_content(
        &self,
        content: &str,
        platform: &str,
        context: Map<String, Value>,
    ) -> MeshResult<RoutingSession> {
        let session_id = context
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = session_span!(session_id = %session_id, platform = %platform);

        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        let result = self
            .run_session(session_id, content, platform, context)
            .instrument(span)
            .await;
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.completed_sessions.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn run_session(
        &self,
        session_id: String,
        content: &str,
        platform: &str,
        context: Map<String, Value>,
    ) -> MeshResult<RoutingSession> {
        let started = StdInstant::now();
        info!(content_chars = content.chars().count(), "Routing content");

        let plan = self.decompose(content, platform, &context).await;
        let tasks: Vec<Task> = plan
            .tasks
            .iter()
            .map(|spec| {
                let mut task_context = context.clone();
                task_context.insert("session_id".to_string(), json!(session_id));
                task_context.insert("platform".to_string(), json!(platform));
                task_context.insert("focus".to_string(), json!(spec.focus));
                let mut task = Task::new(spec.task_type.as_str(), content)
                    .with_priority(spec.priority)
                    .with_context(task_context);
                task.dependencies = spec.dependencies.clone();
                task
            })
            .collect();

        let assignment = self.assign(tasks).await?;
        let span = dispatch_span!(tasks = assignment.assigned.len());
        let mut outcomes = self
            .dispatch_and_collect(&assignment.assigned, self.settings.dispatch_timeout)
            .instrument(span)
            .await;

        let mut reports = Vec::with_capacity(plan.tasks.len());
        for assigned in &assignment.assigned {
            let report = match outcomes.remove(&assigned.task.id) {
                Some(DispatchOutcome::Reported(report)) => report,
                Some(DispatchOutcome::TimedOut) | None => {
                    TaskReport::failed(&assigned.task, &assigned.agent_id, "", TIMEOUT_ERROR)
                }
            };
            reports.push(report);
        }
        for task in &assignment.unassigned {
            let error = crate::error::MeshError::no_capable_agent(task.task_type.clone());
            reports.push(TaskReport::failed(task, "", "", error.to_string()));
        }

        let summary = self.integrate(&session_id, &reports);
        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            successful = summary.successful_tasks,
            failed = summary.failed_tasks,
            overall_risk = summary.overall_risk,
            processing_time_ms,
            "Routing complete"
        );

        Ok(RoutingSession {
            session_id,
            content: content.to_string(),
            platform: platform.to_string(),
            context,
            plan,
            reports,
            summary,
            processing_time_ms,
        })
    }

    pub async fn system_status(&self) -> MeshResult<RouterStatus> {
        let agents = self.registry.list().await?;
        Ok(RouterStatus {
            router_id: ROUTER_ID.to_string(),
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
            completed_sessions: self.completed_sessions.load(Ordering::SeqCst),
            registered_agents: agents.len(),
            agent_load: agents.into_iter().map(|a| (a.id, a.load)).collect(),
        })
    }
}
