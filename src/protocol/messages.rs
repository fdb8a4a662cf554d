//! Mailbox messages, tasks and task reports
//!
//! Priorities follow one convention everywhere: a higher numeric value is more
//! urgent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Priority used when a sender does not pick one
pub const DEFAULT_PRIORITY: i32 = 5;

/// Kinds of messages exchanged through the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssignment,
    ResultReport,
    CollaborationRequest,
    CollaborationResponse,
    ArbitrationRequest,
    ArbitrationResult,
    StatusUpdate,
    ErrorReport,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::TaskAssignment => "task_assignment",
            MessageKind::ResultReport => "result_report",
            MessageKind::CollaborationRequest => "collaboration_request",
            MessageKind::CollaborationResponse => "collaboration_response",
            MessageKind::ArbitrationRequest => "arbitration_request",
            MessageKind::ArbitrationResult => "arbitration_result",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::ErrorReport => "error_report",
        }
    }

    /// Kinds that answer an earlier correlated message
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageKind::ResultReport
                | MessageKind::CollaborationResponse
                | MessageKind::ArbitrationResult
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mailbox message. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and the default priority
    ///
    /// # Examples
    /// ```
    /// use agentmesh::protocol::{Message, MessageKind};
    /// use serde_json::json;
    ///
    /// let message = Message::new("router", "toxicity_detector", MessageKind::TaskAssignment, json!({}))
    ///     .with_correlation("task-1")
    ///     .with_priority(9);
    /// assert_eq!(message.priority, 9);
    /// assert_eq!(message.correlation_id.as_deref(), Some("task-1"));
    /// ```
    pub fn new<S: Into<String>, R: Into<String>>(
        sender: S,
        receiver: R,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            receiver: receiver.into(),
            kind,
            payload,
            correlation_id: None,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
        }
    }

    pub fn with_correlation<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Build the reply to this message, carrying its correlation id back
    pub fn reply(&self, kind: MessageKind, payload: Value) -> Self {
        let reply = Message::new(self.receiver.clone(), self.sender.clone(), kind, payload)
            .with_priority(self.priority);
        match &self.correlation_id {
            Some(correlation_id) => reply.with_correlation(correlation_id.clone()),
            None => reply,
        }
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a task in this state counts toward its agent's load
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Analysis task types understood by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ContentAnalysis,
    SemanticAnalysis,
    SentimentAnalysis,
    ContextAnalysis,
    ToxicityDetection,
    PatternRecognition,
    RiskAssessment,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::ContentAnalysis,
        TaskType::SemanticAnalysis,
        TaskType::SentimentAnalysis,
        TaskType::ContextAnalysis,
        TaskType::ToxicityDetection,
        TaskType::PatternRecognition,
        TaskType::RiskAssessment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ContentAnalysis => "content_analysis",
            TaskType::SemanticAnalysis => "semantic_analysis",
            TaskType::SentimentAnalysis => "sentiment_analysis",
            TaskType::ContextAnalysis => "context_analysis",
            TaskType::ToxicityDetection => "toxicity_detection",
            TaskType::PatternRecognition => "pattern_recognition",
            TaskType::RiskAssessment => "risk_assessment",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// One sub-task produced by decomposition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub priority: i32,
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Task body accepted from external submitters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// A unit of work owned by the task board
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub content: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub priority: i32,
    /// Advisory ordering hints, not enforced by the scheduler
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Mailbox that expects a `result_report` when the task settles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Task {
    pub fn new<S: Into<String>, C: Into<String>>(task_type: S, content: C) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            content: content.into(),
            context: Map::new(),
            priority: DEFAULT_PRIORITY,
            dependencies: Vec::new(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn from_request(request: TaskRequest) -> Self {
        let mut task = Task::new(request.task_type, request.content);
        task.context = request.context;
        task.priority = request.priority;
        task.dependencies = request.dependencies;
        task
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Session this task belongs to, when it was created by the router
    pub fn session_id(&self) -> Option<&str> {
        self.context.get("session_id").and_then(Value::as_str)
    }
}

/// Outcome of a task as reported by the agent that ran it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed,
}

/// Payload of a `result_report` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub task_type: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: String,
    pub status: ReportStatus,
    /// The agent's analysis payload
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TaskReport {
    pub fn completed(task: &Task, agent_id: &str, agent_type: &str, result: Value) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            status: ReportStatus::Completed,
            result,
            error: None,
            session_id: task.session_id().map(str::to_string),
        }
    }

    pub fn failed<E: Into<String>>(task: &Task, agent_id: &str, agent_type: &str, error: E) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            status: ReportStatus::Failed,
            result: Value::Null,
            error: Some(error.into()),
            session_id: task.session_id().map(str::to_string),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ReportStatus::Completed
    }
}
