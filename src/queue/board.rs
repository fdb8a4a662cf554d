//! Task lifecycle table
//!
//! Owns every task known to the coordinator together with one priority queue per
//! agent. Tasks move `pending -> running -> finished | failed`, or to `cancelled`
//! at any point before they settle. Cancellation is soft: a cancelled task stays in
//! its queue and is skipped when it reaches the front.
//!
//! Locking: the task table and each agent queue have their own lock and no method
//! holds two of them at once.

use crate::error::{MeshError, MeshResult};
use crate::protocol::{Task, TaskRequest, TaskStatus, TaskStatusView};
use crate::queue::priority::PriorityQueue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Failure reason recorded when a task runs out of retries
pub const RETRIES_EXHAUSTED: &str = "timeout, retries exhausted";

type AgentQueue = Arc<Mutex<PriorityQueue<String>>>;

/// Result of one timeout sweep
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Task ids put back on their agent's queue
    pub requeued: Vec<String>,
    /// Tasks that were marked failed
    pub failed: Vec<Task>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct BoardStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: Mutex<HashMap<String, Task>>,
    queues: Mutex<HashMap<String, AgentQueue>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue_for(&self, agent_id: &str) -> AgentQueue {
        let mut queues = self.queues.lock().await;
        queues
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PriorityQueue::new())))
            .clone()
    }

    /// Put a task on an agent's queue as `pending`
    pub async fn enqueue(&self, agent_id: &str, mut task: Task) -> String {
        task.assigned_agent = Some(agent_id.to_string());
        task.status = TaskStatus::Pending;
        let task_id = task.id.clone();
        let priority = task.priority;

        self.tasks.lock().await.insert(task_id.clone(), task);
        self.queue_for(agent_id)
            .await
            .lock()
            .await
            .put(task_id.clone(), priority);

        debug!(task_id = %task_id, agent_id, priority, "Task enqueued");
        task_id
    }

    pub async fn submit(&self, agent_id: &str, request: TaskRequest) -> String {
        self.enqueue(agent_id, Task::from_request(request)).await
    }

    pub async fn submit_batch(&self, agent_id: &str, requests: Vec<TaskRequest>) -> Vec<String> {
        let mut task_ids = Vec::with_capacity(requests.len());
        for request in requests {
            task_ids.push(self.submit(agent_id, request).await);
        }
        task_ids
    }

    /// Flag a task as cancelled. Settled tasks keep their status.
    pub async fn cancel(&self, task_id: &str) -> MeshResult<TaskStatus> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::task_not_found(task_id))?;

        if task.status.is_in_flight() {
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(Utc::now());
            info!(task_id, "Task cancelled");
        }
        Ok(task.status)
    }

    pub async fn status(&self, task_id: &str) -> MeshResult<TaskStatusView> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| MeshError::task_not_found(task_id))?;

        Ok(TaskStatusView {
            task_id: task.id.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            retries: task.retries,
        })
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Pop the next runnable task for an agent and mark it `running`
    pub async fn poll_next(&self, agent_id: &str) -> Option<Task> {
        let queue = self.queue_for(agent_id).await;

        loop {
            let task_id = queue.lock().await.get()?;

            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    debug!(task_id = %task_id, agent_id, "Task started");
                    return Some(task.clone());
                }
                Some(task) => {
                    debug!(task_id = %task_id, status = ?task.status, "Skipping task at dequeue");
                }
                None => {
                    debug!(task_id = %task_id, "Dropping queue entry for collected task");
                }
            }
        }
    }

    /// Record an agent's result; an error marks the task failed
    ///
    /// Settled tasks are final: a late or duplicate result is refused and leaves
    /// the recorded outcome untouched.
    pub async fn complete(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> MeshResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::task_not_found(task_id))?;

        if task.status.is_terminal() {
            debug!(task_id, status = ?task.status, "Refusing result for settled task");
            return Err(MeshError::invalid_input(format!(
                "task {task_id} already settled as {:?}",
                task.status
            )));
        }

        task.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Finished
        };
        task.finished_at = Some(Utc::now());
        task.result = result;
        task.error = error;

        Ok(task.clone())
    }

    /// Requeue or fail tasks that have been running longer than `task_timeout`
    pub async fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
        task_timeout: Duration,
        max_retries: u32,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let mut requeue = Vec::new();

        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.values_mut() {
                if task.status != TaskStatus::Running {
                    continue;
                }
                let timed_out = task
                    .started_at
                    .and_then(|started| (now - started).to_std().ok())
                    .map(|elapsed| elapsed > task_timeout)
                    .unwrap_or(false);
                if !timed_out {
                    continue;
                }

                if task.retries < max_retries {
                    task.retries += 1;
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    warn!(task_id = %task.id, retries = task.retries, "Task timed out, requeueing");
                    if let Some(agent_id) = task.assigned_agent.clone() {
                        requeue.push((agent_id, task.id.clone(), task.priority));
                    }
                } else {
                    task.status = TaskStatus::Failed;
                    task.error = Some(RETRIES_EXHAUSTED.to_string());
                    task.finished_at = Some(now);
                    warn!(task_id = %task.id, retries = task.retries, "Task failed: {}", RETRIES_EXHAUSTED);
                    report.failed.push(task.clone());
                }
            }
        }

        for (agent_id, task_id, priority) in requeue {
            self.queue_for(&agent_id)
                .await
                .lock()
                .await
                .put(task_id.clone(), priority);
            report.requeued.push(task_id);
        }

        report
    }

    /// Fail every in-flight task of an agent that left, and drop its queue
    pub async fn fail_agent_tasks(&self, agent_id: &str, reason: &str) -> Vec<Task> {
        self.queues.lock().await.remove(agent_id);

        let now = Utc::now();
        let mut failed = Vec::new();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.values_mut() {
            if task.assigned_agent.as_deref() == Some(agent_id) && task.status.is_in_flight() {
                task.status = TaskStatus::Failed;
                task.error = Some(reason.to_string());
                task.finished_at = Some(now);
                failed.push(task.clone());
            }
        }

        if !failed.is_empty() {
            info!(agent_id, count = failed.len(), reason, "Failed in-flight tasks of departed agent");
        }
        failed
    }

    /// Drop settled tasks older than the retention window
    pub async fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| {
            if !task.status.is_terminal() {
                return true;
            }
            let settled_at = task.finished_at.unwrap_or(task.created_at);
            (now - settled_at)
                .to_std()
                .map(|age| age <= retention)
                .unwrap_or(true)
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Collected settled tasks");
        }
        removed
    }

    /// Most recent finished result an agent produced for a session
    pub async fn latest_result(&self, agent_id: &str, session_id: &str) -> Option<Value> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| {
                task.assigned_agent.as_deref() == Some(agent_id)
                    && task.status == TaskStatus::Finished
                    && task.session_id() == Some(session_id)
            })
            .max_by_key(|task| task.finished_at)
            .and_then(|task| task.result.clone())
    }

    /// Number of pending or running tasks assigned to an agent
    pub async fn load(&self, agent_id: &str) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| {
                task.assigned_agent.as_deref() == Some(agent_id) && task.status.is_in_flight()
            })
            .count()
    }

    pub async fn stats(&self) -> BoardStats {
        let tasks = self.tasks.lock().await;
        let mut stats = BoardStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Finished => stats.finished += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(task_type: &str, priority: i32) -> TaskRequest {
        TaskRequest {
            task_type: task_type.to_string(),
            content: "some content".to_string(),
            context: Default::default(),
            priority,
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn test_poll_returns_highest_priority_and_marks_running() {
        let board = TaskBoard::new();
        let low = board.submit("agent-a", request("content_analysis", 1)).await;
        let high = board.submit("agent-a", request("toxicity_detection", 9)).await;

        let first = board.poll_next("agent-a").await.unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, TaskStatus::Running);
        assert!(first.started_at.is_some());

        let second = board.poll_next("agent-a").await.unwrap();
        assert_eq!(second.id, low);
        assert!(board.poll_next("agent-a").await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_task_skipped_at_dequeue() {
        let board = TaskBoard::new();
        let first = board.submit("agent-a", request("content_analysis", 9)).await;
        let second = board.submit("agent-a", request("content_analysis", 1)).await;

        assert_eq!(board.cancel(&first).await.unwrap(), TaskStatus::Cancelled);

        let next = board.poll_next("agent-a").await.unwrap();
        assert_eq!(next.id, second);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_found() {
        let board = TaskBoard::new();
        let result = board.cancel("missing").await;
        assert!(matches!(result, Err(MeshError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_complete_with_error_marks_failed() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;
        board.poll_next("agent-a").await.unwrap();

        let task = board
            .complete(&id, None, Some("model unavailable".to_string()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let view = board.status(&id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("model unavailable"));
    }

    #[tokio::test]
    async fn test_complete_records_result() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;
        board.poll_next("agent-a").await.unwrap();

        board
            .complete(&id, Some(json!({"risk_score": 0.2})), None)
            .await
            .unwrap();

        let view = board.status(&id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Finished);
        assert_eq!(view.result, Some(json!({"risk_score": 0.2})));
    }

    #[tokio::test]
    async fn test_duplicate_result_is_refused() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;
        board.poll_next("agent-a").await.unwrap();
        board
            .complete(&id, Some(json!({"risk_score": 0.2})), None)
            .await
            .unwrap();

        let second = board
            .complete(&id, None, Some("late failure".to_string()))
            .await;

        assert!(matches!(second, Err(MeshError::InvalidInput { .. })));
        let view = board.status(&id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Finished);
        assert_eq!(view.result, Some(json!({"risk_score": 0.2})));
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn test_late_result_after_retries_exhausted_is_refused() {
        let board = TaskBoard::new();
        let stuck = board.submit("agent-a", request("content_analysis", 9)).await;
        board.submit("agent-a", request("content_analysis", 1)).await;
        board.poll_next("agent-a").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = board.sweep_timeouts(later, Duration::from_secs(60), 0).await;
        assert_eq!(report.failed.len(), 1);

        let late = board.complete(&stuck, Some(json!({"late": true})), None).await;

        assert!(matches!(late, Err(MeshError::InvalidInput { .. })));
        let view = board.status(&stuck).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.as_deref(), Some(RETRIES_EXHAUSTED));
        assert_eq!(board.load("agent-a").await, 1);
    }

    #[tokio::test]
    async fn test_result_for_cancelled_task_is_refused() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;
        board.cancel(&id).await.unwrap();

        let result = board.complete(&id, Some(json!({})), None).await;

        assert!(result.is_err());
        assert_eq!(board.status(&id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_sweep_retries_then_fails() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;
        let timeout = Duration::from_secs(60);

        for attempt in 1..=2u32 {
            board.poll_next("agent-a").await.unwrap();
            let later = Utc::now() + chrono::Duration::seconds(61);
            let report = board.sweep_timeouts(later, timeout, 2).await;
            assert_eq!(report.requeued, vec![id.clone()]);
            assert_eq!(board.status(&id).await.unwrap().retries, attempt);
        }

        board.poll_next("agent-a").await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = board.sweep_timeouts(later, timeout, 2).await;

        assert!(report.requeued.is_empty());
        assert_eq!(report.failed.len(), 1);
        let view = board.status(&id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.as_deref(), Some(RETRIES_EXHAUSTED));
    }

    #[tokio::test]
    async fn test_sweep_ignores_fresh_running_tasks() {
        let board = TaskBoard::new();
        board.submit("agent-a", request("content_analysis", 5)).await;
        board.poll_next("agent-a").await.unwrap();

        let report = board
            .sweep_timeouts(Utc::now(), Duration::from_secs(60), 3)
            .await;
        assert!(report.requeued.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_load_counts_pending_and_running_only() {
        let board = TaskBoard::new();
        let a = board.submit("agent-a", request("content_analysis", 5)).await;
        board.submit("agent-a", request("content_analysis", 5)).await;
        board.submit("agent-b", request("content_analysis", 5)).await;
        assert_eq!(board.load("agent-a").await, 2);

        board.poll_next("agent-a").await;
        board.complete(&a, Some(json!({})), None).await.unwrap();
        assert_eq!(board.load("agent-a").await, 1);
    }

    #[tokio::test]
    async fn test_departed_agent_tasks_fail() {
        let board = TaskBoard::new();
        let id = board.submit("agent-a", request("content_analysis", 5)).await;

        let failed = board.fail_agent_tasks("agent-a", "agent unregistered").await;

        assert_eq!(failed.len(), 1);
        assert_eq!(board.status(&id).await.unwrap().status, TaskStatus::Failed);
        assert!(board.poll_next("agent-a").await.is_none());
    }

    #[tokio::test]
    async fn test_latest_result_is_scoped_to_session() {
        let board = TaskBoard::new();
        let mut with_session = request("content_analysis", 5);
        with_session
            .context
            .insert("session_id".to_string(), json!("s-1"));
        let id = board.submit("agent-a", with_session).await;
        board.poll_next("agent-a").await;
        board
            .complete(&id, Some(json!({"risk_score": 0.4})), None)
            .await
            .unwrap();

        assert_eq!(
            board.latest_result("agent-a", "s-1").await,
            Some(json!({"risk_score": 0.4}))
        );
        assert!(board.latest_result("agent-a", "s-2").await.is_none());
        assert!(board.latest_result("agent-b", "s-1").await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_collection_keeps_recent_and_in_flight() {
        let board = TaskBoard::new();
        let settled = board.submit("agent-a", request("content_analysis", 5)).await;
        let open = board.submit("agent-a", request("content_analysis", 1)).await;
        board.poll_next("agent-a").await;
        board.complete(&settled, Some(json!({})), None).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        let removed = board.collect_garbage(later, Duration::from_secs(3600)).await;

        assert_eq!(removed, 1);
        assert!(board.get(&settled).await.is_none());
        assert!(board.get(&open).await.is_some());
    }
}
