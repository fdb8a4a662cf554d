//! Communication hub
//!
//! Per-agent mailboxes with point-to-point send/receive, broadcast and correlated
//! request/response, plus a shared key/value scratch space. The router and the
//! arbitrator are ordinary mailbox owners.
//!
//! Every send is appended to a bounded history and counted per kind and per agent.
//! Within one mailbox messages are delivered in send order; there is no order
//! across mailboxes.

use crate::error::{MeshError, MeshResult};
use crate::observability::metrics::metrics;
use crate::protocol::{Message, MessageKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod context;
pub mod correlation;
mod mailbox;

pub use context::{ContextEntry, SharedContext};
pub use correlation::ResponseBatch;

use correlation::WaiterTable;
use mailbox::Mailbox;

/// Default bound on the message history
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Queued messages across all mailboxes above which the hub reports `warning`
pub const QUEUE_WARNING_THRESHOLD: usize = 1_000;
/// Queued messages across all mailboxes above which the hub reports `critical`
pub const QUEUE_CRITICAL_THRESHOLD: usize = 5_000;

/// Result of a correlated request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(Message),
    TimedOut,
}

impl RequestOutcome {
    pub fn into_response(self) -> Option<Message> {
        match self {
            RequestOutcome::Response(message) => Some(message),
            RequestOutcome::TimedOut => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_messages: u64,
    by_kind: HashMap<MessageKind, u64>,
    agent_activity: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommunicationStats {
    pub total_messages: u64,
    pub messages_by_kind: BTreeMap<String, u64>,
    pub agent_activity: BTreeMap<String, u64>,
    pub active_agents: usize,
    pub total_agents: usize,
    pub mailbox_sizes: BTreeMap<String, usize>,
    pub pending_waiters: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Healthy,
    Warning,
    Critical,
}

impl QueueHealth {
    pub fn from_queued(queued: usize) -> Self {
        if queued > QUEUE_CRITICAL_THRESHOLD {
            QueueHealth::Critical
        } else if queued > QUEUE_WARNING_THRESHOLD {
            QueueHealth::Warning
        } else {
            QueueHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HubHealth {
    pub status: QueueHealth,
    pub active_agents: usize,
    pub total_messages: u64,
    pub queued_messages: usize,
    pub timestamp: DateTime<Utc>,
}

/// Hub-side view of a mailbox owner
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MailboxStatus {
    pub agent_id: String,
    pub active: bool,
    pub queued: usize,
    pub meta: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CommunicationHub {
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    waiters: Arc<WaiterTable>,
    history: Mutex<VecDeque<Message>>,
    counters: Mutex<Counters>,
    context: SharedContext,
    history_limit: usize,
}

impl Default for CommunicationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationHub {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            waiters: Arc::new(WaiterTable::default()),
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters::default()),
            context: SharedContext::new(),
            history_limit: history_limit.max(1),
        }
    }

    fn mailbox(&self, agent_id: &str) -> Option<Arc<Mailbox>> {
        self.mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    fn all_mailboxes(&self) -> Vec<Arc<Mailbox>> {
        self.mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Create (or reactivate) an agent's mailbox. Queued messages survive re-registration.
    pub fn register(&self, agent_id: &str, meta: Map<String, Value>) {
        let mut mailboxes = self.mailboxes.write().unwrap_or_else(PoisonError::into_inner);
        match mailboxes.get(agent_id) {
            Some(existing) => {
                existing.set_meta(meta);
                existing.set_active(true);
                debug!(agent_id, "Mailbox reactivated");
            }
            None => {
                mailboxes.insert(agent_id.to_string(), Arc::new(Mailbox::new(agent_id, meta)));
                info!(agent_id, "Mailbox registered");
            }
        }
    }

    /// Mark a mailbox inactive. It keeps accepting mail but is skipped by broadcast.
    pub fn unregister(&self, agent_id: &str) -> bool {
        match self.mailbox(agent_id) {
            Some(mailbox) => {
                mailbox.set_active(false);
                info!(agent_id, "Mailbox deactivated");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.mailbox(agent_id).is_some()
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        self.mailbox(agent_id)
            .map(|m| m.is_active())
            .unwrap_or(false)
    }

    /// Deliver a message to its receiver's mailbox (or to a waiting correlated request)
    pub fn send(&self, message: Message) -> MeshResult<String> {
        let mailbox = self
            .mailbox(&message.receiver)
            .ok_or_else(|| MeshError::unknown_receiver(&message.receiver))?;

        if !mailbox.is_active() {
            debug!(receiver = %message.receiver, "Delivering to inactive mailbox");
        }

        self.record(&message);
        let message_id = message.id.clone();
        debug!(
            message_id = %message_id,
            sender = %message.sender,
            receiver = %message.receiver,
            kind = %message.kind,
            "Message sent"
        );

        if let Err(message) = self.waiters.try_deliver(message) {
            mailbox.push(message);
        }
        Ok(message_id)
    }

    /// Block up to `timeout` for the next message; `None` polls without waiting
    pub async fn receive(&self, agent_id: &str, timeout: Option<Duration>) -> Option<Message> {
        let mailbox = self.mailbox(agent_id)?;
        mailbox.pop(timeout).await
    }

    /// Send to every active mailbox except the sender and `exclude`
    pub fn broadcast(
        &self,
        sender: &str,
        kind: MessageKind,
        payload: Value,
        exclude: &[&str],
    ) -> Vec<String> {
        let mut receivers: Vec<String> = self
            .all_mailboxes()
            .into_iter()
            .filter(|m| m.is_active() && m.agent_id != sender && !exclude.contains(&m.agent_id.as_str()))
            .map(|m| m.agent_id.clone())
            .collect();
        receivers.sort();

        receivers
            .into_iter()
            .filter_map(|receiver| {
                let message = Message::new(sender, receiver.clone(), kind, payload.clone());
                match self.send(message) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(receiver = %receiver, error = %e, "Broadcast delivery failed");
                        None
                    }
                }
            })
            .collect()
    }

    /// Send `message` and wait up to `timeout` for the correlated response
    ///
    /// A correlation id is generated when the message has none. The waiter is in
    /// place before the message is sent.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> MeshResult<RequestOutcome> {
        let correlation_id = message
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let requester = message.sender.clone();

        let mut batch = self.expect_responses(&requester, vec![correlation_id.clone()]);
        self.send(message)?;

        match batch.next_before(Instant::now() + timeout).await {
            Some(response) => Ok(RequestOutcome::Response(response)),
            None => {
                debug!(requester = %requester, correlation_id = %correlation_id, "Correlated request timed out");
                Ok(RequestOutcome::TimedOut)
            }
        }
    }

    /// Register waiters for a batch of correlation ids owned by `owner`
    pub fn expect_responses(&self, owner: &str, correlation_ids: Vec<String>) -> ResponseBatch {
        ResponseBatch::register(self.waiters.clone(), owner, correlation_ids)
    }

    /// Remove queued messages of `kind` from a mailbox, returning how many were dropped
    pub fn discard_queued(&self, agent_id: &str, kind: MessageKind) -> usize {
        self.mailbox(agent_id)
            .map(|m| m.drain_matching(|msg| msg.kind == kind).len())
            .unwrap_or(0)
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    fn record(&self, message: &Message) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(message.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters.total_messages += 1;
            *counters.by_kind.entry(message.kind).or_insert(0) += 1;
            for agent in [&message.sender, &message.receiver] {
                *counters.agent_activity.entry(agent.clone()).or_insert(0) += 1;
            }
        }
        metrics().message_sent();
    }

    /// Newest-first history, optionally filtered by participant and kind
    pub fn message_history(
        &self,
        agent_id: Option<&str>,
        kind: Option<MessageKind>,
        limit: usize,
    ) -> Vec<Message> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .rev()
            .filter(|m| agent_id.map_or(true, |id| m.sender == id || m.receiver == id))
            .filter(|m| kind.map_or(true, |k| m.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop history entries older than `max_age`
    pub fn cleanup_old_messages(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|m| m.created_at > cutoff);
        let removed = before - history.len();
        if removed > 0 {
            info!(removed, "Pruned message history");
        }
        removed
    }

    pub fn stats(&self) -> CommunicationStats {
        let mailboxes = self.all_mailboxes();
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        CommunicationStats {
            total_messages: counters.total_messages,
            messages_by_kind: counters
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            agent_activity: counters
                .agent_activity
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            active_agents: mailboxes.iter().filter(|m| m.is_active()).count(),
            total_agents: mailboxes.len(),
            mailbox_sizes: mailboxes
                .iter()
                .map(|m| (m.agent_id.clone(), m.len()))
                .collect(),
            pending_waiters: self.waiters.len(),
        }
    }

    pub fn health_check(&self) -> HubHealth {
        let mailboxes = self.all_mailboxes();
        let queued: usize = mailboxes.iter().map(|m| m.len()).sum();
        let total_messages = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_messages;

        HubHealth {
            status: QueueHealth::from_queued(queued),
            active_agents: mailboxes.iter().filter(|m| m.is_active()).count(),
            total_messages,
            queued_messages: queued,
            timestamp: Utc::now(),
        }
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<MailboxStatus> {
        self.mailbox(agent_id).map(|m| MailboxStatus {
            agent_id: m.agent_id.clone(),
            active: m.is_active(),
            queued: m.len(),
            meta: m.meta(),
            registered_at: m.registered_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub_with(agents: &[&str]) -> Arc<CommunicationHub> {
        let hub = Arc::new(CommunicationHub::new());
        for agent in agents {
            hub.register(agent, Map::new());
        }
        hub
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_fails() {
        let hub = hub_with(&["router"]);
        let result = hub.send(Message::new("router", "ghost", MessageKind::TaskAssignment, json!({})));
        assert!(matches!(result, Err(MeshError::UnknownReceiver { .. })));
    }

    #[tokio::test]
    async fn test_mailbox_preserves_send_order() {
        let hub = hub_with(&["router", "worker"]);
        for n in 0..3 {
            hub.send(
                Message::new("router", "worker", MessageKind::TaskAssignment, json!({ "n": n }))
                    .with_priority(n),
            )
            .unwrap();
        }

        for n in 0..3 {
            let message = hub.receive("worker", None).await.unwrap();
            assert_eq!(message.payload["n"], n);
        }
        assert!(hub.receive("worker", None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_with_none() {
        let hub = hub_with(&["worker"]);
        let received = hub.receive("worker", Some(Duration::from_secs(2))).await;
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let hub = hub_with(&["router", "worker"]);
        let receiver = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.receive("worker", Some(Duration::from_secs(5))).await })
        };
        tokio::task::yield_now().await;

        hub.send(Message::new("router", "worker", MessageKind::StatusUpdate, json!("ping")))
            .unwrap();

        let message = receiver.await.unwrap().unwrap();
        assert_eq!(message.payload, json!("ping"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_excluded_and_inactive() {
        let hub = hub_with(&["router", "a", "b", "c", "d"]);
        hub.unregister("d");

        let ids = hub.broadcast("router", MessageKind::StatusUpdate, json!({}), &["b"]);

        assert_eq!(ids.len(), 2);
        assert!(hub.receive("a", None).await.is_some());
        assert!(hub.receive("b", None).await.is_none());
        assert!(hub.receive("c", None).await.is_some());
        assert!(hub.receive("d", None).await.is_none());
        assert!(hub.receive("router", None).await.is_none());
    }

    #[tokio::test]
    async fn test_request_resolves_without_losing_interleaved_mail() {
        let hub = hub_with(&["arbitrator", "worker"]);

        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let request = hub
                    .receive("worker", Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                // Unrelated mail lands in the requester's mailbox first
                hub.send(Message::new("worker", "arbitrator", MessageKind::StatusUpdate, json!("busy")))
                    .unwrap();
                hub.send(request.reply(MessageKind::CollaborationResponse, json!({"answer": 42})))
                    .unwrap();
            })
        };

        let outcome = hub
            .request(
                Message::new("arbitrator", "worker", MessageKind::CollaborationRequest, json!({})),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        responder.await.unwrap();

        let response = outcome.into_response().unwrap();
        assert_eq!(response.payload["answer"], 42);

        let unrelated = hub.receive("arbitrator", None).await.unwrap();
        assert_eq!(unrelated.kind, MessageKind::StatusUpdate);
        assert!(hub.receive("arbitrator", None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_as_value() {
        let hub = hub_with(&["arbitrator", "worker"]);

        let outcome = hub
            .request(
                Message::new("arbitrator", "worker", MessageKind::CollaborationRequest, json!({})),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RequestOutcome::TimedOut);
        assert_eq!(hub.stats().pending_waiters, 0);
    }

    #[tokio::test]
    async fn test_request_to_unknown_target_is_error() {
        let hub = hub_with(&["arbitrator"]);
        let result = hub
            .request(
                Message::new("arbitrator", "ghost", MessageKind::CollaborationRequest, json!({})),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(MeshError::UnknownReceiver { .. })));
    }

    #[tokio::test]
    async fn test_late_response_falls_back_to_mailbox() {
        let hub = hub_with(&["router", "worker"]);
        let batch = hub.expect_responses("router", vec!["t-1".to_string()]);
        drop(batch);

        hub.send(
            Message::new("worker", "router", MessageKind::ResultReport, json!({}))
                .with_correlation("t-1"),
        )
        .unwrap();

        assert_eq!(hub.discard_queued("router", MessageKind::ResultReport), 1);
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let hub = CommunicationHub::with_history_limit(3);
        hub.register("a", Map::new());
        hub.register("b", Map::new());
        for n in 0..5 {
            hub.send(Message::new("a", "b", MessageKind::StatusUpdate, json!(n)))
                .unwrap();
        }

        let history = hub.message_history(None, None, 100);
        let payloads: Vec<_> = history.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(4), json!(3), json!(2)]);

        let filtered = hub.message_history(Some("a"), Some(MessageKind::TaskAssignment), 100);
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_stats_count_kinds_and_participants() {
        let hub = CommunicationHub::new();
        hub.register("a", Map::new());
        hub.register("b", Map::new());
        hub.send(Message::new("a", "b", MessageKind::TaskAssignment, json!({})))
            .unwrap();
        hub.send(Message::new("b", "a", MessageKind::ResultReport, json!({})))
            .unwrap();

        let stats = hub.stats();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.messages_by_kind["task_assignment"], 1);
        assert_eq!(stats.agent_activity["a"], 2);
        assert_eq!(stats.mailbox_sizes["b"], 1);
    }

    #[test]
    fn test_queue_health_thresholds() {
        assert_eq!(QueueHealth::from_queued(10), QueueHealth::Healthy);
        assert_eq!(QueueHealth::from_queued(1_001), QueueHealth::Warning);
        assert_eq!(QueueHealth::from_queued(5_001), QueueHealth::Critical);
    }

    #[test]
    fn test_cleanup_keeps_recent_history() {
        let hub = CommunicationHub::new();
        hub.register("a", Map::new());
        hub.send(Message::new("a", "a", MessageKind::StatusUpdate, json!({})))
            .unwrap();

        assert_eq!(hub.cleanup_old_messages(Duration::from_secs(3600)), 0);
        assert_eq!(hub.message_history(None, None, 10).len(), 1);
    }
}
