//! Agent registry
//!
//! The registry exclusively owns agent records. Two interchangeable backings
//! implement [`AgentStore`]: [`MemoryAgentStore`] for a single node and
//! [`RedisAgentStore`] for presence shared between several coordinator nodes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryAgentStore;
pub use redis::RedisAgentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

/// A registered worker agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks assigned to this agent that are still pending or running
    pub load: u32,
    /// Last CPU figure the agent reported
    #[serde(default)]
    pub cpu: f64,
    /// Last load figure the agent reported about itself
    #[serde(default)]
    pub reported_load: u32,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration order, used to break load ties
    pub registration_seq: u64,
}

impl Agent {
    pub fn from_registration(registration: AgentRegistration, registration_seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: registration.id,
            agent_type: registration.agent_type,
            capabilities: registration.capabilities,
            status: AgentStatus::Active,
            last_heartbeat: now,
            load: 0,
            cpu: 0.0,
            reported_load: 0,
            meta: registration.meta,
            registered_at: now,
            registration_seq,
        }
    }

    /// Case-insensitive capability match
    pub fn can_handle(&self, task_type: &str) -> bool {
        let wanted = task_type.to_lowercase();
        self.capabilities.iter().any(|c| c.to_lowercase() == wanted)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        heartbeat_expired(self.last_heartbeat, now, timeout)
    }
}

pub(crate) fn heartbeat_expired(last: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    (now - last)
        .to_std()
        .map(|age| age > timeout)
        .unwrap_or(false)
}

/// What an agent declares about itself when it registers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub id: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl AgentRegistration {
    pub fn new<I: Into<String>, T: Into<String>>(id: I, agent_type: T) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            meta: Map::new(),
        }
    }

    pub fn with_capabilities<S: AsRef<str>>(mut self, capabilities: &[S]) -> Self {
        self.capabilities = capabilities
            .iter()
            .map(|c| c.as_ref().to_string())
            .collect();
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry backend error: {0}")]
    Backend(String),
    #[error("Corrupt agent record for '{agent_id}': {source}")]
    Corrupt {
        agent_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode agent record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for RegistryError {
    fn from(err: ::redis::RedisError) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

/// Storage contract shared by both registry backings
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    /// Insert or refresh an agent. Re-registering keeps its load and registration order.
    async fn register(&self, registration: AgentRegistration) -> Result<Agent, RegistryError>;

    /// Remove an agent, returning its last record
    async fn unregister(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError>;

    /// Refresh the heartbeat timestamp. Returns false when the agent is unknown.
    async fn heartbeat(
        &self,
        agent_id: &str,
        cpu: f64,
        reported_load: u32,
    ) -> Result<bool, RegistryError>;

    async fn list(&self) -> Result<Vec<Agent>, RegistryError>;

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError>;

    /// Every agent's last heartbeat in one call
    async fn heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, RegistryError>;

    /// Add `delta` to an agent's in-flight count, floored at zero
    async fn adjust_load(&self, agent_id: &str, delta: i64) -> Result<Option<u32>, RegistryError>;

    /// Ids of agents whose heartbeat is older than `timeout`
    async fn expired(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<String>, RegistryError> {
        let mut expired: Vec<String> = self
            .heartbeats()
            .await?
            .into_iter()
            .filter(|(_, last)| heartbeat_expired(*last, now, timeout))
            .map(|(agent_id, _)| agent_id)
            .collect();
        expired.sort();
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matching_is_case_insensitive() {
        let registration = AgentRegistration::new("tox", "toxicity_detector")
            .with_capabilities(&["Toxicity_Detection", "risk_assessment"]);
        let agent = Agent::from_registration(registration, 0);

        assert!(agent.can_handle("toxicity_detection"));
        assert!(agent.can_handle("RISK_ASSESSMENT"));
        assert!(!agent.can_handle("sentiment_analysis"));
    }

    #[test]
    fn test_expiry_uses_strictly_greater_than() {
        let agent = Agent::from_registration(AgentRegistration::new("a", "t"), 0);
        let timeout = Duration::from_secs(30);

        let at_limit = agent.last_heartbeat + chrono::Duration::seconds(30);
        let past_limit = agent.last_heartbeat + chrono::Duration::seconds(31);

        assert!(!agent.is_expired(at_limit, timeout));
        assert!(agent.is_expired(past_limit, timeout));
    }

    #[test]
    fn test_new_agent_starts_active_and_idle() {
        let agent = Agent::from_registration(AgentRegistration::new("a", "t"), 7);
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.load, 0);
        assert_eq!(agent.registration_seq, 7);
    }
}
