//! Process-local agent registry

use crate::registry::{Agent, AgentRegistration, AgentStatus, AgentStore, RegistryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Thread-safe in-memory registry
#[derive(Debug, Default)]
pub struct MemoryAgentStore {
    agents: RwLock<HashMap<String, Agent>>,
    next_seq: AtomicU64,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, registration: AgentRegistration) -> Result<Agent, RegistryError> {
        let mut agents = self.agents.write().await;

        let agent = match agents.get_mut(&registration.id) {
            Some(existing) => {
                existing.agent_type = registration.agent_type;
                existing.capabilities = registration.capabilities;
                existing.meta = registration.meta;
                existing.status = AgentStatus::Active;
                existing.last_heartbeat = Utc::now();
                debug!(agent_id = %existing.id, "Refreshed agent registration");
                existing.clone()
            }
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let agent = Agent::from_registration(registration, seq);
                info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Registered new agent");
                agents.insert(agent.id.clone(), agent.clone());
                agent
            }
        };

        Ok(agent)
    }

    async fn unregister(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError> {
        let removed = self.agents.write().await.remove(agent_id);
        if removed.is_some() {
            info!(agent_id, "Unregistered agent");
        }
        Ok(removed)
    }

    async fn heartbeat(
        &self,
        agent_id: &str,
        cpu: f64,
        reported_load: u32,
    ) -> Result<bool, RegistryError> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = Utc::now();
                agent.cpu = cpu;
                agent.reported_load = reported_load;
                agent.status = AgentStatus::Active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<Agent>, RegistryError> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|agent| agent.registration_seq);
        Ok(agents)
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, RegistryError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .map(|agent| (agent.id.clone(), agent.last_heartbeat))
            .collect())
    }

    async fn adjust_load(&self, agent_id: &str, delta: i64) -> Result<Option<u32>, RegistryError> {
        let mut agents = self.agents.write().await;
        Ok(agents.get_mut(agent_id).map(|agent| {
            let next = (i64::from(agent.load) + delta).max(0);
            agent.load = u32::try_from(next).unwrap_or(u32::MAX);
            agent.load
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registration(id: &str, capabilities: &[&str]) -> AgentRegistration {
        AgentRegistration::new(id, format!("{id}_type")).with_capabilities(capabilities)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let store = MemoryAgentStore::new();
        store
            .register(registration("tox", &["toxicity_detection"]))
            .await
            .unwrap();

        let agent = store.get("tox").await.unwrap().unwrap();
        assert_eq!(agent.agent_type, "tox_type");
        assert_eq!(store.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_load_and_order() {
        let store = MemoryAgentStore::new();
        store.register(registration("first", &[])).await.unwrap();
        store.register(registration("second", &[])).await.unwrap();
        store.adjust_load("first", 2).await.unwrap();

        let refreshed = store
            .register(registration("first", &["content_analysis"]))
            .await
            .unwrap();

        assert_eq!(refreshed.load, 2);
        assert_eq!(refreshed.registration_seq, 0);
        assert!(refreshed.can_handle("content_analysis"));

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent_returns_false() {
        let store = MemoryAgentStore::new();
        assert!(!store.heartbeat("ghost", 0.5, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_records_reported_figures() {
        let store = MemoryAgentStore::new();
        store.register(registration("a", &[])).await.unwrap();

        assert!(store.heartbeat("a", 0.42, 3).await.unwrap());

        let agent = store.get("a").await.unwrap().unwrap();
        assert_eq!(agent.cpu, 0.42);
        assert_eq!(agent.reported_load, 3);
    }

    #[tokio::test]
    async fn test_load_never_goes_negative() {
        let store = MemoryAgentStore::new();
        store.register(registration("a", &[])).await.unwrap();

        assert_eq!(store.adjust_load("a", 1).await.unwrap(), Some(1));
        assert_eq!(store.adjust_load("a", -5).await.unwrap(), Some(0));
        assert_eq!(store.adjust_load("ghost", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_lists_stale_agents() {
        let store = MemoryAgentStore::new();
        store.register(registration("a", &[])).await.unwrap();

        let soon = Utc::now() + chrono::Duration::seconds(5);
        let later = Utc::now() + chrono::Duration::seconds(45);

        assert!(store.expired(soon, Duration::from_secs(30)).await.unwrap().is_empty());
        assert_eq!(
            store.expired(later, Duration::from_secs(30)).await.unwrap(),
            vec!["a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unregister_removes_agent() {
        let store = MemoryAgentStore::new();
        store.register(registration("a", &[])).await.unwrap();

        let removed = store.unregister("a").await.unwrap();
        assert!(removed.is_some());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.unregister("a").await.unwrap().is_none());
    }
}
