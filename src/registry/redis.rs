//! Shared agent registry backed by Redis
//!
//! Layout under a configurable namespace:
//! - `<ns>:agents` hash, agent id -> JSON agent record
//! - `<ns>:heartbeats` hash, agent id -> RFC 3339 timestamp
//! - `<ns>:load` hash, agent id -> in-flight task count (`HINCRBY`)
//! - `<ns>:seq` counter, registration order
//!
//! Heartbeats and load live in their own hashes so they can be updated atomically
//! by several coordinator nodes without rewriting the agent record.

use crate::registry::{Agent, AgentRegistration, AgentStatus, AgentStore, RegistryError};
use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct RedisAgentStore {
    conn: MultiplexedConnection,
    namespace: String,
}

impl RedisAgentStore {
    /// Connect to Redis and use `namespace` as the key prefix
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, RegistryError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(namespace, "Connected shared agent registry");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    fn decode(agent_id: &str, raw: &str) -> Result<Agent, RegistryError> {
        serde_json::from_str(raw).map_err(|source| RegistryError::Corrupt {
            agent_id: agent_id.to_string(),
            source,
        })
    }

    fn parse_timestamp(agent_id: &str, raw: &str) -> DateTime<Utc> {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                // Unreadable heartbeats count as expired
                warn!(agent_id, error = %e, "Unparsable heartbeat timestamp");
                DateTime::<Utc>::MIN_UTC
            }
        }
    }

    async fn write_record(&self, agent: &Agent) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let record = serde_json::to_string(agent)?;
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.key("agents"))
            .arg(&agent.id)
            .arg(record)
            .ignore()
            .cmd("HSET")
            .arg(self.key("heartbeats"))
            .arg(&agent.id)
            .arg(agent.last_heartbeat.to_rfc3339())
            .ignore()
            .cmd("HSETNX")
            .arg(self.key("load"))
            .arg(&agent.id)
            .arg(0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Overlay the heartbeat and load hashes onto a stored record
    fn merge(
        mut agent: Agent,
        heartbeat: Option<&String>,
        load: Option<&i64>,
    ) -> Agent {
        if let Some(raw) = heartbeat {
            agent.last_heartbeat = Self::parse_timestamp(&agent.id, raw);
        }
        if let Some(load) = load {
            agent.load = u32::try_from((*load).max(0)).unwrap_or(u32::MAX);
        }
        agent
    }
}

#[async_trait]
impl AgentStore for RedisAgentStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn register(&self, registration: AgentRegistration) -> Result<Agent, RegistryError> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = ::redis::cmd("HGET")
            .arg(self.key("agents"))
            .arg(&registration.id)
            .query_async(&mut conn)
            .await?;

        let agent = match existing {
            Some(raw) => {
                let mut agent = Self::decode(&registration.id, &raw)?;
                agent.agent_type = registration.agent_type;
                agent.capabilities = registration.capabilities;
                agent.meta = registration.meta;
                agent.status = AgentStatus::Active;
                agent.last_heartbeat = Utc::now();
                debug!(agent_id = %agent.id, "Refreshed shared agent registration");
                agent
            }
            None => {
                let seq: u64 = ::redis::cmd("INCR")
                    .arg(self.key("seq"))
                    .query_async(&mut conn)
                    .await?;
                let agent = Agent::from_registration(registration, seq);
                info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Registered new agent in shared registry");
                agent
            }
        };

        self.write_record(&agent).await?;
        Ok(agent)
    }

    async fn unregister(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError> {
        let existing = self.get(agent_id).await?;
        if existing.is_none() {
            return Ok(None);
        }

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("agents"))
            .arg(agent_id)
            .ignore()
            .cmd("HDEL")
            .arg(self.key("heartbeats"))
            .arg(agent_id)
            .ignore()
            .cmd("HDEL")
            .arg(self.key("load"))
            .arg(agent_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(agent_id, "Unregistered agent from shared registry");
        Ok(existing)
    }

    async fn heartbeat(
        &self,
        agent_id: &str,
        cpu: f64,
        reported_load: u32,
    ) -> Result<bool, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("HGET")
            .arg(self.key("agents"))
            .arg(agent_id)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut agent = Self::decode(agent_id, &raw)?;
        agent.cpu = cpu;
        agent.reported_load = reported_load;
        agent.status = AgentStatus::Active;
        agent.last_heartbeat = Utc::now();
        self.write_record(&agent).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Agent>, RegistryError> {
        let mut conn = self.conn.clone();
        let records: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.key("agents"))
            .query_async(&mut conn)
            .await?;
        let heartbeats: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.key("heartbeats"))
            .query_async(&mut conn)
            .await?;
        let loads: HashMap<String, i64> = ::redis::cmd("HGETALL")
            .arg(self.key("load"))
            .query_async(&mut conn)
            .await?;

        let mut agents = Vec::with_capacity(records.len());
        for (agent_id, raw) in &records {
            let agent = Self::decode(agent_id, raw)?;
            agents.push(Self::merge(agent, heartbeats.get(agent_id), loads.get(agent_id)));
        }
        agents.sort_by_key(|agent| agent.registration_seq);
        Ok(agents)
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Agent>, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("HGET")
            .arg(self.key("agents"))
            .arg(agent_id)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let heartbeat: Option<String> = ::redis::cmd("HGET")
            .arg(self.key("heartbeats"))
            .arg(agent_id)
            .query_async(&mut conn)
            .await?;
        let load: Option<i64> = ::redis::cmd("HGET")
            .arg(self.key("load"))
            .arg(agent_id)
            .query_async(&mut conn)
            .await?;

        let agent = Self::decode(agent_id, &raw)?;
        Ok(Some(Self::merge(agent, heartbeat.as_ref(), load.as_ref())))
    }

    async fn heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.key("heartbeats"))
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .into_iter()
            .map(|(agent_id, ts)| {
                let parsed = Self::parse_timestamp(&agent_id, &ts);
                (agent_id, parsed)
            })
            .collect())
    }

    async fn adjust_load(&self, agent_id: &str, delta: i64) -> Result<Option<u32>, RegistryError> {
        let mut conn = self.conn.clone();
        let known: bool = ::redis::cmd("HEXISTS")
            .arg(self.key("agents"))
            .arg(agent_id)
            .query_async(&mut conn)
            .await?;
        if !known {
            return Ok(None);
        }

        let mut load: i64 = ::redis::cmd("HINCRBY")
            .arg(self.key("load"))
            .arg(agent_id)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        if load < 0 {
            let _: () = ::redis::cmd("HSET")
                .arg(self.key("load"))
                .arg(agent_id)
                .arg(0)
                .query_async(&mut conn)
                .await?;
            load = 0;
        }

        Ok(Some(u32::try_from(load).unwrap_or(u32::MAX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_merge_overlays_shared_counters() {
        let agent = Agent::from_registration(AgentRegistration::new("a", "t"), 1);
        let heartbeat = "2030-01-01T00:00:00+00:00".to_string();

        let merged = RedisAgentStore::merge(agent, Some(&heartbeat), Some(&-3));

        assert_eq!(merged.load, 0);
        assert_eq!(merged.last_heartbeat.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_unparsable_heartbeat_counts_as_expired() {
        let parsed = RedisAgentStore::parse_timestamp("a", "not a timestamp");
        assert!(crate::registry::heartbeat_expired(
            parsed,
            Utc::now(),
            Duration::from_secs(30)
        ));
    }

    // Requires a Redis server at REDIS_URL (default redis://127.0.0.1:6379)
    #[tokio::test]
    #[ignore]
    async fn test_shared_store_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let namespace = format!("agentmesh-test-{}", uuid::Uuid::new_v4());
        let store = RedisAgentStore::connect(&url, &namespace).await.unwrap();

        store
            .register(AgentRegistration::new("tox", "toxicity_detector").with_capabilities(&["toxicity_detection"]))
            .await
            .unwrap();
        assert!(store.heartbeat("tox", 0.3, 1).await.unwrap());
        assert_eq!(store.adjust_load("tox", 2).await.unwrap(), Some(2));
        assert_eq!(store.adjust_load("tox", -5).await.unwrap(), Some(0));

        let agents = store.list().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].can_handle("toxicity_detection"));
        assert!(store.heartbeats().await.unwrap().contains_key("tox"));

        store.unregister("tox").await.unwrap();
        assert!(store.get("tox").await.unwrap().is_none());
    }
}
