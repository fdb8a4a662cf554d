//! Configuration for an agentmesh node
//!
//! Loaded from TOML, validated, then overridden by the environment knobs
//! (`AGENT_TIMEOUT`, `TASK_TIMEOUT`, `TASK_MAX_RETRIES`, `CONSENSUS_THRESHOLD`,
//! `MONITOR_INTERVAL`, `REDIS_URL`, `NOTIFY_WEBHOOK_URL`). Secrets are never stored
//! in the file; the file only names the environment variables holding them.

use crate::consensus::ArbitratorSettings;
use crate::inference::LlmInferenceConfig;
use crate::monitor::MonitorSettings;
use crate::router::RouterSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub workers: WorkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Node identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Heartbeat expiry
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// How long a task may stay `running`
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub task_max_retries: u32,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_clarification_timeout")]
    pub clarification_timeout_secs: u64,
    /// How long settled tasks stay queryable
    #[serde(default = "default_retention")]
    pub task_retention_secs: u64,
}

fn default_agent_timeout() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_clarification_timeout() -> u64 {
    10
}

fn default_retention() -> u64 {
    3600
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout(),
            task_timeout_secs: default_task_timeout(),
            task_max_retries: default_max_retries(),
            monitor_interval_secs: default_monitor_interval(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            clarification_timeout_secs: default_clarification_timeout(),
            task_retention_secs: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusSection {
    #[serde(default = "default_consensus_threshold")]
    pub threshold: f64,
    /// Findings below this confidence get a clarification request
    #[serde(default = "default_clarification_confidence")]
    pub clarification_confidence: f64,
    #[serde(default = "default_analysis_permits")]
    pub analysis_permits: usize,
}

fn default_consensus_threshold() -> f64 {
    0.7
}

fn default_clarification_confidence() -> f64 {
    0.7
}

fn default_analysis_permits() -> usize {
    4
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            threshold: default_consensus_threshold(),
            clarification_confidence: default_clarification_confidence(),
            analysis_permits: default_analysis_permits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Environment variable holding comma-separated shared secrets
    #[serde(default = "default_api_keys_env")]
    pub api_keys_env: String,
}

fn default_api_keys_env() -> String {
    "AGENT_API_KEYS".to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            api_keys_env: default_api_keys_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
    #[serde(default)]
    pub backend: RegistryBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "agentmesh".to_string()
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            redis_url: None,
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InferenceProvider {
    /// Rule-based fallbacks only
    #[default]
    None,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceSection {
    #[serde(default)]
    pub provider: InferenceProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable containing the API key
    #[serde(default = "default_inference_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_inference_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_inference_timeout() -> u64 {
    20
}

fn default_max_tokens() -> u32 {
    1500
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            provider: InferenceProvider::None,
            model: default_model(),
            base_url: None,
            api_key_env: default_inference_key_env(),
            timeout_secs: default_inference_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Listeners. HTTP, WebSocket (`/ws`) and JSON-RPC (`/rpc`) share `http_bind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_true")]
    pub http_enabled: bool,
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_true")]
    pub grpc_enabled: bool,
    #[serde(default = "default_grpc_bind")]
    pub grpc_bind: String,
}

fn default_true() -> bool {
    true
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_grpc_bind() -> String {
    "0.0.0.0:50051".to_string()
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            http_enabled: true,
            http_bind: default_http_bind(),
            grpc_enabled: true,
            grpc_bind: default_grpc_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NotifySection {
    /// Callback POSTed when an agent is evicted
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Start the built-in specialist roster on this node
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_worker_heartbeat")]
    pub heartbeat_interval_secs: u64,
}

fn default_worker_heartbeat() -> u64 {
    10
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_secs: default_worker_heartbeat(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid value '{value}' in environment variable {var}")]
    InvalidEnv { var: String, value: String },
    #[error("Invalid node ID format: {0}")]
    InvalidNodeId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshConfig {
    /// Load from TOML, validate, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the environment
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in configuration used when no file is found
    pub fn with_defaults<S: Into<String>>(node_id: S) -> Self {
        Self {
            node: NodeSection {
                id: node_id.into(),
                description: String::new(),
            },
            timeouts: TimeoutSection::default(),
            consensus: ConsensusSection::default(),
            auth: AuthSection::default(),
            registry: RegistrySection::default(),
            inference: InferenceSection::default(),
            transport: TransportSection::default(),
            notify: NotifySection::default(),
            workers: WorkerSection::default(),
        }
    }

    /// Apply the environment knobs through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, "AGENT_TIMEOUT")? {
            self.timeouts.agent_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "TASK_TIMEOUT")? {
            self.timeouts.task_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "TASK_MAX_RETRIES")? {
            self.timeouts.task_max_retries = v;
        }
        if let Some(v) = parse_override(&lookup, "MONITOR_INTERVAL")? {
            self.timeouts.monitor_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "CONSENSUS_THRESHOLD")? {
            self.consensus.threshold = v;
        }
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            self.registry.redis_url = Some(url);
            self.registry.backend = RegistryBackend::Redis;
        }
        if let Some(url) = lookup("NOTIFY_WEBHOOK_URL").filter(|v| !v.trim().is_empty()) {
            self.notify.webhook_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_node_id(&self.node.id)?;

        if !(0.0..=1.0).contains(&self.consensus.threshold) {
            return Err(ConfigError::InvalidConfig(format!(
                "consensus.threshold must be within [0, 1], got {}",
                self.consensus.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.consensus.clarification_confidence) {
            return Err(ConfigError::InvalidConfig(
                "consensus.clarification_confidence must be within [0, 1]".to_string(),
            ));
        }
        if self.consensus.analysis_permits == 0 {
            return Err(ConfigError::InvalidConfig(
                "consensus.analysis_permits must be at least 1".to_string(),
            ));
        }
        if self.timeouts.monitor_interval_secs == 0 || self.timeouts.agent_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "monitor interval and agent timeout must be positive".to_string(),
            ));
        }
        if self.registry.backend == RegistryBackend::Redis {
            let url = self.registry.redis_url.as_deref().ok_or_else(|| {
                ConfigError::InvalidConfig("redis backend requires registry.redis_url".to_string())
            })?;
            validate_url(url, &["redis", "rediss"])?;
        }
        if let Some(url) = &self.notify.webhook_url {
            validate_url(url, &["http", "https"])?;
        }
        if let Some(url) = &self.inference.base_url {
            validate_url(url, &["http", "https"])?;
        }
        if self.transport.http_enabled {
            parse_bind(&self.transport.http_bind)?;
        }
        if self.transport.grpc_enabled {
            parse_bind(&self.transport.grpc_bind)?;
        }
        Ok(())
    }

    pub fn inference_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.inference.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.inference.api_key_env.clone()))
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind(&self.transport.http_bind)
    }

    pub fn grpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind(&self.transport.grpc_bind)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.timeouts.monitor_interval_secs),
            agent_timeout: Duration::from_secs(self.timeouts.agent_timeout_secs),
            task_timeout: Duration::from_secs(self.timeouts.task_timeout_secs),
            max_retries: self.timeouts.task_max_retries,
            retention: Duration::from_secs(self.timeouts.task_retention_secs),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            dispatch_timeout: Duration::from_secs(self.timeouts.dispatch_timeout_secs),
        }
    }

    pub fn arbitrator_settings(&self) -> ArbitratorSettings {
        ArbitratorSettings {
            consensus_threshold: self.consensus.threshold,
            clarification_confidence: self.consensus.clarification_confidence,
            clarification_timeout: Duration::from_secs(self.timeouts.clarification_timeout_secs),
            analysis_permits: self.consensus.analysis_permits,
        }
    }

    pub fn llm_inference_config(&self) -> LlmInferenceConfig {
        LlmInferenceConfig {
            model: self.inference.model.clone(),
            timeout: Duration::from_secs(self.inference.timeout_secs),
            max_tokens: self.inference.max_tokens,
        }
    }
}

fn parse_override<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
    }
}

fn parse_bind(bind: &str) -> Result<SocketAddr, ConfigError> {
    bind.parse()
        .map_err(|_| ConfigError::InvalidConfig(format!("invalid bind address '{bind}'")))
}

fn validate_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw)
        .map_err(|e| ConfigError::InvalidConfig(format!("invalid URL '{raw}': {e}")))?;
    if schemes.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidConfig(format!(
            "URL '{raw}' must use one of: {}",
            schemes.join(", ")
        )))
    }
}

/// Node ids must match [a-zA-Z0-9._-]+
fn validate_node_id(node_id: &str) -> Result<(), ConfigError> {
    let valid_chars = node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if node_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidNodeId(format!(
            "Node ID '{node_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
