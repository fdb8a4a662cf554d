//! Liveness monitor
//!
//! Runs on a fixed interval. Each tick evicts agents whose heartbeat expired,
//! requeues or fails tasks stuck in `running`, and drops settled tasks past the
//! retention window. Evictions trigger a best-effort webhook callback.

use crate::observability::metrics::metrics;
use crate::transport::Coordinator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reason sent to the webhook when an agent misses its heartbeat window
pub const EVICTION_REASON: &str = "timeout";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub agent_timeout: Duration,
    pub task_timeout: Duration,
    pub max_retries: u32,
    pub retention: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(60),
            max_retries: 3,
            retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Serialize)]
struct EvictionNotice<'a> {
    agent_id: &'a str,
    reason: &'a str,
}

/// Fire-and-forget HTTP callback for evicted agents
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new<S: Into<String>>(url: S) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `{agent_id, reason}`; failures are logged and never surface
    pub async fn notify(&self, agent_id: &str, reason: &str) {
        let notice = EvictionNotice { agent_id, reason };
        match self.client.post(&self.url).json(&notice).send().await {
            Ok(response) => {
                debug!(agent_id, status = %response.status(), url = %self.url, "Webhook delivered");
            }
            Err(e) => {
                warn!(agent_id, url = %self.url, error = %e, "Webhook failed");
            }
        }
    }

    /// Send the callback on a background task
    pub fn notify_detached(&self, agent_id: &str, reason: &str) -> JoinHandle<()> {
        let notifier = self.clone();
        let agent_id = agent_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move { notifier.notify(&agent_id, &reason).await })
    }
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub evicted: Vec<String>,
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    pub collected: usize,
}

pub struct LivenessMonitor {
    coordinator: Arc<Coordinator>,
    settings: MonitorSettings,
    notifier: Option<WebhookNotifier>,
}

impl LivenessMonitor {
    pub fn new(coordinator: Arc<Coordinator>, settings: MonitorSettings) -> Self {
        Self {
            coordinator,
            settings,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run one pass at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let expired = match self
            .coordinator
            .registry()
            .expired(now, self.settings.agent_timeout)
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "Could not read agent heartbeats");
                Vec::new()
            }
        };
        for agent_id in expired {
            warn!(agent_id = %agent_id, "Agent missed heartbeat window, evicting");
            match self.coordinator.remove_agent(&agent_id, "heartbeat expired").await {
                Ok(_) => {
                    metrics().agent_evicted();
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_detached(&agent_id, EVICTION_REASON);
                    }
                    report.evicted.push(agent_id);
                }
                Err(e) => error!(agent_id = %agent_id, error = %e, "Eviction failed"),
            }
        }

        let board = self.coordinator.board();
        let sweep = board
            .sweep_timeouts(now, self.settings.task_timeout, self.settings.max_retries)
            .await;
        for _ in &sweep.requeued {
            metrics().task_retried();
        }
        for _ in &sweep.failed {
            metrics().task_timed_out();
            metrics().task_failed();
        }
        report.requeued = sweep.requeued;
        report.failed = sweep.failed.iter().map(|t| t.id.clone()).collect();
        self.coordinator.settle(sweep.failed).await;

        report.collected = board.collect_garbage(now, self.settings.retention).await;

        if !report.evicted.is_empty() || !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                evicted = report.evicted.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                collected = report.collected,
                "Liveness sweep"
            );
        }
        report
    }

    /// Tick on the configured interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.tick().await; // First tick completes immediately, skip it
            info!(interval_ms = self.settings.interval.as_millis() as u64, "Liveness monitor started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Liveness monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
