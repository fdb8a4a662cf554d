//! Thread-safe metrics collection system
//!
//! Atomic counters for the high-frequency paths (messages, tasks, agents) and
//! mutex-protected collections for per-stage inference outcomes, decisions and
//! session processing times.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SESSION_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Hub traffic
    messages_sent: AtomicU64,

    // Task lifecycle
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_retried: AtomicU64,

    // Agent lifecycle
    agents_registered: AtomicU64,
    agents_unregistered: AtomicU64,
    agents_evicted: AtomicU64,
    auth_failures: AtomicU64,

    // Inference outcomes keyed by stage name
    inference: Mutex<HashMap<String, StageCounters>>,

    // Final decisions keyed by decision name
    decisions: Mutex<HashMap<String, u64>>,
    session_times: Mutex<Vec<u64>>, // milliseconds

    uptime_start: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StageCounters {
    pub judged: u64,
    pub fallbacks: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_timed_out: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            agents_registered: AtomicU64::new(0),
            agents_unregistered: AtomicU64::new(0),
            agents_evicted: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            inference: Mutex::new(HashMap::new()),
            decisions: Mutex::new(HashMap::new()),
            session_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Task lifecycle metrics
    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    // Agent lifecycle metrics
    pub fn agent_registered(&self) {
        self.agents_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_unregistered(&self) {
        self.agents_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_evicted(&self) {
        self.agents_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Inference metrics
    pub fn inference_judged(&self, stage: &str) {
        if let Ok(mut stages) = self.inference.lock() {
            stages.entry(stage.to_string()).or_default().judged += 1;
        }
    }

    pub fn inference_fallback(&self, stage: &str) {
        if let Ok(mut stages) = self.inference.lock() {
            stages.entry(stage.to_string()).or_default().fallbacks += 1;
        }
    }

    /// Record a released decision and how long its session took
    pub fn decision_recorded(&self, decision: &str, duration: Duration) {
        if let Ok(mut decisions) = self.decisions.lock() {
            *decisions.entry(decision.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut times) = self.session_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_SESSION_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.tasks_dispatched,
            &self.tasks_completed,
            &self.tasks_failed,
            &self.tasks_timed_out,
            &self.tasks_retried,
            &self.agents_registered,
            &self.agents_unregistered,
            &self.agents_evicted,
            &self.auth_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut stages) = self.inference.lock() {
            stages.clear();
        }
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.clear();
        }
        if let Ok(mut times) = self.session_times.lock() {
            times.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn session_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.session_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_session_time_ms, session_time_p50_ms, session_time_p95_ms) =
            self.session_time_statistics();

        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            tasks: TaskMetrics {
                dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
                completed: self.tasks_completed.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
                retried: self.tasks_retried.load(Ordering::Relaxed),
            },
            agents: AgentMetrics {
                registered: self.agents_registered.load(Ordering::Relaxed),
                unregistered: self.agents_unregistered.load(Ordering::Relaxed),
                evicted: self.agents_evicted.load(Ordering::Relaxed),
                auth_failures: self.auth_failures.load(Ordering::Relaxed),
            },
            inference: self
                .inference
                .lock()
                .map(|stages| stages.clone())
                .unwrap_or_default(),
            decisions: DecisionMetrics {
                by_decision: self
                    .decisions
                    .lock()
                    .map(|d| d.clone())
                    .unwrap_or_default(),
                avg_session_time_ms,
                session_time_p50_ms,
                session_time_p95_ms,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub tasks: TaskMetrics,
    pub agents: AgentMetrics,
    pub inference: HashMap<String, StageCounters>,
    pub decisions: DecisionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
}

#[derive(Debug, Serialize)]
pub struct AgentMetrics {
    pub registered: u64,
    pub unregistered: u64,
    pub evicted: u64,
    pub auth_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct DecisionMetrics {
    pub by_decision: HashMap<String, u64>,
    pub avg_session_time_ms: f64,
    pub session_time_p50_ms: f64,
    pub session_time_p95_ms: f64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
