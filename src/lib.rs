//! agentmesh - multi-agent coordination hub
//!
//! A hub that routes prioritized messages between cooperating agents, tracks
//! their liveness, splits a content item into specialist sub-tasks and
//! arbitrates the agents' findings into one verdict.
//!
//! # Overview
//!
//! - [`hub`]: in-process mailboxes, correlation waiters, shared context
//! - [`queue`] and [`registry`]: priority queues, task lifecycle, agent presence
//! - [`router`]: decompose, assign, dispatch and integrate a moderation session
//! - [`consensus`]: consensus analysis, arbitration and safety validation
//! - [`worker`]: in-process specialist agents
//! - [`transport`]: HTTP, WebSocket, gRPC and JSON-RPC adapters for remote agents
//!
//! Content judgements are delegated to an [`inference::InferenceService`]; every
//! stage has a deterministic fallback when the service fails.
//!
//! # Quick Start
//!
//! ```rust
//! use agentmesh::hub::CommunicationHub;
//! use agentmesh::protocol::{Message, MessageKind};
//! use serde_json::{json, Map};
//!
//! # tokio_test::block_on(async {
//! let hub = CommunicationHub::new();
//! hub.register("router", Map::new());
//! hub.register("toxicity_detector", Map::new());
//!
//! let message = Message::new(
//!     "router",
//!     "toxicity_detector",
//!     MessageKind::TaskAssignment,
//!     json!({"content": "hello"}),
//! )
//! .with_priority(8);
//! hub.send(message).unwrap();
//!
//! let received = hub.receive("toxicity_detector", None).await.unwrap();
//! assert_eq!(received.priority, 8);
//! # });
//! ```

pub mod auth;
pub mod config;
pub mod consensus;
pub mod error;
pub mod hub;
pub mod inference;
pub mod llm;
pub mod monitor;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod router;
pub mod testing;
pub mod transport;
pub mod worker;

pub use auth::ApiKeyAuth;
pub use config::{ConfigError, MeshConfig};
pub use consensus::{Arbitrator, ArbitrationResult, FinalDecision};
pub use error::{MeshError, MeshResult};
pub use hub::CommunicationHub;
pub use inference::{InferenceService, RuleOnlyInference};
pub use monitor::LivenessMonitor;
pub use pipeline::{ModerationOutcome, ModerationPipeline, ModerationRequest};
pub use protocol::{Message, MessageKind, Task, TaskStatus};
pub use queue::TaskBoard;
pub use registry::{Agent, AgentStore, MemoryAgentStore, RedisAgentStore};
pub use router::TaskRouter;
pub use transport::{AgentTransport, Coordinator};
pub use worker::WorkerAgent;
