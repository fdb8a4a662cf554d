//! Error taxonomy for the coordination hub
//!
//! Every layer has its own error enum; they all fold into [`MeshError`], which is
//! what the hub, router, coordinator and transports return. Errors that cross a
//! wire boundary are converted with [`MeshError::to_wire`] so that credentials and
//! filesystem paths never leak to remote agents.

use crate::protocol::{ErrorBody, ErrorCode};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for hub operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Unknown receiver: {agent_id}")]
    UnknownReceiver { agent_id: String },

    #[error("Timed out after {waited_ms}ms waiting for {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("No capable agent for task type '{task_type}'")]
    NoCapableAgent { task_type: String },

    #[error("Inference service failure: {message}")]
    InferenceFailure { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailure { message: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MeshError {
    /// Convert to the sanitized error body sent back over every transport
    pub fn to_wire(&self) -> ErrorBody {
        let code = match self {
            MeshError::UnknownReceiver { .. } => ErrorCode::UnknownReceiver,
            MeshError::Timeout { .. } => ErrorCode::Timeout,
            MeshError::NoCapableAgent { .. } => ErrorCode::NoCapableAgent,
            MeshError::InferenceFailure { .. } => ErrorCode::InferenceFailure,
            MeshError::AuthFailure { .. } => ErrorCode::AuthFailure,
            MeshError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            MeshError::InvalidInput { .. } => ErrorCode::InvalidInput,
            MeshError::Registry(_)
            | MeshError::Transport(_)
            | MeshError::Config(_)
            | MeshError::Internal { .. } => ErrorCode::InternalError,
        };

        ErrorBody {
            code,
            message: sanitize_error_message(&self.to_string()),
        }
    }

    pub fn unknown_receiver<S: Into<String>>(agent_id: S) -> Self {
        Self::UnknownReceiver {
            agent_id: agent_id.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, waited_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_ms,
        }
    }

    pub fn no_capable_agent<S: Into<String>>(task_type: S) -> Self {
        Self::NoCapableAgent {
            task_type: task_type.into(),
        }
    }

    pub fn inference_failure<S: Into<String>>(message: S) -> Self {
        Self::InferenceFailure {
            message: message.into(),
        }
    }

    pub fn auth_failure<S: Into<String>>(message: S) -> Self {
        Self::AuthFailure {
            message: message.into(),
        }
    }

    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_WIRE_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, then cap the message length
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(re) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > MAX_WIRE_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_WIRE_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for hub operations
pub type MeshResult<T> = Result<T, MeshError>;
