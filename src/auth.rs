//! Shared-secret check applied by every transport before it accepts a call

use crate::error::{MeshError, MeshResult};
use crate::observability::metrics::metrics;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Default environment variable holding comma-separated API keys
pub const DEFAULT_API_KEYS_ENV: &str = "AGENT_API_KEYS";

#[derive(Clone, Default)]
pub struct ApiKeyAuth {
    keys: HashSet<String>,
}

impl fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("keys", &format!("[{} keys]", self.keys.len()))
            .finish()
    }
}

impl ApiKeyAuth {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Load keys from a comma-separated environment variable
    pub fn from_env(var: &str) -> Self {
        let auth = match std::env::var(var) {
            Ok(raw) => Self::new(raw.split(',')),
            Err(_) => Self::default(),
        };
        if auth.keys.is_empty() {
            warn!(var, "No API keys configured; every transport call will be rejected");
        }
        auth
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Accept only a credential that matches a configured key
    pub fn verify(&self, presented: Option<&str>) -> MeshResult<()> {
        let result = match presented {
            None => Err(MeshError::auth_failure("missing API key")),
            Some(key) if self.keys.contains(key) => Ok(()),
            Some(_) => Err(MeshError::auth_failure("invalid API key")),
        };
        if result.is_err() {
            metrics().auth_failure();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_is_accepted() {
        let auth = ApiKeyAuth::new(["alpha", " beta "]);
        assert!(auth.verify(Some("alpha")).is_ok());
        assert!(auth.verify(Some("beta")).is_ok());
    }

    #[test]
    fn test_wrong_or_missing_key_is_rejected() {
        let auth = ApiKeyAuth::new(["alpha"]);
        assert!(matches!(
            auth.verify(Some("gamma")),
            Err(MeshError::AuthFailure { .. })
        ));
        assert!(matches!(auth.verify(None), Err(MeshError::AuthFailure { .. })));
    }

    #[test]
    fn test_empty_key_set_rejects_everything() {
        let auth = ApiKeyAuth::new(Vec::<String>::new());
        assert!(auth.verify(Some("")).is_err());
        assert!(auth.verify(Some("anything")).is_err());
    }

    #[test]
    fn test_blank_entries_are_ignored() {
        let auth = ApiKeyAuth::new("a,,  ,b".split(','));
        assert_eq!(auth.key_count(), 2);
    }

    #[test]
    fn test_debug_hides_keys() {
        let auth = ApiKeyAuth::new(["super-secret"]);
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
