//! Configuration for flushes and the REST adapter.

use crate::error::{FlushError, FlushResult};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the orchestrator does with sibling subtrees after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let every dispatched subtree run to completion, then report the
    /// first failure observed.
    #[default]
    AwaitAll,
    /// Stop polling pending sibling subtrees as soon as a failure is
    /// observed. Requests already sent to the remote store are not undone.
    CancelPending,
}

/// Configuration for flush operations.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Repair parent has-many collections after children are persisted.
    pub reconcile_relationships: bool,
    /// Behavior of sibling subtrees after a failure.
    pub failure_policy: FailurePolicy,
}

impl FlushConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            reconcile_relationships: true,
            failure_policy: FailurePolicy::AwaitAll,
        }
    }

    /// Enables or disables relationship reconciliation.
    pub fn with_reconcile_relationships(mut self, enabled: bool) -> Self {
        self.reconcile_relationships = enabled;
        self
    }

    /// Sets the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the REST adapter.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Base URL (e.g. "https://api.example.com"). May be empty for
    /// host-relative URLs.
    pub url: String,
    /// Optional path namespace (e.g. "api/v1"). Must not start with a slash.
    pub namespace: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Query parameter used for incremental fetches.
    pub since_param: String,
    /// Irregular plural roots (singular → plural).
    pub plurals: BTreeMap<String, String>,
}

impl AdapterConfig {
    /// Creates a configuration for the given base URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: None,
            timeout: Duration::from_secs(30),
            since_param: "since".to_string(),
            plurals: BTreeMap::new(),
        }
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the query parameter used by `since_query`.
    pub fn with_since_param(mut self, param: impl Into<String>) -> Self {
        self.since_param = param.into();
        self
    }

    /// Registers an irregular plural.
    pub fn with_plural(mut self, singular: impl Into<String>, plural: impl Into<String>) -> Self {
        self.plurals.insert(singular.into(), plural.into());
        self
    }

    /// Checks the configuration for invalid values.
    pub fn validate(&self) -> FlushResult<()> {
        if let Some(namespace) = &self.namespace {
            if namespace.starts_with('/') {
                return Err(FlushError::Config(format!(
                    "namespace URL ({namespace}) must not start with slash"
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(FlushError::Config("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_config_builder() {
        let config = FlushConfig::new()
            .with_reconcile_relationships(false)
            .with_failure_policy(FailurePolicy::CancelPending);

        assert!(!config.reconcile_relationships);
        assert_eq!(config.failure_policy, FailurePolicy::CancelPending);
        assert_eq!(FlushConfig::default().failure_policy, FailurePolicy::AwaitAll);
    }

    #[test]
    fn adapter_config_builder() {
        let config = AdapterConfig::new("https://api.example.com")
            .with_namespace("api/v1")
            .with_timeout(Duration::from_secs(5))
            .with_since_param("updated_since")
            .with_plural("person", "people");

        assert_eq!(config.namespace.as_deref(), Some("api/v1"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.since_param, "updated_since");
        assert_eq!(config.plurals.get("person").map(String::as_str), Some("people"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn namespace_with_leading_slash_is_rejected() {
        let config = AdapterConfig::new("").with_namespace("/api");
        assert!(matches!(config.validate(), Err(FlushError::Config(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = AdapterConfig::new("").with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
