//! Controller configuration.
//!
//! Everything has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding either a path to a JSON config file or the
/// JSON document itself.
pub const CONFIG_ENV: &str = "CAPS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables shared by every controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Prefix of generated resource names and ownership tags.
    pub tag_prefix: String,
    /// Default retry delay of transient provider conditions.
    pub transient_retry_secs: u64,
    /// Retry delay while an upstream object is not ready yet.
    pub dependency_wait_secs: u64,
    /// Retry delay while dependents still block a deletion.
    pub dependents_wait_secs: u64,
    /// Retry delay while a public gateway is not running.
    pub gateway_not_ready_secs: u64,
    /// Retry delay while a server is starting or stopping.
    pub server_transition_secs: u64,
    /// Retry delay while a managed cluster or pool is provisioning.
    pub cluster_provisioning_secs: u64,
    /// Periodic resync of converged objects. `None` waits for changes.
    pub resync_secs: Option<u64>,
    /// Upper bound of a single reconcile pass.
    pub reconcile_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tag_prefix: "caps".to_string(),
            transient_retry_secs: 5,
            dependency_wait_secs: 5,
            dependents_wait_secs: 10,
            gateway_not_ready_secs: 3,
            server_transition_secs: 5,
            cluster_provisioning_secs: 15,
            resync_secs: None,
            reconcile_timeout_secs: 300,
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Load from [`CONFIG_ENV`], falling back to defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(value) if value.trim_start().starts_with('{') => Self::from_json(&value),
            Ok(value) if !value.is_empty() => Self::from_file(value),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix_ok = !self.tag_prefix.is_empty()
            && self.tag_prefix.len() <= 16
            && self
                .tag_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.tag_prefix.starts_with('-')
            && !self.tag_prefix.ends_with('-');
        if !prefix_ok {
            return Err(ConfigError::Invalid(format!(
                "tagPrefix {:?} must be 1-16 lowercase alphanumerics or '-'",
                self.tag_prefix
            )));
        }

        let delays = [
            ("transientRetrySecs", self.transient_retry_secs),
            ("dependencyWaitSecs", self.dependency_wait_secs),
            ("dependentsWaitSecs", self.dependents_wait_secs),
            ("gatewayNotReadySecs", self.gateway_not_ready_secs),
            ("serverTransitionSecs", self.server_transition_secs),
            ("clusterProvisioningSecs", self.cluster_provisioning_secs),
            ("reconcileTimeoutSecs", self.reconcile_timeout_secs),
        ];
        if let Some((name, _)) = delays.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.resync_secs == Some(0) {
            return Err(ConfigError::Invalid("resyncSecs must be positive".into()));
        }
        Ok(())
    }

    pub fn transient_retry(&self) -> Duration {
        Duration::from_secs(self.transient_retry_secs)
    }

    pub fn dependency_wait(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_secs)
    }

    pub fn dependents_wait(&self) -> Duration {
        Duration::from_secs(self.dependents_wait_secs)
    }

    pub fn gateway_not_ready(&self) -> Duration {
        Duration::from_secs(self.gateway_not_ready_secs)
    }

    pub fn server_transition(&self) -> Duration {
        Duration::from_secs(self.server_transition_secs)
    }

    pub fn cluster_provisioning(&self) -> Duration {
        Duration::from_secs(self.cluster_provisioning_secs)
    }

    pub fn resync(&self) -> Option<Duration> {
        self.resync_secs.map(Duration::from_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = ControllerConfig::from_json("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.tag_prefix, "caps");
        assert_eq!(config.gateway_not_ready(), Duration::from_secs(3));
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(300));
        assert_eq!(config.resync(), None);
    }

    #[test]
    fn test_partial_override() {
        let config =
            ControllerConfig::from_json(r#"{"dependentsWaitSecs": 30, "resyncSecs": 600}"#)
                .unwrap();
        assert_eq!(config.dependents_wait(), Duration::from_secs(30));
        assert_eq!(config.resync(), Some(Duration::from_secs(600)));
        assert_eq!(config.transient_retry(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_delay() {
        let err = ControllerConfig::from_json(r#"{"transientRetrySecs": 0}"#).unwrap_err();
        assert!(err.to_string().contains("transientRetrySecs"));
    }

    #[test]
    fn test_rejects_bad_prefix() {
        for prefix in ["", "CAPS", "-caps", "caps_x", "averyveryverylongprefix"] {
            let config = ControllerConfig {
                tag_prefix: prefix.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{:?} accepted", prefix);
        }
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            ControllerConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
