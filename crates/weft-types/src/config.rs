//! Controller configuration types.
//!
//! `ControllerConfig` mirrors `config.toml`. Every field is defaulted so an
//! empty or missing file yields a working controller.

use serde::{Deserialize, Serialize};

use crate::workflow::ArtifactRepository;

/// Top-level configuration for the workflow controller.
///
/// Loaded from `~/.weft/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Namespace the controller itself runs in; the cluster-default artifact
    /// repository is reported as living here.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Period of the full resync pass, in seconds.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Period of the TTL garbage-collection pass, in seconds.
    #[serde(default = "default_ttl_interval_secs")]
    pub ttl_interval_secs: u64,

    /// Parallelism applied to workflows that declare none.
    #[serde(default)]
    pub default_parallelism: Option<u32>,

    /// Case-insensitive message fragments that mark a failure as transient
    /// for `retryPolicy: OnTransientError`.
    #[serde(default = "default_transient_error_patterns")]
    pub transient_error_patterns: Vec<String>,

    /// Cluster-level default artifact repository.
    #[serde(default)]
    pub artifact_repository: Option<ArtifactRepository>,
}

fn default_namespace() -> String {
    "weft".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_resync_interval_secs() -> u64 {
    10
}

fn default_ttl_interval_secs() -> u64 {
    5
}

fn default_transient_error_patterns() -> Vec<String> {
    vec![
        "connection reset".to_string(),
        "connection refused".to_string(),
        "timed out".to_string(),
        "temporarily unavailable".to_string(),
    ]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            ttl_interval_secs: default_ttl_interval_secs(),
            default_parallelism: None,
            transient_error_patterns: default_transient_error_patterns(),
            artifact_repository: None,
        }
    }
}

impl ControllerConfig {
    /// True when `message` matches one of the configured transient patterns.
    pub fn is_transient(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.transient_error_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_default_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.namespace, "weft");
        assert_eq!(config.workers, 4);
        assert!(config.artifact_repository.is_none());
    }

    #[test]
    fn test_controller_config_deserialize_with_defaults() {
        let config: ControllerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_controller_config_deserialize_with_values() {
        let toml_str = r#"
namespace = "argo"
workers = 8
default_parallelism = 3
transient_error_patterns = ["etcd leader changed"]

[artifact_repository.s3]
bucket = "my-bucket"
endpoint = "minio:9000"
key_format = "{{workflow.name}}/{{pod.name}}"
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.namespace, "argo");
        assert_eq!(config.workers, 8);
        assert_eq!(config.default_parallelism, Some(3));
        let s3 = config.artifact_repository.unwrap().s3.unwrap();
        assert_eq!(s3.bucket, "my-bucket");
        assert_eq!(s3.key_format.as_deref(), Some("{{workflow.name}}/{{pod.name}}"));
    }

    #[test]
    fn test_transient_pattern_match_is_case_insensitive() {
        let config = ControllerConfig::default();
        assert!(config.is_transient("dial tcp: Connection Refused"));
        assert!(!config.is_transient("failed with exit code 1"));
    }
}
