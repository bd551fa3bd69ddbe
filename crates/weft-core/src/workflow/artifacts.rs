//! Artifact repository resolution and artifact key planning.
//!
//! Precedence: an explicit `artifactRepositoryRef` in the workflow spec,
//! then the namespace's `artifact-repositories` config map default, then the
//! cluster default from controller configuration. The result is recorded on
//! workflow status once and reused for the rest of the execution.

use weft_types::config::ControllerConfig;
use weft_types::workflow::{
    Artifact, ArtifactRepository, ArtifactRepositoryRef, ArtifactRepositoryRefStatus, S3Artifact,
};

use crate::repository::lookup::ConfigMapLookup;

/// Config map consulted for namespace-level repositories.
pub const DEFAULT_CONFIG_MAP: &str = "artifact-repositories";
/// Annotation on that config map naming its default key.
pub const DEFAULT_KEY_ANNOTATION: &str = "workflows.weft.io/default-artifact-repository";
pub const DEFAULT_KEY_FORMAT: &str = "{{workflow.name}}/{{pod.name}}";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactRepositoryError {
    #[error("artifact repository config map '{namespace}/{name}' not found")]
    ConfigMapNotFound { namespace: String, name: String },

    #[error("config map '{name}' has no default artifact repository key")]
    NoDefaultKey { name: String },

    #[error("config map '{name}' has no artifact repository under key '{key}'")]
    KeyNotFound { name: String, key: String },

    #[error("artifact repository '{name}/{key}' is malformed: {reason}")]
    Malformed {
        name: String,
        key: String,
        reason: String,
    },
}

/// Resolve the effective artifact repository for a workflow in `namespace`.
pub fn resolve(
    namespace: &str,
    reference: Option<&ArtifactRepositoryRef>,
    config_maps: &dyn ConfigMapLookup,
    config: &ControllerConfig,
) -> Result<ArtifactRepositoryRefStatus, ArtifactRepositoryError> {
    if let Some(explicit) = reference {
        let name = explicit.config_map.as_deref().unwrap_or(DEFAULT_CONFIG_MAP);
        let cm = config_maps.get_config_map(namespace, name).ok_or_else(|| {
            ArtifactRepositoryError::ConfigMapNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        })?;
        let key = match &explicit.key {
            Some(key) => key.clone(),
            None => cm
                .annotations
                .get(DEFAULT_KEY_ANNOTATION)
                .cloned()
                .ok_or_else(|| ArtifactRepositoryError::NoDefaultKey {
                    name: name.to_string(),
                })?,
        };
        let repository = parse_entry(name, &key, cm.data.get(&key))?;
        return Ok(ArtifactRepositoryRefStatus {
            namespace: namespace.to_string(),
            config_map: name.to_string(),
            key,
            default: false,
            artifact_repository: repository,
        });
    }

    if let Some(cm) = config_maps.get_config_map(namespace, DEFAULT_CONFIG_MAP) {
        if let Some(key) = cm.annotations.get(DEFAULT_KEY_ANNOTATION) {
            let repository = parse_entry(DEFAULT_CONFIG_MAP, key, cm.data.get(key))?;
            return Ok(ArtifactRepositoryRefStatus {
                namespace: namespace.to_string(),
                config_map: DEFAULT_CONFIG_MAP.to_string(),
                key: key.clone(),
                default: false,
                artifact_repository: repository,
            });
        }
    }

    Ok(ArtifactRepositoryRefStatus {
        namespace: config.namespace.clone(),
        config_map: String::new(),
        key: String::new(),
        default: true,
        artifact_repository: config.artifact_repository.clone().unwrap_or_default(),
    })
}

fn parse_entry(
    name: &str,
    key: &str,
    raw: Option<&String>,
) -> Result<ArtifactRepository, ArtifactRepositoryError> {
    let raw = raw.ok_or_else(|| ArtifactRepositoryError::KeyNotFound {
        name: name.to_string(),
        key: key.to_string(),
    })?;
    serde_yaml_ng::from_str(raw).map_err(|e| ArtifactRepositoryError::Malformed {
        name: name.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Storage key prefix for a pod's artifacts under the resolved repository.
pub fn key_prefix(repository: &ArtifactRepository, workflow: &str, pod: &str) -> String {
    let format = repository
        .s3
        .as_ref()
        .and_then(|s3| s3.key_format.as_deref())
        .unwrap_or(DEFAULT_KEY_FORMAT);
    format
        .replace("{{workflow.name}}", workflow)
        .replace("{{pod.name}}", pod)
}

/// Plan output artifact locations for a pod.
///
/// Artifacts that declare their own bucket keep it; every other artifact
/// inherits the repository and records only its key, so bucket and endpoint
/// are never copied onto individual nodes.
pub fn plan_outputs(
    declared: &[Artifact],
    repository: &ArtifactRepository,
    workflow: &str,
    pod: &str,
) -> Vec<Artifact> {
    let prefix = key_prefix(repository, workflow, pod);
    declared
        .iter()
        .map(|artifact| {
            let mut planned = artifact.clone();
            let explicit = artifact.s3.as_ref().is_some_and(|s3| !s3.bucket.is_empty());
            if !explicit {
                planned.s3 = Some(S3Artifact {
                    bucket: String::new(),
                    endpoint: String::new(),
                    key: format!("{prefix}/{}.tgz", artifact.name),
                });
            }
            planned
        })
        .collect()
}
