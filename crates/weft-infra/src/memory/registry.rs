//! Registries backing the synchronous template and config-map lookups.
//!
//! Both are shared caches keyed by `(namespace, name)`. Reconciliation reads
//! them without awaiting; the binary and tests fill them ahead of time.

use std::path::Path;

use dashmap::DashMap;
use weft_core::repository::lookup::{ConfigMapLookup, TemplateLookup};
use weft_core::workflow::definition::{self, WorkflowError};
use weft_types::workflow::{ConfigMap, WorkflowTemplate};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: DashMap<Key, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template. Workflows that already copied it into
    /// their stored templates keep the old copy.
    pub fn insert(&self, template: WorkflowTemplate) {
        tracing::debug!(
            namespace = %template.metadata.namespace,
            name = %template.metadata.name,
            "workflow template registered"
        );
        self.templates.insert(
            key(&template.metadata.namespace, &template.metadata.name),
            template,
        );
    }

    pub fn insert_yaml(&self, yaml: &str) -> Result<(), WorkflowError> {
        self.insert(definition::parse_workflow_template(yaml)?);
        Ok(())
    }

    pub fn load_file(&self, path: &Path) -> Result<(), WorkflowError> {
        self.insert(definition::load_template_file(path)?);
        Ok(())
    }

    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        self.templates.remove(&key(namespace, name)).is_some()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateLookup for TemplateRegistry {
    fn get_template(&self, namespace: &str, name: &str) -> Option<WorkflowTemplate> {
        self.templates
            .get(&key(namespace, name))
            .map(|entry| entry.value().clone())
    }
}

#[derive(Debug, Default)]
pub struct ConfigMapRegistry {
    config_maps: DashMap<Key, ConfigMap>,
}

impl ConfigMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config_map: ConfigMap) {
        self.config_maps.insert(
            key(&config_map.namespace, &config_map.name),
            config_map,
        );
    }

    pub fn insert_yaml(&self, yaml: &str) -> Result<(), WorkflowError> {
        let config_map: ConfigMap =
            serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
        self.insert(config_map);
        Ok(())
    }

    /// Set one data entry, creating the config map if needed. Semaphore
    /// limits are re-read on every acquire, so this resizes a semaphore.
    pub fn set(&self, namespace: &str, name: &str, data_key: &str, value: impl Into<String>) {
        self.config_maps
            .entry(key(namespace, name))
            .or_insert_with(|| ConfigMap::new(namespace, name))
            .data
            .insert(data_key.to_string(), value.into());
    }
}

impl ConfigMapLookup for ConfigMapRegistry {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .get(&key(namespace, name))
            .map(|entry| entry.value().clone())
    }
}
