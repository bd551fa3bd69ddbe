//! Template lookup for step and task call sites.
//!
//! Inline templates come from the workflow spec. Templates of a workflow
//! template (`templateRef`) are copied into `status.storedTemplates` on first
//! use and always read back from there, so an execution is unaffected by
//! later edits to its source. A template called from inside a referenced
//! template resolves within that same source.

use std::collections::BTreeMap;

use weft_types::workflow::{Template, TemplateRef, WorkflowSpec};

use crate::repository::lookup::TemplateLookup;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("workflow template '{0}' not found")]
    SourceNotFound(String),

    #[error("template '{template}' not found in workflow template '{source_name}'")]
    NotInSource {
        source_name: String,
        template: String,
    },

    #[error("call site names neither a template nor a templateRef")]
    Unspecified,
}

/// A template located for a call site, with the source it came from.
#[derive(Debug, Clone)]
pub struct Located {
    pub template: Template,
    /// Workflow template the definition belongs to; `None` for inline.
    pub source: Option<String>,
}

pub fn stored_key(source: &str, template: &str) -> String {
    format!("namespaced/{source}/{template}")
}

/// Locate the template for a call site.
pub fn locate(
    namespace: &str,
    spec: &WorkflowSpec,
    stored: &mut BTreeMap<String, Template>,
    lookup: &dyn TemplateLookup,
    template: Option<&str>,
    template_ref: Option<&TemplateRef>,
    caller_source: Option<&str>,
) -> Result<Located, TemplateError> {
    if let Some(r) = template_ref {
        return from_source(namespace, stored, lookup, &r.name, &r.template);
    }
    let Some(name) = template else {
        return Err(TemplateError::Unspecified);
    };
    match caller_source {
        Some(source) => from_source(namespace, stored, lookup, source, name),
        None => spec
            .templates
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .map(|template| Located {
                template,
                source: None,
            })
            .ok_or_else(|| TemplateError::NotFound(name.to_string())),
    }
}

fn from_source(
    namespace: &str,
    stored: &mut BTreeMap<String, Template>,
    lookup: &dyn TemplateLookup,
    source: &str,
    name: &str,
) -> Result<Located, TemplateError> {
    let key = stored_key(source, name);
    if let Some(template) = stored.get(&key) {
        return Ok(Located {
            template: template.clone(),
            source: Some(source.to_string()),
        });
    }
    let wftmpl = lookup
        .get_template(namespace, source)
        .ok_or_else(|| TemplateError::SourceNotFound(source.to_string()))?;
    let template = wftmpl
        .template(name)
        .cloned()
        .ok_or_else(|| TemplateError::NotInSource {
            source_name: source.to_string(),
            template: name.to_string(),
        })?;
    tracing::debug!(template = %key, "storing referenced template");
    stored.insert(key, template.clone());
    Ok(Located {
        template,
        source: Some(source.to_string()),
    })
}
