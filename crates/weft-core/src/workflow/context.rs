//! Parameter scopes and `{{...}}` substitution.
//!
//! A [`Scope`] is an immutable-by-convention mapping from dotted keys
//! (`inputs.parameters.message`, `steps.gen.outputs.result`) to string
//! values, plus a parallel mapping of artifact references. Substitution is a
//! pure function of the text and the scope:
//!
//! - a reference found in the scope is replaced by its value
//! - an unresolved `inputs.*` reference is an error, since inputs are always
//!   bound before a template runs
//! - any other unresolved reference is preserved verbatim for a later stage
//!   (e.g. `{{item}}` or `{{tasks.A.outputs.result}}` inside a composite
//!   template that has not expanded its children yet)

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use weft_types::workflow::{Arguments, Artifact, Inputs, Template, Workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("failed to resolve {{{{{0}}}}}")]
    Unresolved(String),

    #[error("{0} was not supplied")]
    NotSupplied(String),

    #[error("unterminated reference in '{0}'")]
    Unterminated(String),

    #[error("template could not be re-encoded: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    params: BTreeMap<String, String>,
    artifacts: BTreeMap<String, Artifact>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global keys available to every template of `wf`.
    pub fn for_workflow(wf: &Workflow) -> Self {
        let mut scope = Self::new();
        scope.insert("workflow.name", wf.name());
        scope.insert("workflow.namespace", wf.namespace());
        scope.insert("workflow.uid", wf.metadata.uid.to_string());
        scope.insert(
            "workflow.creationTimestamp",
            wf.metadata.creation_timestamp.to_rfc3339(),
        );
        for param in &wf.spec.arguments.parameters {
            if let Some(value) = param.value.as_ref().or(param.default.as_ref()) {
                scope.insert(format!("workflow.parameters.{}", param.name), value.clone());
            }
        }
        scope
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn insert_artifact(&mut self, key: impl Into<String>, artifact: Artifact) {
        self.artifacts.insert(key.into(), artifact);
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    /// A copy of `self` overlaid with every entry of `other`.
    pub fn merged(&self, other: &Scope) -> Scope {
        let mut out = self.clone();
        out.params
            .extend(other.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.artifacts
            .extend(other.artifacts.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    /// Replace every resolvable `{{ key }}` in `text`.
    pub fn substitute(&self, text: &str) -> Result<String, ScopeError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(ScopeError::Unterminated(text.to_string()));
            };
            let key = after[..end].trim();
            match self.params.get(key) {
                Some(value) => out.push_str(value),
                None if self.artifacts.contains_key(key) => {
                    out.push_str(&rest[start..start + 2 + end + 2]);
                }
                None if key.starts_with("inputs.") => {
                    return Err(ScopeError::Unresolved(key.to_string()));
                }
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Strip `{{ }}` from a whole-string reference such as an artifact `from`.
pub fn reference_key(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Substitute every string inside `value`, leaving keys untouched.
pub fn resolve<T>(value: &T, scope: &Scope) -> Result<T, ScopeError>
where
    T: Serialize + DeserializeOwned,
{
    let json = serde_json::to_value(value).map_err(|e| ScopeError::Encoding(e.to_string()))?;
    let substituted = substitute_value(json, scope)?;
    serde_json::from_value(substituted).map_err(|e| ScopeError::Encoding(e.to_string()))
}

/// Resolve a template against a scope.
pub fn resolve_template(template: &Template, scope: &Scope) -> Result<Template, ScopeError> {
    resolve(template, scope)
}

fn substitute_value(value: Value, scope: &Scope) -> Result<Value, ScopeError> {
    Ok(match value {
        Value::String(s) => Value::String(scope.substitute(&s)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_value(v, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| substitute_value(v, scope).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}

/// Resolve a call site's arguments in the caller's scope.
///
/// Parameter values are substituted; artifact `from` references are replaced
/// by a copy of the referenced artifact's location.
pub fn resolve_arguments(args: &Arguments, scope: &Scope) -> Result<Arguments, ScopeError> {
    let mut out = Arguments::default();
    for param in &args.parameters {
        let mut param = param.clone();
        if let Some(value) = &param.value {
            param.value = Some(scope.substitute(value)?);
        }
        out.parameters.push(param);
    }
    for artifact in &args.artifacts {
        let mut resolved = artifact.clone();
        if let Some(from) = &artifact.from {
            let key = reference_key(from).unwrap_or(from.as_str());
            let source = scope
                .artifact(key)
                .ok_or_else(|| ScopeError::Unresolved(key.to_string()))?;
            resolved.s3 = source.s3.clone();
            resolved.from = None;
        }
        out.artifacts.push(resolved);
    }
    Ok(out)
}

/// Bind a template's declared inputs from call-site arguments.
///
/// Argument value beats the input's own value, which beats its default.
/// Returns the template-local scope (globals plus `inputs.*`) and the
/// concrete inputs to record on the node.
pub fn bind_inputs(
    template: &Template,
    args: &Arguments,
    globals: &Scope,
) -> Result<(Scope, Inputs), ScopeError> {
    let mut scope = globals.clone();
    let mut inputs = Inputs::default();

    for declared in &template.inputs.parameters {
        let supplied = args
            .parameter(&declared.name)
            .and_then(|p| p.value.clone())
            .or_else(|| declared.value.clone())
            .or_else(|| declared.default.clone())
            .ok_or_else(|| {
                ScopeError::NotSupplied(format!("inputs.parameters.{}", declared.name))
            })?;
        let value = globals.substitute(&supplied)?;
        scope.insert(format!("inputs.parameters.{}", declared.name), value.clone());
        let mut bound = declared.clone();
        bound.value = Some(value);
        bound.default = None;
        inputs.parameters.push(bound);
    }

    for declared in &template.inputs.artifacts {
        let mut bound = declared.clone();
        match args.artifact(&declared.name) {
            Some(arg) if arg.s3.is_some() => bound.s3 = arg.s3.clone(),
            _ if declared.s3.is_some() => {}
            _ if declared.optional => continue,
            _ => {
                return Err(ScopeError::NotSupplied(format!(
                    "inputs.artifacts.{}",
                    declared.name
                )));
            }
        }
        scope.insert_artifact(format!("inputs.artifacts.{}", declared.name), bound.clone());
        inputs.artifacts.push(bound);
    }

    Ok((scope, inputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::{Container, Parameter, S3Artifact};

    fn whalesay() -> Template {
        Template {
            name: "whalesay".into(),
            inputs: Inputs {
                parameters: vec![Parameter {
                    name: "message".into(),
                    default: Some("hello".into()),
                    ..Default::default()
                }],
                artifacts: vec![],
            },
            container: Some(Container {
                image: "weft/say:v1".into(),
                args: vec![
                    "say".into(),
                    "{{inputs.parameters.message}}".into(),
                    "{{workflow.name}}".into(),
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn substitute_replaces_known_and_keeps_unknown() {
        let mut scope = Scope::new();
        scope.insert("workflow.name", "wf");
        let out = scope.substitute("{{ workflow.name }}-{{item}}").unwrap();
        assert_eq!(out, "wf-{{item}}");
    }

    #[test]
    fn unresolved_inputs_reference_is_an_error() {
        let scope = Scope::new();
        let err = scope.substitute("{{inputs.parameters.x}}").unwrap_err();
        assert_eq!(err.to_string(), "failed to resolve {{inputs.parameters.x}}");
    }

    #[test]
    fn unterminated_reference_is_an_error() {
        let scope = Scope::new();
        assert!(matches!(
            scope.substitute("echo {{oops"),
            Err(ScopeError::Unterminated(_))
        ));
    }

    #[test]
    fn bind_prefers_arguments_over_defaults() {
        let mut globals = Scope::new();
        globals.insert("workflow.name", "wf");
        let args = Arguments {
            parameters: vec![Parameter::with_value("message", "hi")],
            artifacts: vec![],
        };
        let template = whalesay();
        let (scope, inputs) = bind_inputs(&template, &args, &globals).unwrap();
        assert_eq!(scope.get("inputs.parameters.message"), Some("hi"));
        assert_eq!(inputs.parameters[0].value.as_deref(), Some("hi"));

        let resolved = resolve_template(&template, &scope).unwrap();
        let container = resolved.container.unwrap();
        assert_eq!(container.args, vec!["say", "hi", "wf"]);
    }

    #[test]
    fn bind_falls_back_to_default_and_rejects_missing() {
        let template = whalesay();
        let (scope, _) = bind_inputs(&template, &Arguments::default(), &Scope::new()).unwrap();
        assert_eq!(scope.get("inputs.parameters.message"), Some("hello"));

        let mut required = whalesay();
        required.inputs.parameters[0].default = None;
        let err = bind_inputs(&required, &Arguments::default(), &Scope::new()).unwrap_err();
        assert_eq!(err.to_string(), "inputs.parameters.message was not supplied");
    }

    #[test]
    fn artifact_from_reference_copies_location() {
        let mut scope = Scope::new();
        scope.insert_artifact(
            "steps.generate.outputs.artifacts.out",
            Artifact {
                name: "out".into(),
                s3: Some(S3Artifact {
                    key: "wf/wf-1/out.tgz".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let args = Arguments {
            parameters: vec![],
            artifacts: vec![Artifact {
                name: "in".into(),
                from: Some("{{steps.generate.outputs.artifacts.out}}".into()),
                ..Default::default()
            }],
        };
        let resolved = resolve_arguments(&args, &scope).unwrap();
        let s3 = resolved.artifacts[0].s3.as_ref().unwrap();
        assert_eq!(s3.key, "wf/wf-1/out.tgz");
        assert!(s3.bucket.is_empty());
        assert!(resolved.artifacts[0].from.is_none());
    }

    #[test]
    fn artifact_references_survive_substitution() {
        let mut scope = Scope::new();
        scope.insert_artifact("inputs.artifacts.data", Artifact::default());
        let out = scope.substitute("{{inputs.artifacts.data}}").unwrap();
        assert_eq!(out, "{{inputs.artifacts.data}}");
    }
}
