//! Workflow object types.
//!
//! A [`Workflow`] is the root aggregate reconciled by the controller: an
//! immutable [`WorkflowSpec`] (templates, arguments, scheduling policy) and a
//! mutable [`WorkflowStatus`] that carries the node tree and every other piece
//! of cross-tick state. Field names serialize in camelCase so manifests read
//! the same way they are written by users.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::Nodes;

// ---------------------------------------------------------------------------
// Object metadata
// ---------------------------------------------------------------------------

fn default_namespace() -> String {
    "default".to_string()
}

/// Identity and bookkeeping shared by every stored object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned on submission when absent.
    #[serde(default = "Uuid::now_v7")]
    pub uid: Uuid,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by the store on every update.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uuid::now_v7(),
            creation_timestamp: Utc::now(),
            resource_version: 0,
            labels: BTreeMap::new(),
        }
    }
}

/// `namespace/name` key used by the store, the work queue, and lock holders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace: String,
    pub name: String,
}

impl WorkflowKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// The root aggregate: spec is immutable after submission, status is owned
/// by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Look up a template defined inline in the workflow.
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.spec.templates.iter().find(|t| t.name == name)
    }
}

/// A reusable library of templates referenced through `templateRef`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub metadata: ObjectMeta,
    pub spec: WorkflowTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplateSpec {
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub arguments: Arguments,
}

impl WorkflowTemplate {
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.spec.templates.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub entrypoint: String,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub arguments: Arguments,
    /// Maximum concurrently running pods across the whole workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,
    /// Workflow-level lock, acquired before the entry node is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Template invoked once the entry node is fulfilled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShutdownStrategy {
    /// Fail running nodes and skip the exit handler.
    Terminate,
    /// Fail running nodes but still run the exit handler.
    Stop,
}

impl fmt::Display for ShutdownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => write!(f, "Terminate"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// One template definition: a container, a sequence of step groups, or a DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Vec<WorkflowStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Maximum concurrently running pods below this template's node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    /// Wall-clock budget for the node, e.g. `"30s"`; may be an expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Container,
    Steps,
    Dag,
}

impl Template {
    /// Classify the template; `None` when it declares nothing runnable.
    pub fn kind(&self) -> Option<TemplateKind> {
        if self.dag.is_some() {
            Some(TemplateKind::Dag)
        } else if !self.steps.is_empty() {
            Some(TemplateKind::Steps)
        } else if self.container.is_some() {
            Some(TemplateKind::Container)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A call site shared by steps and DAG tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// JEXL condition evaluated after substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<Vec<serde_json::Value>>,
    /// Expression resolving to a JSON list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<ContinueOn>,
}

impl Invocation {
    pub fn continues_on_failed(&self) -> bool {
        self.continue_on.as_ref().is_some_and(|c| c.failed)
    }

    pub fn continues_on_error(&self) -> bool {
        self.continue_on.as_ref().is_some_and(|c| c.error)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub name: String,
    #[serde(flatten)]
    pub invocation: Invocation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DagTemplate {
    /// Space or comma separated task names; defaults to tasks with no dependents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    pub name: String,
    #[serde(flatten)]
    pub invocation: Invocation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Boolean expression over dependency outcomes, e.g. `A.Failed || B`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<String>,
}

/// Reference to a template of a [`WorkflowTemplate`] in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub name: String,
    pub template: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOn {
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: bool,
}

// ---------------------------------------------------------------------------
// Parameters and artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Arguments {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Inputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<String>,
}

impl Outputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.artifacts.is_empty()
            && self.result.is_none()
            && self.exit_code.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl Parameter {
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    /// File inside the unit whose contents become the parameter value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// `{{steps.X.outputs.artifacts.Y}}` style reference to another artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Artifact>,
}

/// Object-storage location of one artifact.
///
/// `bucket` and `endpoint` stay empty when the location is inherited from the
/// workflow's resolved artifact repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Artifact {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default)]
    pub key: String,
}

// ---------------------------------------------------------------------------
// Policy types
// ---------------------------------------------------------------------------

/// A value that may be written as a number or as an expression string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    String(String),
}

impl fmt::Display for IntOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Additional attempts after the first; unset means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetryPolicy {
    Always,
    #[default]
    OnFailure,
    OnError,
    OnTransientError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_success: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_failure: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Synchronization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex: Option<MutexRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semaphore: Option<SemaphoreRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MutexRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreRef {
    pub config_map_key_ref: ConfigMapKeySelector,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeySelector {
    pub name: String,
    pub key: String,
}

/// Explicit artifact repository selection in a workflow spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRef {
    /// Defaults to `artifact-repositories`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    /// Defaults to the config map's `workflows.weft.io/default-artifact-repository` annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Concrete artifact repository configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepository {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3ArtifactRepository>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3ArtifactRepository {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    /// Key template, e.g. `{{workflow.name}}/{{pod.name}}`.
    #[serde(default, alias = "key_format", skip_serializing_if = "Option::is_none")]
    pub key_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Cluster resources
// ---------------------------------------------------------------------------

/// Key/value configuration object: semaphore limits and artifact repositories.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            annotations: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Error => "Error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Nodes::is_empty")]
    pub nodes: Nodes,
    /// Copies of externally referenced templates, keyed `namespaced/<source>/<template>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stored_templates: BTreeMap<String, Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRefStatus>,
    #[serde(default, skip_serializing_if = "SynchronizationStatus::is_empty")]
    pub synchronization: SynchronizationStatus,
}

/// The artifact repository resolved for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRefStatus {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// True when no explicit or namespace-level repository applied.
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub artifact_repository: ArtifactRepository,
}

/// Lock bookkeeping persisted on the workflow so the lock table can be
/// rebuilt after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holding: Vec<LockEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting: Vec<LockEntry>,
}

impl SynchronizationStatus {
    pub fn is_empty(&self) -> bool {
        self.holding.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub lock: String,
    pub holder: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
metadata:
  name: continue-on-failed-dag
spec:
  entrypoint: main
  parallelism: 2
  templates:
    - name: main
      dag:
        failFast: false
        tasks:
          - name: A
            template: whalesay
          - name: B
            template: boom
            continueOn:
              failed: true
            dependencies: [A]
          - name: C
            templateRef:
              name: library
              template: print
            depends: "A && !B.Failed"
    - name: whalesay
      retryStrategy:
        limit: "{{inputs.parameters.limit}}"
        retryPolicy: OnError
      activeDeadlineSeconds: 5
      container:
        image: weft/say:v1
"#;

    #[test]
    fn deserialize_manifest_with_camel_case_fields() {
        let wf: Workflow = serde_yaml_ng::from_str(MANIFEST).unwrap();
        assert_eq!(wf.metadata.namespace, "default");
        assert_eq!(wf.spec.parallelism, Some(2));
        assert_eq!(wf.status.phase, WorkflowPhase::Pending);

        let main = wf.template("main").unwrap();
        assert_eq!(main.kind(), Some(TemplateKind::Dag));
        let dag = main.dag.as_ref().unwrap();
        assert_eq!(dag.fail_fast, Some(false));
        assert!(dag.tasks[1].invocation.continues_on_failed());
        assert_eq!(dag.tasks[1].dependencies, vec!["A"]);
        assert_eq!(
            dag.tasks[2].invocation.template_ref,
            Some(TemplateRef {
                name: "library".into(),
                template: "print".into()
            })
        );

        let say = wf.template("whalesay").unwrap();
        let retry = say.retry_strategy.as_ref().unwrap();
        assert_eq!(
            retry.limit,
            Some(IntOrString::String("{{inputs.parameters.limit}}".into()))
        );
        assert_eq!(retry.retry_policy, Some(RetryPolicy::OnError));
        assert_eq!(say.active_deadline_seconds, Some(IntOrString::Int(5)));
    }

    #[test]
    fn template_without_body_has_no_kind() {
        let t = Template {
            name: "empty".into(),
            ..Default::default()
        };
        assert_eq!(t.kind(), None);
    }

    #[test]
    fn inherited_artifact_location_omits_bucket() {
        let artifact = Artifact {
            name: "out".into(),
            s3: Some(S3Artifact {
                key: "wf/pod/out.tgz".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["s3"]["key"], "wf/pod/out.tgz");
        assert!(json["s3"].get("bucket").is_none());
    }

    #[test]
    fn workflow_key_display() {
        assert_eq!(WorkflowKey::new("weft", "hello").to_string(), "weft/hello");
    }
}
