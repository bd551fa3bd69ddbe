//! Workflow manifest parsing and structural validation.
//!
//! Converts YAML documents into `Workflow` / `WorkflowTemplate` values and
//! checks the constraints the reconciler relies on: the entrypoint exists,
//! every local template call resolves, DAG dependencies exist and are
//! acyclic. Templates reached through `templateRef` are checked lazily when
//! first used, since their source may not exist yet at submission time.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;
use weft_types::workflow::{DagTask, DagTemplate, Invocation, WorkflowSpec, Workflow, WorkflowTemplate};

use super::expression::DependsExpr;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a workflow manifest.
pub fn parse_workflow(yaml: &str) -> Result<Workflow, WorkflowError> {
    let wf: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate(&wf.spec)?;
    Ok(wf)
}

pub fn parse_workflow_template(yaml: &str) -> Result<WorkflowTemplate, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

pub fn load_workflow_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

pub fn load_template_file(path: &Path) -> Result<WorkflowTemplate, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_template(&content)
}

pub fn serialize_workflow(wf: &Workflow) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(wf).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a workflow spec.
///
/// Checks:
/// - the entrypoint is set and names a local template
/// - template names are unique
/// - every call site names a template or a templateRef, and local names resolve
/// - DAG task names are unique, dependencies exist, depends expressions parse,
///   targets exist, and the task graph is acyclic
/// - `onExit`, if set, names a local template
pub fn validate(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if spec.entrypoint.is_empty() {
        return Err(WorkflowError::ValidationError(
            "spec.entrypoint must not be empty".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for template in &spec.templates {
        if !names.insert(template.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate template name: '{}'",
                template.name
            )));
        }
    }

    if !names.contains(spec.entrypoint.as_str()) {
        return Err(WorkflowError::UnknownTemplate(format!(
            "entrypoint '{}' is not defined",
            spec.entrypoint
        )));
    }
    if let Some(on_exit) = &spec.on_exit {
        if !names.contains(on_exit.as_str()) {
            return Err(WorkflowError::UnknownTemplate(format!(
                "onExit template '{on_exit}' is not defined"
            )));
        }
    }

    for template in &spec.templates {
        for group in &template.steps {
            for step in group {
                check_call(&names, &template.name, &step.name, &step.invocation)?;
            }
        }
        if let Some(dag) = &template.dag {
            for task in &dag.tasks {
                check_call(&names, &template.name, &task.name, &task.invocation)?;
                if task.depends.is_some() && !task.dependencies.is_empty() {
                    tracing::warn!(
                        template = %template.name,
                        task = %task.name,
                        "task sets both depends and dependencies; using depends"
                    );
                }
            }
            task_waves(dag).map_err(|e| match e {
                WorkflowError::ValidationError(msg) => {
                    WorkflowError::ValidationError(format!("template '{}': {msg}", template.name))
                }
                other => other,
            })?;
        }
    }

    Ok(())
}

fn check_call(
    names: &HashSet<&str>,
    parent: &str,
    step: &str,
    invocation: &Invocation,
) -> Result<(), WorkflowError> {
    match (&invocation.template, &invocation.template_ref) {
        (_, Some(_)) => Ok(()),
        (Some(name), None) if names.contains(name.as_str()) => Ok(()),
        (Some(name), None) => Err(WorkflowError::UnknownTemplate(format!(
            "'{parent}.{step}' calls undefined template '{name}'"
        ))),
        (None, None) => Err(WorkflowError::ValidationError(format!(
            "'{parent}.{step}' names neither a template nor a templateRef"
        ))),
    }
}

// ---------------------------------------------------------------------------
// DAG ordering
// ---------------------------------------------------------------------------

/// Names of the tasks `task` depends on.
///
/// A `depends` expression is authoritative when present; otherwise the
/// legacy `dependencies` list is used.
pub fn task_dependencies(task: &DagTask) -> Result<Vec<String>, WorkflowError> {
    match &task.depends {
        Some(expr) => {
            let parsed = DependsExpr::parse(expr)
                .map_err(|e| WorkflowError::ValidationError(e.to_string()))?;
            Ok(parsed.tasks().into_iter().map(str::to_string).collect())
        }
        None => Ok(task.dependencies.clone()),
    }
}

/// Group DAG tasks into waves where every task depends only on earlier
/// waves. Tasks keep declaration order within a wave.
///
/// The algorithm:
/// 1. Build a `DiGraph` with task names as nodes and dependency edges.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Compute each task's depth (max dependency depth + 1).
/// 4. Group tasks by depth.
pub fn task_waves(dag: &DagTemplate) -> Result<Vec<Vec<&DagTask>>, WorkflowError> {
    if dag.tasks.is_empty() {
        return Ok(vec![]);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, task) in dag.tasks.iter().enumerate() {
        if index.insert(task.name.as_str(), i).is_some() {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate task name: '{}'",
                task.name
            )));
        }
    }

    let mut dependencies: Vec<Vec<String>> = Vec::with_capacity(dag.tasks.len());
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = dag
        .tasks
        .iter()
        .map(|t| graph.add_node(t.name.as_str()))
        .collect();

    for (to_idx, task) in dag.tasks.iter().enumerate() {
        let deps = task_dependencies(task)?;
        for dep in &deps {
            let from_idx = index.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.name, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
        dependencies.push(deps);
    }

    if let Some(target) = &dag.target {
        for name in split_targets(target) {
            if !index.contains_key(name) {
                return Err(WorkflowError::ValidationError(format!(
                    "target '{name}' is not a task"
                )));
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let name = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving task '{name}'"))
    })?;

    let mut depths = vec![0usize; dag.tasks.len()];
    for node_idx in sorted {
        let i = node_idx.index();
        depths[i] = dependencies[i]
            .iter()
            .filter_map(|dep| index.get(dep.as_str()))
            .map(|&d| depths[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&DagTask>> = vec![vec![]; max_depth + 1];
    for (i, task) in dag.tasks.iter().enumerate() {
        waves[depths[i]].push(task);
    }
    Ok(waves)
}

/// `dag.target` is a space- or comma-separated list of task names.
pub fn split_targets(target: &str) -> impl Iterator<Item = &str> {
    target
        .split(|c: char| c == ' ' || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
