//! DAG templates: tasks started as soon as their dependencies allow.
//!
//! Tasks are visited in dependency order every pass. A task starts once all
//! tasks it names are fulfilled and its depends expression holds; if the
//! expression is false it is Omitted. With `failFast` (the default) an
//! unanticipated failure omits every task that has not started yet, while
//! tasks already running are left to finish.

use std::collections::{BTreeSet, HashMap};

use weft_types::node::{Node, NodePhase, NodeType};
use weft_types::workflow::{DagTask, DagTemplate};

use super::context::Scope;
use super::definition;
use super::expression::{DependsExpr, TaskOutcome};
use super::nodes::node_id;
use super::operator::{Expansion, Instance, Operation, Site};

const OMITTED_DEPENDS: &str = "omitted: depends condition not met";
const OMITTED_FAIL_FAST: &str = "omitted: a preceding task failed";

/// Dependency view of one DAG template.
struct TaskGraph<'t> {
    /// Tasks to run, dependencies first. Limited to the targets' closure.
    order: Vec<&'t DagTask>,
    targets: Vec<&'t DagTask>,
    depends: HashMap<&'t str, Option<DependsExpr>>,
}

impl<'t> TaskGraph<'t> {
    fn build(dag: &'t DagTemplate) -> Result<Self, String> {
        let waves = definition::task_waves(dag).map_err(|e| e.to_string())?;
        let mut depends = HashMap::new();
        for task in &dag.tasks {
            let expr = match &task.depends {
                Some(text) => Some(DependsExpr::parse(text).map_err(|e| e.to_string())?),
                None => DependsExpr::from_dependencies(&task.dependencies, |dep| {
                    dag.tasks
                        .iter()
                        .find(|t| t.name == dep)
                        .and_then(|t| t.invocation.continue_on)
                        .unwrap_or_default()
                }),
            };
            depends.insert(task.name.as_str(), expr);
        }

        let find = |name: &str| dag.tasks.iter().find(|t| t.name == name);
        let targets: Vec<&DagTask> = match &dag.target {
            Some(target) => definition::split_targets(target).filter_map(find).collect(),
            None => dag
                .tasks
                .iter()
                .filter(|t| {
                    !depends
                        .values()
                        .flatten()
                        .any(|e: &DependsExpr| e.tasks().contains(t.name.as_str()))
                })
                .collect(),
        };

        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        while let Some(name) = stack.pop() {
            if !wanted.insert(name) {
                continue;
            }
            if let Some(Some(expr)) = depends.get(name) {
                stack.extend(expr.tasks());
            }
        }

        let order = waves
            .into_iter()
            .flatten()
            .filter(|t| wanted.contains(t.name.as_str()))
            .collect();
        Ok(Self {
            order,
            targets,
            depends,
        })
    }

    fn expression(&self, task: &str) -> Option<&DependsExpr> {
        self.depends.get(task).and_then(Option::as_ref)
    }

    fn dependencies(&self, task: &str) -> Vec<&str> {
        self.expression(task)
            .map(|e| e.tasks().into_iter().collect())
            .unwrap_or_default()
    }

    fn task(&self, name: &str) -> Option<&'t DagTask> {
        self.order.iter().copied().find(|t| t.name == name)
    }

    /// True when a failure of `task` in `phase` was anticipated, either by
    /// its own `continueOn` or by a dependent's expression.
    fn handled(&self, task: &DagTask, phase: NodePhase) -> bool {
        let own = match phase {
            NodePhase::Failed => task.invocation.continues_on_failed(),
            NodePhase::Error => task.invocation.continues_on_error(),
            _ => return true,
        };
        own || self
            .depends
            .values()
            .flatten()
            .any(|e| e.handles(&task.name, phase))
    }
}

impl Operation<'_> {
    pub(super) fn execute_dag(&mut self, inst: &Instance) {
        self.register_parallelism(inst);
        let Some(dag) = &inst.template.dag else {
            return;
        };
        let graph = match TaskGraph::build(dag) {
            Ok(graph) => graph,
            Err(message) => {
                self.complete(inst, NodePhase::Error, message, Vec::new(), &inst.scope);
                return;
            }
        };
        let fail_fast = dag.fail_fast.unwrap_or(true);
        let mut scope = inst.scope.clone();
        let mut failing = graph.order.iter().any(|task| {
            self.nodes
                .phase(&self.task_id(inst, &task.name))
                .is_some_and(|p| p.failed_or_error() && !graph.handled(task, p))
        });

        for task in &graph.order {
            let name = format!("{}.{}", inst.name, task.name);
            let id = node_id(&self.meta.name, &name);
            let site = Site {
                name: &name,
                display: &task.name,
                invocation: &task.invocation,
                boundary: &inst.id,
                source: inst.source.as_deref(),
            };

            if !self.nodes.contains(&id) {
                let ready = graph
                    .dependencies(&task.name)
                    .iter()
                    .all(|dep| self.nodes.is_fulfilled(&self.task_id(inst, dep)));
                if fail_fast && failing {
                    self.marker(&site, NodeType::Skipped, NodePhase::Omitted, OMITTED_FAIL_FAST.into());
                } else if !ready {
                    continue;
                } else if !graph
                    .expression(&task.name)
                    .is_none_or(|e| e.evaluate(&|dep: &str| self.task_outcome(inst, dep)))
                {
                    self.marker(&site, NodeType::Skipped, NodePhase::Omitted, OMITTED_DEPENDS.into());
                } else {
                    self.run_task(&site, &scope);
                }
            } else if !self.nodes.is_fulfilled(&id) {
                self.run_task(&site, &scope);
            }

            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let (fulfilled, phase) = (node.fulfilled(), node.phase);
            self.nodes.add_child(&inst.id, &id);
            if !fulfilled {
                continue;
            }
            let expansion = self.task_expansion(&id);
            self.publish(&format!("tasks.{}", task.name), &expansion, &mut scope);
            if phase.failed_or_error() && !graph.handled(task, phase) {
                tracing::debug!(node = %name, "unhandled task failure");
                failing = true;
            }
        }

        let all_done = graph
            .order
            .iter()
            .all(|t| self.nodes.is_fulfilled(&self.task_id(inst, &t.name)));
        if !all_done {
            return;
        }

        let outbound: Vec<String> = graph
            .targets
            .iter()
            .flat_map(|t| self.nodes.outbound_of(&self.task_id(inst, &t.name)))
            .collect();
        let failure = graph
            .targets
            .iter()
            .find_map(|t| self.branch_failure(inst, &graph, t))
            .or_else(|| {
                if !(fail_fast && failing) {
                    return None;
                }
                graph.order.iter().find_map(|t| {
                    let id = self.task_id(inst, &t.name);
                    let phase = self.nodes.phase(&id)?;
                    (phase.failed_or_error() && !graph.handled(t, phase))
                        .then(|| (phase, self.root_cause(&id)))
                })
            });
        let (phase, message) = failure.unwrap_or((NodePhase::Succeeded, String::new()));
        self.complete(inst, phase, message, outbound, &scope);
    }

    fn task_id(&self, inst: &Instance, task: &str) -> String {
        node_id(&self.meta.name, &format!("{}.{task}", inst.name))
    }

    fn task_outcome(&self, inst: &Instance, task: &str) -> TaskOutcome {
        let Some(node) = self.nodes.get(&self.task_id(inst, task)) else {
            return TaskOutcome::default();
        };
        let children = if node.node_type == NodeType::TaskGroup {
            node.children
                .iter()
                .filter_map(|c| self.nodes.phase(c))
                .collect()
        } else {
            Vec::new()
        };
        TaskOutcome {
            phase: Some(node.phase),
            children,
        }
    }

    fn task_expansion(&self, id: &str) -> Expansion {
        match self.nodes.get(id) {
            Some(node) if node.node_type == NodeType::TaskGroup => Expansion {
                members: node.children.iter().cloned().map(Some).collect(),
                looped: true,
            },
            _ => Expansion {
                members: vec![Some(id.to_string())],
                looped: false,
            },
        }
    }

    fn run_task(&mut self, site: &Site<'_>, scope: &Scope) {
        let expansion = self.expand(site, scope);
        if !expansion.looped {
            return;
        }

        let id = node_id(&self.meta.name, site.name);
        if !self.nodes.contains(&id) {
            let mut node = Node::new(&id, site.name, site.display, NodeType::TaskGroup);
            node.template_name = site.invocation.template.clone();
            node.boundary_id = Some(site.boundary.to_string());
            node.phase = NodePhase::Running;
            self.nodes.insert(node, self.now);
        }
        for member in expansion.ids() {
            self.nodes.add_child(&id, member);
        }
        if !expansion.is_fulfilled(&self.nodes) {
            return;
        }
        let outbound = expansion
            .ids()
            .flat_map(|member| self.nodes.outbound_of(member))
            .collect();
        self.nodes.set_outbound(&id, outbound);
        let (phase, message) = self
            .unhandled_failure(&expansion, site.invocation)
            .unwrap_or((NodePhase::Succeeded, String::new()));
        self.nodes.mark_phase(&id, phase, message, self.now);
    }

    /// Failure that reaches the DAG through `task`. An omitted task carries
    /// the failure of whichever dependency caused the omission.
    fn branch_failure(
        &self,
        inst: &Instance,
        graph: &TaskGraph<'_>,
        task: &DagTask,
    ) -> Option<(NodePhase, String)> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![task];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.name.as_str()) {
                continue;
            }
            let id = self.task_id(inst, &current.name);
            match self.nodes.phase(&id)? {
                phase if phase.failed_or_error() => {
                    if !graph.handled(current, phase) {
                        return Some((phase, self.root_cause(&id)));
                    }
                }
                NodePhase::Omitted => {
                    let deps = graph.dependencies(&current.name);
                    stack.extend(deps.into_iter().rev().filter_map(|d| graph.task(d)));
                }
                _ => {}
            }
        }
        None
    }
}
