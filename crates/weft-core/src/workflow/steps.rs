//! Steps templates: groups run in order, steps within a group in parallel.
//!
//! Each group gets a `StepGroup` node named `<steps>[i]`. A group completes
//! once every member is fulfilled; its outputs are then published as
//! `steps.<name>.*` for later groups. The first failure not covered by the
//! step's `continueOn` fails the group and with it the steps node.

use weft_types::node::{Node, NodePhase, NodeType};
use weft_types::workflow::WorkflowStep;

use super::context::Scope;
use super::nodes::node_id;
use super::operator::{Expansion, Instance, Operation, Site};

impl Operation<'_> {
    pub(super) fn execute_steps(&mut self, inst: &Instance) {
        self.register_parallelism(inst);
        let mut scope = inst.scope.clone();
        let mut last_group = None;

        for (i, group) in inst.template.steps.iter().enumerate() {
            let group_name = format!("{}[{i}]", inst.name);
            let group_id = node_id(&self.meta.name, &group_name);
            if !self.nodes.contains(&group_id) {
                let mut node = Node::new(&group_id, &group_name, format!("[{i}]"), NodeType::StepGroup);
                node.boundary_id = Some(inst.id.clone());
                node.phase = NodePhase::Running;
                self.nodes.insert(node, self.now);
            }
            self.nodes.add_child(&inst.id, &group_id);

            let Some((phase, message)) =
                self.execute_group(inst, &group_id, &group_name, group, &mut scope)
            else {
                return;
            };
            if phase.failed_or_error() {
                let outbound = self.group_outbound(&group_id);
                self.complete(inst, phase, message, outbound, &scope);
                return;
            }
            last_group = Some(group_id);
        }

        let outbound = last_group
            .map(|group| self.group_outbound(&group))
            .unwrap_or_default();
        self.complete(inst, NodePhase::Succeeded, String::new(), outbound, &scope);
    }

    /// Advance one group. Returns its phase and message once complete.
    fn execute_group(
        &mut self,
        inst: &Instance,
        group_id: &str,
        group_name: &str,
        group: &[WorkflowStep],
        scope: &mut Scope,
    ) -> Option<(NodePhase, String)> {
        let mut expansions: Vec<(&WorkflowStep, Expansion)> = Vec::with_capacity(group.len());
        for step in group {
            let name = format!("{group_name}.{}", step.name);
            let site = Site {
                name: &name,
                display: &step.name,
                invocation: &step.invocation,
                boundary: &inst.id,
                source: inst.source.as_deref(),
            };
            let expansion = self.expand(&site, scope);
            for member in expansion.ids() {
                self.nodes.add_child(group_id, member);
            }
            expansions.push((step, expansion));
        }

        if !expansions.iter().all(|(_, e)| e.is_fulfilled(&self.nodes)) {
            return None;
        }

        let failure = expansions
            .iter()
            .find_map(|(step, e)| self.unhandled_failure(e, &step.invocation));
        for (step, expansion) in &expansions {
            self.publish(&format!("steps.{}", step.name), expansion, scope);
        }
        let (phase, message) = failure.unwrap_or((NodePhase::Succeeded, String::new()));
        self.nodes
            .mark_phase(group_id, phase, message.clone(), self.now);
        Some((phase, message))
    }

    fn group_outbound(&self, group_id: &str) -> Vec<String> {
        self.nodes
            .get(group_id)
            .map(|group| {
                group
                    .children
                    .iter()
                    .flat_map(|child| self.nodes.outbound_of(child))
                    .collect()
            })
            .unwrap_or_default()
    }
}
