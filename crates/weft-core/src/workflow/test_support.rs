//! Reconcile harness: drives the pure reconciler tick by tick against a
//! hand-controlled unit snapshot and clock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use weft_types::config::ControllerConfig;
use weft_types::event::WorkflowEvent;
use weft_types::node::Node;
use weft_types::unit::{UnitPhase, UnitSnapshot, UnitStatus};
use weft_types::workflow::{ConfigMap, Workflow, WorkflowTemplate};

use super::definition;
use super::operator::{Reconciler, UnitAction};
use super::sync::SyncManager;
use crate::repository::lookup::{ConfigMapLookup, TemplateLookup};

#[derive(Debug, Clone, Default)]
pub(crate) struct StaticLookup {
    templates: HashMap<(String, String), WorkflowTemplate>,
    config_maps: HashMap<(String, String), ConfigMap>,
}

impl StaticLookup {
    pub fn with_template(mut self, yaml: &str) -> Self {
        let template = definition::parse_workflow_template(yaml).unwrap();
        let key = (
            template.metadata.namespace.clone(),
            template.metadata.name.clone(),
        );
        self.templates.insert(key, template);
        self
    }

    pub fn with_config_map(mut self, cm: ConfigMap) -> Self {
        self.config_maps
            .insert((cm.namespace.clone(), cm.name.clone()), cm);
        self
    }
}

impl TemplateLookup for StaticLookup {
    fn get_template(&self, namespace: &str, name: &str) -> Option<WorkflowTemplate> {
        self.templates
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

impl ConfigMapLookup for StaticLookup {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

pub(crate) fn succeeded() -> UnitStatus {
    UnitStatus {
        phase: UnitPhase::Succeeded,
        exit_code: Some(0),
        ..Default::default()
    }
}

pub(crate) fn failed() -> UnitStatus {
    UnitStatus {
        phase: UnitPhase::Failed,
        exit_code: Some(1),
        ..Default::default()
    }
}

pub(crate) fn printed(result: &str) -> UnitStatus {
    UnitStatus {
        result: Some(result.to_string()),
        ..succeeded()
    }
}

pub(crate) struct Harness {
    reconciler: Reconciler,
    pub workflow: Workflow,
    pub units: UnitSnapshot,
    pub now: DateTime<Utc>,
    pub events: Vec<WorkflowEvent>,
    pub released: Vec<String>,
}

impl Harness {
    pub fn new(yaml: &str) -> Self {
        Self::with_lookup(yaml, StaticLookup::default(), Arc::new(SyncManager::new()))
    }

    pub fn with_lookup(yaml: &str, lookup: StaticLookup, sync: Arc<SyncManager>) -> Self {
        let lookup = Arc::new(lookup);
        let reconciler = Reconciler::new(
            ControllerConfig::default(),
            sync,
            lookup.clone(),
            lookup,
        );
        Self {
            reconciler,
            workflow: definition::parse_workflow(yaml).unwrap(),
            units: UnitSnapshot::default(),
            now: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            events: Vec::new(),
            released: Vec::new(),
        }
    }

    /// One reconciliation. Created units start Running; terminated units
    /// end Failed.
    pub fn tick(&mut self) -> Vec<UnitAction> {
        let outcome = self
            .reconciler
            .reconcile(self.workflow.clone(), &self.units, self.now);
        self.workflow = outcome.workflow;
        self.events.extend(outcome.events);
        self.released.extend(outcome.released_locks);
        for action in &outcome.actions {
            match action {
                UnitAction::Create(request) => {
                    if self.units.get(&request.name).is_none() {
                        self.units
                            .insert(UnitStatus::new(&request.name, UnitPhase::Running));
                    }
                }
                UnitAction::Terminate { name } => {
                    if let Some(unit) = self.units.units.get_mut(name) {
                        unit.phase = UnitPhase::Failed;
                    }
                }
            }
        }
        outcome.actions
    }

    pub fn advance(&mut self, seconds: i64) {
        self.now += Duration::seconds(seconds);
    }

    /// Report a final status for every running unit `script` has an answer
    /// for, tick, and repeat until the workflow completes.
    pub fn run<F>(&mut self, script: F)
    where
        F: Fn(&Node) -> Option<UnitStatus>,
    {
        for _ in 0..100 {
            self.tick();
            if self.workflow.status.phase.is_terminal() {
                return;
            }
            self.finish_units(&script);
            self.advance(1);
        }
        panic!("workflow did not complete: {:#?}", self.workflow.status);
    }

    pub fn finish_units<F>(&mut self, script: &F)
    where
        F: Fn(&Node) -> Option<UnitStatus>,
    {
        let nodes = &self.workflow.status.nodes;
        for unit in self.units.units.values_mut() {
            if !matches!(unit.phase, UnitPhase::Pending | UnitPhase::Running) {
                continue;
            }
            let Some(node) = nodes.get(&unit.name) else {
                continue;
            };
            if let Some(mut status) = script(node) {
                status.name = unit.name.clone();
                *unit = status;
            }
        }
    }

    pub fn node(&self, display_name: &str) -> &Node {
        self.workflow
            .status
            .nodes
            .find_by_display_name(display_name)
            .unwrap_or_else(|| panic!("no node displayed as '{display_name}'"))
    }

    pub fn has_node(&self, display_name: &str) -> bool {
        self.workflow
            .status
            .nodes
            .find_by_display_name(display_name)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::event::EventReason;
    use weft_types::node::{NodePhase, NodeType};
    use weft_types::workflow::WorkflowPhase;

    use crate::workflow::artifacts::{DEFAULT_CONFIG_MAP, DEFAULT_KEY_ANNOTATION};
    use crate::workflow::deadline::{
        POD_DEADLINE_EXCEEDED, STEP_DEADLINE_EXCEEDED, WORKFLOW_DEADLINE_EXCEEDED,
    };
    use crate::workflow::operator::EMPTY_PARAMS;
    use crate::workflow::retry::NO_MORE_RETRIES;

    const HELLO: &str = r#"
metadata:
  name: hello
  namespace: weft
spec:
  entrypoint: main
  templates:
    - name: main
      container:
        image: weft/say:v1
"#;

    fn all_succeed(_: &Node) -> Option<UnitStatus> {
        Some(succeeded())
    }

    #[test]
    fn steps_continue_on_failed_child() {
        let mut h = Harness::new(
            r#"
metadata:
  name: continue-on-fail
spec:
  entrypoint: workflow-ignore
  parallelism: 2
  templates:
    - name: workflow-ignore
      steps:
        - - name: A
            template: whalesay
          - name: B
            template: boom
            continueOn:
              failed: true
        - - name: C
            template: whalesay
    - name: boom
      dag:
        tasks:
          - name: B-1
            template: whalesplosion
    - name: whalesay
      container:
        image: weft/say:v1
    - name: whalesplosion
      container:
        image: weft/say:v1
        command: [sh, -c, "exit 1"]
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "B-1" => Some(failed()),
            _ => Some(succeeded()),
        });

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.workflow.status.nodes.len(), 7);
        let b = h.node("B");
        assert_eq!(b.phase, NodePhase::Failed);
        assert_eq!(b.children.len(), 1);
        assert_eq!(b.outbound_nodes.len(), 1);
        assert_eq!(h.node("C").phase, NodePhase::Succeeded);
    }

    #[test]
    fn dag_continue_on_failed_dependency() {
        let mut h = Harness::new(
            r#"
metadata:
  name: continue-on-failed-dag
spec:
  entrypoint: workflow-ignore
  parallelism: 2
  templates:
    - name: workflow-ignore
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
            template: whalesay
            dependencies: [A]
          - name: D
            template: whalesay
            dependencies: [B, C]
    - name: boom
      dag:
        tasks:
          - name: B-1
            template: whalesplosion
    - name: whalesay
      container:
        image: weft/say:v1
    - name: whalesplosion
      container:
        image: weft/say:v1
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "B-1" => Some(failed()),
            _ => Some(succeeded()),
        });

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.workflow.status.nodes.len(), 6);
        let b = h.node("B");
        assert_eq!(b.phase, NodePhase::Failed);
        assert_eq!(b.children.len(), 1);
        assert_eq!(b.outbound_nodes.len(), 1);
        assert_eq!(h.node("D").phase, NodePhase::Succeeded);
    }

    #[test]
    fn dag_continue_on_failed_root_feeds_a_diamond() {
        let mut h = Harness::new(
            r#"
metadata:
  name: continue-on-failed-root
spec:
  entrypoint: main
  templates:
    - name: main
      dag:
        tasks:
          - name: A
            template: work
            continueOn:
              failed: true
          - name: B
            template: work
            dependencies: [A]
          - name: C
            template: work
            dependencies: [A]
          - name: D
            template: work
            dependencies: [B, C]
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "A" => Some(failed()),
            _ => Some(succeeded()),
        });

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.workflow.status.nodes.len(), 5);
        assert_eq!(h.node("A").phase, NodePhase::Failed);
        for task in ["B", "C", "D"] {
            assert_eq!(h.node(task).phase, NodePhase::Succeeded, "{task}");
        }
    }

    #[test]
    fn omitted_dependency_satisfies_succeeded_or_failed() {
        let mut h = Harness::new(
            r#"
metadata:
  name: omitted-chain
spec:
  entrypoint: main
  templates:
    - name: main
      dag:
        failFast: false
        tasks:
          - name: A
            template: work
          - name: B
            template: work
            depends: A
          - name: C
            template: work
            depends: B.Succeeded || B.Failed
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "A" => Some(failed()),
            _ => Some(succeeded()),
        });

        assert_eq!(h.node("B").phase, NodePhase::Omitted);
        let c = h.node("C");
        assert_eq!(c.node_type, NodeType::Pod);
        assert_eq!(c.phase, NodePhase::Succeeded);
    }

    #[test]
    fn depends_expression_selects_failure_and_omits_the_rest() {
        let mut h = Harness::new(
            r#"
metadata:
  name: depends
spec:
  entrypoint: main
  templates:
    - name: main
      dag:
        tasks:
          - name: A
            template: work
          - name: on-failure
            template: work
            depends: A.Failed
          - name: on-success
            template: work
            depends: A
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "A" => Some(failed()),
            _ => Some(succeeded()),
        });

        assert_eq!(h.node("on-failure").phase, NodePhase::Succeeded);
        let omitted = h.node("on-success");
        assert_eq!(omitted.phase, NodePhase::Omitted);
        assert_eq!(omitted.node_type, NodeType::Skipped);
        assert_eq!(omitted.message, "omitted: depends condition not met");
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
    }

    #[test]
    fn fail_fast_omits_unstarted_tasks_and_lets_running_ones_finish() {
        let mut h = Harness::new(
            r#"
metadata:
  name: fail-fast
spec:
  entrypoint: main
  templates:
    - name: main
      dag:
        tasks:
          - name: A
            template: work
          - name: B
            template: work
          - name: C
            template: work
            dependencies: [B]
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        h.tick();
        h.finish_units(&|node: &Node| (node.display_name == "A").then(failed));
        h.tick();

        let c = h.node("C");
        assert_eq!(c.phase, NodePhase::Omitted);
        assert_eq!(c.message, "omitted: a preceding task failed");
        assert_eq!(h.node("B").phase, NodePhase::Running);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Running);

        h.run(all_succeed);
        assert_eq!(h.node("B").phase, NodePhase::Succeeded);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
        assert_eq!(h.workflow.status.message, "failed with exit code 1");
    }

    #[test]
    fn parameterized_retry_limit_is_exhausted() {
        let mut h = Harness::new(
            r#"
metadata:
  name: param-limit
spec:
  entrypoint: whalesay
  arguments:
    parameters:
      - name: limit
        value: "1"
  templates:
    - name: whalesay
      inputs:
        parameters:
          - name: limit
      retryStrategy:
        limit: "{{inputs.parameters.limit}}"
      container:
        image: weft/say:v1
        args: [exit, "1"]
"#,
        );
        h.run(|_| Some(failed()));

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
        assert_eq!(h.workflow.status.nodes.len(), 3);
        let retry = h.node("param-limit");
        assert_eq!(retry.node_type, NodeType::Retry);
        assert!(retry.message.contains(NO_MORE_RETRIES));
        assert_eq!(retry.retry.unwrap().limit, Some(1));
        assert!(h.has_node("param-limit(0)"));
        assert!(h.has_node("param-limit(1)"));
        assert_eq!(retry.children.len(), 2);
    }

    #[test]
    fn parameterized_active_deadline_fails_the_pod() {
        let mut h = Harness::new(
            r#"
metadata:
  name: param-ads
spec:
  entrypoint: whalesay
  arguments:
    parameters:
      - name: ads
        value: "5"
  templates:
    - name: whalesay
      inputs:
        parameters:
          - name: ads
      activeDeadlineSeconds: "{{inputs.parameters.ads}}"
      container:
        image: weft/say:v1
        args: [sleep, 10s]
"#,
        );
        h.tick();
        h.tick();
        assert_eq!(h.node("param-ads").phase, NodePhase::Running);

        h.advance(6);
        let actions = h.tick();
        assert!(actions.contains(&UnitAction::Terminate {
            name: "param-ads".into()
        }));
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
        assert!(h.node("param-ads").message.contains(POD_DEADLINE_EXCEEDED));
    }

    #[test]
    fn template_timeout_fails_a_running_step() {
        let mut h = Harness::new(
            r#"
metadata:
  name: timeout
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: slow
            template: slow
    - name: slow
      timeout: 10s
      container:
        image: weft/say:v1
"#,
        );
        h.tick();
        h.advance(11);
        h.run(|_| None);
        assert_eq!(h.node("slow").message, STEP_DEADLINE_EXCEEDED);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
    }

    #[test]
    fn template_timeout_fails_only_its_own_step() {
        let mut h = Harness::new(
            r#"
metadata:
  name: sibling-timeouts
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: a
            template: five
          - name: b
            template: ten
          - name: c
            template: fifteen
    - name: five
      timeout: 5s
      container:
        image: weft/say:v1
    - name: ten
      timeout: 10s
      container:
        image: weft/say:v1
    - name: fifteen
      timeout: 15s
      container:
        image: weft/say:v1
"#,
        );
        h.tick();
        h.tick();

        h.advance(6);
        h.tick();
        assert_eq!(h.node("a").phase, NodePhase::Failed);
        assert_eq!(h.node("a").message, STEP_DEADLINE_EXCEEDED);
        assert_eq!(h.node("b").phase, NodePhase::Running);
        assert_eq!(h.node("c").phase, NodePhase::Running);

        h.advance(5);
        h.tick();
        assert_eq!(h.node("b").phase, NodePhase::Failed);
        assert_eq!(h.node("c").phase, NodePhase::Running);
        assert!(!h.workflow.status.phase.is_terminal());

        h.advance(5);
        h.run(|_| None);
        for step in ["a", "b", "c"] {
            assert_eq!(h.node(step).message, STEP_DEADLINE_EXCEEDED, "{step}");
        }
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
    }

    /// Mark every running unit as admission-blocked.
    fn hold_units(h: &mut Harness) {
        for unit in h.units.units.values_mut() {
            if unit.phase == UnitPhase::Running {
                unit.phase = UnitPhase::Pending;
                unit.message = Some("exceeded quota".to_string());
            }
        }
    }

    fn assert_blocked_pod_waits(yaml: &str, pod: &str, expected_nodes: usize) {
        let mut h = Harness::new(yaml);
        h.tick();
        for _ in 0..10 {
            hold_units(&mut h);
            h.tick();
            h.advance(60);
        }

        let node = h.node(pod);
        assert_eq!(node.phase, NodePhase::Pending);
        assert_eq!(node.message, "exceeded quota");
        assert_eq!(h.workflow.status.nodes.len(), expected_nodes);
        assert!(!h.workflow.status.phase.is_terminal());

        h.run(all_succeed);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.workflow.status.nodes.len(), expected_nodes);
    }

    #[test]
    fn admission_blocked_pod_stays_pending() {
        assert_blocked_pod_waits(HELLO, "hello", 1);
    }

    #[test]
    fn admission_blocked_pod_is_not_retried() {
        assert_blocked_pod_waits(
            r#"
metadata:
  name: pending-retry
spec:
  entrypoint: main
  templates:
    - name: main
      retryStrategy:
        limit: 3
      container:
        image: weft/say:v1
"#,
            "pending-retry(0)",
            2,
        );
    }

    #[test]
    fn workflow_deadline_fails_open_nodes() {
        let mut h = Harness::new(
            r#"
metadata:
  name: deadline
spec:
  entrypoint: main
  activeDeadlineSeconds: 5
  templates:
    - name: main
      container:
        image: weft/say:v1
"#,
        );
        h.tick();
        h.advance(6);
        h.run(|_| None);
        assert_eq!(h.node("deadline").message, STEP_DEADLINE_EXCEEDED);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
        assert_eq!(h.workflow.status.message, WORKFLOW_DEADLINE_EXCEEDED);
    }

    #[test]
    fn empty_loop_is_skipped() {
        let mut h = Harness::new(
            r#"
metadata:
  name: loops-empty-param
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: gen
            template: gen
        - - name: sleep
            template: sleep
            withParam: "{{steps.gen.outputs.result}}"
    - name: gen
      container:
        image: weft/say:v1
    - name: sleep
      container:
        image: weft/say:v1
"#,
        );
        h.run(|_| Some(printed("[]")));

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.workflow.status.nodes.len(), 5);
        let sleep = h.node("sleep");
        assert_eq!(sleep.phase, NodePhase::Skipped);
        assert_eq!(sleep.message, EMPTY_PARAMS);
    }

    #[test]
    fn loop_results_are_aggregated() {
        let mut h = Harness::new(
            r#"
metadata:
  name: param-aggregation
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: gen
            template: gen
        - - name: print
            template: print
            withParam: "{{steps.gen.outputs.result}}"
            arguments:
              parameters:
                - name: res
                  value: "{{item.res}}"
        - - name: sum
            template: sum
            arguments:
              parameters:
                - name: results
                  value: "{{steps.print.outputs.result}}"
    - name: gen
      container:
        image: weft/say:v1
    - name: print
      inputs:
        parameters:
          - name: res
      container:
        image: weft/say:v1
        args: ["{{inputs.parameters.res}}"]
    - name: sum
      inputs:
        parameters:
          - name: results
      container:
        image: weft/say:v1
"#,
        );
        h.run(|node| match node.display_name.as_str() {
            "gen" => Some(printed(r#"[{"res": 1}, {"res": 2}]"#)),
            "print(0:res:1)" => Some(printed("one")),
            "print(1:res:2)" => Some(printed("two")),
            _ => Some(succeeded()),
        });

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        let print = h.node("print(0:res:1)");
        let inputs = print.inputs.as_ref().unwrap();
        assert_eq!(inputs.parameters[0].value.as_deref(), Some("1"));

        let sum = h.node("sum").inputs.as_ref().unwrap();
        assert_eq!(sum.parameters[0].value.as_deref(), Some(r#"["one","two"]"#));
    }

    #[test]
    fn false_when_condition_skips_the_step() {
        let mut h = Harness::new(
            r#"
metadata:
  name: conditional
spec:
  entrypoint: main
  arguments:
    parameters:
      - name: run
        value: "false"
  templates:
    - name: main
      steps:
        - - name: maybe
            template: work
            when: "{{workflow.parameters.run}} == true"
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        h.run(all_succeed);

        let maybe = h.node("maybe");
        assert_eq!(maybe.phase, NodePhase::Skipped);
        assert_eq!(maybe.message, "when 'false == true' evaluated false");
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
    }

    #[test]
    fn workflow_parallelism_holds_back_extra_pods() {
        let mut h = Harness::new(
            r#"
metadata:
  name: parallel
spec:
  entrypoint: main
  parallelism: 2
  templates:
    - name: main
      dag:
        tasks:
          - name: a
            template: work
          - name: b
            template: work
          - name: c
            template: work
    - name: work
      container:
        image: weft/say:v1
"#,
        );
        let created = h.tick();
        assert_eq!(created.len(), 2);
        assert!(!h.has_node("c"));

        h.finish_units(&|node: &Node| (node.display_name == "a").then(succeeded));
        let created = h.tick();
        assert_eq!(created.len(), 1);
        assert!(h.has_node("c"));

        h.run(all_succeed);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
    }

    #[test]
    fn repeated_ticks_are_idempotent() {
        let mut h = Harness::new(HELLO);
        h.tick();
        h.tick();
        let settled = h.workflow.clone();
        let events = h.events.len();

        let actions = h.tick();
        assert!(actions.is_empty());
        assert_eq!(h.workflow, settled);
        assert_eq!(h.events.len(), events);
    }

    #[test]
    fn lifecycle_events_are_emitted_once() {
        let mut h = Harness::new(HELLO);
        h.run(all_succeed);
        let reasons: Vec<EventReason> = h.events.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![
                EventReason::WorkflowRunning,
                EventReason::WorkflowNodeSucceeded,
                EventReason::WorkflowSucceeded,
            ]
        );
        assert_eq!(h.events[1].message, "Succeeded node hello");
        assert_eq!(h.events[2].message, "Workflow completed");
    }

    #[test]
    fn failed_node_event_carries_the_message() {
        let mut h = Harness::new(HELLO);
        h.run(|_| Some(failed()));
        let failed_node = h
            .events
            .iter()
            .find(|e| e.reason == EventReason::WorkflowNodeFailed)
            .unwrap();
        assert_eq!(failed_node.message, "Failed node hello: failed with exit code 1");
        assert_eq!(h.events.last().unwrap().reason, EventReason::WorkflowFailed);
    }

    #[test]
    fn vanished_running_unit_errors_the_node() {
        let mut h = Harness::new(HELLO);
        h.tick();
        h.tick();
        h.units.units.clear();
        h.tick();
        assert_eq!(h.node("hello").phase, NodePhase::Error);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Error);
        let reasons: Vec<EventReason> = h.events.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![EventReason::WorkflowRunning, EventReason::WorkflowFailed]
        );
    }

    #[test]
    fn workflow_mutex_serializes_workflows() {
        let sync = Arc::new(SyncManager::new());
        let manifest = |name: &str| {
            format!(
                r#"
metadata:
  name: {name}
  namespace: weft
spec:
  entrypoint: main
  synchronization:
    mutex:
      name: test
  templates:
    - name: main
      container:
        image: weft/say:v1
"#
            )
        };
        let mut first = Harness::with_lookup(&manifest("one"), StaticLookup::default(), sync.clone());
        let mut second = Harness::with_lookup(&manifest("two"), StaticLookup::default(), sync.clone());

        first.tick();
        second.tick();
        assert_eq!(first.workflow.status.phase, WorkflowPhase::Running);
        assert_eq!(second.workflow.status.phase, WorkflowPhase::Pending);
        assert_eq!(
            second.workflow.status.message,
            "Waiting for weft/Mutex/test mutex to be released"
        );
        assert_eq!(second.workflow.status.synchronization.waiting.len(), 1);

        first.run(all_succeed);
        assert!(first.released.iter().any(|l| l == "weft/Mutex/test"));
        assert!(first.workflow.status.synchronization.is_empty());

        second.tick();
        assert_eq!(second.workflow.status.phase, WorkflowPhase::Running);
        assert_eq!(second.workflow.status.synchronization.holding.len(), 1);
    }

    #[test]
    fn template_mutex_queues_second_node() {
        let mut h = Harness::new(
            r#"
metadata:
  name: template-lock
  namespace: weft
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: a
            template: locked
          - name: b
            template: locked
    - name: locked
      synchronization:
        mutex:
          name: shared
      container:
        image: weft/say:v1
"#,
        );
        let created = h.tick();
        assert_eq!(created.len(), 1);
        let waiting = [h.node("a"), h.node("b")]
            .into_iter()
            .filter(|n| n.waiting_for_lock.is_some())
            .count();
        assert_eq!(waiting, 1);

        h.run(all_succeed);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert_eq!(h.node("a").phase, NodePhase::Succeeded);
        assert_eq!(h.node("b").phase, NodePhase::Succeeded);
    }

    #[test]
    fn artifact_locations_come_from_the_repository_ref() {
        let mut cm = ConfigMap::new("argo", DEFAULT_CONFIG_MAP);
        cm.annotations
            .insert(DEFAULT_KEY_ANNOTATION.into(), "default-v1".into());
        cm.data.insert(
            "my-key".into(),
            "s3:\n  bucket: my-bucket\n  endpoint: minio:9000\n".into(),
        );
        let mut h = Harness::with_lookup(
            r#"
metadata:
  name: artifact-repository-ref
  namespace: argo
spec:
  entrypoint: main
  artifactRepositoryRef:
    key: my-key
  templates:
    - name: main
      steps:
        - - name: generate
            template: generate
        - - name: consume
            template: consume
            arguments:
              artifacts:
                - name: in
                  from: "{{steps.generate.outputs.artifacts.out}}"
    - name: generate
      outputs:
        artifacts:
          - name: out
            path: /tmp/out
      container:
        image: weft/say:v1
    - name: consume
      inputs:
        artifacts:
          - name: in
            path: /tmp/in
      container:
        image: weft/say:v1
"#,
            StaticLookup::default().with_config_map(cm),
            Arc::new(SyncManager::new()),
        );
        h.run(all_succeed);

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        let resolved = h.workflow.status.artifact_repository_ref.as_ref().unwrap();
        assert_eq!(resolved.namespace, "argo");
        assert_eq!(resolved.config_map, DEFAULT_CONFIG_MAP);
        assert_eq!(resolved.key, "my-key");
        assert!(!resolved.default);

        let generated = h.node("generate").outputs.as_ref().unwrap().artifacts[0]
            .s3
            .clone()
            .unwrap();
        assert!(generated.bucket.is_empty());
        assert!(!generated.key.is_empty());
        let consumed = h.node("consume").inputs.as_ref().unwrap().artifacts[0]
            .s3
            .clone()
            .unwrap();
        assert!(consumed.bucket.is_empty());
        assert_eq!(consumed.key, generated.key);
    }

    #[test]
    fn template_ref_with_exit_handler() {
        let lookup = StaticLookup::default().with_template(
            r#"
metadata:
  name: workflow-template-whalesay-template
  namespace: weft
spec:
  templates:
    - name: whalesay-template
      inputs:
        parameters:
          - name: message
      container:
        image: weft/say:v1
        args: ["{{inputs.parameters.message}}"]
"#,
        );
        let mut h = Harness::with_lookup(
            r#"
metadata:
  name: workflow-template-ref-exithandler
  namespace: weft
spec:
  entrypoint: main
  onExit: exit-handler
  templates:
    - name: main
      steps:
        - - name: call
            templateRef:
              name: workflow-template-whalesay-template
              template: whalesay-template
            arguments:
              parameters:
                - name: message
                  value: hello
    - name: exit-handler
      container:
        image: weft/say:v1
"#,
            lookup,
            Arc::new(SyncManager::new()),
        );
        h.run(all_succeed);

        assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
        assert!(h.workflow.status.message.is_empty());
        assert!(h
            .workflow
            .status
            .stored_templates
            .contains_key("namespaced/workflow-template-whalesay-template/whalesay-template"));
        let exit = h.node("workflow-template-ref-exithandler.onExit");
        assert_eq!(exit.phase, NodePhase::Succeeded);
        assert_eq!(
            h.node("call").template_scope.as_deref(),
            Some("workflow-template-whalesay-template")
        );
    }

    #[test]
    fn missing_template_ref_errors_the_node() {
        let mut h = Harness::new(
            r#"
metadata:
  name: missing-ref
spec:
  entrypoint: main
  templates:
    - name: main
      steps:
        - - name: call
            templateRef:
              name: nowhere
              template: nothing
"#,
        );
        h.tick();
        assert_eq!(h.node("call").phase, NodePhase::Error);
        assert_eq!(h.workflow.status.phase, WorkflowPhase::Error);
    }

    #[test]
    fn stop_runs_the_exit_handler_and_terminate_does_not() {
        let manifest = r#"
metadata:
  name: shutdown
spec:
  entrypoint: main
  onExit: cleanup
  templates:
    - name: main
      container:
        image: weft/say:v1
    - name: cleanup
      container:
        image: weft/say:v1
"#;
        let mut stop = Harness::new(manifest);
        stop.tick();
        stop.workflow.spec.shutdown = Some(weft_types::workflow::ShutdownStrategy::Stop);
        let actions = stop.tick();
        assert!(actions.contains(&UnitAction::Terminate {
            name: "shutdown".into()
        }));
        stop.run(all_succeed);
        assert_eq!(stop.workflow.status.phase, WorkflowPhase::Failed);
        assert_eq!(stop.workflow.status.message, "Stopped with strategy 'Stop'");
        assert_eq!(stop.node("shutdown.onExit").phase, NodePhase::Succeeded);

        let mut terminate = Harness::new(manifest);
        terminate.tick();
        terminate.workflow.spec.shutdown =
            Some(weft_types::workflow::ShutdownStrategy::Terminate);
        terminate.tick();
        assert_eq!(terminate.workflow.status.phase, WorkflowPhase::Failed);
        assert_eq!(
            terminate.node("shutdown").message,
            "Stopped with strategy 'Terminate'"
        );
        assert!(!terminate.has_node("shutdown.onExit"));
    }
}
