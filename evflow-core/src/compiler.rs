//! Compile-time validator (SPEC_FULL.md §4.0, grounded on the teacher's
//! `compiler::verifier::verify` pass over its IR graph).
//!
//! `deploy_fsm` and `PipelineExecutor::execute` both run their descriptor
//! through here first. A non-empty result is a semantic error (spec.md §7):
//! logged, fatal for that FSM/pipeline, never started.

use crate::types::{ConditionDescriptor, ComparisonOp, EventStateMachineDescriptor, Guard, PipelineStep};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::HashSet;

/// Composite conditions nest arbitrarily; this bounds stack depth against a
/// pathologically deep descriptor deserialized from untrusted input.
const MAX_COMPOSITE_DEPTH: usize = 32;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("fsm {machine_id}: initial_state `{state}` not in `states`")]
    UnknownInitialState { machine_id: String, state: String },
    #[error("fsm {machine_id}: full_match_state `{state}` not in `states`")]
    UnknownFullMatchState { machine_id: String, state: String },
    #[error("fsm {machine_id}: expired_state `{state}` not in `states`")]
    UnknownExpiredState { machine_id: String, state: String },
    #[error("fsm {machine_id}: transition[{index}] from_state `{state}` not in `states`")]
    UnknownFromState { machine_id: String, index: usize, state: String },
    #[error("fsm {machine_id}: transition[{index}] to_state `{state}` not in `states`")]
    UnknownToState { machine_id: String, index: usize, state: String },
    #[error("fsm {machine_id}: state `{state}` has {count} window_elapsed transitions to expired_state, expected exactly 1")]
    WindowElapsedCount { machine_id: String, state: String, count: usize },
    #[error("fsm {machine_id}: transition[{index}] composite condition is empty")]
    EmptyComposite { machine_id: String, index: usize },
    #[error("fsm {machine_id}: transition[{index}] composite nesting exceeds max depth {MAX_COMPOSITE_DEPTH}")]
    CompositeTooDeep { machine_id: String, index: usize },
    #[error("fsm {machine_id}: transition[{index}] composite condition graph is cyclic")]
    CompositeCyclic { machine_id: String, index: usize },
    #[error("fsm {machine_id}: transition[{index}] numeric condition needs `value` (or `min`+`max` for `between`)")]
    NumericConditionMissingValue { machine_id: String, index: usize },
    #[error("fsm {machine_id}: transition[{index}] semantic condition needs instruction_id and semantic_expression")]
    SemanticConditionIncomplete { machine_id: String, index: usize },
    #[error("pipeline: duplicate step id `{0}`")]
    DuplicateStepId(String),
    #[error("pipeline: step `{step_id}` requires_approval_gate_id `{gate_id}` does not reference a preceding gate step")]
    GateNotPreceding { step_id: String, gate_id: String },
}

/// Validate an `EventStateMachineDescriptor` against spec.md §3/§8 invariants.
pub fn verify_fsm(descriptor: &EventStateMachineDescriptor) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let states: HashSet<&str> = descriptor.states.iter().map(String::as_str).collect();
    let machine_id = &descriptor.machine_id;

    if !states.contains(descriptor.initial_state.as_str()) {
        errors.push(ValidationError::UnknownInitialState { machine_id: machine_id.clone(), state: descriptor.initial_state.clone() });
    }
    if !states.contains(descriptor.full_match_state.as_str()) {
        errors.push(ValidationError::UnknownFullMatchState { machine_id: machine_id.clone(), state: descriptor.full_match_state.clone() });
    }
    if !states.contains(descriptor.expired_state.as_str()) {
        errors.push(ValidationError::UnknownExpiredState { machine_id: machine_id.clone(), state: descriptor.expired_state.clone() });
    }

    let mut window_elapsed_counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();

    for (index, transition) in descriptor.transitions.iter().enumerate() {
        for from in &transition.from_states {
            if !states.contains(from.as_str()) {
                errors.push(ValidationError::UnknownFromState { machine_id: machine_id.clone(), index, state: from.clone() });
            }
        }
        if !states.contains(transition.to_state.as_str()) {
            errors.push(ValidationError::UnknownToState { machine_id: machine_id.clone(), index, state: transition.to_state.clone() });
        }

        if transition.guard == Guard::WindowElapsed && transition.to_state == descriptor.expired_state {
            for from in &transition.from_states {
                if from != &descriptor.initial_state {
                    *window_elapsed_counts.entry(from.as_str()).or_insert(0) += 1;
                }
            }
        }

        verify_condition(machine_id, index, &transition.condition, 0, &mut errors);
    }

    for state in &descriptor.states {
        if state == &descriptor.initial_state || state == &descriptor.expired_state {
            continue;
        }
        let count = window_elapsed_counts.get(state.as_str()).copied().unwrap_or(0);
        if count != 1 {
            errors.push(ValidationError::WindowElapsedCount { machine_id: machine_id.clone(), state: state.clone(), count });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn verify_condition(
    machine_id: &str,
    transition_index: usize,
    condition: &ConditionDescriptor,
    depth: usize,
    errors: &mut Vec<ValidationError>,
) {
    if depth > MAX_COMPOSITE_DEPTH {
        errors.push(ValidationError::CompositeTooDeep { machine_id: machine_id.to_string(), index: transition_index });
        return;
    }

    match condition {
        ConditionDescriptor::SensorThreshold(c)
        | ConditionDescriptor::MqttValue(c)
        | ConditionDescriptor::KafkaEvent(c)
        | ConditionDescriptor::FieldBusValue(c)
        | ConditionDescriptor::KpiValue(c) => {
            let ok = match c.operator {
                ComparisonOp::Exists => true,
                ComparisonOp::Between => c.min.is_some() && c.max.is_some(),
                _ => c.value.is_some(),
            };
            if !ok {
                errors.push(ValidationError::NumericConditionMissingValue { machine_id: machine_id.to_string(), index: transition_index });
            }
        }
        ConditionDescriptor::LlmOutput(c)
        | ConditionDescriptor::MlScore(c)
        | ConditionDescriptor::CrmResult(c)
        | ConditionDescriptor::ApiResponse(c) => {
            if c.instruction_id.is_empty() || c.semantic_expression.is_empty() {
                errors.push(ValidationError::SemanticConditionIncomplete { machine_id: machine_id.to_string(), index: transition_index });
            }
        }
        ConditionDescriptor::CompositeAllOf(c) | ConditionDescriptor::CompositeAnyOf(c) => {
            if c.composite_conditions.is_empty() {
                errors.push(ValidationError::EmptyComposite { machine_id: machine_id.to_string(), index: transition_index });
            }
            if composite_subtree_is_cyclic(c) {
                errors.push(ValidationError::CompositeCyclic { machine_id: machine_id.to_string(), index: transition_index });
            }
            for child in &c.composite_conditions {
                verify_condition(machine_id, transition_index, child, depth + 1, errors);
            }
        }
        ConditionDescriptor::WindowTimerElapsed { .. }
        | ConditionDescriptor::HumanApproval(_)
        | ConditionDescriptor::RemoteSignal { .. } => {}
    }
}

/// Build the composite's nesting as a directed graph (one node per
/// `CompositeCondition`, edges to nested composites) and run a three-color
/// DFS cycle check (`petgraph::algo::is_cyclic_directed`) over it, per
/// spec.md §9's Open Question on `detectCycleDFS`. Owned `Vec` nesting can
/// never produce a true cycle, but this is the same check the validator
/// would need the moment composites gain id-based references.
fn composite_subtree_is_cyclic(root: &crate::types::CompositeCondition) -> bool {
    let mut graph = DiGraph::<(), ()>::new();
    let root_node = graph.add_node(());
    add_composite_edges(&mut graph, root_node, root);
    is_cyclic_directed(&graph)
}

fn add_composite_edges(
    graph: &mut DiGraph<(), ()>,
    parent: petgraph::graph::NodeIndex,
    composite: &crate::types::CompositeCondition,
) {
    for child in &composite.composite_conditions {
        if let ConditionDescriptor::CompositeAllOf(nested) | ConditionDescriptor::CompositeAnyOf(nested) = child {
            let node = graph.add_node(());
            graph.add_edge(parent, node, ());
            add_composite_edges(graph, node, nested);
        }
    }
}

/// Validate a pipeline's step list: id uniqueness within the enclosing
/// pipeline, and `requires_approval_gate_id` referencing a preceding gate
/// step (spec.md §3 invariant). Recurses into `branch`/`loop` bodies, each of
/// which is its own enclosing pipeline for id-uniqueness purposes.
pub fn verify_pipeline(steps: &[PipelineStep]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    verify_pipeline_scope(steps, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn verify_pipeline_scope(steps: &[PipelineStep], errors: &mut Vec<ValidationError>) {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut gate_ids_seen: HashSet<&str> = HashSet::new();

    for step in steps {
        let id = step.id();
        if !seen_ids.insert(id) {
            errors.push(ValidationError::DuplicateStepId(id.to_string()));
        }

        if let Some(gate_id) = &step.base().requires_approval_gate_id {
            if !gate_ids_seen.contains(gate_id.as_str()) {
                errors.push(ValidationError::GateNotPreceding { step_id: id.to_string(), gate_id: gate_id.clone() });
            }
        }

        if let PipelineStep::HumanApprovalGate(g) = step {
            gate_ids_seen.insert(&g.gate_id);
        }

        match step {
            PipelineStep::Loop(l) => verify_pipeline_scope(&l.body, errors),
            PipelineStep::Branch(b) => {
                verify_pipeline_scope(&b.if_true, errors);
                verify_pipeline_scope(&b.if_false, errors);
            }
            PipelineStep::HumanApprovalGate(g) => {
                verify_pipeline_scope(&g.notify_via, errors);
                verify_pipeline_scope(&g.on_approved, errors);
                verify_pipeline_scope(&g.on_rejected, errors);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn numeric(metric: &str, op: ComparisonOp, value: Option<f64>) -> ConditionDescriptor {
        ConditionDescriptor::SensorThreshold(NumericCondition {
            metric_name: metric.to_string(),
            topic: None,
            field: Some("value".to_string()),
            operator: op,
            value,
            min: None,
            max: None,
        })
    }

    fn base_fsm() -> EventStateMachineDescriptor {
        EventStateMachineDescriptor {
            machine_id: "m1".to_string(),
            states: vec!["INIT".to_string(), "ARMED".to_string(), "FULL".to_string(), "EXPIRED".to_string()],
            initial_state: "INIT".to_string(),
            full_match_state: "FULL".to_string(),
            expired_state: "EXPIRED".to_string(),
            window_ms: 10_000,
            transitions: vec![
                Transition {
                    from_states: vec!["INIT".to_string()],
                    to_state: "ARMED".to_string(),
                    condition: numeric("t", ComparisonOp::Gt, Some(80.0)),
                    guard: Guard::Always,
                    on_entry: vec![],
                    priority: 99,
                },
                Transition {
                    from_states: vec!["ARMED".to_string()],
                    to_state: "FULL".to_string(),
                    condition: numeric("v", ComparisonOp::Gt, Some(5.0)),
                    guard: Guard::WithinWindow,
                    on_entry: vec![],
                    priority: 99,
                },
                Transition {
                    from_states: vec!["ARMED".to_string()],
                    to_state: "EXPIRED".to_string(),
                    condition: ConditionDescriptor::WindowTimerElapsed { metric_name: "timer".to_string() },
                    guard: Guard::WindowElapsed,
                    on_entry: vec![],
                    priority: 99,
                },
            ],
            local_actions_on_full_match: vec![],
            propagation_config: PropagationConfig::default(),
            target_node_id: None,
            subscribed_driver_ids: vec![],
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(verify_fsm(&base_fsm()).is_ok());
    }

    #[test]
    fn unknown_initial_state_is_rejected() {
        let mut fsm = base_fsm();
        fsm.initial_state = "GHOST".to_string();
        let errors = verify_fsm(&fsm).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownInitialState { .. })));
    }

    #[test]
    fn missing_window_elapsed_transition_is_rejected() {
        let mut fsm = base_fsm();
        fsm.transitions.pop();
        let errors = verify_fsm(&fsm).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::WindowElapsedCount { state, count: 0, .. } if state == "ARMED")));
    }

    #[test]
    fn empty_composite_is_rejected() {
        let mut fsm = base_fsm();
        fsm.transitions[0].condition = ConditionDescriptor::CompositeAllOf(CompositeCondition {
            metric_name: "c".to_string(),
            composite_conditions: vec![],
            composite_window_ms: None,
        });
        let errors = verify_fsm(&fsm).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::EmptyComposite { .. })));
    }

    #[test]
    fn numeric_condition_without_value_is_rejected() {
        let mut fsm = base_fsm();
        fsm.transitions[0].condition = numeric("t", ComparisonOp::Gt, None);
        let errors = verify_fsm(&fsm).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::NumericConditionMissingValue { .. })));
    }

    fn gate_step(id: &str, gate_id: &str) -> PipelineStep {
        PipelineStep::HumanApprovalGate(HumanApprovalGateStep {
            base: StepBase { id: id.to_string(), description: None, continue_on_failure: false, dry_run: false, retry_policy: None, requires_approval_gate_id: None },
            gate_id: gate_id.to_string(),
            timeout_ms: 5_000,
            context_source_paths: vec![],
            notify_via: vec![],
            on_approved: vec![],
            on_rejected: vec![],
        })
    }

    fn email_step(id: &str, requires_gate: Option<&str>) -> PipelineStep {
        PipelineStep::SendEmail(SendEmailStep {
            base: StepBase {
                id: id.to_string(),
                description: None,
                continue_on_failure: false,
                dry_run: false,
                retry_policy: None,
                requires_approval_gate_id: requires_gate.map(str::to_string),
            },
            connector_id: "mail".to_string(),
            principal_id: "p1".to_string(),
            to_template: "{{ event.workflow_id }}".to_string(),
            subject_template: "s".to_string(),
            body_template: "b".to_string(),
        })
    }

    #[test]
    fn gate_preceding_is_valid() {
        let steps = vec![gate_step("G", "G"), email_step("E", Some("G"))];
        assert!(verify_pipeline(&steps).is_ok());
    }

    #[test]
    fn gate_not_preceding_is_rejected() {
        let steps = vec![email_step("E", Some("G"))];
        let errors = verify_pipeline(&steps).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::GateNotPreceding { .. })));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let steps = vec![email_step("A", None), email_step("A", None)];
        let errors = verify_pipeline(&steps).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateStepId(id) if id == "A")));
    }
}
