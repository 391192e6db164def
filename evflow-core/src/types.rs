//! Wire and runtime data model: condition/FSM/pipeline descriptors, runtime
//! state, and the propagated-event payload. Descriptors are shared-immutable
//! (many readers, `Arc`-wrapped by callers); runtime state is exclusively
//! owned by the component that mutates it (see module docs on `fsm` and
//! `store`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Trigger ingress ───────────────────────────────────────────────────

/// A unified trigger event as produced by the injected event stream
/// (sensor, message-bus, webhook, human-approval, LLM-output-in-context, …).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub driver_id: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub payload: serde_json::Value,
    pub source: Option<String>,
}

impl TriggerEvent {
    /// Resolve a numeric value out of the payload by dot-path, falling back
    /// to `payload.value`, then the payload itself if it is a bare number.
    pub fn resolve_numeric(&self, field: Option<&str>) -> Option<f64> {
        if let Some(path) = field {
            if let Some(v) = crate::templates::dot_path(&self.payload, path) {
                if let Some(n) = v.as_f64() {
                    return Some(n);
                }
            }
        }
        if let Some(v) = self.payload.get("value").and_then(|v| v.as_f64()) {
            return Some(v);
        }
        self.payload.as_f64()
    }
}

// ─── Comparison operators ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "≥", alias = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "≤", alias = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "≠", alias = "!=")]
    Ne,
    Exists,
    Between,
}

impl ComparisonOp {
    /// Evaluate the operator against a resolved field value. `Exists`
    /// ignores `value`/`min`/`max` and is satisfied whenever `field` is
    /// `Some`. `Between` requires both `min` and `max`.
    pub fn matches(&self, field: Option<f64>, value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
        match self {
            ComparisonOp::Exists => field.is_some(),
            ComparisonOp::Between => match (field, min, max) {
                (Some(f), Some(lo), Some(hi)) => f >= lo && f <= hi,
                _ => false,
            },
            op => match (field, value) {
                (Some(f), Some(v)) => match op {
                    ComparisonOp::Gt => f > v,
                    ComparisonOp::Gte => f >= v,
                    ComparisonOp::Lt => f < v,
                    ComparisonOp::Lte => f <= v,
                    ComparisonOp::Eq => (f - v).abs() < f64::EPSILON,
                    ComparisonOp::Ne => (f - v).abs() >= f64::EPSILON,
                    _ => unreachable!(),
                },
                _ => false,
            },
        }
    }
}

// ─── Condition descriptor ──────────────────────────────────────────────

/// A numeric comparison condition shared by every sensor/bus-like kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NumericCondition {
    pub metric_name: String,
    pub topic: Option<String>,
    pub field: Option<String>,
    pub operator: ComparisonOp,
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A semantic (sandboxed-expression) condition over a prior step's output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticCondition {
    pub metric_name: String,
    pub instruction_id: String,
    pub semantic_expression: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HumanApprovalCondition {
    pub metric_name: String,
    pub approval_gate_id: String,
    pub expected_decision: ApprovalDecision,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeCondition {
    pub metric_name: String,
    pub composite_conditions: Vec<ConditionDescriptor>,
    pub composite_window_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum ConditionDescriptor {
    SensorThreshold(NumericCondition),
    MqttValue(NumericCondition),
    KafkaEvent(NumericCondition),
    FieldBusValue(NumericCondition),
    KpiValue(NumericCondition),
    LlmOutput(SemanticCondition),
    MlScore(SemanticCondition),
    CrmResult(SemanticCondition),
    ApiResponse(SemanticCondition),
    WindowTimerElapsed { metric_name: String },
    HumanApproval(HumanApprovalCondition),
    RemoteSignal { metric_name: String, signal_id: String },
    CompositeAllOf(CompositeCondition),
    CompositeAnyOf(CompositeCondition),
}

impl ConditionDescriptor {
    pub fn metric_name(&self) -> &str {
        match self {
            ConditionDescriptor::SensorThreshold(c)
            | ConditionDescriptor::MqttValue(c)
            | ConditionDescriptor::KafkaEvent(c)
            | ConditionDescriptor::FieldBusValue(c)
            | ConditionDescriptor::KpiValue(c) => &c.metric_name,
            ConditionDescriptor::LlmOutput(c)
            | ConditionDescriptor::MlScore(c)
            | ConditionDescriptor::CrmResult(c)
            | ConditionDescriptor::ApiResponse(c) => &c.metric_name,
            ConditionDescriptor::WindowTimerElapsed { metric_name } => metric_name,
            ConditionDescriptor::HumanApproval(c) => &c.metric_name,
            ConditionDescriptor::RemoteSignal { metric_name, .. } => metric_name,
            ConditionDescriptor::CompositeAllOf(c) | ConditionDescriptor::CompositeAnyOf(c) => &c.metric_name,
        }
    }

    /// Count of "leaf" conditions, used for partial-match satisfaction level.
    pub fn leaf_count(&self) -> usize {
        match self {
            ConditionDescriptor::CompositeAllOf(c) | ConditionDescriptor::CompositeAnyOf(c) => {
                c.composite_conditions.iter().map(ConditionDescriptor::leaf_count).sum::<usize>().max(1)
            }
            _ => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}

// ─── FSM descriptor ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    WithinWindow,
    WindowElapsed,
    Always,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub from_states: Vec<String>,
    pub to_state: String,
    pub condition: ConditionDescriptor,
    pub guard: Guard,
    #[serde(default)]
    pub on_entry: Vec<OnEntryAction>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    99
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PropagationConfig {
    #[serde(default)]
    pub include_matched_values: bool,
    #[serde(default)]
    pub include_local_actions_taken: bool,
    #[serde(default)]
    pub compute_trends: Vec<TrendSpec>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    Sha256,
    Sha512,
    HmacSha256,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrendSpec {
    pub metric_name: String,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventStateMachineDescriptor {
    pub machine_id: String,
    pub states: Vec<String>,
    pub initial_state: String,
    pub full_match_state: String,
    pub expired_state: String,
    pub window_ms: u64,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub local_actions_on_full_match: Vec<OnEntryAction>,
    #[serde(default)]
    pub propagation_config: PropagationConfig,
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub subscribed_driver_ids: Vec<String>,
}

// ─── On-entry actions ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub actuator_id: String,
    pub command: String,
    pub value: Option<serde_json::Value>,
    pub cancellable_window_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplingRateChange {
    pub sensor_id: String,
    pub rate_hz: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepCallSpec {
    pub instruction_id: String,
    /// Dot-paths (against `{event, matched_values, step_outputs}`) resolved
    /// into slot values before dispatch.
    pub slots: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmCallSpec {
    pub instruction_id: String,
    pub llm_context: CompiledLlmContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelFetchAction {
    pub sub_actions: Vec<OnEntryAction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalGateOnEntry {
    pub gate_id: String,
    pub timeout_ms: u64,
    pub context_source_paths: Vec<String>,
    #[serde(default)]
    pub fallback: ApprovalFallback,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalFallback {
    #[default]
    TimedOut,
    TreatAsRejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum OnEntryAction {
    Log { message: String },
    StartWindowTimer,
    CancelWindowTimer,
    ResetFsm,
    IncreaseSamplingRate(SamplingRateChange),
    ResetSamplingRate { sensor_id: String },
    ControlActuator(ActuatorCommand),
    PropagatePartial,
    PropagateEnriched,
    LlmCall(LlmCallSpec),
    MlScoreCall(StepCallSpec),
    CrmQuery(StepCallSpec),
    ParallelFetch(ParallelFetchAction),
    HumanApprovalGate(ApprovalGateOnEntry),
}

// ─── FSM runtime state ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedValue {
    pub value: serde_json::Value,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalActionTaken {
    pub actuator_id: String,
    pub command: String,
    pub value: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub cancellable_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingApprovalGate {
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub has_timeout_handle: bool,
}

/// Per-active-execution FSM state. `window_timer_handle` is intentionally
/// absent from this struct — it never survives serialization (see
/// `store::strip_non_persistent`); the runtime re-arms timers on reload via
/// the correlation window manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsmRuntimeState {
    pub machine_id: String,
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub node_id: Option<String>,
    pub current_state: String,
    pub window_started_at: Option<DateTime<Utc>>,
    pub window_expires_at: Option<DateTime<Utc>>,
    pub matched_values: BTreeMap<String, MatchedValue>,
    pub step_outputs: BTreeMap<String, serde_json::Value>,
    pub pending_approval_gates: BTreeMap<String, PendingApprovalGate>,
    pub local_actions_taken: Vec<LocalActionTaken>,
    pub active_sampling_rate_changes: Vec<SamplingRateChange>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl FsmRuntimeState {
    pub fn new(machine_id: &str, workflow_id: &str, node_id: Option<String>, initial_state: &str) -> Self {
        let now = Utc::now();
        Self {
            machine_id: machine_id.to_string(),
            instance_id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            node_id,
            current_state: initial_state.to_string(),
            window_started_at: None,
            window_expires_at: None,
            matched_values: BTreeMap::new(),
            step_outputs: BTreeMap::new(),
            pending_approval_gates: BTreeMap::new(),
            local_actions_taken: Vec::new(),
            active_sampling_rate_changes: Vec::new(),
            created_at: now,
            last_transition_at: now,
        }
    }
}

// ─── Propagated event ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeWindow {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub window_ms: u64,
    pub remaining_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrecursorSignal {
    pub metric_name: String,
    pub value: serde_json::Value,
    pub unit: Option<String>,
    pub direction: TrendDirection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropagatedEvent {
    pub event_id: Uuid,
    pub machine_id: String,
    pub source_node_id: Option<String>,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub satisfaction_level: f64,
    pub matched_values: BTreeMap<String, MatchedValue>,
    pub time_window: TimeWindow,
    pub local_actions_taken: Vec<LocalActionTaken>,
    pub precursor_signals: Vec<PrecursorSignal>,
    pub signature: Option<String>,
}

// ─── Pipeline steps ──────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepBase {
    pub id: String,
    pub description: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub retry_policy: Option<RetryPolicy>,
    pub requires_approval_gate_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmCallStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub llm_context: CompiledLlmContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopContextEnrichment {
    None,
    AppendPrevious,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    UseBestAttempt,
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub body: Vec<PipelineStep>,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub context_enrichment: LoopContextEnrichment,
    pub convergence_predicate: String,
    pub best_output_field: String,
    #[serde(default)]
    pub on_max_iterations: OnMaxIterations,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlScoreCallStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub connector_id: Option<String>,
    pub principal_id: Option<String>,
    pub slots: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrmQueryStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub connector_id: String,
    pub principal_id: String,
    pub slots: BTreeMap<String, String>,
    pub extract_output: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub condition: String,
    pub if_true: Vec<PipelineStep>,
    pub if_false: Vec<PipelineStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HumanApprovalGateStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub gate_id: String,
    pub timeout_ms: u64,
    pub context_source_paths: Vec<String>,
    #[serde(default)]
    pub notify_via: Vec<PipelineStep>,
    #[serde(default)]
    pub on_approved: Vec<PipelineStep>,
    #[serde(default)]
    pub on_rejected: Vec<PipelineStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendEmailStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub connector_id: String,
    pub principal_id: String,
    pub to_template: String,
    pub subject_template: String,
    pub body_template: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteCrmStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub connector_id: String,
    pub principal_id: String,
    pub slots: BTreeMap<String, String>,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub message_template: String,
    pub severity: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallHttpStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub url_template: String,
    pub method: String,
    pub body_template: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub message_template: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectorActionStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub connector_id: String,
    pub principal_id: String,
    pub action: String,
    pub slots: BTreeMap<String, String>,
    #[serde(default)]
    pub extract_output: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiLlmPipelineStep {
    #[serde(flatten)]
    pub base: StepBase,
    pub pipeline: crate::multi_llm::MultiLlmPipelineSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineStep {
    LlmCall(LlmCallStep),
    Loop(LoopStep),
    MlScoreCall(MlScoreCallStep),
    CrmQuery(CrmQueryStep),
    Branch(BranchStep),
    HumanApprovalGate(HumanApprovalGateStep),
    SendEmail(SendEmailStep),
    WriteCrm(WriteCrmStep),
    Alert(AlertStep),
    CallHttp(CallHttpStep),
    Log(LogStep),
    ConnectorAction(ConnectorActionStep),
    MultiLlmPipeline(MultiLlmPipelineStep),
}

impl PipelineStep {
    pub fn base(&self) -> &StepBase {
        match self {
            PipelineStep::LlmCall(s) => &s.base,
            PipelineStep::Loop(s) => &s.base,
            PipelineStep::MlScoreCall(s) => &s.base,
            PipelineStep::CrmQuery(s) => &s.base,
            PipelineStep::Branch(s) => &s.base,
            PipelineStep::HumanApprovalGate(s) => &s.base,
            PipelineStep::SendEmail(s) => &s.base,
            PipelineStep::WriteCrm(s) => &s.base,
            PipelineStep::Alert(s) => &s.base,
            PipelineStep::CallHttp(s) => &s.base,
            PipelineStep::Log(s) => &s.base,
            PipelineStep::ConnectorAction(s) => &s.base,
            PipelineStep::MultiLlmPipeline(s) => &s.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    /// `write_crm` steps flagged `mandatory` form the always-runs set (C8 §4.8 step 1).
    pub fn is_mandatory_write(&self) -> bool {
        matches!(self, PipelineStep::WriteCrm(s) if s.mandatory)
    }
}

// ─── Pipeline context ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    WaitingApproval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineResult {
    Pending,
    Success,
    Failed,
    Partial,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineContext {
    pub event: PropagatedEvent,
    pub pipeline: BTreeMap<String, StepResult>,
    pub result: PipelineResult,
}

impl PipelineContext {
    pub fn new(event: PropagatedEvent) -> Self {
        Self {
            event,
            pipeline: BTreeMap::new(),
            result: PipelineResult::Pending,
        }
    }

    /// JSON view used as the scope for sandboxed expressions and dot-path
    /// slot/template resolution: `{pipeline, event}`.
    pub fn as_scope(&self) -> serde_json::Value {
        serde_json::json!({
            "pipeline": self.pipeline,
            "event": self.event,
        })
    }
}

// ─── Compiled LLM context ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSourceType {
    Vault,
    Runtime,
    /// Used only inside multi-LLM sequential pipelines to reference the
    /// previous stage's validated output (spec.md §4.7).
    PreviousStageOutput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DynamicSlot {
    pub slot_id: String,
    pub source_type: SlotSourceType,
    pub source_key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaFieldType {
    String,
    Float,
    Boolean,
    Object,
    #[serde(rename = "object|null")]
    ObjectOrNull,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FewShot {
    pub user: String,
    pub assistant: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailureStrategy {
    FailSafe,
    Abort,
}

impl Default for ValidationFailureStrategy {
    fn default() -> Self {
        ValidationFailureStrategy::FailSafe
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryOnInvalidOutput {
    pub max_attempts: u32,
}

/// Frozen at compile time; every field except the resolved slot values is
/// immutable after compile (spec.md §3 invariant).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledLlmContext {
    pub system_prompt: String,
    #[serde(default)]
    pub few_shots: Vec<FewShot>,
    pub output_schema: BTreeMap<String, SchemaFieldType>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub dynamic_slots: Vec<DynamicSlot>,
    pub prompt_template: String,
    pub retry_on_invalid_output: Option<RetryOnInvalidOutput>,
    #[serde(default)]
    pub on_validation_failure: ValidationFailureStrategy,
    pub timeout_ms: Option<u64>,
}

// ─── Remote command egress ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub command_id: Uuid,
    pub command: String,
    pub params: serde_json::Value,
    pub source_event_id: Option<Uuid>,
    pub source_machine_id: Option<String>,
    pub deploy_fsm: Option<EventStateMachineDescriptor>,
}
