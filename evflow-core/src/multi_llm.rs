//! Multi-LLM Pipeline Runner (C7, spec.md §4.7).
//!
//! Chains or fans out several LLM calls. In `sequential` mode each stage's
//! dynamic slots may reference the previous stage's validated output via
//! `SlotSourceType::PreviousStageOutput`; in `parallel` mode every stage
//! runs independently and outputs are merged by stage id.

use crate::llm;
use crate::templates::dot_path;
use crate::types::{CompiledLlmContext, DynamicSlot, LlmCallSpec, SlotSourceType, ValidationFailureStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiLlmMode {
    Sequential,
    Parallel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiLlmStage {
    pub stage_id: String,
    pub llm_context: CompiledLlmContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiLlmPipelineSpec {
    pub mode: MultiLlmMode,
    pub stages: Vec<MultiLlmStage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiLlmResult {
    pub per_stage: Vec<StageResult>,
    pub final_output: Value,
}

pub(crate) fn resolve_dynamic_slots(slots: &[DynamicSlot], scope: &Value, previous_output: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for slot in slots {
        let resolved = match slot.source_type {
            SlotSourceType::PreviousStageOutput => {
                if slot.source_key.is_empty() || slot.source_key == "." {
                    previous_output.clone()
                } else {
                    dot_path(previous_output, &slot.source_key).cloned().unwrap_or(Value::Null)
                }
            }
            SlotSourceType::Runtime | SlotSourceType::Vault => {
                dot_path(scope, &slot.source_key).cloned().unwrap_or(Value::Null)
            }
        };
        out.insert(slot.slot_id.clone(), resolved);
    }
    out
}

pub async fn run(spec: &MultiLlmPipelineSpec, scope: &Value, workflow_id: &str) -> MultiLlmResult {
    match spec.mode {
        MultiLlmMode::Sequential => run_sequential(spec, scope, workflow_id).await,
        MultiLlmMode::Parallel => run_parallel(spec, scope, workflow_id).await,
    }
}

async fn run_sequential(spec: &MultiLlmPipelineSpec, scope: &Value, workflow_id: &str) -> MultiLlmResult {
    let mut per_stage = Vec::with_capacity(spec.stages.len());
    let mut previous_output = Value::Null;

    for stage in &spec.stages {
        let resolved = resolve_dynamic_slots(&stage.llm_context.dynamic_slots, scope, &previous_output);
        let call_spec = LlmCallSpec { instruction_id: stage.stage_id.clone(), llm_context: stage.llm_context.clone() };
        let result = llm::call(&call_spec, &resolved, workflow_id).await;

        match result.parsed {
            Some(output) => {
                previous_output = output.clone();
                per_stage.push(StageResult { stage_id: stage.stage_id.clone(), output: Some(output), error: None });
            }
            None => {
                per_stage.push(StageResult { stage_id: stage.stage_id.clone(), output: None, error: result.error });
                match stage.llm_context.on_validation_failure {
                    ValidationFailureStrategy::FailSafe => previous_output = Value::Null,
                    ValidationFailureStrategy::Abort => break,
                }
            }
        }
    }

    MultiLlmResult { per_stage, final_output: previous_output }
}

async fn run_parallel(spec: &MultiLlmPipelineSpec, scope: &Value, workflow_id: &str) -> MultiLlmResult {
    let calls = spec.stages.iter().map(|stage| async move {
        let resolved = resolve_dynamic_slots(&stage.llm_context.dynamic_slots, scope, &Value::Null);
        let call_spec = LlmCallSpec { instruction_id: stage.stage_id.clone(), llm_context: stage.llm_context.clone() };
        let result = llm::call(&call_spec, &resolved, workflow_id).await;
        (stage.stage_id.clone(), result)
    });

    let results = futures::future::join_all(calls).await;
    let mut per_stage = Vec::with_capacity(results.len());
    let mut merged = Map::new();

    for (stage_id, result) in results {
        match result.parsed {
            Some(output) => {
                merged.insert(stage_id.clone(), output.clone());
                per_stage.push(StageResult { stage_id, output: Some(output), error: None });
            }
            None => {
                per_stage.push(StageResult { stage_id, output: None, error: result.error });
            }
        }
    }

    MultiLlmResult { per_stage, final_output: Value::Object(merged) }
}
