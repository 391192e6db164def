//! LLM Caller (C6, spec.md §4.6).
//!
//! Builds provider-appropriate chat requests from a `CompiledLlmContext`,
//! extracts and validates structured output against the declared schema,
//! and retries invalid output with linear backoff. HTTP clients are pooled
//! per provider base URL (same pattern as `connector::client_for`, grounded
//! on `CloudLLM-ai-cloudllm`'s `http_pool`/`http_client_pool` modules).

use crate::error::LlmError;
use crate::types::{CompiledLlmContext, FewShot, SchemaFieldType};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const BACKOFF_BASE_MS: u64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
    Azure,
}

impl Provider {
    fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
            Provider::Anthropic => "https://api.anthropic.com/v1/messages",
            Provider::Ollama => "http://localhost:11434/api/chat",
            Provider::Azure => "https://management.azure.com/openai/chat/completions",
        }
    }
}

/// Detects the provider from the model name (spec.md §4.6). Defaults to
/// `ollama` for unrecognised local-looking names rather than erroring,
/// since self-hosted deployments name models arbitrarily; genuinely unknown
/// names still surface `LlmError::UnknownProvider` to the caller.
pub fn detect_provider(model: &str) -> Result<Provider, LlmError> {
    let lower = model.to_lowercase();
    if lower.starts_with("gpt-") || lower.starts_with("o1") || lower.starts_with("o3") {
        Ok(Provider::OpenAi)
    } else if lower.starts_with("claude") {
        Ok(Provider::Anthropic)
    } else if lower.contains("azure") {
        Ok(Provider::Azure)
    } else if lower.starts_with("llama") || lower.starts_with("mistral") || lower.starts_with("qwen") || lower.contains("local") {
        Ok(Provider::Ollama)
    } else {
        Err(LlmError::UnknownProvider(model.to_string()))
    }
}

static HTTP_CLIENT_POOL: Lazy<Mutex<HashMap<String, reqwest::Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn client_for(base_url: &str) -> reqwest::Client {
    let mut pool = HTTP_CLIENT_POOL.lock().unwrap();
    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }
    let client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .expect("failed to build LLM HTTP client");
    pool.insert(base_url.to_string(), client.clone());
    client
}

#[derive(Clone, Debug)]
pub struct LlmCallResult {
    pub instruction_id: String,
    pub raw: String,
    pub parsed: Option<Value>,
    pub model: String,
    pub tokens_used: Option<u32>,
    pub duration_ms: u64,
    pub attempt: u32,
    pub error: Option<String>,
}

fn build_messages(ctx: &CompiledLlmContext, resolved_slots: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let mut messages = Vec::with_capacity(2 + ctx.few_shots.len() * 2);
    messages.push(chat_message("system", &ctx.system_prompt));
    for FewShot { user, assistant } in &ctx.few_shots {
        messages.push(chat_message("user", user));
        messages.push(chat_message("assistant", assistant));
    }
    messages.push(chat_message("user", &user_message(ctx, resolved_slots)));
    messages
}

fn chat_message(role: &str, content: &str) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("role".to_string(), Value::String(role.to_string()));
    m.insert("content".to_string(), Value::String(content.to_string()));
    m
}

fn user_message(ctx: &CompiledLlmContext, resolved_slots: &Map<String, Value>) -> String {
    let rendered_template = crate::templates::render_template(&ctx.prompt_template, &Value::Object(resolved_slots.clone()));
    let mut lines = vec![rendered_template];
    for (k, v) in resolved_slots {
        lines.push(format!("{k}: {}", crate::templates::stringify(v)));
    }
    let schema_hint: Vec<String> = ctx.output_schema.iter().map(|(k, t)| format!("{k}: {}", schema_type_name(*t))).collect();
    if !schema_hint.is_empty() {
        lines.push(format!("Respond with JSON matching: {{{}}}", schema_hint.join(", ")));
    }
    lines.join("\n")
}

fn schema_type_name(t: SchemaFieldType) -> &'static str {
    match t {
        SchemaFieldType::String => "string",
        SchemaFieldType::Float => "float",
        SchemaFieldType::Boolean => "boolean",
        SchemaFieldType::Object => "object",
        SchemaFieldType::ObjectOrNull => "object|null",
    }
}

/// Strip Markdown code fences and locate the first top-level JSON object in
/// a model response. Falls back to wrapping the raw text as `{"text": ...}`
/// when no object is found (spec.md §4.6).
fn extract_json(raw: &str) -> Value {
    let stripped = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
    if let Some(start) = stripped.find('{') {
        let candidate = &stripped[start..];
        let mut depth = 0i32;
        for (i, ch) in candidate.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Ok(parsed) = serde_json::from_str::<Value>(&candidate[..=i]) {
                            return parsed;
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    serde_json::json!({ "text": raw })
}

fn validate_schema(parsed: &Value, schema: &BTreeMap<String, SchemaFieldType>) -> Result<(), String> {
    let Value::Object(obj) = parsed else {
        return Err("output is not a JSON object".to_string());
    };
    for (field, expected) in schema {
        let Some(value) = obj.get(field) else {
            return Err(format!("missing field `{field}`"));
        };
        let matches = match expected {
            SchemaFieldType::String => value.is_string(),
            SchemaFieldType::Float => value.is_number(),
            SchemaFieldType::Boolean => value.is_boolean(),
            SchemaFieldType::Object => value.is_object(),
            SchemaFieldType::ObjectOrNull => value.is_object() || value.is_null(),
        };
        if !matches {
            return Err(format!("field `{field}` does not match declared type {}", schema_type_name(*expected)));
        }
    }
    Ok(())
}

/// Minimal shape of a chat-completion response accepted across providers:
/// the caller reads only `choices[0].message.content` (or `content[0].text`
/// for Anthropic-shaped bodies) and an optional token count.
fn extract_completion_text(body: &Value) -> Option<String> {
    if let Some(text) = body.pointer("/choices/0/message/content").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = body.pointer("/content/0/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = body.pointer("/message/content").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    None
}

fn extract_tokens_used(body: &Value) -> Option<u32> {
    body.pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .or_else(|| {
            let input = body.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let output = body.pointer("/usage/output_tokens").and_then(Value::as_u64).unwrap_or(0);
            if input + output > 0 {
                Some(input + output)
            } else {
                None
            }
        })
        .map(|n| n as u32)
}

/// Invoke a single LLM call, retrying invalid-schema output with linear
/// backoff `500 * attempt` ms up to `retry_on_invalid_output.max_attempts`.
/// Never throws: every failure materializes into `LlmCallResult.error`.
pub async fn call(spec: &crate::types::LlmCallSpec, resolved_slots: &Map<String, Value>, _workflow_id: &str) -> LlmCallResult {
    let ctx = &spec.llm_context;
    let started = std::time::Instant::now();
    let max_attempts = ctx.retry_on_invalid_output.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);

    let mut last_raw = String::new();
    let mut last_error: Option<String> = None;

    for attempt in 1..=max_attempts {
        match call_once(ctx, resolved_slots).await {
            Ok((raw, tokens)) => {
                last_raw = raw.clone();
                let parsed = extract_json(&raw);
                match validate_schema(&parsed, &ctx.output_schema) {
                    Ok(()) => {
                        return LlmCallResult {
                            instruction_id: spec.instruction_id.clone(),
                            raw,
                            parsed: Some(parsed),
                            model: ctx.model.clone(),
                            tokens_used: tokens,
                            duration_ms: started.elapsed().as_millis() as u64,
                            attempt,
                            error: None,
                        };
                    }
                    Err(validation_error) => {
                        last_error = Some(validation_error);
                    }
                }
            }
            Err(transport_error) => {
                last_error = Some(transport_error.to_string());
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS * attempt as u64)).await;
        }
    }

    LlmCallResult {
        instruction_id: spec.instruction_id.clone(),
        raw: last_raw,
        parsed: None,
        model: ctx.model.clone(),
        tokens_used: None,
        duration_ms: started.elapsed().as_millis() as u64,
        attempt: max_attempts,
        error: last_error.or_else(|| Some(LlmError::RetriesExhausted(max_attempts).to_string())),
    }
}

async fn call_once(ctx: &CompiledLlmContext, resolved_slots: &Map<String, Value>) -> Result<(String, Option<u32>), LlmError> {
    let provider = detect_provider(&ctx.model)?;
    let timeout_ms = ctx.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
    let messages = build_messages(ctx, resolved_slots);

    let body = serde_json::json!({
        "model": ctx.model,
        "messages": messages,
        "temperature": ctx.temperature,
        "max_tokens": ctx.max_tokens,
    });

    let client = client_for(provider.base_url());
    let request = client.post(provider.base_url()).json(&body).timeout(Duration::from_millis(timeout_ms));

    let response = tokio::time::timeout(Duration::from_millis(timeout_ms), request.send())
        .await
        .map_err(|_| LlmError::Timeout(timeout_ms))?
        .map_err(|e| if e.is_timeout() { LlmError::Timeout(timeout_ms) } else { LlmError::Transport(e.to_string()) })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(LlmError::Upstream { status: status.as_u16(), body: body_text });
    }

    let body: Value = response.json().await.map_err(|e| LlmError::Transport(e.to_string()))?;
    let text = extract_completion_text(&body).unwrap_or_default();
    let tokens = extract_tokens_used(&body);
    Ok((text, tokens))
}

/// Same-order fan-out: per-call errors are materialized into result objects
/// by `call`, so the join never fails.
pub async fn call_parallel(
    specs: &[(crate::types::LlmCallSpec, Map<String, Value>)],
    workflow_id: &str,
) -> Vec<LlmCallResult> {
    let futures = specs.iter().map(|(spec, slots)| call(spec, slots, workflow_id));
    futures::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompiledLlmContext, ValidationFailureStrategy};

    fn ctx(model: &str) -> CompiledLlmContext {
        CompiledLlmContext {
            system_prompt: "you are a helpful scorer".to_string(),
            few_shots: vec![],
            output_schema: BTreeMap::from([("score".to_string(), SchemaFieldType::Float)]),
            model: model.to_string(),
            temperature: 0.0,
            max_tokens: 128,
            dynamic_slots: vec![],
            prompt_template: "score this: {{ input }}".to_string(),
            retry_on_invalid_output: None,
            on_validation_failure: ValidationFailureStrategy::FailSafe,
            timeout_ms: Some(1000),
        }
    }

    #[test]
    fn detects_known_providers() {
        assert_eq!(detect_provider("gpt-4o").unwrap(), Provider::OpenAi);
        assert_eq!(detect_provider("claude-3-5-sonnet").unwrap(), Provider::Anthropic);
        assert_eq!(detect_provider("llama3.1").unwrap(), Provider::Ollama);
        assert!(detect_provider("some-random-model").is_err());
    }

    #[test]
    fn extracts_json_from_code_fence() {
        let raw = "```json\n{\"score\": 0.9}\n```";
        let parsed = extract_json(raw);
        assert_eq!(parsed["score"], serde_json::json!(0.9));
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let raw = "Sure, here you go: {\"score\": 0.42} — hope that helps!";
        let parsed = extract_json(raw);
        assert_eq!(parsed["score"], serde_json::json!(0.42));
    }

    #[test]
    fn falls_back_to_text_wrapper_when_no_json_found() {
        let parsed = extract_json("no braces here");
        assert_eq!(parsed["text"], serde_json::json!("no braces here"));
    }

    #[test]
    fn validate_schema_rejects_missing_field() {
        let schema = BTreeMap::from([("score".to_string(), SchemaFieldType::Float)]);
        let err = validate_schema(&serde_json::json!({}), &schema).unwrap_err();
        assert!(err.contains("score"));
    }

    #[test]
    fn validate_schema_accepts_matching_types() {
        let schema = BTreeMap::from([
            ("score".to_string(), SchemaFieldType::Float),
            ("ok".to_string(), SchemaFieldType::Boolean),
        ]);
        assert!(validate_schema(&serde_json::json!({"score": 0.5, "ok": true}), &schema).is_ok());
    }

    #[test]
    fn user_message_includes_schema_hint_and_slots() {
        let c = ctx("gpt-4o");
        let slots = Map::from_iter([("input".to_string(), Value::String("hot".to_string()))]);
        let msg = user_message(&c, &slots);
        assert!(msg.contains("input: hot"));
        assert!(msg.contains("score: float"));
    }
}
