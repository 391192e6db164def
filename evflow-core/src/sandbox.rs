//! Expression Sandbox (C1, spec.md §4.1).
//!
//! Evaluates compiled boolean/numeric expressions and `{{ path }}`
//! templates in an isolated context with a hard wall-clock timeout. The
//! sandbox has no access to host I/O, the filesystem, the network, or
//! process state — the evaluation context only ever holds the JSON scope
//! handed in by the caller.
//!
//! Evaluation itself runs on a blocking thread (`evalexpr` is synchronous
//! and does not yield), raced against the timeout with `tokio::time::timeout`.
//! A timed-out evaluation is abandoned rather than joined; failures never
//! propagate — they fail closed per spec.md §7.

use evalexpr::{ContextWithMutableVariables, HashMapContext};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_EXPR_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_TEMPLATE_TIMEOUT_MS: u64 = 50;

/// Build an isolated evalexpr context from a JSON scope. Only scalar and
/// nested-object fields are exposed; arrays are flattened to their length
/// under `<path>.length` so expressions can still reason about them without
/// evalexpr's tuple type leaking host structure.
fn build_context(scope: &Value) -> HashMapContext {
    let mut ctx = HashMapContext::new();
    bind(&mut ctx, "", scope);
    ctx
}

fn bind(ctx: &mut HashMapContext, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                bind(ctx, &path, v);
            }
        }
        Value::Array(arr) => {
            if !prefix.is_empty() {
                let _ = ctx.set_value(format!("{prefix}.length"), evalexpr::Value::Int(arr.len() as i64));
            }
            for (i, v) in arr.iter().enumerate() {
                let path = if prefix.is_empty() {
                    i.to_string()
                } else {
                    format!("{prefix}.{i}")
                };
                bind(ctx, &path, v);
            }
        }
        Value::String(s) => {
            if !prefix.is_empty() {
                let _ = ctx.set_value(prefix.to_string(), evalexpr::Value::String(s.clone()));
            }
        }
        Value::Bool(b) => {
            if !prefix.is_empty() {
                let _ = ctx.set_value(prefix.to_string(), evalexpr::Value::Boolean(*b));
            }
        }
        Value::Number(n) => {
            if !prefix.is_empty() {
                if let Some(f) = n.as_f64() {
                    let _ = ctx.set_value(prefix.to_string(), evalexpr::Value::Float(f));
                }
            }
        }
        Value::Null => {}
    }
}

/// Evaluate a boolean expression against `scope`. Returns `false` on any
/// error, non-boolean result, or timeout (fail-closed, never throws).
pub async fn evaluate_bool(expr: &str, scope: &Value, timeout_ms: Option<u64>) -> bool {
    let expr = expr.to_string();
    let scope = scope.clone();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_EXPR_TIMEOUT_MS));

    let work = tokio::task::spawn_blocking(move || {
        let ctx = build_context(&scope);
        evalexpr::eval_boolean_with_context(&expr, &ctx)
    });

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(Ok(b))) => b,
        Ok(Ok(Err(e))) => {
            tracing::debug!(error = %e, expr, "sandbox: boolean evaluation failed");
            false
        }
        Ok(Err(join_err)) => {
            tracing::warn!(error = %join_err, expr, "sandbox: evaluation task panicked");
            false
        }
        Err(_) => {
            tracing::warn!(expr, "sandbox: boolean evaluation timed out");
            false
        }
    }
}

/// Evaluate a numeric expression against `scope`. Returns `NaN` on any
/// error, non-numeric result, or timeout.
pub async fn evaluate_number(expr: &str, scope: &Value, timeout_ms: Option<u64>) -> f64 {
    let expr = expr.to_string();
    let scope = scope.clone();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_EXPR_TIMEOUT_MS));

    let work = tokio::task::spawn_blocking(move || {
        let ctx = build_context(&scope);
        evalexpr::eval_number_with_context(&expr, &ctx)
    });

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(Ok(n))) => n,
        Ok(Ok(Err(e))) => {
            tracing::debug!(error = %e, expr, "sandbox: numeric evaluation failed");
            f64::NAN
        }
        Ok(Err(join_err)) => {
            tracing::warn!(error = %join_err, expr, "sandbox: evaluation task panicked");
            f64::NAN
        }
        Err(_) => {
            tracing::warn!(expr, "sandbox: numeric evaluation timed out");
            f64::NAN
        }
    }
}

/// Render a `{{ path }}` template against `scope` with a hard timeout.
/// Unresolved paths render as `<path>`; a timeout renders the template
/// unexpanded (each `{{ path }}` becomes `<path>`), never panics.
pub async fn render_template(template: &str, scope: &Value, timeout_ms: Option<u64>) -> String {
    let template_owned = template.to_string();
    let scope = scope.clone();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TEMPLATE_TIMEOUT_MS));

    let work = tokio::task::spawn_blocking(move || crate::templates::render_template(&template_owned, &scope));

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(rendered)) => rendered,
        Ok(Err(join_err)) => {
            tracing::warn!(error = %join_err, "sandbox: template render task panicked");
            template.to_string()
        }
        Err(_) => {
            tracing::warn!(template, "sandbox: template render timed out");
            template.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn evaluate_bool_true_case() {
        let scope = json!({"output": {"score": 0.9}});
        assert!(evaluate_bool("output.score > 0.8", &scope, None).await);
    }

    #[tokio::test]
    async fn evaluate_bool_fails_closed_on_bad_expr() {
        let scope = json!({});
        assert!(!evaluate_bool("not( valid (( expr", &scope, None).await);
    }

    #[tokio::test]
    async fn evaluate_number_nan_on_error() {
        let scope = json!({});
        assert!(evaluate_number("1 / ", &scope, None).await.is_nan());
    }

    #[tokio::test]
    async fn templates_identity_with_no_slots() {
        assert_eq!(render_template("abc", &json!({}), None).await, "abc");
    }

    #[tokio::test]
    async fn sandbox_has_no_host_access() {
        // no `std`/`env`/file access surfaced in the scope — an expression
        // referencing an unbound identifier fails closed rather than
        // reaching into the host process.
        let scope = json!({"temp": 85});
        assert!(!evaluate_bool("env::var(\"PATH\") != \"\"", &scope, None).await);
    }
}
