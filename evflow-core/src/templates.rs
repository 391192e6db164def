//! Dot-path resolution over JSON-shaped payloads and `{{ path }}` template
//! substitution. Small path-walkers, not runtime reflection of host types
//! (spec.md §9 design note).

use serde_json::Value;

/// Walk `root` following a dot-separated path (`a.b.c`, array indices as
/// plain numbers: `a.0.b`). Returns `None` if any segment is missing.
pub fn dot_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(arr) => {
                let idx: usize = segment.parse().ok()?;
                arr.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Render every `{{ path }}` occurrence in `template` by resolving `path`
/// against `scope` and stringifying the result. Unresolved paths render as
/// `<path>` (spec.md §4.1).
pub fn render_template(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_open = &rest[start + 2..];
                match after_open.find("}}") {
                    None => {
                        out.push_str("{{");
                        out.push_str(after_open);
                        break;
                    }
                    Some(end) => {
                        let path = after_open[..end].trim();
                        match dot_path(scope, path) {
                            Some(v) => out.push_str(&stringify(v)),
                            None => {
                                out.push('<');
                                out.push_str(path);
                                out.push('>');
                            }
                        }
                        rest = &after_open[end + 2..];
                    }
                }
            }
        }
    }
    out
}

pub fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a mapping of `name -> dot_path` against `scope` into a JSON
/// object, used for pipeline step slot resolution (C8 §4.8).
pub fn resolve_slots(
    slots: &std::collections::BTreeMap<String, String>,
    scope: &Value,
) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for (name, path) in slots {
        let resolved = dot_path(scope, path).cloned().unwrap_or(Value::Null);
        out.insert(name.clone(), resolved);
    }
    out
}

/// Walk `alias -> dot_path` extraction mappings against a response body,
/// used by the connector dispatcher (C5 §4.5).
pub fn extract_output(
    extract: &std::collections::BTreeMap<String, String>,
    response: &Value,
) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for (alias, path) in extract {
        if let Some(v) = dot_path(response, path) {
            out.insert(alias.clone(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_identity_with_no_slots() {
        assert_eq!(render_template("abc", &json!({})), "abc");
    }

    #[test]
    fn render_resolves_nested_path() {
        let scope = json!({"event": {"matched_values": {"t": {"value": 85}}}});
        assert_eq!(
            render_template("temp is {{ event.matched_values.t.value }}", &scope),
            "temp is 85"
        );
    }

    #[test]
    fn render_unresolved_path_is_placeholder() {
        let scope = json!({});
        assert_eq!(render_template("{{ missing.path }}", &scope), "<missing.path>");
    }

    #[test]
    fn dot_path_walks_arrays() {
        let scope = json!({"items": [{"id": "a"}, {"id": "b"}]});
        assert_eq!(dot_path(&scope, "items.1.id"), Some(&json!("b")));
    }
}
