//! Output Discretizer — splits one free-text LLM response into named values.
//!
//! Strategies are tried in order and the first that applies wins:
//! 1. the outermost `{...}` span parsed as a JSON object (by key, then by position),
//! 2. the whole response parsed as JSON (object by key, or array of matching length),
//! 3. the whole trimmed response when exactly one name is requested,
//! 4. a per-name `"name": value` pattern search.
//!
//! Never fails. Names that stay unresolved map to `""` and are logged.

use regex::RegexBuilder;
use serde_json::{Map, Value};

pub fn discretize_output(raw: &str, output_names: &[String]) -> Map<String, Value> {
    let mut outputs: Map<String, Value> = output_names
        .iter()
        .map(|name| (name.clone(), Value::String(String::new())))
        .collect();
    if raw.is_empty() || output_names.is_empty() {
        return outputs;
    }

    if let Some(object) = embedded_object(raw) {
        let by_position: Vec<&Value> = object.values().collect();
        for (i, name) in output_names.iter().enumerate() {
            let value = object.get(name).or_else(|| by_position.get(i).copied());
            outputs.insert(name.clone(), Value::String(value.map(stringify).unwrap_or_default()));
        }
        return outputs;
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(object)) => {
            for name in output_names {
                let text = object.get(name).map(stringify).unwrap_or_default();
                outputs.insert(name.clone(), Value::String(text));
            }
            return outputs;
        }
        Ok(Value::Array(items)) if items.len() == output_names.len() => {
            for (name, item) in output_names.iter().zip(&items) {
                outputs.insert(name.clone(), Value::String(stringify(item)));
            }
            return outputs;
        }
        _ => {}
    }

    if let [only] = output_names {
        outputs.insert(only.clone(), Value::String(raw.trim().to_string()));
        return outputs;
    }

    for name in output_names {
        if let Some(text) = extract_by_key(raw, name) {
            outputs.insert(name.clone(), Value::String(text));
        }
    }

    for name in output_names {
        if outputs.get(name).and_then(Value::as_str).map_or(true, str::is_empty) {
            tracing::warn!(
                "[Discretize] Could not find or parse value for output name '{}'",
                name
            );
        }
    }
    outputs
}

/// First `{` through last `}`, if that span is a JSON object.
fn embedded_object(raw: &str) -> Option<Map<String, Value>> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("[Discretize] Embedded JSON span did not parse: {}", e);
            None
        }
    }
}

fn extract_by_key(raw: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r#""?{}"?\s*:\s*["']?(.*?)["']?(?:,|\n|\}})"#,
        regex::escape(name)
    );
    let re = RegexBuilder::new(&pattern).case_insensitive(true).build().ok()?;
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Strings as-is, null as empty, anything else as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
