//! Template Renderer.
//!
//! Two interchangeable interpolation forms: `<<name>>` and `{{ name }}`.
//! References may walk into objects and arrays (`{{ item.title }}`,
//! `{{ row.0 }}`). Rendering is strict: an unknown or null reference is an
//! error naming the reference and the available keys.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::engine::context::Context;
use crate::error::BlockError;

static ANGLE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"<<\s*(\w+)\s*>>").unwrap());
static BRACE_EXPR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").unwrap());
static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z0-9_]+)*)$").unwrap());

/// Rewrite every `<<name>>` into `{{ name }}`.
pub fn normalize_syntax(template: &str) -> String {
    ANGLE_REF.replace_all(template, "{{ $1 }}").into_owned()
}

/// Root variable names a template refers to.
pub fn template_variables(template: &str) -> BTreeSet<String> {
    let template = normalize_syntax(template);
    BRACE_EXPR
        .captures_iter(&template)
        .filter_map(|caps| {
            REFERENCE
                .captures(caps[1].trim())
                .map(|r| r[1].to_string())
        })
        .collect()
}

/// Render `template` against `context`.
pub fn render_prompt(template: &str, context: &Context) -> Result<String, BlockError> {
    if template.is_empty() {
        return Ok(String::new());
    }
    let template = normalize_syntax(template);

    let mut failure: Option<BlockError> = None;
    let rendered = BRACE_EXPR.replace_all(&template, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }
        match resolve(caps[1].trim(), context) {
            Ok(text) => text,
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => {
            tracing::debug!("[Template] Render failed: {}", e);
            Err(e)
        }
        None => Ok(rendered.into_owned()),
    }
}

fn resolve(expr: &str, context: &Context) -> Result<String, BlockError> {
    let Some(caps) = REFERENCE.captures(expr) else {
        return Err(BlockError::TemplateRender(format!(
            "Unsupported template expression '{{{{ {} }}}}'; only variable references are allowed.",
            expr
        )));
    };
    let root = &caps[1];

    let Some(mut value) = context.get(root) else {
        return Err(missing(expr, &format!("'{}' is undefined", root), context));
    };
    for segment in caps[2].split('.').filter(|s| !s.is_empty()) {
        let next = match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        value = next.ok_or_else(|| {
            missing(expr, &format!("'{}' has no attribute '{}'", root, segment), context)
        })?;
    }

    match value {
        Value::Null => Err(missing(expr, &format!("'{}' has no value", expr), context)),
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Ok(other.to_string()),
    }
}

fn missing(expr: &str, reason: &str, context: &Context) -> BlockError {
    BlockError::TemplateRender(format!(
        "Template variable error: {} (reference '{{{{ {} }}}}'). Available context keys: [{}]",
        reason,
        expr,
        context.key_list()
    ))
}
