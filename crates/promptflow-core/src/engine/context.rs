//! Context Builder — the name → value mapping prompts render against.
//!
//! A context is assembled once per run, preview, or rerun from the user's
//! global variables, the sequence's variables, the user's global lists, and
//! caller overrides, in that order of increasing precedence. Block outputs
//! are folded in by the orchestrator as the run progresses.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::models::variable::VariableRole;
use crate::state::AppStateInner;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());
static UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

/// Canonical snake_case form of a variable name.
///
/// Lower-cases, turns whitespace and any character outside `[a-zA-Z0-9_]`
/// into `_`, collapses runs of `_`, trims them from both ends, and prefixes
/// `_` when the result would start with a digit. Idempotent.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim().to_lowercase();
    let key = WHITESPACE.replace_all(&key, "_");
    let key = NON_WORD.replace_all(&key, "_");
    let key = UNDERSCORES.replace_all(&key, "_");
    let key = key.trim_matches('_');
    match key.chars().next() {
        Some(c) if !c.is_ascii_alphabetic() => format!("_{}", key),
        _ => key.to_string(),
    }
}

/// Variable values visible to prompt rendering.
///
/// Keys keep insertion order. A lower-cased key index, built as entries are
/// inserted, serves the case-insensitive fallback of [`Context::lookup`]
/// without rescanning every key.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: Map<String, Value>,
    /// lower-cased key → (insertion ordinal, original key) of its first holder
    folded: HashMap<String, (usize, String)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        let mut ctx = Self::new();
        ctx.merge(&values);
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let ordinal = self.values.len();
        self.folded
            .entry(key.to_lowercase())
            .or_insert_with(|| (ordinal, key.clone()));
        self.values.insert(key, value);
    }

    /// Insert under both the literal and the normalized name.
    pub fn insert_named(&mut self, name: &str, value: Value) {
        let normalized = normalize_key(name);
        self.insert(name, value.clone());
        if normalized != name {
            self.insert(normalized, value);
        }
    }

    /// Fold a block's delta in; later writes win.
    pub fn merge(&mut self, delta: &Map<String, Value>) {
        for (key, value) in delta {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Exact-key access, as used by strict template rendering.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Forgiving lookup: the literal name, its normalized form, their
    /// trimmed and lower-cased variants, then any key equal to either
    /// ignoring case (earliest inserted wins).
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let normalized = normalize_key(name);
        let candidates = [
            name.to_string(),
            normalized.clone(),
            name.trim().to_string(),
            normalized.trim().to_string(),
            name.to_lowercase(),
            normalized.to_lowercase(),
        ];
        if let Some(value) = candidates.iter().find_map(|k| self.values.get(k)) {
            return Some(value);
        }

        [name.to_lowercase(), normalized.to_lowercase()]
            .iter()
            .filter_map(|k| self.folded.get(k))
            .min_by_key(|(ordinal, _)| *ordinal)
            .and_then(|(_, key)| self.values.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Comma-separated key list for error messages.
    pub fn key_list(&self) -> String {
        self.values.keys().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Debug-friendly view with long strings cut to `max` characters.
    pub fn truncated(&self, max: usize) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) if s.chars().count() > max => {
                        Value::String(format!("{}...", s.chars().take(max).collect::<String>()))
                    }
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Free-function form of [`Context::lookup`].
pub fn get_context_value<'a>(context: &'a Context, name: &str) -> Option<&'a Value> {
    context.lookup(name)
}

/// Assemble the initial context of a sequence for a user.
pub async fn build_context(
    state: &AppStateInner,
    sequence_id: &str,
    user_id: &str,
    overrides: Option<&Map<String, Value>>,
) -> Result<Context, CoreError> {
    let mut ctx = Context::new();

    for var in state.variable_store.list_user_globals(user_id).await? {
        ctx.insert_named(&var.name, var.value);
    }

    let sequence_vars = state.variable_store.list_by_sequence(sequence_id).await?;
    for var in &sequence_vars {
        ctx.insert_named(&var.name, var.value.clone());
    }

    for list in state.global_list_store.list_by_owner(user_id).await? {
        ctx.insert_named(&list.name, Value::Array(list.values()));
    }

    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            ctx.insert_named(key, value.clone());
        }
    }

    // Declared inputs are always present so a missing one renders as a
    // missing value rather than an unknown key.
    for var in sequence_vars.iter().filter(|v| v.role == VariableRole::Input) {
        for key in [var.name.clone(), normalize_key(&var.name)] {
            if !ctx.contains_key(&key) {
                ctx.insert(key, Value::Null);
            }
        }
    }

    tracing::debug!(
        "[Context] Initial context for sequence {} (user {}): {}",
        sequence_id,
        user_id,
        serde_json::Value::Object(ctx.truncated(50))
    );
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::global_list::CreateGlobalListInput;
    use crate::models::sequence::Sequence;
    use crate::models::variable::CreateVariableInput;
    use serde_json::json;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Customer Email"), "customer_email");
        assert_eq!(normalize_key("  Product--Name!! "), "product_name");
        assert_eq!(normalize_key("2nd Draft"), "_2nd_draft");
        assert_eq!(normalize_key("__already_ok__"), "already_ok");
        assert_eq!(normalize_key(""), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in [
            "Customer Email",
            "2nd Draft",
            "a  b\tc",
            "Ünïcode Name",
            "___",
            "x__y",
            "already_snake",
            "9",
        ] {
            let once = normalize_key(input);
            assert_eq!(normalize_key(&once), once, "input: {:?}", input);
        }
    }

    #[test]
    fn test_lookup_tiers() {
        let mut ctx = Context::new();
        ctx.insert("customer_email", json!("a@b.com"));
        assert_eq!(get_context_value(&ctx, "Customer Email"), Some(&json!("a@b.com")));

        ctx.insert("ProductList", json!(["x"]));
        assert_eq!(ctx.lookup("productlist"), Some(&json!(["x"])));
        assert_eq!(ctx.lookup("PRODUCTLIST"), Some(&json!(["x"])));
        assert_eq!(ctx.lookup("missing"), None);
    }

    #[test]
    fn test_case_insensitive_fallback_prefers_earliest_key() {
        let mut ctx = Context::new();
        ctx.insert("Topic", json!("first"));
        ctx.insert("TOPIC", json!("second"));
        assert_eq!(ctx.lookup("ToPiC"), Some(&json!("first")));
    }

    #[tokio::test]
    async fn test_build_context_precedence_and_placeholders() {
        let db = Database::open_in_memory().unwrap();
        let state = AppStateInner::new(db);
        state
            .sequence_store
            .save(&Sequence::new("s1".into(), "Seq".into(), None, "u1".into(), None))
            .await
            .unwrap();

        let var = |name: &str, sequence_id: Option<&str>, role, value| CreateVariableInput {
            name: name.into(),
            user_id: "u1".into(),
            sequence_id: sequence_id.map(str::to_string),
            role,
            value,
            description: None,
        };
        let vars = &state.variable_store;
        vars.upsert(var("Tone", None, VariableRole::Global, json!("casual"))).await.unwrap();
        vars.upsert(var("Tone", Some("s1"), VariableRole::Global, json!("formal"))).await.unwrap();
        vars.upsert(var("Audience", Some("s1"), VariableRole::Input, json!("devs"))).await.unwrap();
        vars.upsert(var("Customer Name", Some("s1"), VariableRole::Input, Value::Null))
            .await
            .unwrap();
        state
            .global_list_store
            .create(CreateGlobalListInput {
                name: "Product List".into(),
                user_id: "u1".into(),
                description: None,
                items: vec![json!("a"), json!("b")],
            })
            .await
            .unwrap();

        let overrides = json!({"Audience": "managers"}).as_object().unwrap().clone();
        let ctx = build_context(&state, "s1", "u1", Some(&overrides)).await.unwrap();

        assert_eq!(ctx.get("Tone"), Some(&json!("formal")));
        assert_eq!(ctx.get("tone"), Some(&json!("formal")));
        assert_eq!(ctx.get("Audience"), Some(&json!("managers")));
        assert_eq!(ctx.get("audience"), Some(&json!("managers")));
        assert_eq!(ctx.get("product_list"), Some(&json!(["a", "b"])));
        assert_eq!(ctx.get("customer_name"), Some(&Value::Null));
    }
}
