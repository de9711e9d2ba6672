//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! promptflow-core engine through a `SequenceOrchestrator`.

pub mod block;
pub mod preview;
pub mod run;
pub mod sequence;

use std::path::Path;
use std::sync::Arc;

use promptflow_core::engine::{EchoLlmClient, HttpLlmClient, LlmClient};
use promptflow_core::state::AppState;
use promptflow_core::{EngineConfig, SequenceOrchestrator};
use serde::Serialize;
use serde_json::{Map, Value};

/// Initialize a shared `AppState` from the given SQLite database path.
pub fn init_state(db_path: &str) -> AppState {
    let db = promptflow_core::Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    });
    Arc::new(promptflow_core::AppStateInner::new(db))
}

/// Build an orchestrator over `state`. `--dry-run` answers every prompt
/// with itself instead of calling a provider.
pub fn build_orchestrator(
    state: AppState,
    config_path: Option<&str>,
    dry_run: bool,
) -> Result<SequenceOrchestrator, String> {
    let config = EngineConfig::load(config_path.map(Path::new)).map_err(|e| e.to_string())?;
    let llm: Arc<dyn LlmClient> = if dry_run {
        tracing::info!("[Cli] Dry run: prompts are echoed back instead of sent");
        Arc::new(EchoLlmClient)
    } else {
        Arc::new(HttpLlmClient::new(config.llm.clone()).map_err(|e| e.to_string())?)
    };
    Ok(SequenceOrchestrator::new(state, llm, config))
}

/// Collect run overrides from `--inputs-json` and repeated `--input key=value`
/// flags. Values are parsed as JSON when they parse, else kept as text;
/// `--input` entries win over the JSON document.
pub fn parse_inputs(
    inputs: &[String],
    inputs_json: Option<&str>,
) -> Result<Option<Map<String, Value>>, String> {
    let mut overrides = match inputs_json {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("--inputs-json must be a JSON object".to_string()),
            Err(e) => return Err(format!("Invalid --inputs-json: {}", e)),
        },
        None => Map::new(),
    };

    for entry in inputs {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("Invalid --input '{}': expected KEY=VALUE", entry))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid --input '{}': empty key", entry));
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        overrides.insert(key.to_string(), value);
    }

    Ok(if overrides.is_empty() { None } else { Some(overrides) })
}

/// Load `.env.local` then `.env` from the working directory.
pub fn load_dotenv() {
    load_dotenv_from(Path::new("."));
}

/// Load `.env.local` then `.env` from `dir`. Variables already present in
/// the environment are never overwritten.
pub fn load_dotenv_from(dir: &Path) {
    for filename in [".env.local", ".env"] {
        let path = dir.join(filename);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let value = if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                &value[1..value.len() - 1]
            } else {
                value
            };
            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
            }
        }
        tracing::info!("[Cli] Loaded environment from '{}'", path.display());
    }
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Pretty-print any serializable result.
pub fn print_serialized<T: Serialize>(value: &T) -> Result<(), String> {
    let value = serde_json::to_value(value).map_err(|e| format!("Failed to serialize output: {}", e))?;
    print_json(&value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inputs_json_values_and_text() {
        let inputs = vec![
            "count=3".to_string(),
            "topic=rust lifetimes".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ];
        let overrides = parse_inputs(&inputs, None).unwrap().unwrap();
        assert_eq!(
            Value::Object(overrides),
            json!({"count": 3, "topic": "rust lifetimes", "tags": ["a", "b"]})
        );
    }

    #[test]
    fn test_parse_inputs_flags_override_json_document() {
        let inputs = vec!["a=flag".to_string()];
        let overrides = parse_inputs(&inputs, Some(r#"{"a": "doc", "b": 1}"#))
            .unwrap()
            .unwrap();
        assert_eq!(Value::Object(overrides), json!({"a": "flag", "b": 1}));
    }

    #[test]
    fn test_parse_inputs_rejects_malformed_entries() {
        assert!(parse_inputs(&["novalue".to_string()], None).is_err());
        assert!(parse_inputs(&["=x".to_string()], None).is_err());
        assert!(parse_inputs(&[], Some("[1, 2]")).is_err());
        assert_eq!(parse_inputs(&[], None).unwrap(), None);
    }

    #[test]
    fn test_load_dotenv_keeps_existing_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "# comment\nPROMPTFLOW_TEST_DOTENV_NEW=\"from file\"\nPROMPTFLOW_TEST_DOTENV_SET=file\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".env.local"), "PROMPTFLOW_TEST_DOTENV_LOCAL=local\n").unwrap();
        std::env::set_var("PROMPTFLOW_TEST_DOTENV_SET", "process");

        load_dotenv_from(dir.path());

        assert_eq!(std::env::var("PROMPTFLOW_TEST_DOTENV_NEW").unwrap(), "from file");
        assert_eq!(std::env::var("PROMPTFLOW_TEST_DOTENV_SET").unwrap(), "process");
        assert_eq!(std::env::var("PROMPTFLOW_TEST_DOTENV_LOCAL").unwrap(), "local");
    }
}
