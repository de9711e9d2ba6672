//! The execution engine: context building, template rendering, output
//! discretization, block execution, run orchestration, and reruns.

pub mod context;
pub mod discretize;
pub mod executor;
pub mod llm;
pub mod orchestrator;
pub mod rerun;
pub mod template;

pub use context::{build_context, get_context_value, normalize_key, Context};
pub use discretize::discretize_output;
pub use executor::{BlockExecution, BlockExecutor};
pub use llm::{EchoLlmClient, HttpLlmClient, LlmClient, LlmError, LlmRequest};
pub use orchestrator::{PromptPreview, SequenceOrchestrator};
pub use rerun::{fold_history, OutputEdit};
pub use template::{render_prompt, template_variables};
