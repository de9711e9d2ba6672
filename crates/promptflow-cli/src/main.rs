//! Promptflow CLI — import prompt sequences and run them against an LLM.
//!
//! Every command works on the SQLite database given by `--db` and acts on
//! behalf of the user given by `--user`.

use clap::{Args, Parser, Subcommand};
use promptflow_cli::commands;

/// Promptflow — run sequences of LLM prompt blocks
#[derive(Parser)]
#[command(name = "promptflow", version, about = "Promptflow — run sequences of LLM prompt blocks")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "PROMPTFLOW_DB_PATH", default_value = "promptflow.db")]
    db: String,

    /// Engine configuration file (YAML)
    #[arg(long, env = "PROMPTFLOW_CONFIG")]
    config: Option<String>,

    /// User the commands act for
    #[arg(long, env = "PROMPTFLOW_USER", default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sequence definitions
    Sequence {
        #[command(subcommand)]
        action: SequenceAction,
    },

    /// Start and inspect runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Work with individual blocks
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },

    /// Render a block's prompt with placeholder outputs for earlier blocks
    Preview {
        /// Sequence ID
        sequence_id: String,
        /// Block ID
        block_id: String,
        #[command(flatten)]
        inputs: InputArgs,
    },
}

#[derive(Subcommand)]
enum SequenceAction {
    /// Import a sequence from a YAML definition
    Import {
        /// Path to the YAML file
        file: String,
    },
    /// List your sequences
    List,
    /// Show a sequence with its blocks and variables
    Show {
        /// Sequence ID
        id: String,
    },
    /// Validate a YAML definition without importing it
    Validate {
        /// Path to the YAML file
        file: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Run a sequence from its first block
    Start {
        /// Sequence ID
        sequence_id: String,
        /// Model for every block without its own override
        #[arg(long)]
        model: Option<String>,
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Show a run and its block runs
    Show {
        /// Run ID
        run_id: String,
    },
    /// List the runs of a sequence
    List {
        /// Sequence ID
        sequence_id: String,
    },
    /// Start a new run from a block, reusing earlier outputs of a run
    Rerun {
        /// Run ID to take history from
        run_id: String,
        /// Block to restart from
        block_id: String,
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Replace the output of one block run
    EditOutput {
        /// Run ID
        run_id: String,
        /// Block run ID
        block_run_id: String,
        /// Edit kind: named, raw_text, list, or matrix
        #[arg(long, default_value = "raw_text")]
        kind: String,
        /// New value (JSON for every kind but raw_text)
        #[arg(long)]
        value: String,
    },
}

#[derive(Subcommand)]
enum BlockAction {
    /// Execute one block on its own
    Exec {
        /// Sequence ID
        sequence_id: String,
        /// Block ID
        block_id: String,
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Input override as KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(long = "input", value_name = "KEY=VALUE")]
    input: Vec<String>,

    /// Input overrides as one JSON object
    #[arg(long)]
    inputs_json: Option<String>,
}

impl InputArgs {
    fn overrides(&self) -> Result<Option<serde_json::Map<String, serde_json::Value>>, String> {
        commands::parse_inputs(&self.input, self.inputs_json.as_deref())
    }
}

#[derive(Args)]
struct ExecArgs {
    /// Echo prompts back instead of calling the LLM provider
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promptflow_core=warn,promptflow_cli=info".into()),
        )
        .init();

    // API keys may live in .env files
    commands::load_dotenv();

    let result = dispatch(&cli).await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli) -> Result<(), String> {
    let state = commands::init_state(&cli.db);
    let config = cli.config.as_deref();
    let user = cli.user.as_str();

    match &cli.command {
        Commands::Sequence { action } => match action {
            SequenceAction::Import { file } => commands::sequence::import(&state, file, user).await,
            SequenceAction::List => commands::sequence::list(&state, user).await,
            SequenceAction::Show { id } => commands::sequence::show(&state, id, user).await,
            SequenceAction::Validate { file } => commands::sequence::validate(file).await,
        },

        Commands::Run { action } => match action {
            RunAction::Start {
                sequence_id,
                model,
                inputs,
                exec,
            } => {
                let orchestrator = commands::build_orchestrator(state, config, exec.dry_run)?;
                commands::run::start(&orchestrator, sequence_id, user, inputs.overrides()?, model.clone())
                    .await
            }
            RunAction::Show { run_id } => {
                let orchestrator = commands::build_orchestrator(state, config, true)?;
                commands::run::show(&orchestrator, run_id, user).await
            }
            RunAction::List { sequence_id } => {
                let orchestrator = commands::build_orchestrator(state, config, true)?;
                commands::run::list(&orchestrator, sequence_id, user).await
            }
            RunAction::Rerun {
                run_id,
                block_id,
                inputs,
                exec,
            } => {
                let orchestrator = commands::build_orchestrator(state, config, exec.dry_run)?;
                commands::run::rerun(&orchestrator, run_id, block_id, user, inputs.overrides()?).await
            }
            RunAction::EditOutput {
                run_id,
                block_run_id,
                kind,
                value,
            } => {
                let orchestrator = commands::build_orchestrator(state, config, true)?;
                commands::run::edit_output(&orchestrator, run_id, block_run_id, user, kind, value)
                    .await
            }
        },

        Commands::Block { action } => match action {
            BlockAction::Exec {
                sequence_id,
                block_id,
                inputs,
                exec,
            } => {
                let orchestrator = commands::build_orchestrator(state, config, exec.dry_run)?;
                commands::block::exec(&orchestrator, sequence_id, block_id, user, inputs.overrides()?)
                    .await
            }
        },

        Commands::Preview {
            sequence_id,
            block_id,
            inputs,
        } => {
            let orchestrator = commands::build_orchestrator(state, config, true)?;
            commands::preview::run(&orchestrator, sequence_id, block_id, user, inputs.overrides()?).await
        }
    }
}
