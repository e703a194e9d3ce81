//! Arbiter CLI
//!
//! The `arbiter` command runs the responder/judge loop.
//!
//! ## Commands
//!
//! - `check`: Validate a criteria definition file
//! - `chat`: Run one turn from the terminal, streaming progress
//! - `serve`: Start the HTTP + WebSocket server

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use arbiter_core::{ConversationMode, CriteriaKind, CriteriaRegistry};
use arbiter_runtime::{GatewayRegistry, Orchestrator, RuntimeConfig, TurnOutcome, TurnRequest};

mod console;
mod server;

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chat responder with an LLM judge in the loop", long_about = None)]
struct Cli {
    /// Criteria definition file (YAML or JSON)
    #[arg(
        long,
        global = true,
        env = "ARBITER_CRITERIA",
        default_value = "config/criteria.yaml"
    )]
    criteria: PathBuf,

    /// Runtime configuration file (YAML)
    #[arg(long, global = true, env = "ARBITER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a criteria definition file
    Check {
        /// File to check (defaults to --criteria)
        path: Option<PathBuf>,
    },

    /// Send one message and print the judged response
    Chat {
        /// The user message
        message: String,

        /// Conversation mode: simple, feedback or input_critique
        #[arg(short, long, default_value = "feedback")]
        mode: ConversationMode,

        /// Conversation to continue
        #[arg(long)]
        conversation: Option<String>,

        /// Wait for the final response instead of streaming progress
        #[arg(long)]
        no_stream: bool,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        models: ModelArgs,
    },

    /// Serve the HTTP and WebSocket API
    Serve {
        /// Address to listen on
        #[arg(long, env = "ARBITER_BIND", default_value = "0.0.0.0:8000")]
        bind: SocketAddr,

        /// Allowed CORS origins (comma separated)
        #[arg(
            long,
            env = "ARBITER_CORS_ORIGINS",
            value_delimiter = ',',
            default_value = "http://localhost:3000,http://localhost:5173"
        )]
        cors_origins: Vec<String>,

        #[command(flatten)]
        models: ModelArgs,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Responder model id
    #[arg(long)]
    responder_model: Option<String>,

    /// Judge model id
    #[arg(long)]
    judge_model: Option<String>,

    /// Total generate/evaluate rounds per turn
    #[arg(long)]
    max_iterations: Option<u32>,
}

impl ModelArgs {
    fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(model) = &self.responder_model {
            config.responder.model = model.clone();
        }
        if let Some(model) = &self.judge_model {
            config.judge.model = model.clone();
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max.max(1);
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    match &cli.command {
        Commands::Check { path } => check(path.as_deref().unwrap_or(&cli.criteria)),
        Commands::Chat {
            message,
            mode,
            conversation,
            no_stream,
            json,
            models,
        } => {
            let orchestrator = build_orchestrator(&cli, models)?;
            let request =
                TurnRequest::new(message.as_str(), *mode).in_conversation(conversation.clone());
            chat(&orchestrator, request, *no_stream, *json).await
        }
        Commands::Serve {
            bind,
            cors_origins,
            models,
        } => {
            let orchestrator = build_orchestrator(&cli, models)?;
            server::serve(Arc::new(orchestrator), *bind, cors_origins).await
        }
    }
}

/// Logs go to stderr so `chat` output stays pipeable.
fn init_logging(format: LogFormat, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_registry(path: &Path) -> Result<CriteriaRegistry> {
    let registry = CriteriaRegistry::from_file(path)
        .with_context(|| format!("Failed to load criteria from {}", path.display()))?;
    registry
        .ensure_scorable()
        .with_context(|| format!("Criteria file {} cannot be used", path.display()))?;
    Ok(registry)
}

fn load_runtime_config(cli: &Cli, models: &ModelArgs) -> Result<RuntimeConfig> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let mut config = config
        .with_env_overrides()
        .context("Invalid ARBITER_* environment override")?;
    models.apply(&mut config);
    Ok(config)
}

fn build_orchestrator(cli: &Cli, models: &ModelArgs) -> Result<Orchestrator> {
    let registry = Arc::new(load_registry(&cli.criteria)?);
    let config = load_runtime_config(cli, models)?;
    let gateways = GatewayRegistry::with_defaults();

    let responder = gateways
        .create(&config.responder.provider, &config.responder.gateway)
        .with_context(|| {
            format!(
                "Failed to create responder gateway '{}'",
                config.responder.provider
            )
        })?;
    let judge = gateways
        .create(&config.judge.provider, &config.judge.gateway)
        .with_context(|| format!("Failed to create judge gateway '{}'", config.judge.provider))?;

    tracing::info!(
        responder_model = %config.responder.model,
        judge_model = %config.judge.model,
        max_iterations = config.max_iterations,
        profile = registry.active_profile(),
        "Orchestrator ready"
    );

    Orchestrator::builder()
        .responder(responder)
        .judge(judge)
        .registry(registry)
        .config(config)
        .build()
        .context("Failed to assemble orchestrator")
}

fn check(path: &Path) -> Result<()> {
    let registry = load_registry(path)?;

    println!("✓ {} is valid", path.display());
    for kind in [CriteriaKind::Input, CriteriaKind::Output] {
        let all = registry.criteria(kind);
        let enabled = registry.enabled(kind);
        println!("  {} criteria: {} ({} enabled)", kind, all.len(), enabled.len());
        for criterion in enabled {
            println!(
                "    - {} (weight {}, threshold {})",
                criterion.name, criterion.weight, criterion.threshold
            );
        }
    }
    println!(
        "  Active profile: {} (overall threshold {})",
        registry.active_profile(),
        registry.overall_threshold()
    );
    let lights = registry.traffic_light_thresholds();
    println!(
        "  Traffic light: green ≥ {}, orange ≥ {}",
        lights.green_threshold, lights.orange_threshold
    );
    Ok(())
}

async fn chat(
    orchestrator: &Orchestrator,
    request: TurnRequest,
    no_stream: bool,
    json: bool,
) -> Result<()> {
    let outcome = if no_stream || json {
        orchestrator
            .process_turn(
                &request.message,
                request.conversation_id.as_deref(),
                request.mode,
            )
            .await?
    } else {
        let sink = console::ConsoleSink::new();
        orchestrator
            .process_turn_streaming(request, &sink, "console")
            .await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome, no_stream);
    }
    Ok(())
}

fn print_summary(outcome: &TurnOutcome, print_response: bool) {
    if print_response {
        println!("{}", outcome.response);
    }
    let evaluation = &outcome.evaluation;
    eprintln!();
    eprintln!(
        "{} {:.2} {} after {} round(s)",
        evaluation.traffic_light.emoji(),
        evaluation.overall_score,
        evaluation.traffic_light,
        outcome.iteration
    );
    if let Some(critique) = &outcome.input_critique {
        eprintln!(
            "Input critique: {:.2} {}",
            critique.overall_score, critique.traffic_light
        );
    }
    eprintln!("Conversation: {}", outcome.conversation_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_chat() {
        let cli = Cli::try_parse_from([
            "arbiter",
            "chat",
            "What is Rust?",
            "--mode",
            "input_critique",
            "--max-iterations",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Chat {
                message,
                mode,
                models,
                ..
            } => {
                assert_eq!(message, "What is Rust?");
                assert_eq!(mode, ConversationMode::InputCritique);
                assert_eq!(models.max_iterations, Some(3));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["arbiter", "chat", "hi", "--mode", "chaos"]).is_err());
    }

    #[test]
    fn test_serve_cors_origins_split() {
        let cli = Cli::try_parse_from([
            "arbiter",
            "serve",
            "--cors-origins",
            "http://a.test,http://b.test",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { cors_origins, .. } => {
                assert_eq!(cors_origins, vec!["http://a.test", "http://b.test"]);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_model_args_override_config() {
        let mut config = RuntimeConfig::default();
        ModelArgs {
            responder_model: Some("r".to_string()),
            judge_model: None,
            max_iterations: Some(0),
        }
        .apply(&mut config);

        assert_eq!(config.responder.model, "r");
        assert_eq!(config.max_iterations, 1);
    }

    #[test]
    fn test_bundled_criteria_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/criteria.yaml");
        let registry = load_registry(&path).unwrap();
        assert_eq!(registry.active_profile(), "moderate");
        assert_eq!(registry.overall_threshold(), 60.0);
        assert!(!registry.enabled(CriteriaKind::Input).is_empty());
    }
}
