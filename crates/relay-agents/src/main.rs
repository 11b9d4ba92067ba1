//! `relay`: run requests through the agent relay from the command line.
//!
//! ```bash
//! # One request, plain text answer
//! relay ask "write a rust function that reverses a string"
//!
//! # Full response as JSON, persisted for a user
//! RELAY_HISTORY_PATH=./exchanges.jsonl relay ask --user alice --json "explain lifetimes"
//!
//! # Backend health
//! relay status
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coordination::{Orchestrator, OrchestratorConfig, ValidationMode};
use relay_agents::backends::build_router;
use relay_agents::{default_registry, JsonlExchangeStore, RelayConfig};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    /// Maximum tasks running at once (overrides RELAY_MAX_CONCURRENCY)
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Per-task timeout in seconds (overrides RELAY_TASK_TIMEOUT_SECS)
    #[arg(long, global = true)]
    task_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one request
    Ask {
        request: String,

        /// Save the exchange under this user id
        #[arg(long)]
        user: Option<String>,

        /// Backend attempts per generation call
        #[arg(long)]
        max_attempts: Option<usize>,

        /// Concatenate task results instead of merging them with a backend
        #[arg(long, default_value_t = false)]
        no_consolidate: bool,

        /// Reject malformed plans instead of repairing them
        #[arg(long, default_value_t = false)]
        strict_plan: bool,

        /// Print the whole response as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show configured backends and their health
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = RelayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(n) = args.max_concurrency {
        config.scheduler.max_concurrency = n;
    }
    if let Some(secs) = args.task_timeout_secs {
        config.scheduler.task_timeout = Duration::from_secs(secs);
    }
    config.validate().context("validating configuration")?;

    match args.command {
        Command::Ask {
            request,
            user,
            max_attempts,
            no_consolidate,
            strict_plan,
            json,
        } => {
            let orchestrator_config = OrchestratorConfig {
                scheduler: config.scheduler,
                validation: if strict_plan {
                    ValidationMode::Strict
                } else {
                    ValidationMode::Repair
                },
                consolidate: !no_consolidate,
                max_attempts,
                ..OrchestratorConfig::default()
            };
            ask(&config, orchestrator_config, &request, user.as_deref(), json).await
        }
        Command::Status { json } => status(&config, json),
    }
}

async fn ask(
    config: &RelayConfig,
    orchestrator_config: OrchestratorConfig,
    request: &str,
    user: Option<&str>,
    json: bool,
) -> Result<()> {
    if request.trim().is_empty() {
        bail!("request is empty");
    }

    let router = Arc::new(build_router(config));
    let registry = Arc::new(default_registry(config));
    let mut orchestrator = Orchestrator::new(router, registry, orchestrator_config)
        .context("building orchestrator")?;
    if let Some(path) = &config.history_path {
        info!(path = %path.display(), "saving exchanges");
        orchestrator = orchestrator.with_store(Arc::new(JsonlExchangeStore::new(path)));
    }

    let response = match user {
        Some(user) => orchestrator.process_for_user(user, request).await,
        None => orchestrator.process(request).await,
    }
    .context("processing request")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("serializing response")?
        );
    } else {
        println!("{}", response.response_text);
    }
    Ok(())
}

fn status(config: &RelayConfig, json: bool) -> Result<()> {
    let router = build_router(config);
    let status = router.status();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serializing status")?
        );
        return Ok(());
    }

    println!(
        "{} of {} backends usable",
        status.usable_backends, status.total_backends
    );
    for backend in &status.backends {
        let state = if backend.health.auth_disabled {
            "auth disabled"
        } else if backend.health.rate_limited {
            "rate limited"
        } else if backend.usable {
            "ok"
        } else {
            "cooling down"
        };
        println!("  {:<16} {:<40} {}", backend.name, backend.model, state);
    }
    for skipped in config.skipped_backends() {
        println!(
            "  {:<16} {:<40} no key ({})",
            skipped.name,
            skipped.model,
            skipped.api_key_env.as_deref().unwrap_or("-")
        );
    }
    if status.total_backends == 0 {
        println!("All requests will be answered by the offline responder.");
    }
    Ok(())
}
