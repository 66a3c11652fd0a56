use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::LimitRule;
use turnstile::{GateKey, Gatekeeper};

/// Administrative client for Turnstile gate state.
#[derive(Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the configured backend
    Health,
    /// Consume one permit of an operation's rate limit
    Check(Target),
    /// Show an operation's rate limit without consuming a permit
    Status(Target),
    /// Clear an operation's rate limit state for one identity
    Reset(Target),
    /// Claim an operation's duplicate-submission marker
    Acquire(Target),
    /// Delete an idempotency record
    Forget {
        operation: String,
        /// The idempotency key the record was created with
        key: String,
    },
}

#[derive(clap::Args)]
struct Target {
    operation: String,
    /// Identity values for the operation's dimension, in order
    values: Vec<String>,
}

impl Target {
    fn values(&self) -> Vec<&str> {
        self.values.iter().map(String::as_str).collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(backend = %config.storage.backend, "Configuration loaded");

    let gatekeeper = Gatekeeper::from_config(config)
        .await
        .context("initializing stores")?;

    match cli.command {
        Command::Health => {
            let report = gatekeeper.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(exit_code(report.reachable))
        }
        Command::Check(target) => {
            let Some(result) = gatekeeper
                .check_operation(&target.operation, &target.values())
                .await?
            else {
                bail!("operation {} has no rate limit configured", target.operation);
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.allowed))
        }
        Command::Status(target) => {
            let (key, rule) = rate_limit_target(&gatekeeper, &target)?;
            let result = gatekeeper
                .rate_limiter(&target.operation)?
                .status(&key, &rule)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.allowed))
        }
        Command::Reset(target) => {
            let (key, _) = rate_limit_target(&gatekeeper, &target)?;
            let existed = gatekeeper.reset_rate_limit(&key).await?;
            println!("{} {}", key, if existed { "reset" } else { "had no state" });
            Ok(ExitCode::SUCCESS)
        }
        Command::Acquire(target) => {
            let outcome = gatekeeper
                .acquire_submission(&target.operation, &target.values())
                .await?;
            let acquired = outcome.is_acquired();
            match outcome.ensure_acquired() {
                Ok(()) => println!("acquired"),
                Err(e) => println!("{}", e),
            }
            Ok(exit_code(acquired))
        }
        Command::Forget { operation, key } => {
            let gate_key = GateKey::idempotency(&operation, &key);
            let removed = gatekeeper.idempotency(&operation)?.forget(&gate_key).await?;
            println!("{} {}", gate_key, if removed { "removed" } else { "not found" });
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn rate_limit_target(
    gatekeeper: &Gatekeeper,
    target: &Target,
) -> anyhow::Result<(GateKey, LimitRule)> {
    let Some(policy) = gatekeeper.rules().get(&target.operation) else {
        bail!("operation {} is not configured", target.operation);
    };
    let Some(rate_limit) = &policy.rate_limit else {
        bail!("operation {} has no rate limit configured", target.operation);
    };
    let key = GateKey::rate_limit(&target.operation, rate_limit.dimension, &target.values());
    Ok((key, rate_limit.rule.clone()))
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
