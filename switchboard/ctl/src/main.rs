//! Switchboard Control - Router Configuration Tool
//!
//! Loads a router configuration, validates it the way a running router
//! would on reload, and prints what the router would see. It never routes
//! traffic.
//!
//! # Usage
//!
//! ```bash
//! # Validate the default config ($XDG_CONFIG_HOME/switchboard/router.toml)
//! switchboard-ctl validate
//!
//! # Validate a specific file
//! switchboard-ctl validate --config ./router.toml
//!
//! # Print providers, models, limits and credential ids
//! switchboard-ctl show --config ./router.toml
//! switchboard-ctl show --json
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-ctl validate
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use switchboard_core::{
    default_config_path, load_config_from_path, ConfigSnapshot, QuotaLimits, RouterConfig,
};

/// Switchboard Control - validate and inspect router configuration
#[derive(Parser, Debug)]
#[command(name = "switchboard-ctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Print the providers a router would load
    Show {
        /// Configuration file path
        #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_ctl={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => default_config_path()
            .context("No --config given and no user config directory could be determined"),
    }
}

/// Load, apply env overrides, validate
fn load_snapshot(path: &Path) -> Result<ConfigSnapshot> {
    let config = load_config_from_path(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    debug!(path = %path.display(), "Configuration parsed");

    ConfigSnapshot::build(config, 1, Utc::now())
        .with_context(|| format!("{} is not a valid router configuration", path.display()))
}

fn required_adapters(config: &RouterConfig) -> Vec<&str> {
    let mut keys: Vec<&str> = config
        .providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.adapter_key())
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

fn format_limit(limit: Option<u32>) -> String {
    limit.map_or_else(|| "-".to_string(), |n| n.to_string())
}

fn format_limits(limits: QuotaLimits) -> String {
    format!(
        "{}/min {}/day",
        format_limit(limits.requests_per_minute),
        format_limit(limits.requests_per_day)
    )
}

fn print_table(config: &RouterConfig) {
    let policy = &config.policy;
    println!(
        "policy: max_attempts={} failure_threshold={} backoff={}..{}ms jitter={}",
        policy.max_attempts,
        policy.health.failure_threshold,
        policy.health.base_backoff_ms,
        policy.health.max_backoff_ms,
        policy.health.jitter
    );
    println!(
        "scoring: reliability={} latency={} cost={} window={}",
        policy.scoring.reliability_weight,
        policy.scoring.latency_weight,
        policy.scoring.cost_weight,
        policy.scoring.window_size
    );

    for (priority, provider) in config.providers.iter().enumerate() {
        println!();
        println!(
            "[{priority}] {} ({}) adapter={} timeout={}ms",
            provider.id,
            if provider.enabled { "enabled" } else { "disabled" },
            provider.adapter_key(),
            provider.timeout_ms
        );
        for model in &provider.models {
            let capabilities: Vec<String> =
                model.capabilities.iter().map(ToString::to_string).collect();
            println!(
                "    model {:<24} [{}] {} cost={}",
                model.id,
                capabilities.join(","),
                format_limits(model.limits()),
                model.cost_per_call
            );
        }
        for credential in &provider.credentials {
            let source = match (&credential.secret, &credential.secret_env) {
                (Some(_), _) => "inline".to_string(),
                (None, Some(var)) => format!("env:{var}"),
                (None, None) => "none".to_string(),
            };
            println!("    credential {:<19} secret={source}", credential.id);
            for model in &provider.models {
                if credential.limits.contains_key(&model.id) {
                    println!(
                        "        {} override {}",
                        model.id,
                        format_limits(credential.limits_for(model))
                    );
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::Validate { config } => {
            let path = resolve_path(config)?;
            let snapshot = load_snapshot(&path)?;
            let config = snapshot.config();
            info!(path = %path.display(), "Configuration is valid");

            println!(
                "ok: {} providers ({} enabled)",
                config.providers.len(),
                config.enabled_count()
            );
            println!("adapters required: {}", required_adapters(config).join(", "));
        }
        Command::Show { config, json } => {
            let path = resolve_path(config)?;
            let snapshot = load_snapshot(&path)?;

            if json {
                let text = serde_json::to_string_pretty(snapshot.config())
                    .context("Failed to serialize configuration")?;
                println!("{text}");
            } else {
                print_table(snapshot.config());
            }
        }
    }

    Ok(())
}
