// Ratewarden - Main Entry Point
//
// Wires the admission-control service together:
// - Configuration file and environment overrides
// - Reputation tracking, optionally replicated to peer nodes
// - Load-based auto-throttling
// - Rule-based rate limiting behind an HTTP API

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ratewarden::config::Config;
use ratewarden::context::RequestContext;
use ratewarden::metrics;
use ratewarden::notify::NotifierRegistry;
use ratewarden::rate_limit::{LimitCheckRequest, NewRule, RateLimitManager, Scope};
use ratewarden::replication::DistributedReputationManager;
use ratewarden::reputation::ReputationManager;
use ratewarden::server::{start_server, AppState};
use ratewarden::throttle::AutoThrottler;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Ratewarden: adaptive admission control
#[derive(Parser, Debug)]
#[command(name = "ratewarden")]
#[command(author = "Ratewarden Contributors")]
#[command(version)]
#[command(about = "Rate rules, quotas, reputation and load throttling", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (default: XDG config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission-control service
    Serve,
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Evaluate requests against the configured rules and print each decision
    Check {
        /// System the request belongs to
        #[arg(long, default_value = "global")]
        system: String,

        /// Identity kind: ip, session, user or api_key
        #[arg(long, default_value = "ip")]
        scope: String,

        /// Identity value, e.g. an IP address
        #[arg(long)]
        value: String,

        /// Resource type for quota rules
        #[arg(long)]
        resource: Option<String>,

        /// Number of consecutive requests to evaluate
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("Ratewarden v{} starting...", env!("CARGO_PKG_VERSION"));
            serve(config).await?;
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
        }
        Commands::Check {
            system,
            scope,
            value,
            resource,
            count,
        } => {
            let scope: Scope = scope.parse()?;
            let mut req = LimitCheckRequest::new(&system, scope, &value);
            if let Some(resource) = resource {
                req = req.with_resource_type(&resource);
            }
            check(config, req, count).await?;
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn seed_rules(manager: &RateLimitManager, rules: &[NewRule]) -> Result<()> {
    for rule in rules {
        let created = manager
            .create_rule(rule.clone())
            .await
            .with_context(|| format!("Failed to create rule {:?}", rule))?;
        info!(
            "Loaded rule {} ({}: {} {} = {})",
            created.id,
            created.system_id,
            created.scope,
            created.limit_type,
            created.limit_value
        );
    }
    Ok(())
}

/// Build every component, serve until Ctrl-C, then shut down in reverse order
async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;
    let notifier = Arc::new(NotifierRegistry::from_config(&config.notify));

    let replication = if config.replication.enabled {
        Some(DistributedReputationManager::builder(config.replication.clone()).build()?)
    } else {
        None
    };

    let mut reputation = ReputationManager::builder(config.reputation.clone()).notifier(notifier.clone());
    if let Some(replication) = &replication {
        reputation = reputation.journal(replication.journal()).sink(replication.clone());
    }
    let reputation = reputation.build().await?;

    let throttler = AutoThrottler::builder(config.throttle.clone())
        .notifier(notifier)
        .build()?;

    let manager = RateLimitManager::builder(config.rate_limit.clone())
        .reputation(reputation.clone())
        .throttler(throttler.clone())
        .build()?;
    seed_rules(&manager, &config.rules).await?;

    if config.server.enabled {
        let mut state = AppState::new(manager.clone());
        if let Some(replication) = &replication {
            state = state.with_replication(replication.clone());
        }
        start_server(&config.server.bind, config.server.port, state, shutdown_signal()).await?;
    } else {
        info!("HTTP server disabled, waiting for Ctrl-C");
        shutdown_signal().await;
    }

    info!("Shutting down");
    manager.close();
    throttler.close();
    if let Err(e) = reputation.close().await {
        error!("Failed to close reputation manager: {}", e);
    }
    if let Some(replication) = replication {
        replication.close().await;
    }
    Ok(())
}

async fn check(config: Config, req: LimitCheckRequest, count: u32) -> Result<()> {
    let manager = RateLimitManager::builder(config.rate_limit.clone()).build()?;
    seed_rules(&manager, &config.rules).await?;

    let ctx = RequestContext::background();
    for _ in 0..count {
        let decision = manager.admit(&ctx, &req).await;
        println!("{}", serde_json::to_string(&decision)?);
    }
    manager.close();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
