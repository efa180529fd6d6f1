use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use svckit::{AppConfigManager, AppContext, ConfigNode, RunOptions, ServiceFactory, ShutdownOptions};
use svckit_bootstrap::{AppConfig, CliArgs};

use std::path::{Path, PathBuf};
use std::sync::Arc;

mod demo;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// svckit host - runs a service composition until shutdown
#[derive(Parser)]
#[command(name = "svckit-host")]
#[command(about = "svckit host - runs a service composition until shutdown")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Composition YAML file (overrides config)
    #[arg(long)]
    composition: Option<PathBuf>,

    /// Root updater drive interval in milliseconds (overrides config)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the composition until Ctrl+C / SIGTERM
    Run,
    /// Resolve the composition once, report what would wait or fail, and tear it down
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        composition: cli
            .composition
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
        tick_ms: cli.tick_ms,
    };

    // 1) defaults -> 2) YAML (if provided) -> 3) env (SVCKIT__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if args.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging_config = config.logging.clone().unwrap_or_default();
    svckit_bootstrap::logging::init_logging_unified(
        &logging_config,
        Path::new(&config.runtime.home_dir),
    );

    tracing::info!(home_dir = %config.runtime.home_dir, "svckit host starting");

    let composition = load_composition(&config)?;
    let factory = Arc::new(ServiceFactory::discover()?);
    tracing::debug!(types = ?factory.type_names(), "service types discovered");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_composition(config, composition, factory).await,
        Commands::Check => check_composition(composition, factory).await,
    }
}

fn load_composition(config: &AppConfig) -> Result<ConfigNode> {
    let tree = config.composition_tree()?;
    serde_json::from_value(tree).context("Composition is not a valid configuration tree")
}

async fn run_composition(
    config: AppConfig,
    composition: ConfigNode,
    factory: Arc<ServiceFactory>,
) -> Result<()> {
    let runtime = &config.runtime;
    let tick = runtime.tick();
    if tick.is_some() && runtime.root_updater.is_none() {
        tracing::warn!("tick_ms is set but no root_updater is configured; nothing will be driven");
    }

    svckit::run(RunOptions {
        composition,
        factory,
        tick,
        root_updater: runtime.root_updater.clone(),
        stop_timeout: runtime.shutdown_timeout(),
        shutdown: ShutdownOptions::Signals,
    })
    .await
}

async fn check_composition(composition: ConfigNode, factory: Arc<ServiceFactory>) -> Result<()> {
    tracing::info!("Checking composition…");
    let manager = AppConfigManager::new(AppContext::new(factory));
    let report = manager.create(&composition).await?;

    println!("built:    {}", report.built.join(", "));
    for (uid, missing) in &report.deferred {
        println!("deferred: {uid} (waiting for {})", missing.join(", "));
    }
    for (uid, err) in &report.failures {
        println!("failed:   {uid}: {err}");
    }

    manager.destroy().await?;

    if !report.failures.is_empty() {
        bail!("{} service(s) failed to build", report.failures.len());
    }
    println!("Composition is valid");
    Ok(())
}
