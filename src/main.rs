// Main entrypoint for the Central control plane.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use central::app::App;
use central::config::{Config, ConfigTrait};
use central::driver::DriverKind;
use central::shutdown::GracefulShutdown;

const CONFIG_PATH: &str = "cfg/central.cfg.yaml";
const CONFIG_PATH_LOCAL: &str = "cfg/central.cfg.local.yaml";

/// Central - control plane for a fleet of executors, supervisors and gateways
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path
    #[arg(short, long, value_name = "FILE")]
    cfg: Option<PathBuf>,

    /// Work base directory (default env, artifacts, store)
    #[arg(short, long, value_name = "DIR")]
    base: Option<PathBuf>,

    /// HTTP listen port
    #[arg(short, long, value_name = "PORT")]
    listen: Option<u16>,

    /// Driver: executor, heroku or bluemix
    #[arg(short, long, value_name = "DRIVER")]
    driver: Option<DriverKind>,

    /// JSON file with driver options
    #[arg(short, long, value_name = "FILE")]
    options: Option<PathBuf>,
}

/// Loads the configuration struct from YAML file.
/// Tries local config first, then falls back to default config.
fn load_cfg(path: Option<PathBuf>) -> Result<Config> {
    if let Some(custom_path) = path {
        return Config::load(&custom_path)
            .with_context(|| format!("failed to load custom config from {:?}", custom_path));
    }

    match Config::load(PathBuf::from(CONFIG_PATH_LOCAL)) {
        Ok(cfg) => Ok(cfg),
        Err(_) => Config::load(PathBuf::from(CONFIG_PATH))
            .with_context(|| format!("failed to load config from {}", CONFIG_PATH)),
    }
}

/// Applies command line overrides on top of the file configuration.
fn apply_args(cfg: &mut Config, args: &Args) -> Result<()> {
    if let Some(base) = &args.base {
        cfg.set_base_dir(base.clone());
    }
    if let Some(port) = args.listen {
        cfg.set_port(port);
    }
    if let Some(kind) = args.driver {
        cfg.set_driver_kind(kind);
    }
    if let Some(options) = &args.options {
        cfg.apply_driver_options(options)
            .with_context(|| format!("invalid driver options {:?}", options))?;
    }
    // Re-validate the merged driver settings.
    cfg.driver_kind()?;
    cfg.supervisor_url()?;
    Ok(())
}

/// Configures structured logging based on configuration.
fn configure_logger(cfg: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_level = cfg
        .logs()
        .and_then(|logs| logs.level.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("info");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cfg.is_prod() {
        // Production: JSON format
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        // Development: Pretty console format
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    let mut cfg = load_cfg(args.cfg.clone())?;
    apply_args(&mut cfg, &args)?;

    // Configure logger (must be done after config is loaded)
    configure_logger(&cfg);
    info!(
        component = "main",
        event = "config_loaded",
        driver = %cfg.driver_kind()?,
        port = cfg.port(),
        base_dir = ?cfg.base_dir(),
        request_timeout = %humantime::format_duration(cfg.request_timeout()),
        "config loaded"
    );

    let mut graceful_shutdown = GracefulShutdown::new(shutdown_token.clone());
    graceful_shutdown.set_graceful_timeout(cfg.shutdown_timeout());

    let app = App::new(shutdown_token.clone(), cfg).await?;
    let serving = graceful_shutdown.spawn(async move { app.serve().await });

    // Listen for OS signals or cancellation and wait for graceful shutdown
    if let Err(e) = graceful_shutdown.await_shutdown().await {
        error!(
            component = "main",
            scope = "service",
            event = "graceful_shutdown_failed",
            error = %e,
            "failed to gracefully shut down service"
        );
        return Err(e);
    }

    serving.await.context("server task panicked")?
}
