//! unimock - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use unimock::server::{self, AppState};
use unimock::{Database, MockEngine, MockServerConfig};

const DEFAULT_CONFIG: &str = include_str!("../config/default-config.yaml");

#[derive(Parser, Debug)]
#[command(
    name = "unimock",
    about = "Programmable HTTP mock server - triggers, ordered response scenarios, and placeholder templates",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "unimock.yaml")]
    config: PathBuf,

    /// Address to listen on (overrides server.listen)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// SQLite database file (overrides database.path)
    #[arg(short, long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(short = 'L', long)]
    log_level: Option<Level>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Print default config if requested
    if args.print_config {
        println!("{}", DEFAULT_CONFIG);
        return Ok(());
    }

    // Load configuration
    let config_found = args.config.exists();
    let mut config = if config_found {
        MockServerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        MockServerConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid (listen {}, database {})",
            config.server.listen,
            config.database.path.display()
        );
        return Ok(());
    }

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(path) = args.database {
        config.database.path = path;
    }

    // Initialize logging
    let level = match args.log_level {
        Some(level) => level,
        None => config.logging.level()?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if config_found {
        info!(path = ?args.config, "Loaded configuration");
    } else {
        info!("Using default configuration");
    }

    // Open storage and fill the caches
    let db = Database::open(&config.database.path).with_context(|| {
        format!("Failed to open database {}", config.database.path.display())
    })?;
    let engine = Arc::new(MockEngine::new(Arc::new(db), config.settings.clone()));
    engine.load().await?;

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;

    server::serve(listener, AppState::new(engine), shutdown_signal()).await?;
    info!("Mock server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
