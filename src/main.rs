use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use consultation_confidence::{
    cli::{execute_history, execute_score, Cli, CliResult, Commands},
    config::{Config, LogFormat},
    realtime::RealtimeServer,
    scoring::FactorWeights,
    session::SessionManager,
    storage::SqliteStorage,
    validation::{build_sources, SourceWeights},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    // Weight sets are fixed; refuse to start if either is inconsistent.
    FactorWeights::STANDARD.validate()?;
    SourceWeights::STANDARD.validate()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Score { input } => {
            let json = match input {
                Some(path) => std::fs::read_to_string(path)?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            finish(execute_score(&json))
        }
        Commands::History { session_id } => {
            let storage = SqliteStorage::new(&config.database).await?;
            finish(execute_history(&storage, &session_id).await)
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Confidence consultation engine starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    // Initialize validation sources
    let sources = match build_sources(&config.sources, &config.request) {
        Ok(sources) => sources,
        Err(e) => {
            error!(error = %e, "Failed to initialize validation sources");
            return Err(e.into());
        }
    };
    if sources.is_empty() {
        warn!("No validation sources configured, scores use factor estimates only");
    }

    let manager = Arc::new(SessionManager::new(
        Arc::new(storage),
        sources,
        &config.gate,
        &config.session,
    ));

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    let server = RealtimeServer::new(manager, config.realtime.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    if let Err(e) = server.serve(listener, shutdown).await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

fn finish(result: CliResult) -> anyhow::Result<()> {
    if result.exit_code == 0 {
        println!("{}", result.message);
        Ok(())
    } else {
        eprintln!("{}", result.message);
        std::process::exit(result.exit_code);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
