//! Event distribution pod binary entry point.
//!
//! Loads configuration, runs embedded migrations, wires the Notify Listener
//! and Connection Manager, and serves the WebSocket + health endpoints.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use session_events_common::Config;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "session-events-server")]
#[command(version = "0.1.0")]
#[command(about = "Real-time event distribution pod")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.dev.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pod's WebSocket/health server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate configuration without starting the server
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    session_events_common::tracing_setup::init_tracing_with_level(log_level)?;

    let mut config = Config::load(&cli.config).map_err(|e| {
        error!("failed to load configuration: {}", e);
        e
    })?;

    match cli.command {
        Some(Commands::ValidateConfig) => {
            println!("configuration is valid");
            println!("  database: {}", config.database.url);
            println!("  server: {}:{}", config.server.host, config.server.port);
            Ok(())
        }
        Some(Commands::Serve { host, port }) => {
            if let Some(h) = host {
                config.server.host = h;
            }
            if let Some(p) = port {
                config.server.port = p;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;

    sqlx::migrate!("../session-events-core/migrations")
        .run(&pool)
        .await?;

    let core = Arc::new(session_events_core::EventCore::bootstrap(
        pool.clone(),
        config.listener,
        config.client,
        config.catchup,
    ));

    let state = session_events_server::AppState { core, pool };
    let app = session_events_server::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("session-events-server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
