//! Operator tool for exercising the event distribution core without standing
//! up a full pod: publishes persistent or transient events directly against
//! a database URL.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use session_events_core::Publisher;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "session-events-cli")]
#[command(about = "Manual publish tool for the event distribution core")]
struct Cli {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a persistent event (stored and notified)
    Persistent {
        session_id: String,
        channel: String,
        /// Event payload as a JSON object
        payload: String,
    },
    /// Publish a transient event (notified only, not stored)
    Transient {
        channel: String,
        /// Event payload as a JSON object
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    session_events_common::tracing_setup::init_tracing()?;

    let cli = Cli::parse();
    let pool = PgPoolOptions::new().connect(&cli.database_url).await?;
    let publisher = Publisher::new(pool);

    match cli.command {
        Commands::Persistent {
            session_id,
            channel,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let id = publisher
                .publish_persistent(&session_id, &channel, payload)
                .await?;
            println!("published event id={}", id);
        }
        Commands::Transient { channel, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            publisher.publish_transient(&channel, payload).await?;
            println!("published transient event");
        }
    }

    Ok(())
}
