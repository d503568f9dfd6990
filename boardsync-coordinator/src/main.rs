//! `BoardSync` coordinator -- authoritative server for the shared board.
//!
//! # Usage
//!
//! ```bash
//! # Run in-memory on the default address 0.0.0.0:4800
//! cargo run --bin boardsync-coordinator
//!
//! # Run against Postgres on a custom address
//! DATABASE_URL=postgres://board@localhost/board \
//!     cargo run --bin boardsync-coordinator -- --bind 127.0.0.1:4800
//! ```

use std::sync::Arc;

use clap::Parser;

use boardsync_coordinator::config::{CliArgs, Config};
use boardsync_coordinator::server::{self, BoardState};
use boardsync_coordinator::storage::{MemoryTaskStore, PgTaskStore, TaskStore};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting boardsync coordinator");

    let store: Arc<dyn TaskStore> = match &config.database_url {
        Some(url) => match PgTaskStore::connect(url).await {
            Ok(store) => {
                tracing::info!("durable storage connected");
                Arc::new(store)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to connect durable storage");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("no DATABASE_URL configured, tasks will not survive restart");
            Arc::new(MemoryTaskStore::new())
        }
    };

    let state = Arc::new(BoardState::with_flush_delay(store, config.flush_delay));

    match server::start_server_with_state(&config.bind_addr, state, &config.cors_origin).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "coordinator listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "coordinator task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start coordinator");
            std::process::exit(1);
        }
    }
}
