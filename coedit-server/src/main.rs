use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use coedit_server::{ServerConfig, ServerState, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:3030")]
    host: SocketAddr,
    /// Storage root for persisted rooms and documents.
    #[clap(short, long)]
    storage: Option<PathBuf>,
    /// JSON file mapping bearer tokens to users.
    #[clap(short, long)]
    users: Option<PathBuf>,
    /// Maximum operation lag before clients must resync.
    #[clap(long)]
    sync_window: Option<u64>,
    /// Seconds an empty room keeps its in-memory state.
    #[clap(long)]
    room_idle_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = ServerConfig {
        storage: args.storage,
        users_file: args.users,
        ..ServerConfig::default()
    };
    if let Some(window) = args.sync_window {
        config.hub.limits.sync_window = window;
    }
    if let Some(secs) = args.room_idle_secs {
        config.hub.idle_after = Duration::from_secs(secs);
    }

    let state = Arc::new(ServerState::new(config).await.expect("Init server state"));

    info!("Starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(args.host)
        .await
        .expect("Unable to bind to host");
    axum::serve(listener, server(state).layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
        .await
        .unwrap();

    info!("Server has shut down");
}
