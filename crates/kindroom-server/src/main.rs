mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use kindroom_db::Database;
use kindroom_gateway::pipeline::Pipeline;
use kindroom_gateway::registry::RoomRegistry;
use kindroom_gateway::repository::SqliteRepository;
use kindroom_gateway::routes::{self, GatewayState};
use kindroom_moderation::HttpModerator;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kindroom=debug,kindroom_gateway=debug,kindroom_moderation=debug,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    info!(path = %config.db_path.display(), "Database ready");

    if config.moderation.escalation_url.is_none() {
        warn!("KINDROOM_ESCALATION_URL not set, quiz/report escalation disabled");
    }
    let moderator = HttpModerator::new(config.moderation.clone())?;

    // Shared state
    let registry = RoomRegistry::new();
    let pipeline = Pipeline::new(
        Arc::new(SqliteRepository::new(db)),
        Arc::new(moderator),
        registry.clone(),
        config.pipeline.clone(),
    );
    let state = GatewayState {
        pipeline,
        settings: config.connection,
    };

    let app = routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Kindroom server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, then closes every room queue so open
/// sockets finish and the server can drain.
async fn shutdown_signal(registry: RoomRegistry) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    registry.close_all();
}
