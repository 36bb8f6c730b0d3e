use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use atelier_core::coverage::Coverage;
use atelier_db::store::{MemoryRequestStore, PgRequestStore, RequestStore};
use atelier_pipeline::coverage_index::{
    run_refresh, CoverageIndex, CoverageSource, HttpCoverageSource, StaticCoverageSource,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_api::build_app;
use atelier_api::config::ServerConfig;
use atelier_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "atelier_api=debug,atelier_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Storage ---
    let (store, pool): (Arc<dyn RequestStore>, _) = match &config.database_url {
        Some(database_url) => {
            let pool = atelier_db::create_pool(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            atelier_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            tracing::info!("Database health check passed");

            atelier_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            (Arc::new(PgRequestStore::new(pool.clone())), Some(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, requests are kept in memory only");
            (Arc::new(MemoryRequestStore::new()), None)
        }
    };

    // --- Coverage ---
    let coverage = Arc::new(CoverageIndex::new(Coverage::default()));
    let source: Arc<dyn CoverageSource> = match &config.coverage_url {
        Some(url) => Arc::new(HttpCoverageSource::new(url.clone())),
        None => {
            tracing::warn!("COVERAGE_URL not set, no worker coverage will be reported");
            Arc::new(StaticCoverageSource::new(Coverage::default()))
        }
    };
    let refresh_cancel = CancellationToken::new();
    let refresh_handle = tokio::spawn(run_refresh(
        Arc::clone(&coverage),
        source,
        Duration::from_secs(config.coverage_refresh_secs),
        refresh_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState::assemble(config.clone(), store, coverage, pool);
    let dispatch = Arc::clone(&state.dispatch);

    // Requests left Pending by a previous run have no queue entry yet.
    state
        .generation
        .recover_pending()
        .await
        .expect("Failed to requeue pending requests");
    let app = build_app(state);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    refresh_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), refresh_handle).await;
    tracing::info!("Coverage refresh stopped");

    // Wakes any worker still parked in a claim.
    dispatch.close().await;
    // Their requests stay Pending and are requeued on the next start.
    let abandoned = dispatch.len().await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "Dispatch queue closed with undispatched jobs");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
