use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use crate::engine::{Dispatcher, DispatcherConfig, Generator};
use crate::store::{ArtifactStore, LibsqlStore};

/// Configuration for the content service.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3150,
            db_path: PathBuf::from(".lessonforge/content.db"),
            dev_mode: false,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the store, start the dispatcher and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig, generator: Arc<dyn Generator>) -> Result<()> {
    let store: Arc<dyn ArtifactStore> = Arc::new(
        LibsqlStore::new_local(&config.db_path)
            .await
            .context("Failed to initialize content database")?,
    );
    let dispatcher = Dispatcher::start(config.dispatcher.clone(), Arc::clone(&store), generator);

    let state = Arc::new(AppState {
        store,
        dispatcher: dispatcher.clone(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, workers = dispatcher.workers(), "Content service listening");
    println!("lessonforge running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Let in-flight generations persist before the process exits.
    if let Err(e) = dispatcher.shutdown().await {
        warn!(error = %e, "Dispatcher did not shut down cleanly");
    }
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
