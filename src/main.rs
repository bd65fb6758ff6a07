// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};
use anyhow::Context;
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::application::operation_journal::OperationJournal;
use crate::application::permission::RoleDepartmentGate;
use crate::application::session_registry::SessionRegistry;
use crate::application::site_session::SessionDeps;
use crate::infrastructure::config::load_client_config;
use crate::infrastructure::http_gateway::HttpGateway;
use crate::infrastructure::ws_connector::WsConnector;
use crate::presentation::app_state::AppState;
use crate::presentation::event_stream::stream_site;
use crate::presentation::handlers::{
    get_site, health_check, post_command, post_refresh, put_foreground,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = load_client_config()?;

    // Create adapters (infrastructure layer)
    let connector = Arc::new(WsConnector::new(&config.gateway));
    let gateway = Arc::new(HttpGateway::new(&config.gateway)?);

    // Create services (application layer)
    let deps = SessionDeps {
        connector,
        gateway: gateway.clone(),
        permissions: Arc::new(RoleDepartmentGate::new(config.operator.clone())),
        journal: Arc::new(OperationJournal::new(gateway)),
        operator: config.operator.clone(),
        config: config.clone(),
    };
    let registry = SessionRegistry::new(deps);

    // Create application state
    let state = Arc::new(AppState {
        registry: registry.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/sites/:id", get(get_site))
        .route("/sites/:id/stream", get(stream_site))
        .route("/sites/:id/commands", post(post_command))
        .route("/sites/:id/refresh", post(post_refresh))
        .route("/app/foreground", put(put_foreground))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.server.listen))?;
    tracing::info!("Starting sitelink on {}", addr);

    // Closing the sessions also ends their event streams, letting the server drain
    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            registry.shutdown_all("application exit");
        })
        .await?;

    Ok(())
}
