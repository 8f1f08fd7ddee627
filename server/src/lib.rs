//! HTTP surface of the Phoenix server: a single WebSocket route that
//! bridges browser clients to the engine. Static assets, markdown
//! rendering and the inspection UI pages are served elsewhere; this
//! process only speaks the event protocol.

pub mod trace;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use phoenix_core::config::Config;
use phoenix_core::haven::HavenClient;
use phoenix_core::haven::ModelHost;
use phoenix_core::session::SessionRegistry;
use phoenix_core::store::VectorStore;

use crate::trace::TraceLog;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<VectorStore>,
    pub haven: Arc<dyn ModelHost>,
    pub registry: Arc<SessionRegistry>,
    pub trace: Arc<TraceLog>,
}

impl AppState {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(VectorStore::new(&config.store_dir)?);
        let haven = Arc::new(HavenClient::new(
            &config.haven_address,
            &config.haven_auth_key,
            config.model_call_timeout,
        )?);
        Ok(AppState {
            config: Arc::new(config),
            store,
            haven,
            registry: Arc::new(SessionRegistry::new()),
            trace: Arc::new(TraceLog::default()),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let port = config.server_port;
    let state = AppState::from_config(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "phoenix server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await?;
    Ok(())
}
