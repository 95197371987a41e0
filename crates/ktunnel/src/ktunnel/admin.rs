use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::ktunnel::telemetry;
use crate::ktunnel::tunnel::{registry::ChannelSnapshot, registry::Connections, session};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub role: &'static str,
    pub registry: Arc<Connections>,
}

fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/channels", get(channels))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { session::shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn version() -> String {
    format!("ktunnel v{}\n", env!("CARGO_PKG_VERSION"))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Serialize)]
struct ChannelsResponse {
    role: &'static str,
    max_tunnels: usize,
    open: usize,
    channels: Vec<ChannelSnapshot>,
}

async fn channels(State(st): State<Arc<AdminState>>) -> Json<ChannelsResponse> {
    let channels = st.registry.snapshot();
    Json(ChannelsResponse {
        role: st.role,
        max_tunnels: st.registry.max_size(),
        open: channels.len(),
        channels,
    })
}
