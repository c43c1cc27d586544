//! Admin HTTP surface (§12, supplemental/ambient): a narrower axum router
//! than the teacher's `admin.rs` -- `/health`, `/pool`, `/reload`, and
//! `/rules`, deliberately without the teacher's `/metrics` and `/conns`
//! (this crate carries no equivalent metrics/session-telemetry surface;
//! see DESIGN.md). Disabled by default; only bound when `--admin-listen`
//! is passed.
//!
//! Grounded directly in the teacher's `admin::serve`/`AdminState` shape:
//! one `Router` built from a `Json`-returning handler per route, CORS and
//! tracing layers, and a reload endpoint that bumps a `watch::Sender`
//! rather than applying the reload inline -- the same task that answers
//! SIGHUP consumes it, so both triggers go through one code path.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pacman::dialer::pool::Pool;

/// One compiled rule, for `/rules` -- carried alongside the routing trie
/// rather than reconstructed from it, since the trie's `RouteEntry`
/// values have already erased which pool labels built them.
#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    pub hosts: Vec<String>,
    pub proxies: Vec<String>,
}

pub struct AdminState {
    pub pool: Arc<ArcSwap<Pool>>,
    pub rules: Arc<ArcSwap<Vec<RuleView>>>,
    pub reload_tx: watch::Sender<u64>,
}

pub async fn serve(addr: SocketAddr, state: Arc<AdminState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/pool", get(pool))
        .route("/rules", get(rules))
        .route("/reload", post(reload))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn pool(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.pool.load().status()))
}

async fn rules(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json((**st.rules.load()).clone()))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let seq = *st.reload_tx.borrow() + 1;
    let _ = st.reload_tx.send(seq);
    (StatusCode::OK, Json(ReloadResponse { seq }))
}
